use crate::{
    condvar::Condvar,
    kernelvec::kernelvec,
    memlayout::{TRAMPOLINE, TRAPFRAME, UART0_IRQ, VIRTIO0_IRQ},
    plic, println,
    proc::{Cpus, ProcState, Process, CPUS},
    riscv::{intr_get, intr_off, intr_on, r_sstatus, registers::satp, w_sip, w_sstatus, PGSIZE},
    spinlock::Mutex,
    syscall::syscall,
    trampoline::{trampoline, userret, uservec},
    uart::UART,
    virtio_disk::DISK,
};
use riscv::register::{scause, sepc, sstatus, stval, stvec};
use scause::{Exception, Interrupt, Trap};

#[derive(PartialEq)]
pub enum Intr {
    Timer,
    Device,
}

pub static TICKS: Mutex<usize> = Mutex::new(0, "time");
// broadcast on every clock tick; sys_sleep waits here.
pub static TICKS_UPDATED: Condvar = Condvar::new();

// set up to take exceptions and traps while in the kernel.
pub fn inithart() {
    unsafe {
        stvec::write(kernelvec as usize, stvec::TrapMode::Direct);
    }
}

//
// handle an interrupt, exception, or system call from user space.
// called from trampoline.rs
//
#[no_mangle]
pub extern "C" fn usertrap() -> ! {
    assert!(
        sstatus::read().spp() == sstatus::SPP::User,
        "usertrap: not from user mode"
    );
    assert!(!intr_get(), "usertrap: interrupts enabled");

    // send interrupts and exceptions to kerneltrap(),
    // since we're now in the kernel.
    unsafe {
        stvec::write(kernelvec as usize, stvec::TrapMode::Direct);
    }

    let p = CPUS.my_proc().unwrap();
    let tf = p.trapframe_mut();

    // save user program counter.
    tf.epc = sepc::read();

    let mut which_dev = None;
    match scause::read().cause() {
        Trap::Exception(Exception::UserEnvCall) => {
            // system call

            if p.killed() {
                p.exit(-1);
            }

            // sepc points to the ecall instruction,
            // but we want to return to the next instruction.
            tf.epc += 4;

            // an interrupt will change sepc, scause, and sstatus,
            // so enable only now that we're done with those registers.
            intr_on();

            syscall();
        }
        Trap::Interrupt(intr)
            if {
                which_dev = devintr(intr);
                which_dev.is_some()
            } => {}
        _ => {
            let inner = p.inner.lock();
            println!(
                "usertrap(): unexpected scause {:?} pid={}",
                scause::read().cause(),
                inner.pid.0
            );
            println!("            sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            drop(inner);
            p.inner.lock().killed = true;
        }
    }

    if p.killed() {
        p.exit(-1)
    }

    // give up the CPU if this is a timer interrupt.
    if which_dev == Some(Intr::Timer) {
        p.yielding()
    }

    unsafe { usertrap_ret() }
}

//
// return to user space
//
pub unsafe fn usertrap_ret() -> ! {
    let p = CPUS.my_proc().unwrap();

    // we're about to switch the destination of traps from
    // kerneltrap() to usertrap(), so turn off interrupts until
    // we're back in user space, where usertrap() is correct.
    intr_off();

    // send syscalls, interrupts, and exceptions to uservec in
    // trampoline.rs
    stvec::write(
        TRAMPOLINE + (uservec as usize - trampoline as usize),
        stvec::TrapMode::Direct,
    );

    let data = p.data_mut();

    // set up trapframe values that uservec will need when
    // the process next traps into the kernel.
    let tf = data.trapframe.unwrap().as_mut();
    tf.kernel_satp = satp::read(); // kernel page table
    tf.kernel_sp = data.kstack + PGSIZE; // process's kernel stack
    tf.kernel_trap = usertrap as usize;
    tf.kernel_hartid = Cpus::cpu_id(); // hartid for Cpus::cpu_id()

    // set up the registers that trampoline.rs's sret will use
    // to get to user space.

    // set S Previous Privilege mode to User.
    sstatus::set_spp(sstatus::SPP::User); // clear SPP to 0 for user mode
    sstatus::set_spie(); // enable interrupts in user mode

    // set S Exception Program Counter to the saved user pc.
    sepc::write(tf.epc);

    // tell trampoline.rs the user page table to switch to.
    let satp = data.uvm.as_ref().unwrap().as_satp();

    // jump to userret in trampoline.rs at the top of memory, which
    // switches to the user page table, restores user registers,
    // and switches to user mode with sret.
    let trampoline_userret = TRAMPOLINE + (userret as usize - trampoline as usize);
    let trampoline_userret: extern "C" fn(usize, usize) -> ! =
        core::mem::transmute(trampoline_userret);
    trampoline_userret(TRAPFRAME, satp)
}

// interrupts and exceptions from kernel code go here via kernelvec,
// on whatever the current kernel stack is.
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let mut which_dev = None;
    let sepc_saved = sepc::read();
    let sstatus_saved = r_sstatus();
    let scause = scause::read();

    assert!(
        sstatus::read().spp() == sstatus::SPP::Supervisor,
        "kerneltrap: not from supervisor mode"
    );
    assert!(!intr_get(), "kerneltrap: interrupts enabled");

    match scause.cause() {
        Trap::Interrupt(intr)
            if {
                which_dev = devintr(intr);
                which_dev.is_some()
            } => {}
        _ => {
            println!("scause {:?}", scause.cause());
            println!("sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            panic!("kerneltrap");
        }
    }

    // give up the CPU if this is a timer interrupt.
    if which_dev == Some(Intr::Timer) {
        if let Some(p) = CPUS.my_proc() {
            if p.inner.lock().state == ProcState::RUNNING {
                p.yielding()
            }
        }
    }

    // the yielding() may have caused some traps to occur,
    // so restore trap registers for use by kernelvec's sret.
    sepc::write(sepc_saved);
    w_sstatus(sstatus_saved);
}

fn clockintr() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    drop(ticks);
    TICKS_UPDATED.notify_all();
}

// check if it's an external interrupt or software interrupt,
// and handle it.
fn devintr(intr: Interrupt) -> Option<Intr> {
    match intr {
        Interrupt::SupervisorExternal => {
            // this is a supervisor external interrupt, via PLIC.

            // irq indicates which device interrupted.
            let irq = plic::claim();

            if let Some(irq) = irq {
                match irq {
                    UART0_IRQ => UART.intr(),
                    VIRTIO0_IRQ => DISK.intr(),
                    _ => println!("unexpected interrupt irq={}", irq),
                }

                // the PLIC allows each device to raise at most one
                // interrupt at a time; tell the PLIC the device is
                // now allowed to interrupt again.
                plic::complete(irq);
            }

            Some(Intr::Device)
        }
        Interrupt::SupervisorSoft => {
            // software interrupt from a machine-mode timer interrupt,
            // forwarded by timervec in kernelvec.rs.

            if unsafe { Cpus::cpu_id() } == 0 {
                clockintr();
            }

            // acknowledge the software interrupt by clearing
            // the SSIP bit in sip.
            w_sip(riscv::register::sip::read().bits() & !2);

            Some(Intr::Timer)
        }
        _ => None,
    }
}
