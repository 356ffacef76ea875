use crate::kernelvec::timervec;
use crate::memlayout::{clint_mtimecmp, CLINT_MTIME};
use crate::param::NCPU;
use core::arch::asm;
use riscv::register::{mepc, mhartid, mie, mscratch, mstatus, mtvec, sie};

extern "C" {
    // the kernel main, exported by the kmain! macro in main.rs.
    fn main() -> !;
}

// entry.rs needs one stack per CPU.
#[repr(C, align(16))]
pub struct Stack0(pub [u8; 4096 * NCPU]);

#[no_mangle]
pub static mut STACK0: Stack0 = Stack0([0; 4096 * NCPU]);

// a scratch area per CPU for machine-mode timer interrupts.
static mut TIMER_SCRATCH: [[usize; 5]; NCPU] = [[0; 5]; NCPU];

// entry.rs jumps here in machine mode on STACK0.
#[no_mangle]
pub unsafe extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    mstatus::set_mpp(mstatus::MPP::Supervisor);

    // set M Exception Program Counter to main, for mret.
    mepc::write(main as usize);

    // disable paging for now.
    asm!("csrw satp, zero");

    // delegate all interrupts and exceptions to supervisor mode.
    asm!("csrw medeleg, {}", in(reg) 0xffffusize);
    asm!("csrw mideleg, {}", in(reg) 0xffffusize);
    sie::set_sext();
    sie::set_stimer();
    sie::set_ssoft();

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    asm!("csrw pmpaddr0, {}", in(reg) 0x3fffffffffffffusize);
    asm!("csrw pmpcfg0, {}", in(reg) 0xfusize);

    // ask for clock interrupts.
    timerinit();

    // keep each CPU's hartid in its tp register, for Cpus::cpu_id().
    let id = mhartid::read();
    asm!("mv tp, {0}", in(reg) id);

    // switch to supervisor mode and jump to main().
    asm!("mret", options(noreturn))
}

// arrange to receive timer interrupts.
// they arrive in machine mode at timervec in kernelvec.rs,
// which turns them into software interrupts for
// devintr() in trap.rs.
unsafe fn timerinit() {
    // each CPU has a separate source of timer interrupts.
    let id = mhartid::read();

    // ask the CLINT for a timer interrupt.
    let interval = 1_000_000; // cycles; about 1/10th second in qemu.
    let mtimecmp = clint_mtimecmp(id) as *mut u64;
    let mtime = CLINT_MTIME as *const u64;
    mtimecmp.write_volatile(mtime.read_volatile() + interval);

    // prepare information in scratch[] for timervec.
    // scratch[0..2] : space for timervec to save registers.
    // scratch[3] : address of the CLINT MTIMECMP register.
    // scratch[4] : desired interval (in cycles) between timer interrupts.
    let scratch = &mut TIMER_SCRATCH[id];
    scratch[3] = mtimecmp as usize;
    scratch[4] = interval as usize;
    mscratch::write(scratch.as_mut_ptr() as usize);

    // set the machine-mode trap handler.
    mtvec::write(timervec as usize, mtvec::TrapMode::Direct);

    // enable machine-mode interrupts.
    mstatus::set_mie();

    // enable machine-mode timer interrupts.
    mie::set_mtimer();
}
