#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod kernel_main {
    use core::sync::atomic::{AtomicBool, Ordering};
    use kernel::{
        bio, console, kalloc, kmain, plic, println,
        proc::{self, scheduler, Cpus},
        trap, virtio_disk, vm,
    };

    static STARTED: AtomicBool = AtomicBool::new(false);

    kmain!(main);

    extern "C" fn main() -> ! {
        let cpuid = unsafe { Cpus::cpu_id() };
        if cpuid == 0 {
            console::init();
            println!();
            println!("rvos kernel is booting");
            println!();
            kalloc::init(); // physical page allocator
            vm::kinit(); // create kernel page table
            vm::kinithart(); // turn on paging
            proc::init(); // process table
            trap::inithart(); // install kernel trap vector
            plic::init(); // set up interrupt controller
            plic::inithart(); // ask PLIC for device interrupts
            bio::init(); // buffer cache
            virtio_disk::init(); // emulated hard disk
            proc::user_init(); // first user process
            STARTED.store(true, Ordering::SeqCst);
        } else {
            while !STARTED.load(Ordering::SeqCst) {}
            println!("hart {} starting", unsafe { Cpus::cpu_id() });
            vm::kinithart(); // turn on paging
            trap::inithart(); // install kernel trap vector
            plic::inithart(); // ask PLIC for device interrupts
        }

        scheduler()
    }
}

// the kernel only runs on the bare-metal target; this keeps
// host builds (for the unit tests in the library) linking.
#[cfg(not(target_os = "none"))]
fn main() {}
