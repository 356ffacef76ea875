#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(target_os = "none")]
pub mod entry;
#[cfg(target_os = "none")]
pub mod kernelvec;
#[cfg(target_os = "none")]
pub mod memlayout;
pub mod param;
#[cfg(target_os = "none")]
pub mod proc;
#[cfg(target_os = "none")]
pub mod riscv;
#[cfg(target_os = "none")]
pub mod sleeplock;
#[cfg(target_os = "none")]
pub mod spinlock;
#[cfg(target_os = "none")]
pub mod start;
#[cfg(target_os = "none")]
pub mod swtch;
#[cfg(target_os = "none")]
pub mod sync;
#[cfg(target_os = "none")]
pub mod uart;
#[cfg(target_os = "none")]
#[macro_use]
pub mod printf;
#[cfg(target_os = "none")]
pub mod bio;
#[cfg(target_os = "none")]
pub mod condvar;
#[cfg(target_os = "none")]
pub mod console;
pub mod defs;
pub mod elf;
#[cfg(target_os = "none")]
pub mod exec;
pub mod fcntl;
pub mod file;
pub mod fs;
#[cfg(target_os = "none")]
pub mod kalloc;
#[cfg(target_os = "none")]
pub mod log;
#[cfg(target_os = "none")]
pub mod pipe;
#[cfg(target_os = "none")]
pub mod plic;
pub mod stat;
#[cfg(target_os = "none")]
pub mod syscall;
pub mod sysctbl;
#[cfg(target_os = "none")]
pub mod sysfile;
#[cfg(target_os = "none")]
pub mod sysproc;
#[cfg(target_os = "none")]
pub mod trampoline;
#[cfg(target_os = "none")]
pub mod trap;
#[cfg(target_os = "none")]
pub mod virtio_disk;
#[cfg(target_os = "none")]
pub mod vm;

#[macro_export]
macro_rules! kmain {
    ($path:path) => {
        #[export_name = "main"]
        pub extern "C" fn __main() -> ! {
            // type check the given path
            let f: extern "C" fn() -> ! = $path;

            f()
        }
    };
}
