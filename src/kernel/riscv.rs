use core::arch::asm;
use riscv::register::sstatus;

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(sz: usize) -> usize {
    sz & !(PGSIZE - 1)
}

pub mod pteflags {
    pub const PTE_V: usize = 1 << 0; // valid
    pub const PTE_R: usize = 1 << 1;
    pub const PTE_W: usize = 1 << 2;
    pub const PTE_X: usize = 1 << 3;
    pub const PTE_U: usize = 1 << 4; // user can access
}

pub mod registers {
    pub mod satp {
        use core::arch::asm;

        pub enum Mode {
            Bare = 0,
            Sv39 = 8,
            Sv48 = 9,
        }

        pub fn make(mode: Mode, asid: usize, pa: usize) -> usize {
            ((mode as usize) << 60) | (asid << 44) | (pa >> 12)
        }

        pub unsafe fn write(satp: usize) {
            asm!("csrw satp, {}", in(reg) satp);
        }

        pub fn read() -> usize {
            let satp: usize;
            unsafe { asm!("csrr {}, satp", out(reg) satp) }
            satp
        }
    }
}

// flush the TLB.
pub unsafe fn sfence_vma() {
    // the zero, zero means flush all TLB entries.
    asm!("sfence.vma zero, zero");
}

pub fn w_sstatus(sstatus: usize) {
    unsafe {
        asm!("csrw sstatus, {}", in(reg) sstatus);
    }
}

pub fn r_sstatus() -> usize {
    let sstatus: usize;
    unsafe { asm!("csrr {}, sstatus", out(reg) sstatus) }
    sstatus
}

pub fn w_sip(sip: usize) {
    unsafe {
        asm!("csrw sip, {}", in(reg) sip);
    }
}

// enable device interrupts
pub fn intr_on() {
    unsafe {
        sstatus::set_sie();
    }
}

// disable device interrupts
pub fn intr_off() {
    unsafe {
        sstatus::clear_sie();
    }
}

// are device interrupts enabled?
pub fn intr_get() -> bool {
    sstatus::read().sie()
}
