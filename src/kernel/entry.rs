// qemu -kernel loads the kernel at 0x80000000 and causes each
// hart (i.e. CPU) to jump there, in machine mode.
// kernel.ld places this code at 0x80000000 via the .entry section.

use core::arch::global_asm;

global_asm!(
    ".section .entry",
    ".globl _entry",
    "_entry:",
    // set up a stack for Rust.
    // STACK0 is declared in start.rs,
    // with a 4096-byte stack per CPU.
    // sp = STACK0 + ((hartid + 1) * 4096)
    "    la sp, STACK0",
    "    li a0, 4096",
    "    csrr a1, mhartid",
    "    addi a1, a1, 1",
    "    mul a0, a0, a1",
    "    add sp, sp, a0",
    // jump to start() in start.rs
    "    call start",
    "spin:",
    "    j spin",
    ".section .text",
);
