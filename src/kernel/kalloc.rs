// Physical memory allocator.
//
// Hands out whole 4096-byte pages from the RAM between the end of
// the kernel image and PHYSTOP, kept on a LIFO free list under one
// spinlock. Every kernel heap object (process table entries, page
// tables, trapframes, pipe buffers, strings) is backed by this list:
// the allocator doubles as the crate's GlobalAlloc, serving any
// layout up to one page from a full page.
//
// Freed pages are filled with 0x01 and fresh pages with 0x05. These
// junk patterns are not security measures; they make use-after-free
// and uninitialized reads fail loudly, and are part of the contract.

use crate::memlayout::PHYSTOP;
use crate::riscv::{pgroundup, PGSIZE};
use crate::spinlock::Mutex;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

extern "C" {
    // first address after kernel code and data. defined by kernel.ld.
    fn end();
}

pub static KMEM: Mutex<Kmem> = Mutex::new(Kmem::new(), "kmem");

// A free page holds the link to the next free page in its
// own first bytes.
struct Run {
    next: Option<NonNull<Run>>,
}

pub struct Kmem {
    freelist: Option<NonNull<Run>>,
}

impl Kmem {
    const fn new() -> Self {
        Self { freelist: None }
    }
}

pub fn init() {
    freerange(end as usize, PHYSTOP);
}

fn freerange(pa_start: usize, pa_end: usize) {
    let mut p = pgroundup(pa_start);
    while p + PGSIZE <= pa_end {
        kfree(p);
        p += PGSIZE;
    }
}

// Free the page of physical memory pointed at by pa,
// which normally should have been returned by a
// call to kalloc(). (The exception is when
// initializing the allocator; see init above.)
pub fn kfree(pa: usize) {
    if pa % PGSIZE != 0 || pa < end as usize || pa >= PHYSTOP {
        panic!("kfree");
    }

    // Fill with junk to catch dangling refs.
    unsafe { ptr::write_bytes(pa as *mut u8, 1, PGSIZE) };

    let r = pa as *mut Run;
    let mut kmem = KMEM.lock();
    unsafe { (*r).next = kmem.freelist };
    kmem.freelist = NonNull::new(r);
}

// Allocate one 4096-byte page of physical memory.
// Returns None if the memory cannot be allocated.
pub fn kalloc() -> Option<usize> {
    let mut kmem = KMEM.lock();
    let r = kmem.freelist?;
    kmem.freelist = unsafe { r.as_ref().next };
    drop(kmem);

    let pa = r.as_ptr() as usize;
    unsafe { ptr::write_bytes(pa as *mut u8, 5, PGSIZE) }; // fill with junk
    Some(pa)
}

pub struct KernelHeap;

#[global_allocator]
static HEAP: KernelHeap = KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() > PGSIZE || layout.align() > PGSIZE {
            return ptr::null_mut();
        }
        match kalloc() {
            Some(pa) => pa as *mut u8,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        kfree(ptr as usize);
    }
}
