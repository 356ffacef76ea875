use crate::elf::{
    ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_FLAG_EXEC, ELF_PROG_FLAG_WRITE, ELF_PROG_LOAD,
};
use crate::fs::{IData, Path};
use crate::log::LOG;
use crate::memlayout::MAXVA;
use crate::param::MAXARG;
use crate::proc::{Proc, Process, CPUS};
use crate::riscv::{pgroundup, pteflags::*, PGSIZE};
use crate::sleeplock::SleepLockGuard;
use crate::vm::{Addr, UVAddr, Uvm, VirtAddr};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::mem::size_of;

// Replace the current process's image with the program at path,
// passing the given arguments. Returns argc, which goes in a0;
// a1 gets the address of the argv array. Only returns on error.
pub fn exec(path: &Path, argv: &[Option<String>]) -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();

    LOG.begin_op();
    let ip = match path.namei() {
        Some((_, ip)) => ip,
        None => {
            LOG.end_op();
            return Err(());
        }
    };

    let loaded = {
        let mut guard = ip.lock();
        load_image(p, &mut guard)
    };
    // release the inode before closing the transaction.
    drop(ip);
    LOG.end_op();

    let (mut uvm, sz, entry) = loaded.ok_or(())?;

    match build_stack(&mut uvm, sz, argv) {
        Some((sz, sp, argc)) => {
            // commit to the user image.
            let data = p.data_mut();
            data.name.clear();
            data.name.push_str(path.file_name());

            let old_sz = data.sz;
            let mut old_uvm = data.uvm.replace(uvm).unwrap();
            data.sz = sz;

            let tf = p.trapframe_mut();
            tf.a1 = sp; // argv pointer array
            tf.epc = entry; // initial program counter = main
            tf.sp = sp; // initial stack pointer

            old_uvm.proc_uvmfree(old_sz);

            Ok(argc) // this ends up in a0, the first argument to main(argc, argv)
        }
        None => {
            uvm.proc_uvmfree(sz);
            Err(())
        }
    }
}

// Read the ELF header and map every loadable segment into a fresh
// address space. Returns the new space, its size, and the entry
// point; a failure frees whatever was built.
fn load_image(
    p: &Arc<Proc>,
    ip: &mut SleepLockGuard<'_, IData>,
) -> Option<(Box<Uvm>, usize, usize)> {
    let mut elf = ElfHdr::default();
    match ip.read(
        VirtAddr::Kernel(&mut elf as *mut _ as usize),
        0,
        size_of::<ElfHdr>(),
    ) {
        Ok(n) if n == size_of::<ElfHdr>() => (),
        _ => return None,
    }
    if elf.magic != ELF_MAGIC {
        return None;
    }

    let mut uvm = p.proc_uvmcreate()?;
    let mut sz = 0usize;

    for i in 0..elf.phnum as usize {
        let off = elf.phoff as usize + i * size_of::<ProgHdr>();
        let mut ph = ProgHdr::default();
        let header_read = matches!(
            ip.read(
                VirtAddr::Kernel(&mut ph as *mut _ as usize),
                off as u32,
                size_of::<ProgHdr>(),
            ),
            Ok(n) if n == size_of::<ProgHdr>()
        );
        if !header_read {
            uvm.proc_uvmfree(sz);
            return None;
        }
        if ph.type_ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || (ph.vaddr + ph.memsz) as usize >= MAXVA
            || ph.vaddr as usize % PGSIZE != 0
        {
            uvm.proc_uvmfree(sz);
            return None;
        }
        sz = match uvm.alloc(sz, (ph.vaddr + ph.memsz) as usize, flags2perm(ph.flags)) {
            Some(sz) => sz,
            None => {
                uvm.proc_uvmfree(sz);
                return None;
            }
        };
        if load_seg(
            &mut uvm,
            (ph.vaddr as usize).into(),
            ip,
            ph.off as usize,
            ph.filesz as usize,
        )
        .is_err()
        {
            uvm.proc_uvmfree(sz);
            return None;
        }
    }

    Some((uvm, sz, elf.entry as usize))
}

// Load a program segment into the address space at virtual
// address va, which must be page-aligned, with the pages from
// va to va+sz already mapped.
fn load_seg(
    uvm: &mut Uvm,
    va: UVAddr,
    ip: &mut SleepLockGuard<'_, IData>,
    offset: usize,
    sz: usize,
) -> Result<(), ()> {
    assert!(va.is_aligned(), "load_seg: va must be page aligned");

    let mut i = 0;
    while i < sz {
        let pa = uvm
            .walkaddr(va + i)
            .expect("load_seg: address should exist");
        let n = core::cmp::min(sz - i, PGSIZE);
        match ip.read(VirtAddr::Kernel(pa.into_usize()), (offset + i) as u32, n) {
            Ok(r) if r == n => (),
            _ => return Err(()),
        }
        i += PGSIZE;
    }
    Ok(())
}

// Lay out the user stack: a guard page, a stack page, the
// argument strings, and the argv pointer array. Returns the new
// process size, the initial stack pointer, and argc.
fn build_stack(uvm: &mut Uvm, sz: usize, argv: &[Option<String>]) -> Option<(usize, usize, usize)> {
    // allocate some pages at the next page boundary.
    // make the first inaccessible as a stack guard.
    // use the rest as the user stack.
    let sz = pgroundup(sz);
    let sz = uvm.alloc(sz, sz + 2 * PGSIZE, PTE_W)?;
    uvm.clear(UVAddr::from(sz - 2 * PGSIZE));
    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    // push argument strings, remember their addresses.
    let mut ustack = [0usize; MAXARG + 1];
    let mut argc = 0;
    for arg in argv.iter() {
        let arg = match arg {
            Some(arg) => arg,
            None => break,
        };
        if argc >= MAXARG {
            return None;
        }
        sp -= arg.len() + 1; // the string plus a terminating NUL
        sp -= sp % 16; // riscv sp must be 16-byte aligned
        if sp < stackbase {
            return None;
        }
        unsafe {
            uvm.copyout(UVAddr::from(sp), arg.as_bytes()).ok()?;
            uvm.copyout(UVAddr::from(sp + arg.len()), &0u8).ok()?;
        }
        ustack[argc] = sp;
        argc += 1;
    }
    ustack[argc] = 0;

    // push the array of argv[] pointers.
    sp -= (argc + 1) * size_of::<usize>();
    sp -= sp % 16;
    if sp < stackbase {
        return None;
    }
    unsafe {
        uvm.copyout(UVAddr::from(sp), &ustack[..argc + 1]).ok()?;
    }

    Some((sz, sp, argc))
}

fn flags2perm(flags: u32) -> usize {
    let mut perm = 0;
    if flags & ELF_PROG_FLAG_EXEC != 0 {
        perm |= PTE_X;
    }
    if flags & ELF_PROG_FLAG_WRITE != 0 {
        perm |= PTE_W;
    }
    perm
}
