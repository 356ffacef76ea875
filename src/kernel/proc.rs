use crate::file::File;
use crate::fs::{self, Inode, Path};
use crate::log::LOG;
use crate::memlayout::{kstack, TRAMPOLINE, TRAPFRAME};
use crate::param::{NCPU, NOFILE, NPROC, ROOTDEV};
use crate::riscv::{intr_get, intr_on, pteflags::*, PGSIZE};
use crate::spinlock::{Mutex, MutexGuard};
use crate::swtch::swtch;
use crate::sync::{LazyLock, OnceLock};
use crate::trampoline::trampoline;
use crate::trap::usertrap_ret;
use crate::vm::{Addr, Page, PageAllocator, UVAddr, Uvm, VirtAddr};
use crate::println;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use array_macro::array;
use core::arch::asm;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use zerocopy::{AsBytes, FromBytes};

pub static CPUS: Cpus = Cpus::new();
pub static PROCS: LazyLock<Procs> = LazyLock::new(Procs::new);
pub static INITPROC: OnceLock<Arc<Proc>> = OnceLock::new();

// Saved registers for kernel context switches.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

// per-process data for the trap handling code in trampoline.rs.
// sits in a page by itself just under the trampoline page in the
// user page table. not specially mapped in the kernel page table.
// the sscratch register points here.
// uservec in trampoline.rs saves user registers in the trapframe,
// then initializes registers from the trapframe's
// kernel_sp, kernel_hartid, kernel_satp, and jumps to usertrap.
// usertrap_ret() and userret in trampoline.rs set up
// the trapframe's kernel_*, restore user registers from the
// trapframe, switch to the user page table, and enter user space.
// the trapframe includes callee-saved user registers like s0-s11
// because the return-to-user path via usertrap_ret() doesn't return
// through the entire kernel call stack.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: usize, // kernel page table
    /*   8 */ pub kernel_sp: usize, // top of process's kernel stack
    /*  16 */ pub kernel_trap: usize, // usertrap()
    /*  24 */ pub epc: usize, // saved user program counter
    /*  32 */ pub kernel_hartid: usize, // saved kernel tp
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

pub struct Cpus([UnsafeCell<Cpu>; NCPU]);
unsafe impl Sync for Cpus {}

// Per-CPU state.
pub struct Cpu {
    pub proc: Option<Arc<Proc>>, // The process running on this cpu, or None.
    pub context: Context,        // swtch() here to enter scheduler().
    pub noff: UnsafeCell<isize>, // Depth of interrupt disabling
    pub intena: bool,            // Were interrupts enabled before the first push?
}

// A matched interrupt push; dropping it pops. If all IntrLocks on a
// cpu are dropped, interrupts recover to their pre-push state.
// Since there may be more than one IntrLock alive at once, noff is
// behind an UnsafeCell and the lock carries a shared reference.
pub struct IntrLock<'a> {
    cpu: &'a Cpu,
}

#[derive(Debug)]
pub struct Procs {
    pub pool: [Arc<Proc>; NPROC],
    // helps obey the memory model when using p.parent.
    // must be held when using p.parent, instead of p.inner's lock.
    pub wait_lock: Mutex<()>,
}
unsafe impl Sync for Procs {}

#[derive(Debug)]
pub struct Proc {
    // lock must be held when using these:
    pub inner: Mutex<ProcInner>,
    // wait_lock must be held when using this:
    pub parent: UnsafeCell<Option<Arc<Proc>>>,
    // these are private to the process, so the lock need not be held.
    pub data: UnsafeCell<ProcData>,
}
unsafe impl Sync for Proc {}

#[derive(Clone, Copy, Debug)]
pub struct ProcInner {
    pub state: ProcState,
    pub chan: usize, // If non-zero, sleeping on chan
    pub killed: bool,
    pub xstate: i32, // Exit status to be returned to parent's wait
    pub pid: PId,
}

#[derive(Debug)]
pub struct ProcData {
    pub kstack: usize,                         // Virtual address of kernel stack
    pub sz: usize,                             // Size of process memory (bytes)
    pub uvm: Option<Box<Uvm>>,                 // User address space
    pub trapframe: Option<NonNull<Trapframe>>, // data page for trampoline.rs
    pub context: Context,                      // swtch() here to run process
    pub name: String,                          // Process name (debugging)
    pub ofile: [Option<File>; NOFILE],         // Open files
    pub cwd: Option<Inode>,                    // Current directory
}
unsafe impl Sync for ProcData {}
unsafe impl Send for ProcData {}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ProcState {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PId(usize);

impl PId {
    fn alloc() -> Self {
        static NEXTPID: AtomicUsize = AtomicUsize::new(1);
        PId(NEXTPID.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait Process {
    fn free_proc(&self, guard: MutexGuard<'_, ProcInner>);
    fn proc_uvmcreate(&self) -> Option<Box<Uvm>>;
    fn sleep<'a, T>(&self, chan: usize, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;
    fn grow_proc(&self, n: isize) -> Result<(), ()>;
    fn fork(&self) -> Result<usize, ()>;
    fn exit(&self, status: i32) -> !;
    fn wait(&self, addr: UVAddr) -> Option<usize>;
    fn yielding(&self);
    fn killed(&self) -> bool;
}

pub trait CopyInOut {
    // Copy to either a user address or a kernel address.
    fn either_copyout<T: AsBytes + ?Sized>(&self, dst: VirtAddr, src: &T) -> Result<(), ()>;
    // Copy from either a user address or a kernel address.
    fn either_copyin<T: AsBytes + FromBytes + ?Sized>(
        &self,
        dst: &mut T,
        src: VirtAddr,
    ) -> Result<(), ()>;
}

// a user program that calls exec("/init"), assembled from
// user/initcode.S.
static INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

impl Cpus {
    const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    // Must be called with interrupts disabled,
    // to prevent race with process being moved
    // to a different CPU.
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        let id;
        asm!("mv {0}, tp", out(reg) id);
        id
    }

    // Return a mutable reference to this Cpus's Cpu struct.
    //
    // # Safety
    //
    // Interrupts must be disabled.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn my_cpu(&self) -> &mut Cpu {
        let id = Self::cpu_id();
        &mut *self.0[id].get()
    }

    // Disable interrupts on mycpu().
    // When every IntrLock is dropped, interrupts may recover
    // to the previous state.
    pub fn intr_lock(&self) -> IntrLock<'_> {
        let old = intr_get();
        crate::riscv::intr_off();
        unsafe { self.my_cpu().lock(old) }
    }

    // Return the current struct proc Some(&Arc<Proc>), or None if none.
    pub fn my_proc(&self) -> Option<&Arc<Proc>> {
        let _intr_lock = self.intr_lock();
        unsafe {
            let c = self.my_cpu();
            c.proc.as_ref().map(|p| &*(p as *const Arc<Proc>))
        }
    }

    // It is only safe to call this in Mutex's unlock paths.
    //
    // # Safety
    //
    // Must be paired with a preceding intr_lock whose guard
    // was forgotten.
    pub unsafe fn intr_unlock(&self) {
        self.my_cpu().unlock();
    }
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            noff: UnsafeCell::new(0),
            intena: false,
        }
    }

    // interrupts must be disabled.
    unsafe fn lock(&mut self, old: bool) -> IntrLock<'_> {
        if *self.noff.get() == 0 {
            self.intena = old;
        }
        *self.noff.get() += 1;
        IntrLock { cpu: self }
    }

    // interrupts must be disabled.
    unsafe fn unlock(&self) {
        assert!(!intr_get(), "unlock - interruptible");
        let noff = self.noff.get();
        assert!(*noff >= 1, "unlock");
        *noff -= 1;
        if *noff == 0 && self.intena {
            intr_on()
        }
    }

    // Switch to the scheduler. Must hold only the process's own
    // lock and have changed proc->state. Saves and restores
    // intena because intena is a property of this kernel thread,
    // not this CPU. It should be proc->intena and proc->noff, but
    // that would break in the few places where a lock is held but
    // there's no process.
    unsafe fn sched<'a>(
        &mut self,
        guard: MutexGuard<'a, ProcInner>,
        ctx: &mut Context,
    ) -> MutexGuard<'a, ProcInner> {
        assert!(guard.holding(), "sched proc lock");
        assert!(*self.noff.get() == 1, "sched locks");
        assert!(guard.state != ProcState::RUNNING, "sched running");
        assert!(!intr_get(), "sched interruptible");

        let intena = self.intena;
        swtch(ctx, &self.context);
        self.intena = intena;

        guard
    }
}

impl<'a> Drop for IntrLock<'a> {
    fn drop(&mut self) {
        unsafe { self.cpu.unlock() }
    }
}

impl Procs {
    fn new() -> Self {
        Self {
            pool: core::iter::repeat_with(|| Arc::new(Proc::new()))
                .take(NPROC)
                .collect::<Vec<_>>()
                .try_into()
                .unwrap(),
            wait_lock: Mutex::new((), "wait lock"),
        }
    }

    // Look in the process table for an UNUSED slot.
    // If found, initialize state required to run in the kernel,
    // and return with the process's own lock held.
    // If there are no free slots, or a memory allocation fails,
    // return None.
    pub fn alloc_proc(&self) -> Option<(&Arc<Proc>, MutexGuard<'_, ProcInner>)> {
        for p in self.pool.iter() {
            let mut lock = p.inner.lock();
            if lock.state != ProcState::UNUSED {
                continue;
            }
            lock.pid = PId::alloc();
            lock.state = ProcState::USED;

            let data = unsafe { &mut *p.data.get() };

            // Allocate a trapframe page.
            match Page::try_new_zeroed().and_then(|tf| NonNull::new(tf as *mut Trapframe)) {
                Some(tf) => {
                    data.trapframe.replace(tf);
                }
                None => {
                    p.free_proc(lock);
                    return None;
                }
            }

            // An empty user page table.
            match p.proc_uvmcreate() {
                Some(uvm) => {
                    data.uvm.replace(uvm);
                }
                None => {
                    p.free_proc(lock);
                    return None;
                }
            }

            // Set up new context to start executing at fork_ret,
            // which returns to user space.
            data.context.clear();
            data.context.ra = fork_ret as usize;
            data.context.sp = data.kstack + PGSIZE;
            return Some((p, lock));
        }
        None
    }

    // Pass p's abandoned children to init.
    // Caller must hold wait_lock.
    unsafe fn reparent(&self, p: &Arc<Proc>) {
        for pp in self.pool.iter() {
            if let Some(parent) = (*pp.parent.get()).as_mut() {
                if Arc::ptr_eq(parent, p) {
                    let initproc = INITPROC.get().unwrap();
                    (*pp.parent.get()).replace(Arc::clone(initproc));
                    self.wakeup(Arc::as_ptr(initproc) as usize);
                }
            }
        }
    }

    // Wake up all processes sleeping on chan.
    // Must be called without any process lock held.
    pub fn wakeup(&self, chan: usize) {
        let me = CPUS.my_proc();
        for p in self.pool.iter() {
            if me.map_or(false, |my| Arc::ptr_eq(p, my)) {
                continue;
            }
            let mut guard = p.inner.lock();
            if guard.state == ProcState::SLEEPING && guard.chan == chan {
                guard.state = ProcState::RUNNABLE;
            }
        }
    }

    // Kill the process with the given pid.
    // The victim won't exit until it tries to return
    // to user space (see usertrap() in trap.rs).
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        for p in self.pool.iter() {
            let mut guard = p.inner.lock();
            if guard.pid.0 == pid {
                guard.killed = true;
                if guard.state == ProcState::SLEEPING {
                    // Wake process from sleep().
                    guard.state = ProcState::RUNNABLE;
                }
                return Ok(());
            }
        }
        Err(())
    }
}

// initialize the proc table at boot time.
pub fn init() {
    for (i, proc) in PROCS.pool.iter().enumerate() {
        unsafe {
            (*proc.data.get()).kstack = kstack(i);
        }
    }
}

impl Proc {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ProcInner::new(), "proc"),
            parent: UnsafeCell::new(None),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn pid(&self) -> usize {
        self.inner.lock().pid.0
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn trapframe(&self) -> &Trapframe {
        unsafe { self.data().trapframe.unwrap().as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn trapframe_mut(&self) -> &mut Trapframe {
        unsafe { self.data_mut().trapframe.unwrap().as_mut() }
    }
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::UNUSED,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: PId(0),
        }
    }
}

impl ProcData {
    fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            uvm: None,
            trapframe: None,
            context: Context::new(),
            name: String::new(),
            ofile: array![_ => None; NOFILE],
            cwd: None,
        }
    }
}

impl Process for Arc<Proc> {
    // free a proc structure and the data hanging from it,
    // including user pages.
    // the process's own lock must be held.
    fn free_proc(&self, mut guard: MutexGuard<'_, ProcInner>) {
        let data = unsafe { &mut *self.data.get() };
        if let Some(tf) = data.trapframe.take() {
            Page::free(tf.as_ptr() as usize);
        }
        if let Some(mut uvm) = data.uvm.take() {
            uvm.proc_uvmfree(data.sz);
        }
        data.sz = 0;
        data.name.clear();
        unsafe {
            (*self.parent.get()).take();
        }
        guard.pid = PId(0);
        guard.chan = 0;
        guard.killed = false;
        guard.xstate = 0;
        guard.state = ProcState::UNUSED;
    }

    // Create a user page table for a given process, with no user
    // memory, but with trampoline and trapframe pages.
    fn proc_uvmcreate(&self) -> Option<Box<Uvm>> {
        // An empty page table.
        let mut uvm = Uvm::create()?;

        // map the trampoline code (for system call return)
        // at the highest user virtual address.
        // only the supervisor uses it, on the way
        // to/from user space, so not PTE_U.
        if uvm
            .mappages(
                TRAMPOLINE.into(),
                (trampoline as usize).into(),
                PGSIZE,
                PTE_R | PTE_X,
            )
            .is_err()
        {
            uvm.free(0);
            return None;
        }

        // map the trapframe page just below the trampoline page.
        if uvm
            .mappages(
                TRAPFRAME.into(),
                (unsafe { (*self.data.get()).trapframe.unwrap().as_ptr() as usize }).into(),
                PGSIZE,
                PTE_R | PTE_W,
            )
            .is_err()
        {
            uvm.unmap(TRAMPOLINE.into(), 1, false);
            uvm.free(0);
            return None;
        }

        Some(uvm)
    }

    // Atomically release the given lock and sleep on chan.
    // Reacquires the lock when awakened.
    fn sleep<'a, T>(&self, chan: usize, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        // Must acquire the process lock in order to change
        // p->state and then call sched. Once we hold it, we are
        // guaranteed not to miss any wakeup (wakeup locks the
        // process lock), so it's okay to release the caller's lock.
        let mutex;
        {
            let mut lock = self.inner.lock();
            mutex = Mutex::unlock(guard);

            // Go to sleep.
            lock.chan = chan;
            lock.state = ProcState::SLEEPING;

            unsafe {
                lock = CPUS.my_cpu().sched(lock, &mut (*self.data.get()).context);
            }

            // Tidy up.
            lock.chan = 0;
        }
        // Reacquire original lock.
        mutex.lock()
    }

    // Grow or shrink user memory by n bytes.
    fn grow_proc(&self, n: isize) -> Result<(), ()> {
        let data = unsafe { &mut *self.data.get() };
        let mut sz = data.sz;
        let uvm = data.uvm.as_mut().unwrap();
        if n > 0 {
            sz = uvm.alloc(sz, sz + n as usize, PTE_W).ok_or(())?;
        } else if n < 0 {
            sz = uvm.dealloc(sz, (sz as isize + n) as usize);
        }
        data.sz = sz;
        Ok(())
    }

    // Create a new process, copying the parent.
    // Sets up the child kernel stack to return as if from fork().
    fn fork(&self) -> Result<usize, ()> {
        let data = unsafe { &mut *self.data.get() };
        let (np, np_guard) = PROCS.alloc_proc().ok_or(())?;
        let ndata = unsafe { &mut *np.data.get() };

        // Copy user memory from parent to child.
        let uvm = data.uvm.as_mut().unwrap();
        let nuvm = ndata.uvm.as_mut().unwrap();
        if uvm.copy(nuvm, data.sz).is_err() {
            np.free_proc(np_guard);
            return Err(());
        }
        ndata.sz = data.sz;

        // Copy saved user registers.
        let tf = unsafe { data.trapframe.unwrap().as_mut() };
        let ntf = unsafe { ndata.trapframe.unwrap().as_mut() };
        *ntf = *tf;

        // Cause fork to return 0 in the child.
        ntf.a0 = 0;

        // increment reference counts on open file descriptors.
        ndata.ofile.clone_from_slice(&data.ofile);
        ndata.cwd = data.cwd.as_ref().map(|c| c.dup());

        ndata.name.push_str(&data.name);

        let pid = np_guard.pid;
        Mutex::unlock(np_guard);

        {
            let _wait_lock = PROCS.wait_lock.lock();
            unsafe { (*np.parent.get()).replace(Arc::clone(self)) };
        }

        np.inner.lock().state = ProcState::RUNNABLE;

        Ok(pid.0)
    }

    // Exit the current process. Does not return.
    // An exited process remains in the zombie state
    // until its parent calls wait().
    fn exit(&self, status: i32) -> ! {
        assert!(
            !Arc::ptr_eq(self, INITPROC.get().unwrap()),
            "init exiting"
        );

        // Close all open files.
        let data = unsafe { &mut *self.data.get() };
        for fd in data.ofile.iter_mut() {
            drop(fd.take());
        }

        // Releasing an inode reference may free the inode on disk,
        // so it must happen inside a transaction.
        LOG.begin_op();
        drop(data.cwd.take());
        LOG.end_op();

        let proc_guard;
        {
            let _wait_guard = PROCS.wait_lock.lock();

            // Give any children to init.
            unsafe { PROCS.reparent(self) };

            // Parent might be sleeping in wait().
            let parent = unsafe { (*self.parent.get()).as_ref().unwrap() };
            PROCS.wakeup(Arc::as_ptr(parent) as usize);

            let mut guard = self.inner.lock();
            guard.xstate = status;
            guard.state = ProcState::ZOMBIE;
            proc_guard = guard;

            // wait_guard is dropped here, after the state change is
            // published under our own lock, so the parent cannot
            // observe ZOMBIE and free us while we still run.
        }

        // Jump into the scheduler, never to return.
        unsafe {
            CPUS.my_cpu().sched(proc_guard, &mut data.context);
        }
        panic!("zombie exit");
    }

    // Wait for a child process to exit and return its pid, or
    // None if this process has no children.
    fn wait(&self, addr: UVAddr) -> Option<usize> {
        loop {
            let wait_guard = PROCS.wait_lock.lock();
            let mut havekids = false;
            // Scan through the table looking for exited children.
            for np in PROCS.pool.iter() {
                let parent = unsafe { &*np.parent.get() };
                if !parent.as_ref().map_or(false, |pp| Arc::ptr_eq(pp, self)) {
                    continue;
                }
                // make sure the child isn't still in exit() or swtch().
                let np_guard = np.inner.lock();
                havekids = true;
                if np_guard.state == ProcState::ZOMBIE {
                    // Found one.
                    let pid = np_guard.pid.0;
                    if addr.into_usize() != 0
                        && unsafe {
                            self.data_mut()
                                .uvm
                                .as_mut()
                                .unwrap()
                                .copyout(addr, &np_guard.xstate)
                        }
                        .is_err()
                    {
                        return None;
                    }
                    np.free_proc(np_guard);
                    return Some(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || self.inner.lock().killed {
                return None;
            }

            // Wait for a child to exit.
            drop(self.sleep(Arc::as_ptr(self) as usize, wait_guard));
        }
    }

    // Give up the CPU for one scheduling round.
    fn yielding(&self) {
        let mut guard = self.inner.lock();
        guard.state = ProcState::RUNNABLE;
        unsafe {
            guard = CPUS.my_cpu().sched(guard, &mut (*self.data.get()).context);
        }
        drop(guard);
    }

    fn killed(&self) -> bool {
        self.inner.lock().killed
    }
}

impl CopyInOut for Arc<Proc> {
    fn either_copyout<T: AsBytes + ?Sized>(&self, dst: VirtAddr, src: &T) -> Result<(), ()> {
        match dst {
            VirtAddr::User(addr) => {
                let uvm = unsafe { (*self.data.get()).uvm.as_mut().unwrap() };
                unsafe { uvm.copyout(addr.into(), src) }
            }
            VirtAddr::Kernel(addr) => {
                let src = src.as_bytes();
                let dst = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, src.len()) };
                dst.copy_from_slice(src);
                Ok(())
            }
        }
    }

    fn either_copyin<T: AsBytes + FromBytes + ?Sized>(
        &self,
        dst: &mut T,
        src: VirtAddr,
    ) -> Result<(), ()> {
        match src {
            VirtAddr::User(addr) => {
                let uvm = unsafe { (*self.data.get()).uvm.as_mut().unwrap() };
                unsafe { uvm.copyin(dst, addr.into()) }
            }
            VirtAddr::Kernel(addr) => {
                let dst = dst.as_bytes_mut();
                let len = dst.len();
                let src = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };
                dst.copy_from_slice(src);
                Ok(())
            }
        }
    }
}

// Per-CPU process scheduler.
// Each CPU calls scheduler() after setting itself up.
// Scheduler never returns. It loops, doing:
//  - choose a process to run.
//  - swtch to start running that process.
//  - eventually that process transfers control
//    via swtch back to the scheduler.
pub fn scheduler() -> ! {
    let c = unsafe { CPUS.my_cpu() };
    loop {
        // Avoid deadlock by ensuring that devices can interrupt.
        intr_on();

        for p in PROCS.pool.iter() {
            let mut inner = p.inner.lock();
            if inner.state == ProcState::RUNNABLE {
                // Switch to the chosen process. It is the process's
                // job to release its lock and then reacquire it
                // before jumping back to us.
                inner.state = ProcState::RUNNING;
                c.proc.replace(Arc::clone(p));
                unsafe {
                    swtch(&mut c.context, &(*p.data.get()).context);
                }

                // Process is done running for now.
                // It should have changed its state before coming back.
                c.proc.take();
            }
        }
    }
}

// Set up the first user process.
pub fn user_init() {
    let (p, guard) = PROCS.alloc_proc().unwrap();
    INITPROC.set(Arc::clone(p)).expect("user_init: called twice");

    let data = unsafe { &mut *p.data.get() };

    // allocate one user page and copy initcode's
    // instructions and data into it.
    data.uvm.as_mut().unwrap().init(&INITCODE);
    data.sz = PGSIZE;

    // prepare for the very first "return" from kernel to user.
    let tf = unsafe { data.trapframe.unwrap().as_mut() };
    tf.epc = 0; // user program counter
    tf.sp = PGSIZE; // user stack pointer

    data.name.push_str("initcode");
    data.cwd = Path::new("/").namei().map(|(_, ip)| ip);

    let mut guard = guard;
    guard.state = ProcState::RUNNABLE;
}

// A fork child's very first scheduling by scheduler()
// will swtch to fork_ret.
pub unsafe extern "C" fn fork_ret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding the process lock from scheduler.
    CPUS.my_proc().unwrap().inner.force_unlock();

    if FIRST.swap(false, Ordering::AcqRel) {
        // File system initialization must be run in the context of a
        // regular process (e.g., because it calls sleep), and thus
        // cannot be run from main().
        fs::init(ROOTDEV);
    }

    usertrap_ret()
}

// Print a process listing to the console. For debugging.
// Runs when a user types ^P on the console.
// No lock to avoid wedging a stuck machine further.
pub fn procdump() {
    println!();
    for proc in PROCS.pool.iter() {
        let inner = unsafe { proc.inner.get_mut() };
        let data = unsafe { &*proc.data.get() };
        if inner.state != ProcState::UNUSED {
            println!(
                "{} {:?} {}",
                inner.pid.0, inner.state, data.name
            );
        }
    }
}
