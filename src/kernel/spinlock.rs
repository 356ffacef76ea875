use crate::proc::{Cpus, CPUS};
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

// Mutual exclusion spin locks.
//
// Acquiring a Mutex disables interrupts on the current cpu
// (via CPUS.intr_lock) for as long as the guard lives, so a
// lock holder can never be interrupted into code that tries
// to take the same lock. Holding a guard across sched() is
// forbidden; sleep() consumes the guard instead.
#[derive(Debug)]
pub struct Mutex<T> {
    locked: AtomicBool,
    // cpu holding the lock, or -1. for holding() and debugging.
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
    name: &'static str,
}
unsafe impl<T> Sync for Mutex<T> {}
unsafe impl<T> Send for Mutex<T> {}

pub struct MutexGuard<'a, T: 'a> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
            name,
        }
    }

    // Acquire the lock.
    // Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let intr_lock = CPUS.intr_lock(); // disable interrupts to avoid deadlock.
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.cpuid
            .store(unsafe { Cpus::cpu_id() as isize }, Ordering::Relaxed);

        // the guard now owns the interrupt push; it pops in drop().
        mem::forget(intr_lock);

        MutexGuard { mutex: self }
    }

    // Check whether this cpu is holding the lock.
    // Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == unsafe { Cpus::cpu_id() as isize }
    }

    // Release the lock and return a reference to the Mutex,
    // so that callers (e.g. sleep) can re-lock it later.
    pub fn unlock(guard: MutexGuard<'_, T>) -> &'_ Mutex<T> {
        let mutex = guard.mutex;
        drop(guard);
        mutex
    }

    // Release a lock that has no live guard.
    //
    // # Safety
    //
    // Only for the one place a guard cannot exist: a forked child's
    // first return from the scheduler, which still holds the process
    // lock the scheduler acquired (see fork_ret).
    pub unsafe fn force_unlock(&self) {
        assert!(self.holding(), "force_unlock {}", self.name);
        self.cpuid.store(-1, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        CPUS.intr_unlock();
    }

    // Mutable access without locking.
    //
    // # Safety
    //
    // Caller must ensure no concurrent access, e.g. the panic path
    // or a debug dump on a wedged machine.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<'a, T: 'a> MutexGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.mutex.holding()
    }
}

impl<'a, T: 'a> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.holding(), "release {}", self.mutex.name);
        self.mutex.cpuid.store(-1, Ordering::Relaxed);
        self.mutex.locked.store(false, Ordering::Release);
        unsafe { CPUS.intr_unlock() };
    }
}
