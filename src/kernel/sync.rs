use crate::proc::CPUS;
use core::cell::{Cell, UnsafeCell};
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

// Once-initialized cells for kernel globals that cannot be
// built in a const context (superblock, tables, init process).
// Modeled on the std types of the same names.

const UNINIT: usize = 0;
const BLOCKED: usize = 1;
const READY: usize = 2;

pub struct OnceLock<T> {
    state: AtomicUsize,
    inner: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNINIT),
            inner: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            Some(unsafe { self.get_unchecked() })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.state.load(Ordering::Acquire) == READY {
            Some(unsafe { (*self.inner.get()).assume_init_mut() })
        } else {
            None
        }
    }

    pub fn set(&self, value: T) -> Result<(), T> {
        match self
            .state
            .compare_exchange(UNINIT, BLOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                unsafe { (*self.inner.get()).write(value) };
                self.state.store(READY, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    pub fn get_or_init(&self, func: impl FnOnce() -> T) -> &T {
        match self
            .state
            .compare_exchange(UNINIT, BLOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                unsafe { (*self.inner.get()).write(func()) };
                self.state.store(READY, Ordering::Release);
                unsafe { self.get_unchecked() }
            }
            Err(_) => {
                // another cpu is initializing; wait for it.
                let _intr_lock = CPUS.intr_lock();
                loop {
                    if self.state.load(Ordering::Acquire) == READY {
                        break unsafe { self.get_unchecked() };
                    }
                    spin_loop();
                }
            }
        }
    }

    unsafe fn get_unchecked(&self) -> &T {
        (*self.inner.get()).assume_init_ref()
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == READY {
            unsafe { (*self.inner.get()).assume_init_drop() }
        }
    }
}

pub struct LazyLock<T, F = fn() -> T> {
    cell: OnceLock<T>,
    init: Cell<Option<F>>,
}

unsafe impl<T, F: Send> Sync for LazyLock<T, F> where OnceLock<T>: Sync {}

impl<T, F> LazyLock<T, F> {
    pub const fn new(init: F) -> Self {
        Self {
            cell: OnceLock::new(),
            init: Cell::new(Some(init)),
        }
    }
}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    pub fn force(this: &LazyLock<T, F>) -> &T {
        this.cell.get_or_init(|| match this.init.take() {
            Some(f) => f(),
            None => panic!("LazyLock instance has previously been poisoned"),
        })
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        LazyLock::force(self)
    }
}
