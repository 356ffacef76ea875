use crate::fcntl::OMode;
use crate::file::{FType, File, FTABLE};
use crate::proc::{CopyInOut, Process, CPUS, PROCS};
use crate::spinlock::Mutex;
use crate::vm::VirtAddr;
use alloc::sync::Arc;

pub const PIPESIZE: usize = 512;

// A pipe end. Both ends share the ring through the Arc; the last
// end to close drops the ring itself.
#[derive(Debug)]
pub struct Pipe {
    inner: Arc<Mutex<PipeInner>>,
}

#[derive(Debug)]
struct PipeInner {
    data: [u8; PIPESIZE],
    nread: u32,     // number of bytes read
    nwrite: u32,    // number of bytes written
    readopen: bool, // read fd is still open
    writeopen: bool, // write fd is still open
}

// The counters increase without bound and wrap; the number of
// buffered bytes is nwrite - nread in modular arithmetic, and
// sits in 0..=PIPESIZE whenever the lock is held.
impl PipeInner {
    const fn new() -> Self {
        Self {
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }
    }

    fn full(&self) -> bool {
        self.nwrite.wrapping_sub(self.nread) == PIPESIZE as u32
    }

    fn empty(&self) -> bool {
        self.nwrite == self.nread
    }
}

impl Pipe {
    // Allocate a pipe and the two file objects referring to its
    // ends: (read end, write end).
    pub fn alloc() -> Option<(File, File)> {
        let inner = Arc::new(Mutex::new(PipeInner::new(), "pipe"));

        let mut rmode = OMode::new();
        rmode.read(true);
        let f0 = FTABLE.alloc(
            rmode,
            FType::Pipe(Pipe {
                inner: Arc::clone(&inner),
            }),
        )?;

        let mut wmode = OMode::new();
        wmode.write(true);
        let f1 = FTABLE.alloc(wmode, FType::Pipe(Pipe { inner }))?;

        Some((f0, f1))
    }

    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        let p = CPUS.my_proc().unwrap();

        let mut pi = self.inner.lock();
        let mut i = 0;
        while i < n {
            if !pi.readopen || p.killed() {
                return Err(());
            }
            if pi.full() {
                // wake any sleeping readers, then wait for room.
                PROCS.wakeup(&pi.nread as *const _ as usize);
                pi = p.sleep(&pi.nwrite as *const _ as usize, pi);
            } else {
                let mut ch: u8 = 0;
                if p.either_copyin(&mut ch, src + i).is_err() {
                    break;
                }
                let idx = pi.nwrite as usize % PIPESIZE;
                pi.data[idx] = ch;
                pi.nwrite = pi.nwrite.wrapping_add(1);
                i += 1;
            }
        }
        PROCS.wakeup(&pi.nread as *const _ as usize);

        Ok(i)
    }

    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let p = CPUS.my_proc().unwrap();

        let mut pi = self.inner.lock();
        while pi.empty() && pi.writeopen {
            if p.killed() {
                return Err(());
            }
            pi = p.sleep(&pi.nread as *const _ as usize, pi);
        }

        let mut i = 0;
        while i < n {
            if pi.empty() {
                break;
            }
            let idx = pi.nread as usize % PIPESIZE;
            let ch = pi.data[idx];
            pi.nread = pi.nread.wrapping_add(1);
            if p.either_copyout(dst + i, &ch).is_err() {
                break;
            }
            i += 1;
        }
        PROCS.wakeup(&pi.nwrite as *const _ as usize);

        Ok(i)
    }

    // Close one end. The peer is woken so it can observe EOF or a
    // broken pipe; the ring itself goes away with the last Arc.
    pub fn close(&self, writable: bool) {
        let mut pi = self.inner.lock();
        if writable {
            pi.writeopen = false;
            PROCS.wakeup(&pi.nread as *const _ as usize);
        } else {
            pi.readopen = false;
            PROCS.wakeup(&pi.nwrite as *const _ as usize);
        }
    }
}
