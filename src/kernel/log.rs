// Simple logging that allows concurrent FS system calls.
//
// A log transaction contains the updates of multiple FS system
// calls. The logging system only commits when there are
// no FS system calls active. Thus there is never
// any reasoning required about whether a commit might
// write an uncommitted system call's updates to disk.
//
// A system call should call begin_op()/end_op() to mark
// its start and end. Usually begin_op() just increments
// the count of in-progress FS system calls and returns.
// But if it thinks the log is close to running out, it
// sleeps until the last outstanding end_op() commits.
//
// The log is a physical re-do log containing disk blocks.
// The on-disk log format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.

use crate::{
    bio::{BufGuard, BCACHE},
    fs::{BSIZE, SB},
    param::{LOGSIZE, MAXOPBLOCKS, ROOTDEV},
    proc::{Process, CPUS, PROCS},
    spinlock::Mutex,
    sync::LazyLock,
};
use core::ops::{Deref, DerefMut};

pub static LOG: LazyLock<Mutex<Log>> = LazyLock::new(|| Mutex::new(Log::new(ROOTDEV), "log"));

// Contents of the header block, used for both the on-disk header
// and to keep track in memory of logged block numbers before commit.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

pub struct Log {
    start: u32,
    size: u32,
    dev: u32,
    outstanding: u32, // how many FS sys calls are executing.
    committing: bool, // in commit(), please wait.
    lh: LogHeader,
}

impl Log {
    fn new(dev: u32) -> Self {
        assert!(
            core::mem::size_of::<LogHeader>() <= BSIZE,
            "initlog: too big logheader"
        );
        let sb = SB.get().unwrap();
        let mut log = Self {
            start: sb.logstart,
            size: sb.nlog,
            dev,
            outstanding: 0,
            committing: false,
            lh: LogHeader {
                n: 0,
                block: [0; LOGSIZE],
            },
        };
        log.recover();
        log
    }

    fn recover(&mut self) {
        self.read_head();
        self.install_trans(true); // if committed, copy from log to disk
        self.lh.n = 0;
        self.write_head(); // clear the log
    }

    // Read the log header from disk into the in-memory log header.
    fn read_head(&mut self) {
        let buf = BCACHE.read(self.dev, self.start);
        self.lh = *buf.align_to::<LogHeader>().first().unwrap();
    }

    // Write the in-memory log header to disk.
    // This is the true point at which the
    // current transaction commits.
    fn write_head(&self) {
        let mut buf = BCACHE.read(self.dev, self.start);
        *buf.align_to_mut::<LogHeader>().first_mut().unwrap() = self.lh;
        buf.write();
    }

    // Copy committed blocks from the log to their home location.
    fn install_trans(&self, recovering: bool) {
        for tail in 0..self.lh.n {
            let lbuf = BCACHE.read(self.dev, self.start + tail + 1); // log block
            let mut dbuf = BCACHE.read(self.dev, self.lh.block[tail as usize]); // dst
            dbuf.copy_from_slice(lbuf.deref().deref()); // copy block to dst
            dbuf.write(); // write dst to disk
            if !recovering {
                unsafe { dbuf.unpin() };
            }
        }
    }

    // Copy modified blocks from the cache to the log region.
    fn write_log(&mut self) {
        for tail in 0..self.lh.n {
            let mut to = BCACHE.read(self.dev, self.start + tail + 1); // log block
            let from = BCACHE.read(self.dev, self.lh.block[tail as usize]); // cache block
            to.copy_from_slice(from.deref().deref());
            to.write(); // write the log
        }
    }

    fn commit(&mut self) {
        if self.lh.n > 0 {
            self.write_log(); // Write modified blocks from cache to log
            self.write_head(); // Write header to disk -- the real commit
            self.install_trans(false); // Now install writes to home locations
            self.lh.n = 0;
            self.write_head(); // Erase the transaction from the log
        }
    }
}

impl Mutex<Log> {
    // called at the start of each FS system call.
    pub fn begin_op(&self) {
        let p = CPUS.my_proc().unwrap();
        let mut guard = self.lock();
        loop {
            if guard.committing
                || guard.lh.n as usize + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                // this op might exhaust log space; wait for commit.
                guard = p.sleep(guard.deref() as *const _ as usize, guard);
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    // called at the end of each FS system call.
    // commits if this was the last outstanding operation.
    pub fn end_op(&self) {
        let mut committer: Option<*mut Log> = None;

        {
            let mut guard = self.lock();
            guard.outstanding -= 1;
            assert!(!guard.committing, "log committing");

            if guard.outstanding == 0 {
                guard.committing = true;
                committer.replace(guard.deref_mut() as *mut Log);
            } else {
                // begin_op() may be waiting for log space,
                // and decrementing log.outstanding has decreased
                // the amount of reserved space.
                PROCS.wakeup(guard.deref() as *const _ as usize);
            }
        }

        if let Some(log) = committer {
            // call commit() without holding the lock, since commit
            // sleeps on disk I/O and no one else touches the log
            // while committing is set.
            unsafe {
                (*log).commit();
            }
            let mut guard = self.lock();
            guard.committing = false;
            PROCS.wakeup(guard.deref() as *const _ as usize);
        }
    }

    // Caller has modified the buffer's data and is done with it.
    // Record the block number and pin the buffer in the cache by
    // raising its refcount. The commit will do the disk write.
    //
    // LOG.write() replaces BufGuard::write(); a typical use is:
    //   let mut bp = BCACHE.read(...);
    //   // modify bp data
    //   LOG.write(bp);
    pub fn write(&self, b: BufGuard) {
        let mut guard = self.lock();

        assert!(
            (guard.lh.n as usize) < LOGSIZE && guard.lh.n < guard.size - 1,
            "too big a transaction"
        );
        assert!(guard.outstanding >= 1, "log write outside of trans");

        let blockno = b.blockno();
        for i in 0..guard.lh.n as usize {
            if guard.lh.block[i] == blockno {
                // log absorption
                return;
            }
        }

        // Add new block to log
        let n = guard.lh.n as usize;
        guard.lh.block[n] = blockno;
        unsafe { b.pin() };
        guard.lh.n += 1;
    }
}
