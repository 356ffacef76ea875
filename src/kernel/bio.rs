// Buffer cache.
//
// The buffer cache holds cached copies of disk block contents.
// Caching disk blocks in memory reduces the number of disk reads
// and also provides a synchronization point for disk blocks used
// by multiple processes.
//
// Interface:
// * To get a buffer for a particular disk block, call BCACHE.read.
// * After changing buffer data, call BufGuard::write to write it to disk.
// * Dropping the guard releases the buffer.
// * Only one process at a time can use a buffer,
//   so do not keep guards longer than necessary.
//
// The LRU list structure (and the per-buffer reference counts held
// as Arc strong counts) is protected by the lru spinlock; each
// buffer's content is protected by its own sleep-lock. A buffer
// whose count is above zero is never recycled, which is what makes
// "at most one cached buffer per (dev, blockno)" hold.

use crate::{
    fs::BSIZE,
    param::NBUF,
    sleeplock::{SleepLock, SleepLockGuard},
    spinlock::Mutex,
    virtio_disk::DISK,
};
use alloc::{
    rc::{Rc, Weak},
    sync::Arc,
};
use core::{
    cell::RefCell,
    ops::{Deref, DerefMut},
};

pub static BCACHE: BCache = BCache::new();

pub struct BCache {
    buf: [SleepLock<Data>; NBUF],
    // Linked list of all buffers, sorted by how recently each
    // buffer was used. The front is the most recently used end.
    lru: Mutex<Lru>,
}

// One cached block. Protected by the owning SleepLock.
// The data area comes first and the struct is 8-byte aligned, so
// on-disk records (inodes, the log header, indirect blocks) can be
// viewed in place with align_to.
#[repr(C, align(8))]
pub struct Data {
    pub data: [u8; BSIZE],
    pub disk: bool, // does the disk "own" this buffer?
    blockno: u32,   // kept in sync with Meta
    dev: u32,       // kept in sync with Meta
    valid: bool,    // has data been read from disk?
}

impl Data {
    const fn new() -> Self {
        Self {
            data: [0; BSIZE],
            disk: false,
            blockno: 0,
            dev: 0,
            valid: false,
        }
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }
}

impl Deref for Data {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

// A cache slot: the block identity plus the list links.
// Only touched while the lru lock is held.
struct Buf {
    data: Arc<&'static SleepLock<Data>>,
    meta: RefCell<Meta>,
}

#[derive(Default)]
struct Meta {
    dev: u32,
    blockno: u32,
    next: Option<Rc<Buf>>,
    prev: Option<Weak<Buf>>,
}

impl Buf {
    fn new(data: Arc<&'static SleepLock<Data>>) -> Self {
        Self {
            data,
            meta: RefCell::new(Meta::default()),
        }
    }
}

struct Lru {
    head: Option<Rc<Buf>>,
    tail: Option<Weak<Buf>>,
}

// A referenced, sleep-locked buffer.
// The reference count is the Arc strong count on the slot's data;
// dropping the guard releases the lock, drops the reference, and
// moves the buffer to the MRU end once unreferenced.
pub struct BufGuard {
    data_guard: Option<SleepLockGuard<'static, Data>>,
    _ref: Option<Arc<&'static SleepLock<Data>>>,
    _link: Option<Rc<Buf>>, // do not touch outside the lru lock
}

impl Deref for BufGuard {
    type Target = SleepLockGuard<'static, Data>;
    fn deref(&self) -> &Self::Target {
        self.data_guard.as_ref().unwrap()
    }
}

impl DerefMut for BufGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_guard.as_mut().unwrap()
    }
}

impl BufGuard {
    // Write the buffer's content to disk. Must be locked (it is,
    // by construction: the guard holds the sleep-lock).
    pub fn write(&mut self) {
        if !self.holding() {
            panic!("bwrite");
        }
        let guard = self.data_guard.take().unwrap();
        self.data_guard = Some(DISK.rw(guard, true));
    }

    // Raise the buffer's reference count without holding a guard,
    // so the log can keep a block cached until a commit installs it.
    //
    // # Safety
    //
    // Every pin must eventually be matched by exactly one unpin.
    pub unsafe fn pin(&self) {
        Arc::increment_strong_count(Arc::as_ptr(self._ref.as_ref().unwrap()));
    }

    // # Safety
    //
    // Must match an earlier pin of the same block.
    pub unsafe fn unpin(&self) {
        Arc::decrement_strong_count(Arc::as_ptr(self._ref.as_ref().unwrap()));
    }

    // View the block as a slice of U. The data area is page-aligned,
    // so any on-disk record type fits.
    pub fn align_to<U>(&self) -> &[U] {
        let (head, body, _) = unsafe { self.data_guard.as_ref().unwrap().data.align_to::<U>() };
        assert!(head.is_empty(), "buffer data not aligned");
        body
    }

    pub fn align_to_mut<U>(&mut self) -> &mut [U] {
        let (head, body, _) = unsafe { self.data_guard.as_mut().unwrap().data.align_to_mut::<U>() };
        assert!(head.is_empty(), "buffer data not aligned");
        body
    }
}

impl Drop for BufGuard {
    fn drop(&mut self) {
        if !self.holding() {
            panic!("brelse");
        }
        self.data_guard.take(); // release the sleep-lock
        self._ref.take(); // drop the reference
        BCACHE.lru.lock().relse(self._link.take().unwrap())
    }
}

impl Lru {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    fn add(&mut self, data: &'static SleepLock<Data>) {
        let buf = Rc::new(Buf::new(Arc::new(data)));
        match self.tail.take() {
            Some(old_tail) => {
                old_tail.upgrade().unwrap().meta.borrow_mut().next = Some(Rc::clone(&buf));
                buf.meta.borrow_mut().prev = Some(old_tail);
            }
            None => {
                self.head = Some(Rc::clone(&buf));
            }
        }
        self.tail = Some(Rc::downgrade(&buf));
    }

    // Find (or claim) the slot caching (dev, blockno) and take a
    // reference to it, all under the lru lock so no other process
    // can recycle it in between.
    fn get(&mut self, dev: u32, blockno: u32) -> (Rc<Buf>, Arc<&'static SleepLock<Data>>) {
        // Is the block already cached?
        for b in self.iter() {
            let hit = {
                let meta = b.meta.borrow();
                meta.dev == dev && meta.blockno == blockno
            };
            if hit {
                let data = Arc::clone(&b.data);
                return (b, data);
            }
        }

        // Not cached.
        // Recycle the least recently used unreferenced buffer.
        for b in self.iter().rev() {
            if Arc::strong_count(&b.data) == 1 {
                {
                    let mut meta = b.meta.borrow_mut();
                    meta.dev = dev;
                    meta.blockno = blockno;
                }
                // the count was zero, so no one holds the
                // sleep-lock and this cannot block.
                let lk: &'static SleepLock<Data> = *b.data;
                let mut data = lk.lock();
                data.dev = dev;
                data.blockno = blockno;
                data.valid = false;
                drop(data);

                let data = Arc::clone(&b.data);
                return (b, data);
            }
        }
        panic!("bget: no buffers");
    }

    // A buffer whose last reference went away moves to the MRU end.
    fn relse(&mut self, buf: Rc<Buf>) {
        if Arc::strong_count(&buf.data) != 1 {
            return;
        }

        // detach
        let next = buf.meta.borrow_mut().next.take();
        let prev = buf.meta.borrow_mut().prev.take();
        if let Some(ref n) = next {
            n.meta.borrow_mut().prev = prev.clone();
        }
        if let Some(ref p) = prev {
            p.upgrade().unwrap().meta.borrow_mut().next = next.clone();
        }
        if self.head.as_ref().map_or(false, |h| Rc::ptr_eq(h, &buf)) {
            self.head = next;
        }
        if self
            .tail
            .as_ref()
            .and_then(|t| t.upgrade())
            .map_or(false, |t| Rc::ptr_eq(&t, &buf))
        {
            self.tail = prev;
        }

        // attach at the MRU end
        match self.head.take() {
            Some(old_head) => {
                old_head.meta.borrow_mut().prev = Some(Rc::downgrade(&buf));
                buf.meta.borrow_mut().next = Some(old_head);
            }
            None => {
                self.tail = Some(Rc::downgrade(&buf));
            }
        }
        self.head = Some(buf);
    }

    fn iter(&self) -> Iter {
        Iter {
            head: self.head.clone(),
            tail: self.tail.as_ref().and_then(|tail| tail.upgrade()),
        }
    }
}

struct Iter {
    head: Option<Rc<Buf>>,
    tail: Option<Rc<Buf>>,
}

impl Iterator for Iter {
    type Item = Rc<Buf>;
    fn next(&mut self) -> Option<Self::Item> {
        let old_head = self.head.take()?;
        self.head = old_head.meta.borrow().next.clone();
        Some(old_head)
    }
}

impl DoubleEndedIterator for Iter {
    fn next_back(&mut self) -> Option<Self::Item> {
        let old_tail = self.tail.take()?;
        self.tail = old_tail
            .meta
            .borrow()
            .prev
            .as_ref()
            .and_then(|p| p.upgrade());
        Some(old_tail)
    }
}

impl BCache {
    const fn new() -> Self {
        Self {
            buf: array_macro::array![SleepLock::new(Data::new(), "buffer"); NBUF],
            lru: Mutex::new(Lru::new(), "bcache"),
        }
    }

    // Return a referenced, locked buffer with the contents of the
    // indicated block.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard {
        let (link, data) = self.lru.lock().get(dev, blockno);

        let lk: &'static SleepLock<Data> = *data;
        let mut b = BufGuard {
            data_guard: Some(lk.lock()),
            _ref: Some(data),
            _link: Some(link),
        };
        if !b.valid {
            b.data_guard = Some(DISK.rw(b.data_guard.take().unwrap(), false));
            b.valid = true;
        }
        b
    }
}

pub fn init() {
    let mut lru = BCACHE.lru.lock();
    for b in BCACHE.buf.iter() {
        lru.add(b);
    }
}
