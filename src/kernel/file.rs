// Support functions for system calls that involve file descriptors:
// a reference-counted table of open file objects, and the dispatch
// between the inode, device, and pipe variants.

#[cfg(target_os = "none")]
use crate::fcntl::OMode;
#[cfg(target_os = "none")]
use crate::fs::{create, IData, Inode, Path, BSIZE};
#[cfg(target_os = "none")]
use crate::log::LOG;
#[cfg(target_os = "none")]
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
#[cfg(target_os = "none")]
use crate::pipe::Pipe;
#[cfg(target_os = "none")]
use crate::proc::{CopyInOut, CPUS};
#[cfg(target_os = "none")]
use crate::sleeplock::SleepLockGuard;
#[cfg(target_os = "none")]
use crate::spinlock::Mutex;
#[cfg(target_os = "none")]
use crate::stat::{IType, Stat};
#[cfg(target_os = "none")]
use crate::sync::{LazyLock, OnceLock};
#[cfg(target_os = "none")]
use crate::vm::VirtAddr;
#[cfg(target_os = "none")]
use alloc::sync::Arc;
#[cfg(target_os = "none")]
use array_macro::array;
#[cfg(target_os = "none")]
use core::cell::UnsafeCell;
#[cfg(target_os = "none")]
use core::ops::Deref;

// Device major numbers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    Null = 0,
    Console = 1,
    Invalid,
}

impl Default for Major {
    fn default() -> Self {
        Self::Null
    }
}

impl Major {
    pub fn from_u16(bits: u16) -> Major {
        match bits {
            0 => Major::Null,
            1 => Major::Console,
            _ => Major::Invalid,
        }
    }
}

#[cfg(target_os = "none")]
pub static DEVSW: DevSW = DevSW::new();
#[cfg(target_os = "none")]
pub static FTABLE: LazyLock<FTable> =
    LazyLock::new(|| Mutex::new(array![_ => None; NFILE], "ftable"));

#[cfg(target_os = "none")]
pub type FTable = Mutex<[Option<Arc<VFile>>; NFILE]>;

// An open file: a shared reference into FTABLE plus this
// descriptor's read/write permission. Cloning duplicates the
// descriptor (dup); dropping closes it.
#[cfg(target_os = "none")]
#[derive(Debug, Default, Clone)]
pub struct File {
    f: Option<Arc<VFile>>,
    readable: bool,
    writable: bool,
}

#[cfg(target_os = "none")]
#[derive(Debug)]
pub enum VFile {
    Device(DNod),
    Inode(FNod),
    Pipe(Pipe),
}

// Device node.
#[cfg(target_os = "none")]
#[derive(Debug)]
pub struct DNod {
    driver: &'static dyn Device,
    ip: Inode,
}

// Device functions, dispatched by major number.
#[cfg(target_os = "none")]
pub trait Device: Send + Sync {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()>;
    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()>;
    fn major(&self) -> Major;
}

#[cfg(target_os = "none")]
impl core::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Device({:?})", self.major())
    }
}

// File or directory node: an inode plus the descriptor's offset.
// The offset is shared by all dups of the descriptor and is
// only touched while the inode's sleep-lock is held.
#[cfg(target_os = "none")]
#[derive(Debug)]
pub struct FNod {
    off: UnsafeCell<u32>,
    ip: Inode,
}
#[cfg(target_os = "none")]
unsafe impl Sync for FNod {}
#[cfg(target_os = "none")]
unsafe impl Send for FNod {}

#[cfg(target_os = "none")]
impl FNod {
    fn new(ip: Inode) -> Self {
        Self {
            off: UnsafeCell::new(0),
            ip,
        }
    }

    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let mut ip = self.ip.lock();
        // the inode lock also protects off.
        let off = unsafe { &mut *self.off.get() };
        match ip.read(dst, *off, n) {
            Ok(r) => {
                *off += r as u32;
                Ok(r)
            }
            Err(_) => Err(()),
        }
    }

    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        // write a few blocks at a time to avoid exceeding the
        // maximum log transaction size, including i-node, indirect
        // block, allocation blocks, and 2 blocks of slop for
        // non-aligned writes. this really belongs lower down, since
        // IData::write might be writing a device like the console.
        let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
        let mut i = 0;
        while i < n {
            let n1 = core::cmp::min(n - i, max);

            let r;
            {
                LOG.begin_op();
                let mut ip = self.ip.lock();
                let off = unsafe { &mut *self.off.get() };
                r = ip.write(src + i, *off, n1).unwrap_or(0);
                *off += r as u32;
                LOG.end_op();
            }

            if r != n1 {
                // error from IData::write
                break;
            }
            i += r;
        }

        if i == n {
            Ok(n)
        } else {
            Err(())
        }
    }
}

#[cfg(target_os = "none")]
impl VFile {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        match self {
            VFile::Device(d) => d.driver.read(dst, n),
            VFile::Inode(f) => f.read(dst, n),
            VFile::Pipe(p) => p.read(dst, n),
        }
    }

    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        match self {
            VFile::Device(d) => d.driver.write(src, n),
            VFile::Inode(f) => f.write(src, n),
            VFile::Pipe(p) => p.write(src, n),
        }
    }

    // Get metadata about file f.
    // addr is a user virtual address, pointing to a struct Stat.
    pub fn stat(&self, addr: VirtAddr) -> Result<(), ()> {
        let p = CPUS.my_proc().unwrap();
        let mut stat = Stat::default();

        match self {
            VFile::Device(DNod { driver: _, ip }) | VFile::Inode(FNod { off: _, ip }) => {
                ip.lock().stat(&mut stat);
                p.either_copyout(addr, unsafe { crate::defs::as_bytes(&stat) })
            }
            _ => Err(()),
        }
    }
}

#[cfg(target_os = "none")]
impl File {
    // Read from file f.
    // addr is a user virtual address.
    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }
        self.f.as_ref().unwrap().read(dst, n)
    }

    // Write to file f.
    // addr is a user virtual address.
    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }
        self.f.as_ref().unwrap().write(src, n)
    }
}

#[cfg(target_os = "none")]
impl Deref for File {
    type Target = Arc<VFile>;
    fn deref(&self) -> &Self::Target {
        self.f.as_ref().unwrap()
    }
}

#[cfg(target_os = "none")]
impl Drop for File {
    // Close the descriptor. The last close of a pipe end closes
    // that end; the last close of an inode or device file
    // releases the inode inside a transaction.
    fn drop(&mut self) {
        let writable = self.writable;
        let f = self.f.take().unwrap();

        {
            let mut guard = FTABLE.lock();
            match Arc::strong_count(&f) {
                c if c < 2 => panic!("file close"),
                2 => {
                    // the last descriptor: drop the table's
                    // reference too.
                    for entry in guard.iter_mut() {
                        if entry.as_ref().map_or(false, |vf| Arc::ptr_eq(&f, vf)) {
                            entry.take();
                        }
                    }
                }
                _ => (),
            }
        }

        // if this was the last reference, run the finalizer.
        match Arc::try_unwrap(f) {
            Ok(VFile::Pipe(pi)) => pi.close(writable),
            Ok(VFile::Inode(FNod { off: _, ip }) | VFile::Device(DNod { driver: _, ip })) => {
                LOG.begin_op();
                drop(ip);
                LOG.end_op();
            }
            _ => (),
        }
    }
}

// What FTable::alloc should open.
#[cfg(target_os = "none")]
pub enum FType<'a> {
    Node(&'a Path),
    Pipe(Pipe),
}

#[cfg(target_os = "none")]
impl FTable {
    // Allocate a file structure.
    // Must be called inside a transaction if ftype is FType::Node.
    pub fn alloc(&self, opts: OMode, ftype: FType<'_>) -> Option<File> {
        let inner: Arc<VFile> = Arc::new(match ftype {
            FType::Node(path) => {
                let ip: Inode;
                let ip_guard: SleepLockGuard<'_, IData>;

                if opts.is_create() {
                    ip = create(path, IType::File, 0, 0)?;
                    ip_guard = ip.lock();
                } else {
                    (_, ip) = path.namei()?;
                    ip_guard = ip.lock();
                    if ip_guard.itype() == IType::Dir && !opts.is_rdonly() {
                        return None;
                    }
                }

                match ip_guard.itype() {
                    IType::Device => {
                        let driver = DEVSW.get(ip_guard.major())?;
                        drop(ip_guard);
                        VFile::Device(DNod { driver, ip })
                    }
                    IType::Dir | IType::File => {
                        let mut ip_guard = ip_guard;
                        if opts.is_trunc() && ip_guard.itype() == IType::File {
                            ip_guard.trunc();
                        }
                        drop(ip_guard);
                        VFile::Inode(FNod::new(ip))
                    }
                    IType::None => return None,
                }
            }
            FType::Pipe(pi) => VFile::Pipe(pi),
        });

        let mut guard = self.lock();
        match guard.iter_mut().find(|f| f.is_none()) {
            Some(entry) => {
                entry.replace(inner);
                Some(File {
                    f: entry.clone(), // strong count = 2
                    readable: opts.is_read(),
                    writable: opts.is_write(),
                })
            }
            None => {
                // don't release inner's inode reference while
                // holding the table lock.
                drop(guard);
                drop(inner);
                None
            }
        }
    }
}

#[cfg(target_os = "none")]
pub struct DevSW {
    table: [OnceLock<&'static dyn Device>; NDEV],
}

#[cfg(target_os = "none")]
impl DevSW {
    pub const fn new() -> Self {
        Self {
            table: array![_ => OnceLock::new(); NDEV],
        }
    }

    pub fn set(&self, devnum: Major, dev: &'static dyn Device) -> Result<(), ()> {
        self.table[devnum as usize].set(dev).map_err(|_| ())
    }

    pub fn get(&self, devnum: Major) -> Option<&'static dyn Device> {
        match devnum {
            Major::Null | Major::Invalid => None,
            _ => self.table[devnum as usize].get().copied(),
        }
    }
}
