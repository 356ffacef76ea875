// File system implementation. Five layers:
//   + Blocks: allocator for raw disk blocks.
//   + Log: crash recovery for multi-step updates.
//   + Files: inode allocator, reading, writing, metadata.
//   + Directories: inode with special contents (list of other inodes!)
//   + Names: paths like /usr/rtm/rvos/fs.rs for convenient naming.
//
// This file contains the low-level file system manipulation
// routines. The (higher-level) system call implementations
// are in sysfile.rs.

#[cfg(target_os = "none")]
use crate::bio::BCACHE;
#[cfg(target_os = "none")]
use crate::file::Major;
#[cfg(target_os = "none")]
use crate::log::LOG;
#[cfg(target_os = "none")]
use crate::param::NINODE;
#[cfg(target_os = "none")]
use crate::param::ROOTDEV;
#[cfg(target_os = "none")]
use crate::println;
#[cfg(target_os = "none")]
use crate::proc::{CopyInOut, CPUS};
#[cfg(target_os = "none")]
use crate::sleeplock::{SleepLock, SleepLockGuard};
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
use core::mem::size_of;
#[cfg(target_os = "none")]
use core::ops::Deref;

pub const ROOTINO: u32 = 1; // root i-number
pub const BSIZE: usize = 1024; // block size

pub const FSMAGIC: u32 = 0x10203040;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

// Disk layout:
// [ boot block | super block | log | inode blocks |
//                                   free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file system.
// The super block describes the disk layout:
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub magic: u32,      // Must be FSMAGIC
    pub size: u32,       // Size of file system image (blocks)
    pub nblocks: u32,    // Number of data blocks
    pub ninodes: u32,    // Number of inodes
    pub nlog: u32,       // Number of log blocks
    pub logstart: u32,   // Block number of first log block
    pub inodestart: u32, // Block number of first inode block
    pub bmapstart: u32,  // Block number of first free map block
}

// On-disk inode structure.
// type, major and minor are stored raw; the in-memory inode
// holds the decoded enums.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DInode {
    pub itype: u16,                // File type (0 = free)
    pub major: u16,                // Major device number (device files only)
    pub minor: u16,                // Minor device number (device files only)
    pub nlink: u16,                // Number of links to inode in file system
    pub size: u32,                 // Size of file (bytes)
    pub addrs: [u32; NDIRECT + 1], // Data block addresses
}

// Inodes per block.
pub const IPB: usize = BSIZE / size_of::<DInode>();

// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

// Directory is a file containing a sequence of dirent structures.
pub const DIRSIZ: usize = 14;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DirEnt {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl DirEnt {
    // The stored name: NUL-padded, but not NUL-terminated when
    // it is exactly DIRSIZ bytes long.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(DIRSIZ);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name[n..].fill(0);
    }
}

impl SuperBlock {
    #[cfg(target_os = "none")]
    fn read(dev: u32) -> Self {
        let bp = BCACHE.read(dev, 1);
        *bp.align_to::<SuperBlock>().first().unwrap()
    }

    // Block containing inode i.
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    // Block of free map containing the bit for block b.
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

// there should be one superblock per disk device, but we run with
// only one device.
#[cfg(target_os = "none")]
pub static SB: OnceLock<SuperBlock> = OnceLock::new();

// Init fs. Must run in process context: it reads the disk.
#[cfg(target_os = "none")]
pub fn init(dev: u32) {
    SB.set(SuperBlock::read(dev)).unwrap();
    let sb = SB.get().unwrap();
    assert!(sb.magic == FSMAGIC, "invalid file system");
    // forcing the log runs crash recovery against the superblock.
    LazyLock::force(&LOG);
}

// Zero a block.
#[cfg(target_os = "none")]
fn bzero(dev: u32, bno: u32) {
    let mut bp = BCACHE.read(dev, bno);
    bp.copy_from_slice(&[0; BSIZE]);
    LOG.write(bp);
}

// Blocks.

// Allocate a zeroed disk block.
// Returns None if out of disk space.
#[cfg(target_os = "none")]
fn balloc(dev: u32) -> Option<u32> {
    let sb = SB.get().unwrap();
    for b in (0..sb.size).step_by(BPB as usize) {
        let mut bp = BCACHE.read(dev, sb.bblock(b));
        let mut bi = 0;
        while bi < BPB && b + bi < sb.size {
            let m = 1u8 << (bi % 8);
            if bp[(bi / 8) as usize] & m == 0 {
                // Is block free?
                bp[(bi / 8) as usize] |= m; // Mark block in use.
                LOG.write(bp);
                bzero(dev, b + bi);
                return Some(b + bi);
            }
            bi += 1;
        }
    }
    println!("balloc: out of blocks");
    None
}

// Free a disk block.
#[cfg(target_os = "none")]
fn bfree(dev: u32, b: u32) {
    let sb = SB.get().unwrap();
    let mut bp = BCACHE.read(dev, sb.bblock(b));
    let bi = b % BPB;
    let m = 1u8 << (bi % 8);
    if bp[(bi / 8) as usize] & m == 0 {
        panic!("freeing free block");
    }
    bp[(bi / 8) as usize] &= !m;
    LOG.write(bp);
}

// Inodes.
//
// An inode describes a single unnamed file.
// The inode disk structure holds metadata: the file's type,
// its size, the number of links referring to it, and the
// list of blocks holding the file's content.
//
// The inodes are laid out sequentially on disk at
// sb.inodestart. Each inode has a number, indicating its
// position on the disk.
//
// The kernel keeps a table of in-use inodes in memory
// to provide a place for synchronizing access
// to inodes used by multiple processes. The in-memory
// inodes include book-keeping information that is
// not stored on disk: the Arc strong count and idata.valid.
//
// An inode and its in-memory representation go through a
// sequence of states before they can be used by the
// rest of the file system code.
//
// * Allocation: an inode is allocated if its type (on disk)
//   is non-zero. ITABLE.alloc() allocates, and put() frees if
//   the reference and link counts have fallen to zero.
//
// * Referencing in table: an entry in the inode table
//   is free if its slot is None. Otherwise the Arc strong
//   count tracks the number of in-memory references to
//   the entry (open files and current directories).
//   get() finds or creates a table entry; dropping an
//   Inode wrapper releases the reference via put().
//
// * Valid: the information (type, size, &c) in an inode
//   table entry is only correct when idata.valid is true.
//   MInode::lock() reads the inode from the disk and sets
//   valid, while put() clears valid if the reference count
//   has fallen to zero.
//
// * Locked: file system code may only examine and modify
//   the information in an inode and its content if it
//   has first locked the inode.
//
// Thus a typical sequence is:
//   let ip = ITABLE.get(dev, inum);
//   let guard = ip.lock();
//   // ... examine and modify ip through guard ...
//   drop(guard);
//   drop(ip);
//
// lock() is separate from get() so that system calls can
// get a long-term reference to an inode (as for an open file)
// and only lock it for short periods (e.g., in read()).
// The separation also helps avoid deadlock and races during
// pathname lookup. get() raises the reference count so that
// the inode stays in the table and pointers to it remain valid.
//
// Many internal file system functions expect the caller to
// have locked the inodes involved; this lets callers create
// multi-step atomic operations.
//
// The ITABLE spinlock protects the allocation of table
// entries. Since the strong count indicates whether an entry
// is free, and dev and inum indicate which i-node an entry
// holds, one must hold the ITABLE lock while using any of
// those fields.
//
// An idata sleep-lock protects all fields other than dev and
// inum. One must hold it in order to read or write that
// inode's valid, size, type, &c.

#[cfg(target_os = "none")]
pub static ITABLE: LazyLock<ITable> =
    LazyLock::new(|| Mutex::new(array![_ => None; NINODE], "itable"));

#[cfg(target_os = "none")]
type ITable = Mutex<[Option<Arc<MInode>>; NINODE]>;

// A counted reference to an in-memory inode.
// Dropping it releases the reference; because the last release
// of an unlinked inode frees it on disk, an Inode must only be
// dropped inside a log transaction.
#[cfg(target_os = "none")]
#[derive(Debug)]
pub struct Inode {
    ip: Option<Arc<MInode>>,
}

// in-memory copy of an inode.
#[cfg(target_os = "none")]
#[derive(Debug)]
pub struct MInode {
    dev: u32,
    inum: u32,
    data: SleepLock<IData>,
}

#[cfg(target_os = "none")]
#[derive(Debug, Default)]
pub struct IData {
    dev: u32,
    inum: u32,
    valid: bool,
    itype: IType,
    major: Major,
    pub minor: u16,
    pub nlink: u16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

#[cfg(target_os = "none")]
impl MInode {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            data: SleepLock::new(IData::new(dev, inum), "inode"),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    // Lock the inode, reading it in from disk if necessary.
    // There is no explicit unlock; dropping the guard unlocks.
    pub fn lock(&self) -> SleepLockGuard<'_, IData> {
        let mut guard = self.data.lock();
        if !guard.valid {
            let sb = SB.get().unwrap();
            let bp = BCACHE.read(self.dev, sb.iblock(self.inum));
            let dip = &bp.align_to::<DInode>()[self.inum as usize % IPB];
            guard.itype = IType::from_u16(dip.itype).expect("ilock: bad type on disk");
            guard.major = Major::from_u16(dip.major);
            guard.minor = dip.minor;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs.copy_from_slice(&dip.addrs);
            drop(bp);
            guard.valid = true;
            if guard.itype == IType::None {
                panic!("ilock: no type");
            }
        }
        guard
    }
}

#[cfg(target_os = "none")]
impl Inode {
    fn new(ip: Arc<MInode>) -> Self {
        Self { ip: Some(ip) }
    }

    // Take another reference to the same inode,
    // to enable the ip = ip1.dup() idiom.
    pub fn dup(&self) -> Self {
        Self {
            ip: self.ip.clone(),
        }
    }
}

#[cfg(target_os = "none")]
impl Deref for Inode {
    type Target = MInode;
    fn deref(&self) -> &Self::Target {
        self.ip.as_ref().unwrap()
    }
}

#[cfg(target_os = "none")]
impl Drop for Inode {
    // Must run inside a log transaction (see put()).
    fn drop(&mut self) {
        ITABLE.put(self.ip.take().unwrap());
    }
}

#[cfg(target_os = "none")]
impl ITable {
    // Allocate an inode on device dev.
    // Mark it as allocated by giving it type itype.
    // Returns an unlocked but allocated and referenced inode,
    // or None if there is no free inode.
    fn alloc(&self, dev: u32, itype: IType) -> Option<Inode> {
        let sb = SB.get().unwrap();
        for inum in 1..sb.ninodes {
            let mut bp = BCACHE.read(dev, sb.iblock(inum));
            let dip = &mut bp.align_to_mut::<DInode>()[inum as usize % IPB];
            if dip.itype == 0 {
                // a free inode
                *dip = DInode::default();
                dip.itype = itype as u16;
                LOG.write(bp); // mark it allocated on the disk
                return Some(self.get(dev, inum));
            }
        }
        println!("ialloc: no inodes");
        None
    }

    // Find the inode with number inum on device dev and return
    // an in-memory reference to it. Does not lock the inode
    // and does not read it from disk.
    pub fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.lock();

        // Is the inode already in the table?
        let mut empty: Option<&mut Option<Arc<MInode>>> = None;
        for entry in guard.iter_mut() {
            match entry {
                Some(ip) if ip.dev == dev && ip.inum == inum => {
                    return Inode::new(Arc::clone(ip));
                }
                None if empty.is_none() => {
                    empty = Some(entry);
                }
                _ => (),
            }
        }

        // Recycle a table entry.
        let empty = match empty {
            Some(entry) => entry,
            None => panic!("iget: no inodes"),
        };

        let ip = Arc::new(MInode::new(dev, inum));
        empty.replace(Arc::clone(&ip));
        Inode::new(ip)
    }

    // Drop a reference to an in-memory inode.
    // If that was the last reference, the table entry can
    // be recycled.
    // If that was the last reference and the inode has no links
    // to it, free the inode (and its content) on disk.
    // All calls to put() must be inside a transaction in
    // case the inode has to be freed.
    fn put(&self, inode: Arc<MInode>) {
        let guard = self.lock();

        // strong count 2 means this reference plus the table's:
        // no one else holds the inode, so its sleep-lock is free
        // and locking it cannot block.
        if Arc::strong_count(&inode) != 2 {
            return;
        }
        let mut idata = inode.data.lock();
        let itable = Mutex::unlock(guard);

        if idata.valid && idata.nlink == 0 {
            // inode has no links and no other references:
            // truncate and free.
            idata.trunc();
            idata.itype = IType::None;
            idata.update();
            idata.valid = false;
        }
        drop(idata);

        let mut guard = itable.lock();
        // drop the table's reference.
        for entry in guard.iter_mut() {
            if entry.as_ref().map_or(false, |ip| Arc::ptr_eq(&inode, ip)) {
                entry.take();
            }
        }
    }
}

#[cfg(target_os = "none")]
impl IData {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            ..Default::default()
        }
    }

    pub fn itype(&self) -> IType {
        self.itype
    }

    pub fn major(&self) -> Major {
        self.major
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    // Copy a modified in-memory inode to disk.
    // Must be called after every change to an inode field
    // that lives on disk.
    // Caller must hold the inode's sleep-lock.
    pub fn update(&self) {
        let sb = SB.get().unwrap();
        let mut bp = BCACHE.read(self.dev, sb.iblock(self.inum));
        let dip = &mut bp.align_to_mut::<DInode>()[self.inum as usize % IPB];
        dip.itype = self.itype as u16;
        dip.major = self.major as u16;
        dip.minor = self.minor;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs.copy_from_slice(&self.addrs);
        LOG.write(bp);
    }

    // Truncate inode (discard contents).
    // Caller must hold the inode's sleep-lock.
    pub fn trunc(&mut self) {
        for addr in self.addrs.iter_mut().take(NDIRECT) {
            if *addr > 0 {
                bfree(self.dev, *addr);
                *addr = 0;
            }
        }

        if self.addrs[NDIRECT] > 0 {
            let bp = BCACHE.read(self.dev, self.addrs[NDIRECT]);
            for &addr in bp.align_to::<u32>().iter() {
                if addr > 0 {
                    bfree(self.dev, addr);
                }
            }
            drop(bp);
            bfree(self.dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.update();
    }

    // Inode content.
    //
    // The content (data) associated with each inode is stored
    // in blocks on the disk. The first NDIRECT block numbers
    // are listed in addrs[]; the next NINDIRECT blocks are
    // listed in the block addrs[NDIRECT].
    //
    // Return the disk block number of the bn'th block in this
    // inode. If there is no such block, bmap allocates one.
    // Returns Err if out of disk space.
    pub fn bmap(&mut self, bn: u32) -> Result<u32, &'static str> {
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = balloc(self.dev).ok_or("bmap: out of space")?;
                self.addrs[bn] = addr;
            }
            return Ok(addr);
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // Load indirect block, allocating if necessary.
            let mut addr = self.addrs[NDIRECT];
            if addr == 0 {
                addr = balloc(self.dev).ok_or("bmap: out of space")?;
                self.addrs[NDIRECT] = addr;
            }
            let mut bp = BCACHE.read(self.dev, addr);
            let a = bp.align_to_mut::<u32>();
            addr = a[bn];
            if addr == 0 {
                addr = balloc(self.dev).ok_or("bmap: out of space")?;
                a[bn] = addr;
                LOG.write(bp);
            }
            return Ok(addr);
        }

        panic!("bmap: out of range");
    }

    // Copy stat information from the inode.
    // Caller must hold the inode's sleep-lock.
    pub fn stat(&self, st: &mut Stat) {
        st.dev = self.dev;
        st.ino = self.inum;
        st.itype = self.itype;
        st.nlink = self.nlink;
        st.size = self.size as u64;
    }

    // Read data from the inode.
    // Caller must hold the inode's sleep-lock.
    // dst is a user or kernel address.
    // Returns the number of bytes successfully read.
    // A read past the end of the file returns Ok(0);
    // a fault copying to dst returns Err.
    pub fn read(&mut self, mut dst: VirtAddr, off: u32, n: usize) -> Result<usize, &'static str> {
        let mut off = off as usize;

        if off > self.size as usize || off.checked_add(n).is_none() {
            return Ok(0);
        }
        let n = core::cmp::min(n, self.size as usize - off);

        let mut tot = 0;
        while tot < n {
            let addr = match self.bmap((off / BSIZE) as u32) {
                Ok(addr) => addr,
                Err(_) => break,
            };
            let bp = BCACHE.read(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE - off % BSIZE);
            if CPUS
                .my_proc()
                .unwrap()
                .either_copyout(dst, &bp[off % BSIZE..off % BSIZE + m])
                .is_err()
            {
                return Err("readi: copyout failed");
            }
            tot += m;
            off += m;
            dst += m;
        }
        Ok(tot)
    }

    // Write data to the inode.
    // Caller must hold the inode's sleep-lock.
    // src is a user or kernel address.
    // Returns the number of bytes successfully written; running
    // out of disk space gives a short count, a fault copying
    // from src gives Err. Either way the inode is written back,
    // because bmap may have allocated new blocks.
    pub fn write(&mut self, mut src: VirtAddr, off: u32, n: usize) -> Result<usize, &'static str> {
        let mut off = off as usize;

        if off > self.size as usize {
            return Err("writei: offset past end");
        }
        if off.checked_add(n).map_or(true, |end| end > MAXFILE * BSIZE) {
            return Err("writei: file too large");
        }

        let mut tot = 0;
        let mut fault = false;
        while tot < n {
            let addr = match self.bmap((off / BSIZE) as u32) {
                Ok(addr) => addr,
                Err(_) => break,
            };
            let mut bp = BCACHE.read(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE - off % BSIZE);
            if CPUS
                .my_proc()
                .unwrap()
                .either_copyin(&mut bp[off % BSIZE..off % BSIZE + m], src)
                .is_err()
            {
                fault = true;
                break;
            }
            LOG.write(bp);
            tot += m;
            off += m;
            src += m;
        }

        if off > self.size as usize {
            self.size = off as u32;
        }

        // write the inode back to disk even if the size didn't
        // change, because the loop above might have called bmap()
        // and added a new block to self.addrs[].
        self.update();

        if fault {
            Err("writei: copyin failed")
        } else {
            Ok(tot)
        }
    }

    // Directories.

    // Look for a directory entry in a directory.
    // If found, return a reference to its inode and
    // set *poff to the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &str, mut poff: Option<&mut u32>) -> Option<Inode> {
        assert!(self.itype == IType::Dir, "dirlookup not DIR");

        let mut de = DirEnt::default();
        for off in (0..self.size).step_by(size_of::<DirEnt>()) {
            self.read(
                VirtAddr::Kernel(&mut de as *mut _ as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("dirlookup read");
            if de.inum == 0 {
                continue;
            }
            if de.name() == name {
                // entry matches path element
                if let Some(poff) = poff.take() {
                    *poff = off;
                }
                return Some(ITABLE.get(self.dev, de.inum as u32));
            }
        }
        None
    }

    // Write a new directory entry (name, inum) into this directory.
    // Fails if the name is already present or the directory is
    // out of space.
    pub fn dirlink(&mut self, name: &str, inum: u32) -> Result<(), &'static str> {
        // the name must not be present.
        if self.dirlookup(name, None).is_some() {
            return Err("dirlink: name exists");
        }

        // Look for an empty dirent.
        let mut de = DirEnt::default();
        let mut off = 0;
        while off < self.size {
            self.read(
                VirtAddr::Kernel(&mut de as *mut _ as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("dirlink read");
            if de.inum == 0 {
                break;
            }
            off += size_of::<DirEnt>() as u32;
        }

        de.set_name(name);
        de.inum = inum as u16;
        if self.write(
            VirtAddr::Kernel(&de as *const _ as usize),
            off,
            size_of::<DirEnt>(),
        ) != Ok(size_of::<DirEnt>())
        {
            return Err("dirlink: write");
        }

        Ok(())
    }

    // Is the directory empty except for "." and ".." ?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = DirEnt::default();
        for off in ((2 * size_of::<DirEnt>() as u32)..self.size).step_by(size_of::<DirEnt>()) {
            self.read(
                VirtAddr::Kernel(&mut de as *mut _ as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

// Create the path new as a link to the same inode as old.
// Caller must hold a transaction.
#[cfg(target_os = "none")]
pub fn link(old: &Path, new: &Path) -> Result<(), ()> {
    let (_, ip) = old.namei().ok_or(())?;

    {
        let ip_guard = ip.lock();
        if ip_guard.itype == IType::Dir {
            return Err(());
        }
    }

    let (name, dp) = new.nameiparent().ok_or(())?;
    {
        let mut dp_guard = dp.lock();
        if dp.dev != ip.dev || dp_guard.dirlink(name, ip.inum).is_err() {
            return Err(());
        }
    }

    let mut ip_guard = ip.lock();
    ip_guard.nlink += 1;
    ip_guard.update();
    Ok(())
}

// Remove the directory entry at path.
// Caller must hold a transaction.
#[cfg(target_os = "none")]
pub fn unlink(path: &Path) -> Result<(), ()> {
    let (name, dp) = path.nameiparent().ok_or(())?;
    let mut dp_guard = dp.lock();

    // Cannot unlink "." or "..".
    if name == "." || name == ".." {
        return Err(());
    }

    let mut off: u32 = 0;
    let ip = dp_guard.dirlookup(name, Some(&mut off)).ok_or(())?;
    let mut ip_guard = ip.lock();

    assert!(ip_guard.nlink >= 1, "unlink: nlink < 1");
    if ip_guard.itype == IType::Dir && !ip_guard.is_dir_empty() {
        return Err(());
    }

    let de = DirEnt::default();
    if dp_guard.write(
        VirtAddr::Kernel(&de as *const _ as usize),
        off,
        size_of::<DirEnt>(),
    ) != Ok(size_of::<DirEnt>())
    {
        panic!("unlink: write");
    }
    if ip_guard.itype == IType::Dir {
        // the victim's ".." no longer references dp.
        dp_guard.nlink -= 1;
        dp_guard.update();
    }
    drop(dp_guard);

    ip_guard.nlink -= 1;
    ip_guard.update();

    Ok(())
}

// Create a new inode at path, of the given type.
// Returns an unlocked, referenced inode, or None on failure
// (for files, an existing file or device at path is a success).
// Caller must hold a transaction.
#[cfg(target_os = "none")]
pub fn create(path: &Path, type_: IType, major: u16, minor: u16) -> Option<Inode> {
    let (name, dp) = path.nameiparent()?;
    let mut dp_guard = dp.lock();

    if let Some(ip) = dp_guard.dirlookup(name, None) {
        drop(dp_guard);
        let ip_guard = ip.lock();
        if type_ == IType::File && matches!(ip_guard.itype, IType::File | IType::Device) {
            drop(ip_guard);
            return Some(ip);
        }
        return None;
    }

    let ip = ITABLE.alloc(dp.dev, type_)?;
    let mut ip_guard = ip.lock();
    ip_guard.major = Major::from_u16(major);
    ip_guard.minor = minor;
    ip_guard.nlink = 1;
    ip_guard.update();

    let mut ok = true;
    if type_ == IType::Dir {
        // Create . and .. entries.
        // No nlink++ for ".": avoid a cyclic link count.
        ok = ip_guard.dirlink(".", ip.inum).is_ok() && ip_guard.dirlink("..", dp.inum).is_ok();
    }
    if ok {
        ok = dp_guard.dirlink(name, ip.inum).is_ok();
    }
    if !ok {
        // something went wrong; de-allocate ip.
        // the drop of ip below (with nlink == 0) frees it.
        ip_guard.nlink = 0;
        ip_guard.update();
        return None;
    }

    if type_ == IType::Dir {
        dp_guard.nlink += 1; // for ".."
        dp_guard.update();
    }

    drop(ip_guard);
    drop(dp_guard);
    Some(ip)
}

// Paths.

// A path slice (akin to str).
#[repr(transparent)]
pub struct Path {
    inner: str,
}

impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl Path {
    pub fn new<S: AsRef<str> + ?Sized>(s: &S) -> &Path {
        unsafe { &*(s.as_ref() as *const str as *const Path) }
    }

    // The final path component, for process names.
    pub fn file_name(&self) -> &str {
        let trimmed = self.inner.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, file_name)) => file_name,
            None => trimmed,
        }
    }

    // Split off the next path element: returns the element and
    // the rest of the path with leading slashes skipped.
    // Elements longer than DIRSIZ bytes are truncated.
    //
    // Examples:
    //   skip_elem("a/bb/c") == (Some("a"), Some("bb/c"))
    //   skip_elem("///a//bb") == (Some("a"), Some("bb"))
    //   skip_elem("a") == (Some("a"), None)
    //   skip_elem("") == skip_elem("////") == (None, None)
    pub fn skip_elem(&self) -> (Option<&str>, Option<&Path>) {
        let s = self.inner.trim_start_matches('/');
        if s.is_empty() {
            return (None, None);
        }

        let (mut name, rest) = match s.split_once('/') {
            Some((name, rest)) => (name, rest.trim_start_matches('/')),
            None => (s, ""),
        };

        if name.len() > DIRSIZ {
            let mut end = DIRSIZ;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name = &name[..end];
        }

        if rest.is_empty() {
            (Some(name), None)
        } else {
            (Some(name), Some(Path::new(rest)))
        }
    }

    // Look up and return the inode for this path name.
    // If parent is true, return the inode for the parent
    // directory and the final path element.
    // Must be called inside a transaction, since dropping the
    // intermediate Inode references may free them.
    #[cfg(target_os = "none")]
    fn namex(&self, parent: bool) -> Option<(&str, Inode)> {
        let mut ip = if self.inner.starts_with('/') {
            ITABLE.get(ROOTDEV, ROOTINO)
        } else {
            CPUS.my_proc()
                .unwrap()
                .data()
                .cwd
                .as_ref()
                .unwrap()
                .dup()
        };

        let mut path = self;
        loop {
            let (name, rest) = path.skip_elem();
            let name = match name {
                Some(name) => name,
                None => {
                    // ran out of elements: "/", "" or all slashes.
                    if parent {
                        return None;
                    }
                    return Some(("", ip));
                }
            };

            let mut guard = ip.lock();
            if guard.itype() != IType::Dir {
                return None;
            }

            if parent && rest.is_none() {
                // Stop one level early, return the parent.
                drop(guard);
                return Some((name, ip));
            }

            let next = guard.dirlookup(name, None)?;
            drop(guard);

            match rest {
                Some(rest) => {
                    ip = next;
                    path = rest;
                }
                None => return Some((name, next)),
            }
        }
    }

    #[cfg(target_os = "none")]
    pub fn namei(&self) -> Option<(&str, Inode)> {
        self.namex(false)
    }

    #[cfg(target_os = "none")]
    pub fn nameiparent(&self) -> Option<(&str, Inode)> {
        self.namex(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(size_of::<DInode>(), 64);
        assert_eq!(IPB, 16);
        assert_eq!(size_of::<DirEnt>(), 16);
        assert_eq!(NINDIRECT, 256);
        assert_eq!(MAXFILE, 268);
        assert!(size_of::<SuperBlock>() <= BSIZE);
    }

    #[test]
    fn superblock_geometry() {
        let sb = SuperBlock {
            magic: FSMAGIC,
            size: 2000,
            nblocks: 1900,
            ninodes: 200,
            nlog: 31,
            logstart: 2,
            inodestart: 33,
            bmapstart: 46,
        };
        // 16 inodes per block
        assert_eq!(sb.iblock(0), 33);
        assert_eq!(sb.iblock(15), 33);
        assert_eq!(sb.iblock(16), 34);
        // 8192 bitmap bits per block
        assert_eq!(sb.bblock(0), 46);
        assert_eq!(sb.bblock(8191), 46);
        assert_eq!(sb.bblock(8192), 47);
    }

    #[test]
    fn skip_elem_strips_repeated_slashes() {
        let (name, rest) = Path::new("///a//bb").skip_elem();
        assert_eq!(name, Some("a"));
        assert_eq!(rest.map(|p| &p.inner), Some("bb"));
    }

    #[test]
    fn skip_elem_single_component() {
        let (name, rest) = Path::new("a").skip_elem();
        assert_eq!(name, Some("a"));
        assert!(rest.is_none());
    }

    #[test]
    fn skip_elem_empty_and_all_slash() {
        assert!(matches!(Path::new("").skip_elem(), (None, None)));
        assert!(matches!(Path::new("////").skip_elem(), (None, None)));
    }

    #[test]
    fn skip_elem_truncates_long_names() {
        let (name, rest) = Path::new("abcdefghijklmnop/x").skip_elem();
        assert_eq!(name, Some("abcdefghijklmn")); // 14 bytes
        assert_eq!(rest.map(|p| &p.inner), Some("x"));
    }

    #[test]
    fn skip_elem_walks_a_whole_path() {
        let mut path = Path::new("/usr//bin/ls");
        let mut names = std::vec::Vec::new();
        loop {
            match path.skip_elem() {
                (Some(name), Some(rest)) => {
                    names.push(name);
                    path = rest;
                }
                (Some(name), None) => {
                    names.push(name);
                    break;
                }
                _ => break,
            }
        }
        assert_eq!(names, ["usr", "bin", "ls"]);
    }

    #[test]
    fn dirent_names_pad_and_cap() {
        let mut de = DirEnt::default();
        de.set_name("init");
        assert_eq!(de.name(), "init");
        assert_eq!(&de.name[4..], &[0; 10]);

        // exactly DIRSIZ bytes: no NUL terminator.
        de.set_name("abcdefghijklmn");
        assert_eq!(de.name(), "abcdefghijklmn");

        // longer names are capped at DIRSIZ bytes.
        de.set_name("abcdefghijklmnop");
        assert_eq!(de.name(), "abcdefghijklmn");
    }

    #[test]
    fn file_name_is_last_component() {
        assert_eq!(Path::new("/a/bb/ccc").file_name(), "ccc");
        assert_eq!(Path::new("ccc").file_name(), "ccc");
        assert_eq!(Path::new("/a/bb/").file_name(), "bb");
        assert_eq!(Path::new("/").file_name(), "");
    }
}
