//
// driver for qemu's virtio disk device.
// uses qemu's mmio interface to virtio.
//
// qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0
//

use crate::{
    bio::Data,
    fs::BSIZE,
    memlayout::VIRTIO0,
    proc::{Process, CPUS, PROCS},
    spinlock::Mutex,
    vm::{Page, PageAllocator},
};
use bitflags::bitflags;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

pub static DISK: Mutex<Disk> = Mutex::new(Disk::new(), "virtio_disk");

// this many virtio descriptors.
// must be a power of two.
const NUM: usize = 8;

// Memory mapped IO registers, from qemu virtio_mmio.h
#[repr(usize)]
enum VirtioMMIO {
    // 0x74726976
    MagicValue = 0x000,
    // version; should be 2
    Version = 0x004,
    // device type; 1 is net, 2 is disk
    DeviceId = 0x008,
    // 0x554d4551
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    // select queue, write-only
    QueueSel = 0x030,
    // max size of current queue, read-only
    QueueNumMax = 0x034,
    // size of current queue, write-only
    QueueNum = 0x038,
    // ready bit
    QueueReady = 0x044,
    // write-only
    QueueNotify = 0x050,
    // read-only
    InterruptStatus = 0x060,
    // write-only
    InterruptAck = 0x064,
    // read/write
    Status = 0x070,
    // physical address for descriptor table, write-only
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    // physical address for available ring, write-only
    DriverDescLow = 0x090,
    DriverDescHigh = 0x094,
    // physical address for used ring, write-only
    DeviceDescLow = 0x0a0,
    DeviceDescHigh = 0x0a4,
}

impl VirtioMMIO {
    fn read(self) -> u32 {
        unsafe { ((VIRTIO0 + self as usize) as *const u32).read_volatile() }
    }
    unsafe fn write(self, data: u32) {
        ((VIRTIO0 + self as usize) as *mut u32).write_volatile(data);
    }
}

bitflags! {
    // status register bits, from qemu virtio_config.h
    struct VirtioStatus: u32 {
        const ACKNOWLEDGE = 0b0001;
        const DRIVER = 0b0010;
        const DRIVER_OK = 0b0100;
        const FEATURES_OK = 0b1000;
    }
}

bitflags! {
    // device feature bits
    struct VirtioFeatures: u32 {
        // Disk is read-only
        const BLK_F_RO = 1 << 5;
        // Supports scsi command passthru
        const BLK_F_SCSI = 1 << 7;
        // Writeback mode available in config
        const BLK_F_CONFIG_WCE = 1 << 11;
        // support more than one vq
        const BLK_F_MQ = 1 << 12;
        const F_ANY_LAYOUT = 1 << 27;
        const RING_F_INDIRECT_DESC = 1 << 28;
        const RING_F_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    struct VirtqDescFlags: u16 {
        const FREED = 0b00;
        // chained with another descriptor
        const NEXT = 0b01;
        // device writes (vs read)
        const WRITE = 0b10;
    }
}

// a single descriptor, from the spec.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: VirtqDescFlags,
    next: u16,
}

// the (entire) avail ring, from the spec.
#[derive(Debug)]
#[repr(C)]
struct VirtqAvail {
    flags: u16,       // always zero
    idx: u16,         // driver will write ring[idx] next
    ring: [u16; NUM], // descriptor numbers of chain heads
    unused: u16,
}

// one entry in the "used" ring, with which the
// device tells the driver about completed requests.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct VirtqUsedElem {
    id: u32, // index of start of completed descriptor chain
    len: u32,
}

#[derive(Debug)]
#[repr(C)]
struct VirtqUsed {
    flags: u16, // always zero
    idx: u16,   // device increments when it adds a ring[] entry
    ring: [VirtqUsedElem; NUM],
}

// these are specific to virtio block devices, e.g. disks,
// described in Section 5.2 of the spec.

const VIRTIO_BLK_T_IN: u32 = 0; // read the disk
const VIRTIO_BLK_T_OUT: u32 = 1; // write the disk

// the format of the first descriptor in a disk request.
// to be followed by two more descriptors containing
// the block, and a one-byte status.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct VirtioBlkReq {
    type_: u32, // VIRTIO_BLK_T_IN or ..._OUT
    reserved: u32,
    sector: u64,
}

impl VirtioBlkReq {
    const fn new() -> Self {
        Self {
            type_: 0,
            reserved: 0,
            sector: 0,
        }
    }
}

// track info about in-flight operations,
// for use when the completion interrupt arrives.
// indexed by first descriptor index of chain.
#[derive(Clone, Copy)]
struct Info {
    data: Option<NonNull<Data>>,
    status: u8,
}

impl Info {
    const fn new() -> Self {
        Self {
            data: None,
            status: 0,
        }
    }
}

pub struct Disk {
    // a set (not a ring) of DMA descriptors, with which the
    // driver tells the device where to read and write individual
    // disk operations. there are NUM descriptors.
    // most commands consist of a "chain" (a linked list) of a
    // couple of these descriptors. allocated as one page.
    desc: *mut [VirtqDesc; NUM],

    // a ring in which the driver writes descriptor numbers
    // that the driver would like the device to process. it only
    // includes the head descriptor of each chain. the ring has
    // NUM elements. one page.
    avail: *mut VirtqAvail,

    // a ring in which the device writes descriptor numbers that
    // the device has finished processing (just the head of each
    // chain). there are NUM used ring entries. one page.
    used: *mut VirtqUsed,

    // our own book-keeping.
    free: [bool; NUM], // is a descriptor free?
    used_idx: u16,     // we've looked this far in used[2..NUM].

    info: [Info; NUM],

    // disk command headers.
    // one-for-one with descriptors, for convenience.
    ops: [VirtioBlkReq; NUM],
}
unsafe impl Send for Disk {}

impl Disk {
    const fn new() -> Self {
        Self {
            desc: ptr::null_mut(),
            avail: ptr::null_mut(),
            used: ptr::null_mut(),
            free: [false; NUM],
            used_idx: 0,
            info: [Info::new(); NUM],
            ops: [VirtioBlkReq::new(); NUM],
        }
    }

    unsafe fn init(&mut self) {
        if VirtioMMIO::MagicValue.read() != 0x74726976
            || VirtioMMIO::Version.read() != 2
            || VirtioMMIO::DeviceId.read() != 2
            || VirtioMMIO::VendorId.read() != 0x554d4551
        {
            panic!("could not find virtio disk");
        }

        let mut status = VirtioStatus::empty();

        // reset device
        VirtioMMIO::Status.write(status.bits());

        // set ACKNOWLEDGE status bit
        status.insert(VirtioStatus::ACKNOWLEDGE);
        VirtioMMIO::Status.write(status.bits());

        // set DRIVER status bit
        status.insert(VirtioStatus::DRIVER);
        VirtioMMIO::Status.write(status.bits());

        // negotiate features
        let features = VirtioFeatures::from_bits_truncate(VirtioMMIO::DeviceFeatures.read())
            - (VirtioFeatures::BLK_F_RO
                | VirtioFeatures::BLK_F_SCSI
                | VirtioFeatures::BLK_F_CONFIG_WCE
                | VirtioFeatures::BLK_F_MQ
                | VirtioFeatures::F_ANY_LAYOUT
                | VirtioFeatures::RING_F_EVENT_IDX
                | VirtioFeatures::RING_F_INDIRECT_DESC);
        VirtioMMIO::DriverFeatures.write(features.bits());

        // tell device that feature negotiation is complete.
        status.insert(VirtioStatus::FEATURES_OK);
        VirtioMMIO::Status.write(status.bits());

        // re-read status to ensure FEATURES_OK is set.
        status = VirtioStatus::from_bits_truncate(VirtioMMIO::Status.read());
        assert!(
            status.contains(VirtioStatus::FEATURES_OK),
            "virtio disk FEATURES_OK unset"
        );

        // initialize queue 0.
        VirtioMMIO::QueueSel.write(0);

        // ensure queue 0 is not in use.
        assert!(
            VirtioMMIO::QueueReady.read() == 0,
            "virtio disk should not be ready"
        );

        // check maximum queue size.
        let max = VirtioMMIO::QueueNumMax.read();
        assert!(max != 0, "virtio disk has no queue 0");
        assert!(max >= NUM as u32, "virtio disk max queue too short");

        // allocate and zero queue memory: a page for each ring.
        self.desc = Page::try_new_zeroed().expect("virtio_disk_init: desc") as *mut _;
        self.avail = Page::try_new_zeroed().expect("virtio_disk_init: avail") as *mut _;
        self.used = Page::try_new_zeroed().expect("virtio_disk_init: used") as *mut _;

        // set queue size.
        VirtioMMIO::QueueNum.write(NUM as u32);

        // write physical addresses.
        VirtioMMIO::QueueDescLow.write(self.desc as usize as u32);
        VirtioMMIO::QueueDescHigh.write(((self.desc as usize) >> 32) as u32);
        VirtioMMIO::DriverDescLow.write(self.avail as usize as u32);
        VirtioMMIO::DriverDescHigh.write(((self.avail as usize) >> 32) as u32);
        VirtioMMIO::DeviceDescLow.write(self.used as usize as u32);
        VirtioMMIO::DeviceDescHigh.write(((self.used as usize) >> 32) as u32);

        // queue is ready.
        VirtioMMIO::QueueReady.write(1);

        // all NUM descriptors start out unused.
        self.free.iter_mut().for_each(|f| *f = true);

        // tell device we're completely ready.
        status.insert(VirtioStatus::DRIVER_OK);
        VirtioMMIO::Status.write(status.bits());

        // plic.rs and trap.rs arrange for interrupts from VIRTIO0_IRQ.
    }

    // find a free descriptor, mark it non-free, return its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        let i = self.free.iter().position(|free| *free)?;
        self.free[i] = false;
        Some(i)
    }

    // mark a descriptor as free.
    fn free_desc(&mut self, i: usize) {
        assert!(i < NUM, "free_desc: out of range");
        assert!(!self.free[i], "free_desc: already free");
        unsafe {
            (*self.desc)[i] = VirtqDesc {
                addr: 0,
                len: 0,
                flags: VirtqDescFlags::FREED,
                next: 0,
            };
        }
        self.free[i] = true;
        PROCS.wakeup(&self.free[0] as *const _ as usize);
    }

    // free a chain of descriptors.
    fn free_chain(&mut self, mut i: usize) {
        loop {
            let (flags, next) = unsafe {
                let desc = &(*self.desc)[i];
                (desc.flags, desc.next)
            };
            self.free_desc(i);
            if flags.contains(VirtqDescFlags::NEXT) {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    // allocate three descriptors (they need not be contiguous).
    // disk transfers always use three descriptors.
    fn alloc3_desc(&mut self, idx: &mut [usize; 3]) -> Result<(), ()> {
        for i in 0..3 {
            match self.alloc_desc() {
                Some(ix) => idx[i] = ix,
                None => {
                    for j in 0..i {
                        self.free_desc(idx[j]);
                    }
                    return Err(());
                }
            }
        }
        Ok(())
    }
}

impl Mutex<Disk> {
    // Issue a read or write of the locked buffer's block and wait
    // for the completion interrupt. The caller keeps the buffer's
    // sleep-lock for the whole request; the "disk owns" flag and
    // the wakeup channel live in the buffer itself.
    pub fn rw(
        &self,
        mut b: crate::sleeplock::SleepLockGuard<'static, Data>,
        write: bool,
    ) -> crate::sleeplock::SleepLockGuard<'static, Data> {
        let sector = b.blockno() as u64 * (BSIZE / 512) as u64;

        let p = CPUS.my_proc().unwrap();
        let mut disk = self.lock();

        // the spec's Section 5.2 says that legacy block operations
        // use three descriptors: one for type/reserved/sector, one
        // for the data, one for a 1-byte status result.

        // allocate the three descriptors.
        let mut idx = [0usize; 3];
        loop {
            if disk.alloc3_desc(&mut idx).is_ok() {
                break;
            }
            disk = p.sleep(&disk.free[0] as *const _ as usize, disk);
        }

        // format the three descriptors.
        // qemu's virtio-blk.c reads them.

        let buf0_addr = {
            let buf0 = &mut disk.ops[idx[0]];
            buf0.type_ = if write {
                VIRTIO_BLK_T_OUT // write the disk
            } else {
                VIRTIO_BLK_T_IN // read the disk
            };
            buf0.reserved = 0;
            buf0.sector = sector;
            buf0 as *mut VirtioBlkReq as u64
        };

        disk.info[idx[0]].status = 0xff; // device writes 0 on success
        let status_addr = &mut disk.info[idx[0]].status as *mut u8 as u64;

        unsafe {
            let desc = &mut *disk.desc;
            desc[idx[0]] = VirtqDesc {
                addr: buf0_addr,
                len: size_of::<VirtioBlkReq>() as u32,
                flags: VirtqDescFlags::NEXT,
                next: idx[1] as u16,
            };
            desc[idx[1]] = VirtqDesc {
                addr: b.data.as_ptr() as u64,
                len: BSIZE as u32,
                flags: if write {
                    VirtqDescFlags::NEXT // device reads b.data
                } else {
                    VirtqDescFlags::NEXT | VirtqDescFlags::WRITE // device writes b.data
                },
                next: idx[2] as u16,
            };
            desc[idx[2]] = VirtqDesc {
                addr: status_addr,
                len: 1,
                flags: VirtqDescFlags::WRITE, // device writes the status
                next: 0,
            };
        }

        // record the in-flight buffer for intr().
        b.disk = true; // the device owns the buffer now
        disk.info[idx[0]].data = NonNull::new(&mut *b as *mut Data);

        unsafe {
            let avail = &mut *disk.avail;

            // tell the device the first index in our chain of descriptors.
            avail.ring[avail.idx as usize % NUM] = idx[0] as u16;

            fence(Ordering::SeqCst);

            // tell the device another avail ring entry is available.
            avail.idx = avail.idx.wrapping_add(1); // not % NUM ...

            fence(Ordering::SeqCst);

            VirtioMMIO::QueueNotify.write(0); // value is queue number
        }

        // wait for intr() to say the request has finished.
        while b.disk {
            disk = p.sleep(&*b as *const Data as usize, disk);
        }

        disk.info[idx[0]].data = None;
        disk.free_chain(idx[0]);

        b
    }

    pub fn intr(&self) {
        let mut disk = self.lock();

        // the device won't raise another interrupt until we tell it
        // we've seen this interrupt, which the following line does.
        // this may race with the device writing new entries to
        // the "used" ring, in which case we may process the new
        // completion entries in this interrupt, and have nothing to
        // do in the next interrupt, which is harmless.
        let intr_stat = VirtioMMIO::InterruptStatus.read();
        unsafe {
            VirtioMMIO::InterruptAck.write(intr_stat & 0x3);
        }

        fence(Ordering::SeqCst);

        // the device increments used.idx when it
        // adds an entry to the used ring.
        loop {
            let used_idx = unsafe { ptr::addr_of!((*disk.used).idx).read_volatile() };
            if disk.used_idx == used_idx {
                break;
            }
            fence(Ordering::SeqCst);

            let id = unsafe {
                ptr::addr_of!((*disk.used).ring[disk.used_idx as usize % NUM]).read_volatile()
            }
            .id as usize;

            if disk.info[id].status != 0 {
                panic!("virtio_disk_intr status");
            }

            // disk is done with the buffer; tell the waiting process.
            let data = disk.info[id].data.expect("virtio_disk_intr: no buffer");
            unsafe { (*data.as_ptr()).disk = false };
            PROCS.wakeup(data.as_ptr() as usize);

            disk.used_idx = disk.used_idx.wrapping_add(1);
        }
    }
}

pub fn init() {
    unsafe {
        DISK.get_mut().init();
    }
}
