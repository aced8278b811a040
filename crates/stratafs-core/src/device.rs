//! Member device records and the device table.
//!
//! A [`Device`] exists for every slot the filesystem knows about, whether or
//! not a backing block device is attached. The record is created with its
//! reserve pools sized from the bucket count, attached and detached as the
//! device comes and goes, and freed only after it has been unpublished from
//! the [`DeviceTable`] and every lookup reference has drained.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultPoint};
use crate::refs::RefGate;
use crate::superblock::{Member, SbHandle};
use crate::types::{DevIdx, DevMask, MemberState, MAX_MEMBERS};

/// Btree node writes that may be in flight at once.
pub const BTREE_NODE_RESERVE: u64 = 28;

/// Sizes of the free-bucket reserves of one device, in buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveSizes {
    /// Data-mover reserve.
    pub movinggc: u64,
    /// General-purpose reserve.
    pub none: u64,
    /// In-flight free list; always smaller than `movinggc`.
    pub free_inc: u64,
    /// Scratch heap for data-mover candidate selection.
    pub heap: u64,
    /// Btree node reserve.
    pub btree: u64,
}

impl ReserveSizes {
    /// Derives reserve sizes from the device geometry.
    pub fn compute(nbuckets: u64, bucket_size: u32, btree_node_size: u32) -> Self {
        let movinggc = (nbuckets >> 7).max(16);
        let none = (nbuckets >> 9).max(4);
        let nodes_per_bucket = (bucket_size / btree_node_size.max(1)).max(1) as u64;
        Self {
            movinggc,
            none,
            free_inc: movinggc / 2,
            heap: movinggc * 8,
            btree: BTREE_NODE_RESERVE.div_ceil(nodes_per_bucket),
        }
    }

    /// Buckets held back from general allocation.
    pub fn total(&self) -> u64 {
        self.movinggc + self.none + self.btree
    }
}

/// Per-bucket metadata.
#[derive(Debug)]
pub struct BucketArrays {
    /// Current generation of every bucket.
    pub gens: Vec<u8>,
    /// Oldest generation still referenced.
    pub oldest_gens: Vec<u8>,
    /// One bit per bucket, set when the bucket's metadata changed.
    pub dirty: Vec<u64>,
}

fn try_alloc<T: Clone>(len: usize, fill: T, what: &'static str) -> FsResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| FsError::OutOfMemory { what })?;
    v.resize(len, fill);
    Ok(v)
}

impl BucketArrays {
    /// Allocates arrays for `nbuckets` buckets, failing cleanly on OOM.
    pub fn alloc(nbuckets: u64) -> FsResult<Self> {
        let n = usize::try_from(nbuckets).map_err(|_| FsError::OutOfMemory {
            what: "bucket arrays",
        })?;
        let gens = try_alloc(n, 0u8, "bucket generations")?;
        let oldest_gens = try_alloc(n, 0u8, "oldest bucket generations")?;
        let dirty = try_alloc(n.div_ceil(64), 0u64, "bucket dirty bitmap")?;
        Ok(Self {
            gens,
            oldest_gens,
            dirty,
        })
    }

    /// Number of buckets covered.
    pub fn len(&self) -> usize {
        self.gens.len()
    }

    /// Returns whether no buckets are covered.
    pub fn is_empty(&self) -> bool {
        self.gens.is_empty()
    }
}

/// Runtime record of one member device.
#[derive(Debug)]
pub struct Device {
    idx: DevIdx,
    uuid: Uuid,
    mi: Mutex<Member>,
    reserves: ReserveSizes,
    buckets: BucketArrays,
    disk_sb: Mutex<Option<SbHandle>>,
    io_ref: RefGate,
    dev_ref: RefGate,
    allocator_running: AtomicBool,
    mover_running: AtomicBool,
    in_pool: AtomicBool,
}

impl Device {
    /// Allocates the record for slot `idx`. The record starts offline.
    pub fn alloc(
        idx: DevIdx,
        member: &Member,
        btree_node_size: u32,
        faults: &FaultInjector,
    ) -> FsResult<Arc<Self>> {
        faults.check(FaultPoint::DevAlloc)?;

        let reserves = ReserveSizes::compute(member.nbuckets, member.bucket_size, btree_node_size);
        let buckets = BucketArrays::alloc(member.nbuckets)?;

        debug!(
            dev = %idx,
            nbuckets = member.nbuckets,
            movinggc = reserves.movinggc,
            btree = reserves.btree,
            "allocated device record"
        );

        Ok(Arc::new(Self {
            idx,
            uuid: member.uuid,
            mi: Mutex::new(member.clone()),
            reserves,
            buckets,
            disk_sb: Mutex::new(None),
            io_ref: RefGate::new_dead(),
            dev_ref: RefGate::new_live(),
            allocator_running: AtomicBool::new(false),
            mover_running: AtomicBool::new(false),
            in_pool: AtomicBool::new(false),
        }))
    }

    /// Slot index.
    pub fn idx(&self) -> DevIdx {
        self.idx
    }

    /// Device UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Copy of the member metadata.
    pub fn member(&self) -> Member {
        self.mi.lock().clone()
    }

    /// Replaces the member metadata.
    pub fn set_member(&self, member: Member) {
        *self.mi.lock() = member;
    }

    /// Membership state.
    pub fn state(&self) -> MemberState {
        self.mi.lock().state
    }

    /// Sets the membership state in memory.
    pub fn set_state(&self, state: MemberState) {
        self.mi.lock().state = state;
    }

    /// Reserve sizes.
    pub fn reserves(&self) -> &ReserveSizes {
        &self.reserves
    }

    /// Per-bucket metadata.
    pub fn buckets(&self) -> &BucketArrays {
        &self.buckets
    }

    /// Usable capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        let mi = self.mi.lock();
        mi.nbuckets.saturating_sub(mi.first_bucket as u64) * mi.bucket_size as u64
    }

    /// Returns whether a backing device is attached.
    pub fn is_online(&self) -> bool {
        self.disk_sb.lock().is_some()
    }

    /// Path of the attached backing device.
    pub fn path(&self) -> Option<PathBuf> {
        self.disk_sb.lock().as_ref().map(|h| h.path.clone())
    }

    /// Attaches a backing device and opens the I/O gate.
    pub fn attach(&self, handle: SbHandle) -> FsResult<()> {
        let mut disk_sb = self.disk_sb.lock();
        if disk_sb.is_some() {
            return Err(FsError::AlreadyOnline { dev: self.idx });
        }
        info!(dev = %self.idx, path = %handle.path.display(), "device online");
        *disk_sb = Some(handle);
        self.io_ref.reinit();
        Ok(())
    }

    /// Closes the I/O gate, waits for in-flight I/O, and detaches the
    /// backing device.
    pub fn detach(&self) -> Option<SbHandle> {
        self.io_ref.kill();
        self.io_ref.wait_drained();
        let handle = self.disk_sb.lock().take();
        if let Some(h) = &handle {
            info!(dev = %self.idx, path = %h.path.display(), "device offline");
        }
        handle
    }

    /// Takes an I/O reference; fails if the device is offline or going away.
    pub fn io_get(self: &Arc<Self>) -> Option<DevIo> {
        if self.io_ref.try_get() {
            Some(DevIo { dev: self.clone() })
        } else {
            None
        }
    }

    /// Outstanding I/O references.
    pub fn io_refs(&self) -> u64 {
        self.io_ref.count()
    }

    /// Returns whether the allocator worker is running.
    pub fn allocator_running(&self) -> bool {
        self.allocator_running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_allocator_running(&self, running: bool) {
        self.allocator_running.store(running, Ordering::SeqCst);
    }

    /// Returns whether the data-mover worker is running.
    pub fn mover_running(&self) -> bool {
        self.mover_running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_mover_running(&self, running: bool) {
        self.mover_running.store(running, Ordering::SeqCst);
    }

    /// Returns whether the reserves are in the shared allocation pool.
    pub fn in_pool(&self) -> bool {
        self.in_pool.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_pool(&self, in_pool: bool) {
        self.in_pool.store(in_pool, Ordering::SeqCst);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(dev = %self.idx, "freeing device record");
    }
}

/// An in-flight I/O reference to a device.
#[derive(Debug)]
pub struct DevIo {
    dev: Arc<Device>,
}

impl DevIo {
    /// The device.
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }
}

impl Drop for DevIo {
    fn drop(&mut self) {
        self.dev.io_ref.put();
    }
}

/// A lookup reference obtained from the device table.
#[derive(Debug)]
pub struct DevRef {
    dev: Arc<Device>,
}

impl std::ops::Deref for DevRef {
    type Target = Arc<Device>;

    fn deref(&self) -> &Arc<Device> {
        &self.dev
    }
}

impl Drop for DevRef {
    fn drop(&mut self) {
        self.dev.dev_ref.put();
    }
}

/// Fixed-size slot array of device records.
#[derive(Debug)]
pub struct DeviceTable {
    slots: RwLock<Vec<Option<Arc<Device>>>>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    /// A table with every slot empty.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; MAX_MEMBERS]),
        }
    }

    /// Record in slot `idx`.
    pub fn get(&self, idx: DevIdx) -> Option<Arc<Device>> {
        self.slots.read().get(idx.as_usize()).and_then(|s| s.clone())
    }

    /// Takes a lookup reference to the record in slot `idx`.
    pub fn get_ref(&self, idx: DevIdx) -> Option<DevRef> {
        let slots = self.slots.read();
        let dev = slots.get(idx.as_usize())?.as_ref()?;
        if dev.dev_ref.try_get() {
            Some(DevRef { dev: dev.clone() })
        } else {
            None
        }
    }

    /// Publishes a record in its slot.
    pub fn publish(&self, dev: Arc<Device>) -> FsResult<()> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(dev.idx().as_usize())
            .ok_or(FsError::NoSlot)?;
        if slot.is_some() {
            return Err(FsError::AlreadyOnline { dev: dev.idx() });
        }
        *slot = Some(dev);
        Ok(())
    }

    /// Clears slot `idx` and waits for every lookup reference to drain.
    pub fn unpublish(&self, idx: DevIdx) -> Option<Arc<Device>> {
        let dev = self.slots.write().get_mut(idx.as_usize())?.take()?;
        dev.dev_ref.kill();
        dev.dev_ref.wait_drained();
        Some(dev)
    }

    /// Every published record, lowest slot first.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Published records whose membership state is RW.
    pub fn rw_members(&self) -> Vec<Arc<Device>> {
        self.snapshot()
            .into_iter()
            .filter(|d| d.state() == MemberState::Rw)
            .collect()
    }

    /// Published records with a backing device attached.
    pub fn online(&self) -> Vec<Arc<Device>> {
        self.snapshot()
            .into_iter()
            .filter(|d| d.is_online())
            .collect()
    }

    /// Slots holding a record.
    pub fn occupied(&self) -> DevMask {
        self.snapshot().iter().map(|d| d.idx()).collect()
    }

    /// Slots whose record is online.
    pub fn online_mask(&self) -> DevMask {
        self.online().iter().map(|d| d.idx()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::{Superblock, SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION};
    use std::thread;
    use std::time::Duration;

    fn member(nbuckets: u64) -> Member {
        Member {
            uuid: Uuid::new_v4(),
            nbuckets,
            first_bucket: 1,
            bucket_size: 256 * 1024,
            ..Member::default()
        }
    }

    fn handle(path: &str) -> SbHandle {
        SbHandle {
            path: PathBuf::from(path),
            sb: Superblock {
                magic: SUPERBLOCK_MAGIC,
                version: SUPERBLOCK_VERSION,
                seq: 1,
                uuid: Uuid::new_v4(),
                user_uuid: Uuid::new_v4(),
                label: String::new(),
                dev_idx: 0,
                nr_devices: 1,
                block_size: 4096,
                btree_node_size: 64 * 1024,
                initialized: false,
                clean: false,
                options: Default::default(),
                members: vec![member(16)],
                replicas: Default::default(),
                checksum: 0,
            },
        }
    }

    #[test]
    fn test_reserve_sizes_floors() {
        let r = ReserveSizes::compute(100, 256 * 1024, 64 * 1024);
        assert_eq!(r.movinggc, 16);
        assert_eq!(r.none, 4);
        assert_eq!(r.free_inc, 8);
        assert_eq!(r.heap, 128);
        assert_eq!(r.btree, 7);
        assert!(r.free_inc < r.movinggc);
    }

    #[test]
    fn test_reserve_sizes_proportional() {
        let r = ReserveSizes::compute(1 << 20, 64 * 1024, 64 * 1024);
        assert_eq!(r.movinggc, (1 << 20) / 128);
        assert_eq!(r.none, (1 << 20) / 512);
        assert_eq!(r.btree, BTREE_NODE_RESERVE);
        assert_eq!(r.total(), r.movinggc + r.none + r.btree);
    }

    #[test]
    fn test_alloc_respects_fault() {
        let faults = FaultInjector::new();
        faults.arm(FaultPoint::DevAlloc);
        let err = Device::alloc(DevIdx(0), &member(64), 64 * 1024, &faults).unwrap_err();
        assert!(matches!(err, FsError::Fault { .. }));
    }

    #[test]
    fn test_alloc_sizes_bucket_arrays() {
        let dev = Device::alloc(DevIdx(2), &member(130), 64 * 1024, &FaultInjector::new()).unwrap();
        assert_eq!(dev.buckets().len(), 130);
        assert_eq!(dev.buckets().dirty.len(), 3);
        assert!(!dev.is_online());
        assert_eq!(dev.capacity_bytes(), 129 * 256 * 1024);
    }

    #[test]
    fn test_attach_twice_is_rejected() {
        let dev = Device::alloc(DevIdx(0), &member(64), 64 * 1024, &FaultInjector::new()).unwrap();
        assert!(dev.io_get().is_none());

        dev.attach(handle("/dev/a")).unwrap();
        assert!(dev.is_online());
        assert!(matches!(
            dev.attach(handle("/dev/b")),
            Err(FsError::AlreadyOnline { .. })
        ));
        assert_eq!(dev.path().unwrap(), PathBuf::from("/dev/a"));

        let io = dev.io_get().unwrap();
        assert_eq!(dev.io_refs(), 1);
        drop(io);
        assert!(dev.detach().is_some());
        assert!(dev.io_get().is_none());
    }

    #[test]
    fn test_detach_waits_for_io() {
        let dev = Device::alloc(DevIdx(0), &member(64), 64 * 1024, &FaultInjector::new()).unwrap();
        dev.attach(handle("/dev/a")).unwrap();
        let io = dev.io_get().unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(io);
        });
        assert!(dev.detach().is_some());
        assert_eq!(dev.io_refs(), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_table_publish_unpublish() {
        let table = DeviceTable::new();
        let faults = FaultInjector::new();
        let d0 = Device::alloc(DevIdx(0), &member(64), 64 * 1024, &faults).unwrap();
        let d3 = Device::alloc(DevIdx(3), &member(64), 64 * 1024, &faults).unwrap();
        table.publish(d0.clone()).unwrap();
        table.publish(d3).unwrap();
        assert!(table.publish(d0).is_err());

        assert_eq!(table.occupied().0, 0b1001);
        assert!(table.online_mask().is_empty());

        let r = table.get_ref(DevIdx(3)).unwrap();
        assert_eq!(r.idx(), DevIdx(3));
        drop(r);

        let removed = table.unpublish(DevIdx(3)).unwrap();
        assert_eq!(removed.idx(), DevIdx(3));
        assert!(table.get(DevIdx(3)).is_none());
        assert!(table.unpublish(DevIdx(3)).is_none());
        assert_eq!(table.occupied().0, 0b1);
    }
}
