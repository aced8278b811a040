//! In-memory collaborators for exercising the lifecycle layer.
//!
//! Every collaborator of one [`MockEnv`] shares a [`MockStore`]. The store
//! outlives filesystem instances, so a test can stop an instance, reopen
//! the same devices and observe what the previous instance left behind.
//! Allocator, data-mover, mark-and-sweep and placement workers are real
//! [`Worker`] tasks on the instance runtime.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::device::Device;
use crate::error::{FsError, FsResult, FsckError};
use crate::fault::FaultInjector;
use crate::fs::Filesystem;
use crate::options::OptionSet;
use crate::subsys::{
    Allocator, BtreeStore, DataMover, Fsck, Journal, JournalEntry, JournalReplayList, MarkSweep,
    SubsystemFactory, Subsystems, TierPlacement,
};
use crate::superblock::{
    format, DeviceGeometry, FormatSpec, MemSuperblockIo, Superblock, SuperblockIo,
};
use crate::types::{DataMask, DataType, DevIdx, DevMask, RootPtr, TreeId};
use crate::worker::Worker;

/// Buckets per device created by [`MockEnv::format_sbs`].
pub const MOCK_NBUCKETS: u64 = 1024;
/// Bucket size of devices created by [`MockEnv::format_sbs`].
pub const MOCK_BUCKET_SIZE: u32 = 256 * 1024;

/// A collaborator call, recorded in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Journal read from disk.
    JournalRead,
    /// Journal entry replayed.
    JournalReplayed(u64),
    /// Replay finished.
    ReplayComplete,
    /// Journal live writes started.
    JournalStarted,
    /// Journal flushed.
    JournalFlushed,
    /// Journal halted.
    JournalHalted,
    /// Journal machinery stopped.
    JournalStopped,
    /// Checkpoint entry written.
    JournalMeta(u64),
    /// Initial mark-and-sweep pass.
    GcRun,
    /// Background mark-and-sweep started.
    GcStarted,
    /// Background mark-and-sweep stopped.
    GcStopped,
    /// Allocation info read.
    AllocInfoRead,
    /// Allocator started.
    AllocatorStarted(DevIdx),
    /// Allocator stopped.
    AllocatorStopped(DevIdx),
    /// Reserves added to the allocation pool.
    PoolAdded(DevIdx),
    /// Reserves removed from the allocation pool.
    PoolRemoved(DevIdx),
    /// Journal buckets set aside.
    JournalBuckets(DevIdx),
    /// Data mover started.
    MoverStarted(DevIdx),
    /// Data mover stopped.
    MoverStopped(DevIdx),
    /// Extent pointers flagged bad.
    DataFlaggedBad(DevIdx),
    /// Tier placement started.
    TieringStarted,
    /// Tier placement stopped.
    TieringStopped,
    /// Consistency check run.
    FsckRun {
        /// Whether repairs were allowed.
        auto_fix: bool,
    },
    /// Btree root read.
    RootRead(TreeId),
    /// Btree root allocated.
    RootAllocated(TreeId),
    /// Root directory created.
    RootInodeCreated,
}

/// Failures to inject into the mock collaborators.
#[derive(Debug, Clone, Default)]
pub struct MockFaults {
    /// Allocator start fails for this device.
    pub allocator_start_fail_dev: Option<u8>,
    /// Data-mover start fails for this device.
    pub mover_start_fail_dev: Option<u8>,
    /// Background mark-and-sweep fails to start.
    pub gc_start_fail: bool,
    /// The initial mark-and-sweep pass fails.
    pub gc_run_fail: bool,
    /// Tier placement fails to start.
    pub tiering_start_fail: bool,
    /// Reading the journal fails.
    pub journal_read_fail: bool,
    /// Replay fails on reaching this sequence number.
    pub replay_fail_at: Option<u64>,
    /// Setting aside journal buckets fails.
    pub journal_buckets_fail: bool,
    /// Result returned by fsck.
    pub fsck_result: Option<FsckError>,
}

#[derive(Debug, Default)]
struct StoreState {
    events: Vec<MockEvent>,
    faults: MockFaults,
    journal: Vec<JournalEntry>,
    /// Replayed btree contents: key to the sequence that last wrote it.
    keys: BTreeMap<u64, u64>,
    applied: Vec<(u64, u64)>,
    replayed: Vec<u64>,
    next_root: u64,
    root_inode: bool,
    journal_buckets: DevMask,
    data: HashMap<DevIdx, DataMask>,
    pinned: HashMap<DevIdx, DataMask>,
    rate_updates: u64,
}

#[derive(Debug, Default)]
struct Workers {
    allocators: HashMap<(Uuid, DevIdx), Worker>,
    movers: HashMap<(Uuid, DevIdx), Worker>,
    gc: HashMap<Uuid, Worker>,
    tiering: HashMap<Uuid, Worker>,
}

/// State shared by the mock collaborators of one environment.
#[derive(Debug, Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
    workers: Mutex<Workers>,
}

impl MockStore {
    fn record(&self, event: MockEvent) {
        self.state.lock().events.push(event);
    }

    fn faults(&self) -> MockFaults {
        self.state.lock().faults.clone()
    }

    /// Replaces the injected failures.
    pub fn set_faults(&self, faults: MockFaults) {
        self.state.lock().faults = faults;
    }

    /// Every recorded event, oldest first.
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Forgets recorded events.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    /// Running allocator workers, across every instance.
    pub fn running_allocators(&self) -> usize {
        self.workers
            .lock()
            .allocators
            .values()
            .filter(|w| w.is_running())
            .count()
    }

    /// Running data-mover workers, across every instance.
    pub fn running_movers(&self) -> usize {
        self.workers
            .lock()
            .movers
            .values()
            .filter(|w| w.is_running())
            .count()
    }

    /// Returns whether any journal has been halted.
    pub fn journal_halted(&self) -> bool {
        self.count(|e| matches!(e, MockEvent::JournalHalted)) > 0
    }

    /// Rate-controller ticks seen by tier placement.
    pub fn rate_updates(&self) -> u64 {
        self.state.lock().rate_updates
    }

    /// Returns whether the root directory has been created.
    pub fn root_inode_created(&self) -> bool {
        self.state.lock().root_inode
    }

    /// Returns whether journal buckets were set aside on `dev`.
    pub fn journal_buckets_allocated(&self, dev: DevIdx) -> bool {
        self.state.lock().journal_buckets.contains(dev)
    }

    /// Journal entries on "disk".
    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Replaces the on-disk journal.
    pub fn set_journal(&self, entries: Vec<JournalEntry>) {
        self.state.lock().journal = entries;
    }

    /// Appends one entry per element of `keys`, continuing the sequence and
    /// carrying the roots and clocks of the current last entry.
    pub fn append_keys(&self, keys: &[Vec<u64>]) {
        let mut state = self.state.lock();
        let last = state.journal.iter().max_by_key(|e| e.seq).cloned();
        let (mut seq, roots, read_clock, write_clock) = match last {
            Some(e) => (e.seq, e.roots, e.read_clock, e.write_clock),
            None => (0, Vec::new(), 0, 0),
        };
        for k in keys {
            seq += 1;
            state.journal.push(JournalEntry {
                seq,
                read_clock,
                write_clock,
                roots: roots.clone(),
                keys: k.clone(),
            });
        }
    }

    /// Empties the on-disk journal.
    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Sets the prio-clock hands recorded by the newest journal entry.
    pub fn set_clocks(&self, read: u16, write: u16) {
        let mut state = self.state.lock();
        if let Some(last) = state.journal.iter_mut().max_by_key(|e| e.seq) {
            last.read_clock = read;
            last.write_clock = write;
        }
    }

    /// Removes the root of `tree` from every journal entry.
    pub fn drop_root(&self, tree: TreeId) {
        for entry in self.state.lock().journal.iter_mut() {
            entry.roots.retain(|r| r.tree != tree);
        }
    }

    /// Sequence numbers passed to replay, in the order seen.
    pub fn replayed_seqs(&self) -> Vec<u64> {
        self.state.lock().replayed.clone()
    }

    /// Replayed btree contents: key to the sequence that wrote it.
    pub fn keys(&self) -> BTreeMap<u64, u64> {
        self.state.lock().keys.clone()
    }

    /// Every (key, seq) replay actually applied, in order.
    pub fn applied(&self) -> Vec<(u64, u64)> {
        self.state.lock().applied.clone()
    }

    /// Records that `dev` stores data of type `ty`.
    pub fn put_data(&self, dev: DevIdx, ty: DataType) {
        self.state.lock().data.entry(dev).or_default().set(ty);
    }

    /// Records data of type `ty` on `dev` that migration cannot move.
    pub fn pin_data(&self, dev: DevIdx, ty: DataType) {
        let mut state = self.state.lock();
        state.data.entry(dev).or_default().set(ty);
        state.pinned.entry(dev).or_default().set(ty);
    }

    /// Kinds of data stored on `dev`.
    pub fn device_data(&self, dev: DevIdx) -> DataMask {
        self.state.lock().data.get(&dev).copied().unwrap_or_default()
    }

    fn migrate(&self, dev: DevIdx, types: &[DataType]) {
        let mut state = self.state.lock();
        let pinned = state.pinned.get(&dev).copied().unwrap_or_default();
        if let Some(data) = state.data.get_mut(&dev) {
            for ty in types {
                if !pinned.contains(*ty) {
                    data.clear(*ty);
                }
            }
        }
    }
}

fn injected(worker: String) -> FsError {
    FsError::WorkerStart {
        worker,
        reason: "injected failure".to_string(),
    }
}

fn idle_worker(fs: &Filesystem, name: String) -> FsResult<Worker> {
    Worker::spawn(fs.runtime(), name, |ctx| ctx.wait_stop())
}

/// Journal backed by [`MockStore`].
#[derive(Debug)]
pub struct MockJournal {
    store: Arc<MockStore>,
    halted: AtomicBool,
}

impl Journal for MockJournal {
    fn read(&self, _fs: &Filesystem) -> FsResult<JournalReplayList> {
        if self.store.faults().journal_read_fail {
            return Err(FsError::Io(std::io::Error::other("journal read failed")));
        }
        self.store.record(MockEvent::JournalRead);
        JournalReplayList::from_entries(self.store.journal_entries())
    }

    fn replay(&self, _fs: &Filesystem, list: &JournalReplayList) -> FsResult<()> {
        let fail_at = self.store.faults().replay_fail_at;
        for entry in list.iter() {
            if fail_at == Some(entry.seq) {
                return Err(FsError::Io(std::io::Error::other("replay failed")));
            }
            let mut state = self.store.state.lock();
            state.replayed.push(entry.seq);
            state.events.push(MockEvent::JournalReplayed(entry.seq));
            for key in &entry.keys {
                let stale = matches!(state.keys.get(key), Some(seq) if *seq >= entry.seq);
                if !stale {
                    state.keys.insert(*key, entry.seq);
                    state.applied.push((*key, entry.seq));
                }
            }
        }
        Ok(())
    }

    fn flush_all(&self, _fs: &Filesystem, _upto: u64) -> FsResult<()> {
        self.store.record(MockEvent::JournalFlushed);
        Ok(())
    }

    fn halt(&self, _fs: &Filesystem) {
        self.halted.store(true, Ordering::SeqCst);
        self.store.record(MockEvent::JournalHalted);
    }

    fn has_error(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn start_live_writes(&self, _fs: &Filesystem) -> FsResult<()> {
        self.store.record(MockEvent::JournalStarted);
        Ok(())
    }

    fn mark_replay_complete(&self, _fs: &Filesystem) {
        self.store.record(MockEvent::ReplayComplete);
    }

    fn write_meta(&self, fs: &Filesystem) -> FsResult<()> {
        if self.has_error() {
            return Err(FsError::EmergencyReadOnly);
        }

        let (read_clock, write_clock) = fs.prio_clocks();
        let roots: Vec<RootPtr> = TreeId::ALL.iter().filter_map(|t| fs.root(*t)).collect();
        let seq = {
            let mut state = self.store.state.lock();
            let seq = state.journal.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
            state.journal.push(JournalEntry {
                seq,
                read_clock,
                write_clock,
                roots,
                keys: Vec::new(),
            });
            state.events.push(MockEvent::JournalMeta(seq));
            seq
        };

        // Metadata lands on the lowest-numbered writable devices.
        let devs: DevMask = fs
            .devices()
            .rw_members()
            .iter()
            .filter(|d| d.is_online())
            .take(fs.opts().metadata_replicas as usize)
            .map(|d| d.idx())
            .collect();
        if !devs.is_empty() {
            fs.mark_replicas(DataType::Journal, devs)?;
            fs.mark_replicas(DataType::Btree, devs)?;
        }
        tracing::debug!(fs = %fs.name(), seq, "mock checkpoint written");
        Ok(())
    }

    fn stop(&self, _fs: &Filesystem) {
        self.store.record(MockEvent::JournalStopped);
    }
}

/// Mark-and-sweep backed by [`MockStore`].
#[derive(Debug)]
pub struct MockMarkSweep {
    store: Arc<MockStore>,
}

impl MarkSweep for MockMarkSweep {
    fn run_once(&self, _fs: &Filesystem, _list: &JournalReplayList) -> FsResult<()> {
        if self.store.faults().gc_run_fail {
            return Err(FsError::Io(std::io::Error::other("mark and sweep failed")));
        }
        self.store.record(MockEvent::GcRun);
        Ok(())
    }

    fn start_background(&self, fs: &Filesystem) -> FsResult<()> {
        let name = format!("{}-gc", fs.name());
        if self.store.faults().gc_start_fail {
            return Err(injected(name));
        }
        let mut workers = self.store.workers.lock();
        if !workers.gc.contains_key(&fs.uuid()) {
            workers.gc.insert(fs.uuid(), idle_worker(fs, name)?);
        }
        drop(workers);
        self.store.record(MockEvent::GcStarted);
        Ok(())
    }

    fn stop_background(&self, fs: &Filesystem) {
        let worker = self.store.workers.lock().gc.remove(&fs.uuid());
        drop(worker);
        self.store.record(MockEvent::GcStopped);
    }
}

/// Allocator backed by [`MockStore`].
#[derive(Debug)]
pub struct MockAllocator {
    store: Arc<MockStore>,
}

impl Allocator for MockAllocator {
    fn start(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()> {
        let name = format!("{}-alloc-{}", fs.name(), dev.idx().0);
        if self.store.faults().allocator_start_fail_dev == Some(dev.idx().0) {
            return Err(injected(name));
        }
        let worker = idle_worker(fs, name)?;
        let replaced = self
            .store
            .workers
            .lock()
            .allocators
            .insert((fs.uuid(), dev.idx()), worker);
        drop(replaced);
        self.store.record(MockEvent::AllocatorStarted(dev.idx()));
        Ok(())
    }

    fn stop(&self, fs: &Filesystem, dev: &Arc<Device>) {
        let worker = self
            .store
            .workers
            .lock()
            .allocators
            .remove(&(fs.uuid(), dev.idx()));
        drop(worker);
        self.store.record(MockEvent::AllocatorStopped(dev.idx()));
    }

    fn add_to_pool(&self, _fs: &Filesystem, dev: &Arc<Device>) {
        self.store.record(MockEvent::PoolAdded(dev.idx()));
    }

    fn remove_from_pool(&self, _fs: &Filesystem, dev: &Arc<Device>) {
        self.store.record(MockEvent::PoolRemoved(dev.idx()));
    }

    fn alloc_journal_buckets(&self, _fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()> {
        if self.store.faults().journal_buckets_fail {
            return Err(FsError::OutOfMemory {
                what: "journal buckets",
            });
        }
        let mut state = self.store.state.lock();
        state.journal_buckets.set(dev.idx());
        state.events.push(MockEvent::JournalBuckets(dev.idx()));
        Ok(())
    }

    fn read_alloc_info(&self, _fs: &Filesystem, _list: &JournalReplayList) -> FsResult<()> {
        self.store.record(MockEvent::AllocInfoRead);
        Ok(())
    }
}

/// Data mover backed by [`MockStore`].
#[derive(Debug)]
pub struct MockDataMover {
    store: Arc<MockStore>,
}

impl DataMover for MockDataMover {
    fn start(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()> {
        let name = format!("{}-move-{}", fs.name(), dev.idx().0);
        if self.store.faults().mover_start_fail_dev == Some(dev.idx().0) {
            return Err(injected(name));
        }
        let worker = idle_worker(fs, name)?;
        let replaced = self
            .store
            .workers
            .lock()
            .movers
            .insert((fs.uuid(), dev.idx()), worker);
        drop(replaced);
        self.store.record(MockEvent::MoverStarted(dev.idx()));
        Ok(())
    }

    fn stop(&self, fs: &Filesystem, dev: &Arc<Device>) {
        let worker = self
            .store
            .workers
            .lock()
            .movers
            .remove(&(fs.uuid(), dev.idx()));
        drop(worker);
        self.store.record(MockEvent::MoverStopped(dev.idx()));
    }

    fn migrate_data_off(&self, _fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()> {
        self.store.migrate(dev.idx(), &[DataType::User]);
        Ok(())
    }

    fn migrate_metadata_off(&self, _fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()> {
        self.store
            .migrate(dev.idx(), &[DataType::Journal, DataType::Btree]);
        Ok(())
    }

    fn flag_data_bad(&self, _fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()> {
        self.store.record(MockEvent::DataFlaggedBad(dev.idx()));
        Ok(())
    }

    fn has_data(&self, _fs: &Filesystem, dev: &Arc<Device>) -> DataMask {
        self.store.device_data(dev.idx())
    }
}

/// Tier placement backed by [`MockStore`].
#[derive(Debug)]
pub struct MockTiering {
    store: Arc<MockStore>,
}

impl TierPlacement for MockTiering {
    fn start(&self, fs: &Filesystem) -> FsResult<()> {
        let name = format!("{}-tiering", fs.name());
        if self.store.faults().tiering_start_fail {
            return Err(injected(name));
        }
        let mut workers = self.store.workers.lock();
        if !workers.tiering.contains_key(&fs.uuid()) {
            workers.tiering.insert(fs.uuid(), idle_worker(fs, name)?);
        }
        drop(workers);
        self.store.record(MockEvent::TieringStarted);
        Ok(())
    }

    fn stop(&self, fs: &Filesystem) {
        let worker = self.store.workers.lock().tiering.remove(&fs.uuid());
        drop(worker);
        self.store.record(MockEvent::TieringStopped);
    }

    fn update_rate(&self, _fs: &Filesystem) {
        self.store.state.lock().rate_updates += 1;
    }
}

/// Consistency checker returning [`MockFaults::fsck_result`].
#[derive(Debug)]
pub struct MockFsck {
    store: Arc<MockStore>,
}

impl Fsck for MockFsck {
    fn run(&self, _fs: &Filesystem, auto_fix: bool) -> Result<(), FsckError> {
        self.store.record(MockEvent::FsckRun { auto_fix });
        match self.store.faults().fsck_result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Btree root store backed by [`MockStore`].
#[derive(Debug)]
pub struct MockBtree {
    store: Arc<MockStore>,
}

impl BtreeStore for MockBtree {
    fn read_root(&self, _fs: &Filesystem, root: &RootPtr) -> FsResult<()> {
        self.store.record(MockEvent::RootRead(root.tree));
        Ok(())
    }

    fn alloc_root(&self, _fs: &Filesystem, tree: TreeId) -> FsResult<RootPtr> {
        let mut state = self.store.state.lock();
        state.next_root += 1;
        state.events.push(MockEvent::RootAllocated(tree));
        Ok(RootPtr {
            tree,
            level: 0,
            ptr: state.next_root,
        })
    }

    fn create_root_inode(&self, _fs: &Filesystem) -> FsResult<()> {
        let mut state = self.store.state.lock();
        state.root_inode = true;
        state.events.push(MockEvent::RootInodeCreated);
        Ok(())
    }
}

/// Devices, superblocks and collaborators for one test.
#[derive(Debug)]
pub struct MockEnv {
    /// Shared collaborator state.
    pub store: Arc<MockStore>,
    /// Superblock regions of every mock device.
    pub sb_io: Arc<MemSuperblockIo>,
    /// Fault points handed to every instance.
    pub faults: Arc<FaultInjector>,
}

impl Default for MockEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnv {
    /// An environment with no devices.
    pub fn new() -> Self {
        Self {
            store: Arc::new(MockStore::default()),
            sb_io: Arc::new(MemSuperblockIo::new()),
            faults: Arc::new(FaultInjector::new()),
        }
    }

    /// Path of mock member device `i`.
    pub fn path(&self, i: usize) -> PathBuf {
        PathBuf::from(format!("/dev/mock{i}"))
    }

    /// Formats `n` RW devices at `path(0..n)`.
    pub fn format_sbs(&self, n: usize, options: &OptionSet) -> Vec<Superblock> {
        let devices = (0..n)
            .map(|_| DeviceGeometry::new(MOCK_NBUCKETS, MOCK_BUCKET_SIZE))
            .collect();
        self.format_with(devices, options)
    }

    /// Formats one device per geometry at `path(0..)`.
    pub fn format_with(&self, devices: Vec<DeviceGeometry>, options: &OptionSet) -> Vec<Superblock> {
        let spec = FormatSpec {
            label: String::new(),
            block_size: 4096,
            btree_node_size: 64 * 1024,
            devices,
            options: options.clone(),
        };
        let sbs = format(&spec).unwrap_or_else(|e| panic!("format failed: {e}"));
        for (i, sb) in sbs.iter().enumerate() {
            self.write_sb(&self.path(i), sb);
        }
        sbs
    }

    /// Formats a standalone single-device filesystem at `/dev/{label}`,
    /// suitable as a candidate for [`Filesystem::dev_add`].
    pub fn format_candidate(&self, label: &str, geometry: DeviceGeometry) -> PathBuf {
        let spec = FormatSpec {
            label: label.to_string(),
            block_size: 4096,
            btree_node_size: geometry.bucket_size.min(64 * 1024),
            devices: vec![geometry],
            options: OptionSet::empty(),
        };
        let sbs = format(&spec).unwrap_or_else(|e| panic!("format failed: {e}"));
        let path = PathBuf::from(format!("/dev/{label}"));
        self.write_sb(&path, &sbs[0]);
        path
    }

    fn write_sb(&self, path: &Path, sb: &Superblock) {
        self.sb_io
            .write(path, sb)
            .unwrap_or_else(|e| panic!("superblock write failed: {e}"));
    }

    /// Reads back the superblocks of `path(0..n)`.
    pub fn read_sbs(&self, n: usize) -> Vec<Superblock> {
        (0..n)
            .map(|i| {
                self.sb_io
                    .peek(&self.path(i))
                    .unwrap_or_else(|| panic!("no superblock at {}", self.path(i).display()))
            })
            .collect()
    }

    /// Allocates an instance for `sb` with no option overrides.
    pub fn alloc(&self, sb: &Superblock) -> FsResult<Arc<Filesystem>> {
        self.alloc_with(sb, &OptionSet::empty())
    }

    /// Allocates an instance for `sb`.
    pub fn alloc_with(&self, sb: &Superblock, overrides: &OptionSet) -> FsResult<Arc<Filesystem>> {
        Filesystem::alloc(sb, overrides, self.create(sb)?)
    }

    /// Allocates an instance from the newest superblock of `path(0..n)`,
    /// brings every device online and starts it. Stops the instance again
    /// on failure.
    pub fn open_all(&self, n: usize, overrides: &OptionSet) -> FsResult<Arc<Filesystem>> {
        let sbs = self.read_sbs(n);
        let best = sbs
            .iter()
            .max_by_key(|sb| sb.seq)
            .ok_or(FsError::NoDevices)?;
        let fs = self.alloc_with(best, overrides)?;
        let started = (0..n)
            .try_for_each(|i| fs.dev_online(&self.path(i)))
            .and_then(|()| fs.start());
        match started {
            Ok(()) => Ok(fs),
            Err(e) => {
                fs.stop();
                Err(e)
            }
        }
    }
}

impl SubsystemFactory for MockEnv {
    fn superblock_io(&self) -> Arc<dyn SuperblockIo> {
        self.sb_io.clone()
    }

    fn create(&self, _sb: &Superblock) -> FsResult<Subsystems> {
        let store = self.store.clone();
        Ok(Subsystems {
            journal: Arc::new(MockJournal {
                store: store.clone(),
                halted: AtomicBool::new(false),
            }),
            gc: Arc::new(MockMarkSweep {
                store: store.clone(),
            }),
            allocator: Arc::new(MockAllocator {
                store: store.clone(),
            }),
            mover: Arc::new(MockDataMover {
                store: store.clone(),
            }),
            tiering: Arc::new(MockTiering {
                store: store.clone(),
            }),
            fsck: Arc::new(MockFsck {
                store: store.clone(),
            }),
            btree: Arc::new(MockBtree { store }),
            sb_io: self.sb_io.clone(),
            faults: self.faults.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberState;

    #[test]
    fn test_format_writes_every_device() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(3, &OptionSet::empty());
        assert_eq!(sbs.len(), 3);
        assert_eq!(env.sb_io.paths().len(), 3);
        let back = env.read_sbs(3);
        assert_eq!(back[2].dev_idx, 2);
        assert!(back.iter().all(|sb| sb.uuid == sbs[0].uuid));
    }

    #[test]
    fn test_append_keys_continues_sequence() {
        let store = MockStore::default();
        store.append_keys(&[vec![1], vec![2, 3]]);
        let seqs: Vec<u64> = store.journal_entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        store.set_clocks(4, 5);
        assert_eq!(store.journal_entries()[1].write_clock, 5);
    }

    #[test]
    fn test_pinned_data_survives_migration() {
        let store = MockStore::default();
        store.put_data(DevIdx(0), DataType::User);
        store.pin_data(DevIdx(0), DataType::Btree);
        store.migrate(DevIdx(0), &[DataType::User, DataType::Btree]);
        let left = store.device_data(DevIdx(0));
        assert!(!left.contains(DataType::User));
        assert!(left.contains(DataType::Btree));
    }

    #[test]
    fn test_member_state_geometry() {
        let env = MockEnv::new();
        let mut spare = DeviceGeometry::new(MOCK_NBUCKETS, MOCK_BUCKET_SIZE);
        spare.state = MemberState::Spare;
        let sbs = env.format_with(
            vec![DeviceGeometry::new(MOCK_NBUCKETS, MOCK_BUCKET_SIZE), spare],
            &OptionSet::empty(),
        );
        assert_eq!(sbs[0].members[1].state, MemberState::Spare);
    }
}
