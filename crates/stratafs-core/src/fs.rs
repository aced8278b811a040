//! The filesystem instance.
//!
//! A [`Filesystem`] owns the device table, the authoritative superblock
//! image, the resolved options and the subsystem handles. It is always held
//! in an `Arc`; the state transitions live in [`crate::rw`],
//! [`crate::startup`] and [`crate::membership`].
//!
//! Lock order: the state lock, then the superblock lock. Collaborators are
//! never called with the superblock lock held.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{Device, DeviceTable};
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultPoint};
use crate::guard::{self, GuardContext, ReplicationPolicy, StateChange};
use crate::options::{FsOptions, OptionSet};
use crate::refs::RefGate;
use crate::replicas::have_enough_devs;
use crate::subsys::Subsystems;
use crate::superblock::Superblock;
use crate::types::{DataType, DevIdx, DevMask, ForceFlags, FsState, MemberState, RootPtr, TreeId};
use crate::worker::{shared_runtime, PeriodicTask};

/// One mounted or assembling filesystem.
pub struct Filesystem {
    name: String,
    uuid: Uuid,
    self_ref: Weak<Filesystem>,
    pub(crate) state: Mutex<FsState>,
    pub(crate) sb: Mutex<Superblock>,
    opts: FsOptions,
    error: AtomicBool,
    emergency_ro: AtomicBool,
    write_disable_complete: AtomicBool,
    alloc_read_done: AtomicBool,
    pub(crate) writes: RefGate,
    ro_wait_lock: Mutex<()>,
    ro_wait: Condvar,
    pub(crate) devices: DeviceTable,
    subsys: Subsystems,
    runtime: Handle,
    capacity: AtomicU64,
    read_clock: AtomicU16,
    write_clock: AtomicU16,
    roots: Mutex<BTreeMap<TreeId, RootPtr>>,
    pub(crate) rate_ctl: Mutex<Option<PeriodicTask>>,
    pub(crate) read_only_work: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// An admitted write. The write-admission gate cannot finish closing while
/// any of these are alive.
#[derive(Debug)]
pub struct WriteRef<'a> {
    fs: &'a Filesystem,
}

impl Drop for WriteRef<'_> {
    fn drop(&mut self) {
        if self.fs.writes.put() {
            self.fs.mark_write_disabled();
        }
    }
}

impl Filesystem {
    /// Allocates an instance for the filesystem described by `sb`, with a
    /// device record for every present member. Nothing is online yet.
    pub fn alloc(
        sb: &Superblock,
        overrides: &OptionSet,
        subsys: Subsystems,
    ) -> FsResult<Arc<Filesystem>> {
        subsys.faults.check(FaultPoint::FsAlloc)?;
        let runtime = shared_runtime()?;

        let opts = OptionSet::merge(&sb.options, overrides);
        let name = if sb.label.is_empty() {
            sb.user_uuid.to_string()
        } else {
            sb.label.clone()
        };

        let devices = DeviceTable::new();
        for (i, member) in sb.members.iter().enumerate() {
            if !member.is_present() {
                continue;
            }
            let dev = Device::alloc(DevIdx(i as u8), member, sb.btree_node_size, &subsys.faults)?;
            devices.publish(dev)?;
        }

        let fs = Arc::new_cyclic(|weak| Filesystem {
            name,
            uuid: sb.uuid,
            self_ref: weak.clone(),
            state: Mutex::new(FsState::Starting),
            sb: Mutex::new(sb.clone()),
            opts,
            error: AtomicBool::new(false),
            emergency_ro: AtomicBool::new(false),
            write_disable_complete: AtomicBool::new(false),
            alloc_read_done: AtomicBool::new(false),
            writes: RefGate::new_live(),
            ro_wait_lock: Mutex::new(()),
            ro_wait: Condvar::new(),
            devices,
            subsys,
            runtime,
            capacity: AtomicU64::new(0),
            read_clock: AtomicU16::new(0),
            write_clock: AtomicU16::new(0),
            roots: Mutex::new(BTreeMap::new()),
            rate_ctl: Mutex::new(None),
            read_only_work: Mutex::new(None),
        });

        info!(fs = %fs.name, uuid = %fs.uuid, members = fs.devices.occupied().count(), "allocated filesystem");
        Ok(fs)
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Current runtime state.
    pub fn state(&self) -> FsState {
        *self.state.lock()
    }

    /// Resolved options.
    pub fn opts(&self) -> &FsOptions {
        &self.opts
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().clone()
    }

    /// Device table.
    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Subsystem handles.
    pub fn subsys(&self) -> &Subsystems {
        &self.subsys
    }

    /// Runtime the background workers of this instance run on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Fault points of this instance.
    pub fn faults(&self) -> &FaultInjector {
        &self.subsys.faults
    }

    pub(crate) fn arc(&self) -> Option<Arc<Filesystem>> {
        self.self_ref.upgrade()
    }

    /// Returns whether an unrecoverable error has been recorded.
    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Records an unrecoverable error. Sticky.
    pub fn set_error(&self) {
        if !self.error.swap(true, Ordering::SeqCst) {
            warn!(fs = %self.name, "error flag set");
        }
    }

    /// Returns whether emergency read-only has been triggered.
    pub fn is_emergency_ro(&self) -> bool {
        self.emergency_ro.load(Ordering::SeqCst)
    }

    pub(crate) fn try_set_emergency_ro(&self) -> bool {
        !self.emergency_ro.swap(true, Ordering::SeqCst)
    }

    /// Returns whether allocation info has been read during startup.
    pub fn alloc_read_done(&self) -> bool {
        self.alloc_read_done.load(Ordering::SeqCst)
    }

    pub(crate) fn set_alloc_read_done(&self) {
        self.alloc_read_done.store(true, Ordering::SeqCst);
    }

    /// Admits a write. Fails once the write-admission gate is closed.
    pub fn write_ref(&self) -> FsResult<WriteRef<'_>> {
        if self.is_emergency_ro() {
            return Err(FsError::EmergencyReadOnly);
        }
        if !self.writes.try_get() {
            return Err(FsError::ReadOnly);
        }
        Ok(WriteRef { fs: self })
    }

    pub(crate) fn mark_write_disabled(&self) {
        let _guard = self.ro_wait_lock.lock();
        self.write_disable_complete.store(true, Ordering::SeqCst);
        self.ro_wait.notify_all();
    }

    pub(crate) fn write_disable_complete(&self) -> bool {
        self.write_disable_complete.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_write_disable_complete(&self) {
        self.write_disable_complete.store(false, Ordering::SeqCst);
    }

    /// Blocks until `cond` holds; re-evaluated whenever read-only waiters
    /// are woken.
    pub(crate) fn ro_wait_until(&self, cond: impl Fn() -> bool) {
        let mut guard = self.ro_wait_lock.lock();
        while !cond() {
            self.ro_wait.wait(&mut guard);
        }
    }

    pub(crate) fn wake_ro_waiters(&self) {
        let _guard = self.ro_wait_lock.lock();
        self.ro_wait.notify_all();
    }

    /// Writable capacity in bytes, as of the last recalculation.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Recomputes writable capacity from the devices in the allocation pool.
    pub fn recalc_capacity(&self) {
        let capacity: u64 = self
            .devices
            .snapshot()
            .iter()
            .filter(|d| d.in_pool())
            .map(|d| {
                let reserved = d.reserves().total() * d.member().bucket_size as u64;
                d.capacity_bytes().saturating_sub(reserved)
            })
            .sum();
        self.capacity.store(capacity, Ordering::SeqCst);
        debug!(fs = %self.name, capacity, "recalculated capacity");
    }

    /// Read and write prio-clock hands.
    pub fn prio_clocks(&self) -> (u16, u16) {
        (
            self.read_clock.load(Ordering::SeqCst),
            self.write_clock.load(Ordering::SeqCst),
        )
    }

    pub(crate) fn set_prio_clocks(&self, read: u16, write: u16) {
        self.read_clock.store(read, Ordering::SeqCst);
        self.write_clock.store(write, Ordering::SeqCst);
    }

    /// Root of `tree`, if it has been read or allocated.
    pub fn root(&self, tree: TreeId) -> Option<RootPtr> {
        self.roots.lock().get(&tree).copied()
    }

    pub(crate) fn set_root(&self, root: RootPtr) {
        self.roots.lock().insert(root.tree, root);
    }

    /// Periodic rate-controller update.
    pub fn update_rates(&self) {
        self.recalc_capacity();
        self.subsys.tiering.update_rate(self);
    }

    /// Persists `new` to every online member and makes it the in-memory
    /// superblock. On failure `current` is left untouched. Caller holds the
    /// superblock lock.
    pub(crate) fn commit_super(&self, current: &mut Superblock, new: Superblock) -> FsResult<()> {
        self.commit_super_except(current, new, None)
    }

    /// Like [`Filesystem::commit_super`], skipping the member `skip`.
    pub(crate) fn commit_super_except(
        &self,
        current: &mut Superblock,
        mut new: Superblock,
        skip: Option<DevIdx>,
    ) -> FsResult<()> {
        if self.opts.nochanges {
            debug!(fs = %self.name, "nochanges: skipping superblock write");
            *current = new;
            return Ok(());
        }
        new.seq = current.seq + 1;
        for dev in self.devices.online() {
            if Some(dev.idx()) == skip {
                continue;
            }
            let Some(path) = dev.path() else { continue };
            let mut copy = new.clone();
            copy.dev_idx = dev.idx().0;
            copy.update_checksum()?;
            self.subsys.sb_io.write(&path, &copy)?;
        }
        debug!(fs = %self.name, seq = new.seq, "wrote superblock");
        *current = new;
        Ok(())
    }

    /// Persists the superblock to every online member.
    pub fn write_super(&self) -> FsResult<()> {
        let mut sb = self.sb.lock();
        let new = sb.clone();
        self.commit_super(&mut sb, new)
    }

    pub(crate) fn sb_lock(&self) -> MutexGuard<'_, Superblock> {
        self.sb.lock()
    }

    /// Records that `data_type` now has replicas on `devs`, persisting the
    /// replica table if it changed.
    pub fn mark_replicas(&self, data_type: DataType, devs: DevMask) -> FsResult<()> {
        let mut sb = self.sb.lock();
        let mut new = sb.clone();
        if new.replicas.mark(data_type, devs) {
            debug!(fs = %self.name, ?data_type, devs = devs.0, "new replicas entry");
            self.commit_super(&mut sb, new)?;
        }
        Ok(())
    }

    /// Returns whether enough members are online to start.
    pub fn may_start(&self) -> bool {
        let online = self.devices.online_mask();
        let sb = self.sb.lock();

        if !self.opts.degraded {
            let missing = sb.members.iter().enumerate().any(|(i, m)| {
                m.is_present()
                    && matches!(m.state, MemberState::Rw | MemberState::Ro)
                    && !online.contains(DevIdx(i as u8))
            });
            if missing {
                return false;
            }
        }

        let flags = if self.opts.degraded {
            ForceFlags::DEGRADED
        } else {
            ForceFlags::NONE
        };
        have_enough_devs(&sb.replicas.status(online), flags)
    }

    /// Asks the replica-sufficiency guard whether `dev` may move to `to`.
    pub fn check_state_change(
        &self,
        dev: &Device,
        to: MemberState,
        flags: ForceFlags,
    ) -> FsResult<()> {
        let other_rw = self
            .devices
            .rw_members()
            .iter()
            .filter(|d| d.idx() != dev.idx() && d.is_online())
            .count() as u32;
        let sb = self.sb.lock();
        let ctx = GuardContext {
            policy: ReplicationPolicy::from_options(&self.opts),
            other_rw,
            replicas: &sb.replicas,
            online: || self.devices.online_mask(),
        };
        guard::check(
            &ctx,
            StateChange {
                dev: dev.idx(),
                from: dev.state(),
                to,
            },
            flags,
        )
    }

    /// Looks up a device record.
    pub fn device(&self, idx: DevIdx) -> FsResult<Arc<Device>> {
        self.devices.get(idx).ok_or(FsError::NoSuchDevice { dev: idx })
    }

    /// Shuts the instance down: a clean read-only transition if it is RW,
    /// forced teardown of anything still running, then every device is
    /// taken offline and freed.
    pub fn stop(&self) {
        info!(fs = %self.name, "stopping filesystem");
        {
            let mut state = self.state.lock();
            if *state == FsState::Rw {
                self.read_only_locked(&mut state);
            }
            if matches!(*state, FsState::Rw | FsState::Starting) {
                self.stop_rw_workers();
            }
            *state = FsState::Stopping;
            if let Some(task) = self.rate_ctl.lock().take() {
                task.cancel();
            }
        }

        self.wait_read_only_work();

        for dev in self.devices.snapshot() {
            drop(dev.detach());
            drop(self.devices.unpublish(dev.idx()));
        }
        info!(fs = %self.name, "filesystem stopped");
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        debug!(fs = %self.name, "freeing filesystem");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEnv;

    #[test]
    fn test_alloc_creates_offline_records() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(3, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();

        assert_eq!(fs.state(), FsState::Starting);
        assert_eq!(fs.devices().occupied().count(), 3);
        assert!(fs.devices().online_mask().is_empty());
        assert!(!fs.may_start());
    }

    #[test]
    fn test_alloc_fault_fails_cleanly() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::empty());
        env.faults.arm(FaultPoint::FsAlloc);
        assert!(matches!(env.alloc(&sbs[0]), Err(FsError::Fault { .. })));

        env.faults.disarm(FaultPoint::FsAlloc);
        env.faults.arm(FaultPoint::DevAlloc);
        assert!(matches!(env.alloc(&sbs[0]), Err(FsError::Fault { .. })));
    }

    #[test]
    fn test_options_merge_with_superblock() {
        let env = MockEnv::new();
        let embedded = OptionSet {
            metadata_replicas: Some(2),
            ..OptionSet::empty()
        };
        let sbs = env.format_sbs(2, &embedded);
        let overrides = OptionSet::parse("ro,data_replicas=2").unwrap();
        let fs = env.alloc_with(&sbs[0], &overrides).unwrap();
        assert_eq!(fs.opts().metadata_replicas, 2);
        assert_eq!(fs.opts().data_replicas, 2);
        assert!(fs.opts().read_only);
    }

    #[test]
    fn test_write_gate_closes() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();

        let w = fs.write_ref().unwrap();
        assert!(!fs.writes.kill());
        assert!(matches!(fs.write_ref(), Err(FsError::ReadOnly)));
        assert!(!fs.write_disable_complete());
        drop(w);
        assert!(fs.write_disable_complete());
    }

    #[test]
    fn test_error_flag_is_sticky() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();
        assert!(!fs.has_error());
        fs.set_error();
        fs.set_error();
        assert!(fs.has_error());
    }

    #[test]
    fn test_mark_replicas_persists() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();
        fs.dev_online(&env.path(0)).unwrap();

        let before = fs.superblock().seq;
        let devs: DevMask = [DevIdx(0)].into_iter().collect();
        fs.mark_replicas(DataType::User, devs).unwrap();
        fs.mark_replicas(DataType::User, devs).unwrap();
        assert_eq!(fs.superblock().seq, before + 1);

        let on_disk = env.sb_io.peek(&env.path(0)).unwrap();
        assert_eq!(on_disk.replicas.entries().len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_superblock_unchanged() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();
        fs.dev_online(&env.path(0)).unwrap();
        let before = fs.superblock();

        env.sb_io.set_fail_writes(true);
        let devs: DevMask = [DevIdx(0)].into_iter().collect();
        assert!(fs.mark_replicas(DataType::User, devs).is_err());
        assert!(fs.write_super().is_err());
        env.sb_io.set_fail_writes(false);

        assert_eq!(fs.superblock(), before);
    }

    #[test]
    fn test_stop_offlines_everything() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(2, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();
        fs.dev_online(&env.path(0)).unwrap();
        fs.dev_online(&env.path(1)).unwrap();
        assert!(fs.may_start());

        fs.stop();
        assert_eq!(fs.state(), FsState::Stopping);
        assert!(fs.devices().occupied().is_empty());
    }
}
