//! Device membership changes on a live filesystem: online, offline, state
//! changes, add, remove and evacuate.
//!
//! Every change is checked by the replica-sufficiency guard first. Changes
//! to the member table are made on a copy of the superblock, persisted, and
//! only then applied in memory.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::device::Device;
use crate::error::{FsError, FsResult};
use crate::fault::FaultPoint;
use crate::fs::Filesystem;
use crate::superblock::{now_secs, SbHandle};
use crate::types::{DevIdx, DevMask, ForceFlags, FsState, MemberState};

impl Filesystem {
    /// Attaches an already validated member. Caller holds the state lock.
    fn dev_online_handle(&self, state: FsState, handle: SbHandle) -> FsResult<Arc<Device>> {
        let idx = handle.idx();

        let dev = {
            let mut sb = self.sb_lock();
            if handle.sb.seq > sb.seq {
                info!(fs = %self.name(), seq = handle.sb.seq, "adopting newer superblock");
                *sb = handle.sb.clone();
                for dev in self.devices().snapshot() {
                    if let Some(member) = sb.member(dev.idx()) {
                        dev.set_member(member.clone());
                    }
                }
            }

            match self.devices().get(idx) {
                Some(dev) => dev,
                None => {
                    let member = sb
                        .member(idx)
                        .filter(|m| m.is_present())
                        .cloned()
                        .ok_or(FsError::NoSuchDevice { dev: idx })?;
                    let dev = Device::alloc(idx, &member, sb.btree_node_size, self.faults())?;
                    self.devices().publish(dev.clone())?;
                    dev
                }
            }
        };

        dev.attach(handle)?;

        if dev.state() == MemberState::Rw
            && matches!(state, FsState::Starting | FsState::Rw)
            && !dev.in_pool()
        {
            self.subsys().allocator.add_to_pool(self, &dev);
            dev.set_in_pool(true);
        }
        self.recalc_capacity();
        Ok(dev)
    }

    /// Brings an existing member online from `path`.
    pub fn dev_online(&self, path: &Path) -> FsResult<()> {
        let result = self
            .subsys()
            .sb_io
            .read(path)
            .and_then(|handle| self.dev_online_member(handle));

        if let Err(e) = &result {
            error!(fs = %self.name(), path = %path.display(), error = %e, "error bringing device online");
        }
        result
    }

    /// Checks membership of an already read superblock and attaches it.
    pub(crate) fn dev_online_member(&self, handle: SbHandle) -> FsResult<()> {
        let state = self.state.lock();
        self.sb_lock().check_member(&handle.sb)?;
        let dev = self.dev_online_handle(*state, handle)?;
        if *state == FsState::Rw && dev.state() == MemberState::Rw {
            self.dev_read_write(&dev)?;
        }
        Ok(())
    }

    /// Takes a member offline, provided everything stays readable without it.
    pub fn dev_offline(&self, idx: DevIdx, flags: ForceFlags) -> FsResult<()> {
        let _state = self.state.lock();
        let dev = self.device(idx)?;

        if let Err(e) = self.check_state_change(&dev, MemberState::Failed, flags) {
            error!(fs = %self.name(), dev = %idx, "cannot offline required device");
            return Err(e);
        }

        self.dev_read_only(&dev);
        drop(dev.detach());
        Ok(())
    }

    /// Changes a member's persisted state.
    pub fn dev_set_state(
        &self,
        idx: DevIdx,
        new_state: MemberState,
        flags: ForceFlags,
    ) -> FsResult<()> {
        let state = self.state.lock();
        let dev = self.device(idx)?;
        let old_state = dev.state();
        if old_state == new_state {
            return Ok(());
        }

        self.check_state_change(&dev, new_state, flags)?;

        self.apply_dev_workers(*state, &dev, new_state)?;

        let persisted = {
            let mut sb = self.sb_lock();
            let mut new_sb = sb.clone();
            if let Some(member) = new_sb.member_mut(idx) {
                member.state = new_state;
            }
            self.commit_super(&mut sb, new_sb)
        };

        if let Err(e) = persisted {
            warn!(fs = %self.name(), dev = %idx, error = %e, "state change not persisted, reverting");
            if let Err(e) = self.apply_dev_workers(*state, &dev, old_state) {
                error!(fs = %self.name(), dev = %idx, error = %e, "failed to restore device workers");
            }
            return Err(e);
        }

        dev.set_state(new_state);
        info!(fs = %self.name(), dev = %idx, state = %new_state, "device state changed");
        Ok(())
    }

    /// Starts or stops a device's workers to match `member_state`.
    fn apply_dev_workers(
        &self,
        fs_state: FsState,
        dev: &Arc<Device>,
        member_state: MemberState,
    ) -> FsResult<()> {
        if member_state != MemberState::Rw {
            self.dev_read_only(dev);
            return Ok(());
        }
        if fs_state != FsState::Rw || !dev.is_online() {
            return Ok(());
        }
        if let Err(e) = self.dev_read_write(dev) {
            self.dev_read_only(dev);
            return Err(e);
        }
        Ok(())
    }

    /// Adds a new device to the running filesystem.
    pub fn dev_add(&self, path: &Path) -> FsResult<DevIdx> {
        let mut handle = self.subsys().sb_io.read(path)?;
        self.sb_lock().check_may_add(&handle.sb)?;

        let state = self.state.lock();

        let (idx, dev) = {
            let mut sb = self.sb_lock();

            // Preserve the device's own member info (tier, geometry).
            let mut saved = handle
                .sb
                .member(handle.idx())
                .cloned()
                .ok_or(FsError::NotMember {
                    reason: "candidate has no member entry",
                })?;
            saved.last_mount = now_secs();

            if self.faults().check(FaultPoint::AddNoSlot).is_err() {
                return Err(FsError::NoSlot);
            }

            let mut new_sb = sb.clone();
            let idx = new_sb.free_slot()?;
            if let Some(member) = new_sb.member_mut(idx) {
                *member = saved.clone();
            }

            let dev = Device::alloc(idx, &saved, new_sb.btree_node_size, self.faults())?;

            // The candidate's own copy goes first. Until the members list
            // it, a crash leaves it a foreign device.
            let mut own = new_sb.clone();
            own.seq = sb.seq + 1;
            own.dev_idx = idx.0;
            own.update_checksum()?;
            if !self.opts().nochanges {
                self.subsys().sb_io.write(path, &own)?;
            }

            if let Err(e) = self.commit_super(&mut sb, new_sb) {
                error!(fs = %self.name(), dev = %idx, error = %e, "unable to write superblock, restoring candidate");
                if let Err(e) = self.subsys().sb_io.write(path, &handle.sb) {
                    warn!(fs = %self.name(), path = %path.display(), error = %e, "failed to restore candidate superblock");
                }
                return Err(e);
            }

            handle.sb = own;
            (idx, dev)
        };

        self.devices().publish(dev.clone())?;
        dev.attach(handle)?;
        info!(fs = %self.name(), dev = %idx, path = %path.display(), "added device");

        if dev.state() == MemberState::Rw && *state == FsState::Rw {
            let started = self
                .subsys()
                .allocator
                .alloc_journal_buckets(self, &dev)
                .and_then(|()| self.dev_read_write(&dev));
            if let Err(e) = started {
                error!(fs = %self.name(), dev = %idx, error = %e, "unable to start added device");
                self.dev_read_only(&dev);
                return Err(e);
            }
        }
        Ok(idx)
    }

    /// Permanently removes a member that is no longer RW and holds no data.
    pub fn dev_remove(&self, idx: DevIdx, flags: ForceFlags) -> FsResult<()> {
        let _state = self.state.lock();
        let dev = self.device(idx)?;

        if dev.state() == MemberState::Rw {
            error!(fs = %self.name(), dev = %idx, "cannot remove RW device");
            return Err(FsError::DeviceIsRw { dev: idx, op: "remove" });
        }

        if let Err(e) = self.check_state_change(&dev, MemberState::Failed, flags) {
            error!(fs = %self.name(), dev = %idx, "cannot remove without losing data");
            return Err(e);
        }

        let mover = self.subsys().mover.clone();
        mover.flag_data_bad(self, &dev)?;

        let data = mover.has_data(self, &dev);
        if !data.is_empty() {
            error!(fs = %self.name(), dev = %idx, %data, "remove failed, still has data");
            return Err(FsError::StillHasData { dev: idx, data });
        }

        if let Err(e) = self.subsys().journal.write_meta(self) {
            warn!(fs = %self.name(), error = %e, "journal checkpoint before remove failed");
        }

        {
            let mut sb = self.sb_lock();
            let mut new_sb = sb.clone();
            if let Some(member) = new_sb.member_mut(idx) {
                member.uuid = Uuid::nil();
            }
            new_sb.replicas.forget([idx].into_iter().collect::<DevMask>());
            if let Err(e) = self.commit_super_except(&mut sb, new_sb, Some(idx)) {
                error!(fs = %self.name(), dev = %idx, error = %e, "remove failed, superblock not written");
                return Err(e);
            }
        }

        self.dev_read_only(&dev);
        drop(dev.detach());
        drop(self.devices().unpublish(idx));
        drop(dev);

        info!(fs = %self.name(), dev = %idx, "removed device");
        Ok(())
    }

    /// Moves all data and metadata off a member that is not RW.
    pub fn dev_evacuate(&self, idx: DevIdx) -> FsResult<()> {
        let dev = {
            let _state = self.state.lock();
            let dev = self.device(idx)?;
            if dev.state() == MemberState::Rw {
                error!(fs = %self.name(), dev = %idx, "cannot migrate data off RW device");
                return Err(FsError::DeviceIsRw {
                    dev: idx,
                    op: "migrate data off",
                });
            }
            dev
        };

        let mover = self.subsys().mover.clone();
        mover.migrate_data_off(self, &dev).map_err(|e| {
            error!(fs = %self.name(), dev = %idx, error = %e, "error migrating data");
            e
        })?;
        mover.migrate_metadata_off(self, &dev).map_err(|e| {
            error!(fs = %self.name(), dev = %idx, error = %e, "error migrating metadata");
            e
        })?;

        let data = mover.has_data(self, &dev);
        if !data.is_empty() {
            error!(fs = %self.name(), dev = %idx, %data, "migrate error: data still present");
            return Err(FsError::StillHasData { dev: idx, data });
        }
        Ok(())
    }
}
