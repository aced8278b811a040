//! One-time startup: journal read, recovery or fresh initialization, then
//! the first RO or RW transition.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::device::Device;
use crate::error::{FsError, FsResult};
use crate::fault::FaultPoint;
use crate::fs::Filesystem;
use crate::subsys::JournalReplayList;
use crate::superblock::now_secs;
use crate::types::{FsState, TreeId};

/// Tags an error with the startup step it happened in.
trait During<T> {
    fn during(self, step: &'static str) -> FsResult<T>;
}

impl<T> During<T> for FsResult<T> {
    fn during(self, step: &'static str) -> FsResult<T> {
        self.map_err(|e| FsError::Startup {
            step,
            source: Box::new(e),
        })
    }
}

impl Filesystem {
    fn verbose(&self, msg: &str) {
        if self.opts().verbose {
            info!(fs = %self.name(), "{}", msg);
        } else {
            debug!(fs = %self.name(), "{}", msg);
        }
    }

    fn online_rw_members(&self) -> Vec<Arc<Device>> {
        self.devices()
            .rw_members()
            .into_iter()
            .filter(|d| d.is_online())
            .collect()
    }

    /// Runs startup: recovery of an existing filesystem or initialization
    /// of a fresh one, then the transition to RO or RW.
    ///
    /// On failure the error flag is set and the instance must be stopped.
    pub fn start(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        if *state != FsState::Starting {
            return Err(FsError::InvalidState {
                state: *state,
                op: "start",
            });
        }

        let result = self.start_locked(&mut state);
        if let Err(e) = &result {
            self.set_error();
            error!(fs = %self.name(), diagnosis = %e.diagnosis(), "startup failed: {}", e);
        }
        result
    }

    fn start_locked(&self, state: &mut FsState) -> FsResult<()> {
        for dev in self.online_rw_members() {
            if !dev.in_pool() {
                self.subsys().allocator.add_to_pool(self, &dev);
                dev.set_in_pool(true);
            }
        }
        self.recalc_capacity();

        let initialized = self.sb_lock().initialized;
        if initialized {
            self.recover()?;
        } else {
            self.initialize()?;
        }

        self.faults().check(FaultPoint::FsStart).during("dynamic fault")?;

        if self.opts().read_only {
            self.read_only_locked(state);
        } else {
            self.read_write_locked(state).during("going read-write")?;
        }

        let now = now_secs();
        let online = self.devices().online();
        let mut sb = self.sb_lock();
        let mut new_sb = sb.clone();
        for dev in &online {
            if let Some(member) = new_sb.member_mut(dev.idx()) {
                member.last_mount = now;
            }
        }
        new_sb.initialized = true;
        new_sb.clean = false;
        self.commit_super(&mut sb, new_sb)
            .during("writing superblock")?;
        for dev in &online {
            if let Some(member) = sb.member(dev.idx()) {
                dev.set_member(member.clone());
            }
        }

        info!(fs = %self.name(), state = %state, "filesystem started");
        Ok(())
    }

    fn recover(&self) -> FsResult<()> {
        let subsys = self.subsys().clone();

        let list = subsys.journal.read(self).during("reading journal")?;
        let last = list
            .last()
            .ok_or(FsError::JournalEmpty)
            .during("reading journal")?;
        self.set_prio_clocks(last.read_clock, last.write_clock);
        debug!(fs = %self.name(), entries = list.len(), last_seq = last.seq, "read journal");

        for tree in TreeId::ALL {
            match last.root(tree) {
                Some(root) => {
                    subsys
                        .btree
                        .read_root(self, root)
                        .during("reading btree root")?;
                    self.set_root(*root);
                }
                None if tree.root_optional() => {}
                None => {
                    return Err(FsError::MissingBtreeRoot { tree }).during("reading btree roots")
                }
            }
        }

        subsys
            .allocator
            .read_alloc_info(self, &list)
            .during("reading allocation information")?;
        self.set_alloc_read_done();

        self.verbose("starting mark and sweep");
        subsys.gc.run_once(self, &list).during("mark and sweep")?;
        self.verbose("mark and sweep done");

        if self.opts().noreplay {
            return Ok(());
        }

        for tree in TreeId::ALL {
            if self.root(tree).is_none() {
                let root = subsys
                    .btree
                    .alloc_root(self, tree)
                    .during("allocating btree root")?;
                self.set_root(root);
            }
        }

        subsys
            .journal
            .start_live_writes(self)
            .during("starting journal")?;

        for dev in self.online_rw_members() {
            self.start_allocator(&dev).during("starting allocator")?;
        }

        self.verbose("starting journal replay");
        subsys.journal.replay(self, &list).during("journal replay")?;
        subsys.journal.mark_replay_complete(self);
        self.verbose("journal replay done");

        if self.opts().norecovery || self.opts().nofsck {
            return Ok(());
        }

        self.verbose("starting fsck");
        subsys
            .fsck
            .run(self, self.opts().fix_errors)
            .map_err(FsError::from)
            .during("fsck")?;
        self.verbose("fsck done");
        Ok(())
    }

    fn initialize(&self) -> FsResult<()> {
        let subsys = self.subsys().clone();
        info!(fs = %self.name(), "initializing new filesystem");

        self.set_alloc_read_done();
        subsys
            .gc
            .run_once(self, &JournalReplayList::new())
            .during("mark and sweep")?;

        for dev in self.online_rw_members() {
            subsys
                .allocator
                .alloc_journal_buckets(self, &dev)
                .during("allocating journal buckets")?;
        }

        for tree in TreeId::ALL {
            let root = subsys
                .btree
                .alloc_root(self, tree)
                .during("allocating btree root")?;
            self.set_root(root);
        }

        subsys
            .journal
            .start_live_writes(self)
            .during("starting journal")?;
        subsys.journal.mark_replay_complete(self);

        for dev in self.online_rw_members() {
            self.start_allocator(&dev).during("starting allocator")?;
        }

        subsys
            .btree
            .create_root_inode(self)
            .during("creating root directory")?;
        subsys
            .journal
            .write_meta(self)
            .during("writing first journal entry")?;
        Ok(())
    }
}
