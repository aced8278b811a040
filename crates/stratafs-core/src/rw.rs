//! Read-write / read-only transitions and emergency read-only.
//!
//! Going RW starts the dependent subsystems bottom-up: allocators, then
//! mark-and-sweep, then data movers, then tier placement, then the rate
//! controller. Going RO stops them in the reverse order, flushing the
//! journal while allocators are still running. Both run under the state
//! lock for their whole duration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::Device;
use crate::error::{FsError, FsResult};
use crate::fs::Filesystem;
use crate::types::{FsState, MemberState};
use crate::worker::PeriodicTask;

/// Result of requesting emergency read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyOutcome {
    /// This call triggered the shutdown.
    Triggered,
    /// An earlier call already triggered it.
    AlreadyTriggered,
}

fn worker_error(worker: &str, err: FsError) -> FsError {
    match err {
        FsError::WorkerStart { .. } => err,
        other => FsError::WorkerStart {
            worker: worker.to_string(),
            reason: other.to_string(),
        },
    }
}

impl Filesystem {
    /// Transitions to read-only. A no-op unless the instance is starting or
    /// RW, and when the error flag is set.
    pub fn read_only(&self) {
        let mut state = self.state.lock();
        self.read_only_locked(&mut state);
    }

    pub(crate) fn read_only_locked(&self, state: &mut FsState) {
        if !matches!(*state, FsState::Starting | FsState::Rw) {
            return;
        }
        if self.has_error() {
            return;
        }

        info!(fs = %self.name(), from = %state, "going read-only");

        if self.writes.kill() {
            self.mark_write_disabled();
        }
        if let Some(task) = self.rate_ctl.lock().take() {
            task.cancel();
        }

        // In-flight writes finish unless an emergency shutdown cuts them off.
        self.ro_wait_until(|| self.write_disable_complete() || self.is_emergency_ro());

        self.stop_rw_workers();

        self.ro_wait_until(|| self.write_disable_complete());
        self.clear_write_disable_complete();

        if !self.subsys().journal.has_error() && !self.has_error() {
            let mut sb = self.sb_lock();
            let mut new_sb = sb.clone();
            new_sb.clean = true;
            if let Err(e) = self.commit_super(&mut sb, new_sb) {
                warn!(fs = %self.name(), error = %e, "failed to mark filesystem clean");
            }
        }

        *state = FsState::Ro;
        info!(fs = %self.name(), "read-only");
    }

    /// Stops every RW worker in reverse dependency order.
    pub(crate) fn stop_rw_workers(&self) {
        let subsys = self.subsys().clone();

        subsys.tiering.stop(self);

        for dev in self.devices().snapshot() {
            subsys.mover.stop(self, &dev);
            dev.set_mover_running(false);
        }

        subsys.gc.stop_background(self);

        // Flushing may allocate btree nodes; allocators are still running.
        if let Err(e) = subsys.journal.flush_all(self, u64::MAX) {
            error!(fs = %self.name(), error = %e, "journal flush failed");
        }

        for dev in self.devices().snapshot() {
            subsys.allocator.stop(self, &dev);
            dev.set_allocator_running(false);
        }

        subsys.journal.stop(self);

        for dev in self.devices().snapshot() {
            if dev.in_pool() {
                subsys.allocator.remove_from_pool(self, &dev);
                dev.set_in_pool(false);
            }
        }
        self.recalc_capacity();
        debug!(fs = %self.name(), "rw workers stopped");
    }

    /// Transitions to read-write.
    pub fn read_write(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        self.read_write_locked(&mut state)
    }

    pub(crate) fn read_write_locked(&self, state: &mut FsState) -> FsResult<()> {
        if !matches!(*state, FsState::Starting | FsState::Ro) {
            return Ok(());
        }
        if self.has_error() {
            return Err(FsError::ErrorFlagSet);
        }
        if self.is_emergency_ro() {
            return Err(FsError::EmergencyReadOnly);
        }

        info!(fs = %self.name(), from = %state, "going read-write");

        if let Err(e) = self.start_rw_workers(*state) {
            error!(fs = %self.name(), error = %e, "going read-write failed, rolling back");
            self.stop_rw_workers();
            return Err(e);
        }

        if *state != FsState::Starting {
            self.writes.reinit();
        }
        *state = FsState::Rw;
        info!(fs = %self.name(), "read-write");
        Ok(())
    }

    fn start_rw_workers(&self, from: FsState) -> FsResult<()> {
        let subsys = self.subsys().clone();

        // The journal's background machinery is stopped by every RO
        // transition; startup has already started it.
        if from == FsState::Ro {
            subsys
                .journal
                .start_live_writes(self)
                .map_err(|e| worker_error("journal", e))?;
        }

        let rw: Vec<Arc<Device>> = self
            .devices()
            .rw_members()
            .into_iter()
            .filter(|d| d.is_online())
            .collect();

        for dev in &rw {
            if !dev.in_pool() {
                subsys.allocator.add_to_pool(self, dev);
                dev.set_in_pool(true);
            }
        }
        self.recalc_capacity();

        for dev in &rw {
            self.start_allocator(dev)?;
        }

        subsys
            .gc
            .start_background(self)
            .map_err(|e| worker_error("mark and sweep", e))?;

        for dev in &rw {
            self.start_mover(dev)?;
        }

        subsys
            .tiering
            .start(self)
            .map_err(|e| worker_error("tiering", e))?;

        self.start_rate_controller()?;
        Ok(())
    }

    pub(crate) fn start_allocator(&self, dev: &Arc<Device>) -> FsResult<()> {
        if dev.allocator_running() {
            return Ok(());
        }
        self.subsys()
            .allocator
            .start(self, dev)
            .map_err(|e| worker_error(&format!("allocator {}", dev.idx()), e))?;
        dev.set_allocator_running(true);
        Ok(())
    }

    pub(crate) fn start_mover(&self, dev: &Arc<Device>) -> FsResult<()> {
        if dev.mover_running() {
            return Ok(());
        }
        self.subsys()
            .mover
            .start(self, dev)
            .map_err(|e| worker_error(&format!("moving gc {}", dev.idx()), e))?;
        dev.set_mover_running(true);
        Ok(())
    }

    fn start_rate_controller(&self) -> FsResult<()> {
        let mut rate_ctl = self.rate_ctl.lock();
        if rate_ctl.is_some() {
            return Ok(());
        }
        let weak = match self.arc() {
            Some(fs) => Arc::downgrade(&fs),
            None => return Ok(()),
        };
        let interval = Duration::from_millis(self.opts().rate_update_interval_ms.max(1));
        let name = format!("{}-rate", self.name());
        let task = PeriodicTask::start(self.runtime(), name, interval, move || {
            if let Some(fs) = weak.upgrade() {
                fs.update_rates();
            }
        })?;
        *rate_ctl = Some(task);
        Ok(())
    }

    /// Brings a single device's RW workers up or down to match its
    /// membership state. Only meaningful while the instance is RW.
    pub(crate) fn dev_read_write(&self, dev: &Arc<Device>) -> FsResult<()> {
        if !dev.in_pool() {
            self.subsys().allocator.add_to_pool(self, dev);
            dev.set_in_pool(true);
            self.recalc_capacity();
        }
        self.start_allocator(dev)?;
        self.start_mover(dev)
    }

    pub(crate) fn dev_read_only(&self, dev: &Arc<Device>) {
        self.subsys().mover.stop(self, dev);
        dev.set_mover_running(false);
        self.subsys().allocator.stop(self, dev);
        dev.set_allocator_running(false);
        if dev.in_pool() {
            self.subsys().allocator.remove_from_pool(self, dev);
            dev.set_in_pool(false);
            self.recalc_capacity();
        }
        debug!(fs = %self.name(), dev = %dev.idx(), state = %MemberState::Ro, "device workers stopped");
    }

    /// Forces read-only from any state and any thread. The journal is halted
    /// immediately and the read-only transition runs asynchronously.
    pub fn emergency_read_only(&self) -> EmergencyOutcome {
        if !self.try_set_emergency_ro() {
            return EmergencyOutcome::AlreadyTriggered;
        }

        error!(fs = %self.name(), "emergency read-only");

        // Halted first so the read-only work never marks the filesystem clean.
        self.subsys().journal.halt(self);

        if let Some(fs) = self.arc() {
            let work = self.runtime().spawn_blocking(move || fs.read_only());
            *self.read_only_work.lock() = Some(work);
        }

        self.wake_ro_waiters();
        EmergencyOutcome::Triggered
    }

    /// Waits for asynchronous read-only work to finish.
    pub fn wait_read_only_work(&self) {
        let work = self.read_only_work.lock().take();
        if let Some(work) = work {
            if let Err(e) = self.runtime().block_on(work) {
                error!(fs = %self.name(), error = %e, "read-only work failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEnv, MockEvent, MockFaults};
    use crate::options::OptionSet;
    use std::thread;

    fn started_rw(env: &MockEnv, n: usize) -> Arc<Filesystem> {
        let sbs = env.format_sbs(n, &OptionSet::empty());
        let fs = env.alloc(&sbs[0]).unwrap();
        for i in 0..n {
            fs.dev_online(&env.path(i)).unwrap();
        }
        fs.start().unwrap();
        fs
    }

    #[test]
    fn test_ro_then_rw_roundtrip() {
        let env = MockEnv::new();
        let fs = started_rw(&env, 2);
        assert_eq!(fs.state(), FsState::Rw);
        assert_eq!(env.store.running_allocators(), 2);

        fs.read_only();
        assert_eq!(fs.state(), FsState::Ro);
        assert_eq!(env.store.running_allocators(), 0);
        assert_eq!(env.store.running_movers(), 0);
        assert!(fs.superblock().clean);
        assert!(matches!(fs.write_ref(), Err(FsError::ReadOnly)));

        fs.read_write().unwrap();
        assert_eq!(fs.state(), FsState::Rw);
        assert_eq!(env.store.running_allocators(), 2);
        assert!(fs.write_ref().is_ok());
        fs.stop();
    }

    #[test]
    fn test_read_only_is_idempotent() {
        let env = MockEnv::new();
        let fs = started_rw(&env, 1);
        fs.read_only();
        let events = env.store.events().len();
        fs.read_only();
        assert_eq!(env.store.events().len(), events);
        assert_eq!(fs.state(), FsState::Ro);
        fs.stop();
    }

    #[test]
    fn test_teardown_order() {
        let env = MockEnv::new();
        let fs = started_rw(&env, 1);
        env.store.clear_events();
        fs.read_only();

        let order: Vec<&str> = env
            .store
            .events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::TieringStopped => Some("tiering"),
                MockEvent::MoverStopped(_) => Some("mover"),
                MockEvent::GcStopped => Some("gc"),
                MockEvent::JournalFlushed => Some("flush"),
                MockEvent::AllocatorStopped(_) => Some("allocator"),
                MockEvent::JournalStopped => Some("journal"),
                MockEvent::PoolRemoved(_) => Some("pool"),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec!["tiering", "mover", "gc", "flush", "allocator", "journal", "pool"]
        );
        fs.stop();
    }

    #[test]
    fn test_allocator_failure_rolls_back() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(3, &OptionSet::parse("ro").unwrap());
        let fs = env.alloc(&sbs[0]).unwrap();
        for i in 0..3 {
            fs.dev_online(&env.path(i)).unwrap();
        }
        fs.start().unwrap();
        assert_eq!(fs.state(), FsState::Ro);

        env.store.set_faults(MockFaults {
            allocator_start_fail_dev: Some(2),
            ..MockFaults::default()
        });
        let err = fs.read_write().unwrap_err();
        assert!(matches!(err, FsError::WorkerStart { .. }));
        assert_eq!(fs.state(), FsState::Ro);
        assert_eq!(env.store.running_allocators(), 0);
        assert!(fs.devices().snapshot().iter().all(|d| !d.allocator_running()));
        fs.stop();
    }

    #[test]
    fn test_error_flag_blocks_rw() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::parse("ro").unwrap());
        let fs = env.alloc(&sbs[0]).unwrap();
        fs.dev_online(&env.path(0)).unwrap();
        fs.start().unwrap();
        fs.set_error();
        assert!(matches!(fs.read_write(), Err(FsError::ErrorFlagSet)));
        fs.stop();
    }

    #[test]
    fn test_emergency_is_idempotent() {
        let env = MockEnv::new();
        let fs = started_rw(&env, 1);
        assert_eq!(fs.emergency_read_only(), EmergencyOutcome::Triggered);
        assert_eq!(fs.emergency_read_only(), EmergencyOutcome::AlreadyTriggered);
        fs.wait_read_only_work();

        assert_eq!(fs.state(), FsState::Ro);
        assert!(env.store.journal_halted());
        assert_eq!(env.store.count(|e| matches!(e, MockEvent::JournalStopped)), 1);
        assert!(!fs.superblock().clean);
        assert!(matches!(fs.write_ref(), Err(FsError::EmergencyReadOnly)));
        fs.stop();
    }

    #[test]
    fn test_rate_controller_ticks() {
        let env = MockEnv::new();
        let sbs = env.format_sbs(1, &OptionSet::parse("rate_update_interval_ms=1").unwrap());
        let fs = env.alloc(&sbs[0]).unwrap();
        fs.dev_online(&env.path(0)).unwrap();
        fs.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while env.store.rate_updates() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(env.store.rate_updates() > 0);
        fs.read_only();
        assert!(fs.rate_ctl.lock().is_none());
        fs.stop();
    }
}
