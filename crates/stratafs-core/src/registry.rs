//! Process-wide directory of live filesystem instances.
//!
//! Assembly (full open or incremental, one device at a time) runs under the
//! registry lock so two devices of the same filesystem can never create two
//! instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::fs::Filesystem;
use crate::options::OptionSet;
use crate::subsys::SubsystemFactory;
use crate::types::FsState;

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// Maps filesystem UUIDs to live instances.
#[derive(Debug, Default)]
pub struct Registry {
    instances: Mutex<HashMap<Uuid, Arc<Filesystem>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Live instance with filesystem UUID `uuid`.
    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<Arc<Filesystem>> {
        self.instances.lock().get(&uuid).cloned()
    }

    /// Live instance that has the device at `path` online.
    pub fn find_by_device(&self, path: &Path) -> Option<Arc<Filesystem>> {
        self.instances
            .lock()
            .values()
            .find(|fs| {
                fs.devices()
                    .online()
                    .iter()
                    .any(|d| d.path().as_deref() == Some(path))
            })
            .cloned()
    }

    /// Adds `fs`. Fails if an instance with the same UUID is registered.
    pub fn register(&self, fs: Arc<Filesystem>) -> FsResult<()> {
        let mut instances = self.instances.lock();
        if instances.contains_key(&fs.uuid()) {
            return Err(FsError::AlreadyOpen { uuid: fs.uuid() });
        }
        debug!(fs = %fs.name(), uuid = %fs.uuid(), "registered filesystem");
        instances.insert(fs.uuid(), fs);
        Ok(())
    }

    /// Removes the instance registered under `uuid`.
    pub fn deregister(&self, uuid: Uuid) -> Option<Arc<Filesystem>> {
        self.instances.lock().remove(&uuid)
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// Returns whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Opens the filesystem made up of the devices at `paths`.
    ///
    /// The superblock with the highest sequence number is authoritative;
    /// every other device must be a member of it. Unless `nostart` is set
    /// the instance is started before it is registered. On failure the
    /// partially assembled instance is stopped and dropped.
    pub fn open(
        &self,
        paths: &[PathBuf],
        overrides: &OptionSet,
        factory: &dyn SubsystemFactory,
    ) -> FsResult<Arc<Filesystem>> {
        if paths.is_empty() {
            return Err(FsError::NoDevices);
        }

        let sb_io = factory.superblock_io();
        let handles = paths
            .iter()
            .map(|p| sb_io.read(p))
            .collect::<FsResult<Vec<_>>>()?;

        let best = handles
            .iter()
            .max_by_key(|h| h.sb.seq)
            .map(|h| h.sb.clone())
            .ok_or(FsError::NoDevices)?;
        for handle in &handles {
            best.check_member(&handle.sb)?;
        }

        let mut instances = self.instances.lock();
        if instances.contains_key(&best.uuid) {
            return Err(FsError::AlreadyOpen { uuid: best.uuid });
        }

        let subsys = factory.create(&best)?;
        let fs = Filesystem::alloc(&best, overrides, subsys)?;

        let assembled = (|| -> FsResult<()> {
            for handle in handles {
                fs.dev_online_member(handle)?;
            }
            if !fs.may_start() {
                return Err(FsError::InsufficientDevices);
            }
            if !fs.opts().nostart {
                fs.start()?;
            }
            Ok(())
        })();

        if let Err(e) = assembled {
            error!(fs = %fs.name(), error = %e, "open failed");
            fs.stop();
            return Err(e);
        }

        info!(fs = %fs.name(), devices = paths.len(), state = %fs.state(), "opened filesystem");
        instances.insert(fs.uuid(), fs.clone());
        Ok(fs)
    }

    /// Adds one device to the instance it belongs to, creating the instance
    /// if this is the first member seen. The instance starts as soon as
    /// enough members are online.
    pub fn open_incremental(
        &self,
        path: &Path,
        factory: &dyn SubsystemFactory,
    ) -> FsResult<Arc<Filesystem>> {
        let handle = factory.superblock_io().read(path)?;
        let uuid = handle.sb.uuid;

        let mut instances = self.instances.lock();
        let (fs, fresh) = match instances.get(&uuid) {
            Some(fs) => (fs.clone(), false),
            None => {
                let subsys = factory.create(&handle.sb)?;
                let fs = Filesystem::alloc(&handle.sb, &OptionSet::empty(), subsys)?;
                (fs, true)
            }
        };

        if let Err(e) = fs.dev_online_member(handle) {
            if fresh {
                fs.stop();
            }
            return Err(e);
        }

        if fs.state() == FsState::Starting && !fs.opts().nostart && fs.may_start() {
            if let Err(e) = fs.start() {
                error!(fs = %fs.name(), error = %e, "incremental start failed");
                instances.remove(&uuid);
                fs.stop();
                return Err(e);
            }
        }

        if fresh {
            debug!(fs = %fs.name(), state = %fs.state(), "registered assembling filesystem");
            instances.insert(uuid, fs.clone());
        }
        Ok(fs)
    }

    /// Stops `fs` and removes it from the registry.
    pub fn close(&self, fs: &Arc<Filesystem>) {
        {
            let mut instances = self.instances.lock();
            if instances
                .get(&fs.uuid())
                .is_some_and(|registered| Arc::ptr_eq(registered, fs))
            {
                instances.remove(&fs.uuid());
            }
        }
        fs.stop();
    }

    /// Stops and removes every registered instance.
    pub fn shutdown(&self) {
        let all: Vec<Arc<Filesystem>> = self.instances.lock().drain().map(|(_, fs)| fs).collect();
        for fs in all {
            fs.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEnv;
    use crate::types::{DevIdx, MemberState};

    fn paths(env: &MockEnv, n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| env.path(i)).collect()
    }

    #[test]
    fn test_open_starts_and_registers() {
        let env = MockEnv::new();
        env.format_sbs(2, &OptionSet::empty());
        let reg = Registry::new();

        let fs = reg.open(&paths(&env, 2), &OptionSet::empty(), &env).unwrap();
        assert_eq!(fs.state(), FsState::Rw);
        assert_eq!(reg.len(), 1);
        assert!(Arc::ptr_eq(&reg.find_by_uuid(fs.uuid()).unwrap(), &fs));
        assert!(Arc::ptr_eq(&reg.find_by_device(&env.path(1)).unwrap(), &fs));
        assert!(reg.find_by_device(Path::new("/dev/elsewhere")).is_none());

        reg.close(&fs);
        assert!(reg.is_empty());
        assert_eq!(fs.state(), FsState::Stopping);
    }

    #[test]
    fn test_open_twice_rejected() {
        let env = MockEnv::new();
        env.format_sbs(1, &OptionSet::empty());
        let reg = Registry::new();
        let fs = reg.open(&paths(&env, 1), &OptionSet::empty(), &env).unwrap();
        assert!(matches!(
            reg.open(&paths(&env, 1), &OptionSet::empty(), &env),
            Err(FsError::AlreadyOpen { .. })
        ));
        reg.shutdown();
        assert!(reg.is_empty());
        assert_eq!(fs.state(), FsState::Stopping);
    }

    #[test]
    fn test_open_requires_devices() {
        let env = MockEnv::new();
        let reg = Registry::new();
        assert!(matches!(
            reg.open(&[], &OptionSet::empty(), &env),
            Err(FsError::NoDevices)
        ));
    }

    #[test]
    fn test_open_with_missing_member_fails_unless_degraded() {
        let env = MockEnv::new();
        env.format_sbs(2, &OptionSet::empty());
        let reg = Registry::new();

        let err = reg
            .open(&paths(&env, 1), &OptionSet::empty(), &env)
            .unwrap_err();
        assert!(matches!(err, FsError::InsufficientDevices));
        assert!(reg.is_empty());
        assert_eq!(env.store.running_allocators(), 0);

        let fs = reg
            .open(&paths(&env, 1), &OptionSet::parse("degraded").unwrap(), &env)
            .unwrap();
        assert_eq!(fs.state(), FsState::Rw);
        assert!(!fs.device(DevIdx(1)).unwrap().is_online());
        reg.shutdown();
    }

    #[test]
    fn test_open_rejects_foreign_device() {
        let env = MockEnv::new();
        env.format_sbs(1, &OptionSet::empty());
        let foreign = env.format_candidate("foreign", crate::superblock::DeviceGeometry::new(64, 256 * 1024));

        let reg = Registry::new();
        let err = reg
            .open(&[env.path(0), foreign], &OptionSet::empty(), &env)
            .unwrap_err();
        assert!(matches!(err, FsError::NotMember { .. }));
    }

    #[test]
    fn test_nostart_leaves_instance_starting() {
        let env = MockEnv::new();
        env.format_sbs(1, &OptionSet::empty());
        let reg = Registry::new();
        let fs = reg
            .open(&paths(&env, 1), &OptionSet::parse("nostart").unwrap(), &env)
            .unwrap();
        assert_eq!(fs.state(), FsState::Starting);
        fs.start().unwrap();
        assert_eq!(fs.state(), FsState::Rw);
        reg.shutdown();
    }

    #[test]
    fn test_incremental_assembly() {
        let env = MockEnv::new();
        env.format_sbs(3, &OptionSet::empty());
        let reg = Registry::new();

        let first = reg.open_incremental(&env.path(2), &env).unwrap();
        assert_eq!(first.state(), FsState::Starting);
        assert_eq!(reg.len(), 1);

        let second = reg.open_incremental(&env.path(0), &env).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), FsState::Starting);

        let third = reg.open_incremental(&env.path(1), &env).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(third.state(), FsState::Rw);
        assert_eq!(reg.len(), 1);

        assert!(matches!(
            reg.open_incremental(&env.path(1), &env),
            Err(FsError::AlreadyOnline { .. })
        ));
        assert_eq!(third.device(DevIdx(1)).unwrap().state(), MemberState::Rw);
        reg.shutdown();
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(Registry::global(), Registry::global()));
    }
}
