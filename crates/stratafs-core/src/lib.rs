#![warn(missing_docs)]

//! StrataFS core: filesystem instance lifecycle for a multi-device
//! copy-on-write storage engine.
//!
//! This crate owns the state machine that takes a set of block devices from
//! discovery through startup and recovery, read-write operation, device
//! hot-add and removal, and clean or emergency shutdown. The journal,
//! allocators, mark-and-sweep, data movers and btree store are collaborators
//! reached through the traits in [`subsys`].

pub mod device;
pub mod error;
pub mod fault;
pub mod fs;
pub mod guard;
pub mod membership;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod options;
pub mod refs;
pub mod registry;
pub mod replicas;
pub mod rw;
pub mod startup;
pub mod subsys;
pub mod superblock;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use device::{Device, DeviceTable, ReserveSizes};
pub use error::{ErrorKind, FsError, FsResult, FsckError};
pub use fault::{FaultInjector, FaultPoint};
pub use fs::{Filesystem, WriteRef};
pub use guard::{ReplicationPolicy, StateChange};
pub use options::{FsOptions, OptionSet};
pub use refs::RefGate;
pub use registry::Registry;
pub use replicas::{have_enough_devs, ReplicasStatus, ReplicasTable};
pub use rw::EmergencyOutcome;
pub use subsys::{SubsystemFactory, Subsystems};
pub use superblock::{
    format, FileSuperblockIo, FormatSpec, MemSuperblockIo, Superblock, SuperblockIo,
    SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION,
};
pub use types::{DataType, DevIdx, DevMask, ForceFlags, FsState, MemberState, TreeId};
pub use worker::{shared_runtime, PeriodicTask, Worker};
