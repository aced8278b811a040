//! Error types for the filesystem lifecycle layer.

use thiserror::Error;
use uuid::Uuid;

use crate::fault::FaultPoint;
use crate::types::{DataMask, DevIdx, FsState, MemberState, TreeId};

/// Result type alias for lifecycle operations.
pub type FsResult<T> = Result<T, FsError>;

/// Outcome of a consistency check that could not leave the filesystem clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsckError {
    /// Errors were found and the caller did not allow fixing them.
    #[error("filesystem contains errors that were not fixed")]
    ErrorsNotFixed,

    /// Errors were found for which no repair exists yet.
    #[error("filesystem contains errors: repair unimplemented")]
    RepairUnimplemented,

    /// Errors were found that cannot be repaired.
    #[error("filesystem contains errors, but repair impossible")]
    RepairImpossible,
}

impl FsckError {
    /// Suggested next step for the operator, if there is one.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            FsckError::ErrorsNotFixed => Some("mount with -o fix_errors to repair"),
            FsckError::RepairUnimplemented => {
                Some("repair unimplemented: report this so that it can be added")
            }
            FsckError::RepairImpossible => None,
        }
    }
}

/// Coarse classification of every [`FsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An allocation failed; the operation was rolled back.
    ResourceExhaustion,
    /// Incompatible geometry, foreign device or unsupported on-disk version.
    ConfigurationMismatch,
    /// Consistency check findings or corrupted metadata.
    ConsistencyViolation,
    /// The request would drop below the replication safety floor.
    InsufficientReplication,
    /// A device read or write failed.
    IoFailure,
    /// The device or filesystem is already claimed.
    AlreadyInUse,
    /// The request is not legal in the current state.
    InvalidState,
}

/// Error variants for lifecycle operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A buffer or table could not be allocated.
    #[error("cannot allocate memory: {what}")]
    OutOfMemory {
        /// What was being allocated.
        what: &'static str,
    },

    /// No device paths were supplied.
    #[error("need at least one device")]
    NoDevices,

    /// Block size of a device does not match the filesystem.
    #[error("mismatched block size: filesystem uses {expected}, device has {actual}")]
    BlockSizeMismatch {
        /// Block size the filesystem uses.
        expected: u32,
        /// Block size found on the device.
        actual: u32,
    },

    /// Candidate bucket size cannot hold a btree node.
    #[error("bucket size {bucket_size} is smaller than btree node size {btree_node_size}")]
    BucketTooSmall {
        /// Bucket size in bytes.
        bucket_size: u32,
        /// Btree node size in bytes.
        btree_node_size: u32,
    },

    /// Device does not belong to this filesystem.
    #[error("{reason}")]
    NotMember {
        /// Why the device was rejected.
        reason: &'static str,
    },

    /// A mount option could not be parsed.
    #[error("invalid option '{option}': {reason}")]
    InvalidOption {
        /// The offending option text.
        option: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Superblock is from a newer or unknown format revision.
    #[error("unknown metadata version {version}")]
    UnknownVersion {
        /// Version found on disk.
        version: u16,
    },

    /// Superblock is corrupted or invalid.
    #[error("corrupted superblock: {reason}")]
    CorruptedSuperblock {
        /// Description of the corruption.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },

    /// A filesystem with this UUID is already open.
    #[error("filesystem UUID already open: {uuid}")]
    AlreadyOpen {
        /// UUID of the filesystem.
        uuid: Uuid,
    },

    /// The slot already has a block device attached.
    #[error("already have device online in slot {dev}")]
    AlreadyOnline {
        /// Slot index.
        dev: DevIdx,
    },

    /// No device record exists for the slot.
    #[error("no device in slot {dev}")]
    NoSuchDevice {
        /// Slot index.
        dev: DevIdx,
    },

    /// The member table is full.
    #[error("no slots available in superblock")]
    NoSlot,

    /// A membership change would leave too few replicas.
    #[error("cannot set {dev} {target}: insufficient replicas")]
    InsufficientReplication {
        /// Device whose state was to change.
        dev: DevIdx,
        /// Requested membership state.
        target: MemberState,
    },

    /// Not enough members are online to start.
    #[error("insufficient devices")]
    InsufficientDevices,

    /// The operation requires the device not to be RW.
    #[error("cannot {op} RW device {dev}")]
    DeviceIsRw {
        /// Device index.
        dev: DevIdx,
        /// Operation that was refused.
        op: &'static str,
    },

    /// Data is still present on a device that should be empty.
    #[error("{dev} still has data ({data})")]
    StillHasData {
        /// Device index.
        dev: DevIdx,
        /// Kinds of data still present.
        data: DataMask,
    },

    /// The write-admission gate is closed.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Emergency read-only is in effect.
    #[error("filesystem is in emergency read-only mode")]
    EmergencyReadOnly,

    /// The sticky error flag is set.
    #[error("filesystem has an unrecoverable error recorded")]
    ErrorFlagSet,

    /// The operation is not legal in the current runtime state.
    #[error("cannot {op} while {state}")]
    InvalidState {
        /// Current runtime state.
        state: FsState,
        /// Operation that was refused.
        op: &'static str,
    },

    /// A background worker failed to start.
    #[error("error starting {worker} thread: {reason}")]
    WorkerStart {
        /// Worker name.
        worker: String,
        /// Description of the failure.
        reason: String,
    },

    /// A required btree root is absent from the journal.
    #[error("missing btree root: {tree}")]
    MissingBtreeRoot {
        /// Tree kind.
        tree: TreeId,
    },

    /// The journal of an initialized filesystem has no entries.
    #[error("journal empty")]
    JournalEmpty,

    /// Journal entries are not strictly ordered.
    #[error("journal entry {seq} out of order")]
    JournalOutOfOrder {
        /// Offending sequence number.
        seq: u64,
    },

    /// Consistency check failure.
    #[error("fsck error: {0}")]
    Fsck(#[from] FsckError),

    /// An armed fault point fired.
    #[error("dynamic fault: {point}")]
    Fault {
        /// The fault point.
        point: FaultPoint,
    },

    /// A startup step failed; the instance has its error flag set.
    #[error("{step}: {source}")]
    Startup {
        /// Step of the startup sequence.
        step: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    /// Classifies the error by failure kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::Io(_) | FsError::JournalEmpty | FsError::JournalOutOfOrder { .. } => {
                ErrorKind::IoFailure
            }
            FsError::OutOfMemory { .. } | FsError::NoSlot | FsError::Fault { .. } => {
                ErrorKind::ResourceExhaustion
            }
            FsError::BlockSizeMismatch { .. }
            | FsError::BucketTooSmall { .. }
            | FsError::NotMember { .. }
            | FsError::UnknownVersion { .. }
            | FsError::InvalidOption { .. }
            | FsError::NoDevices => ErrorKind::ConfigurationMismatch,
            FsError::CorruptedSuperblock { .. }
            | FsError::Serialization { .. }
            | FsError::MissingBtreeRoot { .. }
            | FsError::Fsck(_) => ErrorKind::ConsistencyViolation,
            FsError::InsufficientReplication { .. }
            | FsError::InsufficientDevices
            | FsError::StillHasData { .. } => ErrorKind::InsufficientReplication,
            FsError::AlreadyOpen { .. } | FsError::AlreadyOnline { .. } => {
                ErrorKind::AlreadyInUse
            }
            FsError::NoSuchDevice { .. }
            | FsError::DeviceIsRw { .. }
            | FsError::ReadOnly
            | FsError::EmergencyReadOnly
            | FsError::ErrorFlagSet
            | FsError::InvalidState { .. }
            | FsError::WorkerStart { .. } => ErrorKind::InvalidState,
            FsError::Startup { source, .. } => source.kind(),
        }
    }

    /// Innermost error, looking through startup wrappers.
    pub fn root_cause(&self) -> &FsError {
        match self {
            FsError::Startup { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Human-readable diagnosis, including a remediation hint for fsck failures.
    pub fn diagnosis(&self) -> String {
        let mut msg = match self.root_cause() {
            FsError::Fsck(_) => "fsck error".to_string(),
            FsError::UnknownVersion { .. } => "unknown metadata version".to_string(),
            FsError::OutOfMemory { .. } => "cannot allocate memory".to_string(),
            FsError::Io(_) => "IO error".to_string(),
            _ => self.to_string(),
        };
        if let FsError::Fsck(fsck) = self.root_cause() {
            msg.push_str(&format!(": {}", fsck));
            if let Some(hint) = fsck.remediation() {
                msg.push_str(&format!(" ({})", hint));
            }
        }
        msg
    }
}
