//! Core identifier and state types shared across the lifecycle layer.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum number of member slots in a filesystem.
pub const MAX_MEMBERS: usize = 64;

/// Stable slot number of a member device, persisted in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevIdx(pub u8);

impl DevIdx {
    /// Returns the slot as a table index.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DevIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

/// Set of device slots, one bit per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DevMask(pub u64);

impl DevMask {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Adds a device to the set.
    pub fn set(&mut self, dev: DevIdx) {
        self.0 |= 1u64 << dev.0;
    }

    /// Removes a device from the set.
    pub fn clear(&mut self, dev: DevIdx) {
        self.0 &= !(1u64 << dev.0);
    }

    /// Returns whether the device is in the set.
    pub fn contains(&self, dev: DevIdx) -> bool {
        self.0 & (1u64 << dev.0) != 0
    }

    /// Number of devices in the set.
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Devices in the set, lowest slot first.
    pub fn iter(&self) -> impl Iterator<Item = DevIdx> + '_ {
        (0..MAX_MEMBERS as u8)
            .map(DevIdx)
            .filter(move |d| self.contains(*d))
    }
}

impl FromIterator<DevIdx> for DevMask {
    fn from_iter<I: IntoIterator<Item = DevIdx>>(iter: I) -> Self {
        let mut mask = DevMask::empty();
        for dev in iter {
            mask.set(dev);
        }
        mask
    }
}

/// Persisted per-device membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemberState {
    /// Eligible for new allocations.
    #[default]
    Rw,
    /// Readable only.
    Ro,
    /// Excluded pending evacuation.
    Failed,
    /// Excluded pending reintroduction.
    Spare,
}

impl MemberState {
    /// Every membership state, in on-disk order.
    pub const ALL: [MemberState; 4] = [
        MemberState::Rw,
        MemberState::Ro,
        MemberState::Failed,
        MemberState::Spare,
    ];

    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Rw => "rw",
            MemberState::Ro => "ro",
            MemberState::Failed => "failed",
            MemberState::Spare => "spare",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemberState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid member state: {}", s))
    }
}

/// Runtime state of a filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsState {
    /// Allocated, startup not yet complete.
    Starting,
    /// Read-only.
    Ro,
    /// Read-write.
    Rw,
    /// Shutting down.
    Stopping,
}

impl fmt::Display for FsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsState::Starting => "starting",
            FsState::Ro => "read-only",
            FsState::Rw => "read-write",
            FsState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Btree kinds whose roots are recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TreeId {
    /// File extents.
    Extents,
    /// Inodes.
    Inodes,
    /// Directory entries.
    Dirents,
    /// Extended attributes.
    Xattrs,
    /// Bucket allocation information.
    Alloc,
}

impl TreeId {
    /// Every tree kind.
    pub const ALL: [TreeId; 5] = [
        TreeId::Extents,
        TreeId::Inodes,
        TreeId::Dirents,
        TreeId::Xattrs,
        TreeId::Alloc,
    ];

    /// Older layouts may lack this tree's root.
    pub fn root_optional(&self) -> bool {
        matches!(self, TreeId::Alloc)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TreeId::Extents => "extents",
            TreeId::Inodes => "inodes",
            TreeId::Dirents => "dirents",
            TreeId::Xattrs => "xattrs",
            TreeId::Alloc => "alloc",
        };
        f.write_str(s)
    }
}

/// Location of a btree root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPtr {
    /// Which tree.
    pub tree: TreeId,
    /// Depth of the root node.
    pub level: u8,
    /// Opaque pointer to the root node.
    pub ptr: u64,
}

/// Kind of data held by replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Journal buckets.
    Journal,
    /// Btree nodes.
    Btree,
    /// User data extents.
    User,
}

impl DataType {
    /// Every data type.
    pub const ALL: [DataType; 3] = [DataType::Journal, DataType::Btree, DataType::User];

    /// Journal and btree data count as metadata.
    pub fn is_metadata(&self) -> bool {
        !matches!(self, DataType::User)
    }

    fn bit(&self) -> u8 {
        match self {
            DataType::Journal => 1,
            DataType::Btree => 2,
            DataType::User => 4,
        }
    }
}

/// Set of data types, e.g. what a device still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataMask(pub u8);

impl DataMask {
    /// No data.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Adds a data type.
    pub fn set(&mut self, ty: DataType) {
        self.0 |= ty.bit();
    }

    /// Removes a data type.
    pub fn clear(&mut self, ty: DataType) {
        self.0 &= !ty.bit();
    }

    /// Returns whether the type is present.
    pub fn contains(&self, ty: DataType) -> bool {
        self.0 & ty.bit() != 0
    }

    /// Returns whether no type is present.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<DataType> for DataMask {
    fn from_iter<I: IntoIterator<Item = DataType>>(iter: I) -> Self {
        let mut mask = DataMask::empty();
        for ty in iter {
            mask.set(ty);
        }
        mask
    }
}

impl fmt::Display for DataMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Overrides that allow a membership change to degrade redundancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ForceFlags(pub u32);

impl ForceFlags {
    /// No overrides.
    pub const NONE: ForceFlags = ForceFlags(0);
    /// Allow metadata to lose redundancy.
    pub const METADATA_DEGRADED: ForceFlags = ForceFlags(1 << 0);
    /// Allow user data to lose redundancy.
    pub const DATA_DEGRADED: ForceFlags = ForceFlags(1 << 1);
    /// Allow metadata to become unreadable.
    pub const METADATA_LOST: ForceFlags = ForceFlags(1 << 2);
    /// Allow user data to become unreadable.
    pub const DATA_LOST: ForceFlags = ForceFlags(1 << 3);
    /// Both degraded overrides.
    pub const DEGRADED: ForceFlags = ForceFlags(0b0011);

    /// Returns whether every flag in `other` is set.
    pub fn contains(&self, other: ForceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ForceFlags {
    type Output = ForceFlags;

    fn bitor(self, rhs: ForceFlags) -> ForceFlags {
        ForceFlags(self.0 | rhs.0)
    }
}
