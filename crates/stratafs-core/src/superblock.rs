//! Superblock module for member identification, crash recovery, and version compatibility.
//!
//! Every member device carries a full copy of the filesystem superblock in a
//! fixed region at offset 0. Copies differ only in `dev_idx`; the copy with
//! the highest `seq` is authoritative.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::options::OptionSet;
use crate::replicas::ReplicasTable;
use crate::types::{DevIdx, MemberState, MAX_MEMBERS};

/// Superblock magic: "STRATAFS".
pub const SUPERBLOCK_MAGIC: u64 = 0x5354_5241_5441_4653;
/// Current superblock version.
pub const SUPERBLOCK_VERSION: u16 = 2;
/// Oldest superblock version still understood.
pub const SUPERBLOCK_VERSION_MIN: u16 = 1;
/// Size of the on-disk superblock region.
pub const SUPERBLOCK_BYTES: usize = 64 * 1024;
/// Superblock region offset on every member.
pub const SUPERBLOCK_OFFSET: u64 = 0;

/// Seconds since the Unix epoch, or 0 if the clock is before it.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Persisted description of one member slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Device UUID; nil when the slot is empty or the device was removed.
    pub uuid: Uuid,
    /// Number of buckets on the device.
    pub nbuckets: u64,
    /// First bucket usable for data.
    pub first_bucket: u16,
    /// Bucket size in bytes.
    pub bucket_size: u32,
    /// Membership state.
    pub state: MemberState,
    /// Storage tier the device belongs to.
    pub tier: u8,
    /// Last time the filesystem was mounted with this device online.
    pub last_mount: u64,
}

impl Member {
    /// Returns whether the slot holds a device.
    pub fn is_present(&self) -> bool {
        !self.uuid.is_nil()
    }
}

impl Default for Member {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            nbuckets: 0,
            first_bucket: 0,
            bucket_size: 0,
            state: MemberState::Rw,
            tier: 0,
            last_mount: 0,
        }
    }
}

/// Filesystem superblock as stored on every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Magic number for identification.
    pub magic: u64,
    /// Version of the superblock format.
    pub version: u16,
    /// Write sequence number; bumped on every superblock write.
    pub seq: u64,
    /// Internal filesystem UUID.
    pub uuid: Uuid,
    /// User-visible filesystem UUID.
    pub user_uuid: Uuid,
    /// Human-readable label.
    pub label: String,
    /// Slot of the device this copy was read from.
    pub dev_idx: u8,
    /// Number of member slots.
    pub nr_devices: u8,
    /// Block size in bytes.
    pub block_size: u32,
    /// Btree node size in bytes.
    pub btree_node_size: u32,
    /// Set once startup has completed at least once.
    pub initialized: bool,
    /// Set by a clean read-only transition.
    pub clean: bool,
    /// Options embedded at format time.
    pub options: OptionSet,
    /// Member table, indexed by slot.
    pub members: Vec<Member>,
    /// Replica-usage table.
    pub replicas: ReplicasTable,
    /// CRC32 of the encoded superblock with this field zeroed.
    pub checksum: u32,
}

impl Superblock {
    /// Validates magic, version, checksum and member table shape.
    pub fn validate(&self) -> FsResult<()> {
        if self.magic != SUPERBLOCK_MAGIC {
            debug!(actual = self.magic, "invalid superblock magic");
            return Err(FsError::CorruptedSuperblock {
                reason: format!(
                    "invalid magic: expected {:#x}, got {:#x}",
                    SUPERBLOCK_MAGIC, self.magic
                ),
            });
        }

        if !(SUPERBLOCK_VERSION_MIN..=SUPERBLOCK_VERSION).contains(&self.version) {
            debug!(actual = self.version, "unsupported superblock version");
            return Err(FsError::UnknownVersion {
                version: self.version,
            });
        }

        let computed = self.compute_checksum()?;
        if computed != self.checksum {
            return Err(FsError::CorruptedSuperblock {
                reason: format!(
                    "checksum mismatch: expected {:#x}, got {:#x}",
                    self.checksum, computed
                ),
            });
        }

        if self.nr_devices as usize != self.members.len() || self.members.len() > MAX_MEMBERS {
            return Err(FsError::CorruptedSuperblock {
                reason: format!(
                    "member table has {} entries, nr_devices {}",
                    self.members.len(),
                    self.nr_devices
                ),
            });
        }

        if self.dev_idx >= self.nr_devices {
            return Err(FsError::CorruptedSuperblock {
                reason: format!("dev_idx {} >= nr_devices {}", self.dev_idx, self.nr_devices),
            });
        }

        if !self.block_size.is_power_of_two() || !self.btree_node_size.is_power_of_two() {
            return Err(FsError::CorruptedSuperblock {
                reason: "block and btree node sizes must be powers of two".to_string(),
            });
        }

        Ok(())
    }

    /// Computes the CRC32 of the encoded superblock (excluding the checksum field).
    pub fn compute_checksum(&self) -> FsResult<u32> {
        let mut zeroed = self.clone();
        zeroed.checksum = 0;
        let bytes = bincode::serialize(&zeroed).map_err(|e| FsError::Serialization {
            reason: e.to_string(),
        })?;
        Ok(crc32fast::hash(&bytes))
    }

    /// Recomputes and stores the checksum.
    pub fn update_checksum(&mut self) -> FsResult<()> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Serializes the superblock, padded to [`SUPERBLOCK_BYTES`].
    pub fn to_bytes(&self) -> FsResult<Vec<u8>> {
        let mut bytes = bincode::serialize(self).map_err(|e| FsError::Serialization {
            reason: e.to_string(),
        })?;

        if bytes.len() > SUPERBLOCK_BYTES {
            return Err(FsError::Serialization {
                reason: format!(
                    "superblock too large: {} bytes (max {})",
                    bytes.len(),
                    SUPERBLOCK_BYTES
                ),
            });
        }

        bytes.resize(SUPERBLOCK_BYTES, 0);
        Ok(bytes)
    }

    /// Deserializes a superblock from its on-disk region.
    pub fn from_bytes(data: &[u8]) -> FsResult<Self> {
        if data.len() < SUPERBLOCK_BYTES {
            return Err(FsError::CorruptedSuperblock {
                reason: format!(
                    "data too small: {} bytes (min {})",
                    data.len(),
                    SUPERBLOCK_BYTES
                ),
            });
        }

        bincode::deserialize(data).map_err(|e| FsError::CorruptedSuperblock {
            reason: format!("deserialization failed: {}", e),
        })
    }

    /// Returns the member entry for a slot, if the slot exists.
    pub fn member(&self, idx: DevIdx) -> Option<&Member> {
        self.members.get(idx.as_usize())
    }

    /// Mutable member entry for a slot.
    pub fn member_mut(&mut self, idx: DevIdx) -> Option<&mut Member> {
        self.members.get_mut(idx.as_usize())
    }

    /// Returns whether the slot holds a device that has not been removed.
    pub fn dev_exists(&self, idx: DevIdx) -> bool {
        self.member(idx).map(Member::is_present).unwrap_or(false)
    }

    /// Slot this copy was read from.
    pub fn idx(&self) -> DevIdx {
        DevIdx(self.dev_idx)
    }

    /// Grows (or shrinks) the member table to `nr` slots.
    pub fn resize_members(&mut self, nr: usize) -> FsResult<()> {
        if nr > MAX_MEMBERS {
            return Err(FsError::NoSlot);
        }
        self.members.resize_with(nr, Member::default);
        self.nr_devices = nr as u8;
        Ok(())
    }

    /// First slot with no device, growing the table if every slot is taken.
    pub fn free_slot(&mut self) -> FsResult<DevIdx> {
        if let Some(idx) = self.members.iter().position(|m| !m.is_present()) {
            return Ok(DevIdx(idx as u8));
        }
        let idx = self.members.len();
        self.resize_members(idx + 1)?;
        Ok(DevIdx(idx as u8))
    }

    /// Checks that `dev` (a superblock read from a candidate device) belongs
    /// to the filesystem described by `self`.
    pub fn check_member(&self, dev: &Superblock) -> FsResult<()> {
        if self.uuid != dev.uuid {
            return Err(FsError::NotMember {
                reason: "device not a member of filesystem",
            });
        }

        let newest = if self.seq >= dev.seq { self } else { dev };
        if !newest.dev_exists(dev.idx()) {
            return Err(FsError::NotMember {
                reason: "device has been removed",
            });
        }

        if self.block_size != dev.block_size {
            return Err(FsError::BlockSizeMismatch {
                expected: self.block_size,
                actual: dev.block_size,
            });
        }

        Ok(())
    }

    /// Checks that `dev`, a device not yet a member, can be added to a
    /// filesystem with this block and btree node size.
    pub fn check_may_add(&self, dev: &Superblock) -> FsResult<()> {
        if dev.block_size != self.block_size {
            return Err(FsError::BlockSizeMismatch {
                expected: self.block_size,
                actual: dev.block_size,
            });
        }

        let bucket_size = dev.member(dev.idx()).map(|m| m.bucket_size).unwrap_or(0);
        if bucket_size < self.btree_node_size {
            return Err(FsError::BucketTooSmall {
                bucket_size,
                btree_node_size: self.btree_node_size,
            });
        }

        Ok(())
    }
}

/// A superblock read from a specific device path.
#[derive(Debug)]
pub struct SbHandle {
    /// Path the superblock was read from.
    pub path: PathBuf,
    /// Decoded superblock.
    pub sb: Superblock,
}

impl SbHandle {
    /// Slot the device occupies.
    pub fn idx(&self) -> DevIdx {
        self.sb.idx()
    }
}

impl Drop for SbHandle {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "releasing superblock handle");
    }
}

/// Reads and writes superblock regions on member devices.
pub trait SuperblockIo: Send + Sync {
    /// Reads and validates the superblock at `path`.
    fn read(&self, path: &Path) -> FsResult<SbHandle>;

    /// Durably writes `sb` to `path`.
    fn write(&self, path: &Path, sb: &Superblock) -> FsResult<()>;
}

/// Superblock I/O against files or block devices, region at offset 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSuperblockIo;

impl SuperblockIo for FileSuperblockIo {
    fn read(&self, path: &Path) -> FsResult<SbHandle> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        let mut buf = vec![0u8; SUPERBLOCK_BYTES];
        file.read_exact(&mut buf)?;

        let sb = Superblock::from_bytes(&buf)?;
        sb.validate()?;
        debug!(path = %path.display(), seq = sb.seq, dev = %sb.idx(), "read superblock");
        Ok(SbHandle {
            path: path.to_path_buf(),
            sb,
        })
    }

    fn write(&self, path: &Path, sb: &Superblock) -> FsResult<()> {
        let bytes = sb.to_bytes()?;
        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(path)?;
        file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        debug!(path = %path.display(), seq = sb.seq, "wrote superblock");
        Ok(())
    }
}

/// In-memory superblock store keyed by path.
#[derive(Debug, Default)]
pub struct MemSuperblockIo {
    regions: Mutex<HashMap<PathBuf, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_paths: Mutex<HashSet<PathBuf>>,
}

impl MemSuperblockIo {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent writes to `path` alone fail with an I/O error.
    pub fn set_fail_path(&self, path: &Path, fail: bool) {
        let mut paths = self.fail_paths.lock();
        if fail {
            paths.insert(path.to_path_buf());
        } else {
            paths.remove(path);
        }
    }

    /// Decodes the superblock stored at `path` without validating it.
    pub fn peek(&self, path: &Path) -> Option<Superblock> {
        let regions = self.regions.lock();
        regions
            .get(path)
            .and_then(|bytes| Superblock::from_bytes(bytes).ok())
    }

    /// Paths that currently hold a superblock.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.regions.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl SuperblockIo for MemSuperblockIo {
    fn read(&self, path: &Path) -> FsResult<SbHandle> {
        let bytes = self.regions.lock().get(path).cloned().ok_or_else(|| {
            FsError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no device at {}", path.display()),
            ))
        })?;
        let sb = Superblock::from_bytes(&bytes)?;
        sb.validate()?;
        Ok(SbHandle {
            path: path.to_path_buf(),
            sb,
        })
    }

    fn write(&self, path: &Path, sb: &Superblock) -> FsResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) || self.fail_paths.lock().contains(path) {
            return Err(FsError::Io(std::io::Error::other("superblock write failed")));
        }
        let bytes = sb.to_bytes()?;
        self.regions.lock().insert(path.to_path_buf(), bytes);
        Ok(())
    }
}

/// Geometry of one device in a new filesystem.
#[derive(Debug, Clone)]
pub struct DeviceGeometry {
    /// Number of buckets.
    pub nbuckets: u64,
    /// Bucket size in bytes.
    pub bucket_size: u32,
    /// Initial membership state.
    pub state: MemberState,
    /// Storage tier.
    pub tier: u8,
}

impl DeviceGeometry {
    /// An RW device with `nbuckets` buckets of `bucket_size` bytes.
    pub fn new(nbuckets: u64, bucket_size: u32) -> Self {
        Self {
            nbuckets,
            bucket_size,
            state: MemberState::Rw,
            tier: 0,
        }
    }
}

/// Parameters for creating a new filesystem.
#[derive(Debug, Clone)]
pub struct FormatSpec {
    /// Human-readable label.
    pub label: String,
    /// Block size in bytes.
    pub block_size: u32,
    /// Btree node size in bytes.
    pub btree_node_size: u32,
    /// Member devices, one per slot.
    pub devices: Vec<DeviceGeometry>,
    /// Options to embed in the superblock.
    pub options: OptionSet,
}

/// Builds one superblock per device of a new, not yet initialized filesystem.
pub fn format(spec: &FormatSpec) -> FsResult<Vec<Superblock>> {
    if spec.devices.is_empty() {
        return Err(FsError::NoDevices);
    }
    if spec.devices.len() > MAX_MEMBERS {
        return Err(FsError::NoSlot);
    }
    for geom in &spec.devices {
        if geom.bucket_size < spec.btree_node_size {
            return Err(FsError::BucketTooSmall {
                bucket_size: geom.bucket_size,
                btree_node_size: spec.btree_node_size,
            });
        }
    }

    let members: Vec<Member> = spec
        .devices
        .iter()
        .map(|geom| Member {
            uuid: Uuid::new_v4(),
            nbuckets: geom.nbuckets,
            first_bucket: 1,
            bucket_size: geom.bucket_size,
            state: geom.state,
            tier: geom.tier,
            last_mount: 0,
        })
        .collect();

    let base = Superblock {
        magic: SUPERBLOCK_MAGIC,
        version: SUPERBLOCK_VERSION,
        seq: 1,
        uuid: Uuid::new_v4(),
        user_uuid: Uuid::new_v4(),
        label: spec.label.clone(),
        dev_idx: 0,
        nr_devices: members.len() as u8,
        block_size: spec.block_size,
        btree_node_size: spec.btree_node_size,
        initialized: false,
        clean: false,
        options: spec.options.clone(),
        members,
        replicas: ReplicasTable::new(),
        checksum: 0,
    };

    (0..base.members.len())
        .map(|idx| {
            let mut sb = base.clone();
            sb.dev_idx = idx as u8;
            sb.update_checksum()?;
            Ok(sb)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_spec(n: usize) -> FormatSpec {
        FormatSpec {
            label: "test".to_string(),
            block_size: 4096,
            btree_node_size: 64 * 1024,
            devices: (0..n).map(|_| DeviceGeometry::new(1024, 256 * 1024)).collect(),
            options: OptionSet::empty(),
        }
    }

    #[test]
    fn test_format_shares_uuid() {
        let sbs = format(&format_spec(3)).unwrap();
        assert_eq!(sbs.len(), 3);
        for (i, sb) in sbs.iter().enumerate() {
            assert_eq!(sb.dev_idx as usize, i);
            assert_eq!(sb.uuid, sbs[0].uuid);
            assert!(!sb.initialized);
            assert!(sb.validate().is_ok());
            assert!(sb.dev_exists(DevIdx(i as u8)));
        }
    }

    #[test]
    fn test_format_rejects_small_buckets() {
        let mut spec = format_spec(1);
        spec.devices[0].bucket_size = 4096;
        assert!(matches!(
            format(&spec),
            Err(FsError::BucketTooSmall { .. })
        ));
        assert!(matches!(format(&format_spec(0)), Err(FsError::NoDevices)));
    }

    #[test]
    fn test_superblock_serialize_roundtrip() {
        let sb = format(&format_spec(2)).unwrap().remove(1);
        let bytes = sb.to_bytes().unwrap();
        assert_eq!(bytes.len(), SUPERBLOCK_BYTES);
        let decoded = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, sb);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_superblock_invalid_checksum() {
        let mut sb = format(&format_spec(1)).unwrap().remove(0);
        sb.checksum ^= 0xDEAD_BEEF;
        assert!(matches!(
            sb.validate(),
            Err(FsError::CorruptedSuperblock { .. })
        ));
    }

    #[test]
    fn test_superblock_unknown_version() {
        let mut sb = format(&format_spec(1)).unwrap().remove(0);
        sb.version = SUPERBLOCK_VERSION + 1;
        sb.update_checksum().unwrap();
        assert!(matches!(
            sb.validate(),
            Err(FsError::UnknownVersion { version }) if version == SUPERBLOCK_VERSION + 1
        ));
    }

    #[test]
    fn test_superblock_invalid_magic() {
        let mut sb = format(&format_spec(1)).unwrap().remove(0);
        sb.magic = 0;
        sb.update_checksum().unwrap();
        assert!(sb.validate().is_err());
    }

    #[test]
    fn test_from_bytes_too_small() {
        assert!(Superblock::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_check_member() {
        let sbs = format(&format_spec(2)).unwrap();
        assert!(sbs[0].check_member(&sbs[1]).is_ok());

        let other = format(&format_spec(1)).unwrap().remove(0);
        assert!(matches!(
            sbs[0].check_member(&other),
            Err(FsError::NotMember { reason }) if reason.contains("not a member")
        ));

        let mut newer = sbs[0].clone();
        newer.seq += 1;
        newer.members[1].uuid = Uuid::nil();
        assert!(matches!(
            newer.check_member(&sbs[1]),
            Err(FsError::NotMember { reason }) if reason.contains("removed")
        ));

        let mut wrong_bs = sbs[1].clone();
        wrong_bs.block_size = 512;
        assert!(matches!(
            sbs[0].check_member(&wrong_bs),
            Err(FsError::BlockSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_check_may_add() {
        let fs = format(&format_spec(1)).unwrap().remove(0);
        let cand = format(&format_spec(1)).unwrap().remove(0);
        assert!(fs.check_may_add(&cand).is_ok());

        let mut small = cand.clone();
        small.members[0].bucket_size = 4096;
        assert!(matches!(
            fs.check_may_add(&small),
            Err(FsError::BucketTooSmall { .. })
        ));
    }

    #[test]
    fn test_free_slot_grows_table() {
        let mut sb = format(&format_spec(2)).unwrap().remove(0);
        assert_eq!(sb.free_slot().unwrap(), DevIdx(2));
        assert_eq!(sb.nr_devices, 3);
        sb.members[0].uuid = Uuid::nil();
        assert_eq!(sb.free_slot().unwrap(), DevIdx(0));
    }

    #[test]
    fn test_file_io_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev0");
        let sb = format(&format_spec(1)).unwrap().remove(0);

        let io = FileSuperblockIo;
        io.write(&path, &sb).unwrap();
        let handle = io.read(&path).unwrap();
        assert_eq!(handle.sb, sb);
        assert_eq!(handle.path, path);
    }

    #[test]
    fn test_mem_io_fail_writes() {
        let io = MemSuperblockIo::new();
        let sb = format(&format_spec(1)).unwrap().remove(0);
        let path = Path::new("/dev/mem0");

        io.write(path, &sb).unwrap();
        assert_eq!(io.peek(path).unwrap(), sb);
        assert_eq!(io.paths(), vec![path.to_path_buf()]);

        io.set_fail_writes(true);
        assert!(matches!(io.write(path, &sb), Err(FsError::Io(_))));
        assert!(io.read(Path::new("/dev/missing")).is_err());
    }
}
