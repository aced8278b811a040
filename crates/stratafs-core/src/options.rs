//! Mount options: partial option sets and their resolved form.
//!
//! Options are layered: built-in defaults, then the options embedded in the
//! superblock, then whatever the caller passes at open time. Later layers win
//! field by field.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// Default btree node size in bytes.
pub const DEFAULT_BTREE_NODE_SIZE: u32 = 64 * 1024;
/// Default interval between rate-controller updates.
pub const DEFAULT_RATE_UPDATE_INTERVAL_MS: u64 = 5000;

/// A partial set of options. Unset fields inherit from lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionSet {
    /// Filesystem block size in bytes.
    pub block_size: Option<u32>,
    /// Btree node size in bytes.
    pub btree_node_size: Option<u32>,
    /// Metadata copies to keep.
    pub metadata_replicas: Option<u8>,
    /// User data copies to keep.
    pub data_replicas: Option<u8>,
    /// Minimum metadata copies tolerated when forced.
    pub metadata_replicas_required: Option<u8>,
    /// Minimum data copies tolerated when forced.
    pub data_replicas_required: Option<u8>,
    /// Start read-only.
    pub read_only: Option<bool>,
    /// Never write to the devices.
    pub nochanges: Option<bool>,
    /// Skip journal replay.
    pub noreplay: Option<bool>,
    /// Skip the consistency check after replay.
    pub norecovery: Option<bool>,
    /// Skip the consistency check.
    pub nofsck: Option<bool>,
    /// Let the consistency check repair what it finds.
    pub fix_errors: Option<bool>,
    /// Allow starting with members missing.
    pub degraded: Option<bool>,
    /// Assemble without running startup.
    pub nostart: Option<bool>,
    /// Log startup progress at info level.
    pub verbose: Option<bool>,
    /// Interval between rate-controller updates.
    pub rate_update_interval_ms: Option<u64>,
}

impl OptionSet {
    /// An option set with nothing set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in defaults, every field set.
    pub fn defaults() -> Self {
        Self {
            block_size: Some(DEFAULT_BLOCK_SIZE),
            btree_node_size: Some(DEFAULT_BTREE_NODE_SIZE),
            metadata_replicas: Some(1),
            data_replicas: Some(1),
            metadata_replicas_required: Some(1),
            data_replicas_required: Some(1),
            read_only: Some(false),
            nochanges: Some(false),
            noreplay: Some(false),
            norecovery: Some(false),
            nofsck: Some(false),
            fix_errors: Some(false),
            degraded: Some(false),
            nostart: Some(false),
            verbose: Some(false),
            rate_update_interval_ms: Some(DEFAULT_RATE_UPDATE_INTERVAL_MS),
        }
    }

    /// Overlays every field set in `other` onto `self`.
    pub fn apply(&mut self, other: &OptionSet) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            block_size,
            btree_node_size,
            metadata_replicas,
            data_replicas,
            metadata_replicas_required,
            data_replicas_required,
            read_only,
            nochanges,
            noreplay,
            norecovery,
            nofsck,
            fix_errors,
            degraded,
            nostart,
            verbose,
            rate_update_interval_ms
        );
    }

    /// Parses a comma-separated mount option string such as
    /// `"ro,degraded,metadata_replicas=2"`.
    pub fn parse(opts: &str) -> FsResult<Self> {
        let mut set = OptionSet::empty();
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (name, value) = match opt.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (opt, None),
            };
            match name {
                "ro" | "read_only" => set.read_only = Some(parse_flag(opt, value)?),
                "rw" => set.read_only = Some(!parse_flag(opt, value)?),
                "nochanges" => set.nochanges = Some(parse_flag(opt, value)?),
                "noreplay" => set.noreplay = Some(parse_flag(opt, value)?),
                "norecovery" => set.norecovery = Some(parse_flag(opt, value)?),
                "nofsck" => set.nofsck = Some(parse_flag(opt, value)?),
                "fix_errors" => set.fix_errors = Some(parse_flag(opt, value)?),
                "degraded" => set.degraded = Some(parse_flag(opt, value)?),
                "nostart" => set.nostart = Some(parse_flag(opt, value)?),
                "verbose" => set.verbose = Some(parse_flag(opt, value)?),
                "block_size" => set.block_size = Some(parse_num(opt, value)?),
                "btree_node_size" => set.btree_node_size = Some(parse_num(opt, value)?),
                "metadata_replicas" => set.metadata_replicas = Some(parse_num(opt, value)?),
                "data_replicas" => set.data_replicas = Some(parse_num(opt, value)?),
                "metadata_replicas_required" => {
                    set.metadata_replicas_required = Some(parse_num(opt, value)?)
                }
                "data_replicas_required" => {
                    set.data_replicas_required = Some(parse_num(opt, value)?)
                }
                "rate_update_interval_ms" => {
                    set.rate_update_interval_ms = Some(parse_num(opt, value)?)
                }
                _ => {
                    return Err(FsError::InvalidOption {
                        option: opt.to_string(),
                        reason: "unknown option".to_string(),
                    })
                }
            }
        }
        Ok(set)
    }

    /// Loads an option set from JSON.
    pub fn from_json(json: &str) -> FsResult<Self> {
        serde_json::from_str(json).map_err(|e| FsError::InvalidOption {
            option: "<json>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Layers defaults < `sb` < `overrides` and resolves the result.
    pub fn merge(sb: &OptionSet, overrides: &OptionSet) -> FsOptions {
        let mut merged = OptionSet::defaults();
        merged.apply(sb);
        merged.apply(overrides);
        FsOptions::resolve(&merged)
    }
}

fn parse_flag(opt: &str, value: Option<&str>) -> FsResult<bool> {
    match value {
        None | Some("yes") | Some("true") | Some("1") => Ok(true),
        Some("no") | Some("false") | Some("0") => Ok(false),
        Some(other) => Err(FsError::InvalidOption {
            option: opt.to_string(),
            reason: format!("expected a boolean, got '{}'", other),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(opt: &str, value: Option<&str>) -> FsResult<T> {
    let value = value.ok_or_else(|| FsError::InvalidOption {
        option: opt.to_string(),
        reason: "missing value".to_string(),
    })?;
    value.parse().map_err(|_| FsError::InvalidOption {
        option: opt.to_string(),
        reason: format!("'{}' is not a number", value),
    })
}

/// Fully resolved options of a running filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsOptions {
    /// Filesystem block size in bytes.
    pub block_size: u32,
    /// Btree node size in bytes.
    pub btree_node_size: u32,
    /// Metadata copies to keep.
    pub metadata_replicas: u8,
    /// User data copies to keep.
    pub data_replicas: u8,
    /// Minimum metadata copies tolerated when forced.
    pub metadata_replicas_required: u8,
    /// Minimum data copies tolerated when forced.
    pub data_replicas_required: u8,
    /// Start read-only.
    pub read_only: bool,
    /// Never write to the devices.
    pub nochanges: bool,
    /// Skip journal replay.
    pub noreplay: bool,
    /// Skip the consistency check after replay.
    pub norecovery: bool,
    /// Skip the consistency check.
    pub nofsck: bool,
    /// Let the consistency check repair what it finds.
    pub fix_errors: bool,
    /// Allow starting with members missing.
    pub degraded: bool,
    /// Assemble without running startup.
    pub nostart: bool,
    /// Log startup progress at info level.
    pub verbose: bool,
    /// Interval between rate-controller updates.
    pub rate_update_interval_ms: u64,
}

impl FsOptions {
    /// Resolves a merged option set, filling gaps from the defaults and
    /// applying `noreplay => nochanges => read_only`.
    pub fn resolve(set: &OptionSet) -> Self {
        let mut full = OptionSet::defaults();
        full.apply(set);
        let noreplay = full.noreplay.unwrap_or_default();
        let nochanges = full.nochanges.unwrap_or_default() || noreplay;
        let read_only = full.read_only.unwrap_or_default() || nochanges;
        Self {
            block_size: full.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
            btree_node_size: full.btree_node_size.unwrap_or(DEFAULT_BTREE_NODE_SIZE),
            metadata_replicas: full.metadata_replicas.unwrap_or(1),
            data_replicas: full.data_replicas.unwrap_or(1),
            metadata_replicas_required: full.metadata_replicas_required.unwrap_or(1),
            data_replicas_required: full.data_replicas_required.unwrap_or(1),
            read_only,
            nochanges,
            noreplay,
            norecovery: full.norecovery.unwrap_or_default(),
            nofsck: full.nofsck.unwrap_or_default(),
            fix_errors: full.fix_errors.unwrap_or_default(),
            degraded: full.degraded.unwrap_or_default(),
            nostart: full.nostart.unwrap_or_default(),
            verbose: full.verbose.unwrap_or_default(),
            rate_update_interval_ms: full
                .rate_update_interval_ms
                .unwrap_or(DEFAULT_RATE_UPDATE_INTERVAL_MS),
        }
    }
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions::resolve(&OptionSet::empty())
    }
}
