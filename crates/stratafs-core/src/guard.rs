//! Replica-sufficiency guard for membership-state changes.
//!
//! Pure decision logic: nothing here mutates state. Every membership change
//! must pass [`check`] before it is applied.

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::options::FsOptions;
use crate::replicas::{have_enough_devs, ReplicasTable};
use crate::types::{DevIdx, DevMask, ForceFlags, MemberState};

/// Configured replica counts and their forced floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPolicy {
    /// Metadata copies to keep.
    pub metadata_replicas: u8,
    /// User data copies to keep.
    pub data_replicas: u8,
    /// Minimum metadata copies tolerated when forced.
    pub metadata_required: u8,
    /// Minimum data copies tolerated when forced.
    pub data_required: u8,
}

impl ReplicationPolicy {
    /// Policy from resolved options.
    pub fn from_options(opts: &FsOptions) -> Self {
        Self {
            metadata_replicas: opts.metadata_replicas,
            data_replicas: opts.data_replicas,
            metadata_required: opts.metadata_replicas_required,
            data_required: opts.data_replicas_required,
        }
    }

    /// Writable devices that must remain, given which floors are forced.
    pub fn required_rw(&self, flags: ForceFlags) -> u32 {
        let meta = if flags.contains(ForceFlags::METADATA_DEGRADED) {
            self.metadata_required
        } else {
            self.metadata_replicas
        };
        let data = if flags.contains(ForceFlags::DATA_DEGRADED) {
            self.data_required
        } else {
            self.data_replicas
        };
        meta.max(data) as u32
    }
}

/// Snapshot of a device involved in a proposed change.
#[derive(Debug, Clone, Copy)]
pub struct StateChange {
    /// Device being changed.
    pub dev: DevIdx,
    /// Its current membership state.
    pub from: MemberState,
    /// Requested membership state.
    pub to: MemberState,
}

/// Everything the guard needs to know about the filesystem.
pub struct GuardContext<'a, F>
where
    F: Fn() -> DevMask,
{
    /// Replica policy.
    pub policy: ReplicationPolicy,
    /// Number of RW members other than the one being changed.
    pub other_rw: u32,
    /// Committed replica-usage table.
    pub replicas: &'a ReplicasTable,
    /// Online devices; only evaluated when a read-sufficiency check is needed.
    pub online: F,
}

/// Decides whether the change is safe.
pub fn allowed<F>(ctx: &GuardContext<'_, F>, change: StateChange, flags: ForceFlags) -> bool
where
    F: Fn() -> DevMask,
{
    match (change.from, change.to) {
        (_, MemberState::Rw) => true,
        (MemberState::Rw, MemberState::Ro) => ctx.other_rw >= ctx.policy.required_rw(flags),
        (MemberState::Rw | MemberState::Ro, MemberState::Failed | MemberState::Spare) => {
            let mut online = (ctx.online)();
            online.clear(change.dev);
            have_enough_devs(&ctx.replicas.status(online), flags)
        }
        _ => true,
    }
}

/// Like [`allowed`], returning [`FsError::InsufficientReplication`] on refusal.
pub fn check<F>(ctx: &GuardContext<'_, F>, change: StateChange, flags: ForceFlags) -> FsResult<()>
where
    F: Fn() -> DevMask,
{
    if allowed(ctx, change, flags) {
        return Ok(());
    }
    debug!(dev = %change.dev, from = %change.from, to = %change.to, "state change refused");
    Err(FsError::InsufficientReplication {
        dev: change.dev,
        target: change.to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;
    use std::cell::Cell;

    fn policy(replicas: u8, required: u8) -> ReplicationPolicy {
        ReplicationPolicy {
            metadata_replicas: replicas,
            data_replicas: replicas,
            metadata_required: required,
            data_required: required,
        }
    }

    fn mask(devs: &[u8]) -> DevMask {
        devs.iter().map(|d| DevIdx(*d)).collect()
    }

    fn change(from: MemberState, to: MemberState) -> StateChange {
        StateChange {
            dev: DevIdx(0),
            from,
            to,
        }
    }

    #[test]
    fn test_to_rw_always_allowed() {
        let table = ReplicasTable::new();
        let ctx = GuardContext {
            policy: policy(3, 3),
            other_rw: 0,
            replicas: &table,
            online: DevMask::empty,
        };
        for from in MemberState::ALL {
            assert!(allowed(&ctx, change(from, MemberState::Rw), ForceFlags::NONE));
        }
    }

    #[test]
    fn test_rw_to_ro_counts_other_rw() {
        let table = ReplicasTable::new();
        let mut ctx = GuardContext {
            policy: policy(2, 1),
            other_rw: 1,
            replicas: &table,
            online: DevMask::empty,
        };
        let req = change(MemberState::Rw, MemberState::Ro);
        assert!(!allowed(&ctx, req, ForceFlags::NONE));
        assert!(!allowed(&ctx, req, ForceFlags::METADATA_DEGRADED));
        assert!(allowed(&ctx, req, ForceFlags::DEGRADED));

        ctx.other_rw = 2;
        assert!(allowed(&ctx, req, ForceFlags::NONE));
    }

    #[test]
    fn test_failed_checks_readability() {
        let mut table = ReplicasTable::new();
        table.mark(DataType::Btree, mask(&[0, 1]));
        table.mark(DataType::Journal, mask(&[0, 1]));
        let ctx = GuardContext {
            policy: policy(2, 1),
            other_rw: 1,
            replicas: &table,
            online: || mask(&[0, 1]),
        };
        let req = change(MemberState::Ro, MemberState::Failed);
        assert!(!allowed(&ctx, req, ForceFlags::NONE));
        assert!(allowed(&ctx, req, ForceFlags::METADATA_DEGRADED));

        let err = check(&ctx, req, ForceFlags::NONE).unwrap_err();
        assert!(matches!(
            err,
            FsError::InsufficientReplication {
                target: MemberState::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_online_mask_is_lazy() {
        let table = ReplicasTable::new();
        let calls = Cell::new(0);
        let ctx = GuardContext {
            policy: policy(1, 1),
            other_rw: 1,
            replicas: &table,
            online: || {
                calls.set(calls.get() + 1);
                DevMask::empty()
            },
        };
        assert!(allowed(&ctx, change(MemberState::Rw, MemberState::Ro), ForceFlags::NONE));
        assert_eq!(calls.get(), 0);
        assert!(allowed(&ctx, change(MemberState::Rw, MemberState::Spare), ForceFlags::NONE));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_other_transitions_allowed() {
        let mut table = ReplicasTable::new();
        table.mark(DataType::User, mask(&[0]));
        let ctx = GuardContext {
            policy: policy(4, 4),
            other_rw: 0,
            replicas: &table,
            online: || mask(&[0]),
        };
        assert!(allowed(&ctx, change(MemberState::Failed, MemberState::Spare), ForceFlags::NONE));
        assert!(allowed(&ctx, change(MemberState::Spare, MemberState::Ro), ForceFlags::NONE));
    }
}
