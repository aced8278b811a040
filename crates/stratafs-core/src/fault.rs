//! Named fault points for exercising cleanup paths.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{FsError, FsResult};

/// Places where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Filesystem instance allocation.
    FsAlloc,
    /// Device record allocation.
    DevAlloc,
    /// End of the startup sequence, before going RO/RW.
    FsStart,
    /// Free-slot search while adding a device.
    AddNoSlot,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultPoint::FsAlloc => "fs_alloc",
            FaultPoint::DevAlloc => "dev_alloc",
            FaultPoint::FsStart => "fs_start",
            FaultPoint::AddNoSlot => "add:no_slot",
        };
        f.write_str(s)
    }
}

/// Set of armed fault points. Disarmed by default.
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<HashSet<FaultPoint>>,
}

impl FaultInjector {
    /// Creates an injector with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a fault point; every later check of it fails.
    pub fn arm(&self, point: FaultPoint) {
        self.armed.lock().insert(point);
    }

    /// Disarms a fault point.
    pub fn disarm(&self, point: FaultPoint) {
        self.armed.lock().remove(&point);
    }

    /// Returns whether the point is armed.
    pub fn is_armed(&self, point: FaultPoint) -> bool {
        self.armed.lock().contains(&point)
    }

    /// Fails with [`FsError::Fault`] if the point is armed.
    pub fn check(&self, point: FaultPoint) -> FsResult<()> {
        if self.is_armed(point) {
            warn!(%point, "injected fault");
            return Err(FsError::Fault { point });
        }
        Ok(())
    }
}
