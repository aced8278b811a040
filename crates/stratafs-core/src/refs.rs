//! Kill-and-drain reference gate.
//!
//! A gate hands out references while it is live. Killing it refuses new
//! references; whoever drops the last outstanding reference after the kill
//! is told so, and [`RefGate::wait_drained`] blocks until that happens.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct GateState {
    count: u64,
    live: bool,
}

/// Reference counter that can be closed and drained.
#[derive(Debug)]
pub struct RefGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl RefGate {
    /// A gate accepting references.
    pub fn new_live() -> Self {
        Self::new(true)
    }

    /// A gate that refuses references until [`RefGate::reinit`].
    pub fn new_dead() -> Self {
        Self::new(false)
    }

    fn new(live: bool) -> Self {
        Self {
            state: Mutex::new(GateState { count: 0, live }),
            drained: Condvar::new(),
        }
    }

    /// Takes a reference if the gate is live.
    pub fn try_get(&self) -> bool {
        let mut state = self.state.lock();
        if !state.live {
            return false;
        }
        state.count += 1;
        true
    }

    /// Drops a reference. Returns `true` if this was the last reference of
    /// a killed gate.
    pub fn put(&self) -> bool {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        let drained = !state.live && state.count == 0;
        if drained {
            self.drained.notify_all();
        }
        drained
    }

    /// Refuses new references. Returns `true` if nothing was outstanding.
    pub fn kill(&self) -> bool {
        let mut state = self.state.lock();
        state.live = false;
        let drained = state.count == 0;
        if drained {
            self.drained.notify_all();
        }
        drained
    }

    /// Blocks until the gate is killed and has no references.
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        while state.live || state.count > 0 {
            self.drained.wait(&mut state);
        }
    }

    /// Reopens a killed gate.
    pub fn reinit(&self) {
        self.state.lock().live = true;
    }

    /// Returns whether the gate accepts references.
    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    /// Outstanding references.
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_live_gate_counts() {
        let gate = RefGate::new_live();
        assert!(gate.try_get());
        assert!(gate.try_get());
        assert_eq!(gate.count(), 2);
        assert!(!gate.put());
        assert!(!gate.put());
        assert_eq!(gate.count(), 0);
    }

    #[test]
    fn test_dead_gate_refuses() {
        let gate = RefGate::new_dead();
        assert!(!gate.try_get());
        gate.reinit();
        assert!(gate.try_get());
    }

    #[test]
    fn test_kill_reports_drain() {
        let gate = RefGate::new_live();
        assert!(gate.kill());
        gate.wait_drained();

        gate.reinit();
        assert!(gate.try_get());
        assert!(!gate.kill());
        assert!(!gate.try_get());
        assert!(gate.put());
    }

    #[test]
    fn test_wait_drained_blocks_until_put() {
        let gate = Arc::new(RefGate::new_live());
        assert!(gate.try_get());
        gate.kill();

        let g = gate.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            g.put()
        });

        gate.wait_drained();
        assert_eq!(gate.count(), 0);
        assert!(releaser.join().unwrap());
    }
}
