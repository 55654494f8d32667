//! Connectivity oracle consulted before a transfer starts.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the device currently has a network path to the origin.
///
/// The platform layer owns the real signal; the manager only asks.
pub trait Reachability: Send + Sync {
    /// Returns true if a transfer may be attempted now.
    fn is_online(&self) -> bool;
}

/// Assumes the network is always there.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Reachability for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// A switch the host application flips from its own connectivity callbacks.
#[derive(Debug)]
pub struct ReachabilityFlag(AtomicBool);

impl ReachabilityFlag {
    /// Creates a flag with the given initial state.
    #[must_use]
    pub const fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    /// Records the current connectivity.
    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::Relaxed);
    }
}

impl Default for ReachabilityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Reachability for ReachabilityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
