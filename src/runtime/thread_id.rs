//! Opaque per-thread identity

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadId = ThreadId::fresh();
}

/// Identity of an OS thread, assigned on first use
///
/// Only usable as a map key and for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Identity of the calling thread
    pub fn current() -> Self {
        // During thread teardown the slot may already be gone
        CURRENT.try_with(|id| *id).unwrap_or_else(|_| Self::fresh())
    }

    /// Identity with a fixed value, for detectors replaying recorded events
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn fresh() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}
