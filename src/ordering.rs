//! Memory-order codes shared by the pass and the runtime
//!
//! The pass lowers IR orderings to small integers passed to the atomic
//! hooks; the runtime maps them back onto `std::sync::atomic::Ordering`.

use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::ir::AtomicOrdering;

/// Ordering as encoded in the hook ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum MemoryOrder {
    Relaxed = 0,
    /// Reserved code; never emitted by the pass
    Consume = 1,
    Acquire = 2,
    Release = 3,
    AcqRel = 4,
    SeqCst = 5,
}

impl MemoryOrder {
    /// Lower an IR ordering, `None` for orderings the ABI does not accept
    pub fn lower(ordering: AtomicOrdering) -> Option<Self> {
        match ordering {
            AtomicOrdering::Unordered | AtomicOrdering::Monotonic => Some(MemoryOrder::Relaxed),
            AtomicOrdering::Consume => None,
            AtomicOrdering::Acquire => Some(MemoryOrder::Acquire),
            AtomicOrdering::Release => Some(MemoryOrder::Release),
            AtomicOrdering::AcquireRelease => Some(MemoryOrder::AcqRel),
            AtomicOrdering::SequentiallyConsistent => Some(MemoryOrder::SeqCst),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a code received from instrumented code
    ///
    /// Consume is strengthened to acquire; unknown codes to sequential
    /// consistency.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MemoryOrder::Relaxed,
            1 | 2 => MemoryOrder::Acquire,
            3 => MemoryOrder::Release,
            4 => MemoryOrder::AcqRel,
            _ => MemoryOrder::SeqCst,
        }
    }

    /// Ordering valid for a read-modify-write
    pub fn for_rmw(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed => Ordering::Relaxed,
            MemoryOrder::Consume | MemoryOrder::Acquire => Ordering::Acquire,
            MemoryOrder::Release => Ordering::Release,
            MemoryOrder::AcqRel => Ordering::AcqRel,
            MemoryOrder::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering valid for a load; release components are dropped
    pub fn for_load(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed | MemoryOrder::Release => Ordering::Relaxed,
            MemoryOrder::Consume | MemoryOrder::Acquire | MemoryOrder::AcqRel => Ordering::Acquire,
            MemoryOrder::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering valid for a store; acquire components are dropped
    pub fn for_store(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed | MemoryOrder::Consume | MemoryOrder::Acquire => Ordering::Relaxed,
            MemoryOrder::Release | MemoryOrder::AcqRel => Ordering::Release,
            MemoryOrder::SeqCst => Ordering::SeqCst,
        }
    }

    /// Failure ordering of a compare-exchange
    pub fn for_failure(self) -> Ordering {
        self.for_load()
    }

    /// Ordering for a fence, `None` when a fence would be a no-op
    pub fn for_fence(self) -> Option<Ordering> {
        match self {
            MemoryOrder::Relaxed => None,
            other => Some(other.for_rmw()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowering_codes() {
        let cases = [
            (AtomicOrdering::Unordered, Some(0)),
            (AtomicOrdering::Monotonic, Some(0)),
            (AtomicOrdering::Consume, None),
            (AtomicOrdering::Acquire, Some(2)),
            (AtomicOrdering::Release, Some(3)),
            (AtomicOrdering::AcquireRelease, Some(4)),
            (AtomicOrdering::SequentiallyConsistent, Some(5)),
        ];
        for (ordering, code) in cases {
            assert_eq!(MemoryOrder::lower(ordering).map(MemoryOrder::code), code, "{:?}", ordering);
        }
    }

    #[test]
    fn test_code_round_trip() {
        for order in [
            MemoryOrder::Relaxed,
            MemoryOrder::Acquire,
            MemoryOrder::Release,
            MemoryOrder::AcqRel,
            MemoryOrder::SeqCst,
        ] {
            assert_eq!(MemoryOrder::from_code(order.code()), order);
        }
        assert_eq!(MemoryOrder::from_code(1), MemoryOrder::Acquire);
        assert_eq!(MemoryOrder::from_code(-7), MemoryOrder::SeqCst);
        assert_eq!(MemoryOrder::from_code(42), MemoryOrder::SeqCst);
    }

    #[test]
    fn test_std_orderings_valid_for_operation() {
        assert_eq!(MemoryOrder::Release.for_load(), Ordering::Relaxed);
        assert_eq!(MemoryOrder::AcqRel.for_load(), Ordering::Acquire);
        assert_eq!(MemoryOrder::Acquire.for_store(), Ordering::Relaxed);
        assert_eq!(MemoryOrder::AcqRel.for_store(), Ordering::Release);
        assert_eq!(MemoryOrder::Release.for_failure(), Ordering::Relaxed);
        assert_eq!(MemoryOrder::Relaxed.for_fence(), None);
        assert_eq!(MemoryOrder::SeqCst.for_fence(), Some(Ordering::SeqCst));
    }
}
