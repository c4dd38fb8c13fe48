//! Access classification
//!
//! Turns one instruction into a `MemoryOp`: what kind of access it is, the
//! address it touches and how many bytes. Classification happens once; the
//! selector, the filter and the injector all match on the result.

use serde::Serialize;
use std::fmt;

use crate::ir::{DataLayout, InstId, Instruction, Op, Pointer, SyncScope};

/// Kind of memory operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    AtomicLoad,
    AtomicStore,
    AtomicRmw,
    AtomicCas,
    Fence,
    BulkMemOp,
}

impl AccessKind {
    /// Atomics and fences are instrumented even outside sanitized routines
    pub fn is_atomic(self) -> bool {
        matches!(
            self,
            AccessKind::AtomicLoad
                | AccessKind::AtomicStore
                | AccessKind::AtomicRmw
                | AccessKind::AtomicCas
                | AccessKind::Fence
        )
    }

    pub fn is_plain(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::Write)
    }
}

/// Supported access widths; the discriminant is log2 of the byte size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AccessSize {
    S1 = 0,
    S2 = 1,
    S4 = 2,
    S8 = 3,
    S16 = 4,
}

impl AccessSize {
    pub const ALL: [AccessSize; 5] = [
        AccessSize::S1,
        AccessSize::S2,
        AccessSize::S4,
        AccessSize::S8,
        AccessSize::S16,
    ];

    /// Map a byte count to its size class; anything else is not instrumentable
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            1 => Some(AccessSize::S1),
            2 => Some(AccessSize::S2),
            4 => Some(AccessSize::S4),
            8 => Some(AccessSize::S8),
            16 => Some(AccessSize::S16),
            _ => None,
        }
    }

    /// log2 of the byte size, indexes per-size hook tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn bytes(self) -> u32 {
        1 << self.index()
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

impl fmt::Display for AccessSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// One classified memory operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOp {
    pub inst: InstId,
    pub kind: AccessKind,
    /// Address touched; fences have none
    pub address: Option<Pointer>,
    /// Bytes accessed; 0 for fences and bulk ops
    pub byte_size: u64,
    /// Declared alignment, 0 when unspecified
    pub alignment: u32,
    pub line: u32,
    pub routine: String,
    /// Marked as a vtable-pointer access
    pub vtable: bool,
}

impl MemoryOp {
    pub fn size(&self) -> Option<AccessSize> {
        AccessSize::from_bytes(self.byte_size)
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, AccessKind::Write | AccessKind::AtomicStore)
    }
}

/// Classify an instruction, or `None` if it does not access memory
///
/// Loads and stores with single-thread scope only synchronize with signal
/// handlers on the same thread, so they are plain accesses here.
pub fn classify(inst: &Instruction, routine: &str, layout: &DataLayout) -> Option<MemoryOp> {
    let line = inst.loc.as_ref().map_or(0, |loc| loc.line);
    let make = |kind: AccessKind, ptr: Option<&Pointer>, alignment: u32| {
        let byte_size = match kind {
            AccessKind::Fence | AccessKind::BulkMemOp => 0,
            _ => ptr.map_or(0, |p| p.pointee.store_size(layout)),
        };
        MemoryOp {
            inst: inst.id,
            kind,
            address: ptr.cloned(),
            byte_size,
            alignment,
            line,
            routine: routine.to_string(),
            vtable: inst.vtable_access,
        }
    };

    let cross_thread = |atomic: &Option<crate::ir::AtomicInfo>| {
        matches!(atomic, Some(info) if info.scope == SyncScope::CrossThread)
    };

    let op = match &inst.op {
        Op::Load { ptr, align, atomic } => {
            let kind = if cross_thread(atomic) { AccessKind::AtomicLoad } else { AccessKind::Read };
            make(kind, Some(ptr), *align)
        }
        Op::Store { ptr, align, atomic, .. } => {
            let kind = if cross_thread(atomic) { AccessKind::AtomicStore } else { AccessKind::Write };
            make(kind, Some(ptr), *align)
        }
        Op::AtomicRmw { ptr, .. } => make(AccessKind::AtomicRmw, Some(ptr), 0),
        Op::CmpXchg { ptr, .. } => make(AccessKind::AtomicCas, Some(ptr), 0),
        Op::Fence { .. } => make(AccessKind::Fence, None, 0),
        Op::MemSet { dst, .. } | Op::MemCpy { dst, .. } | Op::MemMove { dst, .. } => {
            make(AccessKind::BulkMemOp, Some(dst), 0)
        }
        Op::Call { .. } | Op::Invoke { .. } | Op::Other { .. } => return None,
    };
    Some(op)
}
