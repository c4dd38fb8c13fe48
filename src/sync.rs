//! Recognition of thread and lock primitives
//!
//! Direct calls to the pthread creation, join and mutex routines get a marker
//! call so the detector can add the matching happens-before edge. Markers
//! for operations that acquire go after the call; release markers go before.

use crate::abi::{Hook, HookArg, HookCall};
use crate::injector::RewritePlan;
use crate::ir::{Instruction, Op, Operand};
use crate::stats::InstrumentationStats;

/// Synchronization primitive recognized at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPrimitive {
    ThreadCreate,
    ThreadJoin,
    MutexLock,
    MutexUnlock,
}

/// Where a marker goes relative to its call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before,
    After,
}

/// Callee prefixes; versioned symbols (`pthread_create@GLIBC_2.2.5`) match too
const PRIMITIVES: [(&str, SyncPrimitive); 4] = [
    ("pthread_create", SyncPrimitive::ThreadCreate),
    ("pthread_join", SyncPrimitive::ThreadJoin),
    ("pthread_mutex_lock", SyncPrimitive::MutexLock),
    ("pthread_mutex_unlock", SyncPrimitive::MutexUnlock),
];

impl SyncPrimitive {
    pub fn from_callee(name: &str) -> Option<Self> {
        PRIMITIVES
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|&(_, primitive)| primitive)
    }

    pub fn hook(self) -> Hook {
        match self {
            SyncPrimitive::ThreadCreate => Hook::ThreadCreate,
            SyncPrimitive::ThreadJoin => Hook::ThreadJoin,
            SyncPrimitive::MutexLock => Hook::ThreadLock,
            SyncPrimitive::MutexUnlock => Hook::ThreadUnlock,
        }
    }

    /// An unlock must publish before the lock is released
    pub fn placement(self) -> Placement {
        match self {
            SyncPrimitive::MutexUnlock => Placement::Before,
            SyncPrimitive::ThreadCreate | SyncPrimitive::ThreadJoin | SyncPrimitive::MutexLock => {
                Placement::After
            }
        }
    }
}

/// Adds happens-before markers around recognized calls
#[derive(Debug, Default)]
pub struct SynchronizationDetector;

impl SynchronizationDetector {
    pub fn new() -> Self {
        Self
    }

    /// Recognize one call site, returning the primitive and its marker
    pub fn recognize(&self, inst: &Instruction) -> Option<(SyncPrimitive, HookCall)> {
        let (callee, args) = match &inst.op {
            Op::Call { callee, args, .. } | Op::Invoke { callee, args, .. } => (callee, args),
            _ => return None,
        };
        let primitive = SyncPrimitive::from_callee(callee.name()?)?;
        let handle = args.first().cloned().unwrap_or(Operand::Const(0));
        Some((primitive, HookCall::new(primitive.hook(), vec![HookArg::Value(handle)])))
    }

    /// Add markers for every recognized call to the plan
    pub fn instrument<'a>(
        &self,
        calls: impl IntoIterator<Item = &'a Instruction>,
        plan: &mut RewritePlan,
        stats: &mut InstrumentationStats,
    ) -> usize {
        let mut added = 0;
        for inst in calls {
            let Some((primitive, marker)) = self.recognize(inst) else {
                continue;
            };
            tracing::trace!(inst = %inst.id, ?primitive, "synchronization marker");
            match primitive.placement() {
                Placement::Before => plan.insert_before(inst.id, marker),
                Placement::After => plan.insert_after(inst.id, marker),
            }
            added += 1;
        }
        stats.sync_markers += added as u64;
        added
    }
}
