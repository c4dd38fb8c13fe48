//! Instrumentation selector
//!
//! Walks a routine one straight-line region at a time and decides which
//! plain accesses need a runtime hook. A region is a maximal run of
//! instructions inside one block with no call between them: a call may
//! access anything, so local reasoning stops there.
//!
//! Within a region the accesses are scanned backwards while a write-set
//! accumulates the addresses that are written later on. A read of an address
//! in the write-set is redundant: the later write reaches the runtime for the
//! same address with no intervening call that could synchronize.

use fnv::FnvHashSet;

use crate::classify::{classify, AccessKind, AccessSize, MemoryOp};
use crate::eligibility::EligibilityFilter;
use crate::ir::{DataLayout, InstId, Pointer, Routine};
use crate::stats::{InstrumentationStats, SkipReason};

/// A plain access chosen for instrumentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAccess {
    pub op: MemoryOp,
    pub size: AccessSize,
}

/// Everything the injector needs to rewrite one routine
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Plain reads and writes to instrument, in program order
    pub accesses: Vec<SelectedAccess>,
    /// Atomic loads/stores, RMW, CAS and fences, in program order
    pub atomics: Vec<MemoryOp>,
    /// memset/memcpy/memmove intrinsics
    pub bulk_ops: Vec<MemoryOp>,
    /// Every call, invoke and intrinsic call site
    pub calls: Vec<InstId>,
}

impl Selection {
    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn is_selected(&self, inst: InstId) -> bool {
        self.accesses.iter().any(|access| access.op.inst == inst)
    }
}

/// Region-based selector for one routine
#[derive(Debug)]
pub struct InstrumentationSelector<'a> {
    filter: EligibilityFilter<'a>,
    layout: DataLayout,
}

impl<'a> InstrumentationSelector<'a> {
    pub fn new(filter: EligibilityFilter<'a>, layout: DataLayout) -> Self {
        Self { filter, layout }
    }

    /// Collect the routine's instrumentation candidates
    pub fn select(&self, routine: &Routine, stats: &mut InstrumentationStats) -> Selection {
        let mut selection = Selection::default();
        let mut region: Vec<MemoryOp> = Vec::with_capacity(8);

        for block in &routine.blocks {
            for inst in &block.instructions {
                if inst.op.is_call_like() {
                    if let Some(op) = classify(inst, &routine.name, &self.layout) {
                        selection.bulk_ops.push(op);
                    }
                    selection.calls.push(inst.id);
                    self.choose(&mut region, &mut selection.accesses, stats);
                    continue;
                }

                let Some(op) = classify(inst, &routine.name, &self.layout) else {
                    continue;
                };
                if op.kind.is_atomic() {
                    selection.atomics.push(op);
                } else if op.kind.is_plain() {
                    region.push(op);
                }
            }
            self.choose(&mut region, &mut selection.accesses, stats);
        }

        tracing::debug!(
            routine = %routine.name,
            accesses = selection.accesses.len(),
            atomics = selection.atomics.len(),
            bulk_ops = selection.bulk_ops.len(),
            calls = selection.calls.len(),
            "selected instrumentation sites"
        );
        selection
    }

    /// Reduce one region and append the survivors to `all` in program order
    fn choose(
        &self,
        region: &mut Vec<MemoryOp>,
        all: &mut Vec<SelectedAccess>,
        stats: &mut InstrumentationStats,
    ) {
        let mut write_targets: FnvHashSet<Pointer> = FnvHashSet::default();
        let mut chosen = Vec::with_capacity(region.len());

        for op in region.drain(..).rev() {
            let Some(ptr) = op.address.as_ref() else {
                continue;
            };

            if let Err(reason) = self.filter.check_address(ptr) {
                skip(&op, reason, stats);
                continue;
            }

            if op.kind == AccessKind::Write {
                write_targets.insert(ptr.clone());
            } else {
                if write_targets.contains(ptr) {
                    skip(&op, SkipReason::ReadBeforeWrite, stats);
                    continue;
                }
                if let Err(reason) = self.filter.check_constant_data(ptr) {
                    skip(&op, reason, stats);
                    continue;
                }
            }

            if let Err(reason) = self.filter.check_locality(ptr) {
                skip(&op, reason, stats);
                continue;
            }

            match op.size() {
                Some(size) => chosen.push(SelectedAccess { op, size }),
                None => skip(&op, SkipReason::BadSize, stats),
            }
        }

        chosen.reverse();
        all.extend(chosen);
    }
}

fn skip(op: &MemoryOp, reason: SkipReason, stats: &mut InstrumentationStats) {
    stats.record_skip(reason);
    tracing::trace!(
        routine = %op.routine,
        inst = %op.inst,
        line = op.line,
        reason = %reason,
        "access not instrumented"
    );
}
