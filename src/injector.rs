//! Callback injection
//!
//! Builds the hook call for each selected site and assembles the rewritten
//! routine. Plain accesses get a check call placed before them; atomics and
//! bulk-memory intrinsics are replaced by the call outright, since the
//! runtime performs the operation itself.

use fnv::FnvHashMap;
use serde::Serialize;
use std::fmt;

use crate::abi::{Hook, HookArg, HookCall, RmwHook};
use crate::classify::{AccessKind, AccessSize, MemoryOp};
use crate::debug_info::DebugInfoOracle;
use crate::ir::{InstId, Instruction, Op, Operand, Routine, SyncScope, Terminator};
use crate::ordering::MemoryOrder;
use crate::selector::SelectedAccess;
use crate::stats::InstrumentationStats;

/// Label of the synthesized block that runs exit hooks while unwinding
pub const CLEANUP_LABEL: &str = "tsan_cleanup";

/// One item of an instrumented block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Emitted {
    /// Instruction kept as is
    Original { inst: Instruction },
    /// Inserted hook call
    Hook { call: HookCall },
    /// Instruction replaced by a hook call producing the same result
    Replaced { original: InstId, call: HookCall },
    /// Compare-exchange replaced by a hook returning the old value; the pair
    /// `{old, old == expected}` is rebuilt from it
    CompareExchange {
        original: InstId,
        call: HookCall,
        expected: Operand,
    },
    Terminator { terminator: Terminator },
}

impl Emitted {
    pub fn hook_call(&self) -> Option<&HookCall> {
        match self {
            Emitted::Hook { call }
            | Emitted::Replaced { call, .. }
            | Emitted::CompareExchange { call, .. } => Some(call),
            Emitted::Original { .. } | Emitted::Terminator { .. } => None,
        }
    }
}

impl fmt::Display for Emitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Emitted::Original { inst } => write!(f, "{}", inst.op),
            Emitted::Hook { call } => write!(f, "{}", call),
            Emitted::Replaced { original, call } => write!(f, "{}  ; replaces {}", call, original),
            Emitted::CompareExchange { original, call, expected } => write!(
                f,
                "{}  ; replaces {}, success = old == {}",
                call, original, expected
            ),
            Emitted::Terminator { terminator } => match terminator {
                Terminator::Return => write!(f, "ret"),
                Terminator::Resume => write!(f, "resume"),
                Terminator::Unreachable => write!(f, "unreachable"),
                Terminator::Branch { targets } => write!(f, "br {}", targets.join(", ")),
            },
        }
    }
}

/// A rewritten basic block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentedBlock {
    pub label: String,
    pub items: Vec<Emitted>,
}

/// A rewritten routine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentedRoutine {
    pub name: String,
    pub blocks: Vec<InstrumentedBlock>,
    /// Landing block running exit hooks on unwind, when one was synthesized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<InstrumentedBlock>,
    /// False when the pass left the routine untouched
    pub modified: bool,
}

impl InstrumentedRoutine {
    /// Every hook call, in block order, cleanup block last
    pub fn hook_calls(&self) -> impl Iterator<Item = &HookCall> {
        self.blocks
            .iter()
            .chain(self.cleanup.iter())
            .flat_map(|block| block.items.iter())
            .filter_map(Emitted::hook_call)
    }

    pub fn count_hooks(&self, pred: impl Fn(&Hook) -> bool) -> usize {
        self.hook_calls().filter(|call| pred(&call.hook)).count()
    }

    pub fn block(&self, label: &str) -> Option<&InstrumentedBlock> {
        self.blocks
            .iter()
            .chain(self.cleanup.iter())
            .find(|block| block.label == label)
    }
}

impl fmt::Display for InstrumentedRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "define {} {{", self.name)?;
        for block in self.blocks.iter().chain(self.cleanup.iter()) {
            writeln!(f, "{}:", block.label)?;
            for item in &block.items {
                writeln!(f, "  {}", item)?;
            }
        }
        writeln!(f, "}}")
    }
}

/// Hook calls keyed by the instruction they attach to
#[derive(Debug, Default, Clone)]
pub struct RewritePlan {
    before: FnvHashMap<InstId, Vec<HookCall>>,
    after: FnvHashMap<InstId, Vec<HookCall>>,
    replace: FnvHashMap<InstId, Emitted>,
    /// Inserted at the top of the entry block
    pub entry: Vec<HookCall>,
    /// Inserted before every return and resume, and in the cleanup block
    pub exit: Vec<HookCall>,
    /// Route unwinding calls through a synthesized cleanup block
    pub cleanup: bool,
}

impl RewritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_before(&mut self, inst: InstId, call: HookCall) {
        self.before.entry(inst).or_default().push(call);
    }

    pub fn insert_after(&mut self, inst: InstId, call: HookCall) {
        self.after.entry(inst).or_default().push(call);
    }

    pub fn replace(&mut self, inst: InstId, with: Emitted) {
        self.replace.insert(inst, with);
    }

    /// True when applying the plan changes nothing
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.replace.is_empty()
            && self.entry.is_empty()
            && self.exit.is_empty()
    }

    /// Assemble the rewritten routine
    pub fn apply(&self, routine: &Routine) -> InstrumentedRoutine {
        let cleanup_used = self.cleanup
            && !self.exit.is_empty()
            && routine.instructions().any(|inst| inst.op.may_unwind());

        let mut blocks = Vec::with_capacity(routine.blocks.len());
        for (index, block) in routine.blocks.iter().enumerate() {
            let mut items = Vec::with_capacity(block.instructions.len() + 4);
            if index == 0 {
                items.extend(self.entry.iter().cloned().map(|call| Emitted::Hook { call }));
            }

            for inst in &block.instructions {
                if let Some(calls) = self.before.get(&inst.id) {
                    items.extend(calls.iter().cloned().map(|call| Emitted::Hook { call }));
                }
                match self.replace.get(&inst.id) {
                    Some(replacement) => items.push(replacement.clone()),
                    None if cleanup_used => items.push(Emitted::Original { inst: unwind_to_cleanup(inst) }),
                    None => items.push(Emitted::Original { inst: inst.clone() }),
                }
                if let Some(calls) = self.after.get(&inst.id) {
                    items.extend(calls.iter().cloned().map(|call| Emitted::Hook { call }));
                }
            }

            if matches!(block.terminator, Terminator::Return | Terminator::Resume) {
                items.extend(self.exit.iter().cloned().map(|call| Emitted::Hook { call }));
            }
            items.push(Emitted::Terminator { terminator: block.terminator.clone() });
            blocks.push(InstrumentedBlock { label: block.label.clone(), items });
        }

        let cleanup = cleanup_used.then(|| {
            let mut items: Vec<Emitted> =
                self.exit.iter().cloned().map(|call| Emitted::Hook { call }).collect();
            items.push(Emitted::Terminator { terminator: Terminator::Resume });
            InstrumentedBlock { label: CLEANUP_LABEL.to_string(), items }
        });

        InstrumentedRoutine {
            name: routine.name.clone(),
            blocks,
            cleanup,
            modified: !self.is_empty(),
        }
    }
}

/// Turn a call that may unwind into an invoke landing in the cleanup block
fn unwind_to_cleanup(inst: &Instruction) -> Instruction {
    match &inst.op {
        Op::Call { callee, args, may_unwind: true } => Instruction {
            op: Op::Invoke {
                callee: callee.clone(),
                args: args.clone(),
                unwind: CLEANUP_LABEL.to_string(),
            },
            ..inst.clone()
        },
        _ => inst.clone(),
    }
}

/// Builds hook calls for one routine
pub struct CallbackInjector<'a> {
    routine: &'a Routine,
    oracle: &'a dyn DebugInfoOracle,
    by_id: FnvHashMap<InstId, &'a Instruction>,
}

impl<'a> CallbackInjector<'a> {
    pub fn new(routine: &'a Routine, oracle: &'a dyn DebugInfoOracle) -> Self {
        let by_id = routine.instructions().map(|inst| (inst.id, inst)).collect();
        Self { routine, oracle, by_id }
    }

    /// Check call placed before a plain access
    pub fn instrument_access(
        &self,
        access: &SelectedAccess,
        plan: &mut RewritePlan,
        stats: &mut InstrumentationStats,
    ) {
        let op = &access.op;
        let (Some(inst), Some(ptr)) = (self.by_id.get(&op.inst), op.address.as_ref()) else {
            return;
        };
        let is_write = op.kind == AccessKind::Write;
        let line = HookArg::Line(self.oracle.line(inst));
        let var = HookArg::Str(self.oracle.variable_name(self.routine, ptr));
        let file = HookArg::Str(self.oracle.file_name(inst));
        let addr = HookArg::Address(ptr.clone());

        let call = if op.vtable && is_write {
            stats.instrumented_vtable_writes += 1;
            let value = match &inst.op {
                Op::Store { value, .. } => value.clone(),
                _ => Operand::Const(0),
            };
            HookCall::new(Hook::VptrUpdate, vec![addr, HookArg::Value(value), line, var, file])
        } else if op.vtable {
            stats.instrumented_vtable_reads += 1;
            HookCall::new(Hook::VptrRead, vec![addr, line, var, file])
        } else {
            let hook = match (is_write, is_unaligned(op.alignment, access.size)) {
                (true, false) => Hook::Write(access.size),
                (true, true) => Hook::UnalignedWrite(access.size),
                (false, false) => Hook::Read(access.size),
                (false, true) => Hook::UnalignedRead(access.size),
            };
            if is_write {
                stats.instrumented_writes += 1;
            } else {
                stats.instrumented_reads += 1;
            }
            HookCall::new(hook, vec![addr, line, var, file])
        };

        plan.insert_before(op.inst, call);
    }

    /// Replace an atomic by its hook; returns false when the site is left alone
    pub fn instrument_atomic(
        &self,
        op: &MemoryOp,
        plan: &mut RewritePlan,
        stats: &mut InstrumentationStats,
    ) -> bool {
        let Some(inst) = self.by_id.get(&op.inst) else {
            return false;
        };
        match atomic_replacement(inst, op) {
            Some(emitted) => {
                stats.instrumented_atomics += 1;
                plan.replace(op.inst, emitted);
                true
            }
            None => {
                stats.skipped_atomics += 1;
                tracing::debug!(
                    routine = %op.routine,
                    inst = %op.inst,
                    op = %inst.op,
                    "atomic left un-instrumented"
                );
                false
            }
        }
    }

    /// Replace a bulk-memory intrinsic by the C library call
    pub fn instrument_bulk(&self, op: &MemoryOp, plan: &mut RewritePlan, stats: &mut InstrumentationStats) {
        let Some(inst) = self.by_id.get(&op.inst) else {
            return;
        };
        let call = match &inst.op {
            Op::MemSet { dst, value, len } => HookCall::new(
                Hook::MemSet,
                vec![
                    HookArg::Address(dst.clone()),
                    HookArg::Value(value.clone()),
                    HookArg::Len(len.clone()),
                ],
            ),
            Op::MemCpy { dst, src, len } | Op::MemMove { dst, src, len } => {
                let hook = if matches!(inst.op, Op::MemCpy { .. }) { Hook::MemCpy } else { Hook::MemMove };
                HookCall::new(
                    hook,
                    vec![
                        HookArg::Address(dst.clone()),
                        HookArg::Address(src.clone()),
                        HookArg::Len(len.clone()),
                    ],
                )
            }
            _ => return,
        };
        stats.replaced_mem_intrinsics += 1;
        plan.replace(op.inst, Emitted::Replaced { original: op.inst, call });
    }
}

/// Alignment that is known, below 8 and not a multiple of the access size
pub fn is_unaligned(alignment: u32, size: AccessSize) -> bool {
    !(alignment == 0 || alignment >= 8 || alignment % size.bytes() == 0)
}

fn order_arg(ordering: crate::ir::AtomicOrdering) -> Option<HookArg> {
    MemoryOrder::lower(ordering).map(|order| HookArg::Ordering(order.code()))
}

fn atomic_replacement(inst: &Instruction, op: &MemoryOp) -> Option<Emitted> {
    let replaced = |call| Emitted::Replaced { original: inst.id, call };

    if let Op::Fence { ordering, scope } = &inst.op {
        let hook = match scope {
            SyncScope::SingleThread => Hook::SignalFence,
            SyncScope::CrossThread => Hook::ThreadFence,
        };
        return Some(replaced(HookCall::new(hook, vec![order_arg(*ordering)?])));
    }

    let size = op.size()?;
    let ptr = op.address.clone()?;
    match &inst.op {
        Op::Load { atomic: Some(info), .. } => Some(replaced(HookCall::new(
            Hook::AtomicLoad(size),
            vec![HookArg::Address(ptr), order_arg(info.ordering)?],
        ))),
        Op::Store { value, atomic: Some(info), .. } => Some(replaced(HookCall::new(
            Hook::AtomicStore(size),
            vec![HookArg::Address(ptr), HookArg::Value(value.clone()), order_arg(info.ordering)?],
        ))),
        Op::AtomicRmw { op: rmw, value, ordering, .. } => Some(replaced(HookCall::new(
            Hook::AtomicRmw(RmwHook::from_op(*rmw)?, size),
            vec![HookArg::Address(ptr), HookArg::Value(value.clone()), order_arg(*ordering)?],
        ))),
        Op::CmpXchg { expected, desired, success, failure, .. } => Some(Emitted::CompareExchange {
            original: inst.id,
            call: HookCall::new(
                Hook::AtomicCompareExchange(size),
                vec![
                    HookArg::Address(ptr),
                    HookArg::Value(expected.clone()),
                    HookArg::Value(desired.clone()),
                    order_arg(*success)?,
                    order_arg(*failure)?,
                ],
            ),
            expected: expected.clone(),
        }),
        _ => None,
    }
}
