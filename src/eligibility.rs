//! Eligibility rules for classified accesses
//!
//! Decides whether an access can be left un-instrumented because it provably
//! cannot take part in a race. Rules apply in a fixed precedence: constant
//! data, vtable entries, foreign address spaces, thread-private stack slots,
//! unsupported sizes.

use fnv::FnvHashSet;

use crate::capture::CaptureInfo;
use crate::classify::{AccessSize, MemoryOp};
use crate::ir::{Module, Pointer, PointerBase};
use crate::stats::{InstrumentationStats, SkipReason};

/// Section that holds profile-guided-optimization counters
const PROFILE_COUNTERS_SECTION: &str = "__llvm_prf_cnts";

/// Global name prefixes of coverage counters
const COVERAGE_PREFIXES: [&str; 2] = ["__llvm_gcov", "__llvm_gcda"];

/// Module-level facts the filter needs
#[derive(Debug, Default, Clone)]
pub struct GlobalFacts {
    constant: FnvHashSet<String>,
    counters: FnvHashSet<String>,
}

impl GlobalFacts {
    pub fn from_module(module: &Module) -> Self {
        let mut facts = Self::default();
        for global in &module.globals {
            if global.constant {
                facts.constant.insert(global.name.clone());
            }
            let in_counter_section = global
                .section
                .as_deref()
                .is_some_and(|section| section.ends_with(PROFILE_COUNTERS_SECTION));
            if in_counter_section || COVERAGE_PREFIXES.iter().any(|p| global.name.starts_with(p)) {
                facts.counters.insert(global.name.clone());
            }
        }
        facts
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.constant.contains(name)
    }

    /// Compiler-generated counters race by design and the user cannot suppress them
    pub fn is_instrumentation_counter(&self, name: &str) -> bool {
        self.counters.contains(name) || COVERAGE_PREFIXES.iter().any(|p| name.starts_with(p))
    }
}

/// Per-routine eligibility filter
#[derive(Debug)]
pub struct EligibilityFilter<'a> {
    globals: &'a GlobalFacts,
    captures: &'a CaptureInfo,
}

impl<'a> EligibilityFilter<'a> {
    pub fn new(globals: &'a GlobalFacts, captures: &'a CaptureInfo) -> Self {
        Self { globals, captures }
    }

    /// Apply every rule in precedence order and count the outcome
    pub fn check(&self, op: &MemoryOp, stats: &mut InstrumentationStats) -> Result<AccessSize, SkipReason> {
        let verdict = self.verdict(op);
        if let Err(reason) = verdict {
            stats.record_skip(reason);
            tracing::trace!(
                routine = %op.routine,
                inst = %op.inst,
                reason = %reason,
                "access not instrumented"
            );
        }
        verdict
    }

    /// Apply every rule without counting
    pub fn verdict(&self, op: &MemoryOp) -> Result<AccessSize, SkipReason> {
        if let Some(ptr) = &op.address {
            if !op.is_write() {
                self.check_constant_data(ptr)?;
            }
            self.check_address(ptr)?;
            self.check_locality(ptr)?;
        }
        op.size().ok_or(SkipReason::BadSize)
    }

    /// Rules 1 and 2: reads of read-only globals and vtable entries cannot race
    pub fn check_constant_data(&self, ptr: &Pointer) -> Result<(), SkipReason> {
        match &ptr.base {
            PointerBase::Global(name) if self.globals.is_constant(name) => {
                Err(SkipReason::ConstantGlobal)
            }
            PointerBase::VtableSlot => Err(SkipReason::VtableRead),
            _ => Ok(()),
        }
    }

    /// Rule 3: the runtime only understands the generic address space
    pub fn check_address(&self, ptr: &Pointer) -> Result<(), SkipReason> {
        if let PointerBase::Global(name) = &ptr.base {
            if self.globals.is_instrumentation_counter(name) {
                return Err(SkipReason::InstrumentationCounter);
            }
        }
        if ptr.address_space != 0 {
            return Err(SkipReason::DisallowedAddressSpace);
        }
        Ok(())
    }

    /// Rule 4: stack slots whose address never escapes are thread-private
    pub fn check_locality(&self, ptr: &Pointer) -> Result<(), SkipReason> {
        match ptr.base {
            PointerBase::Slot(id) if !self.captures.is_captured(id) => Err(SkipReason::NonCapturedLocal),
            _ => Ok(()),
        }
    }
}
