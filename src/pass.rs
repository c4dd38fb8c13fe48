//! Instrumentation pass driver
//!
//! Runs selection and injection per routine, gates each category on the
//! configuration and the routine's attributes, and brackets instrumented
//! routines with entry/exit hooks. The module gets a constructor that
//! initializes the runtime before any instrumented code runs.

use serde::Serialize;
use std::fmt;

use crate::abi::{Hook, HookArg, HookCall, MODULE_CTOR};
use crate::capture::CaptureInfo;
use crate::config::InstrumentationConfig;
use crate::debug_info::{DebugInfoOracle, IrDebugInfo};
use crate::eligibility::{EligibilityFilter, GlobalFacts};
use crate::injector::{CallbackInjector, Emitted, InstrumentedBlock, InstrumentedRoutine, RewritePlan};
use crate::ir::{Module, Routine, Terminator};
use crate::selector::InstrumentationSelector;
use crate::stats::InstrumentationStats;
use crate::sync::SynchronizationDetector;

/// Name of the routine that also gets the main-exit hook
pub const MAIN_ROUTINE: &str = "main";

/// A fully instrumented module
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentedModule {
    pub name: String,
    pub routines: Vec<InstrumentedRoutine>,
    /// Constructor calling `__tsan_init`
    pub constructor: InstrumentedRoutine,
}

impl InstrumentedModule {
    pub fn routine(&self, name: &str) -> Option<&InstrumentedRoutine> {
        self.routines.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for InstrumentedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        write!(f, "{}", self.constructor)?;
        for routine in &self.routines {
            writeln!(f)?;
            write!(f, "{}", routine)?;
        }
        Ok(())
    }
}

/// The instrumentation pass; counters accumulate over every routine it runs on
pub struct InstrumentationPass {
    config: InstrumentationConfig,
    stats: InstrumentationStats,
    oracle: Box<dyn DebugInfoOracle>,
    sync: SynchronizationDetector,
}

impl InstrumentationPass {
    pub fn new(config: InstrumentationConfig) -> Self {
        Self::with_oracle(config, Box::new(IrDebugInfo))
    }

    pub fn with_oracle(config: InstrumentationConfig, oracle: Box<dyn DebugInfoOracle>) -> Self {
        Self {
            config,
            stats: InstrumentationStats::new(),
            oracle,
            sync: SynchronizationDetector::new(),
        }
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn stats(&self) -> &InstrumentationStats {
        &self.stats
    }

    /// Instrument every routine and synthesize the module constructor
    pub fn run_on_module(&mut self, module: &Module) -> InstrumentedModule {
        let facts = GlobalFacts::from_module(module);
        let routines = module
            .routines
            .iter()
            .map(|routine| self.run_on_routine(routine, &facts))
            .collect();

        InstrumentedModule {
            name: module.name.clone(),
            routines,
            constructor: module_constructor(),
        }
    }

    /// Instrument one routine
    pub fn run_on_routine(&mut self, routine: &Routine, facts: &GlobalFacts) -> InstrumentedRoutine {
        if routine.name == MODULE_CTOR {
            return RewritePlan::new().apply(routine);
        }

        let captures = CaptureInfo::compute(routine);
        let selector = InstrumentationSelector::new(
            EligibilityFilter::new(facts, &captures),
            self.config.layout,
        );
        let selection = selector.select(routine, &mut self.stats);
        let injector = CallbackInjector::new(routine, self.oracle.as_ref());
        let sanitize = routine.attributes.sanitize_thread;

        let mut plan = RewritePlan::new();
        let mut res = false;

        if self.config.memory_accesses && sanitize {
            for access in &selection.accesses {
                injector.instrument_access(access, &mut plan, &mut self.stats);
                res = true;
            }
        }

        if self.config.atomics {
            for op in &selection.atomics {
                res |= injector.instrument_atomic(op, &mut plan, &mut self.stats);
            }
        }

        if self.config.mem_intrinsics && sanitize {
            for op in &selection.bulk_ops {
                injector.instrument_bulk(op, &mut plan, &mut self.stats);
                res = true;
            }
        }

        // Happens-before edges matter even where accesses go unchecked
        let calls = routine
            .instructions()
            .filter(|inst| selection.calls.contains(&inst.id));
        res |= self.sync.instrument(calls, &mut plan, &mut self.stats) > 0;

        let has_calls = selection.has_calls();
        let name = self.oracle.routine_name(routine);
        let name_arg = || vec![HookArg::Str(name.clone())];

        let entry_exit = self.config.func_entry_exit && (res || has_calls);
        let ignores = routine.attributes.no_checking_at_run_time && has_calls;

        if entry_exit {
            plan.entry.push(HookCall::new(Hook::FuncEntry, name_arg()));
        }
        if ignores {
            plan.entry.push(HookCall::bare(Hook::IgnoreThreadBegin));
            plan.exit.push(HookCall::bare(Hook::IgnoreThreadEnd));
        }
        if entry_exit {
            plan.exit.push(HookCall::new(Hook::FuncExit, name_arg()));
            if routine.name == MAIN_ROUTINE {
                plan.exit.push(HookCall::new(Hook::MainFuncExit, name_arg()));
            }
        }
        plan.cleanup = self.config.handle_exceptions;

        let out = plan.apply(routine);
        if out.modified {
            self.stats.instrumented_routines += 1;
        }
        tracing::debug!(
            routine = %routine.name,
            modified = out.modified,
            hooks = out.hook_calls().count(),
            access_checks = out.count_hooks(Hook::is_access_check),
            cleanup = out.cleanup.is_some(),
            "instrumented routine"
        );
        out
    }
}

fn module_constructor() -> InstrumentedRoutine {
    InstrumentedRoutine {
        name: MODULE_CTOR.to_string(),
        blocks: vec![InstrumentedBlock {
            label: "entry".to_string(),
            items: vec![
                Emitted::Hook { call: HookCall::bare(Hook::Init) },
                Emitted::Terminator { terminator: Terminator::Return },
            ],
        }],
        cleanup: None,
        modified: true,
    }
}
