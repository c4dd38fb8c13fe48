//! JSON output format for instrumentation plans
//!
//! `--format json` implementation: one entry per hook call, grouped by
//! routine, plus a summary and optionally the pass counters.

use serde::{Deserialize, Serialize};

use crate::injector::{Emitted, InstrumentedRoutine};
use crate::pass::InstrumentedModule;
use crate::stats::InstrumentationStats;

/// One inserted or replacing hook call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonHook {
    /// Block the call lives in
    pub block: String,
    /// Exported runtime symbol (e.g., "__tsan_write4")
    pub symbol: String,
    /// Arguments as formatted strings
    pub args: Vec<String>,
    /// Id of the instruction the call replaces, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces: Option<u32>,
}

/// One routine of the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRoutine {
    pub name: String,
    /// False when the routine is left untouched
    pub modified: bool,
    /// A cleanup block runs the exit hooks on unwind
    pub cleanup: bool,
    pub hooks: Vec<JsonHook>,
}

impl JsonRoutine {
    pub fn from_routine(routine: &InstrumentedRoutine) -> Self {
        let mut hooks = Vec::new();
        for block in routine.blocks.iter().chain(routine.cleanup.iter()) {
            for item in &block.items {
                let replaces = match item {
                    Emitted::Replaced { original, .. } | Emitted::CompareExchange { original, .. } => {
                        Some(original.0)
                    }
                    _ => None,
                };
                if let Some(call) = item.hook_call() {
                    hooks.push(JsonHook {
                        block: block.label.clone(),
                        symbol: call.hook.symbol(),
                        args: call.args.iter().map(|a| a.to_string()).collect(),
                        replaces,
                    });
                }
            }
        }

        Self {
            name: routine.name.clone(),
            modified: routine.modified,
            cleanup: routine.cleanup.is_some(),
            hooks,
        }
    }
}

/// Summary over the whole module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonSummary {
    pub total_routines: u64,
    pub modified_routines: u64,
    pub total_hooks: u64,
}

/// Root JSON output structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOutput {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    pub module: String,
    pub constructor: JsonRoutine,
    pub routines: Vec<JsonRoutine>,
    pub summary: JsonSummary,
    /// Pass counters (if --stats enabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<InstrumentationStats>,
}

impl JsonOutput {
    pub fn new(module: &InstrumentedModule) -> Self {
        let mut output = Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "racewatch-json-v1".to_string(),
            module: module.name.clone(),
            constructor: JsonRoutine::from_routine(&module.constructor),
            routines: Vec::new(),
            summary: JsonSummary::default(),
            stats: None,
        };
        for routine in &module.routines {
            output.add_routine(JsonRoutine::from_routine(routine));
        }
        output
    }

    pub fn add_routine(&mut self, routine: JsonRoutine) {
        self.summary.total_routines += 1;
        if routine.modified {
            self.summary.modified_routines += 1;
        }
        self.summary.total_hooks += routine.hooks.len() as u64;
        self.routines.push(routine);
    }

    pub fn set_stats(&mut self, stats: &InstrumentationStats) {
        self.stats = Some(stats.clone());
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
