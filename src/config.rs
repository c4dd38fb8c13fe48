//! Instrumentation and runtime configuration
//!
//! `InstrumentationConfig` selects which categories the pass instruments; it
//! loads from TOML and is overridden by CLI flags. `RuntimeConfig` controls
//! the recorder inside an instrumented process and reads the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ModuleError, Result};
use crate::ir::DataLayout;

/// Environment variable selecting the report policy (`new` or `cumulative`)
pub const REPORT_POLICY_ENV: &str = "RACEWATCH_REPORT_POLICY";

/// Environment variable disabling the report printed at main exit (`0`)
pub const REPORT_AT_EXIT_ENV: &str = "RACEWATCH_REPORT_AT_EXIT";

/// Environment variable holding the runtime's tracing filter
pub const LOG_ENV: &str = "RACEWATCH_LOG";

/// Which instrumentation categories are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Instrument plain loads and stores
    pub memory_accesses: bool,
    /// Instrument routine entry and exit
    pub func_entry_exit: bool,
    /// Run exit hooks on unwinding paths (synthesized cleanup blocks)
    pub handle_exceptions: bool,
    /// Instrument atomic operations and fences
    pub atomics: bool,
    /// Replace memset/memcpy/memmove intrinsics with library calls
    pub mem_intrinsics: bool,
    /// Target data layout
    pub layout: DataLayout,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            memory_accesses: true,
            func_entry_exit: true,
            handle_exceptions: true,
            atomics: true,
            mem_intrinsics: true,
            layout: DataLayout::default(),
        }
    }
}

impl InstrumentationConfig {
    /// Parse a TOML config; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ModuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

/// What a race insertion prints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPolicy {
    /// Print only the race that was just found; duplicates print nothing
    #[default]
    NewOnly,
    /// Print every known race on each insertion
    Cumulative,
}

impl ReportPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" | "new_only" => Some(ReportPolicy::NewOnly),
            "cumulative" | "all" => Some(ReportPolicy::Cumulative),
            _ => None,
        }
    }
}

/// Recorder behaviour inside an instrumented process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub report_policy: ReportPolicy,
    /// Print the full race list when `main` returns
    pub report_at_exit: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            report_policy: ReportPolicy::NewOnly,
            report_at_exit: true,
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup (testable without touching env)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(REPORT_POLICY_ENV) {
            match ReportPolicy::parse(&value) {
                Some(policy) => config.report_policy = policy,
                None => tracing::warn!("Ignoring unknown {}={}", REPORT_POLICY_ENV, value),
            }
        }
        if let Some(value) = lookup(REPORT_AT_EXIT_ENV) {
            config.report_at_exit = !matches!(value.trim(), "0" | "false" | "no");
        }
        config
    }
}
