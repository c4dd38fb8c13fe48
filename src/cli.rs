//! CLI argument parsing for racewatch

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::InstrumentationConfig;

/// Output format for instrumentation plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable listing of the rewritten routines (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "racewatch")]
#[command(version)]
#[command(about = "Race-detection instrumentation planner for IR modules", long_about = None)]
pub struct Cli {
    /// Module to instrument (JSON)
    #[arg(value_name = "MODULE")]
    pub module: PathBuf,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print the pass counters
    #[arg(long = "stats")]
    pub stats: bool,

    /// Instrumentation config file (TOML)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Do not instrument plain loads and stores
    #[arg(long = "no-memory-accesses")]
    pub no_memory_accesses: bool,

    /// Do not instrument routine entry and exit
    #[arg(long = "no-func-entry-exit")]
    pub no_func_entry_exit: bool,

    /// Do not run exit hooks on unwinding paths
    #[arg(long = "no-handle-exceptions")]
    pub no_handle_exceptions: bool,

    /// Do not instrument atomics and fences
    #[arg(long = "no-atomics")]
    pub no_atomics: bool,

    /// Do not replace memset/memcpy/memmove intrinsics
    #[arg(long = "no-mem-intrinsics")]
    pub no_mem_intrinsics: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Apply the `--no-*` switches on top of a base config
    pub fn apply_overrides(&self, mut config: InstrumentationConfig) -> InstrumentationConfig {
        if self.no_memory_accesses {
            config.memory_accesses = false;
        }
        if self.no_func_entry_exit {
            config.func_entry_exit = false;
        }
        if self.no_handle_exceptions {
            config.handle_exceptions = false;
        }
        if self.no_atomics {
            config.atomics = false;
        }
        if self.no_mem_intrinsics {
            config.mem_intrinsics = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_module_required() {
        assert!(Cli::try_parse_from(["racewatch"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["racewatch", "m.json"]);
        assert_eq!(cli.module, PathBuf::from("m.json"));
        assert_eq!(cli.format, OutputFormat::Text);
        assert!(!cli.stats);
        assert!(!cli.debug);
        assert!(cli.config.is_none());
        assert_eq!(
            cli.apply_overrides(InstrumentationConfig::default()),
            InstrumentationConfig::default()
        );
    }

    #[test]
    fn test_cli_format_json() {
        let cli = Cli::parse_from(["racewatch", "--format", "json", "m.json"]);
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["racewatch", "--format", "csv", "m.json"]).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "racewatch",
            "--no-atomics",
            "--no-func-entry-exit",
            "--no-mem-intrinsics",
            "m.json",
        ]);
        let config = cli.apply_overrides(InstrumentationConfig::default());
        assert!(!config.atomics);
        assert!(!config.func_entry_exit);
        assert!(!config.mem_intrinsics);
        assert!(config.memory_accesses);
        assert!(config.handle_exceptions);
    }

    #[test]
    fn test_cli_config_path() {
        let cli = Cli::parse_from(["racewatch", "--config", "pass.toml", "--stats", "m.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("pass.toml")));
        assert!(cli.stats);
    }
}
