//! Error types for module loading and configuration
//!
//! The pass and the runtime never fail: every condition they meet is
//! absorbed and counted. Only reading inputs can go wrong.

use thiserror::Error;

/// Errors raised while loading or validating inputs
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid module JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid instrumentation config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Routine {routine} references unknown stack slot {slot}")]
    UnknownSlot { routine: String, slot: u32 },

    #[error("Routine {routine} unwinds to unknown block {label}")]
    UnknownBlock { routine: String, label: String },

    #[error("Routine {routine} reuses instruction id {id}")]
    DuplicateInstruction { routine: String, id: u32 },
}

/// Result type for module and config loading
pub type Result<T> = std::result::Result<T, ModuleError>;
