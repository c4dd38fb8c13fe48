//! Source identity for instrumented sites
//!
//! The runtime reports races by file, line and variable name, so every hook
//! call carries them. Where they come from is behind `DebugInfoOracle`;
//! `IrDebugInfo` reads the debug locations already attached to the IR.

use cpp_demangle::{DemangleOptions, Symbol};
use std::borrow::Cow;

use crate::ir::{Instruction, Pointer, PointerBase, Routine};

/// File name used when an instruction has no debug location
pub const UNKNOWN_FILE: &str = "Unknown";

/// Variable name used when the underlying object has no name
pub const UNKNOWN_VARIABLE: &str = "unknown";

/// Resolves source identity for instructions and addresses
pub trait DebugInfoOracle {
    /// Source line of the instruction, 0 when unknown
    fn line(&self, inst: &Instruction) -> u32;

    /// Absolute source file of the instruction
    fn file_name(&self, inst: &Instruction) -> String;

    /// Name of the object an address points into
    fn variable_name(&self, routine: &Routine, ptr: &Pointer) -> String;

    /// Name reported in call stacks for a routine
    fn routine_name(&self, routine: &Routine) -> String;
}

/// Oracle backed by the IR's own debug locations
#[derive(Debug, Default, Clone, Copy)]
pub struct IrDebugInfo;

impl DebugInfoOracle for IrDebugInfo {
    fn line(&self, inst: &Instruction) -> u32 {
        inst.loc.as_ref().map_or(0, |loc| loc.line)
    }

    fn file_name(&self, inst: &Instruction) -> String {
        match &inst.loc {
            Some(loc) if !loc.file.is_empty() => absolute_file_name(&loc.directory, &loc.file),
            _ => UNKNOWN_FILE.to_string(),
        }
    }

    fn variable_name(&self, routine: &Routine, ptr: &Pointer) -> String {
        match &ptr.base {
            PointerBase::Global(name) | PointerBase::Argument(name) => name.clone(),
            PointerBase::Slot(id) => routine
                .slot(*id)
                .map_or_else(|| UNKNOWN_VARIABLE.to_string(), |slot| slot.name.clone()),
            PointerBase::VtableSlot | PointerBase::Unknown => UNKNOWN_VARIABLE.to_string(),
        }
    }

    fn routine_name(&self, routine: &Routine) -> String {
        display_name(&routine.name)
    }
}

/// Demangle an Itanium C++ symbol; anything else comes back unchanged
pub fn demangle(name: &str) -> Cow<'_, str> {
    if !name.starts_with("_Z") {
        return Cow::Borrowed(name);
    }
    Symbol::new(name.as_bytes())
        .ok()
        .and_then(|symbol| symbol.demangle(&DemangleOptions::default()).ok())
        .map_or(Cow::Borrowed(name), Cow::Owned)
}

/// Demangled routine name without its parameter list
/// (`_Z6workerPv` → `worker(void*)` → `worker`)
pub fn display_name(name: &str) -> String {
    let demangled = demangle(name);
    match demangled.find('(') {
        Some(idx) => demangled[..idx].to_string(),
        None => demangled.into_owned(),
    }
}

/// Join a compilation directory and a file name into an absolute path
///
/// Already-absolute names and names that already contain the directory are
/// returned unchanged; a leading `./` is folded into the directory.
pub fn absolute_file_name(dir: &str, file: &str) -> String {
    if dir.is_empty() || file.is_empty() || file.starts_with('/') || file.contains(dir) {
        return file.to_string();
    }

    let file = file.strip_prefix("./").unwrap_or(file);
    if dir.ends_with('/') {
        format!("{}{}", dir, file)
    } else {
        format!("{}/{}", dir, file)
    }
}
