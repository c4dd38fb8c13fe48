//! Race records
//!
//! Two records are the same race when thread, line, access type, variable
//! and file agree; the call stack is carried along but never compared.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::thread_id::ThreadId;

/// Kind of the racing access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessType {
    Read,
    Write,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Read => f.write_str("read"),
            AccessType::Write => f.write_str("write"),
        }
    }
}

/// One reported race
#[derive(Debug, Clone)]
pub struct RaceRecord {
    pub thread: ThreadId,
    pub line: u32,
    pub access: AccessType,
    pub variable: String,
    pub file: String,
    /// Call stack of the reporting thread, outermost first
    pub stack: Vec<Arc<str>>,
}

impl RaceRecord {
    fn key(&self) -> (ThreadId, u32, AccessType, &str, &str) {
        (self.thread, self.line, self.access, &self.variable, &self.file)
    }

    /// Stack lines, one per frame, each nested four columns deeper
    pub fn render_stack(&self) -> String {
        let mut out = String::new();
        for (depth, frame) in self.stack.iter().enumerate() {
            out.push_str(&" ".repeat(1 + depth * 4));
            out.push_str("'--->");
            out.push_str(frame);
            out.push_str("(...)\n");
        }
        out
    }
}

impl PartialEq for RaceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RaceRecord {}

impl PartialOrd for RaceRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RaceRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for RaceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}, {}, {}, {}:{}}}",
            self.thread, self.access, self.variable, self.file, self.line
        )
    }
}
