//! Race recorder
//!
//! Accumulates races found by the detector, deduplicates them, attaches the
//! reporting thread's call stack and prints the report. Three independent
//! locks guard the stack table, the race set and the output sink; none is
//! held while another is acquired.

use fnv::FnvHashMap;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::call_stack::{StackMismatch, StackTable};
use super::race::{AccessType, RaceRecord};
use super::thread_id::ThreadId;
use crate::config::ReportPolicy;

/// First line of every printed report
pub const REPORT_HEADER: &str = "racewatch: races:";

type Sink = Box<dyn Write + Send>;

pub struct Recorder {
    stacks: StackTable,
    races: Mutex<BTreeSet<RaceRecord>>,
    sink: Mutex<Sink>,
    policy: ReportPolicy,
    mismatches: AtomicU64,
    ignore_depth: Mutex<FnvHashMap<ThreadId, u32>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("policy", &self.policy)
            .field("races", &self.race_count())
            .field("mismatches", &self.mismatch_count())
            .finish()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(ReportPolicy::default())
    }
}

impl Recorder {
    /// Recorder printing to standard output
    pub fn new(policy: ReportPolicy) -> Self {
        Self::with_sink(policy, Box::new(io::stdout()))
    }

    /// Recorder printing to an arbitrary sink
    pub fn with_sink(policy: ReportPolicy, sink: Sink) -> Self {
        Self {
            stacks: StackTable::new(),
            races: Mutex::new(BTreeSet::new()),
            sink: Mutex::new(sink),
            policy,
            mismatches: AtomicU64::new(0),
            ignore_depth: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn policy(&self) -> ReportPolicy {
        self.policy
    }

    /// Routine entry on the calling thread
    pub fn push_function(&self, name: &str) {
        self.stacks.push(ThreadId::current(), name);
    }

    /// Routine exit on the calling thread
    ///
    /// A name other than the innermost entry is a diagnostic: it is logged,
    /// counted and returned, and the stack is left as it was.
    pub fn pop_function(&self, name: &str) -> Result<(), StackMismatch> {
        let result = self.stacks.pop(ThreadId::current(), name);
        if let Err(err) = &result {
            self.mismatches.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("{}", err);
        }
        result
    }

    pub fn stack_snapshot(&self, thread: ThreadId) -> Vec<String> {
        self.stacks.snapshot(thread).iter().map(|f| f.to_string()).collect()
    }

    pub fn stack_depth(&self, thread: ThreadId) -> usize {
        self.stacks.depth(thread)
    }

    pub fn mismatch_count(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    /// Enter a region whose races are dropped; regions nest
    pub fn ignore_begin(&self) {
        if let Ok(mut depths) = self.ignore_depth.lock() {
            *depths.entry(ThreadId::current()).or_insert(0) += 1;
        }
    }

    pub fn ignore_end(&self) {
        if let Ok(mut depths) = self.ignore_depth.lock() {
            let thread = ThreadId::current();
            match depths.get_mut(&thread) {
                Some(depth) if *depth > 1 => *depth -= 1,
                Some(_) => {
                    depths.remove(&thread);
                }
                None => tracing::warn!("ignore region end on {} without a matching begin", thread),
            }
        }
    }

    pub fn is_ignoring(&self, thread: ThreadId) -> bool {
        self.ignore_depth
            .lock()
            .map(|depths| depths.contains_key(&thread))
            .unwrap_or(false)
    }

    /// Record a racing read by the calling thread
    pub fn report_race_on_read(&self, line: u32, variable: &str, file: &str) -> bool {
        self.report_race(ThreadId::current(), AccessType::Read, line, variable, file)
    }

    /// Record a racing write by the calling thread
    pub fn report_race_on_write(&self, line: u32, variable: &str, file: &str) -> bool {
        self.report_race(ThreadId::current(), AccessType::Write, line, variable, file)
    }

    /// Record a race; returns true if it was not known before
    pub fn report_race(
        &self,
        thread: ThreadId,
        access: AccessType,
        line: u32,
        variable: &str,
        file: &str,
    ) -> bool {
        if self.is_ignoring(thread) {
            tracing::debug!(%thread, line, variable, "race dropped inside ignore region");
            return false;
        }

        let record = RaceRecord {
            thread,
            line,
            access,
            variable: variable.to_string(),
            file: file.to_string(),
            stack: self.stacks.snapshot(thread),
        };

        let (inserted, to_print) = match self.races.lock() {
            Ok(mut races) => {
                let inserted = races.insert(record.clone());
                let to_print = match self.policy {
                    ReportPolicy::NewOnly if inserted => vec![record],
                    ReportPolicy::NewOnly => Vec::new(),
                    ReportPolicy::Cumulative => races.iter().cloned().collect(),
                };
                (inserted, to_print)
            }
            Err(_) => return false,
        };

        if !to_print.is_empty() {
            self.emit(&render_report(&to_print));
        }
        inserted
    }

    /// Every known race, in key order
    pub fn races(&self) -> Vec<RaceRecord> {
        self.races
            .lock()
            .map(|races| races.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn race_count(&self) -> usize {
        self.races.lock().map(|races| races.len()).unwrap_or(0)
    }

    /// Print the full report; returns the number of races printed
    pub fn flush(&self) -> usize {
        let races = self.races();
        if !races.is_empty() {
            self.emit(&render_report(&races));
        }
        races.len()
    }

    fn emit(&self, text: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Err(err) = sink.write_all(text.as_bytes()).and_then(|()| sink.flush()) {
                tracing::warn!("Failed to write race report: {}", err);
            }
        }
    }
}

/// Render races as one report block
pub fn render_report(races: &[RaceRecord]) -> String {
    let mut out = String::from(REPORT_HEADER);
    out.push('\n');
    for race in races {
        out.push_str(&race.to_string());
        out.push('\n');
        out.push_str(&race.render_stack());
    }
    out
}
