//! In-process race runtime
//!
//! Instrumented code calls into a process-wide [`Runtime`] through the hooks
//! in `ffi`. The runtime keeps the call stacks and the race set in a
//! [`Recorder`] and forwards every access and synchronization event to a
//! [`RaceDetector`], which decides whether an access races.
//!
//! ```text
//! instrumented code ──► ffi hooks ──► Runtime ──► RaceDetector::on_access
//!                                        │                 │ true
//!                                        ▼                 ▼
//!                                     Recorder ◄──── report_race
//!                                  (stacks, races, sink)
//! ```
//!
//! # Example
//!
//! ```
//! use racewatch::config::RuntimeConfig;
//! use racewatch::runtime::{Access, AccessType, NullDetector, Runtime};
//!
//! let runtime = Runtime::new(Box::new(NullDetector), RuntimeConfig::default());
//! runtime.func_entry("main");
//! let raced = runtime.on_access(&Access {
//!     address: 0x1000,
//!     size: 4,
//!     kind: AccessType::Write,
//!     line: 10,
//!     variable: "counter",
//!     file: "counter.c",
//! });
//! assert!(!raced);
//! runtime.func_exit("main");
//! ```

mod call_stack;
mod race;
mod recorder;
mod thread_id;


pub use call_stack::{CallStack, StackMismatch, StackTable};
pub use race::{AccessType, RaceRecord};
pub use recorder::{render_report, Recorder, REPORT_HEADER};
pub use thread_id::ThreadId;

use crate::config::RuntimeConfig;
use crate::ordering::MemoryOrder;

/// A checked plain access as seen by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access<'a> {
    pub address: usize,
    pub size: u32,
    pub kind: AccessType,
    pub line: u32,
    pub variable: &'a str,
    pub file: &'a str,
}

/// Opaque handle of a created thread (the `pthread_t` value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub u64);

/// Synchronization observed by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    ThreadCreate(ThreadHandle),
    ThreadJoin(ThreadHandle),
    /// Lock at the given address acquired
    Acquire(usize),
    /// Lock at the given address about to be released
    Release(usize),
    /// Atomic operation on an address
    Atomic { address: usize, order: MemoryOrder },
    Fence(MemoryOrder),
}

/// The race-detection algorithm, supplied by the embedder
pub trait RaceDetector: Send + Sync {
    /// Observe an access; return true when it races with an earlier one
    fn on_access(&self, thread: ThreadId, access: &Access<'_>) -> bool;

    /// Observe a synchronization event
    fn on_sync(&self, thread: ThreadId, event: SyncEvent);
}

/// Detector that never reports
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl RaceDetector for NullDetector {
    fn on_access(&self, _thread: ThreadId, _access: &Access<'_>) -> bool {
        false
    }

    fn on_sync(&self, _thread: ThreadId, _event: SyncEvent) {}
}

/// Recorder bound to a detector
pub struct Runtime {
    recorder: Recorder,
    detector: Box<dyn RaceDetector>,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(detector: Box<dyn RaceDetector>, config: RuntimeConfig) -> Self {
        Self::with_recorder(Recorder::new(config.report_policy), detector, config)
    }

    pub fn with_recorder(recorder: Recorder, detector: Box<dyn RaceDetector>, config: RuntimeConfig) -> Self {
        Self {
            recorder,
            detector,
            config,
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn func_entry(&self, name: &str) {
        self.recorder.push_function(name);
    }

    /// Mismatches are logged by the recorder and absorbed here
    pub fn func_exit(&self, name: &str) {
        if let Err(err) = self.recorder.pop_function(name) {
            tracing::debug!(routine = name, "func exit mismatch absorbed: {}", err);
        }
    }

    /// Exit of `main`: prints the full report when configured to
    pub fn main_func_exit(&self, name: &str) {
        if self.config.report_at_exit {
            let printed = self.recorder.flush();
            tracing::debug!(routine = name, races = printed, "report at main exit");
        }
    }

    pub fn ignore_begin(&self) {
        self.recorder.ignore_begin();
    }

    pub fn ignore_end(&self) {
        self.recorder.ignore_end();
    }

    /// Forward an access to the detector and record it if it races
    pub fn on_access(&self, access: &Access<'_>) -> bool {
        let thread = ThreadId::current();
        if !self.detector.on_access(thread, access) {
            return false;
        }
        self.recorder
            .report_race(thread, access.kind, access.line, access.variable, access.file)
    }

    pub fn on_sync(&self, event: SyncEvent) {
        self.detector.on_sync(ThreadId::current(), event);
    }
}
