//! Instrumentation counters
//!
//! Every decision the pass takes about a site lands in one named counter.
//! The counters are diagnostic only; nothing in the instrumented program
//! can observe them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an access was left un-instrumented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Read of a read-only global
    ConstantGlobal,
    /// Read of a vtable entry
    VtableRead,
    /// Pointer outside the generic address space
    DisallowedAddressSpace,
    /// Compiler-generated profile or coverage counter
    InstrumentationCounter,
    /// Stack slot whose address never escapes
    NonCapturedLocal,
    /// Size other than 1, 2, 4, 8 or 16 bytes
    BadSize,
    /// Read followed by a write to the same address in the same region
    ReadBeforeWrite,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ConstantGlobal => "constant-global",
            SkipReason::VtableRead => "vtable-read",
            SkipReason::DisallowedAddressSpace => "disallowed-address-space",
            SkipReason::InstrumentationCounter => "instrumentation-counter",
            SkipReason::NonCapturedLocal => "non-captured-local",
            SkipReason::BadSize => "bad-size",
            SkipReason::ReadBeforeWrite => "read-before-write",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters accumulated over every routine a pass instance has seen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationStats {
    pub instrumented_reads: u64,
    pub instrumented_writes: u64,
    pub instrumented_vtable_reads: u64,
    pub instrumented_vtable_writes: u64,
    pub omitted_reads_before_write: u64,
    pub omitted_reads_from_constant_globals: u64,
    pub omitted_reads_from_vtable: u64,
    pub omitted_non_captured: u64,
    pub omitted_foreign_address_space: u64,
    pub omitted_instrumentation_counters: u64,
    pub accesses_with_bad_size: u64,
    pub instrumented_atomics: u64,
    pub skipped_atomics: u64,
    pub replaced_mem_intrinsics: u64,
    pub sync_markers: u64,
    pub instrumented_routines: u64,
}

impl InstrumentationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one skipped access
    pub fn record_skip(&mut self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::ConstantGlobal => &mut self.omitted_reads_from_constant_globals,
            SkipReason::VtableRead => &mut self.omitted_reads_from_vtable,
            SkipReason::DisallowedAddressSpace => &mut self.omitted_foreign_address_space,
            SkipReason::InstrumentationCounter => &mut self.omitted_instrumentation_counters,
            SkipReason::NonCapturedLocal => &mut self.omitted_non_captured,
            SkipReason::BadSize => &mut self.accesses_with_bad_size,
            SkipReason::ReadBeforeWrite => &mut self.omitted_reads_before_write,
        };
        *counter += 1;
    }

    /// Value of the counter a skip reason feeds
    pub fn skipped(&self, reason: SkipReason) -> u64 {
        match reason {
            SkipReason::ConstantGlobal => self.omitted_reads_from_constant_globals,
            SkipReason::VtableRead => self.omitted_reads_from_vtable,
            SkipReason::DisallowedAddressSpace => self.omitted_foreign_address_space,
            SkipReason::InstrumentationCounter => self.omitted_instrumentation_counters,
            SkipReason::NonCapturedLocal => self.omitted_non_captured,
            SkipReason::BadSize => self.accesses_with_bad_size,
            SkipReason::ReadBeforeWrite => self.omitted_reads_before_write,
        }
    }

    /// Total accesses left un-instrumented for any reason
    pub fn total_skipped(&self) -> u64 {
        self.omitted_reads_before_write
            + self.omitted_reads_from_constant_globals
            + self.omitted_reads_from_vtable
            + self.omitted_non_captured
            + self.omitted_foreign_address_space
            + self.omitted_instrumentation_counters
            + self.accesses_with_bad_size
    }

    fn rows(&self) -> [(&'static str, u64); 16] {
        [
            ("Number of instrumented reads", self.instrumented_reads),
            ("Number of instrumented writes", self.instrumented_writes),
            ("Number of vtable ptr reads", self.instrumented_vtable_reads),
            ("Number of vtable ptr writes", self.instrumented_vtable_writes),
            ("Number of reads ignored due to following writes", self.omitted_reads_before_write),
            ("Number of reads from constant globals", self.omitted_reads_from_constant_globals),
            ("Number of vtable reads", self.omitted_reads_from_vtable),
            ("Number of accesses ignored due to capturing", self.omitted_non_captured),
            ("Number of accesses in foreign address spaces", self.omitted_foreign_address_space),
            ("Number of profile/coverage counter accesses", self.omitted_instrumentation_counters),
            ("Number of accesses with bad size", self.accesses_with_bad_size),
            ("Number of instrumented atomics", self.instrumented_atomics),
            ("Number of unrecognized atomics", self.skipped_atomics),
            ("Number of replaced mem intrinsics", self.replaced_mem_intrinsics),
            ("Number of synchronization markers", self.sync_markers),
            ("Number of instrumented routines", self.instrumented_routines),
        ]
    }

    /// Print the counter table to stderr
    pub fn print_summary(&self) {
        eprint!("{}", self);
    }
}

impl fmt::Display for InstrumentationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10}  {}", "count", "statistic")?;
        writeln!(f, "{}", "─".repeat(64))?;
        for (label, value) in self.rows() {
            if value > 0 {
                writeln!(f, "{:>10}  {}", value, label)?;
            }
        }
        writeln!(f, "{}", "─".repeat(64))?;
        writeln!(f, "{:>10}  total skipped accesses", self.total_skipped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_skip_feeds_named_counter() {
        let mut stats = InstrumentationStats::new();
        stats.record_skip(SkipReason::BadSize);
        stats.record_skip(SkipReason::BadSize);
        stats.record_skip(SkipReason::NonCapturedLocal);

        assert_eq!(stats.accesses_with_bad_size, 2);
        assert_eq!(stats.omitted_non_captured, 1);
        assert_eq!(stats.skipped(SkipReason::BadSize), 2);
        assert_eq!(stats.total_skipped(), 3);
    }

    #[test]
    fn test_every_reason_round_trips_through_skipped() {
        let reasons = [
            SkipReason::ConstantGlobal,
            SkipReason::VtableRead,
            SkipReason::DisallowedAddressSpace,
            SkipReason::InstrumentationCounter,
            SkipReason::NonCapturedLocal,
            SkipReason::BadSize,
            SkipReason::ReadBeforeWrite,
        ];
        let mut stats = InstrumentationStats::new();
        for (i, reason) in reasons.iter().enumerate() {
            for _ in 0..=i {
                stats.record_skip(*reason);
            }
        }
        for (i, reason) in reasons.iter().enumerate() {
            assert_eq!(stats.skipped(*reason), i as u64 + 1, "{}", reason);
        }
    }

    #[test]
    fn test_summary_lists_only_nonzero_rows() {
        let mut stats = InstrumentationStats::new();
        stats.instrumented_writes = 3;
        let text = stats.to_string();
        assert!(text.contains("Number of instrumented writes"));
        assert!(!text.contains("Number of instrumented reads"));
        assert!(text.contains("total skipped accesses"));
    }
}
