//! racewatch - data-race instrumentation and runtime race recording
//!
//! The compile-time half decides, routine by routine, which memory accesses,
//! atomics and library calls of an IR module need a runtime hook, and emits
//! those hooks. The runtime half records the races a detector finds, with
//! the reporting thread's call stack, and prints a deduplicated report.

pub mod abi;
pub mod capture;
pub mod classify;
pub mod cli;
pub mod config;
pub mod debug_info;
pub mod eligibility;
pub mod error;
pub mod ffi;
pub mod injector;
pub mod ir;
pub mod json_output;
pub mod ordering;
pub mod pass;
pub mod runtime;
pub mod selector;
pub mod stats;
pub mod sync;
