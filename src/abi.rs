//! Runtime callback ABI as seen from the pass
//!
//! `Hook` names every entry point the injector may call; `symbol()` gives
//! the exported name, which `ffi` defines on the runtime side.

use serde::{Serialize, Serializer};
use std::fmt;

use crate::classify::AccessSize;
use crate::ir::{Operand, Pointer, RmwOp};

/// Name of the synthesized module constructor that calls `__tsan_init`
pub const MODULE_CTOR: &str = "tsan.module_ctor";

/// Read-modify-write operations with a runtime hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmwHook {
    Exchange,
    FetchAdd,
    FetchSub,
    FetchAnd,
    FetchOr,
    FetchXor,
    FetchNand,
}

impl RmwHook {
    /// Min/max and floating-point RMW have no hook
    pub fn from_op(op: RmwOp) -> Option<Self> {
        match op {
            RmwOp::Xchg => Some(RmwHook::Exchange),
            RmwOp::Add => Some(RmwHook::FetchAdd),
            RmwOp::Sub => Some(RmwHook::FetchSub),
            RmwOp::And => Some(RmwHook::FetchAnd),
            RmwOp::Or => Some(RmwHook::FetchOr),
            RmwOp::Xor => Some(RmwHook::FetchXor),
            RmwOp::Nand => Some(RmwHook::FetchNand),
            RmwOp::Max | RmwOp::Min | RmwOp::UMax | RmwOp::UMin | RmwOp::FAdd | RmwOp::FSub => None,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            RmwHook::Exchange => "exchange",
            RmwHook::FetchAdd => "fetch_add",
            RmwHook::FetchSub => "fetch_sub",
            RmwHook::FetchAnd => "fetch_and",
            RmwHook::FetchOr => "fetch_or",
            RmwHook::FetchXor => "fetch_xor",
            RmwHook::FetchNand => "fetch_nand",
        }
    }
}

/// Every runtime entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Init,
    Read(AccessSize),
    Write(AccessSize),
    UnalignedRead(AccessSize),
    UnalignedWrite(AccessSize),
    VptrUpdate,
    VptrRead,
    AtomicLoad(AccessSize),
    AtomicStore(AccessSize),
    AtomicRmw(RmwHook, AccessSize),
    AtomicCompareExchange(AccessSize),
    ThreadFence,
    SignalFence,
    FuncEntry,
    FuncExit,
    MainFuncExit,
    IgnoreThreadBegin,
    IgnoreThreadEnd,
    ThreadCreate,
    ThreadJoin,
    ThreadLock,
    ThreadUnlock,
    /// C library replacements for bulk-memory intrinsics
    MemSet,
    MemCpy,
    MemMove,
}

impl Hook {
    pub fn symbol(&self) -> String {
        match *self {
            Hook::Init => "__tsan_init".to_string(),
            Hook::Read(size) => format!("__tsan_read{}", size.bytes()),
            Hook::Write(size) => format!("__tsan_write{}", size.bytes()),
            Hook::UnalignedRead(size) => format!("__tsan_unaligned_read{}", size.bytes()),
            Hook::UnalignedWrite(size) => format!("__tsan_unaligned_write{}", size.bytes()),
            Hook::VptrUpdate => "__tsan_vptr_update".to_string(),
            Hook::VptrRead => "__tsan_vptr_read".to_string(),
            Hook::AtomicLoad(size) => format!("__tsan_atomic{}_load", size.bits()),
            Hook::AtomicStore(size) => format!("__tsan_atomic{}_store", size.bits()),
            Hook::AtomicRmw(op, size) => format!("__tsan_atomic{}_{}", size.bits(), op.suffix()),
            Hook::AtomicCompareExchange(size) => {
                format!("__tsan_atomic{}_compare_exchange_val", size.bits())
            }
            Hook::ThreadFence => "__tsan_atomic_thread_fence".to_string(),
            Hook::SignalFence => "__tsan_atomic_signal_fence".to_string(),
            Hook::FuncEntry => "__tsan_func_entry".to_string(),
            Hook::FuncExit => "__tsan_func_exit".to_string(),
            Hook::MainFuncExit => "__tsan_main_func_exit".to_string(),
            Hook::IgnoreThreadBegin => "__tsan_ignore_thread_begin".to_string(),
            Hook::IgnoreThreadEnd => "__tsan_ignore_thread_end".to_string(),
            Hook::ThreadCreate => "__tsan_thread_create".to_string(),
            Hook::ThreadJoin => "__tsan_thread_join".to_string(),
            Hook::ThreadLock => "__tsan_thread_lock".to_string(),
            Hook::ThreadUnlock => "__tsan_thread_unlock".to_string(),
            Hook::MemSet => "memset".to_string(),
            Hook::MemCpy => "memcpy".to_string(),
            Hook::MemMove => "memmove".to_string(),
        }
    }

    /// Hooks that report an access to the race recorder
    pub fn is_access_check(&self) -> bool {
        matches!(
            self,
            Hook::Read(_)
                | Hook::Write(_)
                | Hook::UnalignedRead(_)
                | Hook::UnalignedWrite(_)
                | Hook::VptrUpdate
                | Hook::VptrRead
        )
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol())
    }
}

impl Serialize for Hook {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.symbol())
    }
}

/// One argument of a hook call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookArg {
    /// Address operand of the instrumented access
    Address(Pointer),
    /// Value operand forwarded from the original instruction
    Value(Operand),
    /// Source line
    Line(u32),
    /// String constant (variable, file or routine name)
    Str(String),
    /// Memory-order code
    Ordering(i32),
    /// Byte count of a bulk-memory operation
    Len(Operand),
}

impl fmt::Display for HookArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookArg::Address(ptr) => write!(f, "{}", ptr),
            HookArg::Value(value) | HookArg::Len(value) => write!(f, "{}", value),
            HookArg::Line(line) => write!(f, "{}", line),
            HookArg::Str(text) => write!(f, "{:?}", text),
            HookArg::Ordering(code) => write!(f, "mo={}", code),
        }
    }
}

/// A call to a runtime hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookCall {
    pub hook: Hook,
    pub args: Vec<HookArg>,
}

impl HookCall {
    pub fn new(hook: Hook, args: Vec<HookArg>) -> Self {
        Self { hook, args }
    }

    pub fn bare(hook: Hook) -> Self {
        Self { hook, args: Vec::new() }
    }
}

impl fmt::Display for HookCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "call {}({})", self.hook, args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn test_access_hook_symbols() {
        assert_eq!(Hook::Read(AccessSize::S4).symbol(), "__tsan_read4");
        assert_eq!(Hook::Write(AccessSize::S16).symbol(), "__tsan_write16");
        assert_eq!(Hook::UnalignedRead(AccessSize::S2).symbol(), "__tsan_unaligned_read2");
        assert_eq!(Hook::UnalignedWrite(AccessSize::S8).symbol(), "__tsan_unaligned_write8");
    }

    #[test]
    fn test_atomic_hook_symbols_use_bits() {
        assert_eq!(Hook::AtomicLoad(AccessSize::S1).symbol(), "__tsan_atomic8_load");
        assert_eq!(Hook::AtomicStore(AccessSize::S16).symbol(), "__tsan_atomic128_store");
        assert_eq!(
            Hook::AtomicRmw(RmwHook::FetchNand, AccessSize::S4).symbol(),
            "__tsan_atomic32_fetch_nand"
        );
        assert_eq!(
            Hook::AtomicCompareExchange(AccessSize::S8).symbol(),
            "__tsan_atomic64_compare_exchange_val"
        );
    }

    #[test]
    fn test_rmw_ops_without_hook() {
        for op in [RmwOp::Max, RmwOp::Min, RmwOp::UMax, RmwOp::UMin, RmwOp::FAdd, RmwOp::FSub] {
            assert!(RmwHook::from_op(op).is_none(), "{:?}", op);
        }
        assert_eq!(RmwHook::from_op(RmwOp::Xchg), Some(RmwHook::Exchange));
    }

    #[test]
    fn test_hook_call_display() {
        let call = HookCall::new(
            Hook::Write(AccessSize::S4),
            vec![
                HookArg::Address(Pointer::global("counter", Type::Int(32))),
                HookArg::Line(10),
                HookArg::Str("counter".to_string()),
                HookArg::Str("/src/counter.c".to_string()),
            ],
        );
        assert_eq!(
            call.to_string(),
            "call __tsan_write4(@counter, 10, \"counter\", \"/src/counter.c\")"
        );
    }
}
