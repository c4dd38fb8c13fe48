//! Routine IR consumed by the instrumentation pass
//!
//! A small, serializable model of an SSA-style module: routines made of
//! basic blocks, each block a list of instructions closed by a terminator.
//! Pointers carry their provenance (global, stack slot, argument, vtable
//! slot) so the eligibility rules can reason about the underlying object
//! without a full pointer analysis.

use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{ModuleError, Result};

/// Identifier of an instruction, unique within its routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstId(pub u32);

/// Identifier of a stack slot (an `alloca`), unique within its routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%slot{}", self.0)
    }
}

/// Value types, only as precise as store-size computation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    /// Integer of the given bit width
    Int(u32),
    /// Floating point of the given bit width
    Float(u32),
    /// Pointer in the target's pointer width
    Ptr,
    /// Fixed-width vector
    Vector { lanes: u32, elem_bits: u32 },
    /// Opaque aggregate of the given byte size
    Bytes(u64),
}

impl Type {
    /// Number of bytes written when storing a value of this type
    pub fn store_size(&self, layout: &DataLayout) -> u64 {
        match *self {
            Type::Int(bits) | Type::Float(bits) => u64::from(bits).div_ceil(8),
            Type::Ptr => u64::from(layout.pointer_bytes),
            Type::Vector { lanes, elem_bits } => {
                (u64::from(lanes) * u64::from(elem_bits)).div_ceil(8)
            }
            Type::Bytes(bytes) => bytes,
        }
    }
}

/// Target properties the pass needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLayout {
    /// Size of a pointer in bytes
    pub pointer_bytes: u32,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self { pointer_bytes: 8 }
    }
}

/// Where a pointer ultimately points
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerBase {
    /// A module-level global variable
    Global(String),
    /// A stack slot of the enclosing routine
    Slot(SlotId),
    /// A routine argument
    Argument(String),
    /// An entry of a virtual-dispatch table (address loaded through a vptr)
    VtableSlot,
    /// Anything the IR does not track
    Unknown,
}

/// An address expression: base object plus constant in-bounds offset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub base: PointerBase,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub address_space: u32,
    /// Type of the value read or written through this pointer
    pub pointee: Type,
}

impl Pointer {
    pub fn global(name: impl Into<String>, pointee: Type) -> Self {
        Self {
            base: PointerBase::Global(name.into()),
            offset: 0,
            address_space: 0,
            pointee,
        }
    }

    pub fn slot(id: u32, pointee: Type) -> Self {
        Self {
            base: PointerBase::Slot(SlotId(id)),
            offset: 0,
            address_space: 0,
            pointee,
        }
    }

    pub fn argument(name: impl Into<String>, pointee: Type) -> Self {
        Self {
            base: PointerBase::Argument(name.into()),
            offset: 0,
            address_space: 0,
            pointee,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn in_address_space(mut self, address_space: u32) -> Self {
        self.address_space = address_space;
        self
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.base {
            PointerBase::Global(name) => write!(f, "@{}", name)?,
            PointerBase::Slot(id) => write!(f, "{}", id)?,
            PointerBase::Argument(name) => write!(f, "%{}", name)?,
            PointerBase::VtableSlot => write!(f, "vtable")?,
            PointerBase::Unknown => write!(f, "?")?,
        }
        if self.offset != 0 {
            write!(f, "+{}", self.offset)?;
        }
        if self.address_space != 0 {
            write!(f, " addrspace({})", self.address_space)?;
        }
        Ok(())
    }
}

/// An instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Const(i64),
    Register(String),
    /// The address of an object, used as a value
    Address(Pointer),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Const(value) => write!(f, "{}", value),
            Operand::Register(name) => write!(f, "%{}", name),
            Operand::Address(ptr) => write!(f, "&{}", ptr),
        }
    }
}

/// LLVM-style atomic orderings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicOrdering {
    Unordered,
    Monotonic,
    Consume,
    Acquire,
    Release,
    AcquireRelease,
    SequentiallyConsistent,
}

/// Synchronization scope of an atomic or fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Synchronizes only with a signal handler on the same thread
    SingleThread,
    #[default]
    CrossThread,
}

/// Ordering and scope of an atomic load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomicInfo {
    pub ordering: AtomicOrdering,
    #[serde(default)]
    pub scope: SyncScope,
}

/// Read-modify-write operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Nand,
    Or,
    Xor,
    Max,
    Min,
    UMax,
    UMin,
    FAdd,
    FSub,
}

/// Call target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Direct(String),
    Indirect,
}

impl Callee {
    pub fn name(&self) -> Option<&str> {
        match self {
            Callee::Direct(name) => Some(name),
            Callee::Indirect => None,
        }
    }
}

/// Instruction payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Load {
        ptr: Pointer,
        #[serde(default)]
        align: u32,
        #[serde(default)]
        atomic: Option<AtomicInfo>,
    },
    Store {
        ptr: Pointer,
        value: Operand,
        #[serde(default)]
        align: u32,
        #[serde(default)]
        atomic: Option<AtomicInfo>,
    },
    AtomicRmw {
        ptr: Pointer,
        op: RmwOp,
        value: Operand,
        ordering: AtomicOrdering,
    },
    CmpXchg {
        ptr: Pointer,
        expected: Operand,
        desired: Operand,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    },
    Fence {
        ordering: AtomicOrdering,
        #[serde(default)]
        scope: SyncScope,
    },
    Call {
        callee: Callee,
        #[serde(default)]
        args: Vec<Operand>,
        /// Calls marked `nounwind` cannot leave the routine by unwinding
        #[serde(default = "default_true")]
        may_unwind: bool,
    },
    Invoke {
        callee: Callee,
        #[serde(default)]
        args: Vec<Operand>,
        /// Label of the landing-pad block
        unwind: String,
    },
    MemSet {
        dst: Pointer,
        value: Operand,
        len: Operand,
    },
    MemCpy {
        dst: Pointer,
        src: Pointer,
        len: Operand,
    },
    MemMove {
        dst: Pointer,
        src: Pointer,
        len: Operand,
    },
    /// Any instruction that neither touches memory nor calls
    Other { text: String },
}

fn default_true() -> bool {
    true
}

impl Op {
    /// Calls, invokes and bulk-memory intrinsics end a straight-line region
    pub fn is_call_like(&self) -> bool {
        matches!(
            self,
            Op::Call { .. } | Op::Invoke { .. } | Op::MemSet { .. } | Op::MemCpy { .. } | Op::MemMove { .. }
        )
    }

    /// True when this instruction can leave the routine by unwinding
    pub fn may_unwind(&self) -> bool {
        match self {
            Op::Call { may_unwind, .. } => *may_unwind,
            Op::Invoke { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Load { ptr, atomic, .. } => match atomic {
                Some(info) => write!(f, "load atomic {:?} {}", info.ordering, ptr),
                None => write!(f, "load {}", ptr),
            },
            Op::Store { ptr, value, atomic, .. } => match atomic {
                Some(info) => write!(f, "store atomic {:?} {}, {}", info.ordering, value, ptr),
                None => write!(f, "store {}, {}", value, ptr),
            },
            Op::AtomicRmw { ptr, op, value, ordering } => {
                write!(f, "atomicrmw {:?} {}, {} {:?}", op, ptr, value, ordering)
            }
            Op::CmpXchg { ptr, expected, desired, success, failure } => write!(
                f,
                "cmpxchg {}, {}, {} {:?} {:?}",
                ptr, expected, desired, success, failure
            ),
            Op::Fence { ordering, scope } => write!(f, "fence {:?} {:?}", scope, ordering),
            Op::Call { callee, args, .. } | Op::Invoke { callee, args, .. } => {
                let keyword = if matches!(self, Op::Call { .. }) { "call" } else { "invoke" };
                let target = callee.name().unwrap_or("<indirect>");
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{} {}({})", keyword, target, args.join(", "))
            }
            Op::MemSet { dst, value, len } => write!(f, "llvm.memset {}, {}, {}", dst, value, len),
            Op::MemCpy { dst, src, len } => write!(f, "llvm.memcpy {}, {}, {}", dst, src, len),
            Op::MemMove { dst, src, len } => write!(f, "llvm.memmove {}, {}, {}", dst, src, len),
            Op::Other { text } => write!(f, "{}", text),
        }
    }
}

/// Source position attached to an instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLoc {
    pub line: u32,
    pub file: String,
    #[serde(default)]
    pub directory: String,
}

/// A single instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstId,
    pub op: Op,
    #[serde(default)]
    pub loc: Option<DebugLoc>,
    /// TBAA tag marks this access as a vtable-pointer access
    #[serde(default)]
    pub vtable_access: bool,
}

impl Instruction {
    pub fn new(id: u32, op: Op) -> Self {
        Self {
            id: InstId(id),
            op,
            loc: None,
            vtable_access: false,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.loc = Some(DebugLoc {
            line,
            file: file.into(),
            directory: String::new(),
        });
        self
    }

    pub fn vtable(mut self) -> Self {
        self.vtable_access = true;
        self
    }
}

/// Block terminators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Terminator {
    Return,
    /// Continue unwinding out of the routine
    Resume,
    Branch { targets: Vec<String> },
    Unreachable,
}

/// A basic block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub label: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

/// A stack slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSlot {
    pub id: SlotId,
    pub name: String,
    /// Address escapes through a path the IR does not show
    #[serde(default)]
    pub address_taken: bool,
}

/// Routine-level attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineAttributes {
    /// Plain accesses and bulk-memory ops are only instrumented with this set
    #[serde(default = "default_true")]
    pub sanitize_thread: bool,
    /// Races inside calls from this routine are suppressed at runtime
    #[serde(default)]
    pub no_checking_at_run_time: bool,
}

impl Default for RoutineAttributes {
    fn default() -> Self {
        Self {
            sanitize_thread: true,
            no_checking_at_run_time: false,
        }
    }
}

/// A routine (function definition)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    #[serde(default)]
    pub attributes: RoutineAttributes,
    #[serde(default)]
    pub slots: Vec<StackSlot>,
    pub blocks: Vec<Block>,
}

impl Routine {
    pub fn slot(&self, id: SlotId) -> Option<&StackSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|block| block.instructions.iter())
    }

    pub fn has_calls(&self) -> bool {
        self.instructions().any(|inst| inst.op.is_call_like())
    }
}

/// A module-level global variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    /// Read-only data
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub section: Option<String>,
}

/// A compilation unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub globals: Vec<Global>,
    pub routines: Vec<Routine>,
}

impl Module {
    /// Parse a module from its JSON form and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let module: Module = serde_json::from_str(json)?;
        module.validate()?;
        Ok(module)
    }

    /// Load a module from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ModuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|global| global.name == name)
    }

    /// Check cross references the serde shape cannot express
    pub fn validate(&self) -> Result<()> {
        for routine in &self.routines {
            let mut seen: FnvHashSet<InstId> = FnvHashSet::default();
            for inst in routine.instructions() {
                if !seen.insert(inst.id) {
                    return Err(ModuleError::DuplicateInstruction {
                        routine: routine.name.clone(),
                        id: inst.id.0,
                    });
                }
                for ptr in pointers_of(&inst.op) {
                    if let PointerBase::Slot(id) = ptr.base {
                        if routine.slot(id).is_none() {
                            return Err(ModuleError::UnknownSlot {
                                routine: routine.name.clone(),
                                slot: id.0,
                            });
                        }
                    }
                }
                if let Op::Invoke { unwind, .. } = &inst.op {
                    if !routine.blocks.iter().any(|block| &block.label == unwind) {
                        return Err(ModuleError::UnknownBlock {
                            routine: routine.name.clone(),
                            label: unwind.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Every pointer an instruction mentions, as address or as value
pub(crate) fn pointers_of(op: &Op) -> Vec<&Pointer> {
    let mut out = Vec::new();
    match op {
        Op::Load { ptr, .. } => out.push(ptr),
        Op::Store { ptr, value, .. } => {
            out.push(ptr);
            if let Operand::Address(p) = value {
                out.push(p);
            }
        }
        Op::AtomicRmw { ptr, value, .. } => {
            out.push(ptr);
            if let Operand::Address(p) = value {
                out.push(p);
            }
        }
        Op::CmpXchg { ptr, expected, desired, .. } => {
            out.push(ptr);
            for operand in [expected, desired] {
                if let Operand::Address(p) = operand {
                    out.push(p);
                }
            }
        }
        Op::Call { args, .. } | Op::Invoke { args, .. } => {
            for operand in args {
                if let Operand::Address(p) = operand {
                    out.push(p);
                }
            }
        }
        Op::MemSet { dst, .. } => out.push(dst),
        Op::MemCpy { dst, src, .. } | Op::MemMove { dst, src, .. } => {
            out.push(dst);
            out.push(src);
        }
        Op::Fence { .. } | Op::Other { .. } => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_size_of_types() {
        let layout = DataLayout::default();
        assert_eq!(Type::Int(1).store_size(&layout), 1);
        assert_eq!(Type::Int(32).store_size(&layout), 4);
        assert_eq!(Type::Int(24).store_size(&layout), 3);
        assert_eq!(Type::Float(64).store_size(&layout), 8);
        assert_eq!(Type::Ptr.store_size(&layout), 8);
        assert_eq!(Type::Ptr.store_size(&DataLayout { pointer_bytes: 4 }), 4);
        assert_eq!(Type::Vector { lanes: 4, elem_bits: 32 }.store_size(&layout), 16);
        assert_eq!(Type::Bytes(40).store_size(&layout), 40);
    }

    #[test]
    fn test_module_json_shape() {
        let json = r#"{
            "name": "m",
            "globals": [{"name": "counter"}],
            "routines": [{
                "name": "worker",
                "slots": [{"id": 0, "name": "tmp"}],
                "blocks": [{
                    "label": "entry",
                    "instructions": [
                        {"id": 0, "op": {"kind": "load", "ptr": {"base": {"global": "counter"}, "pointee": {"int": 32}}, "align": 4},
                         "loc": {"line": 10, "file": "counter.c", "directory": "/src"}},
                        {"id": 1, "op": {"kind": "store", "ptr": {"base": {"slot": 0}, "pointee": {"int": 32}}, "value": {"const": 1}}},
                        {"id": 2, "op": {"kind": "call", "callee": {"direct": "helper"}}}
                    ],
                    "terminator": {"kind": "return"}
                }]
            }]
        }"#;

        let module = Module::from_json_str(json).unwrap();
        let routine = &module.routines[0];
        assert!(routine.attributes.sanitize_thread);
        assert_eq!(routine.blocks[0].instructions.len(), 3);
        assert!(routine.has_calls());
        assert!(routine.blocks[0].instructions[2].op.may_unwind());
        assert_eq!(routine.blocks[0].instructions[0].loc.as_ref().unwrap().line, 10);
    }

    #[test]
    fn test_validate_rejects_unknown_slot() {
        let module = Module {
            name: "m".to_string(),
            globals: vec![],
            routines: vec![Routine {
                name: "f".to_string(),
                attributes: RoutineAttributes::default(),
                slots: vec![],
                blocks: vec![Block {
                    label: "entry".to_string(),
                    instructions: vec![Instruction::new(
                        0,
                        Op::Load { ptr: Pointer::slot(3, Type::Int(8)), align: 1, atomic: None },
                    )],
                    terminator: Terminator::Return,
                }],
            }],
        };

        let err = module.validate().unwrap_err();
        assert!(matches!(err, ModuleError::UnknownSlot { slot: 3, .. }));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let load = Instruction::new(
            7,
            Op::Load { ptr: Pointer::global("g", Type::Int(8)), align: 1, atomic: None },
        );
        let module = Module {
            name: "m".to_string(),
            globals: vec![],
            routines: vec![Routine {
                name: "f".to_string(),
                attributes: RoutineAttributes::default(),
                slots: vec![],
                blocks: vec![Block {
                    label: "entry".to_string(),
                    instructions: vec![load.clone(), load],
                    terminator: Terminator::Return,
                }],
            }],
        };

        assert!(matches!(
            module.validate(),
            Err(ModuleError::DuplicateInstruction { id: 7, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_unwind_target() {
        let module = Module {
            name: "m".to_string(),
            globals: vec![],
            routines: vec![Routine {
                name: "f".to_string(),
                attributes: RoutineAttributes::default(),
                slots: vec![],
                blocks: vec![Block {
                    label: "entry".to_string(),
                    instructions: vec![Instruction::new(
                        0,
                        Op::Invoke {
                            callee: Callee::Direct("may_throw".to_string()),
                            args: vec![],
                            unwind: "lpad".to_string(),
                        },
                    )],
                    terminator: Terminator::Return,
                }],
            }],
        };

        assert!(matches!(module.validate(), Err(ModuleError::UnknownBlock { .. })));
    }

    #[test]
    fn test_pointer_display() {
        let ptr = Pointer::global("counter", Type::Int(32)).with_offset(4);
        assert_eq!(ptr.to_string(), "@counter+4");
        let ptr = Pointer::slot(2, Type::Int(8)).in_address_space(3);
        assert_eq!(ptr.to_string(), "%slot2 addrspace(3)");
    }
}
