//! Capture analysis for stack slots
//!
//! A stack slot is captured when its address may become visible outside the
//! routine: passed to a call, stored into memory, fed to an atomic as a
//! value, or flagged address-taken by the front end. Only un-captured slots
//! are provably thread-private. Bulk-memory intrinsics read and write
//! through their pointers without retaining them, so they do not capture.

use fnv::FnvHashSet;

use crate::ir::{Op, Operand, PointerBase, Routine, SlotId};

/// Capture state of one routine's stack slots
#[derive(Debug, Default, Clone)]
pub struct CaptureInfo {
    captured: FnvHashSet<SlotId>,
}

impl CaptureInfo {
    /// Compute capture information for a routine
    pub fn compute(routine: &Routine) -> Self {
        let mut captured: FnvHashSet<SlotId> = routine
            .slots
            .iter()
            .filter(|slot| slot.address_taken)
            .map(|slot| slot.id)
            .collect();

        for inst in routine.instructions() {
            match &inst.op {
                Op::Call { args, .. } | Op::Invoke { args, .. } => {
                    captured.extend(args.iter().filter_map(escaping_slot));
                }
                Op::Store { value, .. } | Op::AtomicRmw { value, .. } => {
                    captured.extend(escaping_slot(value));
                }
                Op::CmpXchg { expected, desired, .. } => {
                    captured.extend(escaping_slot(expected));
                    captured.extend(escaping_slot(desired));
                }
                Op::Load { .. }
                | Op::Fence { .. }
                | Op::MemSet { .. }
                | Op::MemCpy { .. }
                | Op::MemMove { .. }
                | Op::Other { .. } => {}
            }
        }

        Self { captured }
    }

    /// True when the slot's address may escape the routine
    pub fn is_captured(&self, slot: SlotId) -> bool {
        self.captured.contains(&slot)
    }

    pub fn captured_count(&self) -> usize {
        self.captured.len()
    }
}

fn escaping_slot(operand: &Operand) -> Option<SlotId> {
    match operand {
        Operand::Address(ptr) => match ptr.base {
            PointerBase::Slot(id) => Some(id),
            _ => None,
        },
        Operand::Const(_) | Operand::Register(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Block, Callee, Instruction, Pointer, RoutineAttributes, StackSlot, Terminator, Type,
    };

    fn routine(slots: Vec<StackSlot>, instructions: Vec<Instruction>) -> Routine {
        Routine {
            name: "f".to_string(),
            attributes: RoutineAttributes::default(),
            slots,
            blocks: vec![Block {
                label: "entry".to_string(),
                instructions,
                terminator: Terminator::Return,
            }],
        }
    }

    fn slot(id: u32, address_taken: bool) -> StackSlot {
        StackSlot {
            id: SlotId(id),
            name: format!("s{}", id),
            address_taken,
        }
    }

    #[test]
    fn test_plain_accesses_do_not_capture() {
        let r = routine(
            vec![slot(0, false)],
            vec![
                Instruction::new(
                    0,
                    Op::Store {
                        ptr: Pointer::slot(0, Type::Int(32)),
                        value: Operand::Const(1),
                        align: 4,
                        atomic: None,
                    },
                ),
                Instruction::new(
                    1,
                    Op::Load { ptr: Pointer::slot(0, Type::Int(32)), align: 4, atomic: None },
                ),
            ],
        );
        let info = CaptureInfo::compute(&r);
        assert!(!info.is_captured(SlotId(0)));
        assert_eq!(info.captured_count(), 0);
    }

    #[test]
    fn test_call_argument_captures() {
        let r = routine(
            vec![slot(0, false), slot(1, false)],
            vec![Instruction::new(
                0,
                Op::Call {
                    callee: Callee::Direct("pthread_create".to_string()),
                    args: vec![Operand::Address(Pointer::slot(1, Type::Int(64)).with_offset(8))],
                    may_unwind: false,
                },
            )],
        );
        let info = CaptureInfo::compute(&r);
        assert!(!info.is_captured(SlotId(0)));
        assert!(info.is_captured(SlotId(1)));
    }

    #[test]
    fn test_storing_address_captures() {
        let r = routine(
            vec![slot(0, false)],
            vec![Instruction::new(
                0,
                Op::Store {
                    ptr: Pointer::global("shared_ptr", Type::Ptr),
                    value: Operand::Address(Pointer::slot(0, Type::Int(32))),
                    align: 8,
                    atomic: None,
                },
            )],
        );
        assert!(CaptureInfo::compute(&r).is_captured(SlotId(0)));
    }

    #[test]
    fn test_address_taken_flag_captures() {
        let r = routine(vec![slot(0, true)], vec![]);
        assert!(CaptureInfo::compute(&r).is_captured(SlotId(0)));
    }

    #[test]
    fn test_memcpy_does_not_capture() {
        let r = routine(
            vec![slot(0, false)],
            vec![Instruction::new(
                0,
                Op::MemCpy {
                    dst: Pointer::slot(0, Type::Bytes(64)),
                    src: Pointer::global("table", Type::Bytes(64)),
                    len: Operand::Const(64),
                },
            )],
        );
        assert!(!CaptureInfo::compute(&r).is_captured(SlotId(0)));
    }
}
