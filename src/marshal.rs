//! Spilling register arguments to their stack slots.
//!
//! A generic callee (the interpreter or a runtime helper) reads every
//! argument from the argument area, so before transferring control a snippet
//! stores each argument that still lives in a register into its slot.
//! Arguments past the last register were already stored by the caller and
//! produce no instruction.

use crate::abi::{AbiDescriptor, FloatArgs, Reg, StackGrowth};
use crate::descriptor::ValueType;
use crate::isa::InstructionEncoder;
use crate::result::CompileResult;
use core::fmt;
use smallvec::SmallVec;

/// Width of a single argument store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StoreWidth {
    /// 32-bit store.
    W32,
    /// 64-bit store.
    W64,
}

impl StoreWidth {
    /// Width in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            StoreWidth::W32 => 4,
            StoreWidth::W64 => 8,
        }
    }
}

/// Store `reg` to `[stack_pointer + offset]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArgStore {
    /// Source register.
    pub reg: Reg,
    /// Offset from the linkage's stack pointer.
    pub offset: i32,
    /// Width of the store.
    pub width: StoreWidth,
}

impl fmt::Display for ArgStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "store.{} {} -> [sp{:+}]", self.width.bytes() * 8, self.reg, self.offset)
    }
}

/// The stores that flush a call's register arguments, and the size of the
/// argument area they are written into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPlan {
    /// Stores in argument order.
    pub stores: SmallVec<[ArgStore; 8]>,
    /// Bytes occupied by all arguments, whether flushed here or not.
    pub total_stack_bytes: u32,
}

impl FlushPlan {
    /// Number of bytes the stores encode to on `isa`.
    pub fn encoded_len(&self, isa: &dyn InstructionEncoder) -> CompileResult<u32> {
        let mut len = 0;
        for store in &self.stores {
            len += isa.arg_store_len(store)?;
        }
        Ok(len)
    }

    /// Encodes the stores into `buf`.
    pub fn emit(
        &self,
        isa: &dyn InstructionEncoder,
        buf: &mut crate::buffer::CodeBuffer,
    ) -> CompileResult<()> {
        for store in &self.stores {
            trace!("flush {store}");
            isa.emit_arg_store(buf, store)?;
        }
        Ok(())
    }
}

/// Which bank a value is passed in once the linkage's float policy applies.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Bank {
    Int,
    Float,
}

/// Computes the stores that flush `args` into the argument area starting at
/// `stack_offset_base + abi.first_param_offset`.
///
/// The result depends only on `args` and `abi`.
pub fn flush_arguments(args: &[ValueType], abi: &AbiDescriptor, stack_offset_base: i32) -> FlushPlan {
    let slot = i32::from(abi.slot_size);
    let pointer_size = abi.pointer_size;
    let total = abi.arg_area_size(args);

    let mut offset = match abi.stack_growth {
        StackGrowth::TowardHigherAddress => stack_offset_base + abi.first_param_offset,
        StackGrowth::TowardLowerAddress => {
            stack_offset_base + abi.first_param_offset + total as i32
        }
    };

    let mut plan = FlushPlan {
        stores: SmallVec::new(),
        total_stack_bytes: total,
    };
    let mut int_used = 0usize;
    let mut float_used = 0usize;

    for &ty in args {
        let size = abi.slots_for(ty) as i32 * slot;
        let here = match abi.stack_growth {
            StackGrowth::TowardHigherAddress => {
                let here = offset;
                offset += size;
                here
            }
            StackGrowth::TowardLowerAddress => {
                offset -= size;
                offset
            }
        };

        let bank = match (ty.is_float(), abi.float_args) {
            (true, FloatArgs::IntRegs) | (false, _) => Bank::Int,
            (true, _) => Bank::Float,
        };

        match bank {
            Bank::Float => {
                if let Some(&reg) = abi.float_arg_regs.get(float_used) {
                    let width = if ty == ValueType::Double {
                        StoreWidth::W64
                    } else {
                        StoreWidth::W32
                    };
                    plan.stores.push(ArgStore {
                        reg,
                        offset: here,
                        width,
                    });
                }
                float_used += 1;
                if abi.float_args == FloatArgs::FloatRegsShadowInt {
                    int_used += 1;
                }
            }
            Bank::Int => {
                let bytes = ty.bytes(pointer_size);
                if bytes > pointer_size {
                    // A 64-bit value on a 32-bit target: low half in the next
                    // register, high half in the one after. When only one
                    // register is left the high half is already on the stack.
                    if let Some(&lo) = abi.int_arg_regs.get(int_used) {
                        plan.stores.push(ArgStore {
                            reg: lo,
                            offset: here,
                            width: StoreWidth::W32,
                        });
                    }
                    if let Some(&hi) = abi.int_arg_regs.get(int_used + 1) {
                        plan.stores.push(ArgStore {
                            reg: hi,
                            offset: here + 4,
                            width: StoreWidth::W32,
                        });
                    }
                    int_used += 2;
                } else {
                    if let Some(&reg) = abi.int_arg_regs.get(int_used) {
                        let width = if bytes == 8 {
                            StoreWidth::W64
                        } else {
                            StoreWidth::W32
                        };
                        plan.stores.push(ArgStore {
                            reg,
                            offset: here,
                            width,
                        });
                    }
                    int_used += 1;
                }
            }
        }
    }

    plan
}
