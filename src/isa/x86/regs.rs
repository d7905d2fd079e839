//! x86 register definitions and the JIT linkage built from them.

use crate::abi::{AbiDescriptor, FloatArgs, Reg, StackGrowth};
use smallvec::smallvec;

const ENC_RAX: u8 = 0;
const ENC_RCX: u8 = 1;
const ENC_RDX: u8 = 2;
const ENC_RSP: u8 = 4;
const ENC_RBP: u8 = 5;
const ENC_RSI: u8 = 6;

/// Constructors for GPR.

pub(crate) const fn rax() -> Reg {
    Reg::int(ENC_RAX, "rax")
}
pub(crate) const fn rcx() -> Reg {
    Reg::int(ENC_RCX, "rcx")
}
pub(crate) const fn rdx() -> Reg {
    Reg::int(ENC_RDX, "rdx")
}
pub(crate) const fn rsp() -> Reg {
    Reg::int(ENC_RSP, "rsp")
}
/// Holds the current VM thread in JIT code.
pub(crate) const fn rbp() -> Reg {
    Reg::int(ENC_RBP, "rbp")
}
pub(crate) const fn rsi() -> Reg {
    Reg::int(ENC_RSI, "rsi")
}

pub(crate) const fn eax() -> Reg {
    Reg::int(ENC_RAX, "eax")
}
pub(crate) const fn edx() -> Reg {
    Reg::int(ENC_RDX, "edx")
}
pub(crate) const fn esp() -> Reg {
    Reg::int(ENC_RSP, "esp")
}
pub(crate) const fn ebp() -> Reg {
    Reg::int(ENC_RBP, "ebp")
}

const XMM_NAMES: [&str; 8] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7",
];

/// Constructor for an SSE register.
pub(crate) const fn xmm(enc: u8) -> Reg {
    Reg::float(enc, XMM_NAMES[enc as usize])
}

/// x86-64 linkage: four integer and eight SSE argument registers; arguments
/// were pushed left to right above the return address.
pub(crate) fn x64_abi() -> AbiDescriptor {
    AbiDescriptor {
        int_arg_regs: smallvec![rax(), rsi(), rdx(), rcx()],
        float_arg_regs: (0..8).map(xmm).collect(),
        float_args: FloatArgs::FloatRegs,
        stack_growth: StackGrowth::TowardLowerAddress,
        slot_size: 8,
        first_param_offset: 8,
        pointer_size: 8,
        stack_pointer: rsp(),
        thread_pointer: Some(rbp()),
        frame_pointer: None,
    }
}

/// IA-32 linkage: two integer argument registers; floats always travel on
/// the stack.
pub(crate) fn ia32_abi() -> AbiDescriptor {
    AbiDescriptor {
        int_arg_regs: smallvec![eax(), edx()],
        float_arg_regs: smallvec![],
        float_args: FloatArgs::FloatRegs,
        stack_growth: StackGrowth::TowardLowerAddress,
        slot_size: 4,
        first_param_offset: 4,
        pointer_size: 4,
        stack_pointer: esp(),
        thread_pointer: Some(ebp()),
        frame_pointer: None,
    }
}
