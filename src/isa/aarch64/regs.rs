//! AArch64 register definition.

use crate::abi::{AbiDescriptor, FloatArgs, Reg, StackGrowth};

/// Argument registers of the JIT linkage.
pub(crate) const NUM_ARG_REGS: u8 = 8;

const XREG_NAMES: [&str; 32] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "xzr",
];

const DREG_NAMES: [&str; 8] = ["d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7"];

/// Construct a X-register from an index.
pub(crate) const fn xreg(num: u8) -> Reg {
    assert!(num < 32);
    Reg::int(num, XREG_NAMES[num as usize])
}

/// Construct a D-register from an index.
pub(crate) const fn dreg(num: u8) -> Reg {
    assert!(num < 8);
    Reg::float(num, DREG_NAMES[num as usize])
}

/// Scratch register.
/// Intra-procedure-call corruptible register.
pub(crate) const fn ip0() -> Reg {
    xreg(16)
}

/// Register holding the current VM thread.
pub(crate) const fn thread() -> Reg {
    xreg(19)
}

/// Stack pointer of JIT frames. The hardware `sp` keeps the native
/// alignment rules, so JIT code addresses arguments through its own
/// register.
pub(crate) const fn java_sp() -> Reg {
    xreg(20)
}

/// Frame pointer register.
pub(crate) const fn fp() -> Reg {
    xreg(29)
}

/// AArch64 linkage: eight integer and eight floating-point argument
/// registers, arguments laid out left to right from the stack pointer.
pub(crate) fn abi() -> AbiDescriptor {
    AbiDescriptor {
        int_arg_regs: (0..NUM_ARG_REGS).map(xreg).collect(),
        float_arg_regs: (0..NUM_ARG_REGS).map(dreg).collect(),
        float_args: FloatArgs::FloatRegs,
        stack_growth: StackGrowth::TowardLowerAddress,
        slot_size: 8,
        first_param_offset: 0,
        pointer_size: 8,
        stack_pointer: java_sp(),
        thread_pointer: Some(thread()),
        frame_pointer: Some(fp()),
    }
}
