//! Argument-passing conventions of the JIT's private linkage.
//!
//! An [`AbiDescriptor`] is compiled-in configuration: the built-in tables live
//! next to each encoder under [`crate::isa`], and embedders targeting an
//! unusual convention (soft-float ARM, say) can build their own.

use core::fmt;
use smallvec::SmallVec;

/// The bank a register belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// General-purpose registers.
    Int,
    /// Floating-point / vector registers.
    Float,
}

/// A physical register: its class, hardware encoding and assembly name.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Reg {
    class: RegClass,
    enc: u8,
    name: &'static str,
}

impl Reg {
    /// Constructs a general-purpose register.
    pub const fn int(enc: u8, name: &'static str) -> Self {
        Self {
            class: RegClass::Int,
            enc,
            name,
        }
    }

    /// Constructs a floating-point register.
    pub const fn float(enc: u8, name: &'static str) -> Self {
        Self {
            class: RegClass::Float,
            enc,
            name,
        }
    }

    /// The register's bank.
    pub fn class(self) -> RegClass {
        self.class
    }

    /// The hardware encoding.
    pub fn hw_enc(self) -> u8 {
        self.enc
    }

    /// The assembly name.
    pub fn name(self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Which way consecutive arguments are laid out in the caller's outgoing
/// argument area.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StackGrowth {
    /// The first argument is at the lowest address.
    TowardHigherAddress,
    /// The first argument is at the highest address; arguments were pushed
    /// left to right.
    TowardLowerAddress,
}

/// How floating-point arguments are assigned to registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FloatArgs {
    /// Floats use the float bank only.
    FloatRegs,
    /// Floats use the float bank and also consume a position in the integer
    /// bank (positional assignment).
    FloatRegsShadowInt,
    /// Floats travel in general-purpose registers (soft-float).
    IntRegs,
}

/// Argument registers, slot geometry and special registers of a linkage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiDescriptor {
    /// Integer argument registers, in assignment order.
    pub int_arg_regs: SmallVec<[Reg; 8]>,
    /// Floating-point argument registers, in assignment order.
    pub float_arg_regs: SmallVec<[Reg; 8]>,
    /// How floats are assigned.
    pub float_args: FloatArgs,
    /// Layout direction of the argument area.
    pub stack_growth: StackGrowth,
    /// Size of one argument slot in bytes.
    pub slot_size: u8,
    /// Offset from the stack pointer to the argument area.
    pub first_param_offset: i32,
    /// Size of an address in bytes.
    pub pointer_size: u8,
    /// Register holding the stack pointer the argument area is addressed from.
    pub stack_pointer: Reg,
    /// Register holding the current VM thread, if the linkage reserves one.
    pub thread_pointer: Option<Reg>,
    /// Frame pointer, if the linkage keeps one.
    pub frame_pointer: Option<Reg>,
}

impl AbiDescriptor {
    /// Number of bytes the argument list occupies in the argument area.
    pub fn arg_area_size(&self, args: &[crate::ValueType]) -> u32 {
        args.iter()
            .map(|ty| self.slots_for(*ty) * u32::from(self.slot_size))
            .sum()
    }

    /// Number of slots one argument occupies.
    pub fn slots_for(&self, ty: crate::ValueType) -> u32 {
        if ty.is_wide() { 2 } else { 1 }
    }
}
