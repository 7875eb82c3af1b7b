use std::sync::Arc;

use shaftc_ir::{CallDescriptor, RegisterRepresentation};
use smallvec::SmallVec;

use crate::{Location, Register, RegisterClass, regs};

const PARAMETER_REGISTERS: [Register; 6] = [regs::R1, regs::R2, regs::R3, regs::R4, regs::R5, regs::R6];
const FLOAT_PARAMETER_REGISTERS: [Register; 6] = [
    Register::float(0),
    Register::float(1),
    Register::float(2),
    Register::float(3),
    Register::float(4),
    Register::float(5),
];
const SIMD128_PARAMETER_REGISTERS: [Register; 4] = [
    Register::simd128(0),
    Register::simd128(1),
    Register::simd128(2),
    Register::simd128(3),
];
const RETURN_REGISTERS: [Register; 2] = [regs::R0, regs::R2];
const FLOAT_RETURN_REGISTERS: [Register; 2] = [regs::D0, regs::D1];
const SIMD128_RETURN_REGISTERS: [Register; 1] = [Register::simd128(0)];

/// Where the calling convention places a parameter or return value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LinkageLocation {
    Register(Register),
    /// A slot in the caller's frame, numbered as seen from the callee: `-1` is the first stack
    /// parameter
    CallerFrameSlot(i32),
}

impl LinkageLocation {
    pub fn to_location(self) -> Location {
        match self {
            Self::Register(reg) => Location::Register(reg),
            Self::CallerFrameSlot(slot) => Location::StackSlot(slot),
        }
    }

    pub fn is_register(self) -> bool {
        matches!(self, Self::Register(_))
    }
}

/// Assigns locations to `reps` from the given register pools, spilling the rest to consecutive
/// caller frame slots starting at `first_slot`
fn assign(
    reps: &[RegisterRepresentation],
    general: &[Register],
    float: &[Register],
    simd128: &[Register],
    first_slot: i32,
) -> (SmallVec<[LinkageLocation; 4]>, usize) {
    let (mut next_general, mut next_float, mut next_simd) = (0, 0, 0);
    let mut stack_slots = 0usize;
    let locations = reps
        .iter()
        .map(|rep| {
            let (pool, next) = match RegisterClass::of(*rep) {
                RegisterClass::General => (general, &mut next_general),
                RegisterClass::Float => (float, &mut next_float),
                RegisterClass::Simd128 => (simd128, &mut next_simd),
            };
            if let Some(reg) = pool.get(*next) {
                *next += 1;
                LinkageLocation::Register(*reg)
            } else {
                stack_slots += 1;
                LinkageLocation::CallerFrameSlot(first_slot - stack_slots as i32 + 1)
            }
        })
        .collect();
    (locations, stack_slots)
}

/// The locations of the parameters and return values of a call descriptor
#[derive(Debug, Clone)]
pub struct CallLinkage {
    pub parameters: SmallVec<[LinkageLocation; 4]>,
    pub returns: SmallVec<[LinkageLocation; 4]>,
    pub stack_parameter_count: usize,
    pub stack_return_count: usize,
}

impl CallLinkage {
    pub fn new(descriptor: &CallDescriptor) -> Self {
        let (parameters, stack_parameter_count) = assign(
            &descriptor.parameters,
            &PARAMETER_REGISTERS,
            &FLOAT_PARAMETER_REGISTERS,
            &SIMD128_PARAMETER_REGISTERS,
            -1,
        );
        let (returns, stack_return_count) = assign(
            &descriptor.returns,
            &RETURN_REGISTERS,
            &FLOAT_RETURN_REGISTERS,
            &SIMD128_RETURN_REGISTERS,
            -(stack_parameter_count as i32) - 1,
        );
        Self {
            parameters,
            returns,
            stack_parameter_count,
            stack_return_count,
        }
    }

    /// The index of the outgoing argument slot a stack location is written to by the caller
    pub fn outgoing_slot(location: LinkageLocation) -> Option<u16> {
        match location {
            LinkageLocation::CallerFrameSlot(slot) => Some((-slot - 1) as u16),
            LinkageLocation::Register(_) => None,
        }
    }
}

/// The calling convention of the function being compiled
#[derive(Debug, Clone)]
pub struct Linkage {
    descriptor: Arc<CallDescriptor>,
    incoming: CallLinkage,
}

impl Linkage {
    /// The address held in the root register; roots and external references near it are
    /// addressed relative to the register
    pub const ROOTS_TABLE_ADDRESS: u64 = 0x4000_0000;
    /// Compressed tagged values are 32-bit offsets from this address
    pub const CAGE_BASE: u64 = 0x1_0000_0000;

    pub fn new(descriptor: Arc<CallDescriptor>) -> Self {
        let incoming = CallLinkage::new(&descriptor);
        Self {
            descriptor,
            incoming,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &Arc<CallDescriptor> {
        &self.descriptor
    }

    pub fn parameter_location(&self, index: usize) -> Option<LinkageLocation> {
        self.incoming.parameters.get(index).copied()
    }

    pub fn return_location(&self, index: usize) -> Option<LinkageLocation> {
        self.incoming.returns.get(index).copied()
    }

    #[inline]
    pub fn incoming(&self) -> &CallLinkage {
        &self.incoming
    }

    /// The registers that may hold a return value of any call
    pub fn is_return_register(reg: Register) -> bool {
        RETURN_REGISTERS.contains(&reg)
            || FLOAT_RETURN_REGISTERS.contains(&reg)
            || SIMD128_RETURN_REGISTERS.contains(&reg)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::CallKind;

    use super::*;

    #[test]
    fn parameters_overflow_to_caller_frame_slots() {
        let descriptor = CallDescriptor::new(
            CallKind::CodeObject,
            [RegisterRepresentation::Word64; 8],
            [RegisterRepresentation::Word32, RegisterRepresentation::Word32, RegisterRepresentation::Word32],
        );
        let linkage = CallLinkage::new(&descriptor);
        assert_eq!(linkage.parameters[0], LinkageLocation::Register(regs::R1));
        assert_eq!(linkage.parameters[5], LinkageLocation::Register(regs::R6));
        assert_eq!(linkage.parameters[6], LinkageLocation::CallerFrameSlot(-1));
        assert_eq!(linkage.parameters[7], LinkageLocation::CallerFrameSlot(-2));
        assert_eq!(linkage.stack_parameter_count, 2);
        assert_eq!(linkage.returns[0], LinkageLocation::Register(regs::R0));
        assert_eq!(linkage.returns[1], LinkageLocation::Register(regs::R2));
        assert_eq!(linkage.returns[2], LinkageLocation::CallerFrameSlot(-3));
        assert_eq!(CallLinkage::outgoing_slot(linkage.returns[2]), Some(2));
    }

    #[test]
    fn float_parameters_use_their_own_registers() {
        let descriptor = CallDescriptor::new(
            CallKind::CFunction,
            [RegisterRepresentation::Float64, RegisterRepresentation::Word32],
            [RegisterRepresentation::Float64],
        );
        let linkage = CallLinkage::new(&descriptor);
        assert_eq!(linkage.parameters[0], LinkageLocation::Register(regs::D0));
        assert_eq!(linkage.parameters[1], LinkageLocation::Register(regs::R1));
        assert_eq!(linkage.returns[0], LinkageLocation::Register(regs::D0));
    }
}
