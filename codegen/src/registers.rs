use core::fmt;

use shaftc_ir::RegisterRepresentation;
use smallvec::SmallVec;

/// The bank of machine registers a value lives in
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterClass {
    General,
    Float,
    Simd128,
}

impl RegisterClass {
    pub const ALL: [Self; 3] = [Self::General, Self::Float, Self::Simd128];

    pub fn of(rep: RegisterRepresentation) -> Self {
        match rep {
            RegisterRepresentation::Float32 | RegisterRepresentation::Float64 => Self::Float,
            RegisterRepresentation::Simd128 => Self::Simd128,
            _ => Self::General,
        }
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::General => "general",
            Self::Float => "float",
            Self::Simd128 => "simd128",
        })
    }
}

/// A physical register of the reference target
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub class: RegisterClass,
    pub code: u8,
}

impl Register {
    pub const fn general(code: u8) -> Self {
        Self {
            class: RegisterClass::General,
            code,
        }
    }

    pub const fn float(code: u8) -> Self {
        Self {
            class: RegisterClass::Float,
            code,
        }
    }

    pub const fn simd128(code: u8) -> Self {
        Self {
            class: RegisterClass::Simd128,
            code,
        }
    }

    /// The scratch register of `class`, never handed out by the allocator
    pub const fn scratch(class: RegisterClass) -> Self {
        match class {
            RegisterClass::General => regs::SCRATCH,
            RegisterClass::Float => regs::FP_SCRATCH,
            RegisterClass::Simd128 => regs::SIMD128_SCRATCH,
        }
    }

    /// The encoding of this register in a single byte: class in the high nibble, code in the low
    pub fn encoding(self) -> u8 {
        let class = match self.class {
            RegisterClass::General => 0,
            RegisterClass::Float => 1,
            RegisterClass::Simd128 => 2,
        };
        (class << 4) | (self.code & 0xf)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class, self.code) {
            (RegisterClass::General, 13) => f.write_str("root"),
            (RegisterClass::General, 14) => f.write_str("fp"),
            (RegisterClass::General, 15) => f.write_str("sp"),
            (RegisterClass::General, code) => write!(f, "r{code}"),
            (RegisterClass::Float, code) => write!(f, "d{code}"),
            (RegisterClass::Simd128, code) => write!(f, "q{code}"),
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Named registers of the reference target
pub mod regs {
    use super::Register;

    pub const R0: Register = Register::general(0);
    pub const R1: Register = Register::general(1);
    pub const R2: Register = Register::general(2);
    pub const R3: Register = Register::general(3);
    pub const R4: Register = Register::general(4);
    pub const R5: Register = Register::general(5);
    pub const R6: Register = Register::general(6);
    pub const R7: Register = Register::general(7);
    pub const SCRATCH: Register = Register::general(12);
    /// Holds the base address of the roots table
    pub const ROOT: Register = Register::general(13);
    pub const FP: Register = Register::general(14);
    pub const SP: Register = Register::general(15);

    pub const D0: Register = Register::float(0);
    pub const D1: Register = Register::float(1);
    pub const FP_SCRATCH: Register = Register::float(15);

    pub const SIMD128_SCRATCH: Register = Register::simd128(7);

    /// Holds the call target when a call descriptor asks for a fixed target register
    pub const CALL_TARGET: Register = R7;
}

/// The registers available to the register allocator, per register class
#[derive(Debug, Clone)]
pub struct RegisterConfiguration {
    general: SmallVec<[u8; 16]>,
    float: SmallVec<[u8; 16]>,
    simd128: SmallVec<[u8; 8]>,
}

impl RegisterConfiguration {
    pub const NUM_GENERAL_REGISTERS: usize = 16;
    pub const NUM_FLOAT_REGISTERS: usize = 16;
    pub const NUM_SIMD128_REGISTERS: usize = 8;

    /// `r0..r11`, `d0..d14` and `q0..q6`
    pub fn reference() -> Self {
        Self {
            general: (0..12).collect(),
            float: (0..15).collect(),
            simd128: (0..7).collect(),
        }
    }

    /// Restrict allocation to the given register codes of `class`.
    ///
    /// Registers that are part of the calling convention stay usable as fixed operands even when
    /// they are not allocatable.
    pub fn restricted(mut self, class: RegisterClass, codes: impl IntoIterator<Item = u8>) -> Self {
        let codes = codes.into_iter();
        match class {
            RegisterClass::General => self.general = codes.collect(),
            RegisterClass::Float => self.float = codes.collect(),
            RegisterClass::Simd128 => self.simd128 = codes.collect(),
        }
        self
    }

    pub fn allocatable_codes(&self, class: RegisterClass) -> &[u8] {
        match class {
            RegisterClass::General => &self.general,
            RegisterClass::Float => &self.float,
            RegisterClass::Simd128 => &self.simd128,
        }
    }

    pub fn allocatable(&self, class: RegisterClass) -> impl Iterator<Item = Register> + '_ {
        self.allocatable_codes(class).iter().map(move |code| Register { class, code: *code })
    }

    pub fn is_allocatable(&self, reg: Register) -> bool {
        self.allocatable_codes(reg.class).contains(&reg.code)
    }

    pub fn num_registers(class: RegisterClass) -> usize {
        match class {
            RegisterClass::General => Self::NUM_GENERAL_REGISTERS,
            RegisterClass::Float => Self::NUM_FLOAT_REGISTERS,
            RegisterClass::Simd128 => Self::NUM_SIMD128_REGISTERS,
        }
    }
}

impl Default for RegisterConfiguration {
    fn default() -> Self {
        Self::reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_and_reserved_registers_are_not_allocatable() {
        let config = RegisterConfiguration::reference();
        for reg in [regs::SCRATCH, regs::ROOT, regs::FP, regs::SP, regs::FP_SCRATCH] {
            assert!(!config.is_allocatable(reg), "{reg} must not be allocatable");
        }
        assert!(!config.is_allocatable(regs::SIMD128_SCRATCH));
        assert_eq!(config.allocatable(RegisterClass::General).count(), 12);
        assert_eq!(regs::R1.to_string(), "r1");
        assert_eq!(regs::FP.to_string(), "fp");
    }
}
