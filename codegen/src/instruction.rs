//! The target-level instruction model shared by instruction selection, register allocation and
//! code generation.

use core::fmt;

use cranelift_entity::entity_impl;
use shaftc_ir::{
    FloatBinopKind, FloatRepresentation, FloatUnaryKind, MemoryRepresentation,
    RegisterRepresentation, Simd128BinopKind, SourcePosition, WordRepresentation,
};
use smallvec::SmallVec;

use crate::Register;

/// A virtual register, holding the value of one operation (or one projection of it)
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualRegister(u32);
entity_impl!(VirtualRegister, "v");

/// The position of an instruction block in the final block order
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpoNumber(u32);
entity_impl!(RpoNumber, "B");

/// Where the register allocator may place an unallocated operand
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperandPolicy {
    /// A register, a stack slot, or the constant itself if the value is a constant
    Any,
    MustHaveRegister,
    /// Exactly this location, as demanded by the calling convention
    Fixed(Location),
    /// An output that must be allocated to the same register as the given input
    SameAsInput(u8),
}

/// Whether an input is only read at the start of an instruction, so that its register may be reused
/// for an output, or must stay intact until the instruction completes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Lifetime {
    UsedAtStart,
    UsedAtEnd,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UnallocatedOperand {
    pub vreg: VirtualRegister,
    pub policy: OperandPolicy,
    pub lifetime: Lifetime,
}

impl UnallocatedOperand {
    pub fn new(vreg: VirtualRegister, policy: OperandPolicy) -> Self {
        Self {
            vreg,
            policy,
            lifetime: Lifetime::UsedAtEnd,
        }
    }

    pub fn at_start(vreg: VirtualRegister, policy: OperandPolicy) -> Self {
        Self {
            vreg,
            policy,
            lifetime: Lifetime::UsedAtStart,
        }
    }

    #[inline]
    pub fn is_used_at_start(&self) -> bool {
        self.lifetime == Lifetime::UsedAtStart
    }

    #[inline]
    pub fn has_register_policy(&self) -> bool {
        matches!(self.policy, OperandPolicy::MustHaveRegister | OperandPolicy::SameAsInput(_))
    }
}

/// A concrete machine location
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Register(Register),
    /// A frame slot of 8 bytes. Non-negative indices are spill slots of the current frame, negative
    /// indices address the caller's frame: stack parameters, then stack return values.
    StackSlot(i32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(reg) => write!(f, "{reg}"),
            Self::StackSlot(slot) => write!(f, "[sp:{slot}]"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AllocatedOperand {
    pub location: Location,
    pub rep: RegisterRepresentation,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Immediate {
    Int32(i32),
    Int64(i64),
    /// A branch target
    Block(RpoNumber),
    /// An index into a side table of the sequence, e.g. a deoptimization entry
    Index(u32),
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(value) => write!(f, "#{value}"),
            Self::Int64(value) => write!(f, "#{value}l"),
            Self::Block(block) => write!(f, "{block}"),
            Self::Index(index) => write!(f, "@{index}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum InstructionOperand {
    #[default]
    Invalid,
    Unallocated(UnallocatedOperand),
    /// The value of a constant virtual register, materialized where it is used
    Constant(VirtualRegister),
    Immediate(Immediate),
    Allocated(AllocatedOperand),
}

impl InstructionOperand {
    pub fn register(reg: Register, rep: RegisterRepresentation) -> Self {
        Self::Allocated(AllocatedOperand {
            location: Location::Register(reg),
            rep,
        })
    }

    pub fn stack_slot(slot: i32, rep: RegisterRepresentation) -> Self {
        Self::Allocated(AllocatedOperand {
            location: Location::StackSlot(slot),
            rep,
        })
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    #[inline]
    pub fn is_unallocated(&self) -> bool {
        matches!(self, Self::Unallocated(_))
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub fn as_unallocated(&self) -> Option<&UnallocatedOperand> {
        match self {
            Self::Unallocated(operand) => Some(operand),
            _ => None,
        }
    }

    /// The virtual register an unallocated or constant operand refers to
    pub fn vreg(&self) -> Option<VirtualRegister> {
        match self {
            Self::Unallocated(operand) => Some(operand.vreg),
            Self::Constant(vreg) => Some(*vreg),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Allocated(operand) => Some(operand.location),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<Register> {
        match self.location() {
            Some(Location::Register(reg)) => Some(reg),
            _ => None,
        }
    }

    pub fn as_stack_slot(&self) -> Option<i32> {
        match self.location() {
            Some(Location::StackSlot(slot)) => Some(slot),
            _ => None,
        }
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.as_register().is_some()
    }

    #[inline]
    pub fn is_stack_slot(&self) -> bool {
        self.as_stack_slot().is_some()
    }

    pub fn as_immediate(&self) -> Option<Immediate> {
        match self {
            Self::Immediate(imm) => Some(*imm),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<RpoNumber> {
        match self {
            Self::Immediate(Immediate::Block(block)) => Some(*block),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            Self::Immediate(Immediate::Index(index)) => Some(*index),
            _ => None,
        }
    }

    /// The representation of an allocated operand
    pub fn rep(&self) -> Option<RegisterRepresentation> {
        match self {
            Self::Allocated(operand) => Some(operand.rep),
            _ => None,
        }
    }

    /// True if both operands denote the same machine location, or the same constant or
    /// immediate, regardless of the representation the value is viewed with
    pub fn equals_canonicalized(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Allocated(a), Self::Allocated(b)) => a.location == b.location,
            _ => self == other,
        }
    }

    /// True if writing `other` may change the value of `self`
    pub fn interferes_with(&self, other: &Self) -> bool {
        match (self.location(), other.location()) {
            (Some(Location::StackSlot(a)), Some(Location::StackSlot(b))) => {
                let width = |op: &Self| match op.rep() {
                    Some(RegisterRepresentation::Simd128) => 2,
                    _ => 1,
                };
                a < b + width(other) && b < a + width(self)
            }
            (Some(a), Some(b)) => a == b,
            _ => self.equals_canonicalized(other),
        }
    }
}

impl fmt::Display for InstructionOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("(x)"),
            Self::Unallocated(operand) => {
                write!(f, "{}", operand.vreg)?;
                match operand.policy {
                    OperandPolicy::Any => f.write_str("(-)")?,
                    OperandPolicy::MustHaveRegister => f.write_str("(R)")?,
                    OperandPolicy::Fixed(location) => write!(f, "(={location})")?,
                    OperandPolicy::SameAsInput(input) => write!(f, "(={input})")?,
                }
                if operand.is_used_at_start() {
                    f.write_str("|s")?;
                }
                Ok(())
            }
            Self::Constant(vreg) => write!(f, "[const:{vreg}]"),
            Self::Immediate(imm) => write!(f, "{imm}"),
            Self::Allocated(operand) => write!(f, "{}|{}", operand.location, operand.rep),
        }
    }
}

/// A single move of a parallel move
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MoveOperands {
    pub source: InstructionOperand,
    pub destination: InstructionOperand,
}

impl MoveOperands {
    pub fn new(source: InstructionOperand, destination: InstructionOperand) -> Self {
        Self {
            source,
            destination,
        }
    }

    #[inline]
    pub fn is_eliminated(&self) -> bool {
        self.destination.is_invalid()
    }

    pub fn eliminate(&mut self) {
        self.source = InstructionOperand::Invalid;
        self.destination = InstructionOperand::Invalid;
    }

    /// A move that has no effect
    pub fn is_redundant(&self) -> bool {
        self.is_eliminated() || self.source.equals_canonicalized(&self.destination)
    }
}

impl fmt::Display for MoveOperands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.destination, self.source)
    }
}

/// A set of moves performed simultaneously: every source is read before any destination is written
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParallelMove {
    moves: SmallVec<[MoveOperands; 2]>,
}

impl ParallelMove {
    pub fn push(&mut self, source: InstructionOperand, destination: InstructionOperand) {
        self.moves.push(MoveOperands::new(source, destination));
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// True if no move of this parallel move has an effect
    pub fn is_empty(&self) -> bool {
        self.moves.iter().all(MoveOperands::is_redundant)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MoveOperands> {
        self.moves.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MoveOperands> {
        self.moves.iter_mut()
    }

    pub fn get_mut(&mut self, index: usize) -> &mut MoveOperands {
        &mut self.moves[index]
    }

    pub fn retain(&mut self, mut f: impl FnMut(&MoveOperands) -> bool) {
        self.moves.retain(|mv| f(mv));
    }

    pub fn clear(&mut self) {
        self.moves.clear();
    }

    /// Drop eliminated and redundant moves
    pub fn remove_redundant(&mut self) {
        self.moves.retain(|mv| !mv.is_redundant());
    }

    pub fn take(&mut self) -> SmallVec<[MoveOperands; 2]> {
        core::mem::take(&mut self.moves)
    }
}

impl fmt::Display for ParallelMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for mv in self.moves.iter().filter(|mv| !mv.is_redundant()) {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{mv}")?;
        }
        Ok(())
    }
}

/// What consumes the condition flags set by an instruction
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlagsMode {
    #[default]
    None,
    Branch,
    Set,
    Select,
    Deoptimize,
    Trap,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlagsCondition {
    #[default]
    Equal,
    NotEqual,
    SignedLessThan,
    SignedGreaterThanOrEqual,
    SignedLessThanOrEqual,
    SignedGreaterThan,
    UnsignedLessThan,
    UnsignedGreaterThanOrEqual,
    UnsignedLessThanOrEqual,
    UnsignedGreaterThan,
    /// Ordered float comparisons are false if either side is NaN
    FloatLessThan,
    /// Negation of [Self::FloatLessThan], true if either side is NaN
    FloatNotLessThan,
    FloatLessThanOrEqual,
    FloatNotLessThanOrEqual,
    FloatGreaterThan,
    FloatNotGreaterThan,
    FloatGreaterThanOrEqual,
    FloatNotGreaterThanOrEqual,
    FloatEqual,
    FloatNotEqual,
    Overflow,
    NotOverflow,
}

impl FlagsCondition {
    /// The condition that holds exactly when this one does not
    pub fn negate(self) -> Self {
        match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::SignedLessThan => Self::SignedGreaterThanOrEqual,
            Self::SignedGreaterThanOrEqual => Self::SignedLessThan,
            Self::SignedLessThanOrEqual => Self::SignedGreaterThan,
            Self::SignedGreaterThan => Self::SignedLessThanOrEqual,
            Self::UnsignedLessThan => Self::UnsignedGreaterThanOrEqual,
            Self::UnsignedGreaterThanOrEqual => Self::UnsignedLessThan,
            Self::UnsignedLessThanOrEqual => Self::UnsignedGreaterThan,
            Self::UnsignedGreaterThan => Self::UnsignedLessThanOrEqual,
            Self::FloatLessThan => Self::FloatNotLessThan,
            Self::FloatNotLessThan => Self::FloatLessThan,
            Self::FloatLessThanOrEqual => Self::FloatNotLessThanOrEqual,
            Self::FloatNotLessThanOrEqual => Self::FloatLessThanOrEqual,
            Self::FloatGreaterThan => Self::FloatNotGreaterThan,
            Self::FloatNotGreaterThan => Self::FloatGreaterThan,
            Self::FloatGreaterThanOrEqual => Self::FloatNotGreaterThanOrEqual,
            Self::FloatNotGreaterThanOrEqual => Self::FloatGreaterThanOrEqual,
            Self::FloatEqual => Self::FloatNotEqual,
            Self::FloatNotEqual => Self::FloatEqual,
            Self::Overflow => Self::NotOverflow,
            Self::NotOverflow => Self::Overflow,
        }
    }

    /// The condition to test when the operands of the comparison are swapped
    pub fn commute(self) -> Self {
        match self {
            Self::SignedLessThan => Self::SignedGreaterThan,
            Self::SignedGreaterThan => Self::SignedLessThan,
            Self::SignedLessThanOrEqual => Self::SignedGreaterThanOrEqual,
            Self::SignedGreaterThanOrEqual => Self::SignedLessThanOrEqual,
            Self::UnsignedLessThan => Self::UnsignedGreaterThan,
            Self::UnsignedGreaterThan => Self::UnsignedLessThan,
            Self::UnsignedLessThanOrEqual => Self::UnsignedGreaterThanOrEqual,
            Self::UnsignedGreaterThanOrEqual => Self::UnsignedLessThanOrEqual,
            Self::FloatLessThan => Self::FloatGreaterThan,
            Self::FloatGreaterThan => Self::FloatLessThan,
            Self::FloatNotLessThan => Self::FloatNotGreaterThan,
            Self::FloatNotGreaterThan => Self::FloatNotLessThan,
            Self::FloatLessThanOrEqual => Self::FloatGreaterThanOrEqual,
            Self::FloatGreaterThanOrEqual => Self::FloatLessThanOrEqual,
            Self::FloatNotLessThanOrEqual => Self::FloatNotGreaterThanOrEqual,
            Self::FloatNotGreaterThanOrEqual => Self::FloatNotLessThanOrEqual,
            Self::Equal
            | Self::NotEqual
            | Self::FloatEqual
            | Self::FloatNotEqual
            | Self::Overflow
            | Self::NotOverflow => self,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::FloatLessThan
                | Self::FloatNotLessThan
                | Self::FloatLessThanOrEqual
                | Self::FloatNotLessThanOrEqual
                | Self::FloatGreaterThan
                | Self::FloatNotGreaterThan
                | Self::FloatGreaterThanOrEqual
                | Self::FloatNotGreaterThanOrEqual
                | Self::FloatEqual
                | Self::FloatNotEqual
        )
    }

    /// Evaluate this condition on the result of comparing two integers of width `rep`
    pub fn evaluate_word(self, left: u64, right: u64, rep: WordRepresentation) -> bool {
        let (sl, sr) = (rep.sign_extend(left), rep.sign_extend(right));
        let (ul, ur) = (rep.truncate(left), rep.truncate(right));
        match self {
            Self::Equal => ul == ur,
            Self::NotEqual => ul != ur,
            Self::SignedLessThan => sl < sr,
            Self::SignedGreaterThanOrEqual => sl >= sr,
            Self::SignedLessThanOrEqual => sl <= sr,
            Self::SignedGreaterThan => sl > sr,
            Self::UnsignedLessThan => ul < ur,
            Self::UnsignedGreaterThanOrEqual => ul >= ur,
            Self::UnsignedLessThanOrEqual => ul <= ur,
            Self::UnsignedGreaterThan => ul > ur,
            other => panic!("{other:?} does not apply to an integer comparison"),
        }
    }

    /// Evaluate this condition on the result of comparing two floats
    pub fn evaluate_float(self, left: f64, right: f64) -> bool {
        match self {
            Self::FloatLessThan => left < right,
            Self::FloatNotLessThan => !(left < right),
            Self::FloatLessThanOrEqual => left <= right,
            Self::FloatNotLessThanOrEqual => !(left <= right),
            Self::FloatGreaterThan => left > right,
            Self::FloatNotGreaterThan => !(left > right),
            Self::FloatGreaterThanOrEqual => left >= right,
            Self::FloatNotGreaterThanOrEqual => !(left >= right),
            Self::FloatEqual => left == right,
            Self::FloatNotEqual => left != right,
            other => panic!("{other:?} does not apply to a float comparison"),
        }
    }
}

impl fmt::Display for FlagsCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::SignedLessThan => "lt",
            Self::SignedGreaterThanOrEqual => "ge",
            Self::SignedLessThanOrEqual => "le",
            Self::SignedGreaterThan => "gt",
            Self::UnsignedLessThan => "ult",
            Self::UnsignedGreaterThanOrEqual => "uge",
            Self::UnsignedLessThanOrEqual => "ule",
            Self::UnsignedGreaterThan => "ugt",
            Self::FloatLessThan => "flt",
            Self::FloatNotLessThan => "fnlt",
            Self::FloatLessThanOrEqual => "fle",
            Self::FloatNotLessThanOrEqual => "fnle",
            Self::FloatGreaterThan => "fgt",
            Self::FloatNotGreaterThan => "fngt",
            Self::FloatGreaterThanOrEqual => "fge",
            Self::FloatNotGreaterThanOrEqual => "fnge",
            Self::FloatEqual => "feq",
            Self::FloatNotEqual => "fne",
            Self::Overflow => "ovf",
            Self::NotOverflow => "nov",
        })
    }
}

/// How the memory operand of an instruction is formed from its inputs.
///
/// `R` is a base register, `n` a scaled index register (scale given as a shift), `I` an immediate
/// displacement; `Root` addresses relative to the root register with an immediate offset.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    #[default]
    None,
    MR,
    MRI,
    MRn(u8),
    MRnI(u8),
    MnI(u8),
    Root,
}

impl AddressingMode {
    /// Number of inputs making up the memory operand
    pub fn input_count(self) -> usize {
        match self {
            Self::None => 0,
            Self::MR | Self::Root => 1,
            Self::MRI | Self::MRn(_) | Self::MnI(_) => 2,
            Self::MRnI(_) => 3,
        }
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::MR => f.write_str("MR"),
            Self::MRI => f.write_str("MRI"),
            Self::MRn(scale) => write!(f, "MR{}", 1 << scale),
            Self::MRnI(scale) => write!(f, "MR{}I", 1 << scale),
            Self::MnI(scale) => write!(f, "M{}I", 1 << scale),
            Self::Root => f.write_str("Root"),
        }
    }
}

/// Opcodes of the reference target. `Arch*` opcodes are target independent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ArchOpcode {
    /// Does nothing; defines constants and parameters, and keeps retained values alive
    ArchNop,
    ArchJmp,
    ArchRet,
    /// `inputs: index, default, targets...`
    ArchTableSwitch,
    /// `inputs: value, default, (case value, target)...`
    ArchBinarySearchSwitch,
    /// Calls the target in the first input with the descriptor registered in the sequence
    ArchCall {
        descriptor: u32,
    },
    ArchDeoptimize,
    ArchUnreachable,
    /// Checks for interrupts, and may trigger a garbage collection
    ArchStackCheck,
    ArchStackCheckOffset,
    /// Compares the stack pointer against the limit in its input
    ArchStackPointerGreaterThan,
    /// Stores its input to an outgoing stack argument slot
    ArchPoke {
        slot: u16,
    },
    /// Loads a stack return value of the preceding call
    ArchPeek {
        slot: u16,
    },
    /// Saves the allocatable general registers, and the float and SIMD ones if `fp` is set, to
    /// the register save area. Always directly followed by the call it brackets.
    ArchSaveCallerRegisters {
        fp: bool,
    },
    /// Reloads the registers saved by the matching save, except the return registers
    ArchRestoreCallerRegisters {
        fp: bool,
    },
    RtAdd(WordRepresentation),
    RtSub(WordRepresentation),
    RtMul(WordRepresentation),
    RtAnd(WordRepresentation),
    RtOr(WordRepresentation),
    RtXor(WordRepresentation),
    RtIdiv(WordRepresentation),
    RtUdiv(WordRepresentation),
    RtImod(WordRepresentation),
    RtUmod(WordRepresentation),
    RtShl(WordRepresentation),
    RtSar(WordRepresentation),
    RtShr(WordRepresentation),
    RtRor(WordRepresentation),
    RtCmp(WordRepresentation),
    RtTest(WordRepresentation),
    RtLea(WordRepresentation),
    /// Zero-extends the low 32 bits
    RtMovl,
    /// Sign-extends the low 32 bits
    RtMovsxlq,
    RtLoad(MemoryRepresentation),
    /// Loads a compressed tagged value and decompresses it relative to the cage base
    RtLoadDecompressTagged,
    RtStore(MemoryRepresentation),
    RtStoreWithWriteBarrier(MemoryRepresentation),
    RtFloatBinop(FloatBinopKind, FloatRepresentation),
    RtFloatUnary(FloatUnaryKind, FloatRepresentation),
    RtFloatCmp(FloatRepresentation),
    RtIntToFloat {
        signed: bool,
        from: WordRepresentation,
        to: FloatRepresentation,
    },
    RtFloatToInt {
        from: FloatRepresentation,
        to: WordRepresentation,
    },
    RtFloatConvert(FloatRepresentation),
    /// Reinterprets the bits of a word as a float or the reverse
    RtBitcast(RegisterRepresentation),
    RtSimd128Binop(Simd128BinopKind),
}

impl ArchOpcode {
    #[inline]
    pub fn is_call(&self) -> bool {
        matches!(self, Self::ArchCall { .. })
    }

    /// True for opcodes that must not be reordered with other side effects
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Self::ArchCall { .. }
                | Self::ArchStackCheck
                | Self::ArchPoke { .. }
                | Self::ArchPeek { .. }
                | Self::RtStore(_)
                | Self::RtStoreWithWriteBarrier(_)
        )
    }

    /// True for the instructions bracketing a call that must preserve the caller's registers
    pub fn is_caller_saved_bracket(&self) -> bool {
        matches!(
            self,
            Self::ArchSaveCallerRegisters { .. } | Self::ArchRestoreCallerRegisters { .. }
        )
    }

    pub fn is_load(&self) -> bool {
        matches!(
            self,
            Self::RtLoad(_) | Self::RtLoadDecompressTagged | Self::ArchStackPointerGreaterThan
        )
    }

    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self,
            Self::ArchJmp
                | Self::ArchRet
                | Self::ArchTableSwitch
                | Self::ArchBinarySearchSwitch
                | Self::ArchDeoptimize
                | Self::ArchUnreachable
        )
    }

    /// Estimated number of cycles until the result is available
    pub fn latency(&self) -> u32 {
        match self {
            Self::RtMul(_) => 3,
            Self::RtIdiv(_) | Self::RtUdiv(_) | Self::RtImod(_) | Self::RtUmod(_) => 20,
            Self::RtLoad(_) | Self::RtLoadDecompressTagged | Self::ArchPeek { .. } => 4,
            Self::RtFloatBinop(FloatBinopKind::Div, _) => 14,
            Self::RtFloatUnary(FloatUnaryKind::Sqrt, _) => 14,
            Self::RtFloatBinop(..)
            | Self::RtFloatCmp(_)
            | Self::RtIntToFloat { .. }
            | Self::RtFloatToInt { .. }
            | Self::RtFloatConvert(_)
            | Self::RtSimd128Binop(_) => 3,
            Self::ArchCall { .. } => 10,
            _ => 1,
        }
    }

    /// The numeric encoding of this opcode, without its immediate payload
    pub fn encoding(&self) -> u8 {
        match self {
            Self::ArchNop => 0x00,
            Self::ArchJmp => 0x01,
            Self::ArchRet => 0x02,
            Self::ArchTableSwitch => 0x03,
            Self::ArchBinarySearchSwitch => 0x04,
            Self::ArchCall { .. } => 0x05,
            Self::ArchDeoptimize => 0x06,
            Self::ArchUnreachable => 0x07,
            Self::ArchStackCheck => 0x08,
            Self::ArchStackCheckOffset => 0x09,
            Self::ArchStackPointerGreaterThan => 0x0a,
            Self::ArchPoke { .. } => 0x0b,
            Self::ArchPeek { .. } => 0x0c,
            Self::ArchSaveCallerRegisters { .. } => 0x0d,
            Self::ArchRestoreCallerRegisters { .. } => 0x0e,
            Self::RtAdd(_) => 0x10,
            Self::RtSub(_) => 0x11,
            Self::RtMul(_) => 0x12,
            Self::RtAnd(_) => 0x13,
            Self::RtOr(_) => 0x14,
            Self::RtXor(_) => 0x15,
            Self::RtIdiv(_) => 0x16,
            Self::RtUdiv(_) => 0x17,
            Self::RtImod(_) => 0x18,
            Self::RtUmod(_) => 0x19,
            Self::RtShl(_) => 0x1a,
            Self::RtSar(_) => 0x1b,
            Self::RtShr(_) => 0x1c,
            Self::RtRor(_) => 0x1d,
            Self::RtCmp(_) => 0x1e,
            Self::RtTest(_) => 0x1f,
            Self::RtLea(_) => 0x20,
            Self::RtMovl => 0x21,
            Self::RtMovsxlq => 0x22,
            Self::RtLoad(_) => 0x30,
            Self::RtLoadDecompressTagged => 0x31,
            Self::RtStore(_) => 0x32,
            Self::RtStoreWithWriteBarrier(_) => 0x33,
            Self::RtFloatBinop(..) => 0x40,
            Self::RtFloatUnary(..) => 0x41,
            Self::RtFloatCmp(_) => 0x42,
            Self::RtIntToFloat { .. } => 0x43,
            Self::RtFloatToInt { .. } => 0x44,
            Self::RtFloatConvert(_) => 0x45,
            Self::RtBitcast(_) => 0x46,
            Self::RtSimd128Binop(_) => 0x50,
        }
    }
}

impl fmt::Display for ArchOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArchNop => f.write_str("ArchNop"),
            Self::ArchJmp => f.write_str("ArchJmp"),
            Self::ArchRet => f.write_str("ArchRet"),
            Self::ArchTableSwitch => f.write_str("ArchTableSwitch"),
            Self::ArchBinarySearchSwitch => f.write_str("ArchBinarySearchSwitch"),
            Self::ArchCall { descriptor } => write!(f, "ArchCall#{descriptor}"),
            Self::ArchDeoptimize => f.write_str("ArchDeoptimize"),
            Self::ArchUnreachable => f.write_str("ArchUnreachable"),
            Self::ArchStackCheck => f.write_str("ArchStackCheck"),
            Self::ArchStackCheckOffset => f.write_str("ArchStackCheckOffset"),
            Self::ArchStackPointerGreaterThan => f.write_str("ArchStackPointerGreaterThan"),
            Self::ArchPoke { slot } => write!(f, "ArchPoke[{slot}]"),
            Self::ArchPeek { slot } => write!(f, "ArchPeek[{slot}]"),
            Self::ArchSaveCallerRegisters { fp } => {
                write!(f, "ArchSaveCallerRegisters{}", if *fp { ".fp" } else { "" })
            }
            Self::ArchRestoreCallerRegisters { fp } => {
                write!(f, "ArchRestoreCallerRegisters{}", if *fp { ".fp" } else { "" })
            }
            Self::RtAdd(rep) => write!(f, "RtAdd.{rep}"),
            Self::RtSub(rep) => write!(f, "RtSub.{rep}"),
            Self::RtMul(rep) => write!(f, "RtMul.{rep}"),
            Self::RtAnd(rep) => write!(f, "RtAnd.{rep}"),
            Self::RtOr(rep) => write!(f, "RtOr.{rep}"),
            Self::RtXor(rep) => write!(f, "RtXor.{rep}"),
            Self::RtIdiv(rep) => write!(f, "RtIdiv.{rep}"),
            Self::RtUdiv(rep) => write!(f, "RtUdiv.{rep}"),
            Self::RtImod(rep) => write!(f, "RtImod.{rep}"),
            Self::RtUmod(rep) => write!(f, "RtUmod.{rep}"),
            Self::RtShl(rep) => write!(f, "RtShl.{rep}"),
            Self::RtSar(rep) => write!(f, "RtSar.{rep}"),
            Self::RtShr(rep) => write!(f, "RtShr.{rep}"),
            Self::RtRor(rep) => write!(f, "RtRor.{rep}"),
            Self::RtCmp(rep) => write!(f, "RtCmp.{rep}"),
            Self::RtTest(rep) => write!(f, "RtTest.{rep}"),
            Self::RtLea(rep) => write!(f, "RtLea.{rep}"),
            Self::RtMovl => f.write_str("RtMovl"),
            Self::RtMovsxlq => f.write_str("RtMovsxlq"),
            Self::RtLoad(rep) => write!(f, "RtLoad.{rep}"),
            Self::RtLoadDecompressTagged => f.write_str("RtLoadDecompressTagged"),
            Self::RtStore(rep) => write!(f, "RtStore.{rep}"),
            Self::RtStoreWithWriteBarrier(rep) => write!(f, "RtStoreWithWriteBarrier.{rep}"),
            Self::RtFloatBinop(kind, rep) => write!(f, "RtFloat{kind:?}.{rep}"),
            Self::RtFloatUnary(kind, rep) => write!(f, "RtFloat{kind:?}.{rep}"),
            Self::RtFloatCmp(rep) => write!(f, "RtFloatCmp.{rep}"),
            Self::RtIntToFloat { signed, from, to } => {
                write!(f, "RtIntToFloat.{}{from}.{to}", if *signed { "s" } else { "u" })
            }
            Self::RtFloatToInt { from, to } => write!(f, "RtFloatToInt.{from}.{to}"),
            Self::RtFloatConvert(to) => write!(f, "RtFloatConvert.{to}"),
            Self::RtBitcast(to) => write!(f, "RtBitcast.{to}"),
            Self::RtSimd128Binop(kind) => write!(f, "Rt{kind:?}"),
        }
    }
}

/// An opcode together with the addressing mode of its memory operand and the consumer of the
/// condition flags it sets
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InstructionCode {
    pub opcode: ArchOpcode,
    pub addressing_mode: AddressingMode,
    pub flags_mode: FlagsMode,
    pub flags_condition: FlagsCondition,
}

impl InstructionCode {
    pub const fn new(opcode: ArchOpcode) -> Self {
        Self {
            opcode,
            addressing_mode: AddressingMode::None,
            flags_mode: FlagsMode::None,
            flags_condition: FlagsCondition::Equal,
        }
    }

    pub const fn with_mode(mut self, mode: AddressingMode) -> Self {
        self.addressing_mode = mode;
        self
    }

    pub const fn with_flags(mut self, mode: FlagsMode, condition: FlagsCondition) -> Self {
        self.flags_mode = mode;
        self.flags_condition = condition;
        self
    }
}

impl From<ArchOpcode> for InstructionCode {
    fn from(opcode: ArchOpcode) -> Self {
        Self::new(opcode)
    }
}

impl fmt::Display for InstructionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if self.addressing_mode != AddressingMode::None {
            write!(f, " : {}", self.addressing_mode)?;
        }
        if self.flags_mode != FlagsMode::None {
            write!(f, " && {:?} if {}", self.flags_mode, self.flags_condition)?;
        }
        Ok(())
    }
}

/// The locations holding tagged values at a point where a garbage collection may happen
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReferenceMap {
    pub slots: SmallVec<[i32; 4]>,
    /// Tagged values kept in registers; only recorded if the instruction preserves registers
    pub registers: SmallVec<[Register; 2]>,
    pub records_registers: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum GapPosition {
    Start = 0,
    End = 1,
}

/// A target instruction with its operands and the parallel moves performed before it
#[derive(Debug, Clone)]
pub struct Instruction {
    pub code: InstructionCode,
    pub outputs: SmallVec<[InstructionOperand; 2]>,
    pub inputs: SmallVec<[InstructionOperand; 4]>,
    pub temps: SmallVec<[InstructionOperand; 2]>,
    /// Index of the first input belonging to the flags continuation
    pub flags_inputs_start: usize,
    gaps: [ParallelMove; 2],
    pub reference_map: Option<ReferenceMap>,
    pub source_position: SourcePosition,
    pub block: RpoNumber,
}

impl Instruction {
    pub const MAX_OUTPUT_COUNT: usize = 255;
    pub const MAX_INPUT_COUNT: usize = 65535;
    pub const MAX_TEMP_COUNT: usize = 63;

    pub fn new(
        code: impl Into<InstructionCode>,
        outputs: impl IntoIterator<Item = InstructionOperand>,
        inputs: impl IntoIterator<Item = InstructionOperand>,
        temps: impl IntoIterator<Item = InstructionOperand>,
    ) -> Self {
        let inputs: SmallVec<[InstructionOperand; 4]> = inputs.into_iter().collect();
        Self {
            code: code.into(),
            outputs: outputs.into_iter().collect(),
            flags_inputs_start: inputs.len(),
            inputs,
            temps: temps.into_iter().collect(),
            gaps: Default::default(),
            reference_map: None,
            source_position: SourcePosition::UNKNOWN,
            block: RpoNumber::from_u32(0),
        }
    }

    #[inline]
    pub fn opcode(&self) -> ArchOpcode {
        self.code.opcode
    }

    #[inline]
    pub fn flags_mode(&self) -> FlagsMode {
        self.code.flags_mode
    }

    #[inline]
    pub fn flags_condition(&self) -> FlagsCondition {
        self.code.flags_condition
    }

    #[inline]
    pub fn addressing_mode(&self) -> AddressingMode {
        self.code.addressing_mode
    }

    #[inline]
    pub fn is_call(&self) -> bool {
        self.code.opcode.is_call()
    }

    #[inline]
    pub fn is_jump(&self) -> bool {
        self.code.opcode == ArchOpcode::ArchJmp
    }

    #[inline]
    pub fn is_nop(&self) -> bool {
        self.code.opcode == ArchOpcode::ArchNop
            && self.outputs.is_empty()
            && self.inputs.is_empty()
            && self.temps.is_empty()
    }

    /// The inputs belonging to the operation itself, without the flags continuation
    pub fn own_inputs(&self) -> &[InstructionOperand] {
        &self.inputs[..self.flags_inputs_start]
    }

    /// The inputs appended by the flags continuation
    pub fn flags_inputs(&self) -> &[InstructionOperand] {
        &self.inputs[self.flags_inputs_start..]
    }

    #[inline]
    pub fn gap(&self, position: GapPosition) -> &ParallelMove {
        &self.gaps[position as usize]
    }

    #[inline]
    pub fn gap_mut(&mut self, position: GapPosition) -> &mut ParallelMove {
        &mut self.gaps[position as usize]
    }

    pub fn gaps_mut(&mut self) -> &mut [ParallelMove; 2] {
        &mut self.gaps
    }

    /// True if no gap of this instruction has an effective move
    pub fn are_moves_redundant(&self) -> bool {
        self.gaps.iter().all(ParallelMove::is_empty)
    }

    /// All operands of this instruction, for rewriting in place
    pub fn operands_mut(&mut self) -> impl Iterator<Item = &mut InstructionOperand> {
        self.outputs
            .iter_mut()
            .chain(self.inputs.iter_mut())
            .chain(self.temps.iter_mut())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, gap) in [GapPosition::Start, GapPosition::End].into_iter().zip(&self.gaps) {
            if !gap.is_empty() {
                write!(f, "gap{}({gap}) ", position as u8)?;
            }
        }
        if !self.outputs.is_empty() {
            for (i, output) in self.outputs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{output}")?;
            }
            f.write_str(" = ")?;
        }
        write!(f, "{}", self.code)?;
        for input in self.inputs.iter() {
            write!(f, " {input}")?;
        }
        if !self.temps.is_empty() {
            f.write_str(" temps:")?;
            for temp in self.temps.iter() {
                write!(f, " {temp}")?;
            }
        }
        Ok(())
    }
}
