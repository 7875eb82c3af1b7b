use std::sync::Arc;

use smallvec::{SmallVec, smallvec};

use crate::{
    BlockIndex, CallDescriptor, FloatRepresentation, FrameStateInfo, MemoryRepresentation, OpIndex,
    RegisterRepresentation, WordRepresentation,
};

/// The effects of an operation, which determine whether it may be removed, duplicated or reordered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpProperties {
    pub can_read: bool,
    pub can_write: bool,
    pub non_memory_side_effects: bool,
    pub is_block_terminator: bool,
}

impl OpProperties {
    pub const PURE: Self = Self::new(false, false, false, false);
    pub const READING: Self = Self::new(true, false, false, false);
    pub const WRITING: Self = Self::new(false, true, false, false);
    pub const CAN_DEOPTIMIZE: Self = Self::new(true, false, true, false);
    pub const ANY_SIDE_EFFECTS: Self = Self::new(true, true, true, false);
    pub const BLOCK_TERMINATOR: Self = Self::new(false, false, false, true);
    pub const BLOCK_TERMINATOR_WITH_ANY_SIDE_EFFECT: Self = Self::new(true, true, true, true);

    const fn new(
        can_read: bool,
        can_write: bool,
        non_memory_side_effects: bool,
        is_block_terminator: bool,
    ) -> Self {
        Self {
            can_read,
            can_write,
            non_memory_side_effects,
            is_block_terminator,
        }
    }

    /// A pure operation can be freely reordered, duplicated or removed if unused
    #[inline]
    pub const fn is_pure(&self) -> bool {
        !(self.can_read || self.can_write || self.non_memory_side_effects || self.is_block_terminator)
    }

    /// Operations that must be kept even if nothing uses their result
    #[inline]
    pub const fn is_required_when_unused(&self) -> bool {
        self.can_write || self.non_memory_side_effects || self.is_block_terminator
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ConstantKind {
    Word32(u32),
    Word64(u64),
    Float32(f32),
    Float64(f64),
    /// The address of an external (off-heap) reference
    External(u64),
    /// A full-width pointer to a heap object
    HeapObject(u64),
    /// A compressed pointer to a heap object
    CompressedHeapObject(u64),
}

impl ConstantKind {
    pub fn rep(&self) -> RegisterRepresentation {
        match self {
            Self::Word32(_) => RegisterRepresentation::Word32,
            Self::Word64(_) | Self::External(_) => RegisterRepresentation::Word64,
            Self::Float32(_) => RegisterRepresentation::Float32,
            Self::Float64(_) => RegisterRepresentation::Float64,
            Self::HeapObject(_) => RegisterRepresentation::Tagged,
            Self::CompressedHeapObject(_) => RegisterRepresentation::Compressed,
        }
    }

    /// The integral value of a word constant
    pub fn integral(&self) -> Option<u64> {
        match *self {
            Self::Word32(value) => Some(value as u64),
            Self::Word64(value) => Some(value),
            _ => None,
        }
    }

    /// The integral value of a word constant, sign-extended from its width
    pub fn signed_integral(&self) -> Option<i64> {
        match *self {
            Self::Word32(value) => Some(value as i32 as i64),
            Self::Word64(value) => Some(value as i64),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WordBinopKind {
    Add,
    Mul,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Sub,
    SignedDiv,
    UnsignedDiv,
    SignedMod,
    UnsignedMod,
}

impl WordBinopKind {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::BitwiseAnd | Self::BitwiseOr | Self::BitwiseXor
        )
    }

    /// Evaluate this operation on constants, wrapping at the width of `rep`.
    ///
    /// Returns `None` for division or modulus by zero.
    pub fn fold(self, left: u64, right: u64, rep: WordRepresentation) -> Option<u64> {
        let value = match self {
            Self::Add => left.wrapping_add(right),
            Self::Mul => left.wrapping_mul(right),
            Self::BitwiseAnd => left & right,
            Self::BitwiseOr => left | right,
            Self::BitwiseXor => left ^ right,
            Self::Sub => left.wrapping_sub(right),
            Self::SignedDiv | Self::SignedMod => {
                let l = rep.sign_extend(left);
                let r = rep.sign_extend(right);
                if r == 0 {
                    return None;
                }
                let value = if self == Self::SignedDiv {
                    match rep {
                        WordRepresentation::Word32 => (l as i32).wrapping_div(r as i32) as i64,
                        WordRepresentation::Word64 => l.wrapping_div(r),
                    }
                } else {
                    match rep {
                        WordRepresentation::Word32 => (l as i32).wrapping_rem(r as i32) as i64,
                        WordRepresentation::Word64 => l.wrapping_rem(r),
                    }
                };
                value as u64
            }
            Self::UnsignedDiv | Self::UnsignedMod => {
                let l = rep.truncate(left);
                let r = rep.truncate(right);
                if r == 0 {
                    return None;
                }
                if self == Self::UnsignedDiv { l / r } else { l % r }
            }
        };
        Some(rep.truncate(value))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OverflowCheckedBinopKind {
    SignedAdd,
    SignedMul,
    SignedSub,
}

impl OverflowCheckedBinopKind {
    /// Evaluate on constants, returning the wrapped result and whether it overflowed
    pub fn fold(self, left: u64, right: u64, rep: WordRepresentation) -> (u64, bool) {
        match rep {
            WordRepresentation::Word32 => {
                let (l, r) = (left as u32 as i32, right as u32 as i32);
                let (value, overflow) = match self {
                    Self::SignedAdd => l.overflowing_add(r),
                    Self::SignedMul => l.overflowing_mul(r),
                    Self::SignedSub => l.overflowing_sub(r),
                };
                (value as u32 as u64, overflow)
            }
            WordRepresentation::Word64 => {
                let (l, r) = (left as i64, right as i64);
                let (value, overflow) = match self {
                    Self::SignedAdd => l.overflowing_add(r),
                    Self::SignedMul => l.overflowing_mul(r),
                    Self::SignedSub => l.overflowing_sub(r),
                };
                (value as u64, overflow)
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FloatBinopKind {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FloatUnaryKind {
    Abs,
    Negate,
    Sqrt,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShiftKind {
    ShiftLeft,
    ShiftRightArithmetic,
    ShiftRightLogical,
    RotateRight,
}

impl ShiftKind {
    /// Evaluate on constants; the shift amount is taken modulo the width of `rep`
    pub fn fold(self, left: u64, right: u64, rep: WordRepresentation) -> u64 {
        let bits = rep.bit_width();
        let amount = (right % bits as u64) as u32;
        let value = match self {
            Self::ShiftLeft => left << amount,
            Self::ShiftRightArithmetic => (rep.sign_extend(left) >> amount) as u64,
            Self::ShiftRightLogical => rep.truncate(left) >> amount,
            Self::RotateRight => match rep {
                WordRepresentation::Word32 => (left as u32).rotate_right(amount) as u64,
                WordRepresentation::Word64 => left.rotate_right(amount),
            },
        };
        rep.truncate(value)
    }
}

/// Ordered comparisons. For float representations, the signed kinds denote the ordinary ordered
/// comparison and the unsigned kinds are invalid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComparisonKind {
    SignedLessThan,
    SignedLessThanOrEqual,
    UnsignedLessThan,
    UnsignedLessThanOrEqual,
}

impl ComparisonKind {
    pub fn is_signed(self) -> bool {
        matches!(self, Self::SignedLessThan | Self::SignedLessThanOrEqual)
    }

    pub fn fold(self, left: u64, right: u64, rep: WordRepresentation) -> bool {
        match self {
            Self::SignedLessThan => rep.sign_extend(left) < rep.sign_extend(right),
            Self::SignedLessThanOrEqual => rep.sign_extend(left) <= rep.sign_extend(right),
            Self::UnsignedLessThan => rep.truncate(left) < rep.truncate(right),
            Self::UnsignedLessThanOrEqual => rep.truncate(left) <= rep.truncate(right),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Zero-extend a word32 to a word64
    ZeroExtend,
    /// Sign-extend a word32 to a word64
    SignExtend,
    /// Keep the low 32 bits of a word64
    Truncate,
    /// Convert a signed integer to a float
    SignedToFloat,
    /// Convert an unsigned integer to a float
    UnsignedToFloat,
    /// Convert a float to a signed integer, rounding towards zero
    FloatToSigned,
    /// Convert between float32 and float64
    FloatConversion,
    /// Reinterpret the bits between a word and a float of the same width
    Bitcast,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SelectImplementation {
    /// Must be lowered to a branch diamond before instruction selection
    Branch,
    /// Selected directly into a conditional move
    CMove,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WriteBarrierKind {
    None,
    Full,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BranchHint {
    #[default]
    None,
    True,
    False,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StackCheckKind {
    FunctionEntry,
    LoopIteration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeoptimizeReason {
    Unknown,
    Overflow,
    DivisionByZero,
    LostPrecision,
    WrongMap,
    OutOfBounds,
    NotASmi,
    Smi,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TrapId {
    Unreachable,
    MemoryOutOfBounds,
    DivisionByZero,
    DivisionUnrepresentable,
    RemainderByZero,
    FloatUnrepresentable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Simd128BinopKind {
    I32x4Add,
    I32x4Sub,
    I32x4Mul,
    F32x4Add,
    F64x2Add,
    F64x2Mul,
    S128And,
    S128Or,
    S128Xor,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SwitchCase {
    pub value: i32,
    pub destination: BlockIndex,
    pub hint: BranchHint,
}

/// An operation of the graph.
///
/// Inputs are referenced by [OpIndex]; control-flow successors by [BlockIndex].
#[derive(Debug, Clone)]
pub enum Operation {
    Constant {
        kind: ConstantKind,
    },
    Parameter {
        index: u32,
        rep: RegisterRepresentation,
    },
    WordBinop {
        left: OpIndex,
        right: OpIndex,
        kind: WordBinopKind,
        rep: WordRepresentation,
    },
    /// Produces the wrapped result and, as a second output, a word32 overflow bit
    OverflowCheckedBinop {
        left: OpIndex,
        right: OpIndex,
        kind: OverflowCheckedBinopKind,
        rep: WordRepresentation,
    },
    Projection {
        input: OpIndex,
        index: u16,
        rep: RegisterRepresentation,
    },
    FloatBinop {
        left: OpIndex,
        right: OpIndex,
        kind: FloatBinopKind,
        rep: FloatRepresentation,
    },
    FloatUnary {
        input: OpIndex,
        kind: FloatUnaryKind,
        rep: FloatRepresentation,
    },
    Shift {
        left: OpIndex,
        right: OpIndex,
        kind: ShiftKind,
        rep: WordRepresentation,
    },
    Equal {
        left: OpIndex,
        right: OpIndex,
        rep: RegisterRepresentation,
    },
    Comparison {
        left: OpIndex,
        right: OpIndex,
        kind: ComparisonKind,
        rep: RegisterRepresentation,
    },
    Change {
        input: OpIndex,
        kind: ChangeKind,
        from: RegisterRepresentation,
        to: RegisterRepresentation,
    },
    TaggedBitcast {
        input: OpIndex,
        from: RegisterRepresentation,
        to: RegisterRepresentation,
    },
    Select {
        cond: OpIndex,
        vtrue: OpIndex,
        vfalse: OpIndex,
        rep: RegisterRepresentation,
        implem: SelectImplementation,
    },
    /// Reads `base + index << element_size_log2 + offset`
    Load {
        base: OpIndex,
        index: Option<OpIndex>,
        loaded_rep: MemoryRepresentation,
        result_rep: RegisterRepresentation,
        offset: i32,
        element_size_log2: u8,
    },
    Store {
        base: OpIndex,
        index: Option<OpIndex>,
        value: OpIndex,
        stored_rep: MemoryRepresentation,
        write_barrier: WriteBarrierKind,
        offset: i32,
        element_size_log2: u8,
    },
    Phi {
        inputs: SmallVec<[OpIndex; 2]>,
        rep: RegisterRepresentation,
    },
    /// A loop phi whose backedge input is not yet known. Only exists while a graph is being built.
    PendingLoopPhi {
        first: OpIndex,
        rep: RegisterRepresentation,
    },
    FrameState {
        inputs: SmallVec<[OpIndex; 4]>,
        info: Arc<FrameStateInfo>,
    },
    Call {
        callee: OpIndex,
        frame_state: Option<OpIndex>,
        arguments: SmallVec<[OpIndex; 4]>,
        descriptor: Arc<CallDescriptor>,
    },
    StackCheck {
        kind: StackCheckKind,
    },
    StackPointerGreaterThan {
        limit: OpIndex,
        kind: StackCheckKind,
    },
    LoadStackCheckOffset,
    Simd128Constant {
        value: [u8; 16],
    },
    Simd128Binop {
        left: OpIndex,
        right: OpIndex,
        kind: Simd128BinopKind,
    },
    /// Keeps `value` alive up to this point
    Retain {
        value: OpIndex,
    },
    DeoptimizeIf {
        condition: OpIndex,
        frame_state: OpIndex,
        negated: bool,
        reason: DeoptimizeReason,
    },
    TrapIf {
        condition: OpIndex,
        negated: bool,
        trap: TrapId,
    },
    Goto {
        destination: BlockIndex,
        is_backedge: bool,
    },
    Branch {
        condition: OpIndex,
        if_true: BlockIndex,
        if_false: BlockIndex,
        hint: BranchHint,
    },
    Switch {
        input: OpIndex,
        cases: Box<[SwitchCase]>,
        default: BlockIndex,
        default_hint: BranchHint,
    },
    Return {
        pop_count: OpIndex,
        values: SmallVec<[OpIndex; 2]>,
    },
    Deoptimize {
        frame_state: OpIndex,
        reason: DeoptimizeReason,
    },
    Unreachable,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Constant { .. } => "Constant",
            Self::Parameter { .. } => "Parameter",
            Self::WordBinop { .. } => "WordBinop",
            Self::OverflowCheckedBinop { .. } => "OverflowCheckedBinop",
            Self::Projection { .. } => "Projection",
            Self::FloatBinop { .. } => "FloatBinop",
            Self::FloatUnary { .. } => "FloatUnary",
            Self::Shift { .. } => "Shift",
            Self::Equal { .. } => "Equal",
            Self::Comparison { .. } => "Comparison",
            Self::Change { .. } => "Change",
            Self::TaggedBitcast { .. } => "TaggedBitcast",
            Self::Select { .. } => "Select",
            Self::Load { .. } => "Load",
            Self::Store { .. } => "Store",
            Self::Phi { .. } => "Phi",
            Self::PendingLoopPhi { .. } => "PendingLoopPhi",
            Self::FrameState { .. } => "FrameState",
            Self::Call { .. } => "Call",
            Self::StackCheck { .. } => "StackCheck",
            Self::StackPointerGreaterThan { .. } => "StackPointerGreaterThan",
            Self::LoadStackCheckOffset => "LoadStackCheckOffset",
            Self::Simd128Constant { .. } => "Simd128Constant",
            Self::Simd128Binop { .. } => "Simd128Binop",
            Self::Retain { .. } => "Retain",
            Self::DeoptimizeIf { .. } => "DeoptimizeIf",
            Self::TrapIf { .. } => "TrapIf",
            Self::Goto { .. } => "Goto",
            Self::Branch { .. } => "Branch",
            Self::Switch { .. } => "Switch",
            Self::Return { .. } => "Return",
            Self::Deoptimize { .. } => "Deoptimize",
            Self::Unreachable => "Unreachable",
        }
    }

    pub fn properties(&self) -> OpProperties {
        match self {
            Self::Constant { .. }
            | Self::Parameter { .. }
            | Self::WordBinop { .. }
            | Self::OverflowCheckedBinop { .. }
            | Self::Projection { .. }
            | Self::FloatBinop { .. }
            | Self::FloatUnary { .. }
            | Self::Shift { .. }
            | Self::Equal { .. }
            | Self::Comparison { .. }
            | Self::Change { .. }
            | Self::TaggedBitcast { .. }
            | Self::Select { .. }
            | Self::Phi { .. }
            | Self::PendingLoopPhi { .. }
            | Self::FrameState { .. }
            | Self::LoadStackCheckOffset
            | Self::Simd128Constant { .. }
            | Self::Simd128Binop { .. } => OpProperties::PURE,
            Self::Load { .. } | Self::StackPointerGreaterThan { .. } => OpProperties::READING,
            Self::Store { .. } => OpProperties::WRITING,
            Self::Call { .. } | Self::StackCheck { .. } => OpProperties::ANY_SIDE_EFFECTS,
            Self::Retain { .. } | Self::DeoptimizeIf { .. } | Self::TrapIf { .. } => {
                OpProperties::CAN_DEOPTIMIZE
            }
            Self::Goto { .. } | Self::Branch { .. } | Self::Switch { .. } | Self::Unreachable => {
                OpProperties::BLOCK_TERMINATOR
            }
            Self::Return { .. } | Self::Deoptimize { .. } => {
                OpProperties::BLOCK_TERMINATOR_WITH_ANY_SIDE_EFFECT
            }
        }
    }

    #[inline]
    pub fn is_block_terminator(&self) -> bool {
        self.properties().is_block_terminator
    }

    #[inline]
    pub fn is_pure(&self) -> bool {
        self.properties().is_pure()
    }

    #[inline]
    pub fn is_required_when_unused(&self) -> bool {
        self.properties().is_required_when_unused()
    }

    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. } | Self::PendingLoopPhi { .. })
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant { .. })
    }

    /// The representations of the values this operation produces
    pub fn outputs_rep(&self) -> SmallVec<[RegisterRepresentation; 2]> {
        use RegisterRepresentation as R;
        match self {
            Self::Constant { kind } => smallvec![kind.rep()],
            Self::Parameter { rep, .. }
            | Self::Projection { rep, .. }
            | Self::Select { rep, .. }
            | Self::Phi { rep, .. }
            | Self::PendingLoopPhi { rep, .. } => smallvec![*rep],
            Self::WordBinop { rep, .. } | Self::Shift { rep, .. } => smallvec![R::from(*rep)],
            Self::OverflowCheckedBinop { rep, .. } => smallvec![R::from(*rep), R::Word32],
            Self::FloatBinop { rep, .. } | Self::FloatUnary { rep, .. } => smallvec![R::from(*rep)],
            Self::Equal { .. } | Self::Comparison { .. } | Self::StackPointerGreaterThan { .. } => {
                smallvec![R::Word32]
            }
            Self::Change { to, .. } | Self::TaggedBitcast { to, .. } => smallvec![*to],
            Self::Load { result_rep, .. } => smallvec![*result_rep],
            Self::Call { descriptor, .. } => descriptor.returns.iter().copied().collect(),
            Self::LoadStackCheckOffset => smallvec![R::POINTER],
            Self::Simd128Constant { .. } | Self::Simd128Binop { .. } => smallvec![R::Simd128],
            Self::Store { .. }
            | Self::FrameState { .. }
            | Self::StackCheck { .. }
            | Self::Retain { .. }
            | Self::DeoptimizeIf { .. }
            | Self::TrapIf { .. }
            | Self::Goto { .. }
            | Self::Branch { .. }
            | Self::Switch { .. }
            | Self::Return { .. }
            | Self::Deoptimize { .. }
            | Self::Unreachable => smallvec![],
        }
    }

    /// The representation of the single (or first) output of this operation
    pub fn output_rep(&self) -> Option<RegisterRepresentation> {
        self.outputs_rep().first().copied()
    }

    pub fn inputs(&self) -> SmallVec<[OpIndex; 4]> {
        match self {
            Self::Constant { .. }
            | Self::Parameter { .. }
            | Self::StackCheck { .. }
            | Self::LoadStackCheckOffset
            | Self::Simd128Constant { .. }
            | Self::Goto { .. }
            | Self::Unreachable => smallvec![],
            Self::WordBinop { left, right, .. }
            | Self::OverflowCheckedBinop { left, right, .. }
            | Self::FloatBinop { left, right, .. }
            | Self::Shift { left, right, .. }
            | Self::Equal { left, right, .. }
            | Self::Comparison { left, right, .. }
            | Self::Simd128Binop { left, right, .. } => smallvec![*left, *right],
            Self::Projection { input, .. }
            | Self::FloatUnary { input, .. }
            | Self::Change { input, .. }
            | Self::TaggedBitcast { input, .. } => smallvec![*input],
            Self::Select {
                cond,
                vtrue,
                vfalse,
                ..
            } => smallvec![*cond, *vtrue, *vfalse],
            Self::Load { base, index, .. } => {
                let mut inputs = smallvec![*base];
                inputs.extend(index.iter().copied());
                inputs
            }
            Self::Store {
                base, index, value, ..
            } => {
                let mut inputs = smallvec![*base];
                inputs.extend(index.iter().copied());
                inputs.push(*value);
                inputs
            }
            Self::Phi { inputs, .. } => inputs.iter().copied().collect(),
            Self::PendingLoopPhi { first, .. } => smallvec![*first],
            Self::FrameState { inputs, .. } => inputs.clone(),
            Self::Call {
                callee,
                frame_state,
                arguments,
                ..
            } => {
                let mut inputs = smallvec![*callee];
                inputs.extend(frame_state.iter().copied());
                inputs.extend(arguments.iter().copied());
                inputs
            }
            Self::StackPointerGreaterThan { limit, .. } => smallvec![*limit],
            Self::Retain { value } => smallvec![*value],
            Self::DeoptimizeIf {
                condition,
                frame_state,
                ..
            } => smallvec![*condition, *frame_state],
            Self::TrapIf { condition, .. } => smallvec![*condition],
            Self::Branch { condition, .. } => smallvec![*condition],
            Self::Switch { input, .. } => smallvec![*input],
            Self::Return { pop_count, values } => {
                let mut inputs = smallvec![*pop_count];
                inputs.extend(values.iter().copied());
                inputs
            }
            Self::Deoptimize { frame_state, .. } => smallvec![*frame_state],
        }
    }

    /// Rewrite every input of this operation with `f`
    pub fn map_inputs(&mut self, mut f: impl FnMut(OpIndex) -> OpIndex) {
        match self {
            Self::Constant { .. }
            | Self::Parameter { .. }
            | Self::StackCheck { .. }
            | Self::LoadStackCheckOffset
            | Self::Simd128Constant { .. }
            | Self::Goto { .. }
            | Self::Unreachable => (),
            Self::WordBinop { left, right, .. }
            | Self::OverflowCheckedBinop { left, right, .. }
            | Self::FloatBinop { left, right, .. }
            | Self::Shift { left, right, .. }
            | Self::Equal { left, right, .. }
            | Self::Comparison { left, right, .. }
            | Self::Simd128Binop { left, right, .. } => {
                *left = f(*left);
                *right = f(*right);
            }
            Self::Projection { input, .. }
            | Self::FloatUnary { input, .. }
            | Self::Change { input, .. }
            | Self::TaggedBitcast { input, .. }
            | Self::Switch { input, .. } => *input = f(*input),
            Self::Select {
                cond,
                vtrue,
                vfalse,
                ..
            } => {
                *cond = f(*cond);
                *vtrue = f(*vtrue);
                *vfalse = f(*vfalse);
            }
            Self::Load { base, index, .. } => {
                *base = f(*base);
                if let Some(index) = index {
                    *index = f(*index);
                }
            }
            Self::Store {
                base, index, value, ..
            } => {
                *base = f(*base);
                if let Some(index) = index {
                    *index = f(*index);
                }
                *value = f(*value);
            }
            Self::Phi { inputs, .. } => inputs.iter_mut().for_each(|input| *input = f(*input)),
            Self::PendingLoopPhi { first, .. } => *first = f(*first),
            Self::FrameState { inputs, .. } => {
                inputs.iter_mut().for_each(|input| *input = f(*input))
            }
            Self::Call {
                callee,
                frame_state,
                arguments,
                ..
            } => {
                *callee = f(*callee);
                if let Some(frame_state) = frame_state {
                    *frame_state = f(*frame_state);
                }
                arguments.iter_mut().for_each(|arg| *arg = f(*arg));
            }
            Self::StackPointerGreaterThan { limit, .. } => *limit = f(*limit),
            Self::Retain { value } => *value = f(*value),
            Self::DeoptimizeIf {
                condition,
                frame_state,
                ..
            } => {
                *condition = f(*condition);
                *frame_state = f(*frame_state);
            }
            Self::TrapIf { condition, .. } | Self::Branch { condition, .. } => {
                *condition = f(*condition)
            }
            Self::Return { pop_count, values } => {
                *pop_count = f(*pop_count);
                values.iter_mut().for_each(|value| *value = f(*value));
            }
            Self::Deoptimize { frame_state, .. } => *frame_state = f(*frame_state),
        }
    }

    /// The blocks control may transfer to after this operation, in operand order
    pub fn successors(&self) -> SmallVec<[BlockIndex; 2]> {
        match self {
            Self::Goto { destination, .. } => smallvec![*destination],
            Self::Branch {
                if_true, if_false, ..
            } => smallvec![*if_true, *if_false],
            Self::Switch { cases, default, .. } => {
                let mut succs: SmallVec<[BlockIndex; 2]> =
                    cases.iter().map(|case| case.destination).collect();
                succs.push(*default);
                succs
            }
            _ => smallvec![],
        }
    }

    /// Rewrite every successor of this operation with `f`
    pub fn map_successors(&mut self, mut f: impl FnMut(BlockIndex) -> BlockIndex) {
        match self {
            Self::Goto { destination, .. } => *destination = f(*destination),
            Self::Branch {
                if_true, if_false, ..
            } => {
                *if_true = f(*if_true);
                *if_false = f(*if_false);
            }
            Self::Switch { cases, default, .. } => {
                cases.iter_mut().for_each(|case| case.destination = f(case.destination));
                *default = f(*default);
            }
            _ => (),
        }
    }

    /// True if this terminator may transfer control to more than one block
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Branch { .. } | Self::Switch { .. })
    }
}
