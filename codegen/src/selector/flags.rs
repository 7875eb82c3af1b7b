use shaftc_ir::{
    BlockIndex, ComparisonKind, DeoptimizeReason, EntityRef, OpIndex, Operation,
    OverflowCheckedBinopKind, RegisterRepresentation, TrapId, WordBinopKind, WordRepresentation,
};
use shaftc_session::BailoutReason;
use smallvec::SmallVec;

use super::InstructionSelector;
use crate::{
    ArchOpcode, DeoptimizationEntry, DeoptimizeKind, FlagsCondition, FlagsMode,
    Immediate, Instruction, InstructionCode, InstructionOperand, RpoNumber,
};

/// What consumes the flags set by a compare-like instruction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContinuationKind {
    Branch {
        if_true: BlockIndex,
        if_false: BlockIndex,
    },
    /// Materialize the condition as a word32 0 or 1 in the value of `result`
    Set { result: OpIndex },
    /// Pick `vtrue` or `vfalse` as the value of `result`
    Select {
        result: OpIndex,
        vtrue: OpIndex,
        vfalse: OpIndex,
    },
    Deoptimize {
        frame_state: OpIndex,
        reason: DeoptimizeReason,
    },
    Trap { trap: TrapId },
}

/// A flags consumer together with the condition it tests
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlagsContinuation {
    pub kind: ContinuationKind,
    pub condition: FlagsCondition,
}

impl FlagsContinuation {
    pub fn for_branch(if_true: BlockIndex, if_false: BlockIndex) -> Self {
        Self {
            kind: ContinuationKind::Branch { if_true, if_false },
            condition: FlagsCondition::NotEqual,
        }
    }

    pub fn for_set(condition: FlagsCondition, result: OpIndex) -> Self {
        Self {
            kind: ContinuationKind::Set { result },
            condition,
        }
    }

    pub fn for_select(result: OpIndex, vtrue: OpIndex, vfalse: OpIndex) -> Self {
        Self {
            kind: ContinuationKind::Select {
                result,
                vtrue,
                vfalse,
            },
            condition: FlagsCondition::NotEqual,
        }
    }

    pub fn for_deoptimize(negated: bool, frame_state: OpIndex, reason: DeoptimizeReason) -> Self {
        Self {
            kind: ContinuationKind::Deoptimize {
                frame_state,
                reason,
            },
            condition: if negated {
                FlagsCondition::Equal
            } else {
                FlagsCondition::NotEqual
            },
        }
    }

    pub fn for_trap(negated: bool, trap: TrapId) -> Self {
        Self {
            kind: ContinuationKind::Trap { trap },
            condition: if negated {
                FlagsCondition::Equal
            } else {
                FlagsCondition::NotEqual
            },
        }
    }

    pub fn mode(&self) -> FlagsMode {
        match self.kind {
            ContinuationKind::Branch { .. } => FlagsMode::Branch,
            ContinuationKind::Set { .. } => FlagsMode::Set,
            ContinuationKind::Select { .. } => FlagsMode::Select,
            ContinuationKind::Deoptimize { .. } => FlagsMode::Deoptimize,
            ContinuationKind::Trap { .. } => FlagsMode::Trap,
        }
    }

    pub fn negate(&mut self) {
        self.condition = self.condition.negate();
    }

    pub fn commute(&mut self) {
        self.condition = self.condition.commute();
    }

    /// Replace a "value != 0" test by `condition`, or by its negation for a "value == 0" test
    pub fn overwrite_and_negate_if_equal(&mut self, condition: FlagsCondition) {
        let negate = self.condition == FlagsCondition::Equal;
        self.condition = condition;
        if negate {
            self.negate();
        }
    }
}

pub(super) fn comparison_condition(kind: ComparisonKind, rep: RegisterRepresentation) -> FlagsCondition {
    if rep.is_float() {
        return match kind {
            ComparisonKind::SignedLessThan | ComparisonKind::UnsignedLessThan => {
                FlagsCondition::FloatLessThan
            }
            ComparisonKind::SignedLessThanOrEqual | ComparisonKind::UnsignedLessThanOrEqual => {
                FlagsCondition::FloatLessThanOrEqual
            }
        };
    }
    match kind {
        ComparisonKind::SignedLessThan => FlagsCondition::SignedLessThan,
        ComparisonKind::SignedLessThanOrEqual => FlagsCondition::SignedLessThanOrEqual,
        ComparisonKind::UnsignedLessThan => FlagsCondition::UnsignedLessThan,
        ComparisonKind::UnsignedLessThanOrEqual => FlagsCondition::UnsignedLessThanOrEqual,
    }
}

/// The width integer comparisons of values of representation `rep` operate on
pub(super) fn compare_width(rep: RegisterRepresentation) -> WordRepresentation {
    match rep {
        RegisterRepresentation::Word32 | RegisterRepresentation::Compressed => {
            WordRepresentation::Word32
        }
        _ => WordRepresentation::Word64,
    }
}

impl InstructionSelector<'_> {
    /// Emit `code` with the given operands, extended by the operands of the continuation
    pub(super) fn emit_with_continuation(
        &mut self,
        code: InstructionCode,
        outputs: impl IntoIterator<Item = InstructionOperand>,
        inputs: impl IntoIterator<Item = InstructionOperand>,
        cont: &FlagsContinuation,
    ) -> Result<(), BailoutReason> {
        let mut outputs: SmallVec<[InstructionOperand; 2]> = outputs.into_iter().collect();
        let mut inputs: SmallVec<[InstructionOperand; 4]> = inputs.into_iter().collect();
        let flags_inputs_start = inputs.len();
        match cont.kind {
            ContinuationKind::Branch { if_true, if_false } => {
                inputs.push(InstructionOperand::Immediate(Immediate::Block(RpoNumber::new(
                    if_true.index(),
                ))));
                inputs.push(InstructionOperand::Immediate(Immediate::Block(RpoNumber::new(
                    if_false.index(),
                ))));
            }
            ContinuationKind::Set { result } => outputs.push(self.define_as_register(result)),
            ContinuationKind::Select {
                result,
                vtrue,
                vfalse,
            } => {
                inputs.push(self.use_register(vtrue));
                inputs.push(self.use_register(vfalse));
                outputs.push(self.define_as_register(result));
            }
            ContinuationKind::Deoptimize {
                frame_state,
                reason,
            } => {
                self.append_deoptimization_inputs(
                    frame_state,
                    DeoptimizeKind::Eager,
                    reason,
                    &mut inputs,
                )?;
            }
            ContinuationKind::Trap { trap } => {
                inputs.push(InstructionOperand::Immediate(Immediate::Int32(trap as i32)));
            }
        }
        let code = code.with_flags(cont.mode(), cont.condition);
        let mut instruction = Instruction::new(code, outputs, inputs, []);
        instruction.flags_inputs_start = flags_inputs_start;
        self.emit(instruction)
    }

    /// Append the deoptimization entry id and the values of `frame_state` to `inputs`
    pub(super) fn append_deoptimization_inputs(
        &mut self,
        frame_state: OpIndex,
        kind: DeoptimizeKind,
        reason: DeoptimizeReason,
        inputs: &mut SmallVec<[InstructionOperand; 4]>,
    ) -> Result<u32, BailoutReason> {
        let graph = self.graph();
        let Operation::FrameState { info, .. } = graph.get(frame_state) else {
            return Err(BailoutReason::unsupported(
                graph.get(frame_state).name(),
                "deoptimization requires a frame state",
            ));
        };
        let id_position = inputs.len();
        inputs.push(InstructionOperand::Invalid);
        // Values are flattened depth first in input order, so a parent frame state given as
        // the first input puts the outer frame's values first.
        let mut pending = vec![frame_state];
        let mut value_count = 0;
        while let Some(value) = pending.pop() {
            match graph.get(value) {
                Operation::FrameState { inputs: values, .. } => {
                    pending.extend(values.iter().rev().copied());
                }
                _ => {
                    inputs.push(self.use_any(value));
                    value_count += 1;
                }
            }
        }
        let id = self.sequence.add_deoptimization_entry(DeoptimizationEntry {
            kind,
            reason,
            frame_state: info.clone(),
            value_count,
        });
        inputs[id_position] = InstructionOperand::Immediate(Immediate::Index(id));
        Ok(id)
    }

    /// Select `value != 0` (or the condition of `cont` applied to it) feeding `cont`, fusing the
    /// computation of `value` into the flags-setting instruction where possible
    pub(super) fn visit_word_compare_zero(
        &mut self,
        mut user: OpIndex,
        mut value: OpIndex,
        mut cont: FlagsContinuation,
    ) -> Result<(), BailoutReason> {
        let graph = self.graph();
        // (x == 0) == 0 is x
        while self.can_cover(user, value) {
            match graph.match_equal_zero(value) {
                Some(inner) => {
                    user = value;
                    value = inner;
                    cont.negate();
                }
                None => break,
            }
        }

        if self.can_cover(user, value) {
            match *graph.get(value) {
                Operation::Comparison {
                    left,
                    right,
                    kind,
                    rep,
                } => {
                    cont.overwrite_and_negate_if_equal(comparison_condition(kind, rep));
                    return if rep.is_float() {
                        self.visit_float_compare(left, right, rep, &cont)
                    } else {
                        self.visit_word_compare(value, left, right, compare_width(rep), &cont)
                    };
                }
                Operation::Equal { left, right, rep } => {
                    return if rep.is_float() {
                        cont.overwrite_and_negate_if_equal(FlagsCondition::FloatEqual);
                        self.visit_float_compare(left, right, rep, &cont)
                    } else {
                        cont.overwrite_and_negate_if_equal(FlagsCondition::Equal);
                        self.visit_word_compare(value, left, right, compare_width(rep), &cont)
                    };
                }
                Operation::WordBinop {
                    left,
                    right,
                    kind: WordBinopKind::Sub,
                    rep,
                } => {
                    // x - y != 0 iff x != y
                    return self.visit_word_compare(value, left, right, rep, &cont);
                }
                Operation::WordBinop {
                    left,
                    right,
                    kind: WordBinopKind::BitwiseAnd,
                    rep,
                } => {
                    let right_operand = self.use_register_or_immediate(right);
                    let left_operand = self.use_register(left);
                    return self.emit_with_continuation(
                        ArchOpcode::RtTest(rep).into(),
                        [],
                        [left_operand, right_operand],
                        &cont,
                    );
                }
                Operation::Projection {
                    input, index: 1, ..
                } if matches!(graph.get(input), Operation::OverflowCheckedBinop { .. })
                    && self.can_fuse_overflow_check(user, input) =>
                {
                    let Operation::OverflowCheckedBinop {
                        left,
                        right,
                        kind,
                        rep,
                    } = *graph.get(input)
                    else {
                        unreachable!()
                    };
                    cont.overwrite_and_negate_if_equal(FlagsCondition::Overflow);
                    return self.visit_overflow_binop(input, left, right, kind, rep, &cont);
                }
                Operation::StackPointerGreaterThan { limit, .. } => {
                    cont.overwrite_and_negate_if_equal(FlagsCondition::UnsignedGreaterThan);
                    let limit = self.use_register(limit);
                    return self.emit_with_continuation(
                        ArchOpcode::ArchStackPointerGreaterThan.into(),
                        [],
                        [limit],
                        &cont,
                    );
                }
                _ => (),
            }
        }

        // Compare the materialized value against zero
        let rep = graph
            .get(value)
            .output_rep()
            .map(compare_width)
            .unwrap_or(WordRepresentation::Word32);
        let operand = self.use_register(value);
        self.emit_with_continuation(ArchOpcode::RtTest(rep).into(), [], [operand, operand], &cont)
    }

    /// True if the overflow bit of `binop`, used by `user` only, can be computed by `user`'s
    /// instruction: the binop must be in the same block, and its value must not be used before
    /// `user`.
    fn can_fuse_overflow_check(&self, user: OpIndex, binop: OpIndex) -> bool {
        let graph = self.graph();
        if graph.block_of(binop) != graph.block_of(user) {
            return false;
        }
        let Some(result) = graph.find_projection(binop, 0) else {
            return true;
        };
        (binop.index() + 1..user.index())
            .map(OpIndex::new)
            .all(|op| !graph.get(op).inputs().contains(&result))
    }

    /// Select a comparison of two integers of width `rep`
    pub(super) fn visit_word_compare(
        &mut self,
        node: OpIndex,
        mut left: OpIndex,
        mut right: OpIndex,
        rep: WordRepresentation,
        cont: &FlagsContinuation,
    ) -> Result<(), BailoutReason> {
        let mut cont = *cont;
        if !self.can_be_immediate(right) && self.can_be_immediate(left) {
            core::mem::swap(&mut left, &mut right);
            cont.commute();
        } else if self.can_use_memory_operand(node, left, rep)
            && !self.can_use_memory_operand(node, right, rep)
        {
            core::mem::swap(&mut left, &mut right);
            cont.commute();
        }

        if self.can_be_immediate(right) {
            let right = self.use_immediate(right);
            let left = self.use_register(left);
            return self.emit_with_continuation(
                ArchOpcode::RtCmp(rep).into(),
                [],
                [left, right],
                &cont,
            );
        }
        if let Some((mode, memory)) = self.try_memory_operand(node, right, rep) {
            let left = self.use_register(left);
            let mut inputs: SmallVec<[InstructionOperand; 4]> = smallvec::smallvec![left];
            inputs.extend(memory);
            return self.emit_with_continuation(
                InstructionCode::new(ArchOpcode::RtCmp(rep)).with_mode(mode),
                [],
                inputs,
                &cont,
            );
        }
        let right = self.use_register(right);
        let left = self.use_register(left);
        self.emit_with_continuation(ArchOpcode::RtCmp(rep).into(), [], [left, right], &cont)
    }

    pub(super) fn visit_float_compare(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        rep: RegisterRepresentation,
        cont: &FlagsContinuation,
    ) -> Result<(), BailoutReason> {
        let float_rep = match rep {
            RegisterRepresentation::Float32 => shaftc_ir::FloatRepresentation::Float32,
            _ => shaftc_ir::FloatRepresentation::Float64,
        };
        let left = self.use_register(left);
        let right = self.use_register(right);
        self.emit_with_continuation(ArchOpcode::RtFloatCmp(float_rep).into(), [], [left, right], cont)
    }

    /// Select an overflow-checked binop whose overflow bit feeds `cont`
    pub(super) fn visit_overflow_binop(
        &mut self,
        node: OpIndex,
        left: OpIndex,
        right: OpIndex,
        kind: OverflowCheckedBinopKind,
        rep: WordRepresentation,
        cont: &FlagsContinuation,
    ) -> Result<(), BailoutReason> {
        let opcode = match kind {
            OverflowCheckedBinopKind::SignedAdd => ArchOpcode::RtAdd(rep),
            OverflowCheckedBinopKind::SignedSub => ArchOpcode::RtSub(rep),
            OverflowCheckedBinopKind::SignedMul => ArchOpcode::RtMul(rep),
        };
        let right_operand = self.use_register_or_immediate(right);
        let left_operand = self.use_register(left);
        let output = self.define_same_as_first(node);
        self.emit_with_continuation(
            opcode.into(),
            [output],
            [left_operand, right_operand],
            cont,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_respects_negated_tests() {
        let mut cont = FlagsContinuation::for_branch(BlockIndex::new(1), BlockIndex::new(2));
        cont.overwrite_and_negate_if_equal(FlagsCondition::SignedLessThan);
        assert_eq!(cont.condition, FlagsCondition::SignedLessThan);

        let mut cont = FlagsContinuation::for_branch(BlockIndex::new(1), BlockIndex::new(2));
        cont.negate();
        cont.overwrite_and_negate_if_equal(FlagsCondition::SignedLessThan);
        assert_eq!(cont.condition, FlagsCondition::SignedGreaterThanOrEqual);

        let mut cont = FlagsContinuation::for_trap(true, TrapId::Unreachable);
        cont.overwrite_and_negate_if_equal(FlagsCondition::FloatLessThan);
        assert_eq!(cont.condition, FlagsCondition::FloatNotLessThan);
    }
}
