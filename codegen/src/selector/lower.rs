use shaftc_ir::{
    ChangeKind, ConstantKind, EntityRef, FloatRepresentation, MemoryRepresentation, OpIndex,
    Operation, RegisterRepresentation, SelectImplementation, ShiftKind, SwitchCase, WordBinopKind,
    WordRepresentation, WriteBarrierKind, BlockIndex,
};
use shaftc_session::{BailoutReason, CpuFeatures};
use smallvec::{SmallVec, smallvec};

use super::{
    FlagsContinuation, InstructionSelector,
    flags::{comparison_condition, compare_width},
};
use crate::{
    AddressingMode, ArchOpcode, Constant, FlagsCondition, Immediate, Instruction, InstructionCode,
    InstructionOperand, Linkage, OperandPolicy, PhiInstruction, ReferenceMap, RpoNumber,
    UnallocatedOperand,
};

type MemoryOperands = SmallVec<[InstructionOperand; 3]>;

/// Largest value range of a switch lowered to a jump table
const MAX_TABLE_SWITCH_VALUE_RANGE: u64 = 2 << 16;

fn block_operand(block: BlockIndex) -> InstructionOperand {
    InstructionOperand::Immediate(Immediate::Block(RpoNumber::new(block.index())))
}

fn float_rep(rep: RegisterRepresentation) -> Option<FloatRepresentation> {
    match rep {
        RegisterRepresentation::Float32 => Some(FloatRepresentation::Float32),
        RegisterRepresentation::Float64 => Some(FloatRepresentation::Float64),
        _ => None,
    }
}

impl InstructionSelector<'_> {
    pub(super) fn visit_operation(
        &mut self,
        index: OpIndex,
        op: &Operation,
    ) -> Result<(), BailoutReason> {
        match *op {
            Operation::Constant { kind } => {
                let output = self.define_constant(index, Constant::from(kind));
                self.emit(Instruction::new(ArchOpcode::ArchNop, [output], [], []))
            }
            Operation::Simd128Constant { value } => {
                let output = self.define_constant(index, Constant::Simd128(value));
                self.emit(Instruction::new(ArchOpcode::ArchNop, [output], [], []))
            }
            Operation::Parameter { index: param, .. } => {
                let location = self.linkage.parameter_location(param as usize).ok_or_else(|| {
                    BailoutReason::unsupported(op.name(), format!("no location for parameter {param}"))
                })?;
                let output = self.define_as_fixed(index, location.to_location());
                self.emit(Instruction::new(ArchOpcode::ArchNop, [output], [], []))
            }
            Operation::WordBinop {
                left,
                right,
                kind,
                rep,
            } => self.visit_word_binop(index, left, right, kind, rep),
            Operation::OverflowCheckedBinop {
                left,
                right,
                kind,
                rep,
            } => {
                let graph = self.graph();
                let overflow = graph
                    .find_projection(index, 1)
                    .filter(|projection| self.is_used(*projection) && !self.is_defined(*projection));
                match overflow {
                    Some(projection) => {
                        let cont = FlagsContinuation::for_set(FlagsCondition::Overflow, projection);
                        self.visit_overflow_binop(index, left, right, kind, rep, &cont)
                    }
                    None => {
                        let opcode = match kind {
                            shaftc_ir::OverflowCheckedBinopKind::SignedAdd => ArchOpcode::RtAdd(rep),
                            shaftc_ir::OverflowCheckedBinopKind::SignedSub => ArchOpcode::RtSub(rep),
                            shaftc_ir::OverflowCheckedBinopKind::SignedMul => ArchOpcode::RtMul(rep),
                        };
                        self.visit_two_address(index, opcode, left, right, rep)
                    }
                }
            }
            Operation::Projection { input, index: 0, .. } => {
                match self.graph().get(input) {
                    Operation::OverflowCheckedBinop { .. } | Operation::Call { .. } => {
                        self.mark_as_used(input);
                        self.rename(index, input);
                        Ok(())
                    }
                    other => Err(BailoutReason::unsupported(
                        op.name(),
                        format!("projection of {}", other.name()),
                    )),
                }
            }
            Operation::Projection { input, .. } => match self.graph().get(input) {
                // Defined by the instruction selected for the input
                Operation::OverflowCheckedBinop { .. } | Operation::Call { .. } => {
                    self.mark_as_used(input);
                    Ok(())
                }
                other => Err(BailoutReason::unsupported(
                    op.name(),
                    format!("projection of {}", other.name()),
                )),
            },
            Operation::FloatBinop {
                left,
                right,
                kind,
                rep,
            } => self.visit_float_or_simd_binop(index, ArchOpcode::RtFloatBinop(kind, rep), left, right),
            Operation::FloatUnary { input, kind, rep } => {
                let input = self.use_register(input);
                let output = self.define_as_register(index);
                self.emit(Instruction::new(ArchOpcode::RtFloatUnary(kind, rep), [output], [input], []))
            }
            Operation::Shift {
                left,
                right,
                kind,
                rep,
            } => {
                let opcode = match kind {
                    ShiftKind::ShiftLeft => ArchOpcode::RtShl(rep),
                    ShiftKind::ShiftRightArithmetic => ArchOpcode::RtSar(rep),
                    ShiftKind::ShiftRightLogical => ArchOpcode::RtShr(rep),
                    ShiftKind::RotateRight => ArchOpcode::RtRor(rep),
                };
                let right = self.use_register_or_immediate(right);
                let left = self.use_register(left);
                let output = self.define_same_as_first(index);
                self.emit(Instruction::new(opcode, [output], [left, right], []))
            }
            Operation::Equal { left, right, rep } => {
                if rep.is_float() {
                    let cont = FlagsContinuation::for_set(FlagsCondition::FloatEqual, index);
                    self.visit_float_compare(left, right, rep, &cont)
                } else {
                    let cont = FlagsContinuation::for_set(FlagsCondition::Equal, index);
                    self.visit_word_compare(index, left, right, compare_width(rep), &cont)
                }
            }
            Operation::Comparison {
                left,
                right,
                kind,
                rep,
            } => {
                let cont = FlagsContinuation::for_set(comparison_condition(kind, rep), index);
                if rep.is_float() {
                    self.visit_float_compare(left, right, rep, &cont)
                } else {
                    self.visit_word_compare(index, left, right, compare_width(rep), &cont)
                }
            }
            Operation::Change {
                input,
                kind,
                from,
                to,
            } => self.visit_change(index, input, kind, from, to),
            Operation::TaggedBitcast { input, .. } => {
                self.mark_as_used(input);
                self.rename(index, input);
                Ok(())
            }
            Operation::Select {
                cond,
                vtrue,
                vfalse,
                implem,
                ..
            } => match implem {
                SelectImplementation::Branch => Err(BailoutReason::UnsupportedSelectLowering),
                SelectImplementation::CMove => self.visit_word_compare_zero(
                    index,
                    cond,
                    FlagsContinuation::for_select(index, vtrue, vfalse),
                ),
            },
            Operation::Load {
                base,
                index: offset_index,
                loaded_rep,
                result_rep,
                offset,
                element_size_log2,
            } => {
                let opcode = self.load_opcode(loaded_rep, result_rep);
                let (mode, memory) =
                    self.memory_operand(index, base, offset_index, offset, element_size_log2);
                let output = self.define_as_register(index);
                self.emit(Instruction::new(
                    InstructionCode::new(opcode).with_mode(mode),
                    [output],
                    memory,
                    [],
                ))
            }
            Operation::Store {
                base,
                index: offset_index,
                value,
                stored_rep,
                write_barrier,
                offset,
                element_size_log2,
            } => self.visit_store(
                index,
                base,
                offset_index,
                value,
                stored_rep,
                write_barrier,
                offset,
                element_size_log2,
            ),
            Operation::Phi { ref inputs, .. } => {
                let vreg = self.vreg(index);
                self.mark_as_defined(index);
                let operands = inputs
                    .iter()
                    .map(|input| {
                        self.mark_as_used(*input);
                        self.vreg(*input)
                    })
                    .collect();
                let rpo = RpoNumber::new(self.current_block.index());
                self.sequence.blocks[rpo].phis.push(PhiInstruction { vreg, operands });
                Ok(())
            }
            Operation::PendingLoopPhi { .. } => Err(BailoutReason::InvalidGraph {
                stage: "instruction-selection",
                message: format!("{index} is a loop phi without a backedge input"),
            }),
            Operation::FrameState { .. } => Ok(()),
            Operation::Call {
                callee,
                frame_state,
                ref arguments,
                ref descriptor,
            } => self.visit_call(index, callee, frame_state, arguments, descriptor),
            Operation::StackCheck { .. } => {
                let mut instruction = Instruction::new(ArchOpcode::ArchStackCheck, [], [], []);
                // Registers survive the interrupt check, so tagged values in them are recorded too
                instruction.reference_map = Some(ReferenceMap {
                    records_registers: true,
                    ..Default::default()
                });
                self.emit(instruction)
            }
            Operation::StackPointerGreaterThan { limit, .. } => {
                let cont = FlagsContinuation::for_set(FlagsCondition::UnsignedGreaterThan, index);
                let limit = self.use_register(limit);
                self.emit_with_continuation(
                    ArchOpcode::ArchStackPointerGreaterThan.into(),
                    [],
                    [limit],
                    &cont,
                )
            }
            Operation::LoadStackCheckOffset => {
                let output = self.define_as_register(index);
                self.emit(Instruction::new(ArchOpcode::ArchStackCheckOffset, [output], [], []))
            }
            Operation::Simd128Binop { left, right, kind } => {
                self.visit_float_or_simd_binop(index, ArchOpcode::RtSimd128Binop(kind), left, right)
            }
            Operation::Retain { value } => {
                let value = self.use_any(value);
                self.emit(Instruction::new(ArchOpcode::ArchNop, [], [value], []))
            }
            Operation::DeoptimizeIf {
                condition,
                frame_state,
                negated,
                reason,
            } => self.visit_word_compare_zero(
                index,
                condition,
                FlagsContinuation::for_deoptimize(negated, frame_state, reason),
            ),
            Operation::TrapIf {
                condition,
                negated,
                trap,
            } => self.visit_word_compare_zero(
                index,
                condition,
                FlagsContinuation::for_trap(negated, trap),
            ),
            Operation::Goto { destination, .. } => {
                self.emit(Instruction::new(ArchOpcode::ArchJmp, [], [block_operand(destination)], []))
            }
            Operation::Branch {
                condition,
                if_true,
                if_false,
                ..
            } => self.visit_word_compare_zero(
                index,
                condition,
                FlagsContinuation::for_branch(if_true, if_false),
            ),
            Operation::Switch {
                input,
                ref cases,
                default,
                ..
            } => self.visit_switch(input, cases, default),
            Operation::Return {
                pop_count,
                ref values,
            } => {
                let mut inputs: SmallVec<[InstructionOperand; 4]> =
                    smallvec![self.use_register_or_immediate(pop_count)];
                for (i, value) in values.iter().enumerate() {
                    let location = self.linkage.return_location(i).ok_or_else(|| {
                        BailoutReason::unsupported(op.name(), format!("no location for return value {i}"))
                    })?;
                    inputs.push(self.use_fixed(*value, location.to_location()));
                }
                self.emit(Instruction::new(ArchOpcode::ArchRet, [], inputs, []))
            }
            Operation::Deoptimize {
                frame_state,
                reason,
            } => {
                let mut inputs = SmallVec::new();
                self.append_deoptimization_inputs(
                    frame_state,
                    crate::DeoptimizeKind::Eager,
                    reason,
                    &mut inputs,
                )?;
                self.emit(Instruction::new(ArchOpcode::ArchDeoptimize, [], inputs, []))
            }
            Operation::Unreachable => {
                self.emit(Instruction::new(ArchOpcode::ArchUnreachable, [], [], []))
            }
        }
    }

    fn define_constant(&mut self, op: OpIndex, constant: Constant) -> InstructionOperand {
        let vreg = self.vreg(op);
        self.mark_as_defined(op);
        self.sequence.add_constant(vreg, constant);
        InstructionOperand::Constant(vreg)
    }

    fn visit_word_binop(
        &mut self,
        op: OpIndex,
        left: OpIndex,
        right: OpIndex,
        kind: WordBinopKind,
        rep: WordRepresentation,
    ) -> Result<(), BailoutReason> {
        match kind {
            WordBinopKind::Add => self.visit_add(op, left, right, rep),
            WordBinopKind::Sub => {
                // x - c is lea [x - c]
                let negated = self
                    .graph()
                    .match_signed_integral_constant(right)
                    .filter(|_| self.can_be_immediate(right))
                    .and_then(|value| i32::try_from(value).ok())
                    .and_then(i32::checked_neg);
                match negated {
                    Some(displacement) => {
                        let left = self.use_register(left);
                        let output = self.define_as_register(op);
                        self.emit(Instruction::new(
                            InstructionCode::new(ArchOpcode::RtLea(rep)).with_mode(AddressingMode::MRI),
                            [output],
                            [left, InstructionOperand::Immediate(Immediate::Int32(displacement))],
                            [],
                        ))
                    }
                    None => self.visit_two_address(op, ArchOpcode::RtSub(rep), left, right, rep),
                }
            }
            WordBinopKind::Mul => self.visit_commutative(op, ArchOpcode::RtMul(rep), left, right, rep),
            WordBinopKind::BitwiseAnd => {
                self.visit_commutative(op, ArchOpcode::RtAnd(rep), left, right, rep)
            }
            WordBinopKind::BitwiseOr => {
                self.visit_commutative(op, ArchOpcode::RtOr(rep), left, right, rep)
            }
            WordBinopKind::BitwiseXor => {
                self.visit_commutative(op, ArchOpcode::RtXor(rep), left, right, rep)
            }
            WordBinopKind::SignedDiv
            | WordBinopKind::UnsignedDiv
            | WordBinopKind::SignedMod
            | WordBinopKind::UnsignedMod => {
                let opcode = match kind {
                    WordBinopKind::SignedDiv => ArchOpcode::RtIdiv(rep),
                    WordBinopKind::UnsignedDiv => ArchOpcode::RtUdiv(rep),
                    WordBinopKind::SignedMod => ArchOpcode::RtImod(rep),
                    _ => ArchOpcode::RtUmod(rep),
                };
                let left = self.use_register(left);
                let right = self.use_register(right);
                let output = self.define_as_register(op);
                self.emit(Instruction::new(opcode, [output], [left, right], []))
            }
        }
    }

    /// Select an addition as a three-address `lea`, folding an immediate or a scaled index, or as
    /// a two-address add when the right operand is a foldable load
    fn visit_add(
        &mut self,
        op: OpIndex,
        mut left: OpIndex,
        mut right: OpIndex,
        rep: WordRepresentation,
    ) -> Result<(), BailoutReason> {
        if (self.can_be_immediate(left) && !self.can_be_immediate(right))
            || (self.scaled_index(op, left, rep).is_some()
                && self.scaled_index(op, right, rep).is_none())
        {
            core::mem::swap(&mut left, &mut right);
        }

        if self.can_be_immediate(right) {
            let immediate = self.use_immediate(right);
            let left = self.use_register(left);
            let output = self.define_as_register(op);
            return self.emit(Instruction::new(
                InstructionCode::new(ArchOpcode::RtLea(rep)).with_mode(AddressingMode::MRI),
                [output],
                [left, immediate],
                [],
            ));
        }

        if let Some((index, scale)) = self.scaled_index(op, right, rep) {
            let base = self.use_register(left);
            let index = self.use_register(index);
            let output = self.define_as_register(op);
            return self.emit(Instruction::new(
                InstructionCode::new(ArchOpcode::RtLea(rep)).with_mode(AddressingMode::MRn(scale)),
                [output],
                [base, index],
                [],
            ));
        }

        if self.can_use_memory_operand(op, right, rep) || self.can_use_memory_operand(op, left, rep) {
            return self.visit_commutative(op, ArchOpcode::RtAdd(rep), left, right, rep);
        }

        let base = self.use_register(left);
        let index = self.use_register(right);
        let output = self.define_as_register(op);
        self.emit(Instruction::new(
            InstructionCode::new(ArchOpcode::RtLea(rep)).with_mode(AddressingMode::MRn(0)),
            [output],
            [base, index],
            [],
        ))
    }

    /// Match `index << scale` with a scale of at most 3 that `user` can fold into an address
    fn scaled_index(
        &self,
        user: OpIndex,
        op: OpIndex,
        rep: WordRepresentation,
    ) -> Option<(OpIndex, u8)> {
        if !self.can_cover(user, op) {
            return None;
        }
        match *self.graph().get(op) {
            Operation::Shift {
                left,
                right,
                kind: ShiftKind::ShiftLeft,
                rep: shift_rep,
            } if shift_rep == rep => {
                let scale = self.graph().match_integral_constant(right)?;
                (scale <= 3).then_some((left, scale as u8))
            }
            _ => None,
        }
    }

    fn visit_commutative(
        &mut self,
        op: OpIndex,
        opcode: ArchOpcode,
        mut left: OpIndex,
        mut right: OpIndex,
        rep: WordRepresentation,
    ) -> Result<(), BailoutReason> {
        if (self.can_be_immediate(left) && !self.can_be_immediate(right))
            || (self.can_use_memory_operand(op, left, rep)
                && !self.can_use_memory_operand(op, right, rep))
        {
            core::mem::swap(&mut left, &mut right);
        }
        self.visit_two_address(op, opcode, left, right, rep)
    }

    /// Select `left = left op right` where `right` may be an immediate or a memory operand
    fn visit_two_address(
        &mut self,
        op: OpIndex,
        opcode: ArchOpcode,
        left: OpIndex,
        right: OpIndex,
        rep: WordRepresentation,
    ) -> Result<(), BailoutReason> {
        let mut code = InstructionCode::new(opcode);
        let mut inputs: SmallVec<[InstructionOperand; 4]> = SmallVec::new();
        if self.can_be_immediate(right) {
            inputs.push(self.use_register(left));
            inputs.push(self.use_immediate(right));
        } else if let Some((mode, memory)) = self.try_memory_operand(op, right, rep) {
            inputs.push(self.use_register(left));
            inputs.extend(memory);
            code = code.with_mode(mode);
        } else {
            inputs.push(self.use_register(left));
            inputs.push(self.use_register(right));
        }
        let output = self.define_same_as_first(op);
        self.emit(Instruction::new(code, [output], inputs, []))
    }

    fn visit_float_or_simd_binop(
        &mut self,
        op: OpIndex,
        opcode: ArchOpcode,
        left: OpIndex,
        right: OpIndex,
    ) -> Result<(), BailoutReason> {
        let left = self.use_register(left);
        let right = self.use_register(right);
        let output = if self.session().has_cpu_feature(CpuFeatures::AVX) {
            self.define_as_register(op)
        } else {
            self.define_same_as_first(op)
        };
        self.emit(Instruction::new(opcode, [output], [left, right], []))
    }

    fn visit_change(
        &mut self,
        op: OpIndex,
        input: OpIndex,
        kind: ChangeKind,
        from: RegisterRepresentation,
        to: RegisterRepresentation,
    ) -> Result<(), BailoutReason> {
        let unsupported = || {
            BailoutReason::unsupported("Change", format!("{kind:?} from {from} to {to}"))
        };
        let opcode = match kind {
            ChangeKind::Truncate => {
                self.mark_as_used(input);
                self.rename(op, input);
                return Ok(());
            }
            ChangeKind::ZeroExtend => ArchOpcode::RtMovl,
            ChangeKind::SignExtend => ArchOpcode::RtMovsxlq,
            ChangeKind::SignedToFloat | ChangeKind::UnsignedToFloat => ArchOpcode::RtIntToFloat {
                signed: kind == ChangeKind::SignedToFloat,
                from: from.as_word().ok_or_else(unsupported)?,
                to: float_rep(to).ok_or_else(unsupported)?,
            },
            ChangeKind::FloatToSigned => ArchOpcode::RtFloatToInt {
                from: float_rep(from).ok_or_else(unsupported)?,
                to: to.as_word().ok_or_else(unsupported)?,
            },
            ChangeKind::FloatConversion => {
                ArchOpcode::RtFloatConvert(float_rep(to).ok_or_else(unsupported)?)
            }
            ChangeKind::Bitcast => ArchOpcode::RtBitcast(to),
        };
        let input = self.use_register(input);
        let output = self.define_as_register(op);
        self.emit(Instruction::new(opcode, [output], [input], []))
    }

    fn load_opcode(
        &self,
        loaded_rep: MemoryRepresentation,
        result_rep: RegisterRepresentation,
    ) -> ArchOpcode {
        if !loaded_rep.is_tagged() {
            return ArchOpcode::RtLoad(loaded_rep);
        }
        if !self.session().options.pointer_compression {
            ArchOpcode::RtLoad(MemoryRepresentation::Uint64)
        } else if result_rep == RegisterRepresentation::Compressed {
            ArchOpcode::RtLoad(MemoryRepresentation::Uint32)
        } else {
            ArchOpcode::RtLoadDecompressTagged
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_store(
        &mut self,
        op: OpIndex,
        base: OpIndex,
        index: Option<OpIndex>,
        value: OpIndex,
        stored_rep: MemoryRepresentation,
        write_barrier: WriteBarrierKind,
        offset: i32,
        element_size_log2: u8,
    ) -> Result<(), BailoutReason> {
        let memory_rep = if stored_rep.is_tagged() {
            if self.session().options.pointer_compression {
                MemoryRepresentation::Uint32
            } else {
                MemoryRepresentation::Uint64
            }
        } else {
            stored_rep
        };
        let with_barrier = write_barrier == WriteBarrierKind::Full && stored_rep.is_tagged();
        let (mode, memory) = self.memory_operand(op, base, index, offset, element_size_log2);
        let mut inputs: SmallVec<[InstructionOperand; 4]> = memory.into_iter().collect();
        let value_is_immediate = !with_barrier
            && !stored_rep.is_tagged()
            && !matches!(stored_rep, MemoryRepresentation::Float32 | MemoryRepresentation::Float64)
            && self.can_be_immediate(value);
        inputs.push(if value_is_immediate {
            self.use_immediate(value)
        } else {
            self.use_register(value)
        });
        let (opcode, temps): (ArchOpcode, SmallVec<[InstructionOperand; 2]>) = if with_barrier {
            let temps = smallvec![
                self.temp_register(RegisterRepresentation::POINTER),
                self.temp_register(RegisterRepresentation::POINTER),
            ];
            (ArchOpcode::RtStoreWithWriteBarrier(memory_rep), temps)
        } else {
            (ArchOpcode::RtStore(memory_rep), SmallVec::new())
        };
        self.emit(Instruction::new(
            InstructionCode::new(opcode).with_mode(mode),
            [],
            inputs,
            temps,
        ))
    }

    /// The addressing mode and inputs addressing `base + index << scale + displacement`, folding
    /// constant indices and covered constant additions into the displacement
    pub(super) fn memory_operand(
        &mut self,
        user: OpIndex,
        mut base: OpIndex,
        mut index: Option<OpIndex>,
        mut displacement: i32,
        scale: u8,
    ) -> (AddressingMode, MemoryOperands) {
        let graph = self.graph();
        if let Some(constant) = index.and_then(|index| graph.match_signed_integral_constant(index)) {
            let folded = constant
                .checked_shl(scale as u32)
                .and_then(|scaled| scaled.checked_add(displacement as i64))
                .and_then(|value| i32::try_from(value).ok());
            if let Some(folded) = folded {
                index = None;
                displacement = folded;
            }
        }
        if self.can_cover(user, base) {
            if let Some((left, right, WordBinopKind::Add, WordRepresentation::Word64)) =
                graph.match_word_binop(base)
            {
                let folded = graph
                    .match_signed_integral_constant(right)
                    .and_then(|value| value.checked_add(displacement as i64))
                    .and_then(|value| i32::try_from(value).ok());
                if let Some(folded) = folded {
                    base = left;
                    displacement = folded;
                }
            }
        }

        if index.is_none() && self.session().options.roots_relative_addressing {
            if let Some(ConstantKind::External(address)) = graph.match_constant(base) {
                let delta = (address as i64)
                    .checked_sub(Linkage::ROOTS_TABLE_ADDRESS as i64)
                    .and_then(|delta| delta.checked_add(displacement as i64))
                    .and_then(|delta| i32::try_from(delta).ok());
                if let Some(delta) = delta {
                    return (
                        AddressingMode::Root,
                        smallvec![InstructionOperand::Immediate(Immediate::Int32(delta))],
                    );
                }
            }
        }

        let displacement_operand = InstructionOperand::Immediate(Immediate::Int32(displacement));
        match index {
            None if displacement == 0 => (AddressingMode::MR, smallvec![self.use_register(base)]),
            None => (
                AddressingMode::MRI,
                smallvec![self.use_register(base), displacement_operand],
            ),
            Some(index) if graph.is_zero(base) => (
                AddressingMode::MnI(scale),
                smallvec![self.use_register(index), displacement_operand],
            ),
            Some(index) if displacement == 0 => (
                AddressingMode::MRn(scale),
                smallvec![self.use_register(base), self.use_register(index)],
            ),
            Some(index) => (
                AddressingMode::MRnI(scale),
                smallvec![
                    self.use_register(base),
                    self.use_register(index),
                    displacement_operand
                ],
            ),
        }
    }

    /// True if `op` is a load that `user` can read directly from memory as its right operand
    pub(super) fn can_use_memory_operand(
        &self,
        user: OpIndex,
        op: OpIndex,
        rep: WordRepresentation,
    ) -> bool {
        if !self.can_cover(user, op) {
            return false;
        }
        match *self.graph().get(op) {
            Operation::Load {
                loaded_rep,
                result_rep,
                ..
            } => matches!(
                (rep, loaded_rep, result_rep),
                (
                    WordRepresentation::Word32,
                    MemoryRepresentation::Int32 | MemoryRepresentation::Uint32,
                    RegisterRepresentation::Word32
                ) | (
                    WordRepresentation::Word64,
                    MemoryRepresentation::Int64 | MemoryRepresentation::Uint64,
                    RegisterRepresentation::Word64
                )
            ),
            _ => false,
        }
    }

    pub(super) fn try_memory_operand(
        &mut self,
        user: OpIndex,
        op: OpIndex,
        rep: WordRepresentation,
    ) -> Option<(AddressingMode, MemoryOperands)> {
        if !self.can_use_memory_operand(user, op, rep) {
            return None;
        }
        let Operation::Load {
            base,
            index,
            offset,
            element_size_log2,
            ..
        } = *self.graph().get(op)
        else {
            return None;
        };
        self.mark_as_defined(op);
        Some(self.memory_operand(op, base, index, offset, element_size_log2))
    }

    fn visit_switch(
        &mut self,
        input: OpIndex,
        cases: &[SwitchCase],
        default: BlockIndex,
    ) -> Result<(), BailoutReason> {
        let case_count = cases.len() as u64;
        let min = cases.iter().map(|case| case.value).min().unwrap_or(0);
        let max = cases.iter().map(|case| case.value).max().unwrap_or(0);
        let value_range = (max as i64 - min as i64 + 1) as u64;

        let table_space_cost = 4 + value_range;
        let table_time_cost = 3;
        let lookup_space_cost = 3 + 2 * case_count;
        let lookup_time_cost = case_count;
        let use_table = self.session().options.switch_jump_table
            && case_count > 4
            && table_space_cost + 3 * table_time_cost <= lookup_space_cost + 3 * lookup_time_cost
            && min > i32::MIN
            && value_range <= MAX_TABLE_SWITCH_VALUE_RANGE;

        if use_table {
            log::trace!(target: "isel", "switch on {input}: table of {value_range} entries");
            let value = self.use_register(input);
            let index = if min == 0 {
                value
            } else {
                let vreg = self.sequence.new_vreg(RegisterRepresentation::Word32);
                let output = InstructionOperand::Unallocated(UnallocatedOperand::new(
                    vreg,
                    OperandPolicy::MustHaveRegister,
                ));
                self.emit(Instruction::new(
                    InstructionCode::new(ArchOpcode::RtLea(WordRepresentation::Word32))
                        .with_mode(AddressingMode::MRI),
                    [output],
                    [value, InstructionOperand::Immediate(Immediate::Int32(-min))],
                    [],
                ))?;
                output
            };
            let mut targets = vec![default; value_range as usize];
            for case in cases {
                targets[(case.value as i64 - min as i64) as usize] = case.destination;
            }
            let mut inputs: SmallVec<[InstructionOperand; 4]> =
                smallvec![index, block_operand(default)];
            inputs.extend(targets.into_iter().map(block_operand));
            return self.emit(Instruction::new(ArchOpcode::ArchTableSwitch, [], inputs, []));
        }

        log::trace!(target: "isel", "switch on {input}: binary search over {case_count} cases");
        let mut sorted = cases.to_vec();
        sorted.sort_by_key(|case| case.value);
        let mut inputs: SmallVec<[InstructionOperand; 4]> =
            smallvec![self.use_register(input), block_operand(default)];
        for case in sorted {
            inputs.push(InstructionOperand::Immediate(Immediate::Int32(case.value)));
            inputs.push(block_operand(case.destination));
        }
        self.emit(Instruction::new(ArchOpcode::ArchBinarySearchSwitch, [], inputs, []))
    }
}
