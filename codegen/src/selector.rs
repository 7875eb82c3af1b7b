//! Instruction selection: lowers a [Graph] to an [InstructionSequence] for the reference target.
//!
//! Blocks are visited from last to first, and the operations of a block from its terminator
//! upwards. When an operation is visited, its consumers have been selected already, so an
//! operation that some consumer folded into its own instruction (a memory operand, a comparison
//! feeding a branch) is never marked as used and gets skipped. The instructions emitted for each
//! operation are reversed as they are produced, and each block is reversed once complete, which
//! restores program order.

mod calls;
mod flags;
mod lower;

use shaftc_ir::{
    BlockIndex, ConstantKind, EntityRef, FxHashMap, Graph, OpIndex, Operation, PackedOption,
    RegisterRepresentation, SecondaryMap, SourcePosition,
};
use shaftc_session::{BailoutReason, OperandCountKind, Session, SourcePositionMode};

pub use self::flags::{ContinuationKind, FlagsContinuation};
use crate::{
    ArchOpcode, FlagsMode, Immediate, Instruction, InstructionBlock, InstructionOperand,
    InstructionSequence, Linkage, Location, OperandPolicy, Register, RpoNumber,
    UnallocatedOperand, VirtualRegister,
};

/// Select instructions for `graph`, the body of a function called through `linkage`
pub fn select_instructions(
    session: &Session,
    graph: &Graph,
    linkage: &Linkage,
) -> Result<InstructionSequence, BailoutReason> {
    InstructionSelector::new(session, graph, linkage).run()
}

pub struct InstructionSelector<'a> {
    session: &'a Session,
    graph: &'a Graph,
    linkage: &'a Linkage,
    sequence: InstructionSequence,
    use_counts: SecondaryMap<OpIndex, u32>,
    effect_levels: SecondaryMap<OpIndex, u32>,
    used: SecondaryMap<OpIndex, bool>,
    defined: SecondaryMap<OpIndex, bool>,
    vregs: SecondaryMap<OpIndex, PackedOption<VirtualRegister>>,
    renames: FxHashMap<VirtualRegister, VirtualRegister>,
    /// Instructions of the block being visited, in reverse order
    instructions: Vec<Instruction>,
    current_block: BlockIndex,
    current_op: OpIndex,
}

impl<'a> InstructionSelector<'a> {
    pub fn new(session: &'a Session, graph: &'a Graph, linkage: &'a Linkage) -> Self {
        Self {
            session,
            graph,
            linkage,
            sequence: InstructionSequence::new(linkage.descriptor().clone()),
            use_counts: graph.use_counts(),
            effect_levels: SecondaryMap::with_capacity(graph.op_count()),
            used: SecondaryMap::with_capacity(graph.op_count()),
            defined: SecondaryMap::with_capacity(graph.op_count()),
            vregs: SecondaryMap::with_capacity(graph.op_count()),
            renames: FxHashMap::default(),
            instructions: Vec::new(),
            current_block: graph.entry_block(),
            current_op: OpIndex::INVALID,
        }
    }

    pub fn run(mut self) -> Result<InstructionSequence, BailoutReason> {
        let graph = self.graph;
        for block in graph.blocks() {
            let rpo = RpoNumber::new(block.index().index());
            let mut instruction_block = InstructionBlock::new(rpo);
            instruction_block.is_loop_header = block.is_loop();
            instruction_block.predecessors =
                block.predecessors().iter().map(|pred| RpoNumber::new(pred.index())).collect();
            instruction_block.successors = graph
                .successors(block.index())
                .into_iter()
                .map(|succ| RpoNumber::new(succ.index()))
                .collect();
            self.sequence.blocks.push(instruction_block);

            // The values flowing into a loop header along its backedge are defined in blocks that
            // are visited before the header's phis
            if block.is_loop() {
                for (_, op) in graph.operations(block.index()) {
                    if let Operation::Phi { inputs, .. } = op {
                        inputs.iter().for_each(|input| self.mark_as_used(*input));
                    }
                }
            }
        }

        let mut blocks = Vec::with_capacity(graph.block_count());
        for block in graph.block_indices().rev() {
            self.visit_block(block)?;
            let mut instructions = core::mem::take(&mut self.instructions);
            instructions.reverse();
            blocks.push((block, instructions));
        }

        for (block, instructions) in blocks.into_iter().rev() {
            let rpo = RpoNumber::new(block.index());
            let code_start = self.sequence.instructions.len();
            for mut instruction in instructions {
                instruction.block = rpo;
                self.sequence.instructions.push(instruction);
            }
            let data = &mut self.sequence.blocks[rpo];
            data.code_start = code_start;
            data.code_end = self.sequence.instructions.len();
        }

        self.apply_renames();
        log::debug!(
            target: "isel",
            "selected {} instructions in {} blocks using {} virtual registers",
            self.sequence.instructions.len(),
            self.sequence.block_count(),
            self.sequence.vreg_count()
        );
        log::trace!(target: "isel", "instruction sequence:\n{}", self.sequence);
        Ok(self.sequence)
    }

    fn visit_block(&mut self, block: BlockIndex) -> Result<(), BailoutReason> {
        let graph = self.graph;
        self.current_block = block;

        let mut effect_level = 0;
        for (index, op) in graph.operations(block) {
            self.effect_levels[index] = effect_level;
            let properties = op.properties();
            if properties.can_write || properties.non_memory_side_effects {
                effect_level += 1;
            }
        }

        for (index, op) in graph.operations(block).rev() {
            if !self.is_used(index) || self.is_defined(index) {
                continue;
            }
            self.current_op = index;
            let start = self.instructions.len();
            self.visit_operation(index, op)?;
            self.instructions[start..].reverse();
        }
        Ok(())
    }

    /// True if `input` may be folded into the instruction selected for `user`.
    ///
    /// That requires `user` to be the only use of `input`, and no side effect may happen between
    /// the two unless `input` is pure.
    pub fn can_cover(&self, user: OpIndex, input: OpIndex) -> bool {
        let graph = self.graph;
        if graph.block_of(input) != graph.block_of(user) {
            return false;
        }
        if self.use_counts[input] != 1 {
            return false;
        }
        self.effect_levels[input] == self.effect_levels[user] || graph.get(input).is_pure()
    }

    pub fn is_used(&self, op: OpIndex) -> bool {
        let operation = self.graph.get(op);
        operation.is_constant()
            || matches!(operation, Operation::Simd128Constant { .. })
            || operation.is_required_when_unused()
            || self.used[op]
    }

    #[inline]
    pub fn is_defined(&self, op: OpIndex) -> bool {
        self.defined[op]
    }

    #[inline]
    fn mark_as_used(&mut self, op: OpIndex) {
        self.used[op] = true;
    }

    #[inline]
    fn mark_as_defined(&mut self, op: OpIndex) {
        self.defined[op] = true;
    }

    /// The virtual register holding the (first) value of `op`
    fn vreg(&mut self, op: OpIndex) -> VirtualRegister {
        if let Some(vreg) = self.vregs[op].expand() {
            return vreg;
        }
        let rep = self.graph.get(op).output_rep().unwrap_or(RegisterRepresentation::Word32);
        let vreg = self.sequence.new_vreg(rep);
        self.vregs[op] = vreg.into();
        vreg
    }

    fn rename(&mut self, from: OpIndex, to: OpIndex) {
        let from = self.vreg(from);
        let to = self.vreg(to);
        if from != to {
            self.renames.insert(from, to);
        }
    }

    fn apply_renames(&mut self) {
        if self.renames.is_empty() {
            return;
        }
        let renames = &self.renames;
        let resolve = |mut vreg: VirtualRegister| {
            while let Some(next) = renames.get(&vreg) {
                vreg = *next;
            }
            vreg
        };
        for instruction in self.sequence.instructions.iter_mut() {
            for operand in instruction.operands_mut() {
                match operand {
                    InstructionOperand::Unallocated(unallocated) => {
                        unallocated.vreg = resolve(unallocated.vreg);
                    }
                    InstructionOperand::Constant(vreg) => *vreg = resolve(*vreg),
                    _ => (),
                }
            }
        }
        for block in self.sequence.blocks.values_mut() {
            for phi in block.phis.iter_mut() {
                for operand in phi.operands.iter_mut() {
                    *operand = resolve(*operand);
                }
            }
        }
    }

    // Operand constructors

    fn unallocated(&mut self, op: OpIndex, policy: OperandPolicy) -> InstructionOperand {
        self.mark_as_used(op);
        InstructionOperand::Unallocated(UnallocatedOperand::new(self.vreg(op), policy))
    }

    pub(crate) fn use_register(&mut self, op: OpIndex) -> InstructionOperand {
        self.unallocated(op, OperandPolicy::MustHaveRegister)
    }

    /// A register input that is read before any output is written, so its register may be reused
    pub(crate) fn use_register_at_start(&mut self, op: OpIndex) -> InstructionOperand {
        self.mark_as_used(op);
        InstructionOperand::Unallocated(UnallocatedOperand::at_start(
            self.vreg(op),
            OperandPolicy::MustHaveRegister,
        ))
    }

    /// Any location will do, including the constant itself
    pub(crate) fn use_any(&mut self, op: OpIndex) -> InstructionOperand {
        if self.graph.get(op).is_constant() {
            self.mark_as_used(op);
            return InstructionOperand::Constant(self.vreg(op));
        }
        self.unallocated(op, OperandPolicy::Any)
    }

    pub(crate) fn use_fixed(&mut self, op: OpIndex, location: Location) -> InstructionOperand {
        self.unallocated(op, OperandPolicy::Fixed(location))
    }

    pub(crate) fn can_be_immediate(&self, op: OpIndex) -> bool {
        match self.graph.match_constant(op) {
            Some(ConstantKind::Word32(_)) => true,
            Some(ConstantKind::Word64(value)) => i32::try_from(value as i64).is_ok(),
            _ => false,
        }
    }

    /// The immediate for a constant accepted by [Self::can_be_immediate]
    pub(crate) fn use_immediate(&self, op: OpIndex) -> InstructionOperand {
        let value = match self.graph.match_constant(op) {
            Some(ConstantKind::Word32(value)) => value as i32,
            Some(ConstantKind::Word64(value)) => value as i64 as i32,
            other => unreachable!("{other:?} cannot be encoded as an immediate"),
        };
        InstructionOperand::Immediate(Immediate::Int32(value))
    }

    pub(crate) fn use_register_or_immediate(&mut self, op: OpIndex) -> InstructionOperand {
        if self.can_be_immediate(op) {
            self.use_immediate(op)
        } else {
            self.use_register(op)
        }
    }

    fn define(&mut self, op: OpIndex, policy: OperandPolicy) -> InstructionOperand {
        self.mark_as_defined(op);
        InstructionOperand::Unallocated(UnallocatedOperand::new(self.vreg(op), policy))
    }

    pub(crate) fn define_as_register(&mut self, op: OpIndex) -> InstructionOperand {
        self.define(op, OperandPolicy::MustHaveRegister)
    }

    pub(crate) fn define_same_as_first(&mut self, op: OpIndex) -> InstructionOperand {
        self.define(op, OperandPolicy::SameAsInput(0))
    }

    pub(crate) fn define_as_fixed(&mut self, op: OpIndex, location: Location) -> InstructionOperand {
        self.define(op, OperandPolicy::Fixed(location))
    }

    pub(crate) fn temp_register(&mut self, rep: RegisterRepresentation) -> InstructionOperand {
        let vreg = self.sequence.new_vreg(rep);
        InstructionOperand::Unallocated(UnallocatedOperand::new(
            vreg,
            OperandPolicy::MustHaveRegister,
        ))
    }

    pub(crate) fn temp_fixed(&mut self, reg: Register, rep: RegisterRepresentation) -> InstructionOperand {
        let vreg = self.sequence.new_vreg(rep);
        InstructionOperand::Unallocated(UnallocatedOperand::new(
            vreg,
            OperandPolicy::Fixed(Location::Register(reg)),
        ))
    }

    /// Append `instruction` to the current block, checking the operand limits of the target
    pub(crate) fn emit(&mut self, mut instruction: Instruction) -> Result<(), BailoutReason> {
        let limits = [
            (OperandCountKind::Output, instruction.outputs.len(), Instruction::MAX_OUTPUT_COUNT),
            (OperandCountKind::Input, instruction.inputs.len(), Instruction::MAX_INPUT_COUNT),
            (OperandCountKind::Temp, instruction.temps.len(), Instruction::MAX_TEMP_COUNT),
        ];
        for (kind, count, limit) in limits {
            if count > limit {
                log::debug!(
                    target: "isel",
                    "bailing out at {}: {count} {kind} operands exceed {limit}",
                    self.current_op
                );
                return Err(BailoutReason::InstructionSelectionFailed { kind, count, limit });
            }
        }

        let position = self.graph.source_position(self.current_op);
        if position.is_known() && self.records_source_position(&instruction) {
            instruction.source_position = position;
        } else {
            instruction.source_position = SourcePosition::UNKNOWN;
        }
        log::trace!(target: "isel", "{}: {instruction}", self.current_op);
        self.instructions.push(instruction);
        Ok(())
    }

    fn records_source_position(&self, instruction: &Instruction) -> bool {
        match self.session.options.source_positions {
            SourcePositionMode::All => true,
            SourcePositionMode::Calls => {
                instruction.is_call()
                    || matches!(
                        instruction.opcode(),
                        ArchOpcode::ArchDeoptimize | ArchOpcode::ArchStackCheck
                    )
                    || matches!(instruction.flags_mode(), FlagsMode::Deoptimize | FlagsMode::Trap)
            }
        }
    }

    pub(crate) fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub(crate) fn session(&self) -> &'a Session {
        self.session
    }
}
