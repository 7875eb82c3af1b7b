//! Construction of [Graph]s.
//!
//! [GraphBuilder] plays the role of an assembler: blocks are created up front with
//! [GraphBuilder::new_block], then bound one at a time, and operations are emitted into the
//! currently bound block. Emitting a terminator closes the block and registers it as a
//! predecessor of its successors. Edges that would violate split-edge form are split on the fly by
//! inserting a block containing only a `Goto`.
//!
//! Binding a block that has no predecessors (other than the entry block) fails, and the builder
//! then ignores everything emitted until the next successful bind, returning [OpIndex::INVALID]
//! for those operations. This is how code that becomes unreachable during a transformation is
//! dropped.

use std::sync::Arc;

use cranelift_entity::{PrimaryMap, SecondaryMap, packed_option::PackedOption};
use smallvec::SmallVec;

use crate::{
    Block, BlockIndex, BlockKind, BranchHint, CallDescriptor, ChangeKind, ComparisonKind,
    ConstantKind, DeoptimizeReason, FloatBinopKind, FloatRepresentation, FloatUnaryKind,
    FrameStateInfo, FxHashMap, Graph, MemoryRepresentation, OpIndex, Operation,
    OverflowCheckedBinopKind, RegisterRepresentation, SelectImplementation, ShiftKind,
    Simd128BinopKind, SourcePosition, StackCheckKind, SwitchCase, TrapId, WordBinopKind,
    WordRepresentation, WriteBarrierKind,
};

#[derive(Default)]
pub struct GraphBuilder {
    graph: Graph,
    current_block: Option<BlockIndex>,
    bind_order: Vec<BlockIndex>,
    /// Maps blocks inserted to split an edge to the block the edge originally started from
    split_edge_sources: FxHashMap<BlockIndex, BlockIndex>,
    current_position: SourcePosition,
    pending_loop_phis: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph built so far. Block indices are not final until [GraphBuilder::finish].
    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[inline]
    pub fn get(&self, op: OpIndex) -> &Operation {
        self.graph.get(op)
    }

    #[inline]
    pub fn block(&self, block: BlockIndex) -> &Block {
        &self.graph.blocks[block]
    }

    /// Create a new, unbound merge block
    pub fn new_block(&mut self) -> BlockIndex {
        self.create_block(BlockKind::Merge)
    }

    /// Create a new, unbound loop header
    pub fn new_loop_header(&mut self) -> BlockIndex {
        self.create_block(BlockKind::Loop)
    }

    fn create_block(&mut self, kind: BlockKind) -> BlockIndex {
        let index = self.graph.blocks.next_key();
        self.graph.blocks.push(Block::new(index, kind))
    }

    /// Start emitting operations into `block`.
    ///
    /// Returns false if `block` is unreachable, i.e. it is not the entry block and has no
    /// predecessors. Operations emitted until the next bind are then dropped.
    pub fn bind(&mut self, block: BlockIndex) -> bool {
        assert!(
            self.current_block.is_none(),
            "cannot bind {block}: {} has not been terminated",
            self.current_block.map(|b| b.to_string()).unwrap_or_default()
        );
        let is_entry = self.bind_order.is_empty();
        let next_op = OpIndex::from_u32(self.graph.operations.len() as u32);
        let data = &mut self.graph.blocks[block];
        assert!(!data.bound, "{block} is already bound");
        if !is_entry && data.predecessors.is_empty() {
            log::trace!(target: "graph-builder", "{block} is unreachable");
            return false;
        }
        data.bound = true;
        data.begin = next_op;
        data.end = next_op;
        self.bind_order.push(block);
        self.current_block = Some(block);
        true
    }

    #[inline]
    pub fn current_block(&self) -> Option<BlockIndex> {
        self.current_block
    }

    /// True if there is no block to emit into
    #[inline]
    pub fn generating_unreachable_operations(&self) -> bool {
        self.current_block.is_none()
    }

    /// The block an edge leaving `block` originally started from, looking through blocks that
    /// were inserted to split edges
    pub fn edge_source(&self, block: BlockIndex) -> BlockIndex {
        let mut block = block;
        while let Some(source) = self.split_edge_sources.get(&block) {
            block = *source;
        }
        block
    }

    /// True if `block` was inserted by the builder to split an edge
    pub fn is_split_edge_block(&self, block: BlockIndex) -> bool {
        self.split_edge_sources.contains_key(&block)
    }

    /// Set the source position attached to subsequently emitted operations
    pub fn set_current_position(&mut self, position: SourcePosition) {
        self.current_position = position;
    }

    /// Append `op` to the current block.
    ///
    /// Emitting a terminator closes the block and adds it as a predecessor of each successor.
    pub fn emit(&mut self, op: Operation) -> OpIndex {
        let Some(block) = self.current_block else {
            return OpIndex::INVALID;
        };
        let op = match op {
            Operation::Branch {
                if_true, if_false, ..
            } if if_true == if_false => Operation::Goto {
                destination: if_true,
                is_backedge: false,
            },
            Operation::Goto { destination, .. } => Operation::Goto {
                destination,
                is_backedge: self.graph.blocks[destination].bound,
            },
            op => op,
        };
        debug_assert!(
            op.inputs().iter().all(|input| input.is_valid()
                && (input.id() as usize) < self.graph.operations.len()),
            "{} has an invalid input",
            op.name()
        );
        if let Operation::PendingLoopPhi { .. } = op {
            assert!(self.graph.blocks[block].is_loop(), "pending loop phi outside of a loop header");
            self.pending_loop_phis += 1;
        }

        let is_terminator = op.is_block_terminator();
        let successors = op.successors();
        let branching = op.is_branching();
        let index = self.graph.operations.push(op);
        self.graph.op_to_block[index] = block.into();
        if self.current_position.is_known() {
            self.graph.source_positions[index] = self.current_position;
        }
        if is_terminator {
            self.graph.blocks[block].end = index.next();
            self.current_block = None;
            for successor in successors {
                self.add_predecessor(block, successor, branching);
            }
        }
        index
    }

    fn add_predecessor(&mut self, source: BlockIndex, destination: BlockIndex, branch: bool) {
        let dest = &mut self.graph.blocks[destination];
        assert!(
            !dest.bound || dest.is_loop(),
            "cannot add predecessor {source} to bound block {destination}"
        );
        if dest.predecessors.is_empty() {
            if branch && dest.is_loop() {
                // Loop headers are only entered by gotos
                self.split_edge(source, destination);
            } else {
                dest.predecessors.push(source);
                if branch {
                    dest.kind = BlockKind::BranchTarget;
                }
            }
        } else if dest.is_branch_target() {
            // The destination becomes a merge, so the edge from its existing predecessor, which
            // ends in a branch, must be split first to preserve predecessor order.
            let pred = dest.predecessors.pop().expect("branch target with no predecessor");
            dest.kind = BlockKind::Merge;
            self.split_edge(pred, destination);
            if branch {
                self.split_edge(source, destination);
            } else {
                self.graph.blocks[destination].predecessors.push(source);
            }
        } else if branch {
            self.split_edge(source, destination);
        } else {
            dest.predecessors.push(source);
        }
    }

    fn split_edge(&mut self, source: BlockIndex, destination: BlockIndex) {
        let saved = self.current_block.take();
        let intermediate = self.create_block(BlockKind::BranchTarget);
        self.graph.blocks[intermediate].predecessors.push(source);

        let terminator = self.graph.blocks[source].terminator();
        let mut replaced = false;
        self.graph.operations[terminator].map_successors(|succ| {
            if !replaced && succ == destination {
                replaced = true;
                intermediate
            } else {
                succ
            }
        });
        debug_assert!(replaced, "{source} does not branch to {destination}");

        let origin = self.edge_source(source);
        self.split_edge_sources.insert(intermediate, origin);
        log::trace!(
            target: "graph-builder",
            "splitting edge {source} -> {destination} with {intermediate}"
        );
        let bound = self.bind(intermediate);
        debug_assert!(bound);
        self.emit(Operation::Goto {
            destination,
            is_backedge: false,
        });
        self.current_block = saved;
    }

    /// Turn a loop header that never received its backedge into a plain merge, resolving its
    /// pending loop phis to their forward inputs
    fn finalize_loop_without_backedge(&mut self, header: BlockIndex) {
        let block = &mut self.graph.blocks[header];
        debug_assert!(block.is_loop() && block.predecessors.len() < 2);
        block.kind = BlockKind::Merge;
        let ops = block.ops();
        for op in ops {
            if let Operation::PendingLoopPhi { first, rep } = self.graph.operations[op] {
                self.graph.operations[op] = Operation::Phi {
                    inputs: SmallVec::from_slice(&[first]),
                    rep,
                };
                self.pending_loop_phis -= 1;
            }
        }
    }

    /// Finish construction, renumbering blocks in the order they were bound
    pub fn finish(mut self) -> Graph {
        assert!(
            self.current_block.is_none(),
            "{} has not been terminated",
            self.current_block.map(|b| b.to_string()).unwrap_or_default()
        );
        let loops_without_backedge = self
            .bind_order
            .iter()
            .copied()
            .filter(|b| {
                let block = &self.graph.blocks[*b];
                block.is_loop() && block.predecessors.len() < 2
            })
            .collect::<SmallVec<[BlockIndex; 4]>>();
        for header in loops_without_backedge {
            self.finalize_loop_without_backedge(header);
        }
        assert_eq!(self.pending_loop_phis, 0, "unresolved pending loop phis");

        let mut renumber = SecondaryMap::<BlockIndex, PackedOption<BlockIndex>>::new();
        for (position, old) in self.bind_order.iter().enumerate() {
            renumber[*old] = BlockIndex::from_u32(position as u32).into();
        }
        let map = |block: BlockIndex| match renumber[block].expand() {
            Some(block) => block,
            None => panic!("{block} is referenced but was never bound"),
        };

        let mut blocks = PrimaryMap::with_capacity(self.bind_order.len());
        for old in self.bind_order.iter() {
            let mut block = self.graph.blocks[*old].clone();
            block.index = map(*old);
            block.predecessors.iter_mut().for_each(|pred| *pred = map(*pred));
            blocks.push(block);
        }
        for (index, block) in self.graph.blocks.iter() {
            assert!(
                block.bound || block.predecessors.is_empty(),
                "{index} has predecessors but was never bound"
            );
        }
        self.graph.blocks = blocks;

        let terminators = self.graph.blocks.values().map(Block::terminator).collect::<Vec<_>>();
        for terminator in terminators {
            self.graph.operations[terminator].map_successors(map);
        }
        for (_, block) in self.graph.op_to_block.iter_mut() {
            if let Some(old) = block.expand() {
                *block = map(old).into();
            }
        }
        self.graph
    }

    // Convenience constructors for individual operations

    pub fn constant(&mut self, kind: ConstantKind) -> OpIndex {
        self.emit(Operation::Constant { kind })
    }

    pub fn word32_constant(&mut self, value: u32) -> OpIndex {
        self.constant(ConstantKind::Word32(value))
    }

    pub fn word64_constant(&mut self, value: u64) -> OpIndex {
        self.constant(ConstantKind::Word64(value))
    }

    pub fn word_constant(&mut self, value: u64, rep: WordRepresentation) -> OpIndex {
        match rep {
            WordRepresentation::Word32 => self.word32_constant(value as u32),
            WordRepresentation::Word64 => self.word64_constant(value),
        }
    }

    pub fn float32_constant(&mut self, value: f32) -> OpIndex {
        self.constant(ConstantKind::Float32(value))
    }

    pub fn float64_constant(&mut self, value: f64) -> OpIndex {
        self.constant(ConstantKind::Float64(value))
    }

    pub fn heap_constant(&mut self, handle: u64) -> OpIndex {
        self.constant(ConstantKind::HeapObject(handle))
    }

    pub fn external_constant(&mut self, address: u64) -> OpIndex {
        self.constant(ConstantKind::External(address))
    }

    pub fn parameter(&mut self, index: u32, rep: RegisterRepresentation) -> OpIndex {
        self.emit(Operation::Parameter { index, rep })
    }

    pub fn word_binop(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        kind: WordBinopKind,
        rep: WordRepresentation,
    ) -> OpIndex {
        self.emit(Operation::WordBinop {
            left,
            right,
            kind,
            rep,
        })
    }

    pub fn word32_add(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.word_binop(left, right, WordBinopKind::Add, WordRepresentation::Word32)
    }

    pub fn word32_sub(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.word_binop(left, right, WordBinopKind::Sub, WordRepresentation::Word32)
    }

    pub fn word32_mul(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.word_binop(left, right, WordBinopKind::Mul, WordRepresentation::Word32)
    }

    pub fn word32_bitwise_and(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.word_binop(left, right, WordBinopKind::BitwiseAnd, WordRepresentation::Word32)
    }

    pub fn word64_add(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.word_binop(left, right, WordBinopKind::Add, WordRepresentation::Word64)
    }

    pub fn word64_sub(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.word_binop(left, right, WordBinopKind::Sub, WordRepresentation::Word64)
    }

    pub fn overflow_checked_binop(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        kind: OverflowCheckedBinopKind,
        rep: WordRepresentation,
    ) -> OpIndex {
        self.emit(Operation::OverflowCheckedBinop {
            left,
            right,
            kind,
            rep,
        })
    }

    pub fn projection(&mut self, input: OpIndex, index: u16, rep: RegisterRepresentation) -> OpIndex {
        self.emit(Operation::Projection { input, index, rep })
    }

    pub fn float_binop(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        kind: FloatBinopKind,
        rep: FloatRepresentation,
    ) -> OpIndex {
        self.emit(Operation::FloatBinop {
            left,
            right,
            kind,
            rep,
        })
    }

    pub fn float_unary(
        &mut self,
        input: OpIndex,
        kind: FloatUnaryKind,
        rep: FloatRepresentation,
    ) -> OpIndex {
        self.emit(Operation::FloatUnary { input, kind, rep })
    }

    pub fn shift(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        kind: ShiftKind,
        rep: WordRepresentation,
    ) -> OpIndex {
        self.emit(Operation::Shift {
            left,
            right,
            kind,
            rep,
        })
    }

    pub fn equal(&mut self, left: OpIndex, right: OpIndex, rep: RegisterRepresentation) -> OpIndex {
        self.emit(Operation::Equal { left, right, rep })
    }

    pub fn word32_equal(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.equal(left, right, RegisterRepresentation::Word32)
    }

    pub fn comparison(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        kind: ComparisonKind,
        rep: RegisterRepresentation,
    ) -> OpIndex {
        self.emit(Operation::Comparison {
            left,
            right,
            kind,
            rep,
        })
    }

    pub fn int32_less_than(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.comparison(
            left,
            right,
            ComparisonKind::SignedLessThan,
            RegisterRepresentation::Word32,
        )
    }

    pub fn int32_less_than_or_equal(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.comparison(
            left,
            right,
            ComparisonKind::SignedLessThanOrEqual,
            RegisterRepresentation::Word32,
        )
    }

    pub fn uint32_less_than(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.comparison(
            left,
            right,
            ComparisonKind::UnsignedLessThan,
            RegisterRepresentation::Word32,
        )
    }

    pub fn change(
        &mut self,
        input: OpIndex,
        kind: ChangeKind,
        from: RegisterRepresentation,
        to: RegisterRepresentation,
    ) -> OpIndex {
        self.emit(Operation::Change {
            input,
            kind,
            from,
            to,
        })
    }

    pub fn tagged_bitcast(
        &mut self,
        input: OpIndex,
        from: RegisterRepresentation,
        to: RegisterRepresentation,
    ) -> OpIndex {
        self.emit(Operation::TaggedBitcast { input, from, to })
    }

    pub fn select(
        &mut self,
        cond: OpIndex,
        vtrue: OpIndex,
        vfalse: OpIndex,
        rep: RegisterRepresentation,
        implem: SelectImplementation,
    ) -> OpIndex {
        self.emit(Operation::Select {
            cond,
            vtrue,
            vfalse,
            rep,
            implem,
        })
    }

    pub fn load(
        &mut self,
        base: OpIndex,
        index: Option<OpIndex>,
        loaded_rep: MemoryRepresentation,
        offset: i32,
        element_size_log2: u8,
    ) -> OpIndex {
        self.emit(Operation::Load {
            base,
            index,
            loaded_rep,
            result_rep: loaded_rep.to_register_representation(),
            offset,
            element_size_log2,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        base: OpIndex,
        index: Option<OpIndex>,
        value: OpIndex,
        stored_rep: MemoryRepresentation,
        write_barrier: WriteBarrierKind,
        offset: i32,
        element_size_log2: u8,
    ) -> OpIndex {
        self.emit(Operation::Store {
            base,
            index,
            value,
            stored_rep,
            write_barrier,
            offset,
            element_size_log2,
        })
    }

    pub fn phi(
        &mut self,
        inputs: impl IntoIterator<Item = OpIndex>,
        rep: RegisterRepresentation,
    ) -> OpIndex {
        let inputs: SmallVec<[OpIndex; 2]> = inputs.into_iter().collect();
        if let Some(block) = self.current_block {
            debug_assert!(
                self.graph.blocks[block].is_loop()
                    || inputs.len() == self.graph.blocks[block].predecessors.len(),
                "phi in {block} has {} inputs for {} predecessors",
                inputs.len(),
                self.graph.blocks[block].predecessors.len()
            );
        }
        self.emit(Operation::Phi { inputs, rep })
    }

    /// Emit a loop phi whose backedge input is supplied later with [GraphBuilder::fix_loop_phi]
    pub fn pending_loop_phi(&mut self, first: OpIndex, rep: RegisterRepresentation) -> OpIndex {
        self.emit(Operation::PendingLoopPhi { first, rep })
    }

    /// Replace the pending loop phi `phi` with a phi of its forward input and `backedge`
    pub fn fix_loop_phi(&mut self, phi: OpIndex, backedge: OpIndex) {
        match self.graph.operations[phi] {
            Operation::PendingLoopPhi { first, rep } => {
                self.graph.operations[phi] = Operation::Phi {
                    inputs: SmallVec::from_slice(&[first, backedge]),
                    rep,
                };
                self.pending_loop_phis -= 1;
            }
            ref other => panic!("{phi} is not a pending loop phi: {}", other.name()),
        }
    }

    pub fn frame_state(
        &mut self,
        inputs: impl IntoIterator<Item = OpIndex>,
        info: Arc<FrameStateInfo>,
    ) -> OpIndex {
        self.emit(Operation::FrameState {
            inputs: inputs.into_iter().collect(),
            info,
        })
    }

    pub fn call(
        &mut self,
        callee: OpIndex,
        frame_state: Option<OpIndex>,
        arguments: impl IntoIterator<Item = OpIndex>,
        descriptor: Arc<CallDescriptor>,
    ) -> OpIndex {
        self.emit(Operation::Call {
            callee,
            frame_state,
            arguments: arguments.into_iter().collect(),
            descriptor,
        })
    }

    pub fn stack_check(&mut self, kind: StackCheckKind) -> OpIndex {
        self.emit(Operation::StackCheck { kind })
    }

    pub fn stack_pointer_greater_than(&mut self, limit: OpIndex, kind: StackCheckKind) -> OpIndex {
        self.emit(Operation::StackPointerGreaterThan { limit, kind })
    }

    pub fn load_stack_check_offset(&mut self) -> OpIndex {
        self.emit(Operation::LoadStackCheckOffset)
    }

    pub fn simd128_constant(&mut self, value: [u8; 16]) -> OpIndex {
        self.emit(Operation::Simd128Constant { value })
    }

    pub fn simd128_binop(
        &mut self,
        left: OpIndex,
        right: OpIndex,
        kind: Simd128BinopKind,
    ) -> OpIndex {
        self.emit(Operation::Simd128Binop { left, right, kind })
    }

    pub fn retain(&mut self, value: OpIndex) -> OpIndex {
        self.emit(Operation::Retain { value })
    }

    pub fn deoptimize_if(
        &mut self,
        condition: OpIndex,
        frame_state: OpIndex,
        negated: bool,
        reason: DeoptimizeReason,
    ) -> OpIndex {
        self.emit(Operation::DeoptimizeIf {
            condition,
            frame_state,
            negated,
            reason,
        })
    }

    pub fn trap_if(&mut self, condition: OpIndex, negated: bool, trap: TrapId) -> OpIndex {
        self.emit(Operation::TrapIf {
            condition,
            negated,
            trap,
        })
    }

    pub fn goto(&mut self, destination: BlockIndex) -> OpIndex {
        self.emit(Operation::Goto {
            destination,
            is_backedge: false,
        })
    }

    pub fn branch(&mut self, condition: OpIndex, if_true: BlockIndex, if_false: BlockIndex) -> OpIndex {
        self.branch_with_hint(condition, if_true, if_false, BranchHint::None)
    }

    pub fn branch_with_hint(
        &mut self,
        condition: OpIndex,
        if_true: BlockIndex,
        if_false: BlockIndex,
        hint: BranchHint,
    ) -> OpIndex {
        self.emit(Operation::Branch {
            condition,
            if_true,
            if_false,
            hint,
        })
    }

    pub fn switch(
        &mut self,
        input: OpIndex,
        cases: impl IntoIterator<Item = SwitchCase>,
        default: BlockIndex,
    ) -> OpIndex {
        self.emit(Operation::Switch {
            input,
            cases: cases.into_iter().collect(),
            default,
            default_hint: BranchHint::None,
        })
    }

    /// Return `values`, popping no additional stack arguments
    pub fn return_(&mut self, values: impl IntoIterator<Item = OpIndex>) -> OpIndex {
        let pop_count = self.word32_constant(0);
        self.emit(Operation::Return {
            pop_count,
            values: values.into_iter().collect(),
        })
    }

    pub fn deoptimize(&mut self, frame_state: OpIndex, reason: DeoptimizeReason) -> OpIndex {
        self.emit(Operation::Deoptimize {
            frame_state,
            reason,
        })
    }

    pub fn unreachable(&mut self) -> OpIndex {
        self.emit(Operation::Unreachable)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn branch_to_merge_splits_edges() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let left = b.new_block();
        let merge = b.new_block();

        b.bind(entry);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        b.branch(p, left, merge);
        b.bind(left);
        b.goto(merge);
        assert!(b.bind(merge));
        b.return_([p]);
        let graph = b.finish();

        // entry, left, the block splitting entry -> merge, merge
        assert_eq!(graph.block_count(), 4);
        let merge = graph.blocks().last().unwrap();
        assert!(merge.is_merge());
        assert_eq!(merge.predecessor_count(), 2);
        for pred in merge.predecessors() {
            assert!(matches!(graph.terminator(*pred), Operation::Goto { .. }));
        }
        let (if_true, if_false) = match graph.terminator(graph.entry_block()) {
            Operation::Branch {
                if_true, if_false, ..
            } => (*if_true, *if_false),
            _ => panic!("expected branch"),
        };
        assert!(graph.block(if_true).is_branch_target());
        assert!(graph.block(if_false).is_branch_target());
        assert_eq!(graph.block(if_false).predecessor_count(), 1);
    }

    #[test]
    fn loop_header_predecessor_order() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let header = b.new_loop_header();
        let body = b.new_block();
        let exit = b.new_block();

        b.bind(entry);
        let zero = b.word32_constant(0);
        let one = b.word32_constant(1);
        let ten = b.word32_constant(10);
        b.goto(header);
        b.bind(header);
        let i = b.pending_loop_phi(zero, RegisterRepresentation::Word32);
        let cond = b.int32_less_than(i, ten);
        b.branch(cond, body, exit);
        b.bind(body);
        let next = b.word32_add(i, one);
        b.fix_loop_phi(i, next);
        b.goto(header);
        b.bind(exit);
        b.return_([i]);
        let graph = b.finish();

        let header = graph.block(BlockIndex::from_u32(1));
        assert!(header.is_loop());
        assert_eq!(header.forward_predecessor(), Some(graph.entry_block()));
        assert_eq!(header.backedge_predecessor(), Some(BlockIndex::from_u32(2)));
        match graph.terminator(BlockIndex::from_u32(2)) {
            Operation::Goto { is_backedge, .. } => assert!(*is_backedge),
            _ => panic!("expected goto"),
        }
        match graph.get(i) {
            Operation::Phi { inputs, .. } => assert_eq!(inputs.as_slice(), &[zero, next]),
            _ => panic!("expected phi"),
        }
    }

    #[test]
    fn unreachable_blocks_are_dropped() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let dead = b.new_block();
        b.bind(entry);
        let zero = b.word32_constant(0);
        b.return_([zero]);
        assert!(!b.bind(dead));
        assert!(b.generating_unreachable_operations());
        assert_eq!(b.word32_constant(1), OpIndex::INVALID);
        let graph = b.finish();
        assert_eq!(graph.block_count(), 1);
        assert_eq!(graph.op_count(), 3);
    }
}
