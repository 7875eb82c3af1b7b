//! The copying phase: every reducer runs by rebuilding the input graph block by block into a fresh
//! output graph, and may replace any operation on the way.
//!
//! Input values are mapped to output values through two tables. Operations copied once, in the
//! normal visit of their block, are recorded in a stable table. Operations that get copied more
//! than once (because a reducer cloned the blocks defining them) are recorded in an overlay, which
//! is snapshotted at the end of every output block. When a block with several predecessors is
//! bound, the snapshots of its predecessors are merged, and values that differ between them are
//! joined by a new phi.

use shaftc_ir::{
    BlockIndex, ChangeKind, FxHashMap, FxHashSet, Graph, GraphBuilder, OpIndex, Operation, PackedOption,
    RegisterRepresentation, SecondaryMap, SmallVec, StackCheckKind, WordRepresentation,
};
use shaftc_ir_analysis::DominatorTree;

type Overlay = FxHashMap<OpIndex, OpIndex>;

/// How a [Reducer] handled an operation of the input graph
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// Copy the operation, mapping its inputs and successors to the output graph
    Copy,
    /// The reducer emitted the operation itself. The input operation now maps to the given index,
    /// which is [OpIndex::INVALID] if it was dropped or produces no value.
    Replace(OpIndex),
}

/// A graph-to-graph transformation driven by a [CopyingPhase].
pub trait Reducer {
    fn name(&self) -> &'static str;

    /// Decide how to copy `op`, the operation at `index` of the input graph.
    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        index: OpIndex,
        op: &Operation,
    ) -> Reduction;
}

/// Options for [CopyingPhase::clone_sub_graph]
#[derive(Debug, Default, Copy, Clone)]
pub struct CloneOptions {
    /// Keep the header of the cloned region a loop header
    pub keep_loop_kinds: bool,
    /// Drop loop iteration stack checks from the clone
    pub skip_stack_checks: bool,
}

struct CloneRegion {
    header: BlockIndex,
    blocks: FxHashMap<BlockIndex, BlockIndex>,
}

pub struct CopyingPhase<'a> {
    input: &'a Graph,
    builder: GraphBuilder,
    domtree: DominatorTree,
    /// The output block created for each input block
    block_map: SecondaryMap<BlockIndex, PackedOption<BlockIndex>>,
    /// The input block each output block was created for
    origins: SecondaryMap<BlockIndex, PackedOption<BlockIndex>>,
    op_map: SecondaryMap<OpIndex, PackedOption<OpIndex>>,
    overlay: Overlay,
    snapshots: FxHashMap<BlockIndex, Overlay>,
    /// Operations used by a phi or from another block
    used_across_blocks: SecondaryMap<OpIndex, bool>,
    /// The pending phis of every output loop header, with the input phi each was created for
    loop_phis: FxHashMap<BlockIndex, SmallVec<[(OpIndex, OpIndex); 4]>>,
    current_input_block: PackedOption<BlockIndex>,
    clone: Option<CloneRegion>,
    /// Record every definition in the overlay
    cloning: bool,
    skip_stack_checks: bool,
}

impl<'a> CopyingPhase<'a> {
    fn new(input: &'a Graph) -> Self {
        let mut used_across_blocks = SecondaryMap::with_capacity(input.op_count());
        for (index, op) in input.all_operations() {
            let block = input.block_of(index);
            for value in op.inputs() {
                if op.is_phi() || input.block_of(value) != block {
                    used_across_blocks[value] = true;
                }
            }
        }
        Self {
            input,
            builder: GraphBuilder::new(),
            domtree: DominatorTree::new(input),
            block_map: SecondaryMap::with_capacity(input.block_count()),
            origins: SecondaryMap::new(),
            op_map: SecondaryMap::with_capacity(input.op_count()),
            overlay: Overlay::default(),
            snapshots: FxHashMap::default(),
            used_across_blocks,
            loop_phis: FxHashMap::default(),
            current_input_block: PackedOption::default(),
            clone: None,
            cloning: false,
            skip_stack_checks: false,
        }
    }

    /// Copy `input` into a new graph, letting `reducer` rewrite its operations
    pub fn run<R: Reducer + ?Sized>(input: &'a Graph, reducer: &mut R) -> Graph {
        log::debug!(target: "copying-phase", "running {}", reducer.name());
        let mut copier = Self::new(input);
        for block in input.blocks() {
            let output = if block.is_loop() {
                copier.builder.new_loop_header()
            } else {
                copier.builder.new_block()
            };
            copier.block_map[block.index()] = output.into();
        }
        for block in input.block_indices() {
            let output = copier.map_block(block);
            if !copier.bind_output(output, block) {
                log::trace!(target: "copying-phase", "{block} is unreachable");
                continue;
            }
            copier.visit_operations(reducer, block);
        }
        copier.builder.finish()
    }

    #[inline]
    pub fn input(&self) -> &'a Graph {
        self.input
    }

    /// The builder of the output graph
    #[inline]
    pub fn builder(&mut self) -> &mut GraphBuilder {
        &mut self.builder
    }

    /// The output graph built so far
    #[inline]
    pub fn output(&self) -> &Graph {
        self.builder.graph()
    }

    /// The input block whose operations are currently being copied
    pub fn current_input_block(&self) -> Option<BlockIndex> {
        self.current_input_block.expand()
    }

    #[inline]
    pub fn generating_unreachable_operations(&self) -> bool {
        self.builder.generating_unreachable_operations()
    }

    /// The output value of the input operation `op`
    pub fn map_op(&self, op: OpIndex) -> OpIndex {
        match self.overlay.get(&op).copied().or_else(|| self.op_map[op].expand()) {
            Some(mapped) => mapped,
            None => panic!("{op} is used before it is defined in the output graph"),
        }
    }

    /// The output block control reaching the input block `block` continues in
    pub fn map_block(&self, block: BlockIndex) -> BlockIndex {
        if let Some(clone) = self.clone.as_ref() {
            if let Some(mapped) = clone.blocks.get(&block) {
                return *mapped;
            }
        }
        match self.block_map[block].expand() {
            Some(mapped) => mapped,
            None => panic!("{block} has no output block"),
        }
    }

    /// Create a block of the output graph that is part of the current input block, for reducers
    /// that expand an operation into control flow
    pub fn new_block(&mut self) -> BlockIndex {
        let block = self.builder.new_block();
        self.origins[block] = self.current_input_block;
        block
    }

    /// Bind a block created with [CopyingPhase::new_block]. Values keep their current mapping.
    pub fn bind_new_block(&mut self, block: BlockIndex) -> bool {
        self.builder.bind(block)
    }

    /// Emit `op` into the current output block
    pub fn emit(&mut self, op: Operation) -> OpIndex {
        if op.is_block_terminator() {
            self.emit_terminator(op)
        } else {
            self.builder.emit(op)
        }
    }

    pub fn goto(&mut self, destination: BlockIndex) -> OpIndex {
        self.emit_terminator(Operation::Goto {
            destination,
            is_backedge: false,
        })
    }

    fn emit_terminator(&mut self, op: Operation) -> OpIndex {
        let Some(current) = self.builder.current_block() else {
            return OpIndex::INVALID;
        };
        if !self.overlay.is_empty() {
            self.snapshots.insert(current, self.overlay.clone());
        }
        if let Operation::Goto { destination, .. } = op {
            let target = self.builder.block(destination);
            if target.is_bound() && target.is_loop() {
                self.fix_loop_phis(destination, current);
            }
        }
        self.builder.emit(op)
    }

    fn fix_loop_phis(&mut self, header: BlockIndex, latch: BlockIndex) {
        let Some(phis) = self.loop_phis.remove(&header) else {
            return;
        };
        let input_header = self.origin(header);
        let position = self.predecessor_position(input_header, latch);
        for (phi, input_phi) in phis {
            let value = match self.input.get(input_phi) {
                Operation::Phi { inputs, .. } => self.map_op(inputs[position]),
                other => panic!("{input_phi} is not a phi: {}", other.name()),
            };
            self.builder.fix_loop_phi(phi, value);
        }
    }

    fn origin(&self, block: BlockIndex) -> BlockIndex {
        match self.origins[block].expand() {
            Some(origin) => origin,
            None => panic!("output block {block} has no input block"),
        }
    }

    /// The position, among the predecessors of the input block `block`, of the input edge that
    /// the output predecessor `pred` was copied from
    fn predecessor_position(&self, block: BlockIndex, pred: BlockIndex) -> usize {
        let origin = self.origin(self.builder.edge_source(pred));
        match self.input.block(block).predecessor_position(origin) {
            Some(position) => position,
            None => panic!("{origin} is not a predecessor of {block}"),
        }
    }

    /// The value of the input operation `op` at the end of the output block `block`
    fn lookup_at_end_of(&self, block: BlockIndex, op: OpIndex) -> Option<OpIndex> {
        self.snapshots
            .get(&block)
            .and_then(|snapshot| snapshot.get(&op).copied())
            .or_else(|| self.op_map[op].expand())
    }

    /// True if a value of `op` recorded in a snapshot is still meaningful at the start of the
    /// input block `block`
    fn is_live_into(&self, op: OpIndex, block: BlockIndex) -> bool {
        let def = self.input.block_of(op);
        def != block && self.domtree.dominates(def, block)
    }

    fn bind_output(&mut self, output: BlockIndex, input_block: BlockIndex) -> bool {
        if !self.builder.bind(output) {
            return false;
        }
        self.origins[output] = input_block.into();
        self.current_input_block = input_block.into();
        self.merge_predecessor_values(output, input_block);
        true
    }

    fn merge_predecessor_values(&mut self, output: BlockIndex, input_block: BlockIndex) {
        let preds = self
            .builder
            .block(output)
            .predecessors()
            .iter()
            .map(|pred| self.builder.edge_source(*pred))
            .collect::<SmallVec<[BlockIndex; 4]>>();
        let mut merged = Overlay::default();
        match preds.as_slice() {
            [] => (),
            [pred] => {
                if let Some(snapshot) = self.snapshots.get(pred) {
                    merged.extend(
                        snapshot.iter().filter(|(op, _)| self.is_live_into(**op, input_block)),
                    );
                }
            }
            preds => {
                let mut keys = preds
                    .iter()
                    .filter_map(|pred| self.snapshots.get(pred))
                    .flat_map(|snapshot| snapshot.keys().copied())
                    .collect::<FxHashSet<_>>()
                    .into_iter()
                    .filter(|op| self.used_across_blocks[*op] && self.is_live_into(*op, input_block))
                    .collect::<Vec<_>>();
                keys.sort_unstable();
                for key in keys {
                    let Some(values) = preds
                        .iter()
                        .map(|pred| self.lookup_at_end_of(*pred, key))
                        .collect::<Option<SmallVec<[OpIndex; 4]>>>()
                    else {
                        continue;
                    };
                    if values.iter().all(|value| *value == values[0]) {
                        merged.insert(key, values[0]);
                        continue;
                    }
                    let outputs = self.input.get(key).outputs_rep();
                    let [rep] = outputs.as_slice() else {
                        continue;
                    };
                    let phi = self.builder.phi(values, *rep);
                    log::trace!(target: "copying-phase", "merged {key} into {phi} at {output}");
                    merged.insert(key, phi);
                }
            }
        }
        self.overlay = merged;
    }

    fn define(&mut self, op: OpIndex, value: OpIndex) {
        if !value.is_valid() {
            return;
        }
        if self.cloning || self.overlay.contains_key(&op) {
            self.overlay.insert(op, value);
        } else {
            self.op_map[op] = value.into();
        }
    }

    fn visit_operations<R: Reducer + ?Sized>(&mut self, reducer: &mut R, block: BlockIndex) {
        let input = self.input;
        for (index, op) in input.operations(block) {
            if self.builder.generating_unreachable_operations() {
                break;
            }
            self.visit_operation(reducer, index, op);
        }
    }

    fn visit_operation<R: Reducer + ?Sized>(
        &mut self,
        reducer: &mut R,
        index: OpIndex,
        op: &Operation,
    ) {
        if let Operation::Goto { destination, .. } = op {
            if self.clone.as_ref().is_some_and(|clone| clone.header == *destination) {
                // The backedge of a cloned region is left open for the caller to close
                return;
            }
        }
        self.builder.set_current_position(self.input.source_position(index));
        let value = match reducer.reduce(self, index, op) {
            Reduction::Copy => self.copy_operation(index, op),
            Reduction::Replace(value) => value,
        };
        self.define(index, value);
    }

    /// Copy `op` to the output graph, folding it if all of its inputs are constants
    pub fn copy_operation(&mut self, index: OpIndex, op: &Operation) -> OpIndex {
        match op {
            Operation::Phi { inputs, rep } => self.copy_phi(index, inputs, *rep),
            Operation::StackCheck {
                kind: StackCheckKind::LoopIteration,
            } if self.skip_stack_checks => OpIndex::INVALID,
            op => {
                let mut new = op.clone();
                new.map_inputs(|input| self.map_op(input));
                new.map_successors(|block| self.map_block(block));
                self.emit_or_fold(new)
            }
        }
    }

    /// Emit `op`, whose inputs are already output values, unless it folds to a constant or, for a
    /// branch on a constant, to a goto
    pub fn emit_or_fold(&mut self, op: Operation) -> OpIndex {
        match self.try_fold(&op) {
            Some(folded) => folded,
            None => self.emit(op),
        }
    }

    fn copy_phi(
        &mut self,
        index: OpIndex,
        inputs: &[OpIndex],
        rep: RegisterRepresentation,
    ) -> OpIndex {
        let Some(current) = self.builder.current_block() else {
            return OpIndex::INVALID;
        };
        let input_block = self.input.block_of(index);
        let preds = self.builder.block(current).predecessors().to_vec();
        if self.builder.block(current).is_loop() {
            // Only the forward edge exists yet
            let forward = self.builder.edge_source(preds[0]);
            let position = self.predecessor_position(input_block, forward);
            let first = self.value_at_end_of(forward, inputs[position]);
            let phi = self.builder.pending_loop_phi(first, rep);
            self.loop_phis.entry(current).or_default().push((phi, index));
            return phi;
        }
        let values = preds
            .iter()
            .map(|pred| {
                let source = self.builder.edge_source(*pred);
                let position = self.predecessor_position(input_block, source);
                self.value_at_end_of(source, inputs[position])
            })
            .collect::<SmallVec<[OpIndex; 4]>>();
        match values.as_slice() {
            [] => OpIndex::INVALID,
            [first, rest @ ..] if rest.iter().all(|value| value == first) => *first,
            _ => self.builder.phi(values, rep),
        }
    }

    fn value_at_end_of(&self, block: BlockIndex, op: OpIndex) -> OpIndex {
        match self.lookup_at_end_of(block, op) {
            Some(value) => value,
            None => panic!("{op} is not available at the end of {block}"),
        }
    }

    fn try_fold(&mut self, op: &Operation) -> Option<OpIndex> {
        let output = self.builder.graph();
        match *op {
            Operation::WordBinop {
                left,
                right,
                kind,
                rep,
            } => {
                let left = output.match_integral_word_constant(left, rep)?;
                let right = output.match_integral_word_constant(right, rep)?;
                let value = kind.fold(left, right, rep)?;
                Some(self.builder.word_constant(value, rep))
            }
            Operation::Shift {
                left,
                right,
                kind,
                rep,
            } => {
                let left = output.match_integral_word_constant(left, rep)?;
                let right = output.match_integral_constant(right)?;
                let value = kind.fold(left, right, rep);
                Some(self.builder.word_constant(value, rep))
            }
            Operation::Comparison {
                left,
                right,
                kind,
                rep,
            } => {
                let rep = rep.as_word()?;
                let left = output.match_integral_word_constant(left, rep)?;
                let right = output.match_integral_word_constant(right, rep)?;
                Some(self.builder.word32_constant(kind.fold(left, right, rep) as u32))
            }
            Operation::Change {
                input,
                kind,
                from,
                to,
            } => {
                let (from, to) = (from.as_word()?, to.as_word()?);
                let value = output.match_integral_word_constant(input, from)?;
                let value = match kind {
                    ChangeKind::ZeroExtend => value,
                    ChangeKind::SignExtend => to.truncate(from.sign_extend(value) as u64),
                    ChangeKind::Truncate => to.truncate(value),
                    _ => return None,
                };
                Some(self.builder.word_constant(value, to))
            }
            Operation::Equal { left, right, rep } => {
                let rep = rep.as_word()?;
                let left = output.match_integral_word_constant(left, rep)?;
                let right = output.match_integral_word_constant(right, rep)?;
                Some(self.builder.word32_constant((left == right) as u32))
            }
            Operation::Branch {
                condition,
                if_true,
                if_false,
                ..
            } => {
                let condition =
                    output.match_integral_word_constant(condition, WordRepresentation::Word32)?;
                let destination = if condition != 0 { if_true } else { if_false };
                Some(self.goto(destination))
            }
            Operation::Switch {
                input,
                ref cases,
                default,
                ..
            } => {
                let value =
                    output.match_integral_word_constant(input, WordRepresentation::Word32)? as i32;
                let destination = cases
                    .iter()
                    .find(|case| case.value == value)
                    .map_or(default, |case| case.destination);
                Some(self.goto(destination))
            }
            _ => None,
        }
    }

    /// Clone the blocks of `body`, a region entered through `header`, into fresh output blocks,
    /// and jump from the current block to the clone of `header`.
    ///
    /// Jumps back to `header` inside the region are not emitted: the output block they end is
    /// left open. Returns the clone of `header`, or `None` if there was no current block.
    pub fn clone_sub_graph<R: Reducer + ?Sized>(
        &mut self,
        reducer: &mut R,
        header: BlockIndex,
        body: &[BlockIndex],
        options: CloneOptions,
    ) -> Option<BlockIndex> {
        if self.builder.generating_unreachable_operations() {
            return None;
        }
        let mut blocks = FxHashMap::default();
        for block in body.iter().copied() {
            let is_loop = self.input.block(block).is_loop();
            let output = if is_loop && (block != header || options.keep_loop_kinds) {
                self.builder.new_loop_header()
            } else {
                self.builder.new_block()
            };
            blocks.insert(block, output);
        }
        let header_clone = blocks[&header];
        log::trace!(target: "copying-phase", "cloning {} blocks from {header}", body.len());

        let saved_clone = self.clone.replace(CloneRegion { header, blocks });
        let saved_cloning = core::mem::replace(&mut self.cloning, true);
        let saved_skip = core::mem::replace(&mut self.skip_stack_checks, options.skip_stack_checks);
        let saved_input_block = self.current_input_block;

        self.goto(header_clone);
        for block in body.iter().copied() {
            let output = self.map_block(block);
            if !self.bind_output(output, block) {
                continue;
            }
            self.visit_operations(reducer, block);
        }

        self.clone = saved_clone;
        self.cloning = saved_cloning;
        self.skip_stack_checks = saved_skip;
        self.current_input_block = saved_input_block;
        Some(header_clone)
    }

    /// Copy the operations of the input block `block` into the current output block, as if
    /// control entered `block` from the input block the current output block was copied from.
    pub fn clone_and_inline_block<R: Reducer + ?Sized>(&mut self, reducer: &mut R, block: BlockIndex) {
        let Some(current) = self.builder.current_block() else {
            return;
        };
        let saved_cloning = core::mem::replace(&mut self.cloning, true);
        let saved_skip = core::mem::replace(&mut self.skip_stack_checks, true);
        let saved_input_block = self.current_input_block;

        let position = self.predecessor_position(block, current);
        let input = self.input;
        let mut operations = input.operations(block).peekable();
        while let Some((index, Operation::Phi { inputs, .. })) = operations.peek() {
            let value = self.map_op(inputs[position]);
            self.define(*index, value);
            operations.next();
        }
        // Edges leaving the inlined terminator are edges of `block`
        self.origins[current] = block.into();
        self.current_input_block = block.into();
        for (index, op) in operations {
            if self.builder.generating_unreachable_operations() {
                break;
            }
            self.visit_operation(reducer, index, op);
        }

        self.cloning = saved_cloning;
        self.skip_stack_checks = saved_skip;
        self.current_input_block = saved_input_block;
    }
}

/// A reducer that copies every operation unchanged, folding constant arithmetic and branches
#[derive(Default)]
pub struct CopyReducer;

impl Reducer for CopyReducer {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn reduce(&mut self, _: &mut CopyingPhase<'_>, _: OpIndex, _: &Operation) -> Reduction {
        Reduction::Copy
    }
}

#[cfg(test)]
mod tests;
