use shaftc_ir::{
    BlockIndex, ConstantKind, EntityRef, Graph, OpIndex, Operation, RegisterRepresentation,
    SecondaryMap,
};
use shaftc_ir_analysis::DominatorTree;

/// Finds the tagged values that must be held as full pointers. Everything else may stay
/// compressed.
///
/// Uses are visited backwards, so a value is known to need decompression before its own inputs are
/// visited. A loop phi can only learn this after its backedge input was visited, in which case the
/// loop body is visited again.
struct DecompressionAnalyzer<'a> {
    graph: &'a Graph,
    needs_decompression: SecondaryMap<OpIndex, bool>,
}

impl<'a> DecompressionAnalyzer<'a> {
    fn new(graph: &'a Graph) -> Self {
        Self {
            graph,
            needs_decompression: SecondaryMap::with_capacity(graph.op_count()),
        }
    }

    fn run(&mut self) {
        let graph = self.graph;
        let domtree = DominatorTree::new(graph);
        let mut next = graph.block_count();
        while next > 0 {
            next -= 1;
            let block = BlockIndex::new(next);
            if !domtree.is_reachable(block) {
                continue;
            }
            let data = graph.block(block);
            for (index, op) in graph.operations(block).rev() {
                if let Operation::Phi { inputs, .. } = op {
                    if data.is_loop()
                        && self.needs_decompression[index]
                        && !self.needs_decompression[inputs[1]]
                    {
                        if let Some(backedge) = data.backedge_predecessor() {
                            log::trace!(
                                target: "decompression",
                                "loop phi {index} needs decompression, revisiting {block}..={backedge}"
                            );
                            next = next.max(backedge.index() + 1);
                        }
                    }
                }
                self.process_operation(index, op);
            }
        }
    }

    fn mark(&mut self, op: OpIndex) {
        self.needs_decompression[op] = true;
    }

    fn process_operation(&mut self, index: OpIndex, op: &Operation) {
        match *op {
            Operation::Store {
                base,
                index: offset_index,
                value,
                stored_rep,
                ..
            } => {
                self.mark(base);
                if let Some(offset_index) = offset_index {
                    self.mark(offset_index);
                }
                if !stored_rep.is_tagged() {
                    self.mark(value);
                }
            }
            Operation::FrameState { .. } => (),
            Operation::Phi { ref inputs, .. } => {
                if self.needs_decompression[index] {
                    inputs.iter().for_each(|input| self.mark(*input));
                }
            }
            Operation::Equal { left, right, rep } | Operation::Comparison { left, right, rep, .. } => {
                if rep == RegisterRepresentation::Word64 {
                    self.mark(left);
                    self.mark(right);
                }
            }
            Operation::WordBinop {
                left, right, rep, ..
            } => {
                if rep.bit_width() == 64 {
                    self.mark(left);
                    self.mark(right);
                }
            }
            Operation::Shift { left, rep, .. } => {
                if rep.bit_width() == 64 {
                    self.mark(left);
                }
            }
            Operation::Change { input, to, .. } => {
                if to == RegisterRepresentation::Word64 && self.needs_decompression[index] {
                    self.mark(input);
                }
            }
            Operation::TaggedBitcast { input, .. } => {
                if self.needs_decompression[index] {
                    self.mark(input);
                }
            }
            ref op => op.inputs().into_iter().for_each(|input| self.mark(input)),
        }
    }
}

/// Switch tagged values that are never used as full pointers to compressed representations:
/// heap object constants, tagged phis and the results of tagged loads.
///
/// Only representations change, so the graph is rewritten in place.
pub fn run_decompression_optimization(graph: &mut Graph) {
    let mut analyzer = DecompressionAnalyzer::new(graph);
    analyzer.run();
    let needs_decompression = analyzer.needs_decompression;

    let mut compressed = 0usize;
    let candidates = graph
        .all_operations()
        .filter(|(index, _)| !needs_decompression[*index])
        .filter_map(|(index, op)| {
            let replacement = match op {
                Operation::Constant {
                    kind: ConstantKind::HeapObject(handle),
                } => Operation::Constant {
                    kind: ConstantKind::CompressedHeapObject(*handle),
                },
                Operation::Phi {
                    inputs,
                    rep: RegisterRepresentation::Tagged,
                } => Operation::Phi {
                    inputs: inputs.clone(),
                    rep: RegisterRepresentation::Compressed,
                },
                Operation::Load {
                    result_rep: RegisterRepresentation::Tagged,
                    ..
                } => {
                    let mut load = op.clone();
                    if let Operation::Load { result_rep, .. } = &mut load {
                        *result_rep = RegisterRepresentation::Compressed;
                    }
                    load
                }
                _ => return None,
            };
            Some((index, replacement))
        })
        .collect::<Vec<_>>();
    for (index, replacement) in candidates {
        graph.replace_in_place(index, replacement);
        compressed += 1;
    }
    log::debug!(target: "decompression", "{compressed} operations kept compressed");
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::{
        GraphBuilder, MemoryRepresentation, WordBinopKind, WordRepresentation, WriteBarrierKind,
    };

    use super::*;
    use crate::test_utils::init_logger;

    fn constant_kind(graph: &Graph, op: OpIndex) -> ConstantKind {
        graph.match_constant(op).unwrap()
    }

    fn rep_of(graph: &Graph, op: OpIndex) -> RegisterRepresentation {
        graph.get(op).output_rep().unwrap()
    }

    #[test]
    fn stored_constant_stays_compressed() {
        init_logger();
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let object = b.parameter(0, RegisterRepresentation::Tagged);
        let stored = b.heap_constant(7);
        let returned = b.heap_constant(8);
        b.store(
            object,
            None,
            stored,
            MemoryRepresentation::AnyTagged,
            WriteBarrierKind::Full,
            8,
            0,
        );
        b.return_([returned]);
        let mut graph = b.finish();

        run_decompression_optimization(&mut graph);
        assert_eq!(constant_kind(&graph, stored), ConstantKind::CompressedHeapObject(7));
        assert_eq!(constant_kind(&graph, returned), ConstantKind::HeapObject(8));
        assert_eq!(rep_of(&graph, object), RegisterRepresentation::Tagged);
    }

    #[test]
    fn loads_used_as_words_are_decompressed() {
        init_logger();
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let object = b.parameter(0, RegisterRepresentation::Tagged);
        let copied = b.load(object, None, MemoryRepresentation::AnyTagged, 8, 0);
        let inspected = b.load(object, None, MemoryRepresentation::AnyTagged, 16, 0);
        b.store(
            object,
            None,
            copied,
            MemoryRepresentation::AnyTagged,
            WriteBarrierKind::Full,
            24,
            0,
        );
        let bits = b.tagged_bitcast(
            inspected,
            RegisterRepresentation::Tagged,
            RegisterRepresentation::Word64,
        );
        let one = b.word64_constant(1);
        let tag = b.word_binop(bits, one, WordBinopKind::BitwiseAnd, WordRepresentation::Word64);
        b.return_([tag]);
        let mut graph = b.finish();

        run_decompression_optimization(&mut graph);
        assert_eq!(rep_of(&graph, copied), RegisterRepresentation::Compressed);
        assert_eq!(rep_of(&graph, inspected), RegisterRepresentation::Tagged);
    }

    #[test]
    fn loop_phis_are_revisited() {
        init_logger();
        // a, b = k1, k2; while (c) { a, b = b, a } return a
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let header = b.new_loop_header();
        let body = b.new_block();
        let exit = b.new_block();
        b.bind(entry);
        let k1 = b.heap_constant(1);
        let k2 = b.heap_constant(2);
        let k3 = b.heap_constant(3);
        let c = b.parameter(0, RegisterRepresentation::Word32);
        b.goto(header);
        b.bind(header);
        let first = b.pending_loop_phi(k1, RegisterRepresentation::Tagged);
        let second = b.pending_loop_phi(k2, RegisterRepresentation::Tagged);
        let unused = b.pending_loop_phi(k3, RegisterRepresentation::Tagged);
        b.branch(c, body, exit);
        b.bind(body);
        b.fix_loop_phi(first, second);
        b.fix_loop_phi(second, first);
        b.fix_loop_phi(unused, unused);
        b.goto(header);
        b.bind(exit);
        b.return_([first]);
        let mut graph = b.finish();

        run_decompression_optimization(&mut graph);
        assert_eq!(constant_kind(&graph, k1), ConstantKind::HeapObject(1));
        assert_eq!(constant_kind(&graph, k2), ConstantKind::HeapObject(2));
        assert_eq!(rep_of(&graph, first), RegisterRepresentation::Tagged);
        assert_eq!(rep_of(&graph, second), RegisterRepresentation::Tagged);
        assert_eq!(constant_kind(&graph, k3), ConstantKind::CompressedHeapObject(3));
        assert_eq!(rep_of(&graph, unused), RegisterRepresentation::Compressed);
    }
}
