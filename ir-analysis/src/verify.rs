use core::fmt;

use shaftc_ir::{Graph, OpIndex, Operation};
use shaftc_session::BailoutReason;

use crate::DominatorTree;

struct Verifier<'a> {
    graph: &'a Graph,
    stage: &'static str,
}

impl Verifier<'_> {
    fn error(&self, message: impl fmt::Display) -> BailoutReason {
        let message = message.to_string();
        log::error!(target: "verify", "invalid graph after '{}': {message}", self.stage);
        BailoutReason::InvalidGraph {
            stage: self.stage,
            message,
        }
    }

    fn verify_layout(&self) -> Result<(), BailoutReason> {
        let graph = self.graph;
        let mut next = 0u32;
        for block in graph.blocks() {
            if block.begin().id() != next {
                return Err(self.error(format_args!(
                    "{} starts at {}, expected o{next}",
                    block.index(),
                    block.begin()
                )));
            }
            if block.op_count() == 0 {
                return Err(self.error(format_args!("{} is empty", block.index())));
            }
            for (index, op) in graph.operations(block.index()) {
                if graph.block_of(index) != block.index() {
                    return Err(self.error(format_args!(
                        "{index} is recorded in {} but stored in {}",
                        graph.block_of(index),
                        block.index()
                    )));
                }
                let is_last = index == block.terminator();
                if op.is_block_terminator() != is_last {
                    return Err(self.error(format_args!(
                        "{index} ({}) in {}: terminators must be exactly the last operation",
                        op.name(),
                        block.index()
                    )));
                }
                if let Operation::PendingLoopPhi { .. } = op {
                    return Err(self.error(format_args!("{index} is an unresolved loop phi")));
                }
            }
            next = block.end().id();
        }
        if next as usize != graph.op_count() {
            return Err(self.error("operations exist outside of any block"));
        }
        Ok(())
    }

    fn verify_edges(&self) -> Result<(), BailoutReason> {
        let graph = self.graph;
        for block in graph.blocks() {
            let index = block.index();
            let terminator = graph.terminator(index);
            let successors = terminator.successors();
            for succ in successors.iter().copied() {
                let succ_block = graph.block(succ);
                let expected = successors.iter().filter(|s| **s == succ).count();
                let actual = succ_block.predecessors().iter().filter(|p| **p == index).count();
                if expected != actual {
                    return Err(self.error(format_args!(
                        "{index} -> {succ} is not recorded as a predecessor edge"
                    )));
                }
                if terminator.is_branching() && succ_block.predecessor_count() != 1 {
                    return Err(self.error(format_args!(
                        "critical edge {index} -> {succ}: the graph must be in split-edge form"
                    )));
                }
            }

            for (position, pred) in block.predecessors().iter().copied().enumerate() {
                if !graph.successors(pred).contains(&index) {
                    return Err(self.error(format_args!(
                        "{pred} is a predecessor of {index} but not a successor"
                    )));
                }
                let is_backedge = block.is_loop() && position == 1;
                if is_backedge != (pred >= index) {
                    return Err(self.error(format_args!(
                        "edge {pred} -> {index} breaks the block order"
                    )));
                }
            }

            if block.is_loop() {
                if block.predecessor_count() != 2 {
                    return Err(self.error(format_args!(
                        "loop header {index} has {} predecessors",
                        block.predecessor_count()
                    )));
                }
                for pred in block.predecessors() {
                    if !matches!(graph.terminator(*pred), Operation::Goto { .. }) {
                        return Err(self.error(format_args!(
                            "loop header {index} is entered from {pred} by a branch"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_ssa(&self) -> Result<(), BailoutReason> {
        let graph = self.graph;
        let domtree = DominatorTree::new(graph);
        for block in graph.blocks() {
            let mut seen_non_phi = false;
            for (index, op) in graph.operations(block.index()) {
                if let Operation::Phi { inputs, .. } = op {
                    if seen_non_phi {
                        return Err(self.error(format_args!("phi {index} follows a non-phi")));
                    }
                    if inputs.len() != block.predecessor_count() {
                        return Err(self.error(format_args!(
                            "phi {index} has {} inputs but {} has {} predecessors",
                            inputs.len(),
                            block.index(),
                            block.predecessor_count()
                        )));
                    }
                    for (input, pred) in inputs.iter().zip(block.predecessors()) {
                        self.verify_input_defined(*input, index)?;
                        if !domtree.dominates(graph.block_of(*input), *pred) {
                            return Err(self.error(format_args!(
                                "phi input {input} of {index} does not dominate predecessor {pred}"
                            )));
                        }
                    }
                    continue;
                }
                seen_non_phi = true;
                for input in op.inputs() {
                    self.verify_input_defined(input, index)?;
                    if !domtree.op_dominates(graph, input, index) {
                        return Err(self.error(format_args!(
                            "{index} ({}) uses {input}, which does not dominate it",
                            op.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_input_defined(&self, input: OpIndex, user: OpIndex) -> Result<(), BailoutReason> {
        if !input.is_valid() || input.id() as usize >= self.graph.op_count() {
            return Err(self.error(format_args!("{user} has an undefined input")));
        }
        let def = self.graph.get(input);
        if def.outputs_rep().is_empty() && !matches!(def, Operation::FrameState { .. }) {
            return Err(self.error(format_args!("{user} uses {input}, which produces no value")));
        }
        Ok(())
    }
}

/// Check the structural invariants of `graph`: block layout, terminators, split-edge form, loop
/// header shape and SSA dominance.
///
/// `stage` names the phase that produced the graph, for reporting.
pub fn verify_graph(graph: &Graph, stage: &'static str) -> Result<(), BailoutReason> {
    let verifier = Verifier { graph, stage };
    verifier.verify_layout()?;
    verifier.verify_edges()?;
    verifier.verify_ssa()?;
    log::trace!(target: "verify", "graph after '{stage}' is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use shaftc_ir::{GraphBuilder, RegisterRepresentation};

    use super::*;

    #[test]
    fn well_formed_loop_verifies() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let header = b.new_loop_header();
        let body = b.new_block();
        let exit = b.new_block();
        b.bind(entry);
        let zero = b.word32_constant(0);
        let one = b.word32_constant(1);
        let n = b.parameter(0, RegisterRepresentation::Word32);
        b.goto(header);
        b.bind(header);
        let i = b.pending_loop_phi(zero, RegisterRepresentation::Word32);
        let cond = b.int32_less_than(i, n);
        b.branch(cond, body, exit);
        b.bind(body);
        let next = b.word32_add(i, one);
        b.fix_loop_phi(i, next);
        b.goto(header);
        b.bind(exit);
        b.return_([i]);
        let graph = b.finish();

        assert_eq!(verify_graph(&graph, "test"), Ok(()));
    }

    #[test]
    fn using_an_operation_without_value_is_rejected() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        let retain = b.retain(p);
        b.return_([retain]);
        let graph = b.finish();

        let err = verify_graph(&graph, "test").unwrap_err();
        assert!(matches!(err, BailoutReason::InvalidGraph { stage: "test", .. }));
    }
}
