use shaftc_ir::{BlockIndex, Graph, OpIndex, Operation, StackCheckKind};
use shaftc_ir_analysis::LoopFinder;

use crate::{CloneOptions, CopyingPhase, Reducer, Reduction};

/// Peels the first iteration of every loop that has no inner loops.
///
/// The peeled iteration is a copy of the loop body placed before the loop, with its header turned
/// into a plain block and its loop stack checks removed. The phis of the remaining loop take their
/// forward inputs from the end of the peeled iteration.
pub struct LoopPeelingReducer {
    loop_finder: LoopFinder,
    /// The header of the loop being peeled
    peeling: Option<BlockIndex>,
}

impl LoopPeelingReducer {
    pub fn new(graph: &Graph) -> Self {
        Self {
            loop_finder: LoopFinder::new(graph),
            peeling: None,
        }
    }

    fn can_peel_loop(&self, header: BlockIndex) -> bool {
        !self.loop_finder.loop_info(header).has_inner_loops
    }

    fn peel_first_iteration(&mut self, copier: &mut CopyingPhase<'_>, header: BlockIndex) {
        debug_assert!(self.peeling.is_none());
        let body = self.loop_finder.get_loop_body(copier.input(), header);
        log::debug!(
            target: "loop-peeling",
            "peeling the first iteration of {header} ({} blocks)",
            body.len()
        );
        self.peeling = Some(header);
        copier.clone_sub_graph(
            self,
            header,
            &body,
            CloneOptions {
                keep_loop_kinds: false,
                skip_stack_checks: true,
            },
        );
        self.peeling = None;
    }
}

impl Reducer for LoopPeelingReducer {
    fn name(&self) -> &'static str {
        "loop-peeling"
    }

    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        _index: OpIndex,
        op: &Operation,
    ) -> Reduction {
        match *op {
            Operation::Goto {
                destination,
                is_backedge: false,
            } if self.peeling.is_none()
                && copier.input().block(destination).is_loop()
                && self.can_peel_loop(destination) =>
            {
                self.peel_first_iteration(copier, destination);
                let header = copier.map_block(destination);
                Reduction::Replace(copier.goto(header))
            }
            Operation::StackCheck {
                kind: StackCheckKind::LoopIteration,
            } if self.peeling.is_some() => Reduction::Replace(OpIndex::INVALID),
            _ => Reduction::Copy,
        }
    }
}
