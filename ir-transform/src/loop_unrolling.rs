use shaftc_ir::{BlockIndex, Graph, OpIndex, Operation};
use shaftc_ir_analysis::{LoopUnrollingAnalyzer, PARTIAL_UNROLLING_COUNT};

use crate::{CloneOptions, CopyingPhase, Reducer, Reduction};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum UnrollingStatus {
    NotUnrolling,
    Unrolling,
    /// Emitting the final copy of the header of a fully unrolled loop
    RemoveLoop,
}

/// Fully unrolls loops with a small known trip count, and unrolls other small innermost loops
/// [PARTIAL_UNROLLING_COUNT] times.
///
/// A fully unrolled loop becomes a straight sequence of copies of its body, followed by a last copy
/// of its header whose exit branch is replaced by a jump out of the loop. A partially unrolled loop
/// keeps one loop header, whose body now contains the copies, and only the first copy keeps its
/// stack check.
pub struct LoopUnrollingReducer<'a> {
    analyzer: LoopUnrollingAnalyzer<'a>,
    status: UnrollingStatus,
    current_loop: Option<BlockIndex>,
}

impl<'a> LoopUnrollingReducer<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        Self {
            analyzer: LoopUnrollingAnalyzer::new(graph),
            status: UnrollingStatus::NotUnrolling,
            current_loop: None,
        }
    }

    /// True if running this reducer would change anything
    pub fn has_work(&self) -> bool {
        self.analyzer.can_unroll_at_least_one_loop()
    }

    fn fully_unroll_loop(&mut self, copier: &mut CopyingPhase<'_>, header: BlockIndex) {
        let count = self.analyzer.iteration_count(header).as_full_unroll_count();
        let body = self.analyzer.get_loop_body(header);
        log::debug!(target: "loop-unrolling", "fully unrolling {header} {count} times");

        self.status = UnrollingStatus::Unrolling;
        self.current_loop = Some(header);
        let options = CloneOptions {
            keep_loop_kinds: false,
            skip_stack_checks: true,
        };
        for _ in 0..count {
            copier.clone_sub_graph(self, header, &body, options);
            if copier.generating_unreachable_operations() {
                // The loop exits early on every path
                self.reset();
                return;
            }
        }

        // One more evaluation of the header, which leaves the loop
        self.status = UnrollingStatus::RemoveLoop;
        copier.clone_and_inline_block(self, header);
        self.reset();
    }

    fn partially_unroll_loop(&mut self, copier: &mut CopyingPhase<'_>, header: BlockIndex) {
        let body = self.analyzer.get_loop_body(header);
        log::debug!(
            target: "loop-unrolling",
            "partially unrolling {header} {PARTIAL_UNROLLING_COUNT} times"
        );

        self.status = UnrollingStatus::Unrolling;
        self.current_loop = Some(header);
        let Some(new_header) = copier.clone_sub_graph(
            self,
            header,
            &body,
            CloneOptions {
                keep_loop_kinds: true,
                skip_stack_checks: false,
            },
        ) else {
            self.reset();
            return;
        };
        for _ in 1..PARTIAL_UNROLLING_COUNT {
            if copier.generating_unreachable_operations() {
                break;
            }
            copier.clone_sub_graph(
                self,
                header,
                &body,
                CloneOptions {
                    keep_loop_kinds: false,
                    skip_stack_checks: true,
                },
            );
        }
        if !copier.generating_unreachable_operations() {
            // The backedge of the unrolled loop
            copier.goto(new_header);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.status = UnrollingStatus::NotUnrolling;
        self.current_loop = None;
    }
}

impl Reducer for LoopUnrollingReducer<'_> {
    fn name(&self) -> &'static str {
        "loop-unrolling"
    }

    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        _index: OpIndex,
        op: &Operation,
    ) -> Reduction {
        match (self.status, op) {
            (
                UnrollingStatus::NotUnrolling,
                Operation::Goto {
                    destination,
                    is_backedge: false,
                },
            ) if copier.input().block(*destination).is_loop() => {
                let header = *destination;
                if self.analyzer.should_fully_unroll_loop(header) {
                    self.fully_unroll_loop(copier, header);
                    Reduction::Replace(OpIndex::INVALID)
                } else if self.analyzer.should_partially_unroll_loop(header) {
                    self.partially_unroll_loop(copier, header);
                    Reduction::Replace(OpIndex::INVALID)
                } else {
                    Reduction::Copy
                }
            }
            (
                UnrollingStatus::RemoveLoop,
                Operation::Branch {
                    if_true, if_false, ..
                },
            ) => {
                let Some(header) = self.current_loop else {
                    return Reduction::Copy;
                };
                let finder = self.analyzer.loop_finder();
                let exit = if finder.is_in_loop(*if_true, header) {
                    *if_false
                } else {
                    *if_true
                };
                debug_assert!(!finder.is_in_loop(exit, header));
                let exit = copier.map_block(exit);
                Reduction::Replace(copier.goto(exit))
            }
            _ => Reduction::Copy,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::{ComparisonKind, GraphBuilder, RegisterRepresentation, StackCheckKind};
    use shaftc_ir_analysis::{LoopFinder, verify_graph};

    use super::*;
    use crate::test_utils::{Interpreter, init_logger};

    /// `acc = 0; for (i = 0; i < bound; i += 1) { stack check; acc += p } return acc`, where
    /// `bound` is the constant `constant_bound`, or the second parameter if it is `None`
    fn accumulating_loop(constant_bound: Option<u32>) -> Graph {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let header = b.new_loop_header();
        let body = b.new_block();
        let exit = b.new_block();
        b.bind(entry);
        let zero = b.word32_constant(0);
        let one = b.word32_constant(1);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        let bound = match constant_bound {
            Some(bound) => b.word32_constant(bound),
            None => b.parameter(1, RegisterRepresentation::Word32),
        };
        b.goto(header);
        b.bind(header);
        let i = b.pending_loop_phi(zero, RegisterRepresentation::Word32);
        let acc = b.pending_loop_phi(zero, RegisterRepresentation::Word32);
        let cond = b.comparison(i, bound, ComparisonKind::SignedLessThan, RegisterRepresentation::Word32);
        b.branch(cond, body, exit);
        b.bind(body);
        b.stack_check(StackCheckKind::LoopIteration);
        let next_i = b.word32_add(i, one);
        let next_acc = b.word32_add(acc, p);
        b.fix_loop_phi(i, next_i);
        b.fix_loop_phi(acc, next_acc);
        b.goto(header);
        b.bind(exit);
        b.return_([acc]);
        b.finish()
    }

    fn count_matching(graph: &Graph, pred: impl Fn(&Operation) -> bool) -> usize {
        graph.all_operations().filter(|(_, op)| pred(op)).count()
    }

    #[test]
    fn small_constant_loop_is_fully_unrolled() {
        init_logger();
        let input = accumulating_loop(Some(3));
        let mut reducer = LoopUnrollingReducer::new(&input);
        assert!(reducer.has_work());
        let output = CopyingPhase::run(&input, &mut reducer);
        log::trace!(target: "loop-unrolling", "after full unrolling:\n{output}");
        assert_eq!(verify_graph(&output, "loop-unrolling"), Ok(()));

        assert_eq!(LoopFinder::new(&output).loop_headers().count(), 0);
        assert_eq!(count_matching(&output, |op| matches!(op, Operation::StackCheck { .. })), 0);
        assert_eq!(count_matching(&output, |op| matches!(op, Operation::Branch { .. })), 0);
        for p in [0, 1, 5, u32::MAX as u64] {
            assert_eq!(
                Interpreter::new(&output).run(&[p]),
                Interpreter::new(&input).run(&[p]),
                "p = {p}"
            );
        }
    }

    #[test]
    fn unknown_trip_count_is_partially_unrolled() {
        init_logger();
        let input = accumulating_loop(None);
        let mut reducer = LoopUnrollingReducer::new(&input);
        let output = CopyingPhase::run(&input, &mut reducer);
        log::trace!(target: "loop-unrolling", "after partial unrolling:\n{output}");
        assert_eq!(verify_graph(&output, "loop-unrolling"), Ok(()));

        let finder = LoopFinder::new(&output);
        assert_eq!(finder.loop_headers().count(), 1);
        // Only the first copy of the body keeps its stack check
        assert_eq!(count_matching(&output, |op| matches!(op, Operation::StackCheck { .. })), 1);
        // One exit test per copy
        assert_eq!(
            count_matching(&output, |op| matches!(op, Operation::Branch { .. })),
            PARTIAL_UNROLLING_COUNT
        );
        for n in [0, 1, 3, 4, 5, 9, 17] {
            assert_eq!(
                Interpreter::new(&output).run(&[3, n]),
                Interpreter::new(&input).run(&[3, n]),
                "n = {n}"
            );
        }
    }

    #[test]
    fn loops_that_are_too_long_for_full_unrolling_are_partially_unrolled() {
        init_logger();
        let input = accumulating_loop(Some(100));
        let mut reducer = LoopUnrollingReducer::new(&input);
        let output = CopyingPhase::run(&input, &mut reducer);
        assert_eq!(verify_graph(&output, "loop-unrolling"), Ok(()));
        assert_eq!(LoopFinder::new(&output).loop_headers().count(), 1);
        assert_eq!(Interpreter::new(&output).run(&[2]), vec![200]);
    }

    #[test]
    fn loop_without_exit_branch_is_left_alone() {
        init_logger();
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let header = b.new_loop_header();
        let latch = b.new_block();
        let exit = b.new_block();
        b.bind(entry);
        let c = b.parameter(0, RegisterRepresentation::Word32);
        b.goto(header);
        b.bind(header);
        b.goto(latch);
        b.bind(latch);
        b.branch(c, header, exit);
        b.bind(exit);
        b.return_([c]);
        let input = b.finish();

        let mut reducer = LoopUnrollingReducer::new(&input);
        assert!(!reducer.has_work());
        let output = CopyingPhase::run(&input, &mut reducer);
        assert_eq!(verify_graph(&output, "loop-unrolling"), Ok(()));
        assert_eq!(output.block_count(), input.block_count());
    }
}
