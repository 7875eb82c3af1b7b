use shaftc_ir::{Graph, OpIndex, Operation, SecondaryMap, WordBinopKind};

use crate::{CopyingPhase, Reducer, Reduction};

/// Gives every branch its own copy of a condition that is also used elsewhere.
///
/// The instruction selector can only fuse a comparison into the branch using it when the branch is
/// its only user. Duplicating cheap conditions right before the branch makes that possible, at the
/// cost of computing them twice. Conditions whose inputs are all single-use are left alone, as the
/// copy would keep those inputs alive longer.
pub struct BranchConditionDuplicationReducer {
    use_counts: SecondaryMap<OpIndex, u32>,
}

impl BranchConditionDuplicationReducer {
    pub fn new(graph: &Graph) -> Self {
        Self {
            use_counts: graph.use_counts(),
        }
    }

    fn should_duplicate(&self, graph: &Graph, condition: OpIndex) -> bool {
        if self.use_counts[condition] <= 1 {
            return false;
        }
        let cond = graph.get(condition);
        let cheap = match cond {
            Operation::Comparison { .. } | Operation::Shift { .. } => true,
            Operation::WordBinop { kind, .. } => matches!(
                kind,
                WordBinopKind::Add
                    | WordBinopKind::BitwiseAnd
                    | WordBinopKind::BitwiseOr
                    | WordBinopKind::BitwiseXor
                    | WordBinopKind::Sub
            ),
            _ => false,
        };
        cheap && cond.inputs().iter().any(|input| self.use_counts[*input] > 1)
    }
}

impl Reducer for BranchConditionDuplicationReducer {
    fn name(&self) -> &'static str {
        "branch-condition-duplication"
    }

    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        _index: OpIndex,
        op: &Operation,
    ) -> Reduction {
        let Operation::Branch {
            condition,
            if_true,
            if_false,
            hint,
        } = *op
        else {
            return Reduction::Copy;
        };
        let input = copier.input();
        if !self.should_duplicate(input, condition) {
            return Reduction::Copy;
        }
        if copier.output().match_integral_constant(copier.map_op(condition)).is_some() {
            // Folded away, the copied branch becomes a goto
            return Reduction::Copy;
        }

        let mut duplicate = input.get(condition).clone();
        duplicate.map_inputs(|value| copier.map_op(value));
        let duplicate = copier.emit(duplicate);
        log::trace!(
            target: "branch-condition-duplication",
            "duplicated {condition} as {duplicate} for its branch"
        );
        let branch = Operation::Branch {
            condition: duplicate,
            if_true: copier.map_block(if_true),
            if_false: copier.map_block(if_false),
            hint,
        };
        Reduction::Replace(copier.emit(branch))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::{GraphBuilder, RegisterRepresentation, WordRepresentation};
    use shaftc_ir_analysis::verify_graph;

    use super::*;
    use crate::test_utils::{Interpreter, init_logger};

    /// `c = cond(p, q); if (c) return c; else return extra`, where `extra` is `p` if `share_inputs`
    /// or a constant otherwise
    fn branch_on_shared_condition(kind: Option<WordBinopKind>, share_inputs: bool) -> Graph {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let left = b.new_block();
        let right = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        let q = b.parameter(1, RegisterRepresentation::Word32);
        let c = match kind {
            Some(kind) => b.word_binop(p, q, kind, WordRepresentation::Word32),
            None => b.int32_less_than(p, q),
        };
        b.branch(c, left, right);
        b.bind(left);
        b.return_([c]);
        b.bind(right);
        let extra = if share_inputs {
            p
        } else {
            b.word32_constant(7)
        };
        b.return_([extra]);
        b.finish()
    }

    fn count_condition_copies(graph: &Graph) -> usize {
        graph
            .all_operations()
            .filter(|(_, op)| matches!(op, Operation::Comparison { .. } | Operation::WordBinop { .. }))
            .count()
    }

    fn run(input: &Graph) -> Graph {
        let mut reducer = BranchConditionDuplicationReducer::new(input);
        let output = CopyingPhase::run(input, &mut reducer);
        assert_eq!(verify_graph(&output, "branch-condition-duplication"), Ok(()));
        output
    }

    #[test]
    fn shared_comparison_is_duplicated_next_to_its_branch() {
        init_logger();
        let input = branch_on_shared_condition(None, true);
        let output = run(&input);
        assert_eq!(count_condition_copies(&output), 2);

        let entry = output.block(output.entry_block());
        let Operation::Branch { condition, .. } = output.get(entry.terminator()) else {
            panic!("expected a branch");
        };
        assert_eq!(condition.id() + 1, entry.terminator().id());
        assert_eq!(output.use_counts()[*condition], 1);

        for args in [[1, 2], [2, 1], [5, 5]] {
            assert_eq!(
                Interpreter::new(&output).run(&args),
                Interpreter::new(&input).run(&args),
                "args = {args:?}"
            );
        }
    }

    #[test]
    fn cheap_binops_are_duplicated() {
        init_logger();
        let input = branch_on_shared_condition(Some(WordBinopKind::BitwiseAnd), true);
        assert_eq!(count_condition_copies(&run(&input)), 2);
    }

    #[test]
    fn expensive_binops_are_not_duplicated() {
        init_logger();
        let input = branch_on_shared_condition(Some(WordBinopKind::Mul), true);
        assert_eq!(count_condition_copies(&run(&input)), 1);
    }

    #[test]
    fn conditions_with_single_use_inputs_are_not_duplicated() {
        init_logger();
        let input = branch_on_shared_condition(None, false);
        assert_eq!(count_condition_copies(&run(&input)), 1);
    }
}
