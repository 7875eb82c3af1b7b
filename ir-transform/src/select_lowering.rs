use shaftc_ir::{
    BranchHint, ChangeKind, Graph, OpIndex, Operation, RegisterRepresentation,
    SelectImplementation, WordRepresentation,
};

use crate::{CopyingPhase, Reducer, Reduction};

/// Lowers `Select`s that must be implemented with a branch into a diamond:
///
/// ```text
/// if (cond) { result = vtrue } else { result = vfalse }
/// ```
///
/// Selects implemented with a conditional move are left for the instruction selector.
#[derive(Default)]
pub struct SelectLoweringReducer;

impl Reducer for SelectLoweringReducer {
    fn name(&self) -> &'static str {
        "select-lowering"
    }

    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        index: OpIndex,
        op: &Operation,
    ) -> Reduction {
        let Operation::Select {
            cond,
            vtrue,
            vfalse,
            rep,
            implem: SelectImplementation::Branch,
        } = *op
        else {
            return Reduction::Copy;
        };
        let cond = copier.map_op(cond);
        let vtrue = copier.map_op(vtrue);
        let vfalse = copier.map_op(vfalse);
        if let Some(value) =
            copier.output().match_integral_word_constant(cond, WordRepresentation::Word32)
        {
            return Reduction::Replace(if value != 0 { vtrue } else { vfalse });
        }

        let if_true = copier.new_block();
        let if_false = copier.new_block();
        let merge = copier.new_block();
        copier.emit(Operation::Branch {
            condition: cond,
            if_true,
            if_false,
            hint: BranchHint::None,
        });
        copier.bind_new_block(if_true);
        copier.goto(merge);
        copier.bind_new_block(if_false);
        copier.goto(merge);
        copier.bind_new_block(merge);
        let result = copier.builder().phi([vtrue, vfalse], rep);
        log::trace!(target: "select-lowering", "lowered {index} to a diamond merging in {merge}");
        Reduction::Replace(result)
    }
}

/// Pushes word operations with a constant operand through `Select`s with a constant arm, so that
/// the arms fold:
///
/// ```text
/// Select(c, 1, x) + 4  =>  Select(c, 5, x + 4)
/// ```
///
/// The same applies to truncations, sign extensions and bitcasts from tagged to word values.
#[derive(Default)]
pub struct SelectDetectionReducer;

struct SelectWithConstant {
    cond: OpIndex,
    vtrue: OpIndex,
    vfalse: OpIndex,
    implem: SelectImplementation,
}

impl SelectDetectionReducer {
    fn match_select_with_constant(output: &Graph, value: OpIndex) -> Option<SelectWithConstant> {
        match *output.get(value) {
            Operation::Select {
                cond,
                vtrue,
                vfalse,
                implem,
                ..
            } if output.get(vtrue).is_constant() || output.get(vfalse).is_constant() => {
                Some(SelectWithConstant {
                    cond,
                    vtrue,
                    vfalse,
                    implem,
                })
            }
            _ => None,
        }
    }

    /// Emit `Select(cond, f(vtrue), f(vfalse))`, where `f` builds the operation to push through
    fn push_through(
        copier: &mut CopyingPhase<'_>,
        select: SelectWithConstant,
        rep: RegisterRepresentation,
        mut f: impl FnMut(OpIndex) -> Operation,
    ) -> OpIndex {
        let vtrue = copier.emit_or_fold(f(select.vtrue));
        let vfalse = copier.emit_or_fold(f(select.vfalse));
        copier.emit(Operation::Select {
            cond: select.cond,
            vtrue,
            vfalse,
            rep,
            implem: select.implem,
        })
    }
}

impl Reducer for SelectDetectionReducer {
    fn name(&self) -> &'static str {
        "select-detection"
    }

    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        _index: OpIndex,
        op: &Operation,
    ) -> Reduction {
        match *op {
            Operation::WordBinop {
                left,
                right,
                kind,
                rep,
            } => {
                let mut inputs = [copier.map_op(left), copier.map_op(right)];
                for select_index in 0..2 {
                    let constant_index = 1 - select_index;
                    if !copier.output().get(inputs[constant_index]).is_constant() {
                        continue;
                    }
                    let Some(select) =
                        Self::match_select_with_constant(copier.output(), inputs[select_index])
                    else {
                        continue;
                    };
                    let result = Self::push_through(copier, select, rep.into(), |arm| {
                        inputs[select_index] = arm;
                        Operation::WordBinop {
                            left: inputs[0],
                            right: inputs[1],
                            kind,
                            rep,
                        }
                    });
                    return Reduction::Replace(result);
                }
                Reduction::Copy
            }
            Operation::Change {
                input,
                kind,
                from,
                to,
            } => {
                let narrowing = kind == ChangeKind::Truncate
                    && from == RegisterRepresentation::Word64
                    && to == RegisterRepresentation::Word32;
                let widening = kind == ChangeKind::SignExtend
                    && from == RegisterRepresentation::Word32
                    && to == RegisterRepresentation::Word64;
                if !(narrowing || widening) {
                    return Reduction::Copy;
                }
                let input = copier.map_op(input);
                match Self::match_select_with_constant(copier.output(), input) {
                    Some(select) => Reduction::Replace(Self::push_through(copier, select, to, |arm| {
                        Operation::Change {
                            input: arm,
                            kind,
                            from,
                            to,
                        }
                    })),
                    None => Reduction::Copy,
                }
            }
            Operation::TaggedBitcast { input, from, to } if from.is_tagged() && to.is_word() => {
                let input = copier.map_op(input);
                match Self::match_select_with_constant(copier.output(), input) {
                    Some(select) => Reduction::Replace(Self::push_through(copier, select, to, |arm| {
                        Operation::TaggedBitcast {
                            input: arm,
                            from,
                            to,
                        }
                    })),
                    None => Reduction::Copy,
                }
            }
            _ => Reduction::Copy,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::{GraphBuilder, WordBinopKind};
    use shaftc_ir_analysis::verify_graph;

    use super::*;
    use crate::test_utils::{Interpreter, init_logger};

    /// `return (p < q ? p : q) + 1`, selecting with `implem`
    fn min_plus_one(implem: SelectImplementation) -> Graph {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        let q = b.parameter(1, RegisterRepresentation::Word32);
        let one = b.word32_constant(1);
        let cond = b.int32_less_than(p, q);
        let min = b.select(cond, p, q, RegisterRepresentation::Word32, implem);
        let result = b.word32_add(min, one);
        b.return_([result]);
        b.finish()
    }

    fn count_selects(graph: &Graph) -> usize {
        graph
            .all_operations()
            .filter(|(_, op)| matches!(op, Operation::Select { .. }))
            .count()
    }

    #[test]
    fn branch_select_becomes_a_diamond() {
        init_logger();
        let input = min_plus_one(SelectImplementation::Branch);
        let output = CopyingPhase::run(&input, &mut SelectLoweringReducer);
        log::trace!(target: "select-lowering", "lowered:\n{output}");
        assert_eq!(verify_graph(&output, "select-lowering"), Ok(()));

        assert_eq!(count_selects(&output), 0);
        assert_eq!(output.block_count(), 4);
        let merge = output.block_indices().last().unwrap();
        assert!(output.operations(merge).any(|(_, op)| op.is_phi()));
        for args in [[1, 2], [2, 1], [3, 3], [u32::MAX as u64, 0]] {
            assert_eq!(
                Interpreter::new(&output).run(&args),
                Interpreter::new(&input).run(&args),
                "args = {args:?}"
            );
        }
    }

    #[test]
    fn cmove_select_is_kept() {
        init_logger();
        let input = min_plus_one(SelectImplementation::CMove);
        let output = CopyingPhase::run(&input, &mut SelectLoweringReducer);
        assert_eq!(count_selects(&output), 1);
        assert_eq!(output.block_count(), 1);
    }

    #[test]
    fn binop_is_pushed_into_select_with_constant_arm() {
        init_logger();
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        let zero = b.word32_constant(0);
        let ten = b.word32_constant(10);
        let four = b.word32_constant(4);
        let cond = b.word32_equal(p, zero);
        let select = b.select(
            cond,
            ten,
            p,
            RegisterRepresentation::Word32,
            SelectImplementation::CMove,
        );
        let result = b.word_binop(select, four, WordBinopKind::Sub, WordRepresentation::Word32);
        b.return_([result]);
        let input = b.finish();

        let output = CopyingPhase::run(&input, &mut SelectDetectionReducer);
        assert_eq!(verify_graph(&output, "select-detection"), Ok(()));
        let Operation::Return { values, .. } = output.terminator(output.entry_block()) else {
            panic!("expected a return");
        };
        let Operation::Select { vtrue, vfalse, .. } = output.get(values[0]) else {
            panic!("expected the select to be pushed to the end");
        };
        assert_eq!(output.match_word32_constant(*vtrue), Some(6));
        assert!(matches!(output.get(*vfalse), Operation::WordBinop { .. }));
        for p in [0, 1, 20] {
            assert_eq!(
                Interpreter::new(&output).run(&[p]),
                Interpreter::new(&input).run(&[p])
            );
        }
    }

    #[test]
    fn sign_extension_is_pushed_into_select() {
        init_logger();
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, RegisterRepresentation::Word32);
        let minus_one = b.word32_constant(u32::MAX);
        let select = b.select(
            p,
            minus_one,
            p,
            RegisterRepresentation::Word32,
            SelectImplementation::CMove,
        );
        let extended = b.change(
            select,
            ChangeKind::SignExtend,
            RegisterRepresentation::Word32,
            RegisterRepresentation::Word64,
        );
        b.return_([extended]);
        let input = b.finish();

        let output = CopyingPhase::run(&input, &mut SelectDetectionReducer);
        assert_eq!(verify_graph(&output, "select-detection"), Ok(()));
        let Operation::Return { values, .. } = output.terminator(output.entry_block()) else {
            panic!("expected a return");
        };
        let Operation::Select { vtrue, rep, .. } = output.get(values[0]) else {
            panic!("expected the select to be pushed to the end");
        };
        assert_eq!(*rep, RegisterRepresentation::Word64);
        assert_eq!(output.match_integral_constant(*vtrue), Some(u64::MAX));
        assert_eq!(Interpreter::new(&output).run(&[3]), vec![u64::MAX]);
        assert_eq!(Interpreter::new(&output).run(&[0]), vec![0]);
    }
}
