use pretty_assertions::assert_eq;
use shaftc_ir::{GraphBuilder, RegisterRepresentation, SwitchCase};
use shaftc_ir_analysis::{LoopFinder, verify_graph};

use super::*;
use crate::test_utils::{Interpreter, init_logger};

/// `x = p < 10 ? p + 1 : p - 1; return x`, or the same with a constant condition if `constant`
/// is given
fn diamond(constant: Option<u32>) -> Graph {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    let left = b.new_block();
    let right = b.new_block();
    let merge = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, RegisterRepresentation::Word32);
    let one = b.word32_constant(1);
    let cond = match constant {
        Some(value) => b.word32_constant(value),
        None => {
            let ten = b.word32_constant(10);
            b.int32_less_than(p, ten)
        }
    };
    b.branch(cond, left, right);
    b.bind(left);
    let inc = b.word32_add(p, one);
    b.goto(merge);
    b.bind(right);
    let dec = b.word32_sub(p, one);
    b.goto(merge);
    b.bind(merge);
    let x = b.phi([inc, dec], RegisterRepresentation::Word32);
    b.return_([x]);
    b.finish()
}

#[test]
fn copy_preserves_structure_and_behavior() {
    init_logger();
    let input = diamond(None);
    let output = CopyingPhase::run(&input, &mut CopyReducer);
    assert_eq!(verify_graph(&output, "copy"), Ok(()));
    assert_eq!(output.block_count(), input.block_count());
    assert_eq!(output.op_count(), input.op_count());
    for p in [0, 9, 10, 11, u32::MAX as u64] {
        assert_eq!(
            Interpreter::new(&output).run(&[p]),
            Interpreter::new(&input).run(&[p]),
            "p = {p}"
        );
    }
}

#[test]
fn branch_on_constant_becomes_goto() {
    init_logger();
    let input = diamond(Some(1));
    let output = CopyingPhase::run(&input, &mut CopyReducer);
    log::trace!(target: "copying-phase", "folded:\n{output}");
    assert_eq!(verify_graph(&output, "copy"), Ok(()));

    // The false side is never reached, and the merge only has a single predecessor left
    assert_eq!(output.block_count(), 3);
    assert!(!output.all_operations().any(|(_, op)| matches!(op, Operation::Branch { .. })));
    assert!(!output.all_operations().any(|(_, op)| op.is_phi()));
    assert_eq!(Interpreter::new(&output).run(&[41]), vec![42]);
}

#[test]
fn constant_arithmetic_is_folded() {
    init_logger();
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let six = b.word32_constant(6);
    let seven = b.word32_constant(7);
    let product = b.word32_mul(six, seven);
    let is_answer = b.word32_equal(product, six);
    b.return_([product, is_answer]);
    let input = b.finish();

    let output = CopyingPhase::run(&input, &mut CopyReducer);
    assert_eq!(verify_graph(&output, "copy"), Ok(()));
    let Operation::Return { values, .. } = output.terminator(output.entry_block()) else {
        panic!("expected a return");
    };
    assert_eq!(output.match_word32_constant(values[0]), Some(42));
    assert_eq!(output.match_word32_constant(values[1]), Some(0));
}

#[test]
fn switch_on_constant_takes_the_matching_case() {
    init_logger();
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    let first = b.new_block();
    let second = b.new_block();
    let fallback = b.new_block();
    b.bind(entry);
    let selector = b.word32_constant(2);
    b.switch(
        selector,
        [
            SwitchCase {
                value: 1,
                destination: first,
                hint: Default::default(),
            },
            SwitchCase {
                value: 2,
                destination: second,
                hint: Default::default(),
            },
        ],
        fallback,
    );
    for (block, value) in [(first, 10), (second, 20), (fallback, 30)] {
        b.bind(block);
        let value = b.word32_constant(value);
        b.return_([value]);
    }
    let input = b.finish();

    let output = CopyingPhase::run(&input, &mut CopyReducer);
    assert_eq!(verify_graph(&output, "copy"), Ok(()));
    assert_eq!(output.block_count(), 2);
    assert_eq!(Interpreter::new(&output).run(&[]), vec![20]);
}

#[test]
fn loops_are_copied_with_their_phis() {
    init_logger();
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    let header = b.new_loop_header();
    let body = b.new_block();
    let exit = b.new_block();
    b.bind(entry);
    let zero = b.word32_constant(0);
    let two = b.word32_constant(2);
    let n = b.parameter(0, RegisterRepresentation::Word32);
    b.goto(header);
    b.bind(header);
    let i = b.pending_loop_phi(zero, RegisterRepresentation::Word32);
    let cond = b.uint32_less_than(i, n);
    b.branch(cond, body, exit);
    b.bind(body);
    let next = b.word32_add(i, two);
    b.fix_loop_phi(i, next);
    b.goto(header);
    b.bind(exit);
    b.return_([i]);
    let input = b.finish();

    let output = CopyingPhase::run(&input, &mut CopyReducer);
    assert_eq!(verify_graph(&output, "copy"), Ok(()));
    assert_eq!(LoopFinder::new(&output).loop_headers().count(), 1);
    for n in [0, 1, 2, 9] {
        assert_eq!(Interpreter::new(&output).run(&[n]), Interpreter::new(&input).run(&[n]));
    }
}
