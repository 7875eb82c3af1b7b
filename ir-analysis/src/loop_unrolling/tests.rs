use pretty_assertions::assert_eq;
use proptest::prelude::*;
use shaftc_ir::{
    ComparisonKind, GraphBuilder, OverflowCheckedBinopKind, RegisterRepresentation, WordBinopKind,
    WordRepresentation,
};

use super::*;
use crate::test_utils::init_logger;

#[derive(Copy, Clone)]
enum Update {
    Word(WordBinopKind),
    Checked(OverflowCheckedBinopKind),
}

#[derive(Copy, Clone)]
enum Condition {
    /// `phi <kind> bound`, staying in the loop while true
    PhiLeft(ComparisonKind),
    /// `bound <kind> phi`, staying in the loop while true
    PhiRight(ComparisonKind),
    /// `phi == bound`, leaving the loop when true
    ExitWhenEqual,
}

/// Builds `for (i = init; cond(i, bound); i = update(i, step)) {}` over word32 values, returning the
/// graph and its loop header
fn counted_loop(init: u32, bound: u32, step: u32, update: Update, condition: Condition) -> Graph {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    let header = b.new_loop_header();
    let body = b.new_block();
    let exit = b.new_block();

    b.bind(entry);
    let init = b.word32_constant(init);
    let bound = b.word32_constant(bound);
    let step = b.word32_constant(step);
    b.goto(header);

    b.bind(header);
    let phi = b.pending_loop_phi(init, RegisterRepresentation::Word32);
    match condition {
        Condition::PhiLeft(kind) => {
            let cond = b.comparison(phi, bound, kind, RegisterRepresentation::Word32);
            b.branch(cond, body, exit);
        }
        Condition::PhiRight(kind) => {
            let cond = b.comparison(bound, phi, kind, RegisterRepresentation::Word32);
            b.branch(cond, body, exit);
        }
        Condition::ExitWhenEqual => {
            let cond = b.word32_equal(phi, bound);
            b.branch(cond, exit, body);
        }
    }

    b.bind(body);
    let next = match update {
        Update::Word(kind) => b.word_binop(phi, step, kind, WordRepresentation::Word32),
        Update::Checked(kind) => {
            let checked = b.overflow_checked_binop(phi, step, kind, WordRepresentation::Word32);
            b.projection(checked, 0, RegisterRepresentation::Word32)
        }
    };
    b.fix_loop_phi(phi, next);
    b.goto(header);

    b.bind(exit);
    b.return_([phi]);
    b.finish()
}

fn header() -> BlockIndex {
    BlockIndex::from_u32(1)
}

/// Runs `for (i = init; i < bound; i += step)` directly, with word32 wrapping
fn reference_iteration_count(init: i32, bound: i32, step: i32) -> IterationCount {
    let mut i = init;
    let mut count = 0;
    while i < bound {
        count += 1;
        if count > MAX_LOOP_ITERATIONS_FOR_FULL_UNROLLING {
            return IterationCount::TooMany;
        }
        i = i.wrapping_add(step);
    }
    IterationCount::Exact(count)
}

#[test]
fn simple_counted_loop_is_fully_unrolled() {
    init_logger();
    let graph = counted_loop(
        0,
        4,
        1,
        Update::Word(WordBinopKind::Add),
        Condition::PhiLeft(ComparisonKind::SignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    assert_eq!(analyzer.iteration_count(header()), IterationCount::Exact(4));
    assert_eq!(analyzer.iteration_count(header()).as_full_unroll_count(), 4);
    assert!(analyzer.should_fully_unroll_loop(header()));
    assert!(!analyzer.should_partially_unroll_loop(header()));
    assert!(analyzer.can_unroll_at_least_one_loop());
}

#[test]
fn long_loop_is_partially_unrolled() {
    init_logger();
    let graph = counted_loop(
        0,
        100,
        1,
        Update::Word(WordBinopKind::Add),
        Condition::PhiLeft(ComparisonKind::SignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    let count = analyzer.iteration_count(header());
    assert_eq!(count, IterationCount::TooMany);
    assert_eq!(count.as_full_unroll_count(), 0);
    assert!(!analyzer.should_fully_unroll_loop(header()));
    assert!(analyzer.should_partially_unroll_loop(header()));
}

#[test]
fn phi_on_the_right_of_the_comparison() {
    init_logger();
    // for (i = 5; 2 < i; i -= 1) visits 5, 4, 3
    let graph = counted_loop(
        5,
        2,
        1,
        Update::Word(WordBinopKind::Sub),
        Condition::PhiRight(ComparisonKind::SignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    assert_eq!(analyzer.iteration_count(header()), IterationCount::Exact(3));
}

#[test]
fn equality_exit() {
    init_logger();
    // for (i = 0; i != 3; i += 1)
    let graph =
        counted_loop(0, 3, 1, Update::Word(WordBinopKind::Add), Condition::ExitWhenEqual);
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    assert_eq!(analyzer.iteration_count(header()), IterationCount::Exact(3));
}

#[test]
fn unsupported_update_is_unknown() {
    init_logger();
    let graph = counted_loop(
        64,
        1,
        2,
        Update::Word(WordBinopKind::UnsignedDiv),
        Condition::PhiRight(ComparisonKind::UnsignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    assert_eq!(analyzer.iteration_count(header()), IterationCount::Unknown);
    assert!(analyzer.should_partially_unroll_loop(header()));
}

#[test]
fn checked_overflow_stops_the_simulation() {
    init_logger();
    let graph = counted_loop(
        i32::MAX as u32 - 1,
        u32::MAX,
        1,
        Update::Checked(OverflowCheckedBinopKind::SignedAdd),
        Condition::PhiLeft(ComparisonKind::UnsignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    assert_eq!(analyzer.iteration_count(header()), IterationCount::TooMany);
}

#[test]
fn checked_multiplication_is_unknown() {
    init_logger();
    // for (i = 1; i < 16; i *= 2) with an overflow check on the multiplication
    let graph = counted_loop(
        1,
        16,
        2,
        Update::Checked(OverflowCheckedBinopKind::SignedMul),
        Condition::PhiLeft(ComparisonKind::SignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    assert_eq!(analyzer.iteration_count(header()), IterationCount::Unknown);
    assert!(!analyzer.should_fully_unroll_loop(header()));
}

#[test]
fn condition_entry_point() {
    init_logger();
    let graph = counted_loop(
        0,
        2,
        1,
        Update::Word(WordBinopKind::Add),
        Condition::PhiLeft(ComparisonKind::SignedLessThan),
    );
    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    let condition = graph
        .operations(header())
        .find_map(|(index, op)| matches!(op, Operation::Comparison { .. }).then_some(index))
        .unwrap();
    assert_eq!(analyzer.can_unroll_loop_with_condition(condition), IterationCount::Exact(2));
}

#[test]
fn loop_not_exiting_through_its_header_is_not_unrolled() {
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
    let graph = b.finish();

    let analyzer = LoopUnrollingAnalyzer::new(&graph);
    let header = BlockIndex::from_u32(1);
    assert_eq!(analyzer.iteration_count(header), IterationCount::Unknown);
    assert!(!analyzer.should_fully_unroll_loop(header));
    assert!(!analyzer.should_partially_unroll_loop(header));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn iteration_count_matches_reference_interpreter(
        init in -8i32..8,
        bound in -8i32..8,
        step in 1i32..4,
    ) {
        let graph = counted_loop(
            init as u32,
            bound as u32,
            step as u32,
            Update::Word(WordBinopKind::Add),
            Condition::PhiLeft(ComparisonKind::SignedLessThan),
        );
        let analyzer = LoopUnrollingAnalyzer::new(&graph);
        let expected = reference_iteration_count(init, bound, step);
        prop_assert_eq!(analyzer.iteration_count(header()), expected);
        prop_assert_eq!(
            analyzer.iteration_count(header()).as_full_unroll_count(),
            expected.exact().unwrap_or(0)
        );
    }
}
