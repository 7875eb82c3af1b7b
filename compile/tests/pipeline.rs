use std::{cell::Cell, sync::Arc};

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use shaftc_codegen::{
    ArchOpcode,
    simulator::{Outcome, Simulator},
};
use shaftc_compile::{CompilationContext, CompiledFunction, compile};
use shaftc_ir::{
    CallDescriptor, CallDescriptorFlags, CallKind, ComparisonKind, DeoptimizeReason, FrameStateInfo, Graph,
    GraphBuilder, OverflowCheckedBinopKind, RegisterRepresentation, StackCheckKind, WordBinopKind,
    WordRepresentation,
};
use shaftc_session::{BailoutReason, Options, Session};

const WORD32: RegisterRepresentation = RegisterRepresentation::Word32;

fn init_logger() {
    let _ = env_logger::Builder::from_env("SHAFTC_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// A context for a function taking `parameters` Word32 values and returning one, with graph
/// verification on and the options in `argv`
fn context(parameters: usize, argv: &[&str]) -> CompilationContext {
    init_logger();
    let options = Options::parse_argv(["verify-graph"].iter().chain(argv).copied()).unwrap();
    let descriptor =
        CallDescriptor::new(CallKind::CodeObject, vec![WORD32; parameters], [WORD32]);
    CompilationContext::new(Session::new("test", options), Arc::new(descriptor))
}

fn run(function: &CompiledFunction, arguments: &[u64]) -> Outcome {
    Simulator::new(&function.sequence, &function.frame).run(arguments).unwrap()
}

fn add_one() -> Graph {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let one = b.word32_constant(1);
    let sum = b.word32_add(p, one);
    b.return_([sum]);
    b.finish()
}

/// `acc = 0; for i in 0..bound { acc += p }; return acc`, with `bound` a constant or the second
/// parameter
fn accumulating_loop(constant_bound: Option<u32>) -> Graph {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    let header = b.new_loop_header();
    let body = b.new_block();
    let exit = b.new_block();
    b.bind(entry);
    let zero = b.word32_constant(0);
    let one = b.word32_constant(1);
    let p = b.parameter(0, WORD32);
    let bound = match constant_bound {
        Some(bound) => b.word32_constant(bound),
        None => b.parameter(1, WORD32),
    };
    b.goto(header);
    b.bind(header);
    let i = b.pending_loop_phi(zero, WORD32);
    let acc = b.pending_loop_phi(zero, WORD32);
    let cond = b.comparison(i, bound, ComparisonKind::SignedLessThan, WORD32);
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

fn has_loop(function: &CompiledFunction) -> bool {
    function.sequence.blocks.values().any(|block| block.is_loop_header)
}

#[test]
fn add_one_compiles_and_runs() {
    let context = context(1, &[]);
    let function = compile(&context, add_one()).unwrap();

    assert!(!function.code.code.is_empty());
    assert_eq!(function.code.frame_size, None);
    assert_eq!(run(&function, &[0]), Outcome::Returned(vec![1]));
    assert_eq!(run(&function, &[41]), Outcome::Returned(vec![42]));
    assert_eq!(run(&function, &[u32::MAX as u64]), Outcome::Returned(vec![0]));
}

#[test]
fn every_stage_is_timed() {
    let context = context(1, &["turbo-instruction-scheduling"]);
    compile(&context, add_one()).unwrap();

    let statistics = &context.session().statistics;
    for stage in [
        "input",
        "loop-peeling",
        "loop-unrolling",
        "select-lowering",
        "instruction-selection",
        "instruction-scheduling",
        "register-allocation",
        "move-optimization",
        "frame-elision",
        "jump-threading",
        "codegen",
    ] {
        assert!(statistics.get(stage).is_some(), "no statistics for '{stage}'");
    }
    let codegen = statistics.get("codegen").unwrap();
    assert!(codegen.counters.iter().any(|(name, bytes)| *name == "bytes" && *bytes > 0));
}

#[test]
fn disabled_stages_do_not_run() {
    let context = context(
        1,
        &[
            "turboshaft-loop-peeling=false",
            "turboshaft-wasm=false",
            "turboshaft-type-inference=false",
            "pointer-compression=false",
        ],
    );
    let function = compile(&context, add_one()).unwrap();
    assert_eq!(run(&function, &[7]), Outcome::Returned(vec![8]));

    let statistics = &context.session().statistics;
    for stage in ["loop-peeling", "loop-unrolling", "type-inference", "instruction-scheduling"] {
        assert!(statistics.get(stage).is_none(), "'{stage}' ran");
    }
}

#[test]
fn small_constant_loop_is_unrolled_away() {
    let unrolled = compile(&context(1, &["turboshaft-loop-peeling=false"]), accumulating_loop(Some(3)))
        .unwrap();
    assert!(!has_loop(&unrolled), "{}", unrolled.sequence);

    let kept = compile(
        &context(1, &["turboshaft-loop-peeling=false", "turboshaft-wasm=false"]),
        accumulating_loop(Some(3)),
    )
    .unwrap();
    assert!(has_loop(&kept));

    for p in [0, 1, 5, 1000] {
        assert_eq!(run(&unrolled, &[p]), Outcome::Returned(vec![3 * p]), "p = {p}");
        assert_eq!(run(&kept, &[p]), Outcome::Returned(vec![3 * p]), "p = {p}");
    }
}

#[test]
fn loop_with_unknown_trip_count_keeps_its_semantics() {
    for argv in [&[][..], &["turbo-instruction-scheduling"][..], &["turboshaft-loop-peeling=false"][..]]
    {
        let function = compile(&context(2, argv), accumulating_loop(None)).unwrap();
        assert!(has_loop(&function));
        for n in [0u64, 1, 2, 4, 5, 9, 17] {
            assert_eq!(
                run(&function, &[3, n]),
                Outcome::Returned(vec![3 * n]),
                "n = {n} with {argv:?}"
            );
        }
    }
}

#[test]
fn call_gets_a_frame_and_a_safepoint() {
    const TARGET: u64 = 0x1000;
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let one = b.word32_constant(1);
    let kept = b.word32_add(p, one);
    let target = b.external_constant(TARGET);
    let descriptor = Arc::new(CallDescriptor::new(CallKind::Address, [WORD32], [WORD32]));
    let result = b.call(target, None, [p], descriptor);
    let sum = b.word32_add(result, kept);
    b.return_([sum]);

    let function = compile(&context(1, &[]), b.finish()).unwrap();
    assert!(function.code.frame_size.is_some());
    assert_eq!(function.code.safepoints.len(), 1);

    let calls = Cell::new(0);
    let mut simulator = Simulator::new(&function.sequence, &function.frame);
    simulator.register_host_function(TARGET, |arguments| {
        calls.set(calls.get() + 1);
        vec![arguments[0] * 10]
    });
    assert_eq!(simulator.run(&[4]).unwrap(), Outcome::Returned(vec![45]));
    assert_eq!(calls.get(), 1);
}

#[test]
fn caller_saved_registers_are_restored_after_the_call() {
    const TARGET: u64 = 0x2000;
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let one = b.word32_constant(1);
    let two = b.word32_constant(2);
    let first = b.word32_add(p, one);
    let second = b.word32_add(p, two);
    let target = b.external_constant(TARGET);
    let descriptor = CallDescriptor::new(CallKind::Address, [WORD32], [WORD32])
        .with_flags(CallDescriptorFlags::CALLER_SAVED_REGISTERS);
    let result = b.call(target, None, [p], Arc::new(descriptor));
    let sum = b.word32_add(result, first);
    let sum = b.word32_add(sum, second);
    b.return_([sum]);
    let graph = b.finish();

    for argv in [&[][..], &["turbo-instruction-scheduling"][..]] {
        let function = compile(&context(1, argv), graph.clone()).unwrap();
        let opcodes: Vec<ArchOpcode> =
            function.sequence.instructions.iter().map(|instruction| instruction.opcode()).collect();
        let call = opcodes.iter().position(ArchOpcode::is_call).unwrap();
        assert_eq!(opcodes[call - 1], ArchOpcode::ArchSaveCallerRegisters { fp: false });
        assert_eq!(opcodes[call + 1], ArchOpcode::ArchRestoreCallerRegisters { fp: false });
        assert_eq!(function.frame.spill_slot_count(), 0, "{}", function.sequence);

        let mut simulator = Simulator::new(&function.sequence, &function.frame);
        simulator.register_host_function(TARGET, |arguments| vec![arguments[0] * 10]);
        assert_eq!(simulator.run(&[4]).unwrap(), Outcome::Returned(vec![40 + 5 + 6]), "{argv:?}");
    }
}

#[test]
fn overflow_deoptimizes() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let q = b.parameter(1, WORD32);
    let binop =
        b.overflow_checked_binop(p, q, OverflowCheckedBinopKind::SignedAdd, WordRepresentation::Word32);
    let sum = b.projection(binop, 0, WORD32);
    let overflow = b.projection(binop, 1, WORD32);
    let frame_state = b.frame_state(
        [p, q],
        Arc::new(FrameStateInfo {
            bytecode_offset: 4,
            parameter_count: 2,
            local_count: 0,
            unoptimized_frame_height: 64,
        }),
    );
    b.deoptimize_if(overflow, frame_state, false, DeoptimizeReason::Overflow);
    b.return_([sum]);

    let function = compile(&context(2, &[]), b.finish()).unwrap();
    assert_eq!(function.code.deoptimization_exits.len(), 1);
    assert_eq!(run(&function, &[2, 3]), Outcome::Returned(vec![5]));
    match run(&function, &[i32::MAX as u64, 1]) {
        Outcome::Deoptimized { reason, values, .. } => {
            assert_eq!(reason, DeoptimizeReason::Overflow);
            assert_eq!(values, vec![i32::MAX as u64, 1]);
        }
        outcome => panic!("expected a deoptimization, got {outcome:?}"),
    }
}

#[test]
fn missing_parameter_location_bails_out() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let q = b.parameter(1, WORD32);
    let sum = b.word32_add(p, q);
    b.return_([sum]);

    let result = compile(&context(1, &[]), b.finish());
    assert!(
        matches!(result, Err(BailoutReason::UnsupportedOperation { .. })),
        "{:?}",
        result.err()
    );
}

/// One step of a generated function. Operands index the values defined so far, modulo their count.
#[derive(Debug, Clone)]
enum Step {
    Binop(WordBinopKind, usize, usize),
    /// The unsigned maximum of two values, computed with a branch and a phi
    Max(usize, usize),
}

fn step_lists() -> impl Strategy<Value = Vec<Step>> {
    let kind = prop_oneof![
        Just(WordBinopKind::Add),
        Just(WordBinopKind::Sub),
        Just(WordBinopKind::Mul),
        Just(WordBinopKind::BitwiseOr),
        Just(WordBinopKind::BitwiseXor),
    ];
    let step = prop_oneof![
        4 => (kind, any::<usize>(), any::<usize>()).prop_map(|(kind, l, r)| Step::Binop(kind, l, r)),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(l, r)| Step::Max(l, r)),
    ];
    proptest::collection::vec(step, 1..16)
}

/// Build a function of two parameters from `steps`, returning the last value, and compute what it
/// returns for `p` and `q`
fn build(steps: &[Step], p: u32, q: u32) -> (Graph, u32) {
    let rep = WordRepresentation::Word32;
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let mut values = vec![b.parameter(0, WORD32), b.parameter(1, WORD32)];
    let mut expected = vec![p as u64, q as u64];
    for step in steps {
        let count = values.len();
        match *step {
            Step::Binop(kind, l, r) => {
                let (l, r) = (l % count, r % count);
                values.push(b.word_binop(values[l], values[r], kind, rep));
                expected.push(kind.fold(expected[l], expected[r], rep).unwrap());
            }
            Step::Max(l, r) => {
                let (l, r) = (l % count, r % count);
                let if_greater = b.new_block();
                let otherwise = b.new_block();
                let merge = b.new_block();
                let greater = b.comparison(values[r], values[l], ComparisonKind::UnsignedLessThan, WORD32);
                b.branch(greater, if_greater, otherwise);
                b.bind(if_greater);
                b.goto(merge);
                b.bind(otherwise);
                b.goto(merge);
                b.bind(merge);
                values.push(b.phi([values[l], values[r]], WORD32));
                expected.push(expected[l].max(expected[r]));
            }
        }
    }
    let last = values[values.len() - 1];
    b.return_([last]);
    (b.finish(), expected[expected.len() - 1] as u32)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_functions_compute_what_they_describe(
        steps in step_lists(),
        p in any::<u32>(),
        q in any::<u32>(),
        scheduling in any::<bool>(),
    ) {
        let argv: &[&str] = if scheduling { &["turbo-instruction-scheduling"] } else { &[] };
        let (graph, expected) = build(&steps, p, q);
        let function = compile(&context(2, argv), graph).unwrap();
        prop_assert_eq!(run(&function, &[p as u64, q as u64]), Outcome::Returned(vec![expected as u64]));
    }
}
