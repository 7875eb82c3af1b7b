use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use shaftc_ir::{CallDescriptor, CallKind, Graph, GraphBuilder, OpIndex, RegisterRepresentation};
use shaftc_session::{BailoutReason, Session};

use super::*;
use crate::{
    ArchOpcode, Constant, GapPosition, Immediate, Instruction, InstructionBlock, InstructionOperand,
    InstructionSequence, Linkage, Location, PhiInstruction, RegisterClass, RpoNumber,
    select_instructions,
    simulator::{Outcome, Simulator},
    test_utils::{build_program, init_logger, program_steps, select_and_allocate},
};

const WORD32: RegisterRepresentation = RegisterRepresentation::Word32;
const CALLEE: u64 = 0x1000;

/// Check that allocation left no virtual register behind, and that no instruction writes two
/// outputs to the same location
fn check_allocation(sequence: &InstructionSequence) {
    for (index, instruction) in sequence.instructions.iter().enumerate() {
        let operands = instruction
            .outputs
            .iter()
            .chain(instruction.inputs.iter())
            .chain(instruction.temps.iter());
        for operand in operands {
            assert!(!operand.is_unallocated(), "instruction {index} still has {operand}");
        }
        for position in [GapPosition::Start, GapPosition::End] {
            for mv in instruction.gap(position).iter() {
                assert!(
                    !mv.source.is_unallocated() && !mv.destination.is_unallocated(),
                    "gap of instruction {index} still has {mv}"
                );
            }
        }
        let outputs: Vec<_> = instruction.outputs.iter().filter_map(|output| output.location()).collect();
        for (i, location) in outputs.iter().enumerate() {
            assert!(
                !outputs[i + 1..].contains(location),
                "instruction {index} writes {location} twice"
            );
        }
    }
}

fn allocate(
    graph: &Graph,
    parameters: &[RegisterRepresentation],
    returns: &[RegisterRepresentation],
) -> (InstructionSequence, Frame) {
    let (sequence, frame) =
        select_and_allocate(graph, parameters, returns, &RegisterConfiguration::reference()).unwrap();
    check_allocation(&sequence);
    (sequence, frame)
}

fn call_callee(b: &mut GraphBuilder, arguments: &[OpIndex]) -> OpIndex {
    let target = b.external_constant(CALLEE);
    let descriptor = Arc::new(CallDescriptor::new(
        CallKind::Address,
        arguments.iter().map(|_| WORD32),
        [WORD32],
    ));
    b.call(target, None, arguments.iter().copied(), descriptor)
}

#[test]
fn straight_line_code_needs_no_spill_slots() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let q = b.parameter(1, WORD32);
    let sum = b.word32_add(p, q);
    let product = b.word32_mul(sum, p);
    let difference = b.word32_sub(product, q);
    b.return_([difference]);
    let (sequence, frame) = allocate(&b.finish(), &[WORD32, WORD32], &[WORD32]);

    assert_eq!(frame.spill_slot_count(), 0);
    let outcome = Simulator::new(&sequence, &frame).run(&[3, 4]).unwrap();
    assert_eq!(outcome, Outcome::Returned(vec![(3 + 4) * 3 - 4]));
}

#[test]
fn tagged_value_live_across_a_call_is_recorded_in_its_reference_map() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let object = b.parameter(0, RegisterRepresentation::Tagged);
    call_callee(&mut b, &[]);
    b.return_([object]);
    let (sequence, frame) = allocate(
        &b.finish(),
        &[RegisterRepresentation::Tagged],
        &[RegisterRepresentation::Tagged],
    );

    let call = sequence
        .instructions
        .iter()
        .find(|instruction| instruction.is_call())
        .unwrap();
    let map = call.reference_map.as_ref().unwrap();
    assert_eq!(map.slots.len(), 1, "{map:?}");
    assert!(map.registers.is_empty(), "registers are not preserved by the call");
    assert!((map.slots[0] as u32) < frame.spill_slot_count());

    let mut simulator = Simulator::new(&sequence, &frame);
    simulator.register_host_function(CALLEE, |_| vec![0]);
    assert_eq!(simulator.run(&[0xcafe]).unwrap(), Outcome::Returned(vec![0xcafe]));
}

#[test]
fn values_with_disjoint_lifetimes_share_a_spill_slot() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let one = b.word32_constant(1);
    let five = b.word32_constant(5);
    let seven = b.word32_constant(7);
    let first = b.word32_add(p, one);
    call_callee(&mut b, &[]);
    let between = b.word32_add(first, five);
    let second = b.word32_add(between, seven);
    call_callee(&mut b, &[]);
    let result = b.word32_add(second, one);
    b.return_([result]);
    let (sequence, frame) = allocate(&b.finish(), &[WORD32], &[WORD32]);

    assert_eq!(frame.spill_slot_count(), 1);
    let mut simulator = Simulator::new(&sequence, &frame);
    simulator.register_host_function(CALLEE, |_| vec![0]);
    assert_eq!(simulator.run(&[10]).unwrap(), Outcome::Returned(vec![24]));
}

#[test]
fn loop_phis_are_resolved_on_the_backedge() {
    // Iterates `(a, b) = (b, a + b)` n times, swapping the phis on every backedge
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    let header = b.new_loop_header();
    let body = b.new_block();
    let exit = b.new_block();
    b.bind(entry);
    let zero = b.word32_constant(0);
    let one = b.word32_constant(1);
    let n = b.parameter(0, WORD32);
    b.goto(header);
    b.bind(header);
    let i = b.pending_loop_phi(zero, WORD32);
    let a = b.pending_loop_phi(zero, WORD32);
    let fib = b.pending_loop_phi(one, WORD32);
    let done = b.word32_equal(i, n);
    b.branch(done, exit, body);
    b.bind(body);
    let next_i = b.word32_add(i, one);
    let next_fib = b.word32_add(a, fib);
    b.fix_loop_phi(i, next_i);
    b.fix_loop_phi(a, fib);
    b.fix_loop_phi(fib, next_fib);
    b.goto(header);
    b.bind(exit);
    b.return_([a]);
    let (sequence, frame) = allocate(&b.finish(), &[WORD32], &[WORD32]);

    let mut simulator = Simulator::new(&sequence, &frame);
    for (n, expected) in [(0, 0), (1, 1), (2, 1), (10, 55), (20, 6765)] {
        assert_eq!(simulator.run(&[n]).unwrap(), Outcome::Returned(vec![expected]), "fib({n})");
    }
}

#[test]
fn too_many_virtual_registers_bail_out() {
    init_logger();
    let descriptor = Arc::new(CallDescriptor::new(CallKind::CodeObject, [], []));
    let mut sequence = InstructionSequence::new(descriptor);
    for _ in 0..=MAX_VIRTUAL_REGISTERS {
        sequence.new_vreg(WORD32);
    }
    let mut frame = Frame::new(0, 0);
    let result = allocate_registers(
        &Session::default(),
        &mut sequence,
        &RegisterConfiguration::reference(),
        &mut frame,
    );
    assert_eq!(
        result,
        Err(BailoutReason::FunctionTooLarge {
            vregs: MAX_VIRTUAL_REGISTERS + 1,
            limit: MAX_VIRTUAL_REGISTERS,
        })
    );
}

#[test]
fn phi_on_a_critical_edge_is_rejected() {
    init_logger();
    let descriptor = Arc::new(CallDescriptor::new(CallKind::CodeObject, [], [WORD32]));
    let mut sequence = InstructionSequence::new(descriptor);
    let left = sequence.new_vreg(WORD32);
    let right = sequence.new_vreg(WORD32);
    let phi = sequence.new_vreg(WORD32);
    sequence.add_constant(left, Constant::Int32(1));
    sequence.add_constant(right, Constant::Int32(2));

    let b0 = RpoNumber::from_u32(0);
    let b1 = RpoNumber::from_u32(1);
    let b2 = RpoNumber::from_u32(2);
    let block_operand = |rpo| InstructionOperand::Immediate(Immediate::Block(rpo));
    let code = [
        (b0, Instruction::new(ArchOpcode::ArchNop, [InstructionOperand::Constant(left)], [], [])),
        (b0, Instruction::new(ArchOpcode::ArchNop, [InstructionOperand::Constant(right)], [], [])),
        (b0, Instruction::new(ArchOpcode::ArchTableSwitch, [], [block_operand(b1), block_operand(b2)], [])),
        (b1, Instruction::new(ArchOpcode::ArchJmp, [], [block_operand(b2)], [])),
        (b2, Instruction::new(ArchOpcode::ArchUnreachable, [], [], [])),
    ];
    for (block, mut instruction) in code {
        instruction.block = block;
        sequence.instructions.push(instruction);
    }
    for (rpo, range, predecessors, successors) in [
        (b0, 0..3, vec![], vec![b1, b2]),
        (b1, 3..4, vec![b0], vec![b2]),
        (b2, 4..5, vec![b0, b1], vec![]),
    ] {
        let mut block = InstructionBlock::new(rpo);
        block.code_start = range.start;
        block.code_end = range.end;
        block.predecessors = predecessors.into_iter().collect();
        block.successors = successors.into_iter().collect();
        sequence.blocks.push(block);
    }
    sequence.blocks[b2].phis.push(PhiInstruction {
        vreg: phi,
        operands: [left, right].into_iter().collect(),
    });

    let mut frame = Frame::new(0, 0);
    let result = allocate_registers(
        &Session::default(),
        &mut sequence,
        &RegisterConfiguration::reference(),
        &mut frame,
    );
    assert!(
        matches!(&result, Err(BailoutReason::InvalidGraph { message, .. }) if message.contains("critical edge")),
        "{result:?}"
    );
}

/// Run allocation up to register assignment and return every live range that got a register
fn assigned_ranges(graph: &Graph, config: &RegisterConfiguration) -> Vec<LiveRange> {
    let session = Session::default();
    let descriptor = CallDescriptor::new(CallKind::CodeObject, [WORD32, WORD32], [WORD32]);
    let linkage = Linkage::new(Arc::new(descriptor));
    let mut sequence = select_instructions(&session, graph, &linkage).unwrap();
    let mut frame = Frame::new(sequence.max_pushed_argument_count, sequence.max_unoptimized_frame_height);
    let mut data = RegisterAllocationData::new(&mut sequence, config, &mut frame);
    data.meet_register_constraints().unwrap();
    data.resolve_phis().unwrap();
    data.build_bundles();
    data.compute_live_in().unwrap();
    data.build_live_ranges();
    data.allocate_linear_scan().unwrap();
    data.ranges
        .values()
        .filter(|range| !range.is_empty() && matches!(range.location, Some(Location::Register(_))))
        .cloned()
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ranges_sharing_a_register_never_overlap(
        steps in program_steps(),
        registers in 3u8..7,
    ) {
        init_logger();
        let (graph, _) = build_program(&steps, 0, 0);
        let config = RegisterConfiguration::reference().restricted(RegisterClass::General, 0..registers);
        let ranges = assigned_ranges(&graph, &config);
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.location == b.location {
                    prop_assert_eq!(
                        a.first_intersection(&b.intervals),
                        None,
                        "{} and {} share a register",
                        a,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn allocation_under_register_pressure_preserves_semantics(
        steps in program_steps(),
        p in any::<u32>(),
        q in any::<u32>(),
    ) {
        let (graph, expected) = build_program(&steps, p, q);
        let config = RegisterConfiguration::reference().restricted(RegisterClass::General, [0, 1, 2]);
        let (sequence, frame) =
            select_and_allocate(&graph, &[WORD32, WORD32], &[WORD32], &config).unwrap();
        check_allocation(&sequence);
        let outcome = Simulator::new(&sequence, &frame).run(&[p as u64, q as u64]).unwrap();
        prop_assert_eq!(outcome, Outcome::Returned(vec![expected as u64]));
    }
}
