use std::sync::Arc;

use pretty_assertions::assert_eq;
use shaftc_ir::{
    CallDescriptor, CallKind, FrameStateInfo, Graph, GraphBuilder, OverflowCheckedBinopKind,
    WordRepresentation,
};

use super::*;
use crate::{
    MoveOptimizer, RegisterConfiguration, run_frame_elider, run_jump_threading,
    test_utils::{select_and_allocate, single_instruction_blocks},
};

const WORD32: RegisterRepresentation = RegisterRepresentation::Word32;
const RET: [u8; 7] = [0x02, 0, 0, 0, 0, 0, 0];

fn compile(
    graph: &Graph,
    parameters: &[RegisterRepresentation],
    returns: &[RegisterRepresentation],
) -> (InstructionSequence, CompiledCode) {
    let (mut sequence, mut frame) =
        select_and_allocate(graph, parameters, returns, &RegisterConfiguration::reference()).unwrap();
    MoveOptimizer::new(&mut sequence).run();
    run_frame_elider(&mut sequence);
    run_jump_threading(&mut sequence);
    frame.freeze();
    let code = CodeGenerator::new(&Session::default(), &sequence, &frame).generate().unwrap();
    (sequence, code)
}

fn frozen_frame() -> Frame {
    let mut frame = Frame::new(0, 0);
    frame.freeze();
    frame
}

fn jump(target: u32) -> Instruction {
    let target = InstructionOperand::Immediate(Immediate::Block(RpoNumber::from_u32(target)));
    Instruction::new(ArchOpcode::ArchJmp, [], [target], [])
}

fn ret() -> Instruction {
    Instruction::new(ArchOpcode::ArchRet, [], [], [])
}

#[test]
fn jump_to_the_next_block_is_left_out() {
    let sequence = single_instruction_blocks(vec![jump(1), ret()]);
    let code = CodeGenerator::new(&Session::default(), &sequence, &frozen_frame()).generate().unwrap();
    assert_eq!(code.code, RET.to_vec());
}

#[test]
fn jump_targets_are_patched_with_block_offsets() {
    let sequence = single_instruction_blocks(vec![jump(2), ret(), ret()]);
    let code = CodeGenerator::new(&Session::default(), &sequence, &frozen_frame()).generate().unwrap();

    // opcode, addressing mode, flags, counts, then the block operand
    assert_eq!(&code.code[..8], &[0x01, 0, 0, 0, 1, 0, 0, BLOCK_OPERAND]);
    assert_eq!(&code.code[8..12], &19u32.to_le_bytes());
    assert_eq!(code.code.len(), 12 + 2 * RET.len());
}

#[test]
fn skipped_blocks_are_not_emitted() {
    let mut sequence = single_instruction_blocks(vec![jump(1), jump(2), ret()]);
    assert!(run_jump_threading(&mut sequence));
    let code = CodeGenerator::new(&Session::default(), &sequence, &frozen_frame()).generate().unwrap();
    assert_eq!(code.code, RET.to_vec());
}

#[test]
fn unallocated_operands_are_rejected() {
    let mut sequence = single_instruction_blocks(vec![ret()]);
    let vreg = sequence.new_vreg(WORD32);
    sequence.instructions[0].inputs.push(InstructionOperand::Unallocated(
        crate::UnallocatedOperand::new(vreg, crate::OperandPolicy::Any),
    ));
    let result = CodeGenerator::new(&Session::default(), &sequence, &frozen_frame()).generate();
    assert!(matches!(result, Err(BailoutReason::CodeGenerationFailed(_))), "{result:?}");
}

#[test]
fn frame_must_be_frozen() {
    let sequence = single_instruction_blocks(vec![ret()]);
    let frame = Frame::new(0, 0);
    let result = CodeGenerator::new(&Session::default(), &sequence, &frame).generate();
    assert!(matches!(result, Err(BailoutReason::CodeGenerationFailed(_))), "{result:?}");
}

#[test]
fn leaf_function_builds_no_frame() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let p = b.parameter(0, WORD32);
    let one = b.word32_constant(1);
    let sum = b.word32_add(p, one);
    b.return_([sum]);
    let (_, code) = compile(&b.finish(), &[WORD32], &[WORD32]);

    assert!(!code.code.is_empty());
    assert_eq!(code.frame_size, None);
    assert!(code.safepoints.is_empty());
    assert!(code.deoptimization_exits.is_empty());
}

#[test]
fn call_records_a_safepoint_and_its_source_position() {
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let object = b.parameter(0, RegisterRepresentation::Tagged);
    let target = b.external_constant(0x1000);
    let descriptor = Arc::new(CallDescriptor::new(CallKind::Address, [], [WORD32]));
    b.set_current_position(SourcePosition::new(42));
    b.call(target, None, [], descriptor);
    b.set_current_position(SourcePosition::UNKNOWN);
    b.return_([object]);
    let (sequence, code) = compile(
        &b.finish(),
        &[RegisterRepresentation::Tagged],
        &[RegisterRepresentation::Tagged],
    );

    let call = sequence.instructions.iter().find(|instruction| instruction.is_call()).unwrap();
    let map = call.reference_map.as_ref().unwrap();
    assert_eq!(code.safepoints.len(), 1);
    let safepoint = &code.safepoints[0];
    assert_eq!(safepoint.slots, map.slots);
    assert_eq!(safepoint.deoptimization_entry, None);
    assert_eq!(code.safepoint_at(safepoint.pc_offset), Some(safepoint));
    assert!(code.frame_size.is_some_and(|size| size >= Frame::SLOT_SIZE), "{:?}", code.frame_size);

    assert_eq!(code.source_positions.len(), 1);
    let position = code.source_positions[0];
    assert_eq!(position.position, SourcePosition::new(42));
    assert!(position.pc_offset < safepoint.pc_offset);
}

#[test]
fn deoptimization_exits_follow_the_body() {
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
    let (_, code) = compile(&b.finish(), &[WORD32, WORD32], &[WORD32]);

    assert_eq!(code.deoptimization_exits.len(), 1);
    let exit = &code.deoptimization_exits[0];
    assert_eq!(exit.kind, DeoptimizeKind::Eager);
    assert_eq!(exit.reason, DeoptimizeReason::Overflow);
    assert!(exit.pc_offset < exit.exit_offset);
    let mut stub = vec![DEOPTIMIZATION_EXIT];
    stub.extend(exit.entry.to_le_bytes());
    assert_eq!(&code.code[exit.exit_offset as usize..], stub.as_slice());
}
