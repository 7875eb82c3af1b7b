use std::sync::Arc;

use proptest::prelude::*;
use shaftc_ir::{
    CallDescriptor, CallKind, Graph, GraphBuilder, RegisterRepresentation, ShiftKind,
    WordBinopKind, WordRepresentation,
};
use shaftc_session::{BailoutReason, Session};

use crate::{
    Frame, Instruction, InstructionBlock, InstructionOperand, InstructionSequence, Linkage,
    RegisterConfiguration, RpoNumber, allocate_registers, select_instructions,
};

pub fn init_logger() {
    let _ = env_logger::Builder::from_env("SHAFTC_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// Select instructions for `graph` and allocate registers with `config`
pub fn select_and_allocate(
    graph: &Graph,
    parameters: &[RegisterRepresentation],
    returns: &[RegisterRepresentation],
    config: &RegisterConfiguration,
) -> Result<(InstructionSequence, Frame), BailoutReason> {
    init_logger();
    let session = Session::default();
    let descriptor =
        CallDescriptor::new(CallKind::CodeObject, parameters.iter().copied(), returns.iter().copied());
    let linkage = Linkage::new(Arc::new(descriptor));
    let mut sequence = select_instructions(&session, graph, &linkage)?;
    let mut frame = Frame::new(sequence.max_pushed_argument_count, sequence.max_unoptimized_frame_height);
    allocate_registers(&session, &mut sequence, config, &mut frame)?;
    Ok((sequence, frame))
}

/// A sequence with one block per instruction, each block jumping to the blocks its instruction
/// names
pub fn single_instruction_blocks(code: Vec<Instruction>) -> InstructionSequence {
    let descriptor =
        CallDescriptor::new(CallKind::CodeObject, [], [RegisterRepresentation::Word32]);
    let mut sequence = InstructionSequence::new(Arc::new(descriptor));
    for (index, mut instruction) in code.into_iter().enumerate() {
        let rpo = RpoNumber::from_u32(index as u32);
        instruction.block = rpo;
        let mut block = InstructionBlock::new(rpo);
        block.successors = instruction.inputs.iter().filter_map(InstructionOperand::as_block).collect();
        block.code_start = index;
        block.code_end = index + 1;
        sequence.instructions.push(instruction);
        sequence.blocks.push(block);
    }
    sequence
}

/// One step of a generated program. Operands index the values defined so far, modulo their count.
#[derive(Debug, Clone)]
pub enum Step {
    Binop(WordBinopKind, usize, usize),
    ShiftLeft(usize, u8),
    /// The signed minimum of two values, computed with a branch and a phi
    Min(usize, usize),
}

fn step() -> impl Strategy<Value = Step> {
    let kind = prop_oneof![
        Just(WordBinopKind::Add),
        Just(WordBinopKind::Sub),
        Just(WordBinopKind::Mul),
        Just(WordBinopKind::BitwiseAnd),
        Just(WordBinopKind::BitwiseXor),
    ];
    prop_oneof![
        6 => (kind, any::<usize>(), any::<usize>()).prop_map(|(kind, l, r)| Step::Binop(kind, l, r)),
        2 => (any::<usize>(), 0u8..31).prop_map(|(value, amount)| Step::ShiftLeft(value, amount)),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(l, r)| Step::Min(l, r)),
    ]
}

pub fn program_steps() -> impl Strategy<Value = Vec<Step>> {
    proptest::collection::vec(step(), 1..24)
}

/// Build a function over two `Word32` parameters that keeps every intermediate value alive until
/// the end, where they are all combined, and evaluate it directly
pub fn build_program(steps: &[Step], p: u32, q: u32) -> (Graph, u32) {
    let rep = WordRepresentation::Word32;
    let word32 = RegisterRepresentation::Word32;
    let mut b = GraphBuilder::new();
    let entry = b.new_block();
    b.bind(entry);
    let mut values = vec![b.parameter(0, word32), b.parameter(1, word32)];
    let mut expected = vec![p as u64, q as u64];
    for step in steps {
        let count = values.len();
        match *step {
            Step::Binop(kind, l, r) => {
                let (l, r) = (l % count, r % count);
                values.push(b.word_binop(values[l], values[r], kind, rep));
                expected.push(kind.fold(expected[l], expected[r], rep).unwrap_or(0));
            }
            Step::ShiftLeft(value, amount) => {
                let value = value % count;
                let amount_op = b.word32_constant(amount as u32);
                values.push(b.shift(values[value], amount_op, ShiftKind::ShiftLeft, rep));
                expected.push(ShiftKind::ShiftLeft.fold(expected[value], amount as u64, rep));
            }
            Step::Min(l, r) => {
                let (l, r) = (l % count, r % count);
                let if_less = b.new_block();
                let otherwise = b.new_block();
                let merge = b.new_block();
                let less = b.int32_less_than(values[l], values[r]);
                b.branch(less, if_less, otherwise);
                b.bind(if_less);
                b.goto(merge);
                b.bind(otherwise);
                b.goto(merge);
                b.bind(merge);
                values.push(b.phi([values[l], values[r]], word32));
                let min = if (expected[l] as i32) < (expected[r] as i32) {
                    expected[l]
                } else {
                    expected[r]
                };
                expected.push(min);
            }
        }
    }
    let mut result = values[0];
    let mut result_value = expected[0];
    for (value, value_expected) in values.iter().zip(expected.iter()).skip(1) {
        result = b.word_binop(result, *value, WordBinopKind::BitwiseXor, rep);
        result_value ^= value_expected;
    }
    b.return_([result]);
    (b.finish(), result_value as u32)
}
