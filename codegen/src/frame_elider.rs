use crate::{ArchOpcode, Instruction, InstructionSequence, RpoNumber};

/// Decide which blocks run with a frame, and where the frame is built and torn down.
///
/// A block needs a frame if one of its instructions calls, may deoptimize, or touches a stack
/// slot. Frames then spread down to every successor of a block with a frame, and up to blocks
/// whose successors all have one, until nothing changes. This relies on the sequence being in
/// edge-split form: a block with several successors is the only predecessor of each of them.
///
/// Returns true if any block runs with a frame.
pub fn run_frame_elider(sequence: &mut InstructionSequence) -> bool {
    mark_blocks(sequence);
    propagate_marks(sequence);
    mark_construction(sequence);
    let framed = sequence.blocks.values().filter(|block| block.needs_frame).count();
    log::debug!(
        target: "frame-elider",
        "{framed} of {} blocks need a frame",
        sequence.block_count()
    );
    framed > 0
}

fn needs_frame(instruction: &Instruction) -> bool {
    if instruction.is_call() || instruction.reference_map.is_some() {
        return true;
    }
    if matches!(
        instruction.opcode(),
        ArchOpcode::ArchDeoptimize
            | ArchOpcode::ArchStackCheck
            | ArchOpcode::ArchPoke { .. }
            | ArchOpcode::ArchPeek { .. }
    ) {
        return true;
    }
    let touches_stack = |operand: &crate::InstructionOperand| operand.is_stack_slot();
    instruction.outputs.iter().any(touches_stack)
        || instruction.inputs.iter().any(touches_stack)
        || instruction.temps.iter().any(touches_stack)
        || [crate::GapPosition::Start, crate::GapPosition::End].into_iter().any(|position| {
            instruction
                .gap(position)
                .iter()
                .any(|mv| !mv.is_redundant() && (touches_stack(&mv.source) || touches_stack(&mv.destination)))
        })
}

fn mark_blocks(sequence: &mut InstructionSequence) {
    for rpo in sequence.blocks.keys().collect::<Vec<_>>() {
        let range = sequence.blocks[rpo].instruction_range();
        let needed = sequence.instructions[range].iter().any(needs_frame);
        if needed {
            log::trace!(target: "frame-elider", "{rpo} needs a frame");
        }
        sequence.blocks[rpo].needs_frame |= needed;
    }
}

fn propagate_marks(sequence: &mut InstructionSequence) {
    let order: Vec<RpoNumber> = sequence.blocks.keys().collect();
    loop {
        let mut changed = false;
        for rpo in order.iter().copied() {
            changed |= propagate_into_block(sequence, rpo);
        }
        for rpo in order.iter().rev().copied() {
            changed |= propagate_into_block(sequence, rpo);
        }
        if !changed {
            break;
        }
    }
}

fn propagate_into_block(sequence: &mut InstructionSequence, rpo: RpoNumber) -> bool {
    let block = &sequence.blocks[rpo];
    if block.needs_frame {
        return false;
    }

    // Down from a predecessor with a frame
    let from_predecessor = block.predecessors.iter().any(|pred| sequence.blocks[*pred].needs_frame);

    // Up from successors that all have one
    let from_successors = !block.successors.is_empty()
        && block.successors.iter().all(|succ| sequence.blocks[*succ].needs_frame);

    if from_predecessor || from_successors {
        log::trace!(target: "frame-elider", "propagating frame into {rpo}");
        sequence.blocks[rpo].needs_frame = true;
        return true;
    }
    false
}

fn mark_construction(sequence: &mut InstructionSequence) {
    for rpo in sequence.blocks.keys().collect::<Vec<_>>() {
        let block = &sequence.blocks[rpo];
        if block.needs_frame {
            let construct = block.predecessors.is_empty();
            let deconstruct = block.successors.is_empty()
                && sequence.instructions[block.last_instruction()].opcode() == ArchOpcode::ArchRet;
            let block = &mut sequence.blocks[rpo];
            block.must_construct_frame |= construct;
            block.must_deconstruct_frame |= deconstruct;
        } else {
            let successors = block.successors.clone();
            for succ in successors {
                if sequence.blocks[succ].needs_frame {
                    sequence.blocks[succ].must_construct_frame = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use shaftc_ir::{CallDescriptor, CallKind, Graph, GraphBuilder, RegisterRepresentation};

    use super::*;
    use crate::{RegisterConfiguration, test_utils::select_and_allocate};

    const WORD32: RegisterRepresentation = RegisterRepresentation::Word32;

    fn framed(graph: &Graph) -> InstructionSequence {
        let (mut sequence, _) =
            select_and_allocate(graph, &[WORD32], &[WORD32], &RegisterConfiguration::reference())
                .unwrap();
        run_frame_elider(&mut sequence);
        check_frame_states(&sequence);
        sequence
    }

    /// Every edge must agree on whether a frame exists, and code that needs a frame must have one
    fn check_frame_states(sequence: &InstructionSequence) {
        let on_entry = |rpo: RpoNumber| {
            let block = &sequence.blocks[rpo];
            block.needs_frame && !block.must_construct_frame
        };
        let on_exit = |rpo: RpoNumber| {
            let block = &sequence.blocks[rpo];
            block.needs_frame && !block.must_deconstruct_frame
        };
        assert!(!on_entry(RpoNumber::from_u32(0)), "the function is entered without a frame");
        for (rpo, block) in sequence.blocks.iter() {
            for succ in block.successors.iter() {
                assert_eq!(on_exit(rpo), on_entry(*succ), "frame state differs on {rpo} -> {succ}");
            }
            let needed = sequence.block_instructions(rpo).iter().any(needs_frame);
            assert!(!needed || block.needs_frame, "{rpo} needs a frame\n{sequence}");
        }
    }

    fn call(b: &mut GraphBuilder, argument: shaftc_ir::OpIndex) -> shaftc_ir::OpIndex {
        let target = b.external_constant(0x1000);
        let descriptor = Arc::new(CallDescriptor::new(CallKind::Address, [WORD32], [WORD32]));
        b.call(target, None, [argument], descriptor)
    }

    #[test]
    fn leaf_function_runs_without_a_frame() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, WORD32);
        let one = b.word32_constant(1);
        let sum = b.word32_add(p, one);
        b.return_([sum]);
        let mut sequence = select_and_allocate(
            &b.finish(),
            &[WORD32],
            &[WORD32],
            &RegisterConfiguration::reference(),
        )
        .unwrap()
        .0;

        assert!(!run_frame_elider(&mut sequence));
        check_frame_states(&sequence);
        assert!(sequence.blocks.values().all(|block| !block.must_construct_frame));
    }

    #[test]
    fn fast_path_without_calls_skips_the_frame() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let fast = b.new_block();
        let slow = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, WORD32);
        let zero = b.word32_constant(0);
        let is_zero = b.word32_equal(p, zero);
        b.branch(is_zero, fast, slow);
        b.bind(fast);
        b.return_([zero]);
        b.bind(slow);
        let result = call(&mut b, p);
        b.return_([result]);
        let sequence = framed(&b.finish());

        let with_call = sequence
            .blocks
            .values()
            .find(|block| sequence.block_instructions(block.rpo).iter().any(Instruction::is_call))
            .unwrap();
        assert!(with_call.must_construct_frame && with_call.must_deconstruct_frame);
        assert_eq!(sequence.blocks.values().filter(|block| block.needs_frame).count(), 1);
    }

    #[test]
    fn frame_spreads_through_a_loop_containing_a_call() {
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
        let done = b.word32_equal(i, n);
        b.branch(done, exit, body);
        b.bind(body);
        let next = call(&mut b, i);
        let next = b.word32_add(next, one);
        b.fix_loop_phi(i, next);
        b.goto(header);
        b.bind(exit);
        b.return_([i]);
        let sequence = framed(&b.finish());

        assert!(sequence.blocks.values().all(|block| block.needs_frame), "{sequence}");
        let constructing: Vec<_> = sequence
            .blocks
            .values()
            .filter(|block| block.must_construct_frame)
            .map(|block| block.rpo)
            .collect();
        assert_eq!(constructing, vec![RpoNumber::from_u32(0)]);
    }
}
