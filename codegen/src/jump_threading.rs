use cranelift_entity::SecondaryMap;

use crate::{Immediate, InstructionOperand, InstructionSequence, RpoNumber};

/// Redirect jumps to blocks that do nothing but jump elsewhere, and mark those blocks skipped.
///
/// Only jump targets are rewritten: predecessor and successor lists still describe the original
/// control flow. Returns true if any block was skipped.
pub fn run_jump_threading(sequence: &mut InstructionSequence) -> bool {
    let forwarding = compute_forwarding(sequence);
    let mut skipped = 0;
    for rpo in sequence.blocks.keys().collect::<Vec<_>>() {
        if forwarding[rpo] != rpo {
            log::trace!(target: "jump-threading", "{rpo} forwards to {}", forwarding[rpo]);
            sequence.blocks[rpo].is_skipped = true;
            skipped += 1;
        }
    }
    if skipped == 0 {
        return false;
    }
    for instruction in sequence.instructions.iter_mut() {
        for operand in instruction.inputs.iter_mut() {
            if let InstructionOperand::Immediate(Immediate::Block(target)) = operand {
                *target = forwarding[*target];
            }
        }
    }
    log::debug!(target: "jump-threading", "skipped {skipped} of {} blocks", sequence.block_count());
    true
}

/// The block each block ultimately jumps to, or the block itself if it does any work
fn compute_forwarding(sequence: &InstructionSequence) -> SecondaryMap<RpoNumber, RpoNumber> {
    let mut direct = SecondaryMap::<RpoNumber, Option<RpoNumber>>::with_capacity(sequence.block_count());
    for (rpo, block) in sequence.blocks.iter() {
        direct[rpo] = forwards_to(sequence, rpo);
        if block.must_construct_frame || block.must_deconstruct_frame {
            direct[rpo] = None;
        }
    }

    let mut forwarding = SecondaryMap::with_default(RpoNumber::from_u32(0));
    for rpo in sequence.blocks.keys() {
        // Follow the chain; a cycle of empty blocks is an infinite loop and stays as it is
        let mut target = rpo;
        let mut steps = 0;
        while let Some(next) = direct[target] {
            target = next;
            steps += 1;
            if target == rpo || steps > sequence.block_count() {
                target = rpo;
                break;
            }
        }
        forwarding[rpo] = target;
    }
    forwarding
}

/// The target of `rpo` if all it does is jump there
fn forwards_to(sequence: &InstructionSequence, rpo: RpoNumber) -> Option<RpoNumber> {
    // Execution starts at the first block
    if rpo.as_u32() == 0 {
        return None;
    }
    let instructions = sequence.block_instructions(rpo);
    let (last, rest) = instructions.split_last()?;
    if !last.is_jump() || !last.are_moves_redundant() {
        return None;
    }
    if !rest.iter().all(|instruction| instruction.is_nop() && instruction.are_moves_redundant()) {
        return None;
    }
    last.inputs.first().and_then(InstructionOperand::as_block)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::RegisterRepresentation;

    use super::*;
    use crate::{ArchOpcode, test_utils::single_instruction_blocks as sequence_of};

    const WORD32: RegisterRepresentation = RegisterRepresentation::Word32;

    fn block_operand(rpo: u32) -> InstructionOperand {
        InstructionOperand::Immediate(Immediate::Block(RpoNumber::from_u32(rpo)))
    }

    fn jump(target: u32) -> crate::Instruction {
        crate::Instruction::new(ArchOpcode::ArchJmp, [], [block_operand(target)], [])
    }

    fn targets(sequence: &InstructionSequence, index: usize) -> Vec<u32> {
        sequence.instructions[index]
            .inputs
            .iter()
            .filter_map(InstructionOperand::as_block)
            .map(|rpo| rpo.as_u32())
            .collect()
    }

    #[test]
    fn chains_of_empty_jumps_are_threaded() {
        let switch = crate::Instruction::new(
            ArchOpcode::ArchTableSwitch,
            [],
            [
                InstructionOperand::Immediate(Immediate::Int32(0)),
                block_operand(1),
                block_operand(2),
                block_operand(3),
            ],
            [],
        );
        let ret = crate::Instruction::new(ArchOpcode::ArchRet, [], [], []);
        let mut sequence = sequence_of(vec![switch, jump(2), jump(3), ret]);

        assert!(run_jump_threading(&mut sequence));
        assert_eq!(targets(&sequence, 0), vec![3, 3, 3]);
        let skipped: Vec<bool> = sequence.blocks.values().map(|block| block.is_skipped).collect();
        assert_eq!(skipped, vec![false, true, true, false]);
    }

    #[test]
    fn jump_with_moves_is_kept() {
        let mut with_move = jump(2);
        with_move.gap_mut(crate::GapPosition::Start).push(
            InstructionOperand::register(crate::regs::R1, WORD32),
            InstructionOperand::register(crate::regs::R0, WORD32),
        );
        let ret = crate::Instruction::new(ArchOpcode::ArchRet, [], [], []);
        let mut sequence = sequence_of(vec![jump(1), with_move, ret]);

        assert!(!run_jump_threading(&mut sequence));
        assert_eq!(targets(&sequence, 0), vec![1]);
    }

    #[test]
    fn cycle_of_empty_jumps_is_left_alone() {
        let mut sequence = sequence_of(vec![jump(1), jump(2), jump(1)]);
        assert!(!run_jump_threading(&mut sequence));
        assert!(sequence.blocks.values().all(|block| !block.is_skipped));
    }
}
