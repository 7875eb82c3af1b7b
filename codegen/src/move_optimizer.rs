use smallvec::SmallVec;

use crate::{
    ArchOpcode, Frame, GapPosition, Instruction, InstructionOperand, InstructionSequence,
    MoveOperands, ParallelMove,
};

type Moves = SmallVec<[MoveOperands; 4]>;

const MAX_ROUNDS: usize = 16;

/// Reduces the number of moves the register allocator left in the gaps of a sequence.
///
/// The optimizer first merges the two gaps of every instruction into its start gap. Within a
/// block, moves are then pushed down past instructions that do not touch their operands, so that
/// they combine with later moves, and moves whose destination is overwritten by the next
/// instruction are dropped. Finally, moves common to all predecessors of a merge are hoisted into
/// the merge block.
pub struct MoveOptimizer<'a> {
    sequence: &'a mut InstructionSequence,
}

impl<'a> MoveOptimizer<'a> {
    pub fn new(sequence: &'a mut InstructionSequence) -> Self {
        Self { sequence }
    }

    /// Optimize until no gap changes any more, so that running the optimizer again has no effect
    pub fn run(&mut self) {
        let before = self.move_count();
        let mut rounds = 0;
        loop {
            let snapshot = self.gaps();
            self.run_once();
            rounds += 1;
            if self.gaps() == snapshot {
                break;
            }
            debug_assert!(rounds < MAX_ROUNDS, "no fixed point after {MAX_ROUNDS} rounds");
            if rounds == MAX_ROUNDS {
                log::warn!(target: "move-optimizer", "no fixed point after {MAX_ROUNDS} rounds");
                break;
            }
        }
        log::debug!(
            target: "move-optimizer",
            "{before} moves reduced to {} in {rounds} rounds",
            self.move_count()
        );
    }

    fn run_once(&mut self) {
        for instruction in self.sequence.instructions.iter_mut() {
            compress_gaps(instruction);
        }
        let blocks: Vec<_> = self.sequence.blocks.keys().collect();
        for block in blocks.iter().copied() {
            self.compress_block(self.sequence.blocks[block].instruction_range());
        }
        for block in blocks.iter().copied() {
            self.optimize_merge(block);
        }
        for instruction in self.sequence.instructions.iter_mut() {
            for gap in instruction.gaps_mut() {
                gap.remove_redundant();
            }
        }
    }

    fn gaps(&self) -> Vec<ParallelMove> {
        self.sequence
            .instructions
            .iter()
            .flat_map(|instruction| {
                [GapPosition::Start, GapPosition::End].map(|position| instruction.gap(position).clone())
            })
            .collect()
    }

    fn move_count(&self) -> usize {
        self.sequence
            .instructions
            .iter()
            .flat_map(|instruction| {
                [GapPosition::Start, GapPosition::End].map(|position| instruction.gap(position))
            })
            .map(|gap| gap.iter().filter(|mv| !mv.is_redundant()).count())
            .sum()
    }

    fn compress_block(&mut self, range: core::ops::Range<usize>) {
        let Some(first) = range.clone().next() else {
            return;
        };
        remove_clobbered_destinations(&mut self.sequence.instructions[first]);
        for index in range.skip(1) {
            let (before, after) = self.sequence.instructions.split_at_mut(index);
            migrate_moves(&mut after[0], &mut before[index - 1]);
            remove_clobbered_destinations(&mut after[0]);
        }
    }

    /// Hoist the moves every predecessor of `block` performs right before jumping to it
    fn optimize_merge(&mut self, block: crate::RpoNumber) {
        let data = &self.sequence.blocks[block];
        if data.predecessors.len() < 2 {
            return;
        }
        let mut jumps = SmallVec::<[usize; 4]>::new();
        for pred in data.predecessors.iter() {
            let pred = &self.sequence.blocks[*pred];
            let last = pred.last_instruction();
            if pred.successors.len() != 1 || self.sequence.instructions[last].opcode() != ArchOpcode::ArchJmp {
                return;
            }
            jumps.push(last);
        }
        let first = data.first_instruction();

        let gap_of = |index: usize| self.sequence.instructions[index].gap(GapPosition::Start);
        let mut common: Moves =
            gap_of(jumps[0]).iter().filter(|mv| !mv.is_redundant()).copied().collect();
        common.retain(|mv| jumps[1..].iter().all(|jump| gap_of(*jump).iter().any(|other| other == mv)));
        // A hoisted move executes after the moves left behind, so its source must survive them
        let common = retain_independent(common, &jumps, |index| gap_of(index).clone());
        if common.is_empty() {
            return;
        }
        let Some(merged) = compose(&common, self.sequence.instructions[first].gap(GapPosition::Start))
        else {
            return;
        };

        log::trace!(target: "move-optimizer", "hoisting {} moves into {block}", common.len());
        for jump in jumps {
            self.sequence.instructions[jump]
                .gap_mut(GapPosition::Start)
                .retain(|mv| !common.contains(mv));
        }
        *self.sequence.instructions[first].gap_mut(GapPosition::Start) = merged;
    }
}

/// Keep the moves of `common` whose sources are not written by the moves staying behind in any of
/// the gaps at `jumps`, repeating until no more moves are dropped
fn retain_independent(
    mut common: Moves,
    jumps: &[usize],
    gap_of: impl Fn(usize) -> ParallelMove,
) -> Moves {
    loop {
        let before = common.len();
        let snapshot = common.clone();
        common.retain(|mv| {
            jumps.iter().all(|jump| {
                gap_of(*jump)
                    .iter()
                    .filter(|other| !other.is_redundant() && !snapshot.contains(other))
                    .all(|other| !mv.source.interferes_with(&other.destination))
            })
        });
        if common.len() == before {
            return common;
        }
    }
}

/// Merge the end gap of `instruction` into its start gap
fn compress_gaps(instruction: &mut Instruction) {
    let gaps = instruction.gaps_mut();
    if gaps[1].is_empty() {
        gaps[1].clear();
        return;
    }
    if gaps[0].is_empty() {
        gaps.swap(0, 1);
        gaps[1].clear();
        return;
    }
    let later: Moves = gaps[1].iter().copied().collect();
    if let Some(merged) = compose_after(&gaps[0], &later) {
        gaps[0] = merged;
        gaps[1].clear();
    }
}

/// A parallel move equivalent to performing `first`, then `second`. Returns `None` if the moves
/// overlap in a way that cannot be expressed as a single parallel move.
fn compose(first: &[MoveOperands], second: &ParallelMove) -> Option<ParallelMove> {
    let mut initial = ParallelMove::default();
    for mv in first {
        initial.push(mv.source, mv.destination);
    }
    let later: Moves = second.iter().copied().collect();
    compose_after(&initial, &later)
}

fn compose_after(first: &ParallelMove, second: &[MoveOperands]) -> Option<ParallelMove> {
    let earlier: Moves = first.iter().filter(|mv| !mv.is_redundant()).copied().collect();
    let mut later: Moves = second.iter().filter(|mv| !mv.is_redundant()).copied().collect();

    // Read what the first moves wrote
    for mv in later.iter_mut() {
        let mut forwarded = None;
        for prior in earlier.iter() {
            if prior.destination.equals_canonicalized(&mv.source) {
                forwarded = Some(prior.source);
            } else if prior.destination.interferes_with(&mv.source) {
                return None;
            }
        }
        if let Some(source) = forwarded {
            mv.source = source;
        }
    }
    let mut merged = ParallelMove::default();
    for prior in earlier.iter() {
        let mut overwritten = false;
        for mv in later.iter() {
            if same_location(&mv.destination, &prior.destination) {
                overwritten = true;
            } else if mv.destination.interferes_with(&prior.destination) {
                return None;
            }
        }
        if !overwritten {
            merged.push(prior.source, prior.destination);
        }
    }
    for mv in later {
        merged.push(mv.source, mv.destination);
    }
    Some(merged)
}

/// True if writing `a` overwrites all of `b`
fn same_location(a: &InstructionOperand, b: &InstructionOperand) -> bool {
    a.equals_canonicalized(b)
        && match (a.rep(), b.rep()) {
            (Some(x), Some(y)) => !a.is_stack_slot() || Frame::slots_for(x) >= Frame::slots_for(y),
            _ => true,
        }
}

/// Push the moves in the gap of `from` that `from` does not depend on into the gap of `to`, the
/// instruction following it
fn migrate_moves(to: &mut Instruction, from: &mut Instruction) {
    if from.is_call() || from.reference_map.is_some() || from.opcode().is_block_terminator() {
        return;
    }
    let gap = from.gap(GapPosition::Start);
    if gap.is_empty() {
        return;
    }
    let written: SmallVec<[InstructionOperand; 4]> =
        from.outputs.iter().chain(from.temps.iter()).copied().collect();
    fn touches<'a>(
        operand: &InstructionOperand,
        mut operands: impl Iterator<Item = &'a InstructionOperand>,
    ) -> bool {
        operands.any(|other| other.interferes_with(operand) || operand.interferes_with(other))
    }

    let mut eligible: Moves = gap
        .iter()
        .filter(|mv| !mv.is_redundant())
        .filter(|mv| {
            !touches(&mv.destination, from.inputs.iter().chain(written.iter()))
                && !touches(&mv.source, written.iter())
        })
        .copied()
        .collect();
    // Moves staying behind now execute first, so they must not write the source of a migrated move
    loop {
        let before = eligible.len();
        let snapshot = eligible.clone();
        eligible.retain(|mv| {
            gap.iter()
                .filter(|other| !other.is_redundant() && !snapshot.contains(other))
                .all(|other| !mv.source.interferes_with(&other.destination))
        });
        if eligible.len() == before {
            break;
        }
    }
    if eligible.is_empty() {
        return;
    }
    let Some(merged) = compose(&eligible, to.gap(GapPosition::Start)) else {
        return;
    };
    *to.gap_mut(GapPosition::Start) = merged;
    from.gap_mut(GapPosition::Start).retain(|mv| !eligible.contains(mv));
}

/// Drop moves whose destination `instruction` overwrites without reading it
fn remove_clobbered_destinations(instruction: &mut Instruction) {
    if instruction.outputs.is_empty() && instruction.temps.is_empty() {
        return;
    }
    let written: SmallVec<[InstructionOperand; 4]> =
        instruction.outputs.iter().chain(instruction.temps.iter()).copied().collect();
    let inputs = instruction.inputs.clone();
    instruction.gap_mut(GapPosition::Start).retain(|mv| {
        let clobbered = written.iter().any(|output| same_location(output, &mv.destination));
        let read = inputs.iter().any(|input| input.interferes_with(&mv.destination));
        !clobbered || read
    });
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use shaftc_ir::RegisterRepresentation;

    use super::*;
    use crate::{
        Register, RegisterClass, RegisterConfiguration,
        simulator::Simulator,
        test_utils::{build_program, program_steps, select_and_allocate},
    };

    const WORD64: RegisterRepresentation = RegisterRepresentation::Word64;

    fn reg(code: u8) -> InstructionOperand {
        InstructionOperand::register(Register::general(code), WORD64)
    }

    fn slot(index: i32) -> InstructionOperand {
        InstructionOperand::stack_slot(index, WORD64)
    }

    fn moves(gap: &ParallelMove) -> Vec<String> {
        gap.iter().filter(|mv| !mv.is_redundant()).map(|mv| mv.to_string()).collect()
    }

    #[test]
    fn composing_forwards_sources_and_drops_overwritten_moves() {
        let mut first = ParallelMove::default();
        first.push(reg(0), reg(1));
        first.push(reg(2), slot(0));
        let second = [
            MoveOperands::new(reg(1), reg(3)),
            MoveOperands::new(reg(4), slot(0)),
        ];
        let merged = compose_after(&first, &second).unwrap();
        assert_eq!(
            moves(&merged),
            vec![
                "r1|w64 = r0|w64".to_string(),
                "r3|w64 = r0|w64".to_string(),
                "[sp:0]|w64 = r4|w64".to_string(),
            ]
        );
    }

    #[test]
    fn end_gap_is_merged_into_start_gap() {
        let mut instruction = Instruction::new(ArchOpcode::ArchNop, [], [], []);
        instruction.gap_mut(GapPosition::Start).push(reg(0), reg(1));
        instruction.gap_mut(GapPosition::End).push(reg(1), reg(2));
        compress_gaps(&mut instruction);
        assert!(instruction.gap(GapPosition::End).is_empty());
        assert_eq!(
            moves(instruction.gap(GapPosition::Start)),
            vec!["r1|w64 = r0|w64".to_string(), "r2|w64 = r0|w64".to_string()]
        );
    }

    #[test]
    fn move_into_an_output_register_is_dropped() {
        let mut instruction = Instruction::new(
            ArchOpcode::RtLea(shaftc_ir::WordRepresentation::Word64),
            [reg(0)],
            [reg(1), reg(2)],
            [],
        );
        instruction.gap_mut(GapPosition::Start).push(reg(3), reg(0));
        instruction.gap_mut(GapPosition::Start).push(reg(3), reg(1));
        remove_clobbered_destinations(&mut instruction);
        assert_eq!(moves(instruction.gap(GapPosition::Start)), vec!["r1|w64 = r3|w64".to_string()]);
    }

    #[test]
    fn moves_migrate_past_unrelated_instructions() {
        let mut from = Instruction::new(
            ArchOpcode::RtLea(shaftc_ir::WordRepresentation::Word64),
            [reg(0)],
            [reg(1), reg(2)],
            [],
        );
        from.gap_mut(GapPosition::Start).push(reg(3), reg(4));
        from.gap_mut(GapPosition::Start).push(reg(5), reg(1));
        let mut to = Instruction::new(ArchOpcode::ArchNop, [], [], []);
        migrate_moves(&mut to, &mut from);
        assert_eq!(moves(from.gap(GapPosition::Start)), vec!["r1|w64 = r5|w64".to_string()]);
        assert_eq!(moves(to.gap(GapPosition::Start)), vec!["r4|w64 = r3|w64".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn optimized_moves_preserve_semantics_and_reach_a_fixed_point(
            steps in program_steps(),
            p in any::<u32>(),
            q in any::<u32>(),
        ) {
            let (graph, expected) = build_program(&steps, p, q);
            let config = RegisterConfiguration::reference().restricted(RegisterClass::General, [0, 1, 2]);
            let word32 = RegisterRepresentation::Word32;
            let (mut sequence, frame) =
                select_and_allocate(&graph, &[word32, word32], &[word32], &config).unwrap();
            let before = sequence.instructions.iter()
                .map(|instruction| instruction.gap(GapPosition::Start).len() + instruction.gap(GapPosition::End).len())
                .sum::<usize>();
            MoveOptimizer::new(&mut sequence).run();
            let after = sequence.instructions.iter()
                .map(|instruction| instruction.gap(GapPosition::Start).len() + instruction.gap(GapPosition::End).len())
                .sum::<usize>();
            prop_assert!(after <= before);
            let once: Vec<ParallelMove> = sequence.instructions.iter()
                .flat_map(|instruction| [instruction.gap(GapPosition::Start).clone(), instruction.gap(GapPosition::End).clone()])
                .collect();
            MoveOptimizer::new(&mut sequence).run();
            let twice: Vec<ParallelMove> = sequence.instructions.iter()
                .flat_map(|instruction| [instruction.gap(GapPosition::Start).clone(), instruction.gap(GapPosition::End).clone()])
                .collect();
            prop_assert_eq!(once, twice, "a second run changed the sequence");
            let outcome = Simulator::new(&sequence, &frame).run(&[p as u64, q as u64]).unwrap();
            prop_assert_eq!(outcome, crate::simulator::Outcome::Returned(vec![expected as u64]));
        }
    }
}
