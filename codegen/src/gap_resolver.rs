use smallvec::SmallVec;

use crate::{InstructionOperand, MoveOperands, ParallelMove, Register, RegisterClass};

/// Emits the sequential moves a parallel move is broken into
pub trait MoveEmitter {
    type Error;

    fn emit_move(
        &mut self,
        source: &InstructionOperand,
        destination: &InstructionOperand,
    ) -> Result<(), Self::Error>;
}

/// Orders the moves of a parallel move so that no source is overwritten before it is read.
///
/// Moves whose destination nobody else reads are emitted first. When every remaining move is
/// blocked, they form cycles: the source of one move is saved in the scratch register of its
/// class, and the move is completed from the scratch register once its destination is free.
#[derive(Debug, Default)]
pub struct GapResolver {
    pending: SmallVec<[MoveOperands; 8]>,
}

impl GapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve<E: MoveEmitter>(
        &mut self,
        moves: &ParallelMove,
        emitter: &mut E,
    ) -> Result<(), E::Error> {
        self.pending.clear();
        self.pending.extend(moves.iter().filter(|mv| !mv.is_redundant()).copied());

        while !self.pending.is_empty() {
            while let Some(index) = self.find_unblocked() {
                let mv = self.pending.remove(index);
                emitter.emit_move(&mv.source, &mv.destination)?;
            }
            if self.pending.is_empty() {
                break;
            }

            let mv = self.pending.remove(0);
            let scratch = scratch_for(&mv.destination);
            log::trace!(target: "gap-resolver", "breaking cycle at {mv} through {scratch}");
            emitter.emit_move(&mv.source, &scratch)?;
            self.pending.push(MoveOperands::new(scratch, mv.destination));
        }
        Ok(())
    }

    /// A move whose destination is not read by any other pending move
    fn find_unblocked(&self) -> Option<usize> {
        (0..self.pending.len()).find(|index| {
            let destination = &self.pending[*index].destination;
            self.pending
                .iter()
                .enumerate()
                .all(|(other, mv)| other == *index || !mv.source.interferes_with(destination))
        })
    }
}

fn scratch_for(operand: &InstructionOperand) -> InstructionOperand {
    let rep = operand.rep().unwrap_or(shaftc_ir::RegisterRepresentation::Word64);
    InstructionOperand::register(Register::scratch(RegisterClass::of(rep)), rep)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use shaftc_ir::RegisterRepresentation;

    use super::*;
    use crate::{Location, regs};

    /// Executes moves on a map of locations
    #[derive(Default)]
    struct Machine {
        values: HashMap<Location, u64>,
        moves: usize,
    }

    impl MoveEmitter for Machine {
        type Error = String;

        fn emit_move(
            &mut self,
            source: &InstructionOperand,
            destination: &InstructionOperand,
        ) -> Result<(), String> {
            let source = source.location().ok_or_else(|| format!("{source} is not a location"))?;
            let destination =
                destination.location().ok_or_else(|| format!("{destination} is not a location"))?;
            let value = self.values.get(&source).copied().ok_or_else(|| format!("{source} is empty"))?;
            self.values.insert(destination, value);
            self.moves += 1;
            Ok(())
        }
    }

    fn reg(code: u8) -> InstructionOperand {
        InstructionOperand::register(Register::general(code), RegisterRepresentation::Word64)
    }

    fn slot(index: i32) -> InstructionOperand {
        InstructionOperand::stack_slot(index, RegisterRepresentation::Word64)
    }

    fn run(moves: &ParallelMove, machine: &mut Machine) {
        GapResolver::new().resolve(moves, machine).unwrap();
    }

    #[test]
    fn swap_goes_through_the_scratch_register() {
        let mut machine = Machine::default();
        machine.values.insert(Location::Register(regs::R0), 10);
        machine.values.insert(Location::Register(regs::R1), 11);
        let mut moves = ParallelMove::default();
        moves.push(reg(0), reg(1));
        moves.push(reg(1), reg(0));
        run(&moves, &mut machine);

        assert_eq!(machine.values[&Location::Register(regs::R0)], 11);
        assert_eq!(machine.values[&Location::Register(regs::R1)], 10);
        assert_eq!(machine.moves, 3);
        assert!(machine.values.contains_key(&Location::Register(regs::SCRATCH)));
    }

    #[test]
    fn chains_are_emitted_back_to_front() {
        let mut machine = Machine::default();
        machine.values.insert(Location::Register(regs::R0), 1);
        machine.values.insert(Location::Register(regs::R1), 2);
        let mut moves = ParallelMove::default();
        moves.push(reg(0), reg(1));
        moves.push(reg(1), slot(0));
        moves.push(reg(0), reg(0));
        run(&moves, &mut machine);

        assert_eq!(machine.values[&Location::StackSlot(0)], 2);
        assert_eq!(machine.values[&Location::Register(regs::R1)], 1);
        assert_eq!(machine.moves, 2, "the redundant move is dropped and no scratch is needed");
    }

    prop_compose! {
        /// A permutation of locations, possibly with fan-out: every destination is distinct
        fn parallel_moves()(
            destinations in proptest::sample::subsequence((0u8..16).collect::<Vec<_>>(), 1..10),
            sources in proptest::collection::vec(0u8..16, 10),
        ) -> Vec<(u8, u8)> {
            destinations.into_iter().zip(sources).map(|(d, s)| (s, d)).collect()
        }
    }

    fn location(index: u8) -> InstructionOperand {
        if index < 8 { reg(index) } else { slot(index as i32 - 8) }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn resolved_moves_match_parallel_semantics(moves in parallel_moves()) {
            let mut machine = Machine::default();
            for index in 0..16u8 {
                let location = location(index).location().unwrap();
                machine.values.insert(location, 100 + index as u64);
            }
            let mut parallel = ParallelMove::default();
            for (source, destination) in moves.iter() {
                parallel.push(location(*source), location(*destination));
            }
            run(&parallel, &mut machine);

            for index in 0..16u8 {
                let expected = moves
                    .iter()
                    .find(|(_, destination)| *destination == index)
                    .map_or(100 + index as u64, |(source, _)| 100 + *source as u64);
                let location = location(index).location().unwrap();
                prop_assert_eq!(machine.values[&location], expected, "at {}", location);
            }
        }
    }
}
