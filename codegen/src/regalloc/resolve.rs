use shaftc_session::BailoutReason;
use smallvec::SmallVec;

use super::{LifetimePosition, RegisterAllocationData};
use crate::{
    AllocatedOperand, GapPosition, InstructionOperand, Location, ParallelMove, VirtualRegister,
};

impl RegisterAllocationData<'_> {
    fn allocated(
        &self,
        vreg: VirtualRegister,
        pos: LifetimePosition,
    ) -> Result<InstructionOperand, BailoutReason> {
        Ok(InstructionOperand::Allocated(AllocatedOperand {
            location: self.location_at(vreg, pos)?,
            rep: self.sequence.rep_of(vreg),
        }))
    }

    fn commit_operands(
        &self,
        operands: &mut [InstructionOperand],
        pos: LifetimePosition,
    ) -> Result<(), BailoutReason> {
        for operand in operands.iter_mut() {
            if let InstructionOperand::Unallocated(unallocated) = *operand {
                *operand = self.allocated(unallocated.vreg, pos)?;
            }
        }
        Ok(())
    }

    /// Replace every operand still referring to a virtual register with the location allocated
    /// to it at that point
    pub fn commit_assignment(&mut self) -> Result<(), BailoutReason> {
        for index in 0..self.instruction_count() {
            let instruction = &self.sequence.instructions[index];
            let mut outputs = instruction.outputs.clone();
            let mut inputs = instruction.inputs.clone();
            let mut temps = instruction.temps.clone();
            let mut gaps = [
                instruction.gap(GapPosition::Start).clone(),
                instruction.gap(GapPosition::End).clone(),
            ];

            self.commit_operands(&mut outputs, LifetimePosition::instruction_end(index))?;
            self.commit_operands(&mut inputs, LifetimePosition::instruction_start(index))?;
            self.commit_operands(&mut temps, LifetimePosition::instruction_start(index))?;
            for (gap, pos) in gaps.iter_mut().zip([
                LifetimePosition::gap_start(index),
                LifetimePosition::gap_end(index),
            ]) {
                self.commit_moves(gap, pos)?;
            }

            let instruction = &mut self.sequence.instructions[index];
            instruction.outputs = outputs;
            instruction.inputs = inputs;
            instruction.temps = temps;
            let [start, end] = gaps;
            *instruction.gap_mut(GapPosition::Start) = start;
            *instruction.gap_mut(GapPosition::End) = end;
        }
        Ok(())
    }

    /// The sources of a parallel move are read just before its position, the destinations are
    /// written at it
    fn commit_moves(&self, moves: &mut ParallelMove, pos: LifetimePosition) -> Result<(), BailoutReason> {
        for mv in moves.iter_mut() {
            if let InstructionOperand::Unallocated(source) = mv.source {
                if pos.value() == 0 {
                    return Err(BailoutReason::InvalidGraph {
                        stage: "register-allocation",
                        message: format!("{} is read before the function starts", source.vreg),
                    });
                }
                mv.source = self.allocated(source.vreg, pos.prev())?;
            }
            if let InstructionOperand::Unallocated(destination) = mv.destination {
                mv.destination = self.allocated(destination.vreg, pos)?;
            }
        }
        Ok(())
    }

    /// Record the tagged values held in stack slots, and in registers where the instruction
    /// preserves them, at every instruction that may trigger a garbage collection
    pub fn populate_reference_maps(&mut self) {
        for index in 0..self.instruction_count() {
            if self.sequence.instructions[index].reference_map.is_none() {
                continue;
            }
            let pos = LifetimePosition::instruction_end(index);
            let mut slots = SmallVec::<[i32; 4]>::new();
            let mut registers = SmallVec::<[_; 2]>::new();
            for range in self.ranges.values() {
                if !self.sequence.is_tagged(range.vreg) || !range.covers(pos) {
                    continue;
                }
                match range.location {
                    Some(Location::StackSlot(slot)) => slots.push(slot),
                    Some(Location::Register(reg)) => registers.push(reg),
                    None => (),
                }
            }
            slots.sort_unstable();
            slots.dedup();
            registers.sort_unstable();
            registers.dedup();
            if let Some(map) = self.sequence.instructions[index].reference_map.as_mut() {
                map.slots = slots;
                if map.records_registers {
                    map.registers = registers;
                }
            }
        }
    }

    /// Insert moves between consecutive pieces of a split virtual register, where the split is
    /// not at the start of a block
    pub fn connect_ranges(&mut self) {
        let mut connections = Vec::new();
        for vreg in self.sequence.representations.keys() {
            for pair in self.children[vreg].windows(2) {
                let (head, tail) = (&self.ranges[pair[0]], &self.ranges[pair[1]]);
                let pos = tail.start();
                if head.end() != pos || self.is_block_start(pos) {
                    continue;
                }
                let (Some(from), Some(to)) = (head.location, tail.location) else {
                    continue;
                };
                if from != to {
                    connections.push((vreg, pos, from, to));
                }
            }
        }
        for (vreg, pos, from, to) in connections {
            let rep = self.sequence.rep_of(vreg);
            let gap = if pos.is_gap_start() {
                GapPosition::Start
            } else {
                GapPosition::End
            };
            self.sequence.instructions[pos.instruction_index()].gap_mut(gap).push(
                InstructionOperand::Allocated(AllocatedOperand { location: from, rep }),
                InstructionOperand::Allocated(AllocatedOperand { location: to, rep }),
            );
        }
    }

    /// Insert moves on control flow edges: values whose location differs between the end of the
    /// predecessor and the start of the successor, and phi inputs.
    ///
    /// Moves go to the start of the successor if it has a single predecessor, otherwise to the
    /// end of the predecessor, which then must not have other successors.
    pub fn resolve_control_flow(&mut self) -> Result<(), BailoutReason> {
        let mut edges = Vec::new();
        for (rpo, block) in self.sequence.blocks.iter() {
            let succ_start = LifetimePosition::gap_start(block.code_start);
            for (edge, pred) in block.predecessors.iter().enumerate() {
                let pred_block = &self.sequence.blocks[*pred];
                let last = pred_block.last_instruction();
                let pred_end = LifetimePosition::instruction_end(last);
                let mut moves = ParallelMove::default();
                for vreg in self.live_in[rpo].iter_ones() {
                    let vreg = VirtualRegister::from_u32(vreg as u32);
                    let from = self.allocated(vreg, pred_end)?;
                    let to = self.allocated(vreg, succ_start)?;
                    if from != to {
                        moves.push(from, to);
                    }
                }
                for phi in block.phis.iter() {
                    let operand = phi.operands[edge];
                    let from = if self.sequence.is_constant(operand) {
                        InstructionOperand::Constant(operand)
                    } else {
                        self.allocated(operand, pred_end)?
                    };
                    moves.push(from, self.allocated(phi.vreg, succ_start)?);
                }
                if moves.is_empty() {
                    continue;
                }
                let target = if block.predecessors.len() == 1 {
                    (block.code_start, GapPosition::Start)
                } else if pred_block.successors.len() == 1 {
                    (last, GapPosition::End)
                } else {
                    return Err(BailoutReason::InvalidGraph {
                        stage: "register-allocation",
                        message: format!("critical edge from {pred} to {rpo} needs moves"),
                    });
                };
                edges.push((target, moves));
            }
        }
        for ((index, gap), mut moves) in edges {
            let target = self.sequence.instructions[index].gap_mut(gap);
            for mv in moves.take() {
                target.push(mv.source, mv.destination);
            }
        }
        Ok(())
    }
}
