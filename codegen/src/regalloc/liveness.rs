use bitvec::{bitvec, vec::BitVec};
use cranelift_entity::{EntityRef, SecondaryMap};
use shaftc_session::BailoutReason;

use super::{LifetimePosition, LiveRange, RegisterAllocationData, UseInterval, UsePosition, add_interval};
use crate::{GapPosition, Instruction, InstructionOperand, OperandPolicy, RpoNumber, VirtualRegister};

/// A read or write of a virtual register by an instruction or one of its gaps
#[derive(Debug, Copy, Clone)]
enum Access {
    Def {
        vreg: VirtualRegister,
        pos: LifetimePosition,
        register: Option<LifetimePosition>,
    },
    Use {
        vreg: VirtualRegister,
        end: LifetimePosition,
        register: Option<LifetimePosition>,
    },
}

/// The accesses of instruction `index`, latest first
fn accesses(instruction: &Instruction, index: usize, mut f: impl FnMut(Access)) {
    let start = LifetimePosition::instruction_start(index);
    let end = LifetimePosition::instruction_end(index);
    let after = LifetimePosition::gap_start(index + 1);

    for output in instruction.outputs.iter() {
        if let InstructionOperand::Unallocated(operand) = output {
            f(Access::Def {
                vreg: operand.vreg,
                pos: end,
                register: operand.has_register_policy().then_some(end),
            });
        }
    }
    for temp in instruction.temps.iter() {
        if let InstructionOperand::Unallocated(operand) = temp {
            f(Access::Use {
                vreg: operand.vreg,
                end: after,
                register: Some(start),
            });
            f(Access::Def {
                vreg: operand.vreg,
                pos: start,
                register: None,
            });
        }
    }
    for input in instruction.inputs.iter() {
        if let InstructionOperand::Unallocated(operand) = input {
            f(Access::Use {
                vreg: operand.vreg,
                end: if operand.is_used_at_start() { end } else { after },
                register: (operand.policy == OperandPolicy::MustHaveRegister).then_some(start),
            });
        }
    }
    for (position, gap) in [
        (LifetimePosition::gap_end(index), GapPosition::End),
        (LifetimePosition::gap_start(index), GapPosition::Start),
    ] {
        let moves = instruction.gap(gap);
        for mv in moves.iter() {
            if let InstructionOperand::Unallocated(operand) = mv.destination {
                f(Access::Def {
                    vreg: operand.vreg,
                    pos: position,
                    register: None,
                });
            }
        }
        for mv in moves.iter() {
            if let InstructionOperand::Unallocated(operand) = mv.source {
                f(Access::Use {
                    vreg: operand.vreg,
                    end: position,
                    register: None,
                });
            }
        }
    }
}

impl RegisterAllocationData<'_> {
    /// The virtual registers live at the end of `block`: those live into a successor, and the
    /// inputs of successor phis flowing in from `block`
    fn live_out(&self, block: RpoNumber, live_in: &SecondaryMap<RpoNumber, BitVec>) -> BitVec {
        let mut live = bitvec![0; self.sequence.vreg_count()];
        for succ in self.sequence.blocks[block].successors.iter() {
            for vreg in live_in[*succ].iter_ones() {
                live.set(vreg, true);
            }
            let succ = &self.sequence.blocks[*succ];
            let Some(edge) = succ.predecessors.iter().position(|pred| *pred == block) else {
                continue;
            };
            for phi in succ.phis.iter() {
                let operand = phi.operands[edge];
                if !self.sequence.is_constant(operand) {
                    live.set(operand.index(), true);
                }
            }
        }
        live
    }

    /// Solve the live-in sets of all blocks by iterating to a fixpoint
    pub fn compute_live_in(&mut self) -> Result<(), BailoutReason> {
        let vreg_count = self.sequence.vreg_count();
        let mut upward_exposed: SecondaryMap<RpoNumber, BitVec> = SecondaryMap::new();
        let mut defined: SecondaryMap<RpoNumber, BitVec> = SecondaryMap::new();
        for (rpo, block) in self.sequence.blocks.iter() {
            let mut uses = bitvec![0; vreg_count];
            let mut defs = bitvec![0; vreg_count];
            for index in block.instruction_range().rev() {
                accesses(&self.sequence.instructions[index], index, |access| match access {
                    Access::Def { vreg, .. } => {
                        defs.set(vreg.index(), true);
                        uses.set(vreg.index(), false);
                    }
                    Access::Use { vreg, .. } => uses.set(vreg.index(), true),
                });
            }
            for phi in block.phis.iter() {
                defs.set(phi.vreg.index(), true);
                uses.set(phi.vreg.index(), false);
            }
            upward_exposed[rpo] = uses;
            defined[rpo] = defs;
        }

        let mut live_in: SecondaryMap<RpoNumber, BitVec> = SecondaryMap::new();
        for rpo in self.sequence.blocks.keys() {
            live_in[rpo] = bitvec![0; vreg_count];
        }
        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut changed = false;
            for rpo in self.sequence.blocks.keys().rev() {
                let mut live = self.live_out(rpo, &live_in);
                for vreg in defined[rpo].iter_ones() {
                    live.set(vreg, false);
                }
                for vreg in upward_exposed[rpo].iter_ones() {
                    live.set(vreg, true);
                }
                if live != live_in[rpo] {
                    live_in[rpo] = live;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        log::trace!(target: "regalloc", "liveness converged after {iterations} iterations");

        let entry = RpoNumber::from_u32(0);
        if let Some(vreg) = live_in[entry].first_one() {
            return Err(BailoutReason::InvalidGraph {
                stage: "register-allocation",
                message: format!("{} is used but never defined", VirtualRegister::new(vreg)),
            });
        }
        self.live_in = live_in;
        Ok(())
    }

    /// Build one live range per virtual register from the live-in sets, walking each block
    /// backwards from its live-out set
    pub fn build_live_ranges(&mut self) {
        for (vreg, rep) in self.sequence.representations.iter() {
            if self.sequence.is_constant(vreg) {
                continue;
            }
            let id = self.ranges.push(LiveRange::new(vreg, *rep));
            self.children[vreg].push(id);
        }

        let mut temps = Vec::new();
        let blocks = self.sequence.blocks.keys().collect::<Vec<_>>();
        for rpo in blocks.into_iter().rev() {
            let block = &self.sequence.blocks[rpo];
            let block_start = LifetimePosition::gap_start(block.code_start);
            let block_end = LifetimePosition::gap_start(block.code_end);
            let range = block.instruction_range();

            let mut live = self.live_out(rpo, &self.live_in);
            for vreg in live.iter_ones() {
                let id = self.children[VirtualRegister::new(vreg)][0];
                add_interval(&mut self.ranges[id].intervals, UseInterval::new(block_start, block_end));
            }

            for index in range.rev() {
                let mut found = Vec::new();
                accesses(&self.sequence.instructions[index], index, |access| found.push(access));
                for temp in self.sequence.instructions[index].temps.iter() {
                    if let InstructionOperand::Unallocated(operand) = temp {
                        temps.push(operand.vreg);
                    }
                }
                for access in found {
                    match access {
                        Access::Def { vreg, pos, register } => {
                            self.define(vreg, pos, &mut live);
                            if let Some(pos) = register {
                                let id = self.children[vreg][0];
                                self.ranges[id].uses.push(UsePosition { pos });
                            }
                        }
                        Access::Use { vreg, end, register } => {
                            let id = self.children[vreg][0];
                            if !live[vreg.index()] && block_start < end {
                                add_interval(
                                    &mut self.ranges[id].intervals,
                                    UseInterval::new(block_start, end),
                                );
                                live.set(vreg.index(), true);
                            }
                            if let Some(pos) = register {
                                self.ranges[id].uses.push(UsePosition { pos });
                            }
                        }
                    }
                }
            }

            let phis = self.sequence.blocks[rpo].phis.iter().map(|phi| phi.vreg).collect::<Vec<_>>();
            for phi in phis {
                self.define(phi, block_start, &mut live);
            }
        }

        for vreg in temps {
            if let Some(id) = self.children[vreg].first() {
                self.ranges[*id].unsplittable = true;
            }
        }
        for range in self.ranges.values_mut() {
            range.uses.sort_by_key(|use_pos| use_pos.pos);
            range.uses.dedup();
        }
        for vreg in self.sequence.representations.keys() {
            let empty = self.children[vreg].first().is_some_and(|id| self.ranges[*id].is_empty());
            if empty {
                self.children[vreg].clear();
            }
        }
        if log::log_enabled!(target: "regalloc", log::Level::Trace) {
            for range in self.ranges.values().filter(|range| !range.is_empty()) {
                log::trace!(target: "regalloc", "live range {range}");
            }
        }
    }

    /// Start the range of `vreg` at its definition at `pos`
    fn define(&mut self, vreg: VirtualRegister, pos: LifetimePosition, live: &mut BitVec) {
        let id = self.children[vreg][0];
        let range = &mut self.ranges[id];
        if live[vreg.index()] {
            range.intervals[0].start = pos;
            live.set(vreg.index(), false);
        } else {
            // A value nobody reads still occupies its location for a moment
            add_interval(&mut range.intervals, UseInterval::new(pos, pos.next()));
        }
    }
}
