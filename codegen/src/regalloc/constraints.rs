use shaftc_session::BailoutReason;

use super::{LifetimePosition, RegisterAllocationData};
use crate::{
    AllocatedOperand, ArchOpcode, GapPosition, InstructionOperand, Linkage, Location,
    OperandPolicy, RegisterClass, RpoNumber, UnallocatedOperand, VirtualRegister,
};

const STAGE: &str = "register-allocation";

impl RegisterAllocationData<'_> {
    /// Rewrite operands with fixed locations into moves around their instruction, so that the
    /// allocator only sees register and any-location policies.
    ///
    /// The registers claimed by fixed operands and clobbered by calls are reserved over the
    /// positions at which they are claimed.
    pub fn meet_register_constraints(&mut self) -> Result<(), BailoutReason> {
        for index in 0..self.instruction_count() {
            self.meet_same_as_input_constraints(index)?;
            self.meet_input_constraints(index);
            self.meet_temp_constraints(index);
            self.meet_fixed_output_constraints(index)?;
            self.block_call_clobbers(index);
        }
        Ok(())
    }

    /// An output reusing the register of an input gets a fresh copy of the input moved into it
    /// just before the instruction
    fn meet_same_as_input_constraints(&mut self, index: usize) -> Result<(), BailoutReason> {
        let output_count = self.sequence.instructions[index].outputs.len();
        for i in 0..output_count {
            let InstructionOperand::Unallocated(output) = self.sequence.instructions[index].outputs[i]
            else {
                continue;
            };
            let OperandPolicy::SameAsInput(input) = output.policy else {
                continue;
            };
            let input = input as usize;
            let source = match self.sequence.instructions[index].inputs.get(input) {
                Some(InstructionOperand::Unallocated(operand)) => operand.vreg,
                Some(InstructionOperand::Constant(vreg)) => *vreg,
                other => {
                    return Err(BailoutReason::InvalidGraph {
                        stage: STAGE,
                        message: format!(
                            "instruction {index} reuses input {input} which is not a value: {other:?}"
                        ),
                    });
                }
            };
            let source_operand = self.value_operand(source);
            let instruction = &mut self.sequence.instructions[index];
            instruction.gap_mut(GapPosition::End).push(
                source_operand,
                InstructionOperand::Unallocated(UnallocatedOperand::new(output.vreg, OperandPolicy::Any)),
            );
            instruction.inputs[input] = InstructionOperand::Unallocated(UnallocatedOperand::at_start(
                output.vreg,
                OperandPolicy::MustHaveRegister,
            ));
            instruction.outputs[i] = InstructionOperand::Unallocated(UnallocatedOperand::new(
                output.vreg,
                OperandPolicy::MustHaveRegister,
            ));
            if !self.sequence.is_constant(source) {
                self.join_bundles(source, output.vreg);
            }
        }
        Ok(())
    }

    fn meet_input_constraints(&mut self, index: usize) {
        let input_count = self.sequence.instructions[index].inputs.len();
        for i in 0..input_count {
            let InstructionOperand::Unallocated(operand) = self.sequence.instructions[index].inputs[i]
            else {
                continue;
            };
            let vreg = operand.vreg;
            let is_constant = self.sequence.is_constant(vreg);
            match operand.policy {
                OperandPolicy::Any if is_constant => {
                    self.sequence.instructions[index].inputs[i] = InstructionOperand::Constant(vreg);
                }
                OperandPolicy::Fixed(location) => {
                    let rep = self.sequence.rep_of(vreg);
                    let fixed = InstructionOperand::Allocated(AllocatedOperand { location, rep });
                    let source = self.value_operand(vreg);
                    let instruction = &mut self.sequence.instructions[index];
                    instruction.gap_mut(GapPosition::End).push(source, fixed);
                    instruction.inputs[i] = fixed;
                    if let Location::Register(reg) = location {
                        let end = if operand.is_used_at_start() {
                            LifetimePosition::instruction_end(index)
                        } else {
                            LifetimePosition::gap_start(index + 1)
                        };
                        self.block_fixed(reg, LifetimePosition::gap_end(index), end);
                        if !is_constant {
                            self.register_hints.entry(vreg).or_insert(reg);
                        }
                    }
                }
                _ if is_constant => {
                    // Materialize the constant into a register of its own
                    let temp = self.sequence.new_vreg(self.sequence.rep_of(vreg));
                    let instruction = &mut self.sequence.instructions[index];
                    instruction.gap_mut(GapPosition::End).push(
                        InstructionOperand::Constant(vreg),
                        InstructionOperand::Unallocated(UnallocatedOperand::new(temp, OperandPolicy::Any)),
                    );
                    instruction.inputs[i] =
                        InstructionOperand::Unallocated(UnallocatedOperand { vreg: temp, ..operand });
                }
                _ => (),
            }
        }
    }

    fn meet_temp_constraints(&mut self, index: usize) {
        let temp_count = self.sequence.instructions[index].temps.len();
        for i in 0..temp_count {
            let InstructionOperand::Unallocated(UnallocatedOperand {
                vreg,
                policy: OperandPolicy::Fixed(location),
                ..
            }) = self.sequence.instructions[index].temps[i]
            else {
                continue;
            };
            let rep = self.sequence.rep_of(vreg);
            self.sequence.instructions[index].temps[i] =
                InstructionOperand::Allocated(AllocatedOperand { location, rep });
            if let Location::Register(reg) = location {
                self.block_fixed(
                    reg,
                    LifetimePosition::instruction_start(index),
                    LifetimePosition::gap_start(index + 1),
                );
            }
        }
    }

    /// Fixed outputs are written to their location and moved into the virtual register right
    /// after the instruction
    fn meet_fixed_output_constraints(&mut self, index: usize) -> Result<(), BailoutReason> {
        let output_count = self.sequence.instructions[index].outputs.len();
        for i in 0..output_count {
            let InstructionOperand::Unallocated(UnallocatedOperand {
                vreg,
                policy: OperandPolicy::Fixed(location),
                ..
            }) = self.sequence.instructions[index].outputs[i]
            else {
                continue;
            };
            if self.is_block_last(index) {
                return Err(BailoutReason::InvalidGraph {
                    stage: STAGE,
                    message: format!("instruction {index} ends its block but defines a fixed output"),
                });
            }
            let rep = self.sequence.rep_of(vreg);
            let fixed = InstructionOperand::Allocated(AllocatedOperand { location, rep });
            self.sequence.instructions[index].outputs[i] = fixed;
            self.sequence.instructions[index + 1].gap_mut(GapPosition::Start).push(
                fixed,
                InstructionOperand::Unallocated(UnallocatedOperand::new(vreg, OperandPolicy::Any)),
            );
            if let Location::Register(reg) = location {
                // Incoming parameters occupy their registers from function entry
                let start = if self.is_parameter(index) {
                    LifetimePosition::gap_start(0)
                } else {
                    LifetimePosition::instruction_end(index)
                };
                self.block_fixed(reg, start, LifetimePosition::gap_start(index + 1));
                self.register_hints.entry(vreg).or_insert(reg);
            }
        }
        Ok(())
    }

    fn is_parameter(&self, index: usize) -> bool {
        let instruction = &self.sequence.instructions[index];
        instruction.opcode() == ArchOpcode::ArchNop && instruction.block == RpoNumber::from_u32(0)
    }

    /// A call destroys every register the callee is not required to preserve
    fn block_call_clobbers(&mut self, index: usize) {
        let Some(descriptor) = self.sequence.call_descriptor_at(index) else {
            return;
        };
        let preserves_general = descriptor.needs_caller_saved_registers();
        let preserves_fp = descriptor.needs_caller_saved_fp_registers();
        let config = self.config;
        for class in RegisterClass::ALL {
            let preserved = match class {
                RegisterClass::General => preserves_general,
                RegisterClass::Float | RegisterClass::Simd128 => preserves_fp,
            };
            for reg in config.allocatable(class) {
                if !preserved || Linkage::is_return_register(reg) {
                    self.block_fixed(
                        reg,
                        LifetimePosition::instruction_end(index),
                        LifetimePosition::gap_start(index + 1),
                    );
                }
            }
        }
    }

    /// Check that the moves of every phi can be placed at the end of its predecessors
    pub fn resolve_phis(&self) -> Result<(), BailoutReason> {
        for block in self.sequence.blocks.values() {
            for phi in block.phis.iter() {
                if phi.operands.len() != block.predecessors.len() {
                    return Err(BailoutReason::InvalidGraph {
                        stage: STAGE,
                        message: format!(
                            "phi {} of {} has {} inputs for {} predecessors",
                            phi.vreg,
                            block.rpo,
                            phi.operands.len(),
                            block.predecessors.len()
                        ),
                    });
                }
            }
            if block.phis.is_empty() {
                continue;
            }
            if let Some(pred) = block
                .predecessors
                .iter()
                .find(|pred| self.sequence.blocks[**pred].successors.len() != 1)
            {
                return Err(BailoutReason::InvalidGraph {
                    stage: STAGE,
                    message: format!("critical edge from {pred} to {} carries phi moves", block.rpo),
                });
            }
        }
        Ok(())
    }

    /// Group each phi with its inputs, so that they are preferably allocated to the same register
    pub fn build_bundles(&mut self) {
        let mut pairs = Vec::new();
        for block in self.sequence.blocks.values() {
            for phi in block.phis.iter() {
                for operand in phi.operands.iter() {
                    if !self.sequence.is_constant(*operand) {
                        pairs.push((phi.vreg, *operand));
                    }
                }
            }
        }
        for (phi, operand) in pairs {
            self.join_bundles(phi, operand);
        }
    }

    fn join_bundles(&mut self, a: VirtualRegister, b: VirtualRegister) {
        match (self.bundles.get(&a).copied(), self.bundles.get(&b).copied()) {
            (Some(x), Some(y)) if x == y => (),
            (Some(x), Some(y)) => {
                for id in self.bundles.values_mut() {
                    if *id == y {
                        *id = x;
                    }
                }
            }
            (Some(x), None) => {
                self.bundles.insert(b, x);
            }
            (None, Some(y)) => {
                self.bundles.insert(a, y);
            }
            (None, None) => {
                let id = a.as_u32();
                self.bundles.insert(a, id);
                self.bundles.insert(b, id);
            }
        }
    }
}
