use std::sync::Arc;

use shaftc_ir::{CallDescriptor, CallDescriptorFlags, ConstantKind, DeoptimizeReason, OpIndex};
use shaftc_session::BailoutReason;
use smallvec::SmallVec;

use super::InstructionSelector;
use crate::{
    ArchOpcode, CallLinkage, DeoptimizeKind, Immediate, Instruction, InstructionOperand,
    LinkageLocation, Location, ReferenceMap, regs,
};

impl InstructionSelector<'_> {
    /// Select a call: stack arguments are poked into the outgoing argument area, register
    /// arguments and results are fixed to the locations of the calling convention, and results
    /// returned on the stack are peeked after the call. A descriptor asking for caller-saved
    /// registers gets the call bracketed by a save and a restore of those registers.
    pub(super) fn visit_call(
        &mut self,
        index: OpIndex,
        callee: OpIndex,
        frame_state: Option<OpIndex>,
        arguments: &[OpIndex],
        descriptor: &Arc<CallDescriptor>,
    ) -> Result<(), BailoutReason> {
        if arguments.len() != descriptor.parameter_count() {
            return Err(BailoutReason::unsupported(
                "Call",
                format!(
                    "{descriptor} expects {} arguments, got {}",
                    descriptor.parameter_count(),
                    arguments.len()
                ),
            ));
        }
        let descriptor_id = self.sequence.add_call_descriptor(descriptor.clone());
        let linkage = CallLinkage::new(descriptor);

        for (argument, location) in arguments.iter().zip(linkage.parameters.iter()) {
            if let Some(slot) = CallLinkage::outgoing_slot(*location) {
                let value = self.use_register_or_immediate(*argument);
                self.emit(Instruction::new(ArchOpcode::ArchPoke { slot }, [], [value], []))?;
            }
        }

        let mut outputs: SmallVec<[InstructionOperand; 2]> = SmallVec::new();
        let mut peeks = Vec::new();
        for (i, location) in linkage.returns.iter().enumerate() {
            let result = if i == 0 {
                Some(index).filter(|_| self.used[index])
            } else {
                self.graph()
                    .find_projection(index, i as u16)
                    .filter(|projection| self.is_used(*projection) && !self.is_defined(*projection))
            };
            let Some(result) = result else {
                continue;
            };
            match *location {
                LinkageLocation::Register(reg) => {
                    outputs.push(self.define_as_fixed(result, Location::Register(reg)));
                }
                LinkageLocation::CallerFrameSlot(_) => peeks.push((result, *location)),
            }
        }

        let mut inputs: SmallVec<[InstructionOperand; 4]> = SmallVec::new();
        let constant_target = match self.graph().match_constant(callee) {
            Some(
                ConstantKind::External(address)
                | ConstantKind::HeapObject(address)
                | ConstantKind::Word64(address),
            ) => Some(address),
            _ => None,
        };
        inputs.push(match constant_target {
            Some(address) => InstructionOperand::Immediate(Immediate::Int64(address as i64)),
            None if descriptor.flags.contains(CallDescriptorFlags::FIXED_TARGET_REGISTER) => {
                self.use_fixed(callee, Location::Register(regs::CALL_TARGET))
            }
            None => self.use_register_at_start(callee),
        });

        if descriptor.needs_frame_state() {
            let frame_state = frame_state.ok_or_else(|| {
                BailoutReason::unsupported("Call", format!("{descriptor} requires a frame state"))
            })?;
            self.append_deoptimization_inputs(
                frame_state,
                DeoptimizeKind::Lazy,
                DeoptimizeReason::Unknown,
                &mut inputs,
            )?;
        }

        for (argument, location) in arguments.iter().zip(linkage.parameters.iter()) {
            if let LinkageLocation::Register(reg) = *location {
                inputs.push(self.use_fixed(*argument, Location::Register(reg)));
            }
        }

        let mut call = Instruction::new(
            ArchOpcode::ArchCall {
                descriptor: descriptor_id,
            },
            outputs,
            inputs,
            [],
        );
        if descriptor.can_allocate() {
            call.reference_map = Some(ReferenceMap {
                records_registers: descriptor.needs_caller_saved_registers(),
                ..Default::default()
            });
        }
        let saves_registers =
            descriptor.needs_caller_saved_registers() || descriptor.needs_caller_saved_fp_registers();
        let fp = descriptor.needs_caller_saved_fp_registers();
        if saves_registers {
            self.emit(Instruction::new(ArchOpcode::ArchSaveCallerRegisters { fp }, [], [], []))?;
        }
        self.emit(call)?;
        if saves_registers {
            self.emit(Instruction::new(ArchOpcode::ArchRestoreCallerRegisters { fp }, [], [], []))?;
        }

        for (result, location) in peeks {
            let Some(slot) = CallLinkage::outgoing_slot(location) else {
                continue;
            };
            let output = self.define_as_register(result);
            self.emit(Instruction::new(ArchOpcode::ArchPeek { slot }, [output], [], []))?;
        }

        let pushed = linkage.stack_parameter_count + linkage.stack_return_count;
        self.sequence.max_pushed_argument_count = self.sequence.max_pushed_argument_count.max(pushed);
        log::trace!(
            target: "isel",
            "call {index} to {descriptor}: {} stack arguments, {} stack results",
            linkage.stack_parameter_count,
            linkage.stack_return_count
        );
        Ok(())
    }
}
