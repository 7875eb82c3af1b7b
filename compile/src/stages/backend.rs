//! Stages over the instruction sequence, from selection to the cleanups after allocation.

use shaftc_codegen::{
    Frame, InstructionScheduler, InstructionSequence, MoveOptimizer, allocate_registers,
    run_frame_elider, run_jump_threading, select_instructions,
};
use shaftc_ir::Graph;
use shaftc_session::BailoutReason;

use super::AllocatedFunction;
use crate::{CompilationContext, Stage};

pub struct InstructionSelectionStage;

impl Stage for InstructionSelectionStage {
    type Input = Graph;
    type Output = InstructionSequence;

    fn name(&self) -> &'static str {
        "instruction-selection"
    }

    fn run(
        &mut self,
        input: Graph,
        context: &CompilationContext,
    ) -> Result<InstructionSequence, BailoutReason> {
        let sequence = select_instructions(context.session(), &input, context.linkage())?;
        let statistics = &context.session().statistics;
        statistics.count(self.name(), "instructions", sequence.instructions.len());
        statistics.count(self.name(), "virtual registers", sequence.vreg_count());
        log::trace!(target: "driver", "selected instructions:\n{sequence}");
        Ok(sequence)
    }
}

/// Reorders the instructions of each block to start long latency chains early
pub struct SchedulingStage;

impl Stage for SchedulingStage {
    type Input = InstructionSequence;
    type Output = InstructionSequence;

    fn name(&self) -> &'static str {
        "instruction-scheduling"
    }

    fn enabled(&self, context: &CompilationContext) -> bool {
        context.session().options.turbo_instruction_scheduling
    }

    fn run(
        &mut self,
        mut input: InstructionSequence,
        _context: &CompilationContext,
    ) -> Result<InstructionSequence, BailoutReason> {
        InstructionScheduler::new(&mut input).run();
        Ok(input)
    }
}

pub struct AllocationStage;

impl Stage for AllocationStage {
    type Input = InstructionSequence;
    type Output = AllocatedFunction;

    fn name(&self) -> &'static str {
        "register-allocation"
    }

    fn run(
        &mut self,
        mut input: InstructionSequence,
        context: &CompilationContext,
    ) -> Result<AllocatedFunction, BailoutReason> {
        let mut frame =
            Frame::new(input.max_pushed_argument_count, input.max_unoptimized_frame_height);
        allocate_registers(context.session(), &mut input, context.registers(), &mut frame)?;
        context.session().statistics.count(self.name(), "spill slots", frame.spill_slot_count() as usize);
        Ok(AllocatedFunction {
            sequence: input,
            frame,
        })
    }
}

pub struct MoveOptimizationStage;

impl Stage for MoveOptimizationStage {
    type Input = AllocatedFunction;
    type Output = AllocatedFunction;

    fn name(&self) -> &'static str {
        "move-optimization"
    }

    fn run(
        &mut self,
        mut input: AllocatedFunction,
        _context: &CompilationContext,
    ) -> Result<AllocatedFunction, BailoutReason> {
        MoveOptimizer::new(&mut input.sequence).run();
        Ok(input)
    }
}

/// Decides where the frame is built, then fixes its size
pub struct FrameElisionStage;

impl Stage for FrameElisionStage {
    type Input = AllocatedFunction;
    type Output = AllocatedFunction;

    fn name(&self) -> &'static str {
        "frame-elision"
    }

    fn run(
        &mut self,
        mut input: AllocatedFunction,
        context: &CompilationContext,
    ) -> Result<AllocatedFunction, BailoutReason> {
        if !run_frame_elider(&mut input.sequence) {
            context.session().statistics.count(self.name(), "elided", 1);
        }
        input.frame.freeze();
        Ok(input)
    }
}

pub struct JumpThreadingStage;

impl Stage for JumpThreadingStage {
    type Input = AllocatedFunction;
    type Output = AllocatedFunction;

    fn name(&self) -> &'static str {
        "jump-threading"
    }

    fn run(
        &mut self,
        mut input: AllocatedFunction,
        context: &CompilationContext,
    ) -> Result<AllocatedFunction, BailoutReason> {
        if run_jump_threading(&mut input.sequence) {
            let skipped = input.sequence.blocks.values().filter(|block| block.is_skipped).count();
            context.session().statistics.count(self.name(), "skipped blocks", skipped);
        }
        Ok(input)
    }
}
