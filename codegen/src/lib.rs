//! The backend: lowers a [shaftc_ir::Graph] to machine code for the reference target.
//!
//! Instruction selection produces an [InstructionSequence] of target instructions over virtual
//! registers. The sequence is optionally scheduled, then register allocation rewrites every
//! virtual register to a register or stack slot, inserting parallel moves in the gaps between
//! instructions. The move optimizer, frame elider and jump threading clean up the allocated
//! sequence before the [CodeGenerator] emits bytes, resolving each parallel move with the
//! [GapResolver].

mod code_generator;
mod frame;
mod frame_elider;
mod gap_resolver;
mod instruction;
mod jump_threading;
mod linkage;
mod move_optimizer;
pub mod regalloc;
mod registers;
mod scheduler;
mod selector;
mod sequence;
pub mod simulator;

pub use self::{
    code_generator::{CodeGenerator, CompiledCode, DeoptimizationExit, SafepointEntry, SourcePositionEntry},
    frame::Frame,
    frame_elider::run_frame_elider,
    gap_resolver::{GapResolver, MoveEmitter},
    instruction::*,
    jump_threading::run_jump_threading,
    linkage::{CallLinkage, Linkage, LinkageLocation},
    move_optimizer::MoveOptimizer,
    regalloc::allocate_registers,
    registers::{Register, RegisterClass, RegisterConfiguration, regs},
    scheduler::InstructionScheduler,
    selector::{ContinuationKind, FlagsContinuation, InstructionSelector, select_instructions},
    sequence::{
        Constant, DeoptimizationEntry, DeoptimizeKind, InstructionBlock, InstructionSequence,
        PhiInstruction,
    },
};

#[cfg(test)]
pub(crate) mod test_utils;
