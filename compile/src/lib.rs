//! The pipeline driver.
//!
//! [compile] runs one function through a chain of [Stage]s: the graph reducers enabled by the
//! session options, instruction selection, optional scheduling, register allocation, the
//! post-allocation cleanups and code generation. Any stage may bail out with a
//! [shaftc_session::BailoutReason], which ends the compilation; nothing computed up to that
//! point is kept.

mod context;
mod stage;
pub mod stages;

use shaftc_ir::Graph;
use shaftc_session::BailoutReason;

pub use self::{
    context::CompilationContext,
    stage::{Chain, ChainOptional, FnStage, Stage},
    stages::{AllocatedFunction, CompiledFunction},
};
use self::stages::*;

/// The graph stages, in the order they run
pub fn optimization_pipeline() -> impl Stage<Input = Graph, Output = Graph> {
    VerifyInputStage
        .next_optional(LoopPeelingStage)
        .next_optional(LoopUnrollingStage)
        .next(SelectDetectionStage)
        .next_optional(TypeInferenceStage)
        .next_optional(BranchConditionDuplicationStage)
        .next(SelectLoweringStage)
        .next_optional(DecompressionOptimizationStage)
}

/// The stages from instruction selection to code generation
pub fn backend_pipeline() -> impl Stage<Input = Graph, Output = CompiledFunction> {
    InstructionSelectionStage
        .next_optional(SchedulingStage)
        .next(AllocationStage)
        .next(MoveOptimizationStage)
        .next(FrameElisionStage)
        .next(JumpThreadingStage)
        .next(CodegenStage)
}

/// Compile `graph`, the body of the function described by the linkage of `context`
pub fn compile(context: &CompilationContext, graph: Graph) -> Result<CompiledFunction, BailoutReason> {
    let session = context.session();
    log::debug!(target: "driver", "compiling {}", session.name);
    let result = optimization_pipeline().next(backend_pipeline()).run(graph, context);
    if let Err(reason) = &result {
        log::debug!(target: "driver", "{}: bailed out: {reason}", session.name);
    }
    session.statistics.log_summary(&session.name);
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use shaftc_ir::{CallDescriptor, CallKind, RegisterRepresentation};
    use shaftc_session::{Options, Session};

    use crate::CompilationContext;

    pub fn init_logger() {
        let _ = env_logger::Builder::from_env("SHAFTC_TRACE")
            .format_timestamp(None)
            .is_test(true)
            .try_init();
    }

    /// A context for a function from `Word32` to `Word32`, with options parsed from `argv`
    pub fn context_with(argv: &[&str]) -> CompilationContext {
        init_logger();
        let options = Options::parse_argv(argv.iter().copied()).unwrap();
        let descriptor = CallDescriptor::new(
            CallKind::CodeObject,
            [RegisterRepresentation::Word32],
            [RegisterRepresentation::Word32],
        );
        CompilationContext::new(Session::new("test", options), Arc::new(descriptor))
    }
}
