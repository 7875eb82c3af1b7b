use shaftc_codegen::{CompiledCode, Frame, InstructionSequence};
use shaftc_ir::Graph;
use shaftc_ir_analysis::verify_graph;
use shaftc_session::BailoutReason;

pub use self::{
    backend::{
        AllocationStage, FrameElisionStage, InstructionSelectionStage, JumpThreadingStage,
        MoveOptimizationStage, SchedulingStage,
    },
    codegen::CodegenStage,
    graph::{
        BranchConditionDuplicationStage, DecompressionOptimizationStage, LoopPeelingStage,
        LoopUnrollingStage, SelectDetectionStage, SelectLoweringStage, TypeInferenceStage,
    },
};
use crate::{CompilationContext, Stage};

mod backend;
mod codegen;
mod graph;

/// The output of register allocation
pub struct AllocatedFunction {
    pub sequence: InstructionSequence,
    pub frame: Frame,
}

/// A fully compiled function: the final instruction sequence, its frame and the emitted code
pub struct CompiledFunction {
    pub sequence: InstructionSequence,
    pub frame: Frame,
    pub code: CompiledCode,
}

/// Check the output of a graph stage when graph verification is enabled
fn check_graph(
    graph: Graph,
    stage: &'static str,
    context: &CompilationContext,
) -> Result<Graph, BailoutReason> {
    log::trace!(target: "driver", "graph after '{stage}':\n{graph}");
    if context.session().options.verify_graph {
        verify_graph(&graph, stage)?;
    }
    Ok(graph)
}

/// Verifies the graph handed to the pipeline, when graph verification is enabled
pub struct VerifyInputStage;

impl Stage for VerifyInputStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "input"
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        context.session().statistics.count("input", "operations", input.op_count());
        context.session().statistics.count("input", "blocks", input.block_count());
        check_graph(input, "input", context)
    }
}
