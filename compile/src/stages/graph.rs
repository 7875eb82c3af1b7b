//! Stages that rebuild or rewrite the graph before instruction selection.

use shaftc_ir::Graph;
use shaftc_ir_transform::{
    BranchConditionDuplicationReducer, CopyingPhase, LoopPeelingReducer, LoopUnrollingReducer,
    SelectDetectionReducer, SelectLoweringReducer, TypeInferenceReducer,
    run_decompression_optimization,
};
use shaftc_session::BailoutReason;

use super::check_graph;
use crate::{CompilationContext, Stage};

/// Peels the first iteration of innermost loops
pub struct LoopPeelingStage;

impl Stage for LoopPeelingStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "loop-peeling"
    }

    fn enabled(&self, context: &CompilationContext) -> bool {
        context.session().options.turboshaft_loop_peeling
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        let mut reducer = LoopPeelingReducer::new(&input);
        let output = CopyingPhase::run(&input, &mut reducer);
        check_graph(output, self.name(), context)
    }
}

/// The wasm optimization stage: fully or partially unrolls small loops
pub struct LoopUnrollingStage;

impl Stage for LoopUnrollingStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "loop-unrolling"
    }

    fn enabled(&self, context: &CompilationContext) -> bool {
        context.session().options.turboshaft_wasm
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        let mut reducer = LoopUnrollingReducer::new(&input);
        if !reducer.has_work() {
            log::debug!(target: "driver", "no loop to unroll");
            return Ok(input);
        }
        let output = CopyingPhase::run(&input, &mut reducer);
        check_graph(output, self.name(), context)
    }
}

/// Pushes conversions of selects with a constant input into both arms
pub struct SelectDetectionStage;

impl Stage for SelectDetectionStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "select-detection"
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        let output = CopyingPhase::run(&input, &mut SelectDetectionReducer);
        check_graph(output, self.name(), context)
    }
}

/// Replaces operations with a single possible value by constants and folds decided branches
pub struct TypeInferenceStage;

impl Stage for TypeInferenceStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "type-inference"
    }

    fn enabled(&self, context: &CompilationContext) -> bool {
        context.session().options.turboshaft_type_inference
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        let mut reducer = TypeInferenceReducer::new(&input);
        let output = CopyingPhase::run(&input, &mut reducer);
        check_graph(output, self.name(), context)
    }
}

pub struct BranchConditionDuplicationStage;

impl Stage for BranchConditionDuplicationStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "branch-condition-duplication"
    }

    fn enabled(&self, context: &CompilationContext) -> bool {
        context.session().options.turboshaft_branch_condition_duplication
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        let mut reducer = BranchConditionDuplicationReducer::new(&input);
        let output = CopyingPhase::run(&input, &mut reducer);
        check_graph(output, self.name(), context)
    }
}

/// Keeps tagged values compressed where no user needs the full pointer
pub struct DecompressionOptimizationStage;

impl Stage for DecompressionOptimizationStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "decompression-optimization"
    }

    fn enabled(&self, context: &CompilationContext) -> bool {
        context.session().options.pointer_compression
    }

    fn run(&mut self, mut input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        run_decompression_optimization(&mut input);
        check_graph(input, self.name(), context)
    }
}

/// Turns branch-implemented selects into diamonds; the selector only lowers conditional moves
pub struct SelectLoweringStage;

impl Stage for SelectLoweringStage {
    type Input = Graph;
    type Output = Graph;

    fn name(&self) -> &'static str {
        "select-lowering"
    }

    fn run(&mut self, input: Graph, context: &CompilationContext) -> Result<Graph, BailoutReason> {
        let output = CopyingPhase::run(&input, &mut SelectLoweringReducer);
        check_graph(output, self.name(), context)
    }
}
