use shaftc_codegen::CodeGenerator;
use shaftc_session::BailoutReason;

use super::{AllocatedFunction, CompiledFunction};
use crate::{CompilationContext, Stage};

/// Emits the final code with its safepoint, source position and deoptimization tables
pub struct CodegenStage;

impl Stage for CodegenStage {
    type Input = AllocatedFunction;
    type Output = CompiledFunction;

    fn name(&self) -> &'static str {
        "codegen"
    }

    fn run(
        &mut self,
        input: AllocatedFunction,
        context: &CompilationContext,
    ) -> Result<CompiledFunction, BailoutReason> {
        let AllocatedFunction { sequence, frame } = input;
        let code = CodeGenerator::new(context.session(), &sequence, &frame).generate()?;
        log::debug!(
            target: "driver",
            "{}: {} bytes, {} safepoints, {} deoptimization exits",
            context.session().name,
            code.code.len(),
            code.safepoints.len(),
            code.deoptimization_exits.len()
        );
        Ok(CompiledFunction {
            sequence,
            frame,
            code,
        })
    }
}
