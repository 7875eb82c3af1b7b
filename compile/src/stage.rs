use core::marker::PhantomData;

use shaftc_session::BailoutReason;

use crate::CompilationContext;

/// This trait is implemented by a stage of the pipeline
pub trait Stage {
    type Input;
    type Output;

    /// The name used in logs, statistics and [BailoutReason::CompilationStopped]
    fn name(&self) -> &'static str;

    /// Return false if this stage is disabled by the options of `context`
    fn enabled(&self, _context: &CompilationContext) -> bool {
        true
    }

    /// Run this stage
    fn run(
        &mut self,
        input: Self::Input,
        context: &CompilationContext,
    ) -> Result<Self::Output, BailoutReason>;

    /// Run this stage, recording its wall time under [Stage::name]
    fn run_timed(
        &mut self,
        input: Self::Input,
        context: &CompilationContext,
    ) -> Result<Self::Output, BailoutReason> {
        let name = self.name();
        log::debug!(target: "driver", "running stage '{name}'");
        context.session().statistics.time(name, || self.run(input, context))
    }

    fn next<S>(self, stage: S) -> Chain<Self, S>
    where
        Self: Sized,
        S: Stage<Input = Self::Output>,
    {
        Chain::new(self, stage)
    }

    fn next_optional<S>(self, stage: S) -> ChainOptional<Self, S>
    where
        Self: Sized,
        S: Stage<Input = Self::Output, Output = Self::Output>,
    {
        ChainOptional::new(self, stage)
    }
}

/// A named closure usable as a [Stage]
pub struct FnStage<F, I, O> {
    name: &'static str,
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnStage<F, I, O>
where
    F: FnMut(I, &CompilationContext) -> Result<O, BailoutReason>,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> Stage for FnStage<F, I, O>
where
    F: FnMut(I, &CompilationContext) -> Result<O, BailoutReason>,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    fn run(&mut self, input: I, context: &CompilationContext) -> Result<O, BailoutReason> {
        (self.f)(input, context)
    }
}

/// This struct is used to chain multiple [Stage]s together
pub struct Chain<A, B> {
    a: A,
    b: B,
}

impl<A, B> Chain<A, B> {
    fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A, B> Stage for Chain<A, B>
where
    A: Stage,
    B: Stage<Input = <A as Stage>::Output>,
{
    type Input = <A as Stage>::Input;
    type Output = <B as Stage>::Output;

    fn name(&self) -> &'static str {
        self.b.name()
    }

    fn run_timed(
        &mut self,
        input: Self::Input,
        context: &CompilationContext,
    ) -> Result<Self::Output, BailoutReason> {
        self.run(input, context)
    }

    fn run(
        &mut self,
        input: Self::Input,
        context: &CompilationContext,
    ) -> Result<Self::Output, BailoutReason> {
        if !self.a.enabled(context) {
            return Err(BailoutReason::CompilationStopped(self.a.name()));
        }
        let output = self.a.run_timed(input, context)?;
        if !self.b.enabled(context) {
            return Err(BailoutReason::CompilationStopped(self.b.name()));
        }
        self.b.run_timed(output, context)
    }
}

/// This struct is used to chain two [Stage]s together when the second might be disabled
pub struct ChainOptional<A, B> {
    a: A,
    b: B,
}

impl<A, B> ChainOptional<A, B> {
    fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A, B> Stage for ChainOptional<A, B>
where
    A: Stage,
    B: Stage<Input = <A as Stage>::Output, Output = <A as Stage>::Output>,
{
    type Input = <A as Stage>::Input;
    type Output = <B as Stage>::Output;

    fn name(&self) -> &'static str {
        self.b.name()
    }

    fn run_timed(
        &mut self,
        input: Self::Input,
        context: &CompilationContext,
    ) -> Result<Self::Output, BailoutReason> {
        self.run(input, context)
    }

    fn run(
        &mut self,
        input: Self::Input,
        context: &CompilationContext,
    ) -> Result<Self::Output, BailoutReason> {
        if !self.a.enabled(context) {
            return Err(BailoutReason::CompilationStopped(self.a.name()));
        }
        let output = self.a.run_timed(input, context)?;
        if !self.b.enabled(context) {
            log::debug!(target: "driver", "skipping disabled stage '{}'", self.b.name());
            Ok(output)
        } else {
            self.b.run_timed(output, context)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tests::context_with;

    /// Only enabled when the loop peeling flag is set
    struct Peel;

    impl Stage for Peel {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &'static str {
            "peel"
        }

        fn enabled(&self, context: &CompilationContext) -> bool {
            context.session().options.turboshaft_loop_peeling
        }

        fn run(&mut self, input: u32, _context: &CompilationContext) -> Result<u32, BailoutReason> {
            Ok(input * 10)
        }
    }

    fn add_one()
    -> FnStage<impl FnMut(u32, &CompilationContext) -> Result<u32, BailoutReason>, u32, u32> {
        FnStage::new("add-one", |input: u32, _| Ok(input + 1))
    }

    #[test]
    fn chain_runs_stages_in_order() {
        let context = context_with(&[]);
        let mut pipeline = add_one().next(Peel).next(add_one());
        assert_eq!(pipeline.run(1, &context).unwrap(), 21);
        assert!(context.session().statistics.get("peel").is_some());
        assert!(context.session().statistics.get("add-one").is_some());
    }

    #[test]
    fn disabled_optional_stage_is_skipped() {
        let context = context_with(&["turboshaft-loop-peeling=false"]);
        let mut pipeline = add_one().next_optional(Peel).next(add_one());
        assert_eq!(pipeline.run(1, &context).unwrap(), 3);
        assert!(context.session().statistics.get("peel").is_none());
    }

    #[test]
    fn disabled_mandatory_stage_stops_compilation() {
        let context = context_with(&["turboshaft-loop-peeling=false"]);
        let mut pipeline = add_one().next(Peel).next(add_one());
        let result = pipeline.run(1, &context);
        assert!(matches!(result, Err(BailoutReason::CompilationStopped("peel"))), "{result:?}");
    }

    #[test]
    fn errors_stop_the_chain() {
        let context = context_with(&[]);
        let fail = FnStage::new("fail", |_: u32, _| -> Result<u32, BailoutReason> {
            Err(BailoutReason::CodeGenerationFailed("no".into()))
        });
        let mut ran_last = false;
        let last = FnStage::new("last", |input: u32, _| {
            ran_last = true;
            Ok(input)
        });
        let result = add_one().next(fail).next(last).run(1, &context);
        assert!(matches!(result, Err(BailoutReason::CodeGenerationFailed(_))));
        assert!(!ran_last);
    }
}
