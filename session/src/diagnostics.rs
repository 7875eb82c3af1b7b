use core::fmt;

pub use miette::{Diagnostic, IntoDiagnostic, Report, WrapErr};

/// The operand list of an instruction whose size overflowed during instruction selection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandCountKind {
    Output,
    Input,
    Temp,
}

impl fmt::Display for OperandCountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => f.write_str("output"),
            Self::Input => f.write_str("input"),
            Self::Temp => f.write_str("temp"),
        }
    }
}

/// The reason an optimizing compilation was abandoned.
///
/// A bailout is not a failure of the program being compiled: the caller is expected to fall back to
/// a less optimized execution strategy. Every phase returns bailouts through its `Result`, and the
/// pipeline driver stops at the first one, discarding everything produced so far.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Diagnostic)]
pub enum BailoutReason {
    #[error("instruction selection failed: {count} {kind} operands exceed the limit of {limit}")]
    #[diagnostic(code(shaftc::bailout::instruction_selection_failed))]
    InstructionSelectionFailed {
        kind: OperandCountKind,
        count: usize,
        limit: usize,
    },
    #[error("unsupported operation {op}: {reason}")]
    #[diagnostic(code(shaftc::bailout::unsupported_operation))]
    UnsupportedOperation { op: String, reason: String },
    #[error("select operations must be lowered to branches before instruction selection")]
    #[diagnostic(code(shaftc::bailout::unsupported_select_lowering))]
    UnsupportedSelectLowering,
    #[error("function too large: {vregs} virtual registers exceed the limit of {limit}")]
    #[diagnostic(code(shaftc::bailout::function_too_large))]
    FunctionTooLarge { vregs: usize, limit: usize },
    #[error("code generation failed: {0}")]
    #[diagnostic(code(shaftc::bailout::code_generation_failed))]
    CodeGenerationFailed(String),
    #[error("invalid graph after '{stage}': {message}")]
    #[diagnostic(code(shaftc::bailout::invalid_graph))]
    InvalidGraph { stage: &'static str, message: String },
    #[error("compilation stopped: stage '{0}' is disabled")]
    #[diagnostic(code(shaftc::bailout::compilation_stopped))]
    CompilationStopped(&'static str),
}

impl BailoutReason {
    pub fn unsupported(op: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}
