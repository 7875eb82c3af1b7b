//! Compilation-unit scoped configuration and reporting shared by every phase of the backend.
//!
//! A [Session] is created once per compilation unit and handed to each stage of the pipeline. It
//! carries the parsed [Options], the [Statistics] gathered while the unit is compiled, and a name
//! used to tag log output. Nothing in a session is shared between compilation units.

pub mod diagnostics;
mod options;
mod statistics;

use std::fmt;

pub use self::{
    diagnostics::{BailoutReason, OperandCountKind},
    options::{CpuFeatures, Options, SourcePositionMode},
    statistics::{PhaseStatistics, Statistics},
};

/// The state shared by all phases compiling a single function.
pub struct Session {
    /// A human readable name for the unit being compiled, used in log output
    pub name: String,
    pub options: Options,
    pub statistics: Statistics,
}

impl Session {
    pub fn new(name: impl Into<String>, options: Options) -> Self {
        Self {
            name: name.into(),
            options,
            statistics: Statistics::default(),
        }
    }

    /// Returns true if the given CPU feature may be used by instruction selection
    #[inline]
    pub fn has_cpu_feature(&self, feature: CpuFeatures) -> bool {
        self.options.cpu_features.contains(feature)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new("<anonymous>", Options::default())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
