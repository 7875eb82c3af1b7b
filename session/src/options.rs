use core::{fmt, str::FromStr};

use clap::{Parser, ValueEnum};

use crate::diagnostics::{IntoDiagnostic, Report};

bitflags::bitflags! {
    /// Optional instruction set extensions of the target that instruction selection may use
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CpuFeatures: u32 {
        const POPCNT = 1 << 0;
        const LZCNT = 1 << 1;
        const BMI1 = 1 << 2;
        const AVX = 1 << 3;
        const SSE4_1 = 1 << 4;
    }
}

impl FromStr for CpuFeatures {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut features = CpuFeatures::empty();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            features |= match name {
                "popcnt" => CpuFeatures::POPCNT,
                "lzcnt" => CpuFeatures::LZCNT,
                "bmi1" => CpuFeatures::BMI1,
                "avx" => CpuFeatures::AVX,
                "sse4_1" | "sse4.1" => CpuFeatures::SSE4_1,
                other => {
                    return Err(format!(
                        "unrecognized cpu feature '{other}': expected one of `popcnt`, `lzcnt`, \
                         `bmi1`, `avx`, `sse4_1`"
                    ));
                }
            };
        }
        Ok(features)
    }
}

/// Which instructions get a source position recorded in the position table
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum SourcePositionMode {
    /// Only calls (and other instructions that can observe the position, like deoptimizations)
    #[default]
    Calls,
    /// Every instruction whose operation carries a position
    All,
}

impl fmt::Display for SourcePositionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calls => f.write_str("calls"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Configuration consumed by the optimization and code generation phases
#[derive(Debug, Clone, Parser)]
#[command(name = "-C")]
pub struct Options {
    /// Run the list scheduler over each block after instruction selection
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, help_heading = "Backend")]
    pub turbo_instruction_scheduling: bool,
    /// Peel the first iteration of innermost loops
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Reducers")]
    pub turboshaft_loop_peeling: bool,
    /// Run the wasm optimization stage, which fully or partially unrolls small loops
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Reducers")]
    pub turboshaft_wasm: bool,
    /// Duplicate multiply-used branch conditions so they can be fused into the branch
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Reducers")]
    pub turboshaft_branch_condition_duplication: bool,
    /// Infer value ranges and replace operations with a single possible value by constants
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Reducers")]
    pub turboshaft_type_inference: bool,
    /// Allow switches to be lowered to jump tables
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Backend")]
    pub switch_jump_table: bool,
    /// Allow external references and roots to be addressed relative to the root register
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Backend")]
    pub roots_relative_addressing: bool,
    /// Which instructions record source positions
    #[arg(long, value_enum, default_value_t = SourcePositionMode::Calls, help_heading = "Backend")]
    pub source_positions: SourcePositionMode,
    /// Tagged values are stored in memory as 32-bit compressed pointers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Target")]
    pub pointer_compression: bool,
    /// Comma-separated list of optional CPU features available on the target
    #[arg(long, default_value = "", value_name = "FEATURES", help_heading = "Target")]
    pub cpu_features: CpuFeatures,
    /// Run the graph verifier after every IR stage
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, help_heading = "Debugging")]
    pub verify_graph: bool,
    /// Dump live ranges and their assignments after register allocation
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, help_heading = "Debugging")]
    pub trace_allocation: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            turbo_instruction_scheduling: false,
            turboshaft_loop_peeling: true,
            turboshaft_wasm: true,
            turboshaft_branch_condition_duplication: true,
            turboshaft_type_inference: true,
            switch_jump_table: true,
            roots_relative_addressing: true,
            source_positions: SourcePositionMode::Calls,
            pointer_compression: true,
            cpu_features: CpuFeatures::empty(),
            verify_graph: false,
            trace_allocation: false,
        }
    }
}

impl Options {
    /// Parse options given in the `name` or `name=value` form, without leading dashes.
    ///
    /// A bare `name` enables a boolean option.
    pub fn parse_argv<I, S>(argv: I) -> Result<Self, Report>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let command = <Options as clap::CommandFactory>::command()
            .no_binary_name(true)
            .arg_required_else_help(false);

        let argv = argv
            .into_iter()
            .flat_map(|arg| match arg.as_ref().split_once('=') {
                None => vec![format!("--{}", arg.as_ref()), "true".to_string()],
                Some((opt, value)) => vec![format!("--{opt}"), value.to_string()],
            })
            .collect::<Vec<_>>();

        let mut matches = command.try_get_matches_from(argv).into_diagnostic()?;
        <Options as clap::FromArgMatches>::from_arg_matches_mut(&mut matches).into_diagnostic()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_parsed_empty_argv() {
        let parsed = Options::parse_argv(core::iter::empty::<&str>()).unwrap();
        let defaults = Options::default();
        assert_eq!(parsed.turboshaft_loop_peeling, defaults.turboshaft_loop_peeling);
        assert_eq!(parsed.turboshaft_wasm, defaults.turboshaft_wasm);
        assert_eq!(parsed.switch_jump_table, defaults.switch_jump_table);
        assert_eq!(parsed.source_positions, defaults.source_positions);
        assert_eq!(parsed.cpu_features, CpuFeatures::empty());
    }

    #[test]
    fn parse_flags_and_values() {
        let parsed = Options::parse_argv([
            "turbo-instruction-scheduling",
            "turboshaft-loop-peeling=false",
            "source-positions=all",
            "cpu-features=avx,popcnt",
        ])
        .unwrap();
        assert!(parsed.turbo_instruction_scheduling);
        assert!(!parsed.turboshaft_loop_peeling);
        assert_eq!(parsed.source_positions, SourcePositionMode::All);
        assert_eq!(parsed.cpu_features, CpuFeatures::AVX | CpuFeatures::POPCNT);
    }

    #[test]
    fn unknown_cpu_feature_is_rejected() {
        assert!("avx,neon".parse::<CpuFeatures>().is_err());
        assert!(Options::parse_argv(["cpu-features=neon"]).is_err());
    }
}
