//! Analyses over a [shaftc_ir::Graph]: loop structure, loop trip counts, dominance and structural
//! verification.

mod dominance;
mod loop_finder;
mod loop_unrolling;
mod verify;

pub use self::{
    dominance::DominatorTree,
    loop_finder::{LoopBody, LoopFinder, LoopInfo},
    loop_unrolling::{
        IterationCount, LoopUnrollingAnalyzer, MAX_LOOP_ITERATIONS_FOR_FULL_UNROLLING,
        MAX_LOOP_SIZE_FOR_UNROLLING, PARTIAL_UNROLLING_COUNT,
    },
    verify::verify_graph,
};

#[cfg(test)]
pub(crate) mod test_utils {
    pub fn init_logger() {
        let _ = env_logger::Builder::from_env("SHAFTC_TRACE")
            .format_timestamp(None)
            .is_test(true)
            .try_init();
    }
}
