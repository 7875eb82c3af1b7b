use core::cell::RefCell;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

/// Timing and counters recorded for one phase of the pipeline
#[derive(Debug, Clone)]
pub struct PhaseStatistics {
    pub name: &'static str,
    pub elapsed: Duration,
    pub counters: SmallVec<[(&'static str, usize); 4]>,
}

/// Per-phase statistics gathered while compiling a single unit
#[derive(Default, Debug)]
pub struct Statistics {
    phases: RefCell<Vec<PhaseStatistics>>,
}

impl Statistics {
    /// Run `f`, recording the time it takes under `phase`
    pub fn time<T>(&self, phase: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        let mut phases = self.phases.borrow_mut();
        match phases.iter_mut().find(|stats| stats.name == phase) {
            Some(stats) => stats.elapsed += elapsed,
            None => phases.push(PhaseStatistics {
                name: phase,
                elapsed,
                counters: SmallVec::new(),
            }),
        }
        result
    }

    /// Add `value` to the counter `counter` of `phase`
    pub fn count(&self, phase: &'static str, counter: &'static str, value: usize) {
        let mut phases = self.phases.borrow_mut();
        let index = match phases.iter().position(|stats| stats.name == phase) {
            Some(index) => index,
            None => {
                phases.push(PhaseStatistics {
                    name: phase,
                    elapsed: Duration::ZERO,
                    counters: SmallVec::new(),
                });
                phases.len() - 1
            }
        };
        let counters = &mut phases[index].counters;
        match counters.iter_mut().find(|(name, _)| *name == counter) {
            Some((_, total)) => *total += value,
            None => counters.push((counter, value)),
        }
    }

    pub fn get(&self, phase: &str) -> Option<PhaseStatistics> {
        self.phases.borrow().iter().find(|stats| stats.name == phase).cloned()
    }

    pub fn phases(&self) -> Vec<PhaseStatistics> {
        self.phases.borrow().clone()
    }

    pub fn log_summary(&self, unit: &str) {
        if !log::log_enabled!(target: "statistics", log::Level::Debug) {
            return;
        }
        for phase in self.phases.borrow().iter() {
            log::debug!(
                target: "statistics",
                "{unit}: {:<32} {:>10.3?} {:?}",
                phase.name,
                phase.elapsed,
                phase.counters.as_slice()
            );
        }
    }
}
