//! Linear-scan register allocation over an [InstructionSequence].
//!
//! The allocator works in phases:
//!
//! 1. Operands with fixed locations are turned into moves in the gaps around their instruction,
//!    and the registers they claim are reserved.
//! 2. Liveness is solved per block, and one live range is built per virtual register.
//! 3. Each register class is allocated by a linear scan, splitting and spilling ranges as needed.
//! 4. Operands are rewritten to their allocated locations, and moves are inserted where a value
//!    changes location, within a block or along a control flow edge.
//!
//! Each virtual register gets at most one spill slot, which virtual registers with disjoint
//! lifetimes share.

mod constraints;
mod data;
mod linear_scan;
mod liveness;
mod resolve;
#[cfg(test)]
mod tests;

use shaftc_session::{BailoutReason, Session};

pub use self::data::{
    LifetimePosition, LiveRange, LiveRangeId, RegisterAllocationData, SpillSlotGroup,
    UseInterval, UsePosition, add_interval,
};
use crate::{Frame, InstructionSequence, RegisterConfiguration};

/// Functions with more virtual registers than this are not optimized
pub const MAX_VIRTUAL_REGISTERS: usize = 1 << 20;

/// Allocate registers and spill slots for every virtual register of `sequence`, rewriting its
/// operands in place
pub fn allocate_registers(
    session: &Session,
    sequence: &mut InstructionSequence,
    config: &RegisterConfiguration,
    frame: &mut Frame,
) -> Result<(), BailoutReason> {
    let vregs = sequence.vreg_count();
    if vregs > MAX_VIRTUAL_REGISTERS {
        return Err(BailoutReason::FunctionTooLarge {
            vregs,
            limit: MAX_VIRTUAL_REGISTERS,
        });
    }

    let statistics = &session.statistics;
    let mut data = RegisterAllocationData::new(sequence, config, frame);
    statistics.time("meet-register-constraints", || data.meet_register_constraints())?;
    data.resolve_phis()?;
    data.build_bundles();
    statistics.time("build-live-ranges", || {
        data.compute_live_in()?;
        data.build_live_ranges();
        Ok::<_, BailoutReason>(())
    })?;
    statistics.time("allocate-registers", || data.allocate_linear_scan())?;
    data.populate_reference_maps();
    statistics.time("commit-assignment", || data.commit_assignment())?;
    data.connect_ranges();
    statistics.time("resolve-control-flow", || data.resolve_control_flow())?;

    let splits = data.ranges.len() - data.children.values().filter(|c| !c.is_empty()).count();
    statistics.count("allocate-registers", "live ranges", data.ranges.len());
    statistics.count("allocate-registers", "spill slots", data.frame.spill_slot_count() as usize);
    log::debug!(
        target: "regalloc",
        "allocated {vregs} virtual registers: {splits} splits, {} spill slots",
        data.frame.spill_slot_count()
    );
    if session.options.trace_allocation {
        for range in data.ranges.values().filter(|range| !range.is_empty()) {
            log::debug!(target: "regalloc", "{range}");
        }
    }
    log::trace!(target: "regalloc", "allocated sequence:\n{}", data.sequence);
    Ok(())
}
