use core::cmp::Reverse;
use std::collections::BinaryHeap;

use shaftc_ir::FxHashMap;
use shaftc_session::BailoutReason;
use smallvec::SmallVec;

use super::{LifetimePosition, LiveRangeId, RegisterAllocationData, SpillSlotGroup};
use crate::{Frame, Location, Register, RegisterClass, VirtualRegister};

impl RegisterAllocationData<'_> {
    /// Assign a register or a spill slot to every live range, one register class at a time
    pub fn allocate_linear_scan(&mut self) -> Result<(), BailoutReason> {
        for class in RegisterClass::ALL {
            LinearScan::new(self, class).run()?;
        }
        Ok(())
    }

    /// The spill slot of `vreg`, shared with earlier virtual registers whose lifetimes are
    /// disjoint from it
    pub(super) fn spill_slot(&mut self, vreg: VirtualRegister) -> i32 {
        if let Some(slot) = self.spill_slots.get(&vreg) {
            return *slot;
        }
        let width = Frame::slots_for(self.sequence.rep_of(vreg));
        let slot = match self.span(vreg) {
            Some(span) => {
                let reusable = self.spill_groups.iter_mut().find(|group| {
                    group.width == width && group.spans.iter().all(|other| other.intersect(&span).is_none())
                });
                match reusable {
                    Some(group) => {
                        group.spans.push(span);
                        group.slot
                    }
                    None => {
                        let slot = self.frame.allocate_spill_slot(width);
                        self.spill_groups.push(SpillSlotGroup {
                            slot,
                            width,
                            spans: smallvec::smallvec![span],
                        });
                        slot
                    }
                }
            }
            None => self.frame.allocate_spill_slot(width),
        };
        self.spill_slots.insert(vreg, slot);
        slot
    }
}

/// Linear scan over the live ranges of one register class, in order of their start.
///
/// Ranges that cannot get a register for their whole lifetime are split: the part before the
/// conflict keeps the register, parts without register uses go to the stack, and the rest is
/// allocated again later. When no register is free at a register use, a range occupying one is
/// evicted from the current position on.
struct LinearScan<'d, 'a> {
    data: &'d mut RegisterAllocationData<'a>,
    class: RegisterClass,
    registers: SmallVec<[Register; 16]>,
    unhandled: BinaryHeap<Reverse<(LifetimePosition, LiveRangeId)>>,
    /// Ranges holding a register at the current position
    active: Vec<LiveRangeId>,
    /// Ranges holding a register, but in a lifetime hole at the current position
    inactive: Vec<LiveRangeId>,
    bundle_registers: FxHashMap<u32, Register>,
}

impl<'d, 'a> LinearScan<'d, 'a> {
    fn new(data: &'d mut RegisterAllocationData<'a>, class: RegisterClass) -> Self {
        let registers = data.config.allocatable(class).collect();
        let unhandled = data
            .ranges
            .iter()
            .filter(|(_, range)| !range.is_empty() && RegisterClass::of(range.rep) == class)
            .map(|(id, range)| Reverse((range.start(), id)))
            .collect();
        Self {
            data,
            class,
            registers,
            unhandled,
            active: Vec::new(),
            inactive: Vec::new(),
            bundle_registers: FxHashMap::default(),
        }
    }

    fn run(mut self) -> Result<(), BailoutReason> {
        while let Some(Reverse((start, id))) = self.unhandled.pop() {
            self.advance(start);
            self.process(id)?;
        }
        Ok(())
    }

    fn advance(&mut self, pos: LifetimePosition) {
        let ranges = &self.data.ranges;
        let mut active = Vec::with_capacity(self.active.len());
        let mut inactive = Vec::with_capacity(self.inactive.len());
        for id in self.active.drain(..).chain(self.inactive.drain(..)) {
            let range = &ranges[id];
            if range.end() <= pos {
                continue;
            }
            if range.covers(pos) {
                active.push(id);
            } else {
                inactive.push(id);
            }
        }
        self.active = active;
        self.inactive = inactive;
    }

    fn location(&self, id: LiveRangeId) -> Option<Register> {
        match self.data.ranges[id].location {
            Some(Location::Register(reg)) => Some(reg),
            _ => None,
        }
    }

    /// For each register, the first position at which it stops being available to `current`
    fn free_until(&self, current: LiveRangeId) -> SmallVec<[LifetimePosition; 16]> {
        let range = &self.data.ranges[current];
        self.registers
            .iter()
            .map(|reg| {
                let mut until = self
                    .data
                    .fixed
                    .get(reg)
                    .and_then(|fixed| range.first_intersection(fixed))
                    .unwrap_or(LifetimePosition::MAX);
                for id in self.active.iter() {
                    if self.location(*id) == Some(*reg) {
                        until = until.min(range.start());
                    }
                }
                for id in self.inactive.iter() {
                    if self.location(*id) == Some(*reg) {
                        if let Some(pos) = range.first_intersection(&self.data.ranges[*id].intervals) {
                            until = until.min(pos);
                        }
                    }
                }
                until
            })
            .collect()
    }

    /// Registers `current` would preferably be allocated to
    fn hints(&self, current: LiveRangeId) -> SmallVec<[Register; 3]> {
        let vreg = self.data.ranges[current].vreg;
        let mut hints = SmallVec::new();
        if let Some(reg) = self.data.register_hints.get(&vreg) {
            hints.push(*reg);
        }
        if let Some(reg) =
            self.data.bundles.get(&vreg).and_then(|bundle| self.bundle_registers.get(bundle))
        {
            hints.push(*reg);
        }
        let children = &self.data.children[vreg];
        if let Some(at) = children.iter().position(|id| *id == current) {
            if let Some(reg) = at.checked_sub(1).and_then(|prev| self.location(children[prev])) {
                hints.push(reg);
            }
        }
        hints.retain(|reg: &mut Register| reg.class == self.class && self.registers.contains(reg));
        hints
    }

    fn process(&mut self, current: LiveRangeId) -> Result<(), BailoutReason> {
        let (start, end) = {
            let range = &self.data.ranges[current];
            (range.start(), range.end())
        };
        let free = self.free_until(current);
        let hints = self.hints(current);
        let free_of = |reg: Register| {
            self.registers.iter().position(|r| *r == reg).map_or(start, |i| free[i])
        };

        // The register free for longest, or a hinted one that is free just as long
        let mut best = None::<(Register, LifetimePosition)>;
        for (reg, until) in self.registers.iter().zip(free.iter()) {
            if best.is_none_or(|(_, best_until)| *until > best_until) {
                best = Some((*reg, *until));
            }
        }
        let Some((mut reg, mut until)) = best else {
            return self.spill_or_fail(current);
        };
        if let Some(hint) = hints.iter().find(|hint| free_of(**hint) >= end.min(until)) {
            reg = *hint;
            until = free_of(*hint);
        }

        if until >= end {
            self.assign(current, reg);
            return Ok(());
        }
        if !self.data.ranges[current].requires_register() {
            self.spill(current);
            return Ok(());
        }
        if until > start {
            let split = self.data.split_position_at_or_before(until);
            if split > start {
                let tail = self.data.split(current, split);
                self.assign(current, reg);
                self.enqueue(tail);
                return Ok(());
            }
        }
        self.spill_or_fail(current)
    }

    /// Spill the part of `current` before its first register use, or take a register from
    /// another range if that use is imminent
    fn spill_or_fail(&mut self, current: LiveRangeId) -> Result<(), BailoutReason> {
        let range = &self.data.ranges[current];
        let start = range.start();
        let Some(first_use) = range.first_register_use() else {
            self.spill(current);
            return Ok(());
        };
        let split = self.data.split_position_at_or_before(LifetimePosition::instruction_start(
            first_use.instruction_index(),
        ));
        if split > start {
            let tail = self.data.split(current, split);
            self.spill(current);
            self.enqueue(tail);
            return Ok(());
        }
        self.allocate_blocked(current, first_use)
    }

    fn allocate_blocked(
        &mut self,
        current: LiveRangeId,
        first_use: LifetimePosition,
    ) -> Result<(), BailoutReason> {
        let range = &self.data.ranges[current];
        let (start, end) = (range.start(), range.end());
        let evict_at = self.data.split_position_at_or_before(start);

        let mut best = None::<(Register, LifetimePosition, LifetimePosition)>;
        for reg in self.registers.iter() {
            let fixed_until = self
                .data
                .fixed
                .get(reg)
                .and_then(|fixed| range.first_intersection(fixed))
                .unwrap_or(LifetimePosition::MAX);
            if fixed_until < end {
                let split = self.data.split_position_at_or_before(fixed_until);
                if range.unsplittable || split <= start || split <= first_use {
                    continue;
                }
            }
            let mut next_use = LifetimePosition::MAX;
            let mut evictable = true;
            for holder in self.holders(current, *reg) {
                let holder = &self.data.ranges[holder];
                let holder_next = holder.next_register_use(evict_at);
                evictable &= !holder.unsplittable
                    && evict_at > holder.start()
                    && holder_next.is_none_or(|pos| self.data.split_position_at_or_before(pos) > start);
                next_use = next_use.min(holder_next.unwrap_or(LifetimePosition::MAX));
            }
            if !evictable {
                continue;
            }
            if best.is_none_or(|(_, best_use, best_fixed)| {
                (next_use, fixed_until) > (best_use, best_fixed)
            }) {
                best = Some((*reg, next_use, fixed_until));
            }
        }

        let Some((reg, _, fixed_until)) = best else {
            return Err(BailoutReason::CodeGenerationFailed(format!(
                "no {} register available for {} at {start}",
                self.class, self.data.ranges[current]
            )));
        };
        for holder in self.holders(current, reg) {
            self.evict(holder, evict_at);
        }
        if fixed_until < end {
            let split = self.data.split_position_at_or_before(fixed_until);
            let tail = self.data.split(current, split);
            self.enqueue(tail);
        }
        self.assign(current, reg);
        Ok(())
    }

    /// The ranges in `reg` that conflict with `current`
    fn holders(&self, current: LiveRangeId, reg: Register) -> SmallVec<[LiveRangeId; 2]> {
        let range = &self.data.ranges[current];
        let mut holders: SmallVec<[LiveRangeId; 2]> =
            self.active.iter().copied().filter(|id| self.location(*id) == Some(reg)).collect();
        holders.extend(self.inactive.iter().copied().filter(|id| {
            self.location(*id) == Some(reg)
                && range.first_intersection(&self.data.ranges[*id].intervals).is_some()
        }));
        holders
    }

    /// Take the register of `holder` away from `pos` on: the part up to its next register use
    /// is spilled, and the rest is allocated again
    fn evict(&mut self, holder: LiveRangeId, pos: LifetimePosition) {
        log::trace!(target: "regalloc", "evicting {} at {pos}", self.data.ranges[holder]);
        self.active.retain(|id| *id != holder);
        self.inactive.retain(|id| *id != holder);
        let tail = self.data.split(holder, pos);
        let next_use = self.data.ranges[tail].next_register_use(pos);
        match next_use {
            None => self.spill(tail),
            Some(next_use) => {
                let split = self.data.split_position_at_or_before(next_use);
                if split > self.data.ranges[tail].start() {
                    let rest = self.data.split(tail, split);
                    self.spill(tail);
                    self.enqueue(rest);
                } else {
                    self.enqueue(tail);
                }
            }
        }
    }

    fn assign(&mut self, id: LiveRangeId, reg: Register) {
        let range = &mut self.data.ranges[id];
        range.location = Some(Location::Register(reg));
        log::trace!(target: "regalloc", "assigned {range}");
        if let Some(bundle) = self.data.bundles.get(&range.vreg) {
            self.bundle_registers.entry(*bundle).or_insert(reg);
        }
        self.active.push(id);
    }

    fn spill(&mut self, id: LiveRangeId) {
        let vreg = self.data.ranges[id].vreg;
        let slot = self.data.spill_slot(vreg);
        let range = &mut self.data.ranges[id];
        range.location = Some(Location::StackSlot(slot));
        log::trace!(target: "regalloc", "spilled {range}");
    }

    fn enqueue(&mut self, id: LiveRangeId) {
        self.unhandled.push(Reverse((self.data.ranges[id].start(), id)));
    }
}
