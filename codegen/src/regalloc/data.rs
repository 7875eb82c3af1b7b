use core::fmt;

use cranelift_entity::{PrimaryMap, SecondaryMap, entity_impl};
use shaftc_ir::{FxHashMap, RegisterRepresentation};
use shaftc_session::BailoutReason;
use smallvec::SmallVec;

use crate::{
    Frame, InstructionOperand, InstructionSequence, Location, OperandPolicy, Register,
    RegisterConfiguration, RpoNumber, UnallocatedOperand, VirtualRegister,
};

/// A point in the linear order of instructions.
///
/// Instruction `k` owns four consecutive positions: its start gap (`4k`), its end gap (`4k + 1`),
/// the point at which it reads its inputs (`4k + 2`) and the point at which it writes its
/// outputs (`4k + 3`). A parallel move at a gap position reads its sources before the position
/// and writes its destinations at it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LifetimePosition(u32);

impl LifetimePosition {
    pub const MAX: Self = Self(u32::MAX);

    #[inline]
    pub const fn gap_start(instruction: usize) -> Self {
        Self(instruction as u32 * 4)
    }

    #[inline]
    pub const fn gap_end(instruction: usize) -> Self {
        Self(instruction as u32 * 4 + 1)
    }

    #[inline]
    pub const fn instruction_start(instruction: usize) -> Self {
        Self(instruction as u32 * 4 + 2)
    }

    #[inline]
    pub const fn instruction_end(instruction: usize) -> Self {
        Self(instruction as u32 * 4 + 3)
    }

    #[inline]
    pub const fn instruction_index(self) -> usize {
        (self.0 / 4) as usize
    }

    #[inline]
    pub const fn is_gap(self) -> bool {
        self.0 % 4 < 2
    }

    #[inline]
    pub const fn is_gap_start(self) -> bool {
        self.0 % 4 == 0
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }
}

impl fmt::Display for LifetimePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.0 % 4 {
            0 => "gs",
            1 => "ge",
            2 => "s",
            _ => "e",
        };
        write!(f, "{}{suffix}", self.0 / 4)
    }
}

impl fmt::Debug for LifetimePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The half-open interval `[start, end)` of positions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UseInterval {
    pub start: LifetimePosition,
    pub end: LifetimePosition,
}

impl UseInterval {
    pub fn new(start: LifetimePosition, end: LifetimePosition) -> Self {
        debug_assert!(start < end, "empty interval [{start}, {end})");
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, pos: LifetimePosition) -> bool {
        self.start <= pos && pos < self.end
    }

    /// The first position covered by both intervals
    pub fn intersect(&self, other: &Self) -> Option<LifetimePosition> {
        let start = self.start.max(other.start);
        (start < self.end.min(other.end)).then_some(start)
    }
}

/// Insert `interval` into the sorted, disjoint list `intervals`, merging it with every interval
/// it overlaps or touches
pub fn add_interval(intervals: &mut SmallVec<[UseInterval; 2]>, interval: UseInterval) {
    let mut merged = interval;
    let mut i = 0;
    while i < intervals.len() {
        let existing = intervals[i];
        if existing.end < merged.start {
            i += 1;
        } else if merged.end < existing.start {
            break;
        } else {
            merged.start = merged.start.min(existing.start);
            merged.end = merged.end.max(existing.end);
            intervals.remove(i);
        }
    }
    intervals.insert(i, merged);
}

/// A position at which a live range must be in a register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsePosition {
    pub pos: LifetimePosition,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveRangeId(u32);
entity_impl!(LiveRangeId, "lr");

/// A piece of the lifetime of a virtual register that lives in a single location.
///
/// Before allocation each virtual register has a single range covering its whole lifetime;
/// splitting produces further children of the same virtual register.
#[derive(Debug, Clone)]
pub struct LiveRange {
    pub vreg: VirtualRegister,
    pub rep: RegisterRepresentation,
    pub intervals: SmallVec<[UseInterval; 2]>,
    pub uses: SmallVec<[UsePosition; 4]>,
    pub location: Option<Location>,
    /// Temporaries and ranges cut down to a single instruction cannot be split or evicted
    pub unsplittable: bool,
}

impl LiveRange {
    pub fn new(vreg: VirtualRegister, rep: RegisterRepresentation) -> Self {
        Self {
            vreg,
            rep,
            intervals: SmallVec::new(),
            uses: SmallVec::new(),
            location: None,
            unsplittable: false,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn start(&self) -> LifetimePosition {
        self.intervals.first().map(|i| i.start).unwrap_or_default()
    }

    pub fn end(&self) -> LifetimePosition {
        self.intervals.last().map(|i| i.end).unwrap_or_default()
    }

    pub fn covers(&self, pos: LifetimePosition) -> bool {
        self.intervals.iter().any(|interval| interval.contains(pos))
    }

    /// The first position covered by both ranges
    pub fn first_intersection(&self, other: &[UseInterval]) -> Option<LifetimePosition> {
        let (mut a, mut b) = (0, 0);
        while a < self.intervals.len() && b < other.len() {
            if let Some(pos) = self.intervals[a].intersect(&other[b]) {
                return Some(pos);
            }
            if self.intervals[a].end <= other[b].end {
                a += 1;
            } else {
                b += 1;
            }
        }
        None
    }

    pub fn first_register_use(&self) -> Option<LifetimePosition> {
        self.uses.first().map(|u| u.pos)
    }

    pub fn next_register_use(&self, from: LifetimePosition) -> Option<LifetimePosition> {
        self.uses.iter().map(|u| u.pos).find(|pos| *pos >= from)
    }

    pub fn requires_register(&self) -> bool {
        !self.uses.is_empty()
    }

    /// Move everything at or after `pos` into a new range, which is returned
    pub fn split_off(&mut self, pos: LifetimePosition) -> LiveRange {
        let mut tail = LiveRange::new(self.vreg, self.rep);
        let mut keep = SmallVec::new();
        for interval in self.intervals.drain(..) {
            if interval.end <= pos {
                keep.push(interval);
            } else if interval.start >= pos {
                tail.intervals.push(interval);
            } else {
                keep.push(UseInterval::new(interval.start, pos));
                tail.intervals.push(UseInterval::new(pos, interval.end));
            }
        }
        self.intervals = keep;
        let at = self.uses.partition_point(|u| u.pos < pos);
        tail.uses = self.uses.drain(at..).collect();
        tail
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vreg)?;
        for interval in self.intervals.iter() {
            write!(f, " [{}, {})", interval.start, interval.end)?;
        }
        if let Some(location) = self.location {
            write!(f, " -> {location}")?;
        }
        Ok(())
    }
}

/// A spill slot and the lifetimes of the virtual registers sharing it
#[derive(Debug, Clone)]
pub struct SpillSlotGroup {
    pub slot: i32,
    pub width: u32,
    pub spans: SmallVec<[UseInterval; 4]>,
}

/// State shared by the register allocation phases
pub struct RegisterAllocationData<'a> {
    pub sequence: &'a mut InstructionSequence,
    pub config: &'a RegisterConfiguration,
    pub frame: &'a mut Frame,
    pub ranges: PrimaryMap<LiveRangeId, LiveRange>,
    /// The ranges of each virtual register, ordered by start
    pub children: SecondaryMap<VirtualRegister, SmallVec<[LiveRangeId; 2]>>,
    /// Positions at which a register is unavailable to the allocator
    pub fixed: FxHashMap<Register, SmallVec<[UseInterval; 2]>>,
    /// Registers a virtual register is moved from or to by a fixed operand
    pub register_hints: FxHashMap<VirtualRegister, Register>,
    /// Virtual registers that should share a location where possible
    pub bundles: FxHashMap<VirtualRegister, u32>,
    pub live_in: SecondaryMap<RpoNumber, bitvec::vec::BitVec>,
    pub spill_slots: FxHashMap<VirtualRegister, i32>,
    pub spill_groups: Vec<SpillSlotGroup>,
}

impl<'a> RegisterAllocationData<'a> {
    pub fn new(
        sequence: &'a mut InstructionSequence,
        config: &'a RegisterConfiguration,
        frame: &'a mut Frame,
    ) -> Self {
        Self {
            sequence,
            config,
            frame,
            ranges: PrimaryMap::new(),
            children: SecondaryMap::new(),
            fixed: FxHashMap::default(),
            register_hints: FxHashMap::default(),
            bundles: FxHashMap::default(),
            live_in: SecondaryMap::new(),
            spill_slots: FxHashMap::default(),
            spill_groups: Vec::new(),
        }
    }

    pub fn block_fixed(&mut self, reg: Register, start: LifetimePosition, end: LifetimePosition) {
        add_interval(self.fixed.entry(reg).or_default(), UseInterval::new(start, end));
    }

    /// The range of `vreg` covering `pos`
    pub fn range_at(&self, vreg: VirtualRegister, pos: LifetimePosition) -> Option<&LiveRange> {
        self.children[vreg].iter().map(|id| &self.ranges[*id]).find(|range| range.covers(pos))
    }

    /// The location of `vreg` at `pos`, once allocation is done
    pub fn location_at(
        &self,
        vreg: VirtualRegister,
        pos: LifetimePosition,
    ) -> Result<Location, BailoutReason> {
        self.range_at(vreg, pos).and_then(|range| range.location).ok_or_else(|| {
            BailoutReason::CodeGenerationFailed(format!("{vreg} has no location at {pos}"))
        })
    }

    /// The operand reading the value of `vreg` in a parallel move
    pub fn value_operand(&self, vreg: VirtualRegister) -> InstructionOperand {
        if self.sequence.is_constant(vreg) {
            InstructionOperand::Constant(vreg)
        } else {
            InstructionOperand::Unallocated(UnallocatedOperand::new(vreg, OperandPolicy::Any))
        }
    }

    /// The positions between the first definition and the last use of `vreg`
    pub fn span(&self, vreg: VirtualRegister) -> Option<UseInterval> {
        let children = &self.children[vreg];
        let start = children.iter().map(|id| self.ranges[*id].start()).min()?;
        let end = children.iter().map(|id| self.ranges[*id].end()).max()?;
        Some(UseInterval::new(start, end))
    }

    /// Split `range` at `pos`, registering the tail as the next child of its virtual register
    pub fn split(&mut self, range: LiveRangeId, pos: LifetimePosition) -> LiveRangeId {
        let tail = self.ranges[range].split_off(pos);
        debug_assert!(!self.ranges[range].is_empty() && !tail.is_empty());
        let vreg = tail.vreg;
        let tail = self.ranges.push(tail);
        let children = &mut self.children[vreg];
        let at = children.iter().position(|id| *id == range).map_or(children.len(), |i| i + 1);
        children.insert(at, tail);
        log::trace!(target: "regalloc", "split {range} at {pos}: {}", self.ranges[tail]);
        tail
    }

    pub fn is_block_first(&self, instruction: usize) -> bool {
        let rpo = self.sequence.instructions[instruction].block;
        self.sequence.blocks[rpo].code_start == instruction
    }

    pub fn is_block_last(&self, instruction: usize) -> bool {
        let rpo = self.sequence.instructions[instruction].block;
        self.sequence.blocks[rpo].last_instruction() == instruction
    }

    /// The latest position at or before `pos` where a range may be split.
    ///
    /// Ranges are split at gaps, where the move connecting the pieces is inserted. The end gap
    /// of the last instruction of a block is reserved for moves resolving control flow, and a
    /// split at the start of a block is connected by control flow resolution alone.
    pub fn split_position_at_or_before(&self, pos: LifetimePosition) -> LifetimePosition {
        let instruction = pos.instruction_index();
        if pos.value() % 4 >= 1 && !self.is_block_last(instruction) {
            LifetimePosition::gap_end(instruction)
        } else {
            LifetimePosition::gap_start(instruction)
        }
    }

    /// The block start positions, used to tell splits resolved by control flow apart from
    /// splits connected by a move
    pub fn is_block_start(&self, pos: LifetimePosition) -> bool {
        pos.is_gap_start() && self.is_block_first(pos.instruction_index())
    }

    pub fn instruction_count(&self) -> usize {
        self.sequence.instructions.len()
    }
}
