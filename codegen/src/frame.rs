use shaftc_ir::RegisterRepresentation;

/// The layout of the stack frame of the function being compiled.
///
/// Slots are 8 bytes wide. From the frame pointer down, a frame holds its fixed part (the saved
/// frame pointer and the return address), then spill slots, then the outgoing argument area of
/// calls. Slots are allocated while registers are assigned; the frame is frozen before code is
/// generated.
#[derive(Debug, Clone)]
pub struct Frame {
    spill_slot_count: u32,
    outgoing_argument_count: u32,
    unoptimized_frame_height: u32,
    frozen: bool,
}

impl Frame {
    pub const SLOT_SIZE: u32 = 8;
    pub const FIXED_SLOT_COUNT: u32 = 2;

    pub fn new(outgoing_argument_count: usize, unoptimized_frame_height: u32) -> Self {
        Self {
            spill_slot_count: 0,
            outgoing_argument_count: outgoing_argument_count as u32,
            unoptimized_frame_height,
            frozen: false,
        }
    }

    /// The number of slots a value of representation `rep` occupies
    pub fn slots_for(rep: RegisterRepresentation) -> u32 {
        match rep {
            RegisterRepresentation::Simd128 => 2,
            _ => 1,
        }
    }

    /// Reserve `width` consecutive spill slots, returning the index of the first
    pub fn allocate_spill_slot(&mut self, width: u32) -> i32 {
        assert!(!self.frozen, "cannot allocate spill slots in a frozen frame");
        let index = self.spill_slot_count;
        self.spill_slot_count += width;
        index as i32
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    #[inline]
    pub fn spill_slot_count(&self) -> u32 {
        self.spill_slot_count
    }

    #[inline]
    pub fn outgoing_argument_count(&self) -> u32 {
        self.outgoing_argument_count
    }

    /// Total size of the frame in slots
    pub fn total_slot_count(&self) -> u32 {
        Self::FIXED_SLOT_COUNT + self.spill_slot_count + self.outgoing_argument_count
    }

    /// The stack space to reserve beyond the frame so that deoptimization can always materialize
    /// the unoptimized frame
    pub fn stack_check_offset(&self) -> u32 {
        let optimized = self.total_slot_count() * Self::SLOT_SIZE;
        self.unoptimized_frame_height.saturating_sub(optimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_slots_are_allocated_contiguously() {
        let mut frame = Frame::new(2, 0);
        assert_eq!(frame.allocate_spill_slot(1), 0);
        assert_eq!(frame.allocate_spill_slot(Frame::slots_for(RegisterRepresentation::Simd128)), 1);
        assert_eq!(frame.allocate_spill_slot(1), 3);
        assert_eq!(frame.total_slot_count(), Frame::FIXED_SLOT_COUNT + 4 + 2);
    }

    #[test]
    fn stack_check_offset_covers_unoptimized_frame() {
        let frame = Frame::new(0, 128);
        assert_eq!(frame.stack_check_offset(), 128 - 16);
        let frame = Frame::new(0, 8);
        assert_eq!(frame.stack_check_offset(), 0);
    }
}
