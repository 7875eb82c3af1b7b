use cranelift_entity::entity_impl;

/// A dense handle identifying an [crate::Operation] in the arena of a [crate::Graph]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpIndex(u32);
entity_impl!(OpIndex, "o");

impl OpIndex {
    /// The handle returned when emitting into unreachable code
    pub const INVALID: Self = Self(u32::MAX);

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    #[inline(always)]
    pub const fn id(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A dense handle identifying a [crate::Block] of a [crate::Graph].
///
/// In a finished graph, the numeric value of a block index is its position in the block order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIndex(u32);
entity_impl!(BlockIndex, "b");

impl BlockIndex {
    #[inline(always)]
    pub const fn id(self) -> u32 {
        self.0
    }
}
