use core::ops::Range;

use smallvec::SmallVec;

use crate::{BlockIndex, OpIndex};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// A block entered by any number of `Goto`s
    Merge,
    /// A loop header: entered by exactly one forward `Goto` and one backedge `Goto`
    Loop,
    /// The single successor of a branching terminator
    BranchTarget,
}

/// A straight-line run of operations ending in a block terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub(crate) index: BlockIndex,
    pub(crate) kind: BlockKind,
    pub(crate) begin: OpIndex,
    pub(crate) end: OpIndex,
    /// Predecessors in the order their edges were added
    pub(crate) predecessors: SmallVec<[BlockIndex; 2]>,
    pub(crate) bound: bool,
}

impl Block {
    pub(crate) fn new(index: BlockIndex, kind: BlockKind) -> Self {
        Self {
            index,
            kind,
            begin: OpIndex::INVALID,
            end: OpIndex::INVALID,
            predecessors: SmallVec::new(),
            bound: false,
        }
    }

    #[inline]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    #[inline]
    pub fn is_loop(&self) -> bool {
        self.kind == BlockKind::Loop
    }

    #[inline]
    pub fn is_merge(&self) -> bool {
        self.kind == BlockKind::Merge
    }

    #[inline]
    pub fn is_branch_target(&self) -> bool {
        self.kind == BlockKind::BranchTarget
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The first operation of this block
    #[inline]
    pub fn begin(&self) -> OpIndex {
        self.begin
    }

    /// One past the last operation of this block
    #[inline]
    pub fn end(&self) -> OpIndex {
        self.end
    }

    /// Number of operations in this block
    #[inline]
    pub fn op_count(&self) -> u32 {
        self.end.id() - self.begin.id()
    }

    pub fn ops(&self) -> impl DoubleEndedIterator<Item = OpIndex> + ExactSizeIterator + use<> {
        self.op_range().map(OpIndex::from_u32)
    }

    #[inline]
    pub fn op_range(&self) -> Range<u32> {
        self.begin.id()..self.end.id()
    }

    #[inline]
    pub fn contains(&self, op: OpIndex) -> bool {
        self.begin <= op && op < self.end
    }

    /// The last operation of the block, which is its terminator
    #[inline]
    pub fn terminator(&self) -> OpIndex {
        debug_assert!(self.end.id() > self.begin.id(), "{} is empty", self.index);
        OpIndex::from_u32(self.end.id() - 1)
    }

    /// Predecessors in the order they were added; for a loop header the forward edge comes first
    /// and the backedge last.
    #[inline]
    pub fn predecessors(&self) -> &[BlockIndex] {
        &self.predecessors
    }

    #[inline]
    pub fn predecessor_count(&self) -> usize {
        self.predecessors.len()
    }

    /// The most recently added predecessor; the backedge of a sealed loop header
    #[inline]
    pub fn last_predecessor(&self) -> Option<BlockIndex> {
        self.predecessors.last().copied()
    }

    /// Position of `pred` in the predecessor list of this block
    pub fn predecessor_position(&self, pred: BlockIndex) -> Option<usize> {
        self.predecessors.iter().position(|p| *p == pred)
    }

    #[inline]
    pub fn forward_predecessor(&self) -> Option<BlockIndex> {
        self.predecessors.first().copied()
    }

    /// The backedge predecessor of a loop header
    #[inline]
    pub fn backedge_predecessor(&self) -> Option<BlockIndex> {
        debug_assert!(self.is_loop());
        if self.predecessors.len() == 2 {
            self.last_predecessor()
        } else {
            None
        }
    }
}
