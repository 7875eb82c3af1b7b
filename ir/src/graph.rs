use core::{fmt, ops::Index};

use cranelift_entity::{PrimaryMap, SecondaryMap, packed_option::PackedOption};
use smallvec::SmallVec;

use crate::{Block, BlockIndex, OpIndex, Operation};

/// A position in the source program, used for the source position table of generated code
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub script_offset: i32,
    pub inlining_id: i32,
}

impl SourcePosition {
    pub const UNKNOWN: Self = Self {
        script_offset: -1,
        inlining_id: -1,
    };

    pub const fn new(script_offset: i32) -> Self {
        Self {
            script_offset,
            inlining_id: -1,
        }
    }

    #[inline]
    pub const fn is_known(&self) -> bool {
        self.script_offset >= 0
    }
}

impl Default for SourcePosition {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_known() {
            return f.write_str("<unknown>");
        }
        if self.inlining_id >= 0 {
            write!(f, "{}@{}", self.script_offset, self.inlining_id)
        } else {
            write!(f, "{}", self.script_offset)
        }
    }
}

/// An SSA graph of operations organized into blocks.
///
/// The graph owns all of its operations and blocks. Blocks are numbered in order, so iterating
/// [Graph::blocks] visits every block after all of its forward predecessors.
#[derive(Default, Clone)]
pub struct Graph {
    pub(crate) operations: PrimaryMap<OpIndex, Operation>,
    pub(crate) op_to_block: SecondaryMap<OpIndex, PackedOption<BlockIndex>>,
    pub(crate) blocks: PrimaryMap<BlockIndex, Block>,
    pub(crate) source_positions: SecondaryMap<OpIndex, SourcePosition>,
}

impl Graph {
    #[inline]
    pub fn get(&self, op: OpIndex) -> &Operation {
        &self.operations[op]
    }

    #[inline]
    pub fn block(&self, block: BlockIndex) -> &Block {
        &self.blocks[block]
    }

    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = &Block> + ExactSizeIterator {
        self.blocks.values()
    }

    pub fn block_indices(&self) -> impl DoubleEndedIterator<Item = BlockIndex> + ExactSizeIterator + use<> {
        (0..self.blocks.len() as u32).map(BlockIndex::from_u32)
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn op_count(&self) -> usize {
        self.operations.len()
    }

    #[inline]
    pub fn entry_block(&self) -> BlockIndex {
        BlockIndex::from_u32(0)
    }

    /// The block containing `op`
    pub fn block_of(&self, op: OpIndex) -> BlockIndex {
        match self.op_to_block[op].expand() {
            Some(block) => block,
            None => panic!("{op} does not belong to any block"),
        }
    }

    /// All operations of the graph, in block order
    pub fn all_operations(&self) -> impl DoubleEndedIterator<Item = (OpIndex, &Operation)> {
        self.operations.iter()
    }

    /// The operations of `block`, in order
    pub fn operations(
        &self,
        block: BlockIndex,
    ) -> impl DoubleEndedIterator<Item = (OpIndex, &Operation)> + ExactSizeIterator {
        self.blocks[block].ops().map(move |op| (op, &self.operations[op]))
    }

    #[inline]
    pub fn terminator(&self, block: BlockIndex) -> &Operation {
        &self.operations[self.blocks[block].terminator()]
    }

    pub fn successors(&self, block: BlockIndex) -> SmallVec<[BlockIndex; 2]> {
        self.terminator(block).successors()
    }

    /// Number of uses of every operation by other operations of the graph
    pub fn use_counts(&self) -> SecondaryMap<OpIndex, u32> {
        let mut counts = SecondaryMap::with_capacity(self.operations.len());
        for (_, op) in self.operations.iter() {
            for input in op.inputs() {
                counts[input] += 1;
            }
        }
        counts
    }

    #[inline]
    pub fn source_position(&self, op: OpIndex) -> SourcePosition {
        self.source_positions[op]
    }

    pub fn set_source_position(&mut self, op: OpIndex, position: SourcePosition) {
        self.source_positions[op] = position;
    }

    /// Replace `op` in place with `replacement`.
    ///
    /// Only for phases that rewrite representations without changing the shape of the graph: the
    /// replacement must have the same inputs and successors.
    pub fn replace_in_place(&mut self, op: OpIndex, replacement: Operation) {
        debug_assert_eq!(self.operations[op].inputs(), replacement.inputs());
        debug_assert_eq!(self.operations[op].successors(), replacement.successors());
        self.operations[op] = replacement;
    }

    /// Returns the index of the `Projection` of `op` with the given output index, if one exists
    /// in the same block.
    pub fn find_projection(&self, op: OpIndex, index: u16) -> Option<OpIndex> {
        let block = self.block_of(op);
        self.operations(block).find_map(|(idx, candidate)| match candidate {
            Operation::Projection {
                input,
                index: projection,
                ..
            } if *input == op && *projection == index => Some(idx),
            _ => None,
        })
    }
}

impl Index<OpIndex> for Graph {
    type Output = Operation;

    #[inline]
    fn index(&self, index: OpIndex) -> &Self::Output {
        &self.operations[index]
    }
}

impl Index<BlockIndex> for Graph {
    type Output = Block;

    #[inline]
    fn index(&self, index: BlockIndex) -> &Self::Output {
        &self.blocks[index]
    }
}
