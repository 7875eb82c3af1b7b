use std::collections::BTreeMap;

use shaftc_ir::{BlockIndex, FxHashSet, Graph, Operation, PackedOption, SecondaryMap};
use smallvec::SmallVec;

/// The blocks of a loop, in block order
pub type LoopBody = SmallVec<[BlockIndex; 8]>;

/// Summary of a single loop, excluding the blocks of any loop nested inside it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    /// The loop header
    pub start: BlockIndex,
    /// The block ending in the backedge
    pub end: BlockIndex,
    pub has_inner_loops: bool,
    /// Number of blocks in the loop, including the header and the headers of inner loops
    pub block_count: usize,
    /// Number of operations in the loop, excluding the header
    pub op_count: usize,
}

/// Determines which loop each block of a graph belongs to.
///
/// A block belongs to a loop if there is a forward path (i.e. one not taking a backedge) from it to
/// the backedge of the loop. Blocks are visited in reverse order, so inner loops are fully resolved
/// before the loops containing them, and each block is visited at most twice.
pub struct LoopFinder {
    parent_loops: SecondaryMap<BlockIndex, PackedOption<BlockIndex>>,
    loop_headers: BTreeMap<BlockIndex, LoopInfo>,
}

impl LoopFinder {
    pub fn new(graph: &Graph) -> Self {
        let mut finder = Self {
            parent_loops: SecondaryMap::with_capacity(graph.block_count()),
            loop_headers: BTreeMap::new(),
        };
        let mut queue = Vec::new();
        for block in graph.blocks().rev() {
            if block.is_loop() {
                let info = finder.visit_loop(graph, block.index(), &mut queue);
                log::trace!(
                    target: "loop-unrolling",
                    "found loop {}..{}: {} blocks, {} ops, inner loops: {}",
                    info.start,
                    info.end,
                    info.block_count,
                    info.op_count,
                    info.has_inner_loops
                );
                finder.loop_headers.insert(block.index(), info);
            }
        }
        finder
    }

    fn visit_loop(
        &mut self,
        graph: &Graph,
        header: BlockIndex,
        queue: &mut Vec<BlockIndex>,
    ) -> LoopInfo {
        let backedge = match graph.block(header).backedge_predecessor() {
            Some(backedge) => backedge,
            None => panic!("loop header {header} has no backedge"),
        };
        debug_assert!(matches!(
            graph.terminator(backedge),
            Operation::Goto { destination, .. } if *destination == header
        ));

        let mut info = LoopInfo {
            start: header,
            end: backedge,
            has_inner_loops: false,
            block_count: 0,
            op_count: 0,
        };

        queue.clear();
        queue.push(backedge);
        while let Some(current) = queue.pop() {
            if current == header {
                continue;
            }
            if let Some(parent) = self.parent_loops[current].expand() {
                if parent != header {
                    // `current` belongs to an inner loop: continue from the inner header, whose
                    // forward predecessors leave the inner loop.
                    queue.push(parent);
                    info.has_inner_loops = true;
                }
                continue;
            }

            let block = graph.block(current);
            info.block_count += 1;
            info.op_count += block.op_count() as usize;
            self.parent_loops[current] = header.into();
            let preds = if block.is_loop() {
                // The backedge of an inner loop leads back into that loop, which has already been
                // visited.
                info.has_inner_loops = true;
                &block.predecessors()[..block.predecessor_count() - 1]
            } else {
                block.predecessors()
            };
            queue.extend(preds.iter().rev().copied());
        }

        // Account for the header itself
        info.block_count += 1;
        info
    }

    /// All loop headers with their summaries, in block order
    pub fn loop_headers(&self) -> impl Iterator<Item = (BlockIndex, &LoopInfo)> {
        self.loop_headers.iter().map(|(header, info)| (*header, info))
    }

    /// The innermost loop `block` belongs to. For a loop header, this is the loop enclosing it.
    pub fn loop_header_of(&self, block: BlockIndex) -> Option<BlockIndex> {
        self.parent_loops[block].expand()
    }

    pub fn loop_info(&self, header: BlockIndex) -> &LoopInfo {
        match self.loop_headers.get(&header) {
            Some(info) => info,
            None => panic!("{header} is not a loop header"),
        }
    }

    /// True if `block` is `header` or belongs to its loop, directly or through an inner loop
    pub fn is_in_loop(&self, block: BlockIndex, header: BlockIndex) -> bool {
        let mut current = Some(block);
        while let Some(block) = current {
            if block == header {
                return true;
            }
            current = self.loop_header_of(block);
        }
        false
    }

    /// Every block reachable backwards from the backedge of `header` without going through
    /// `header`, plus `header` itself. This includes the blocks of inner loops.
    pub fn get_loop_body(&self, graph: &Graph, header: BlockIndex) -> LoopBody {
        let mut body = FxHashSet::default();
        body.insert(header);
        let mut queue = Vec::new();
        queue.extend(graph.block(header).backedge_predecessor());
        while let Some(current) = queue.pop() {
            if !body.insert(current) {
                continue;
            }
            queue.extend(
                graph.block(current).predecessors().iter().copied().filter(|pred| *pred != header),
            );
        }
        let mut body: LoopBody = body.into_iter().collect();
        body.sort_unstable();
        body
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shaftc_ir::{GraphBuilder, RegisterRepresentation};

    use super::*;
    use crate::test_utils::init_logger;

    /// Builds:
    ///
    /// ```text
    /// b0 -> b1 (loop) -> b2 -> b3 (loop) -> b4 -> b3
    ///                          b3 -> b5 -> b1
    ///       b1 -> b6 (exit)
    /// ```
    ///
    /// after renumbering by the builder.
    fn nested_loops() -> (Graph, BlockIndex, BlockIndex) {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let outer = b.new_loop_header();
        let outer_body = b.new_block();
        let inner = b.new_loop_header();
        let inner_body = b.new_block();
        let outer_latch = b.new_block();
        let exit = b.new_block();

        b.bind(entry);
        let c = b.parameter(0, RegisterRepresentation::Word32);
        b.goto(outer);

        b.bind(outer);
        b.branch(c, outer_body, exit);

        b.bind(outer_body);
        b.goto(inner);

        b.bind(inner);
        b.branch(c, inner_body, outer_latch);

        b.bind(inner_body);
        b.goto(inner);

        b.bind(outer_latch);
        b.goto(outer);

        b.bind(exit);
        b.return_([c]);

        let graph = b.finish();
        (graph, BlockIndex::from_u32(1), BlockIndex::from_u32(3))
    }

    #[test]
    fn loop_body_of_innermost_loop() {
        init_logger();
        let (graph, _, inner) = nested_loops();
        let finder = LoopFinder::new(&graph);
        let info = finder.loop_info(inner);
        assert!(!info.has_inner_loops);

        let body = finder.get_loop_body(&graph, inner);
        assert_eq!(body.as_slice(), &[inner, BlockIndex::from_u32(4)]);
        assert_eq!(body.len(), info.block_count);
        assert_eq!(finder.loop_header_of(BlockIndex::from_u32(4)), Some(inner));
    }

    #[test]
    fn inner_loops_are_excluded_from_outer_loop() {
        init_logger();
        let (graph, outer, inner) = nested_loops();
        let finder = LoopFinder::new(&graph);
        let info = *finder.loop_info(outer);
        assert!(info.has_inner_loops);
        assert_eq!(info.start, outer);
        // outer header, outer body, inner header, outer latch
        assert_eq!(info.block_count, 4);

        let inner_body = BlockIndex::from_u32(4);
        assert_eq!(finder.loop_header_of(inner), Some(outer));
        assert_eq!(finder.loop_header_of(inner_body), Some(inner));
        assert!(finder.is_in_loop(inner_body, outer));
        let inner_ops = graph.block(inner_body).op_count() as usize;
        let expected_ops: usize = [2u32, 3, 5]
            .into_iter()
            .map(|b| graph.block(BlockIndex::from_u32(b)).op_count() as usize)
            .sum();
        assert_eq!(info.op_count, expected_ops);
        assert!(info.op_count > 0 && inner_ops > 0);
        assert_eq!(finder.loop_header_of(BlockIndex::from_u32(6)), None);
    }
}
