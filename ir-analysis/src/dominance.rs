use petgraph::{algo::dominators, graphmap::DiGraphMap};
use shaftc_ir::{BlockIndex, Graph, OpIndex, PackedOption, SecondaryMap};

/// The dominator tree of the blocks of a graph
pub struct DominatorTree {
    idom: SecondaryMap<BlockIndex, PackedOption<BlockIndex>>,
    depth: SecondaryMap<BlockIndex, u32>,
    reachable: SecondaryMap<BlockIndex, bool>,
}

impl DominatorTree {
    pub fn new(graph: &Graph) -> Self {
        let mut cfg =
            DiGraphMap::<BlockIndex, ()>::with_capacity(graph.block_count(), graph.block_count() * 2);
        for block in graph.block_indices() {
            cfg.add_node(block);
            for succ in graph.successors(block) {
                cfg.add_edge(block, succ, ());
            }
        }
        let entry = graph.entry_block();
        let dominators = dominators::simple_fast(&cfg, entry);

        let mut tree = Self {
            idom: SecondaryMap::with_capacity(graph.block_count()),
            depth: SecondaryMap::with_capacity(graph.block_count()),
            reachable: SecondaryMap::with_capacity(graph.block_count()),
        };
        tree.reachable[entry] = true;
        // Blocks are in a forward order, so every immediate dominator precedes the blocks it
        // dominates.
        for block in graph.block_indices() {
            if block == entry {
                continue;
            }
            if let Some(idom) = dominators.immediate_dominator(block) {
                tree.idom[block] = idom.into();
                tree.depth[block] = tree.depth[idom] + 1;
                tree.reachable[block] = true;
            }
        }
        tree
    }

    pub fn immediate_dominator(&self, block: BlockIndex) -> Option<BlockIndex> {
        self.idom[block].expand()
    }

    #[inline]
    pub fn is_reachable(&self, block: BlockIndex) -> bool {
        self.reachable[block]
    }

    /// True if every path from the entry to `b` goes through `a`. A block dominates itself.
    pub fn dominates(&self, a: BlockIndex, b: BlockIndex) -> bool {
        let mut current = b;
        while self.depth[current] > self.depth[a] {
            match self.idom[current].expand() {
                Some(idom) => current = idom,
                None => return false,
            }
        }
        current == a
    }

    /// True if the value defined by `def` is available at `user`
    pub fn op_dominates(&self, graph: &Graph, def: OpIndex, user: OpIndex) -> bool {
        let def_block = graph.block_of(def);
        let user_block = graph.block_of(user);
        if def_block == user_block {
            def < user
        } else {
            self.dominates(def_block, user_block)
        }
    }
}

#[cfg(test)]
mod tests {
    use shaftc_ir::{GraphBuilder, RegisterRepresentation};

    use super::*;

    #[test]
    fn diamond_dominance() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        let left = b.new_block();
        let right = b.new_block();
        let merge = b.new_block();
        b.bind(entry);
        let c = b.parameter(0, RegisterRepresentation::Word32);
        b.branch(c, left, right);
        b.bind(left);
        b.goto(merge);
        b.bind(right);
        b.goto(merge);
        b.bind(merge);
        b.return_([c]);
        let graph = b.finish();

        let tree = DominatorTree::new(&graph);
        let [entry, left, right, merge] = [0, 1, 2, 3].map(BlockIndex::from_u32);
        assert!(tree.dominates(entry, merge));
        assert!(tree.dominates(merge, merge));
        assert!(!tree.dominates(left, merge));
        assert!(!tree.dominates(right, left));
        assert_eq!(tree.immediate_dominator(merge), Some(entry));
        assert_eq!(tree.immediate_dominator(entry), None);
    }
}
