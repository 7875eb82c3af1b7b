//! The graph intermediate representation consumed by the backend.
//!
//! A [Graph] is an arena of [Operation]s addressed by dense [OpIndex] handles, partitioned into
//! [Block]s. Operations of a block occupy a contiguous range of indices, and blocks are stored in
//! the order they were bound, which is a valid forward order: every predecessor of a block other
//! than a loop backedge comes before it.
//!
//! Graphs are constructed with a [GraphBuilder], which maintains the structural invariants the rest
//! of the backend relies on:
//!
//! * The graph is in split-edge form: a block with more than one successor only targets blocks with
//!   a single predecessor, and loop headers are only ever entered by a `Goto`.
//! * A loop header has exactly two predecessors once sealed: the forward edge first, then the
//!   backedge.
//! * Operations are never mutated once committed, with the exception of `PendingLoopPhi`s being
//!   replaced by the real `Phi` once the backedge value is known.

mod block;
pub mod builder;
mod call;
mod graph;
mod index;
mod matcher;
mod operation;
mod print;
mod rep;
pub mod types;

pub use smallvec::{SmallVec, smallvec};

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub type FxHashSet<K> = hashbrown::HashSet<K, rustc_hash::FxBuildHasher>;
pub use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap, packed_option::PackedOption};
pub use rustc_hash::FxBuildHasher;

pub use self::{
    block::{Block, BlockKind},
    builder::GraphBuilder,
    call::{CallDescriptor, CallDescriptorFlags, CallKind, FrameStateInfo},
    graph::{Graph, SourcePosition},
    index::{BlockIndex, OpIndex},
    operation::*,
    rep::{FloatRepresentation, MemoryRepresentation, RegisterRepresentation, WordRepresentation},
};
