//! Flow-sensitive range analysis, and a reducer replacing operations of known value by constants.
//!
//! Every operation gets a [Type] computed from the types of its inputs. On top of that, each block
//! carries refinements: narrower types of values that hold on entry to the block because of the
//! branches leading to it. Refinements are inherited along single edges, intersected at merges,
//! and only taken from the forward edge at loop headers.
//!
//! Loops are solved by iterating to a fixpoint: once the backedge of a loop is reached, the types
//! of its phis are recomputed, and if they grew, they are widened and the loop is analyzed again
//! from its header.

use shaftc_ir::{
    BlockIndex, ChangeKind, ComparisonKind, EntityRef, FloatRepresentation, FxHashMap, Graph,
    OpIndex, Operation, SecondaryMap, SmallVec, WordRepresentation, types::Type,
};

use crate::{CopyingPhase, Reducer, Reduction};

/// Revisits of a single loop after which its phis are given up on
const MAX_LOOP_REVISITS: u32 = 16;

type Refinements = FxHashMap<OpIndex, Type>;

/// `value <relation> constant`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Relation {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl Relation {
    fn negate(self) -> Self {
        match self {
            Self::LessThan => Self::GreaterThanOrEqual,
            Self::LessThanOrEqual => Self::GreaterThan,
            Self::GreaterThan => Self::LessThanOrEqual,
            Self::GreaterThanOrEqual => Self::LessThan,
        }
    }

    /// The relation of the right operand to the left one
    fn mirror(self) -> Self {
        match self {
            Self::LessThan => Self::GreaterThan,
            Self::LessThanOrEqual => Self::GreaterThanOrEqual,
            Self::GreaterThan => Self::LessThan,
            Self::GreaterThanOrEqual => Self::LessThanOrEqual,
        }
    }

    /// The values of width `rep` standing in this relation to `constant`, compared unsigned
    fn range(self, constant: u64, rep: WordRepresentation) -> Type {
        let max = rep.max_unsigned_value();
        let (min, max) = match self {
            Self::LessThan if constant == 0 => return Type::None,
            Self::LessThan => (0, constant - 1),
            Self::LessThanOrEqual => (0, constant),
            Self::GreaterThan if constant >= max => return Type::None,
            Self::GreaterThan => (constant + 1, max),
            Self::GreaterThanOrEqual => (constant, max),
        };
        word_range(rep, min, max)
    }
}

fn word_range(rep: WordRepresentation, min: u64, max: u64) -> Type {
    match rep {
        WordRepresentation::Word32 => Type::Word32 {
            min: min as u32,
            max: max as u32,
        },
        WordRepresentation::Word64 => Type::Word64 { min, max },
    }
}

/// The types of the operations of a graph, and the refinements holding in each block
pub struct TypeInferenceAnalysis {
    types: SecondaryMap<OpIndex, Type>,
    refinements: SecondaryMap<BlockIndex, Refinements>,
    reachable: SecondaryMap<BlockIndex, bool>,
    /// Current types of loop phis, which only grow
    loop_phis: FxHashMap<OpIndex, Type>,
    revisits: FxHashMap<BlockIndex, u32>,
}

impl TypeInferenceAnalysis {
    pub fn run(graph: &Graph) -> Self {
        let mut analysis = Self {
            types: SecondaryMap::with_capacity(graph.op_count()),
            refinements: SecondaryMap::with_capacity(graph.block_count()),
            reachable: SecondaryMap::with_capacity(graph.block_count()),
            loop_phis: FxHashMap::default(),
            revisits: FxHashMap::default(),
        };
        let mut next = 0;
        while next < graph.block_count() {
            let block = BlockIndex::new(next);
            analysis.process_block(graph, block);
            next += 1;
            if let Operation::Goto { destination, .. } = *graph.terminator(block) {
                let is_backedge = graph.block(destination).is_loop() && destination <= block;
                if is_backedge
                    && analysis.reachable[block]
                    && analysis.update_loop_phis(graph, destination, block)
                {
                    log::trace!(target: "type-inference", "revisiting loop {destination}");
                    next = destination.index();
                }
            }
        }
        analysis
    }

    /// The type of `op`, regardless of where it is used
    #[inline]
    pub fn type_of(&self, op: OpIndex) -> Type {
        self.types[op]
    }

    /// The type of `op` as known on entry to `block`
    pub fn type_in_block(&self, op: OpIndex, block: BlockIndex) -> Type {
        self.refinements[block].get(&op).copied().unwrap_or(self.types[op])
    }

    /// False if no execution can reach `block`
    #[inline]
    pub fn is_reachable(&self, block: BlockIndex) -> bool {
        self.reachable[block]
    }

    fn edge_is_feasible(&self, graph: &Graph, pred: BlockIndex, block: BlockIndex) -> bool {
        if !self.reachable[pred] {
            return false;
        }
        match *graph.terminator(pred) {
            Operation::Branch {
                condition,
                if_true,
                if_false,
                ..
            } => match self.type_in_block(condition, pred).as_word32_constant() {
                Some(0) => if_false == block,
                Some(_) => if_true == block,
                None => true,
            },
            _ => true,
        }
    }

    fn process_block(&mut self, graph: &Graph, block: BlockIndex) {
        let reachable = self.compute_refinements(graph, block);
        self.reachable[block] = reachable;
        for (index, op) in graph.operations(block) {
            let ty = if reachable {
                self.type_operation(graph, block, index, op)
            } else {
                Type::None
            };
            self.types[index] = ty;
        }
    }

    /// Compute the refinements holding on entry to `block`, returning false if it is unreachable
    fn compute_refinements(&mut self, graph: &Graph, block: BlockIndex) -> bool {
        let data = graph.block(block);
        if block == graph.entry_block() {
            self.refinements[block] = Refinements::default();
            return true;
        }
        let preds = if data.is_loop() {
            data.forward_predecessor().into_iter().collect::<SmallVec<[BlockIndex; 4]>>()
        } else {
            data.predecessors().iter().copied().collect()
        };
        let feasible = preds
            .into_iter()
            .filter(|pred| self.edge_is_feasible(graph, *pred, block))
            .collect::<SmallVec<[BlockIndex; 4]>>();

        let refinements = match feasible.as_slice() {
            [] => {
                self.refinements[block] = Refinements::default();
                return false;
            }
            [pred] => {
                let mut refinements = self.refinements[*pred].clone();
                if !data.is_loop() {
                    self.refine_for_edge(graph, *pred, block, &mut refinements);
                }
                refinements
            }
            [first, rest @ ..] => {
                let mut refinements = Refinements::default();
                for (op, ty) in self.refinements[*first].iter() {
                    let mut joined = *ty;
                    let in_all = rest.iter().all(|pred| match self.refinements[*pred].get(op) {
                        Some(other) => {
                            joined = joined.least_upper_bound(other);
                            true
                        }
                        None => false,
                    });
                    if in_all {
                        refinements.insert(*op, joined);
                    }
                }
                refinements
            }
        };
        self.refinements[block] = refinements;
        true
    }

    /// Add what the branch ending `pred` implies about its condition when it jumps to `block`
    fn refine_for_edge(
        &self,
        graph: &Graph,
        pred: BlockIndex,
        block: BlockIndex,
        refinements: &mut Refinements,
    ) {
        let Operation::Branch {
            condition, if_true, ..
        } = *graph.terminator(pred)
        else {
            return;
        };
        let taken = if_true == block;
        let cond_type = self.type_in_block(condition, pred);
        let refined = if taken {
            cond_type.intersect(&Type::Word32 {
                min: 1,
                max: u32::MAX,
            })
        } else {
            Type::word32_constant(0)
        };
        refinements.insert(condition, refined);

        match *graph.get(condition) {
            Operation::Comparison {
                left,
                right,
                kind,
                rep,
            } => {
                let Some(rep) = rep.as_word() else {
                    return;
                };
                let relation = match kind {
                    ComparisonKind::SignedLessThan | ComparisonKind::UnsignedLessThan => {
                        Relation::LessThan
                    }
                    ComparisonKind::SignedLessThanOrEqual
                    | ComparisonKind::UnsignedLessThanOrEqual => Relation::LessThanOrEqual,
                };
                let relation = if taken { relation } else { relation.negate() };
                let signed = kind.is_signed();
                self.refine_operand(pred, left, right, relation, rep, signed, refinements);
                self.refine_operand(pred, right, left, relation.mirror(), rep, signed, refinements);
            }
            Operation::Equal { left, right, rep } if taken && rep.is_word() => {
                for (value, other) in [(left, right), (right, left)] {
                    let other = self.type_in_block(other, pred);
                    if other.as_constant().is_some() {
                        let ty = self.type_in_block(value, pred).intersect(&other);
                        refinements.insert(value, ty);
                    }
                }
            }
            _ => (),
        }
    }

    /// Refine `value`, known to stand in `relation` to `other`, if `other` is a constant
    #[allow(clippy::too_many_arguments)]
    fn refine_operand(
        &self,
        pred: BlockIndex,
        value: OpIndex,
        other: OpIndex,
        relation: Relation,
        rep: WordRepresentation,
        signed: bool,
        refinements: &mut Refinements,
    ) {
        let Some((constant, _)) = self
            .type_in_block(other, pred)
            .word_range()
            .filter(|(min, max)| min == max)
        else {
            return;
        };
        let current = refinements.get(&value).copied().unwrap_or(self.type_in_block(value, pred));
        if signed {
            // Signed and unsigned orders only agree on non-negative values
            let half = 1u64 << (rep.bit_width() - 1);
            let non_negative = current.word_range().is_some_and(|(_, max)| max < half);
            if !non_negative || constant >= half {
                return;
            }
        }
        let refined = current.intersect(&relation.range(constant, rep));
        log::trace!(target: "type-inference", "refined {value} to {refined} on entry to a successor of {pred}");
        refinements.insert(value, refined);
    }

    fn type_operation(
        &mut self,
        graph: &Graph,
        block: BlockIndex,
        index: OpIndex,
        op: &Operation,
    ) -> Type {
        let input = |value: OpIndex| self.type_in_block(value, block);
        match *op {
            Operation::Constant { ref kind } => Type::of_constant(kind),
            Operation::WordBinop {
                left,
                right,
                kind,
                rep,
            } => Type::word_binop(kind, rep, &input(left), &input(right)),
            Operation::Shift {
                left,
                right,
                kind,
                rep,
            } => Type::shift(kind, rep, &input(left), &input(right)),
            Operation::Comparison {
                left,
                right,
                kind,
                rep,
            } => Type::comparison(kind, rep, &input(left), &input(right)),
            Operation::Equal { left, right, .. } => Type::equal(&input(left), &input(right)),
            Operation::FloatBinop {
                left,
                right,
                kind,
                rep: FloatRepresentation::Float64,
            } => Type::float64_binop(kind, &input(left), &input(right)),
            Operation::Change {
                input: value,
                kind,
                to,
                ..
            } => match (kind, input(value).word_range()) {
                (ChangeKind::ZeroExtend, Some((min, max))) => Type::Word64 { min, max },
                (ChangeKind::SignExtend, Some((min, max))) if max < 1 << 31 => {
                    Type::Word64 { min, max }
                }
                (ChangeKind::Truncate, Some((min, max))) if max <= u32::MAX as u64 => {
                    Type::Word32 {
                        min: min as u32,
                        max: max as u32,
                    }
                }
                _ => Type::for_representation(to),
            },
            Operation::Select {
                cond,
                vtrue,
                vfalse,
                ..
            } => match input(cond).as_word32_constant() {
                Some(0) => input(vfalse),
                Some(_) => input(vtrue),
                None => input(vtrue).least_upper_bound(&input(vfalse)),
            },
            Operation::Phi { ref inputs, rep } => {
                let data = graph.block(block);
                if data.is_loop() {
                    if let Some(ty) = self.loop_phis.get(&index) {
                        return *ty;
                    }
                    let ty = data
                        .forward_predecessor()
                        .map_or(Type::for_representation(rep), |pred| {
                            self.type_in_block(inputs[0], pred)
                        });
                    self.loop_phis.insert(index, ty);
                    return ty;
                }
                data.predecessors()
                    .iter()
                    .zip(inputs.iter())
                    .filter(|(pred, _)| self.edge_is_feasible(graph, **pred, block))
                    .fold(Type::None, |ty, (pred, value)| {
                        ty.least_upper_bound(&self.type_in_block(*value, *pred))
                    })
            }
            ref op => op.output_rep().map_or(Type::Any, Type::for_representation),
        }
    }

    /// Recompute the types of the phis of `header` now that `latch` has been analyzed. Returns true
    /// if any of them grew, in which case the loop must be analyzed again.
    fn update_loop_phis(&mut self, graph: &Graph, header: BlockIndex, latch: BlockIndex) -> bool {
        let Some(forward) = graph.block(header).forward_predecessor() else {
            return false;
        };
        let revisits = self.revisits.entry(header).or_default();
        *revisits += 1;
        let give_up = *revisits > MAX_LOOP_REVISITS;

        let mut changed = false;
        for (index, op) in graph.operations(header) {
            let Operation::Phi { ref inputs, rep } = *op else {
                continue;
            };
            let old = self.loop_phis.get(&index).copied().unwrap_or_default();
            let new = self
                .type_in_block(inputs[0], forward)
                .least_upper_bound(&self.type_in_block(inputs[1], latch));
            if new.is_subtype_of(&old) {
                continue;
            }
            let widened = if give_up {
                Type::for_representation(rep)
            } else {
                old.widen(&new)
            };
            log::trace!(target: "type-inference", "loop phi {index}: {old} widened to {widened}");
            self.loop_phis.insert(index, widened);
            changed = true;
        }
        changed
    }
}

/// Replaces pure operations whose type holds a single value by that constant, and branches whose
/// condition is known in their block by gotos.
pub struct TypeInferenceReducer {
    analysis: TypeInferenceAnalysis,
}

impl TypeInferenceReducer {
    pub fn new(graph: &Graph) -> Self {
        Self {
            analysis: TypeInferenceAnalysis::run(graph),
        }
    }

    pub fn analysis(&self) -> &TypeInferenceAnalysis {
        &self.analysis
    }
}

impl Reducer for TypeInferenceReducer {
    fn name(&self) -> &'static str {
        "type-inference"
    }

    fn reduce(
        &mut self,
        copier: &mut CopyingPhase<'_>,
        index: OpIndex,
        op: &Operation,
    ) -> Reduction {
        match *op {
            Operation::Branch {
                condition,
                if_true,
                if_false,
                ..
            } => {
                let Some(block) = copier.current_input_block() else {
                    return Reduction::Copy;
                };
                match self.analysis.type_in_block(condition, block).as_word32_constant() {
                    Some(value) => {
                        let destination = copier.map_block(if value != 0 { if_true } else { if_false });
                        log::trace!(target: "type-inference", "branch {index} always goes to {destination}");
                        Reduction::Replace(copier.goto(destination))
                    }
                    None => Reduction::Copy,
                }
            }
            // Phis must stay at the start of their block
            ref op if op.is_pure() && !op.is_constant() && !op.is_phi() => {
                let Some(kind) = self.analysis.type_of(index).as_constant() else {
                    return Reduction::Copy;
                };
                if op.output_rep() != Some(kind.rep()) {
                    return Reduction::Copy;
                }
                log::trace!(target: "type-inference", "{index} ({}) is always {kind:?}", op.name());
                Reduction::Replace(copier.builder().constant(kind))
            }
            _ => Reduction::Copy,
        }
    }
}
