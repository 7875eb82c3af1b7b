//! Detection of loops that can be unrolled.
//!
//! A loop can be fully unrolled when its exit condition has the shape `phi(init, phi <op> step)
//! <cmp> bound` with constant `init`, `step` and `bound`, and simulating the induction variable
//! shows that the loop exits after a small number of iterations. Small loops whose trip count is
//! not known can still be partially unrolled.

#[cfg(test)]
mod tests;

use shaftc_ir::{
    BlockIndex, ComparisonKind, FxHashMap, Graph, OpIndex, Operation, OverflowCheckedBinopKind,
    WordBinopKind, WordRepresentation,
};

use crate::{LoopBody, LoopFinder, LoopInfo};

/// Loops running more iterations than this are not fully unrolled
pub const MAX_LOOP_ITERATIONS_FOR_FULL_UNROLLING: usize = 4;
/// Loops with more operations than this are neither fully nor partially unrolled
pub const MAX_LOOP_SIZE_FOR_UNROLLING: usize = 150;
/// The number of copies of the body emitted per iteration of a partially unrolled loop
pub const PARTIAL_UNROLLING_COUNT: usize = 4;

/// The result of simulating the exit condition of a loop
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IterationCount {
    /// The body executes exactly this many times
    Exact(usize),
    /// The exit condition was understood, but the loop runs more than
    /// [MAX_LOOP_ITERATIONS_FOR_FULL_UNROLLING] iterations, or the induction variable overflows
    /// a checked operation before the loop exits
    TooMany,
    /// The exit condition does not have a supported shape
    Unknown,
}

impl IterationCount {
    #[inline]
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    pub fn exact(&self) -> Option<usize> {
        match self {
            Self::Exact(count) => Some(*count),
            _ => None,
        }
    }

    /// The number of iterations to fully unroll, 0 meaning the loop cannot be fully unrolled
    pub fn as_full_unroll_count(&self) -> usize {
        self.exact().unwrap_or(0)
    }
}

/// Comparisons of the induction variable against the bound, with the induction variable on the left
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CmpOp {
    Equal,
    SignedLessThan,
    SignedLessThanOrEqual,
    SignedGreaterThan,
    SignedGreaterThanOrEqual,
    UnsignedLessThan,
    UnsignedLessThanOrEqual,
    UnsignedGreaterThan,
    UnsignedGreaterThanOrEqual,
}

impl CmpOp {
    fn from_comparison(kind: ComparisonKind) -> Self {
        match kind {
            ComparisonKind::SignedLessThan => Self::SignedLessThan,
            ComparisonKind::SignedLessThanOrEqual => Self::SignedLessThanOrEqual,
            ComparisonKind::UnsignedLessThan => Self::UnsignedLessThan,
            ComparisonKind::UnsignedLessThanOrEqual => Self::UnsignedLessThanOrEqual,
        }
    }

    /// The comparison with its operands swapped: `a < b` is `b > a`
    fn mirror(self) -> Self {
        match self {
            Self::Equal => Self::Equal,
            Self::SignedLessThan => Self::SignedGreaterThan,
            Self::SignedLessThanOrEqual => Self::SignedGreaterThanOrEqual,
            Self::SignedGreaterThan => Self::SignedLessThan,
            Self::SignedGreaterThanOrEqual => Self::SignedLessThanOrEqual,
            Self::UnsignedLessThan => Self::UnsignedGreaterThan,
            Self::UnsignedLessThanOrEqual => Self::UnsignedGreaterThanOrEqual,
            Self::UnsignedGreaterThan => Self::UnsignedLessThan,
            Self::UnsignedGreaterThanOrEqual => Self::UnsignedLessThanOrEqual,
        }
    }

    fn eval(self, value: u64, bound: u64, rep: WordRepresentation) -> bool {
        let (sv, sb) = (rep.sign_extend(value), rep.sign_extend(bound));
        let (uv, ub) = (rep.truncate(value), rep.truncate(bound));
        match self {
            Self::Equal => uv == ub,
            Self::SignedLessThan => sv < sb,
            Self::SignedLessThanOrEqual => sv <= sb,
            Self::SignedGreaterThan => sv > sb,
            Self::SignedGreaterThanOrEqual => sv >= sb,
            Self::UnsignedLessThan => uv < ub,
            Self::UnsignedLessThanOrEqual => uv <= ub,
            Self::UnsignedGreaterThan => uv > ub,
            Self::UnsignedGreaterThanOrEqual => uv >= ub,
        }
    }
}

/// The update of the induction variable
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BinOp {
    Word(WordBinopKind),
    OverflowChecked(OverflowCheckedBinopKind),
}

impl BinOp {
    fn is_supported_word_binop(kind: WordBinopKind) -> bool {
        matches!(
            kind,
            WordBinopKind::Add
                | WordBinopKind::Mul
                | WordBinopKind::Sub
                | WordBinopKind::BitwiseAnd
                | WordBinopKind::BitwiseOr
                | WordBinopKind::BitwiseXor
        )
    }

    /// Checked multiplication never qualifies an induction variable
    fn is_supported_overflow_checked_binop(kind: OverflowCheckedBinopKind) -> bool {
        matches!(kind, OverflowCheckedBinopKind::SignedAdd | OverflowCheckedBinopKind::SignedSub)
    }

    fn is_commutative(self) -> bool {
        match self {
            Self::Word(kind) => kind.is_commutative(),
            Self::OverflowChecked(kind) => kind != OverflowCheckedBinopKind::SignedSub,
        }
    }

    /// The next value of the induction variable, or `None` if a checked operation overflows
    fn next(self, value: u64, step: u64, rep: WordRepresentation) -> Option<u64> {
        match self {
            Self::Word(kind) => kind.fold(value, step, rep),
            Self::OverflowChecked(kind) => match kind.fold(value, step, rep) {
                (_, true) => None,
                (next, false) => Some(next),
            },
        }
    }
}

/// A matched induction variable and exit condition
#[derive(Debug, Copy, Clone)]
struct InductionPattern {
    cmp: CmpOp,
    cmp_rep: WordRepresentation,
    bound: u64,
    init: u64,
    binop: BinOp,
    binop_rep: WordRepresentation,
    step: u64,
}

/// Decides which loops of a graph are fully or partially unrolled
pub struct LoopUnrollingAnalyzer<'a> {
    graph: &'a Graph,
    loop_finder: LoopFinder,
    iteration_counts: FxHashMap<BlockIndex, IterationCount>,
}

impl<'a> LoopUnrollingAnalyzer<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        let mut analyzer = Self {
            graph,
            loop_finder: LoopFinder::new(graph),
            iteration_counts: FxHashMap::default(),
        };
        analyzer.detect_unrollable_loops();
        analyzer
    }

    fn detect_unrollable_loops(&mut self) {
        let mut counts = FxHashMap::default();
        for (header, info) in self.loop_finder.loop_headers() {
            if !info.has_inner_loops {
                let count = self.can_unroll_loop(info);
                log::debug!(target: "loop-unrolling", "loop {header}: iteration count {count:?}");
                counts.insert(header, count);
            }
        }
        self.iteration_counts = counts;
    }

    #[inline]
    pub fn loop_finder(&self) -> &LoopFinder {
        &self.loop_finder
    }

    pub fn can_unroll_at_least_one_loop(&self) -> bool {
        self.loop_finder
            .loop_headers()
            .any(|(header, _)| self.should_fully_unroll_loop(header) || self.should_partially_unroll_loop(header))
    }

    pub fn should_fully_unroll_loop(&self, header: BlockIndex) -> bool {
        debug_assert!(self.graph.block(header).is_loop());
        let info = self.loop_finder.loop_info(header);
        info.op_count <= MAX_LOOP_SIZE_FOR_UNROLLING
            && self.iteration_count(header).as_full_unroll_count() > 0
    }

    pub fn should_partially_unroll_loop(&self, header: BlockIndex) -> bool {
        debug_assert!(self.graph.block(header).is_loop());
        let info = self.loop_finder.loop_info(header);
        !info.has_inner_loops
            && info.op_count <= MAX_LOOP_SIZE_FOR_UNROLLING
            && matches!(self.graph.terminator(header), Operation::Branch { .. })
            && !self.should_fully_unroll_loop(header)
    }

    /// The trip count of the loop starting at `header`. Loops with inner loops are never analyzed.
    pub fn iteration_count(&self, header: BlockIndex) -> IterationCount {
        self.iteration_counts.get(&header).copied().unwrap_or(IterationCount::Unknown)
    }

    pub fn get_loop_body(&self, header: BlockIndex) -> LoopBody {
        debug_assert!(!self.loop_finder.loop_info(header).has_inner_loops);
        self.loop_finder.get_loop_body(self.graph, header)
    }

    fn can_unroll_loop(&self, info: &LoopInfo) -> IterationCount {
        let header = info.start;
        let Operation::Branch {
            condition, if_true, ..
        } = self.graph.terminator(header)
        else {
            // Looks like an infinite loop, or the exit is decided by something else
            return IterationCount::Unknown;
        };
        let stays_if_true = self.loop_finder.is_in_loop(*if_true, header);
        self.count_iterations(header, *condition, stays_if_true)
    }

    /// Simulate the loop whose header ends with a branch on `condition`, staying in the loop while
    /// the condition holds.
    pub fn can_unroll_loop_with_condition(&self, condition: OpIndex) -> IterationCount {
        let header = self.graph.block_of(condition);
        self.count_iterations(header, condition, true)
    }

    fn count_iterations(
        &self,
        header: BlockIndex,
        condition: OpIndex,
        stays_if_true: bool,
    ) -> IterationCount {
        let Some(pattern) = self.match_induction_pattern(header, condition) else {
            return IterationCount::Unknown;
        };
        log::trace!(target: "loop-unrolling", "loop {header}: matched {pattern:?}");

        let mut current = pattern.init;
        for iteration in 0..=MAX_LOOP_ITERATIONS_FOR_FULL_UNROLLING {
            if pattern.cmp.eval(current, pattern.bound, pattern.cmp_rep) != stays_if_true {
                return IterationCount::Exact(iteration);
            }
            if iteration == MAX_LOOP_ITERATIONS_FOR_FULL_UNROLLING {
                break;
            }
            match pattern.binop.next(current, pattern.step, pattern.binop_rep) {
                Some(next) => current = next,
                None => return IterationCount::TooMany,
            }
        }
        IterationCount::TooMany
    }

    /// Match `phi(init, phi <op> step) <cmp> bound`, in any operand order
    fn match_induction_pattern(&self, header: BlockIndex, condition: OpIndex) -> Option<InductionPattern> {
        let graph = self.graph;
        let (left, right, cmp, cmp_rep) = match graph.get(condition) {
            Operation::Comparison {
                left,
                right,
                kind,
                rep,
            } => (*left, *right, CmpOp::from_comparison(*kind), rep.as_word()?),
            Operation::Equal { left, right, rep } => (*left, *right, CmpOp::Equal, rep.as_word()?),
            _ => return None,
        };

        let is_loop_phi = |op: OpIndex| {
            graph.block_of(op) == header && graph.match_phi(op).is_some_and(|inputs| inputs.len() == 2)
        };
        let (phi, bound, cmp) = if is_loop_phi(left) {
            (left, graph.match_integral_constant(right)?, cmp)
        } else if is_loop_phi(right) {
            (right, graph.match_integral_constant(left)?, cmp.mirror())
        } else {
            return None;
        };

        let inputs = graph.match_phi(phi)?;
        let init = graph.match_integral_constant(inputs[0])?;
        let (binop_left, binop_right, binop, binop_rep) = self.match_update(inputs[1])?;
        let step = if binop_left == phi {
            graph.match_integral_constant(binop_right)?
        } else if binop_right == phi && binop.is_commutative() {
            graph.match_integral_constant(binop_left)?
        } else {
            return None;
        };

        Some(InductionPattern {
            cmp,
            cmp_rep,
            bound,
            init,
            binop,
            binop_rep,
            step,
        })
    }

    fn match_update(&self, op: OpIndex) -> Option<(OpIndex, OpIndex, BinOp, WordRepresentation)> {
        match self.graph.get(op) {
            Operation::WordBinop {
                left,
                right,
                kind,
                rep,
            } if BinOp::is_supported_word_binop(*kind) => {
                Some((*left, *right, BinOp::Word(*kind), *rep))
            }
            Operation::Projection { input, index: 0, .. } => match self.graph.get(*input) {
                Operation::OverflowCheckedBinop {
                    left,
                    right,
                    kind,
                    rep,
                } if BinOp::is_supported_overflow_checked_binop(*kind) => {
                    Some((*left, *right, BinOp::OverflowChecked(*kind), *rep))
                }
                _ => None,
            },
            _ => None,
        }
    }
}
