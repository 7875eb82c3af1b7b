//! Graph-to-graph transformations over a [shaftc_ir::Graph].
//!
//! Most transformations are [Reducer]s, run by a [CopyingPhase] that rebuilds the input graph into
//! a new one. Decompression optimization is the exception: it only changes representations, so it
//! rewrites operations in place.

mod branch_condition_duplication;
mod copier;
mod decompression_optimization;
mod loop_peeling;
mod loop_unrolling;
mod select_lowering;
mod type_inference;

pub use self::{
    branch_condition_duplication::BranchConditionDuplicationReducer,
    copier::{CloneOptions, CopyReducer, CopyingPhase, Reducer, Reduction},
    decompression_optimization::run_decompression_optimization,
    loop_peeling::LoopPeelingReducer,
    loop_unrolling::LoopUnrollingReducer,
    select_lowering::{SelectDetectionReducer, SelectLoweringReducer},
    type_inference::{TypeInferenceAnalysis, TypeInferenceReducer},
};

#[cfg(test)]
pub(crate) mod test_utils {
    use shaftc_ir::{
        BlockIndex, ChangeKind, ConstantKind, Graph, OpIndex, Operation, SecondaryMap,
    };

    pub fn init_logger() {
        let _ = env_logger::Builder::from_env("SHAFTC_TRACE")
            .format_timestamp(None)
            .is_test(true)
            .try_init();
    }

    const STEP_LIMIT: usize = 100_000;

    /// Evaluates the integer subset of the IR, to check that a transformation preserves behavior.
    ///
    /// Word32 values are kept zero-extended in a `u64`.
    pub struct Interpreter<'a> {
        graph: &'a Graph,
        values: SecondaryMap<OpIndex, u64>,
        overflows: SecondaryMap<OpIndex, u64>,
    }

    impl<'a> Interpreter<'a> {
        pub fn new(graph: &'a Graph) -> Self {
            Self {
                graph,
                values: SecondaryMap::new(),
                overflows: SecondaryMap::new(),
            }
        }

        pub fn run(&mut self, params: &[u64]) -> Vec<u64> {
            let graph = self.graph;
            let mut block = graph.entry_block();
            let mut pred: Option<BlockIndex> = None;
            for _ in 0..STEP_LIMIT {
                let position = pred.map(|pred| {
                    graph
                        .block(block)
                        .predecessor_position(pred)
                        .unwrap_or_else(|| panic!("{pred} is not a predecessor of {block}"))
                });
                // Phis read their inputs in parallel
                let phis = graph
                    .operations(block)
                    .filter_map(|(index, op)| match op {
                        Operation::Phi { inputs, .. } => {
                            let position = position.expect("phi in the entry block");
                            Some((index, self.values[inputs[position]]))
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>();
                for (index, value) in phis {
                    self.values[index] = value;
                }

                for (index, op) in graph.operations(block) {
                    match op {
                        Operation::Phi { .. } => continue,
                        Operation::Goto { destination, .. } => {
                            pred = Some(block);
                            block = *destination;
                        }
                        Operation::Branch {
                            condition,
                            if_true,
                            if_false,
                            ..
                        } => {
                            pred = Some(block);
                            block = if self.values[*condition] != 0 { *if_true } else { *if_false };
                        }
                        Operation::Switch {
                            input,
                            cases,
                            default,
                            ..
                        } => {
                            let value = self.values[*input] as u32 as i32;
                            pred = Some(block);
                            block = cases
                                .iter()
                                .find(|case| case.value == value)
                                .map_or(*default, |case| case.destination);
                        }
                        Operation::Return { values, .. } => {
                            return values.iter().map(|value| self.values[*value]).collect();
                        }
                        op => {
                            let value = self.evaluate(index, op, params);
                            self.values[index] = value;
                        }
                    }
                }
            }
            panic!("no return after {STEP_LIMIT} blocks");
        }

        fn evaluate(&mut self, index: OpIndex, op: &Operation, params: &[u64]) -> u64 {
            let v = |op: &OpIndex| self.values[*op];
            match op {
                Operation::Constant { kind } => match *kind {
                    ConstantKind::Float32(value) => value.to_bits() as u64,
                    ConstantKind::Float64(value) => value.to_bits(),
                    ConstantKind::External(value)
                    | ConstantKind::HeapObject(value)
                    | ConstantKind::CompressedHeapObject(value) => value,
                    kind => kind.integral().unwrap(),
                },
                Operation::Parameter { index, rep } => {
                    let value = params[*index as usize];
                    rep.as_word().map_or(value, |rep| rep.truncate(value))
                }
                Operation::WordBinop {
                    left,
                    right,
                    kind,
                    rep,
                } => kind.fold(v(left), v(right), *rep).expect("division by zero"),
                Operation::OverflowCheckedBinop {
                    left,
                    right,
                    kind,
                    rep,
                } => {
                    let (value, overflow) = kind.fold(v(left), v(right), *rep);
                    self.overflows[index] = overflow as u64;
                    value
                }
                Operation::Projection { input, index, .. } => match index {
                    0 => self.values[*input],
                    _ => self.overflows[*input],
                },
                Operation::Shift {
                    left,
                    right,
                    kind,
                    rep,
                } => kind.fold(v(left), v(right), *rep),
                Operation::Comparison {
                    left,
                    right,
                    kind,
                    rep,
                } => kind.fold(v(left), v(right), rep.as_word().unwrap()) as u64,
                Operation::Equal { left, right, .. } => (v(left) == v(right)) as u64,
                Operation::Change {
                    input,
                    kind,
                    from,
                    to,
                } => {
                    let value = v(input);
                    match kind {
                        ChangeKind::ZeroExtend | ChangeKind::Bitcast => value,
                        ChangeKind::SignExtend => {
                            let extended = from.as_word().unwrap().sign_extend(value) as u64;
                            to.as_word().unwrap().truncate(extended)
                        }
                        ChangeKind::Truncate => to.as_word().unwrap().truncate(value),
                        kind => panic!("unsupported change {kind:?}"),
                    }
                }
                Operation::TaggedBitcast { input, .. } => v(input),
                Operation::Select {
                    cond,
                    vtrue,
                    vfalse,
                    ..
                } => {
                    if v(cond) != 0 {
                        v(vtrue)
                    } else {
                        v(vfalse)
                    }
                }
                Operation::StackCheck { .. }
                | Operation::Retain { .. }
                | Operation::FrameState { .. } => 0,
                op => panic!("cannot interpret {}", op.name()),
            }
        }
    }
}
