use petgraph::{Direction, prelude::DiGraphMap};
use shaftc_ir::FxHashMap;

use crate::{
    AddressingMode, ArchOpcode, FlagsMode, Instruction, InstructionOperand, InstructionSequence,
    OperandPolicy, RpoNumber, VirtualRegister,
};

/// Reorders the instructions of each block to hide latencies, before registers are allocated.
///
/// Each block is scheduled on its own. The dependency graph orders an instruction after the
/// definitions of its inputs, keeps loads on the same side of every side effect, and pins
/// instructions with fixed register operands (parameters, calls and their arguments) together
/// with the block terminator in place. Among the instructions whose dependencies are satisfied,
/// the one on the longest path to the end of the block goes first.
pub struct InstructionScheduler<'a> {
    sequence: &'a mut InstructionSequence,
}

impl<'a> InstructionScheduler<'a> {
    pub fn new(sequence: &'a mut InstructionSequence) -> Self {
        Self { sequence }
    }

    pub fn run(&mut self) {
        let mut moved = 0;
        for rpo in self.sequence.blocks.keys().collect::<Vec<_>>() {
            moved += self.schedule_block(rpo);
        }
        log::debug!(target: "scheduler", "{moved} instructions changed position");
    }

    /// Schedule the instructions of `rpo`, returning how many of them moved
    fn schedule_block(&mut self, rpo: RpoNumber) -> usize {
        let range = self.sequence.blocks[rpo].instruction_range();
        if range.len() < 3 {
            return 0;
        }
        let instructions = &self.sequence.instructions[range.clone()];
        let graph = dependency_graph(instructions);
        let order = schedule(instructions, &graph);
        let moved = order.iter().enumerate().filter(|(position, node)| *position != **node).count();
        if moved == 0 {
            return 0;
        }
        log::trace!(target: "scheduler", "{rpo}: {order:?}");

        let mut old: Vec<Option<Instruction>> =
            self.sequence.instructions.drain(range.clone()).map(Some).collect();
        let reordered: Vec<Instruction> = order.into_iter().filter_map(|node| old[node].take()).collect();
        self.sequence.instructions.splice(range.start..range.start, reordered);
        moved
    }
}

/// Instructions that must keep their place relative to every other instruction
fn is_pinned(instruction: &Instruction) -> bool {
    let fixed = |operand: &InstructionOperand| {
        operand
            .as_unallocated()
            .is_some_and(|operand| matches!(operand.policy, OperandPolicy::Fixed(_)))
    };
    instruction.is_call()
        || instruction.opcode().is_caller_saved_bracket()
        || instruction.opcode().is_block_terminator()
        || instruction.outputs.iter().any(fixed)
        || instruction.inputs.iter().any(fixed)
        || instruction.temps.iter().any(fixed)
}

/// Instructions that loads must not move across
fn is_barrier(instruction: &Instruction) -> bool {
    instruction.opcode().has_side_effects()
        || matches!(instruction.flags_mode(), FlagsMode::Deoptimize | FlagsMode::Trap)
        || matches!(instruction.opcode(), ArchOpcode::ArchDeoptimize | ArchOpcode::ArchUnreachable)
}

/// Loads and memory operands. Stores address memory too but are barriers.
fn reads_memory(instruction: &Instruction) -> bool {
    let opcode = instruction.opcode();
    if opcode.has_side_effects() {
        return false;
    }
    opcode.is_load()
        || (instruction.addressing_mode() != AddressingMode::None
            && !matches!(opcode, ArchOpcode::RtLea(_)))
}

/// Edges run from an instruction to the instructions that must come after it. Nodes are the
/// positions of the instructions in `instructions`.
fn dependency_graph(instructions: &[Instruction]) -> DiGraphMap<usize, ()> {
    let mut graph = DiGraphMap::with_capacity(instructions.len(), instructions.len() * 2);
    let mut definitions = FxHashMap::<VirtualRegister, usize>::default();
    let mut last_pinned = None;
    let mut since_pinned = Vec::new();
    let mut last_barrier = None;
    let mut loads = Vec::new();
    let last = instructions.len() - 1;

    for (node, instruction) in instructions.iter().enumerate() {
        graph.add_node(node);
        for input in instruction.inputs.iter().chain(instruction.temps.iter()) {
            if let Some(definition) = input.vreg().and_then(|vreg| definitions.get(&vreg)) {
                graph.add_edge(*definition, node, ());
            }
        }

        if let Some(pinned) = last_pinned {
            graph.add_edge(pinned, node, ());
        }
        if is_pinned(instruction) || node == last {
            for earlier in since_pinned.drain(..) {
                graph.add_edge(earlier, node, ());
            }
            last_pinned = Some(node);
        } else {
            since_pinned.push(node);
        }

        if is_barrier(instruction) {
            for load in loads.drain(..) {
                graph.add_edge(load, node, ());
            }
            if let Some(barrier) = last_barrier {
                graph.add_edge(barrier, node, ());
            }
            last_barrier = Some(node);
        } else if reads_memory(instruction) {
            if let Some(barrier) = last_barrier {
                graph.add_edge(barrier, node, ());
            }
            loads.push(node);
        }

        for output in instruction.outputs.iter() {
            if let Some(vreg) = output.vreg() {
                definitions.insert(vreg, node);
            }
        }
    }
    graph
}

/// List scheduling with the length of the longest latency path to the end of the block as
/// priority
fn schedule(instructions: &[Instruction], graph: &DiGraphMap<usize, ()>) -> Vec<usize> {
    let count = instructions.len();
    let latency = |node: usize| instructions[node].opcode().latency();

    // Edges only point forward, so a reverse walk sees successors first
    let mut critical_path = vec![0u32; count];
    for node in (0..count).rev() {
        let longest = graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|succ| critical_path[succ])
            .max()
            .unwrap_or(0);
        critical_path[node] = latency(node) + longest;
    }

    let mut unscheduled_predecessors: Vec<usize> =
        (0..count).map(|node| graph.neighbors_directed(node, Direction::Incoming).count()).collect();
    let mut earliest = vec![0u32; count];
    let mut ready: Vec<usize> =
        (0..count).filter(|node| unscheduled_predecessors[*node] == 0).collect();
    let mut order = Vec::with_capacity(count);
    let mut cycle = 0u32;

    while !ready.is_empty() {
        let available = ready.iter().copied().filter(|node| earliest[*node] <= cycle);
        let best = available.max_by_key(|node| (critical_path[*node], core::cmp::Reverse(*node)));
        let Some(node) = best else {
            // Nothing can start yet; wait for the first instruction that can
            cycle = ready.iter().map(|node| earliest[*node]).min().unwrap_or(cycle);
            continue;
        };
        ready.retain(|other| *other != node);
        order.push(node);
        for succ in graph.neighbors_directed(node, Direction::Outgoing) {
            earliest[succ] = earliest[succ].max(cycle + latency(node));
            unscheduled_predecessors[succ] -= 1;
            if unscheduled_predecessors[succ] == 0 {
                ready.push(succ);
            }
        }
        cycle += 1;
    }
    order
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use shaftc_ir::{
        CallDescriptor, CallKind, Graph, GraphBuilder, MemoryRepresentation,
        RegisterRepresentation, WordBinopKind, WordRepresentation, WriteBarrierKind,
    };
    use shaftc_session::Session;

    use super::*;
    use crate::{
        Frame, Linkage, RegisterConfiguration, allocate_registers, select_instructions,
        simulator::{Outcome, Simulator},
        test_utils::{build_program, init_logger, program_steps},
    };

    const WORD32: RegisterRepresentation = RegisterRepresentation::Word32;
    const WORD64: RegisterRepresentation = RegisterRepresentation::Word64;

    fn select(graph: &Graph, parameters: &[RegisterRepresentation]) -> InstructionSequence {
        init_logger();
        let descriptor = CallDescriptor::new(CallKind::CodeObject, parameters.iter().copied(), [WORD32]);
        let linkage = Linkage::new(Arc::new(descriptor));
        select_instructions(&Session::default(), graph, &linkage).unwrap()
    }

    fn allocate(mut sequence: InstructionSequence) -> (InstructionSequence, Frame) {
        let mut frame =
            Frame::new(sequence.max_pushed_argument_count, sequence.max_unoptimized_frame_height);
        allocate_registers(
            &Session::default(),
            &mut sequence,
            &RegisterConfiguration::reference(),
            &mut frame,
        )
        .unwrap();
        (sequence, frame)
    }

    fn opcodes(sequence: &InstructionSequence) -> Vec<ArchOpcode> {
        sequence.instructions.iter().map(Instruction::opcode).collect()
    }

    fn is_add(code: &ArchOpcode) -> bool {
        matches!(code, ArchOpcode::RtAdd(_) | ArchOpcode::RtLea(_))
    }

    #[test]
    fn long_latency_chain_starts_first() {
        // The division heads the longest path, so it is issued before the independent adds
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let p = b.parameter(0, WORD32);
        let q = b.parameter(1, WORD32);
        let sum = b.word32_add(p, q);
        let sum = b.word32_add(sum, q);
        let quotient = b.word_binop(p, q, WordBinopKind::SignedDiv, WordRepresentation::Word32);
        let result = b.word32_add(sum, quotient);
        b.return_([result]);
        let graph = b.finish();

        let mut sequence = select(&graph, &[WORD32, WORD32]);
        let before = opcodes(&sequence);
        let division = before.iter().position(|code| matches!(code, ArchOpcode::RtIdiv(_))).unwrap();
        let first_add = before.iter().position(is_add).unwrap();
        assert!(first_add < division, "{sequence}");

        InstructionScheduler::new(&mut sequence).run();
        let after = opcodes(&sequence);
        let division = after.iter().position(|code| matches!(code, ArchOpcode::RtIdiv(_))).unwrap();
        let first_add = after.iter().position(is_add).unwrap();
        assert!(division < first_add, "{sequence}");
        assert_eq!(after.last(), Some(&ArchOpcode::ArchRet));

        let (sequence, frame) = allocate(sequence);
        let outcome = Simulator::new(&sequence, &frame).run(&[100, 7]).unwrap();
        assert_eq!(outcome, Outcome::Returned(vec![100 + 7 + 7 + 100 / 7]));
    }

    #[test]
    fn loads_stay_behind_stores() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let base = b.parameter(0, WORD64);
        let value = b.parameter(1, WORD32);
        let before = b.load(base, None, MemoryRepresentation::Int32, 0, 0);
        b.store(base, None, value, MemoryRepresentation::Int32, WriteBarrierKind::None, 0, 0);
        let after = b.load(base, None, MemoryRepresentation::Int32, 0, 0);
        let result = b.word32_add(before, after);
        b.return_([result]);
        let graph = b.finish();

        let mut sequence = select(&graph, &[WORD64, WORD32]);
        InstructionScheduler::new(&mut sequence).run();
        let memory: Vec<bool> = sequence
            .instructions
            .iter()
            .filter(|instruction| reads_memory(instruction) || instruction.opcode().has_side_effects())
            .map(reads_memory)
            .collect();
        assert_eq!(memory, vec![true, false, true], "{sequence}");

        let (sequence, frame) = allocate(sequence);
        let mut simulator = Simulator::new(&sequence, &frame);
        simulator.write_memory(0x4000, &5u32.to_le_bytes());
        assert_eq!(simulator.run(&[0x4000, 9]).unwrap(), Outcome::Returned(vec![14]));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn scheduling_preserves_semantics(
            steps in program_steps(),
            p in any::<u32>(),
            q in any::<u32>(),
        ) {
            let (graph, expected) = build_program(&steps, p, q);
            let mut sequence = select(&graph, &[WORD32, WORD32]);
            InstructionScheduler::new(&mut sequence).run();
            for block in sequence.blocks.values() {
                let last = &sequence.instructions[block.last_instruction()];
                prop_assert!(
                    last.opcode().is_block_terminator() || last.flags_mode() == FlagsMode::Branch,
                    "{} no longer ends with its terminator", block.rpo
                );
            }
            let (sequence, frame) = allocate(sequence);
            let outcome = Simulator::new(&sequence, &frame).run(&[p as u64, q as u64]).unwrap();
            prop_assert_eq!(outcome, Outcome::Returned(vec![expected as u64]));
        }
    }
}
