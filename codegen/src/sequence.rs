use core::fmt;
use std::sync::Arc;

use cranelift_entity::PrimaryMap;
use shaftc_ir::{
    CallDescriptor, ConstantKind, DeoptimizeReason, FrameStateInfo, FxHashMap,
    RegisterRepresentation,
};
use smallvec::SmallVec;

use crate::{ArchOpcode, GapPosition, Instruction, ParallelMove, RpoNumber, VirtualRegister};

/// The value of a constant virtual register
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int32(i32),
    Int64(i64),
    /// Bit pattern of an `f32`
    Float32(u32),
    /// Bit pattern of an `f64`
    Float64(u64),
    External(u64),
    HeapObject(u64),
    CompressedHeapObject(u64),
    Simd128([u8; 16]),
}

impl Constant {
    pub fn rep(&self) -> RegisterRepresentation {
        match self {
            Self::Int32(_) => RegisterRepresentation::Word32,
            Self::Int64(_) | Self::External(_) => RegisterRepresentation::Word64,
            Self::Float32(_) => RegisterRepresentation::Float32,
            Self::Float64(_) => RegisterRepresentation::Float64,
            Self::HeapObject(_) => RegisterRepresentation::Tagged,
            Self::CompressedHeapObject(_) => RegisterRepresentation::Compressed,
            Self::Simd128(_) => RegisterRepresentation::Simd128,
        }
    }

    /// The bits this constant occupies in a 64-bit register. Simd128 constants return their low half.
    pub fn bits(&self) -> u64 {
        match *self {
            Self::Int32(value) => value as u32 as u64,
            Self::Int64(value) => value as u64,
            Self::Float32(bits) => bits as u64,
            Self::Float64(bits)
            | Self::External(bits)
            | Self::HeapObject(bits)
            | Self::CompressedHeapObject(bits) => bits,
            Self::Simd128(bytes) => {
                let mut low = [0u8; 8];
                low.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(low)
            }
        }
    }
}

impl From<ConstantKind> for Constant {
    fn from(kind: ConstantKind) -> Self {
        match kind {
            ConstantKind::Word32(value) => Self::Int32(value as i32),
            ConstantKind::Word64(value) => Self::Int64(value as i64),
            ConstantKind::Float32(value) => Self::Float32(value.to_bits()),
            ConstantKind::Float64(value) => Self::Float64(value.to_bits()),
            ConstantKind::External(address) => Self::External(address),
            ConstantKind::HeapObject(handle) => Self::HeapObject(handle),
            ConstantKind::CompressedHeapObject(handle) => Self::CompressedHeapObject(handle),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(value) => write!(f, "{value}"),
            Self::Int64(value) => write!(f, "{value}l"),
            Self::Float32(bits) => write!(f, "{}f", f32::from_bits(*bits)),
            Self::Float64(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::External(address) => write!(f, "ext:{address:#x}"),
            Self::HeapObject(handle) => write!(f, "heap:{handle}"),
            Self::CompressedHeapObject(handle) => write!(f, "compressed:{handle}"),
            Self::Simd128(bytes) => write!(f, "s128:{bytes:02x?}"),
        }
    }
}

/// A phi of an instruction block: one input virtual register per predecessor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhiInstruction {
    pub vreg: VirtualRegister,
    pub operands: SmallVec<[VirtualRegister; 2]>,
}

#[derive(Debug, Clone)]
pub struct InstructionBlock {
    pub rpo: RpoNumber,
    pub predecessors: SmallVec<[RpoNumber; 2]>,
    pub successors: SmallVec<[RpoNumber; 2]>,
    pub phis: Vec<PhiInstruction>,
    pub is_loop_header: bool,
    /// Range of this block's instructions in the sequence
    pub code_start: usize,
    pub code_end: usize,
    pub needs_frame: bool,
    pub must_construct_frame: bool,
    pub must_deconstruct_frame: bool,
    /// Set by jump threading for blocks that only forward to another block
    pub is_skipped: bool,
}

impl InstructionBlock {
    pub fn new(rpo: RpoNumber) -> Self {
        Self {
            rpo,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            phis: Vec::new(),
            is_loop_header: false,
            code_start: 0,
            code_end: 0,
            needs_frame: false,
            must_construct_frame: false,
            must_deconstruct_frame: false,
            is_skipped: false,
        }
    }

    #[inline]
    pub fn first_instruction(&self) -> usize {
        self.code_start
    }

    #[inline]
    pub fn last_instruction(&self) -> usize {
        self.code_end - 1
    }

    pub fn instruction_range(&self) -> core::ops::Range<usize> {
        self.code_start..self.code_end
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeoptimizeKind {
    /// Deoptimize immediately when the check fails
    Eager,
    /// Deoptimize when control returns to a call site whose frame was invalidated
    Lazy,
}

/// The frame to materialize when deoptimizing at some instruction.
///
/// The instruction carries the entry as an `Index` immediate followed by `value_count` operands
/// holding the frame state values.
#[derive(Debug, Clone)]
pub struct DeoptimizationEntry {
    pub kind: DeoptimizeKind,
    pub reason: DeoptimizeReason,
    pub frame_state: Arc<FrameStateInfo>,
    pub value_count: usize,
}

/// The output of instruction selection: instructions grouped into blocks in final order, with
/// the side tables the later phases consume
#[derive(Debug, Clone)]
pub struct InstructionSequence {
    pub instructions: Vec<Instruction>,
    pub blocks: PrimaryMap<RpoNumber, InstructionBlock>,
    pub constants: FxHashMap<VirtualRegister, Constant>,
    pub representations: PrimaryMap<VirtualRegister, RegisterRepresentation>,
    pub deoptimization_entries: Vec<DeoptimizationEntry>,
    pub call_descriptors: Vec<Arc<CallDescriptor>>,
    /// The signature of the function being compiled
    pub incoming: Arc<CallDescriptor>,
    pub max_pushed_argument_count: usize,
    pub max_unoptimized_frame_height: u32,
}

impl InstructionSequence {
    pub fn new(incoming: Arc<CallDescriptor>) -> Self {
        Self {
            instructions: Vec::new(),
            blocks: PrimaryMap::new(),
            constants: FxHashMap::default(),
            representations: PrimaryMap::new(),
            deoptimization_entries: Vec::new(),
            call_descriptors: Vec::new(),
            incoming,
            max_pushed_argument_count: 0,
            max_unoptimized_frame_height: 0,
        }
    }

    pub fn new_vreg(&mut self, rep: RegisterRepresentation) -> VirtualRegister {
        self.representations.push(rep)
    }

    #[inline]
    pub fn vreg_count(&self) -> usize {
        self.representations.len()
    }

    #[inline]
    pub fn rep_of(&self, vreg: VirtualRegister) -> RegisterRepresentation {
        self.representations[vreg]
    }

    #[inline]
    pub fn is_constant(&self, vreg: VirtualRegister) -> bool {
        self.constants.contains_key(&vreg)
    }

    #[inline]
    pub fn is_tagged(&self, vreg: VirtualRegister) -> bool {
        self.representations[vreg].is_tagged()
    }

    pub fn add_constant(&mut self, vreg: VirtualRegister, constant: Constant) {
        self.constants.insert(vreg, constant);
    }

    pub fn add_deoptimization_entry(&mut self, entry: DeoptimizationEntry) -> u32 {
        let id = self.deoptimization_entries.len() as u32;
        self.max_unoptimized_frame_height =
            self.max_unoptimized_frame_height.max(entry.frame_state.unoptimized_frame_height);
        self.deoptimization_entries.push(entry);
        id
    }

    pub fn add_call_descriptor(&mut self, descriptor: Arc<CallDescriptor>) -> u32 {
        if let Some(id) = self.call_descriptors.iter().position(|d| Arc::ptr_eq(d, &descriptor)) {
            return id as u32;
        }
        self.call_descriptors.push(descriptor);
        (self.call_descriptors.len() - 1) as u32
    }

    #[inline]
    pub fn call_descriptor(&self, id: u32) -> &CallDescriptor {
        &self.call_descriptors[id as usize]
    }

    #[inline]
    pub fn block(&self, rpo: RpoNumber) -> &InstructionBlock {
        &self.blocks[rpo]
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_instructions(&self, rpo: RpoNumber) -> &[Instruction] {
        &self.instructions[self.blocks[rpo].instruction_range()]
    }

    /// The descriptor of the call performed by the instruction at `index`, if it is a call
    pub fn call_descriptor_at(&self, index: usize) -> Option<&CallDescriptor> {
        match self.instructions[index].opcode() {
            ArchOpcode::ArchCall { descriptor } => Some(self.call_descriptor(descriptor)),
            _ => None,
        }
    }

    /// The gaps to execute in front of the instruction at `index`.
    ///
    /// Between a caller-saved register save and its restore only the callee may write registers,
    /// so the gaps of the bracketed call run ahead of the save, and the gaps of the restore run
    /// after it (see [InstructionSequence::gaps_after]).
    pub fn gaps_before(&self, index: usize) -> SmallVec<[&ParallelMove; 4]> {
        match self.instructions[index].opcode() {
            ArchOpcode::ArchSaveCallerRegisters { .. } => {
                let mut gaps: SmallVec<[&ParallelMove; 4]> = self.gaps_of(index).into_iter().collect();
                if index + 1 < self.instructions.len() {
                    gaps.extend(self.gaps_of(index + 1));
                }
                gaps
            }
            ArchOpcode::ArchRestoreCallerRegisters { .. } => SmallVec::new(),
            _ if self.is_bracketed_call(index) => SmallVec::new(),
            _ => self.gaps_of(index).into_iter().collect(),
        }
    }

    /// The gaps to execute after the instruction at `index`, which are only those of a restore
    pub fn gaps_after(&self, index: usize) -> SmallVec<[&ParallelMove; 2]> {
        match self.instructions[index].opcode() {
            ArchOpcode::ArchRestoreCallerRegisters { .. } => self.gaps_of(index).into_iter().collect(),
            _ => SmallVec::new(),
        }
    }

    fn gaps_of(&self, index: usize) -> [&ParallelMove; 2] {
        let instruction = &self.instructions[index];
        [instruction.gap(GapPosition::Start), instruction.gap(GapPosition::End)]
    }

    fn is_bracketed_call(&self, index: usize) -> bool {
        index > 0
            && self.instructions[index].is_call()
            && matches!(
                self.instructions[index - 1].opcode(),
                ArchOpcode::ArchSaveCallerRegisters { .. }
            )
    }
}

impl fmt::Display for InstructionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (vreg, constant) in {
            let mut constants = self.constants.iter().collect::<Vec<_>>();
            constants.sort_by_key(|(vreg, _)| **vreg);
            constants
        } {
            writeln!(f, "CST#{vreg}: {constant}")?;
        }
        for block in self.blocks.values() {
            write!(f, "{}", block.rpo)?;
            if block.is_loop_header {
                f.write_str(" (loop header)")?;
            }
            if block.is_skipped {
                f.write_str(" (skipped)")?;
            }
            if block.must_construct_frame {
                f.write_str(" (construct frame)")?;
            }
            if block.must_deconstruct_frame {
                f.write_str(" (deconstruct frame)")?;
            }
            f.write_str(" <-")?;
            for pred in block.predecessors.iter() {
                write!(f, " {pred}")?;
            }
            writeln!(f)?;
            for phi in block.phis.iter() {
                write!(f, "    phi: {} =", phi.vreg)?;
                for operand in phi.operands.iter() {
                    write!(f, " {operand}")?;
                }
                writeln!(f)?;
            }
            for index in block.instruction_range() {
                writeln!(f, "  {index:>5}: {}", self.instructions[index])?;
            }
            f.write_str("    ->")?;
            for succ in block.successors.iter() {
                write!(f, " {succ}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
