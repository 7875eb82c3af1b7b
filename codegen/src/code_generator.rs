//! Byte emission for the reference target.
//!
//! Every instruction is encoded as its opcode, an opcode-specific payload, the addressing mode,
//! the flags continuation, the operand counts and then the operands themselves. Gaps are
//! resolved into sequential moves by the [GapResolver] and emitted as move instructions in front
//! of the instruction they belong to, except around caller-saved register brackets, which follow
//! [InstructionSequence::gaps_before]. Jumps to the block emitted next are left out.

use cranelift_entity::SecondaryMap;
use shaftc_ir::{DeoptimizeReason, RegisterRepresentation, SourcePosition};
use shaftc_session::{BailoutReason, Session};
use smallvec::SmallVec;

use crate::{
    AddressingMode, ArchOpcode, Constant, DeoptimizeKind, FlagsMode, Frame,
    GapResolver, Immediate, Instruction, InstructionOperand, InstructionSequence, Location,
    MoveEmitter, Register, RpoNumber,
};

const MOVE: u8 = 0x60;
const CONSTRUCT_FRAME: u8 = 0x70;
const DECONSTRUCT_FRAME: u8 = 0x71;
const DEOPTIMIZATION_EXIT: u8 = 0x72;

const REGISTER_OPERAND: u8 = 0x01;
const STACK_SLOT_OPERAND: u8 = 0x02;
const CONSTANT_OPERAND: u8 = 0x03;
const INT32_OPERAND: u8 = 0x04;
const INT64_OPERAND: u8 = 0x05;
const BLOCK_OPERAND: u8 = 0x06;
const INDEX_OPERAND: u8 = 0x07;

/// The tagged values live at a call or other point where the garbage collector may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointEntry {
    /// Offset of the instruction following the safepoint, i.e. the return address of a call
    pub pc_offset: u32,
    /// Spill slots holding tagged values
    pub slots: SmallVec<[i32; 4]>,
    pub registers: SmallVec<[Register; 2]>,
    /// The entry to deoptimize to lazily when the frame is invalidated during the call
    pub deoptimization_entry: Option<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SourcePositionEntry {
    pub pc_offset: u32,
    pub position: SourcePosition,
}

/// A place the code may leave to continue in the unoptimized frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptimizationExit {
    pub entry: u32,
    pub kind: DeoptimizeKind,
    pub reason: DeoptimizeReason,
    /// Offset of the instruction that deoptimizes
    pub pc_offset: u32,
    /// Offset of the exit stub, emitted after the body of the function
    pub exit_offset: u32,
}

/// The output of code generation
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Bytes reserved below the fixed part of the frame, if the function ever builds one
    pub frame_size: Option<u32>,
    pub stack_check_offset: u32,
    pub safepoints: Vec<SafepointEntry>,
    pub source_positions: Vec<SourcePositionEntry>,
    pub deoptimization_exits: Vec<DeoptimizationExit>,
}

impl CompiledCode {
    /// The safepoint recorded for the return address `pc_offset`
    pub fn safepoint_at(&self, pc_offset: u32) -> Option<&SafepointEntry> {
        self.safepoints
            .binary_search_by_key(&pc_offset, |entry| entry.pc_offset)
            .ok()
            .map(|index| &self.safepoints[index])
    }
}

pub struct CodeGenerator<'a> {
    session: &'a Session,
    sequence: &'a InstructionSequence,
    frame: &'a Frame,
    code: Vec<u8>,
    block_offsets: SecondaryMap<RpoNumber, Option<u32>>,
    /// Positions of block operands to patch with the offset of their block
    fixups: Vec<(usize, RpoNumber)>,
    safepoints: Vec<SafepointEntry>,
    source_positions: Vec<SourcePositionEntry>,
    deoptimization_exits: Vec<DeoptimizationExit>,
    /// Whether the block being assembled runs with a frame
    has_frame: bool,
    current: usize,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(session: &'a Session, sequence: &'a InstructionSequence, frame: &'a Frame) -> Self {
        Self {
            session,
            sequence,
            frame,
            code: Vec::new(),
            block_offsets: SecondaryMap::with_capacity(sequence.block_count()),
            fixups: Vec::new(),
            safepoints: Vec::new(),
            source_positions: Vec::new(),
            deoptimization_exits: Vec::new(),
            has_frame: false,
            current: 0,
        }
    }

    pub fn generate(mut self) -> Result<CompiledCode, BailoutReason> {
        if !self.frame.is_frozen() {
            return Err(failed("the frame must be frozen before code is generated"));
        }
        let sequence = self.sequence;
        let emitted: Vec<RpoNumber> =
            sequence.blocks.values().filter(|block| !block.is_skipped).map(|block| block.rpo).collect();
        for (position, rpo) in emitted.iter().copied().enumerate() {
            let next = emitted.get(position + 1).copied();
            self.assemble_block(rpo, next)?;
        }
        self.patch_block_operands()?;
        self.assemble_deoptimization_exits();

        let frame_size = sequence
            .blocks
            .values()
            .any(|block| block.must_construct_frame)
            .then(|| self.frame_size());
        log::debug!(
            target: "codegen",
            "{}: {} bytes, {} safepoints, {} deoptimization exits",
            self.session.name,
            self.code.len(),
            self.safepoints.len(),
            self.deoptimization_exits.len()
        );
        self.session.statistics.count("codegen", "bytes", self.code.len());
        Ok(CompiledCode {
            code: self.code,
            frame_size,
            stack_check_offset: self.frame.stack_check_offset(),
            safepoints: self.safepoints,
            source_positions: self.source_positions,
            deoptimization_exits: self.deoptimization_exits,
        })
    }

    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn frame_size(&self) -> u32 {
        (self.frame.total_slot_count() - Frame::FIXED_SLOT_COUNT) * Frame::SLOT_SIZE
    }

    fn assemble_block(&mut self, rpo: RpoNumber, next: Option<RpoNumber>) -> Result<(), BailoutReason> {
        let sequence = self.sequence;
        let block = &sequence.blocks[rpo];
        self.block_offsets[rpo] = Some(self.offset());
        self.has_frame = block.needs_frame;
        if block.must_construct_frame {
            let size = self.frame_size();
            self.code.push(CONSTRUCT_FRAME);
            self.code.extend(size.to_le_bytes());
        }

        let mut resolver = GapResolver::new();
        for index in block.instruction_range() {
            self.current = index;
            let instruction = &sequence.instructions[index];
            for gap in sequence.gaps_before(index) {
                resolver.resolve(gap, self)?;
            }
            if instruction.is_jump() && instruction.inputs.first().and_then(InstructionOperand::as_block) == next {
                continue;
            }
            if instruction.opcode() == ArchOpcode::ArchRet && block.must_deconstruct_frame {
                self.code.push(DECONSTRUCT_FRAME);
            }
            self.assemble_instruction(instruction)?;
            for gap in sequence.gaps_after(index) {
                resolver.resolve(gap, self)?;
            }
        }
        Ok(())
    }

    fn assemble_instruction(&mut self, instruction: &Instruction) -> Result<(), BailoutReason> {
        let start = self.offset();
        let position = instruction.source_position;
        if position.is_known() && self.source_positions.last().is_none_or(|last| last.position != position) {
            self.source_positions.push(SourcePositionEntry {
                pc_offset: start,
                position,
            });
        }

        let opcode = instruction.opcode();
        self.code.push(opcode.encoding());
        match opcode {
            ArchOpcode::ArchCall { descriptor } => self.code.extend(descriptor.to_le_bytes()),
            ArchOpcode::ArchPoke { slot } | ArchOpcode::ArchPeek { slot } => {
                self.code.extend(slot.to_le_bytes())
            }
            ArchOpcode::ArchSaveCallerRegisters { fp } | ArchOpcode::ArchRestoreCallerRegisters { fp } => {
                self.code.push(fp as u8)
            }
            _ => (),
        }
        self.code.push(encode_addressing_mode(instruction.addressing_mode()));
        self.code.push(((instruction.flags_mode() as u8) << 5) | instruction.flags_condition() as u8);
        self.code.push(instruction.outputs.len() as u8);
        self.code.extend((instruction.inputs.len() as u16).to_le_bytes());
        self.code.push(instruction.temps.len() as u8);
        let operands = instruction.outputs.iter().chain(instruction.inputs.iter()).chain(instruction.temps.iter());
        for operand in operands {
            self.assemble_operand(operand)?;
        }

        if let Some(entry) = deoptimization_entry(instruction) {
            let sequence = self.sequence;
            let Some(info) = sequence.deoptimization_entries.get(entry as usize) else {
                return Err(failed(format!("instruction {} refers to unknown deoptimization entry {entry}", self.current)));
            };
            self.deoptimization_exits.push(DeoptimizationExit {
                entry,
                kind: info.kind,
                reason: info.reason,
                pc_offset: start,
                exit_offset: 0,
            });
        }
        if let Some(map) = &instruction.reference_map {
            self.safepoints.push(SafepointEntry {
                pc_offset: self.offset(),
                slots: map.slots.clone(),
                registers: map.registers.clone(),
                deoptimization_entry: instruction
                    .is_call()
                    .then(|| deoptimization_entry(instruction))
                    .flatten(),
            });
        }
        Ok(())
    }

    fn assemble_operand(&mut self, operand: &InstructionOperand) -> Result<(), BailoutReason> {
        match *operand {
            InstructionOperand::Allocated(allocated) => {
                match allocated.location {
                    Location::Register(reg) => {
                        self.code.push(REGISTER_OPERAND);
                        self.code.push(reg.encoding());
                    }
                    Location::StackSlot(slot) => {
                        let offset = self.stack_slot_offset(slot, allocated.rep)?;
                        self.code.push(STACK_SLOT_OPERAND);
                        self.code.extend(offset.to_le_bytes());
                    }
                }
                self.code.push(encode_rep(allocated.rep));
            }
            InstructionOperand::Constant(vreg) => {
                let sequence = self.sequence;
                let constant = sequence.constants.get(&vreg).ok_or_else(|| {
                    failed(format!("instruction {} uses {vreg}, which is not a constant", self.current))
                })?;
                self.code.push(CONSTANT_OPERAND);
                match constant {
                    Constant::Simd128(bytes) => self.code.extend(bytes),
                    constant => self.code.extend(constant.bits().to_le_bytes()),
                }
            }
            InstructionOperand::Immediate(Immediate::Int32(value)) => {
                self.code.push(INT32_OPERAND);
                self.code.extend(value.to_le_bytes());
            }
            InstructionOperand::Immediate(Immediate::Int64(value)) => {
                self.code.push(INT64_OPERAND);
                self.code.extend(value.to_le_bytes());
            }
            InstructionOperand::Immediate(Immediate::Block(target)) => {
                self.code.push(BLOCK_OPERAND);
                self.fixups.push((self.code.len(), target));
                self.code.extend(0u32.to_le_bytes());
            }
            InstructionOperand::Immediate(Immediate::Index(index)) => {
                self.code.push(INDEX_OPERAND);
                self.code.extend(index.to_le_bytes());
            }
            InstructionOperand::Unallocated(_) | InstructionOperand::Invalid => {
                return Err(failed(format!(
                    "instruction {} has an unallocated operand {operand}",
                    self.current
                )));
            }
        }
        Ok(())
    }

    /// The offset of `slot` from the frame pointer. Spill slots lie below the frame pointer,
    /// parameters passed on the stack above the fixed part of the frame.
    fn stack_slot_offset(&self, slot: i32, rep: RegisterRepresentation) -> Result<i32, BailoutReason> {
        if !self.has_frame {
            return Err(failed(format!(
                "instruction {} accesses stack slot {slot} in a block without a frame",
                self.current
            )));
        }
        let slot_size = Frame::SLOT_SIZE as i32;
        if slot < 0 {
            return Ok(slot_size * (Frame::FIXED_SLOT_COUNT as i32 - slot - 1));
        }
        let end = slot + Frame::slots_for(rep) as i32;
        if end > self.frame.spill_slot_count() as i32 {
            return Err(failed(format!(
                "instruction {} accesses stack slot {slot} beyond the {} spill slots of the frame",
                self.current,
                self.frame.spill_slot_count()
            )));
        }
        Ok(-slot_size * end)
    }

    fn patch_block_operands(&mut self) -> Result<(), BailoutReason> {
        for (position, target) in core::mem::take(&mut self.fixups) {
            let offset = self.block_offsets[target]
                .ok_or_else(|| failed(format!("jump to {target}, which is not emitted")))?;
            self.code[position..position + 4].copy_from_slice(&offset.to_le_bytes());
        }
        Ok(())
    }

    fn assemble_deoptimization_exits(&mut self) {
        for index in 0..self.deoptimization_exits.len() {
            let offset = self.offset();
            let exit = &mut self.deoptimization_exits[index];
            exit.exit_offset = offset;
            let entry = exit.entry;
            self.code.push(DEOPTIMIZATION_EXIT);
            self.code.extend(entry.to_le_bytes());
        }
    }
}

impl MoveEmitter for CodeGenerator<'_> {
    type Error = BailoutReason;

    fn emit_move(
        &mut self,
        source: &InstructionOperand,
        destination: &InstructionOperand,
    ) -> Result<(), Self::Error> {
        self.code.push(MOVE);
        self.assemble_operand(destination)?;
        self.assemble_operand(source)
    }
}

fn failed(message: impl Into<String>) -> BailoutReason {
    BailoutReason::CodeGenerationFailed(message.into())
}

/// The deoptimization entry an instruction refers to, if it can deoptimize
fn deoptimization_entry(instruction: &Instruction) -> Option<u32> {
    if instruction.opcode() == ArchOpcode::ArchDeoptimize {
        return instruction.own_inputs().first().and_then(InstructionOperand::as_index);
    }
    if instruction.flags_mode() == FlagsMode::Deoptimize {
        return instruction.flags_inputs().first().and_then(InstructionOperand::as_index);
    }
    if instruction.is_call() {
        return instruction.inputs.iter().find_map(InstructionOperand::as_index);
    }
    None
}

fn encode_addressing_mode(mode: AddressingMode) -> u8 {
    match mode {
        AddressingMode::None => 0,
        AddressingMode::MR => 1,
        AddressingMode::MRI => 2,
        AddressingMode::MRn(scale) => 3 | (scale << 4),
        AddressingMode::MRnI(scale) => 4 | (scale << 4),
        AddressingMode::MnI(scale) => 5 | (scale << 4),
        AddressingMode::Root => 6,
    }
}

fn encode_rep(rep: RegisterRepresentation) -> u8 {
    match rep {
        RegisterRepresentation::Word32 => 0,
        RegisterRepresentation::Word64 => 1,
        RegisterRepresentation::Float32 => 2,
        RegisterRepresentation::Float64 => 3,
        RegisterRepresentation::Tagged => 4,
        RegisterRepresentation::Compressed => 5,
        RegisterRepresentation::Simd128 => 6,
    }
}

#[cfg(test)]
mod tests;
