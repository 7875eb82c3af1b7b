//! An interpreter for allocated instruction sequences of the reference target.
//!
//! The simulator runs a sequence after register allocation, tracking the contents of registers,
//! frame slots and memory, so that tests can check compiled code against the graph it came from.
//! Gaps are executed through the [GapResolver], as the code generator does. When a call returns,
//! every allocatable register holds no value until a caller-saved register restore reloads it,
//! and reading a location without a value is an error, which makes allocation mistakes visible.

mod alu;

use shaftc_ir::{DeoptimizeReason, FxHashMap, WordRepresentation};

use crate::{
    ArchOpcode, CallLinkage, Constant, FlagsCondition, FlagsMode, Frame, GapResolver,
    Immediate, Instruction, InstructionOperand, InstructionSequence, Linkage, LinkageLocation,
    Location, MoveEmitter, ParallelMove, Register, RegisterClass, RegisterConfiguration, RpoNumber,
    regs,
};

pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// The value of the stack pointer while the simulated function runs
pub const STACK_POINTER: u64 = 0x7fff_0000;

/// A function the simulated code may call, by address
pub type HostFunction<'a> = Box<dyn FnMut(&[u64]) -> Vec<u64> + 'a>;

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("instruction {index} reads {location}, which holds no value")]
    Uninitialized { index: usize, location: Location },
    #[error("instruction {index} has an operand the simulator cannot use: {operand}")]
    InvalidOperand { index: usize, operand: String },
    #[error("no host function is registered at {0:#x}")]
    UnknownCallTarget(u64),
    #[error("host function at {address:#x} returned {actual} values, expected {expected}")]
    ReturnCountMismatch {
        address: u64,
        expected: usize,
        actual: usize,
    },
    #[error("instruction {0} divides by zero")]
    DivisionByZero(usize),
    #[error("instruction {index} tests {condition}, which the flags do not support")]
    InvalidCondition {
        index: usize,
        condition: FlagsCondition,
    },
    #[error("control reached the end of {0} without a terminator")]
    FellThrough(RpoNumber),
    #[error("stopped after {0} instructions")]
    StepLimitExceeded(usize),
}

/// How a simulated function finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Returned(Vec<u64>),
    Deoptimized {
        entry: u32,
        reason: DeoptimizeReason,
        values: Vec<u64>,
    },
    Trapped(i32),
    Unreachable,
}

/// The condition flags, as set by the last flags-setting instruction
#[derive(Debug, Copy, Clone)]
enum Flags {
    Compare {
        left: u64,
        right: u64,
        rep: WordRepresentation,
    },
    Arithmetic {
        result: u64,
        overflow: bool,
        rep: WordRepresentation,
    },
    Float {
        left: f64,
        right: f64,
    },
}

impl Flags {
    fn test(self, condition: FlagsCondition) -> Option<bool> {
        let overflow_test = matches!(condition, FlagsCondition::Overflow | FlagsCondition::NotOverflow);
        match self {
            Self::Arithmetic { overflow, .. } if overflow_test => {
                Some(overflow == (condition == FlagsCondition::Overflow))
            }
            _ if overflow_test => None,
            Self::Float { left, right } => {
                condition.is_float().then(|| condition.evaluate_float(left, right))
            }
            _ if condition.is_float() => None,
            Self::Compare { left, right, rep } => Some(condition.evaluate_word(left, right, rep)),
            Self::Arithmetic { result, rep, .. } => Some(condition.evaluate_word(result, 0, rep)),
        }
    }
}

enum Control {
    Next,
    Jump(RpoNumber),
    Exit(Outcome),
}

pub struct Simulator<'a> {
    sequence: &'a InstructionSequence,
    locations: FxHashMap<Location, u128>,
    /// The outgoing argument area, holding stack arguments and results of calls
    outgoing: FxHashMap<u16, u128>,
    memory: FxHashMap<u64, u8>,
    /// The register save area, one entry per open caller-saved register bracket
    saved_registers: Vec<Vec<(Location, u128)>>,
    host_functions: FxHashMap<u64, HostFunction<'a>>,
    flags: Option<Flags>,
    stack_check_offset: u64,
    step_limit: usize,
    steps: usize,
}

impl<'a> Simulator<'a> {
    pub fn new(sequence: &'a InstructionSequence, frame: &Frame) -> Self {
        Self {
            sequence,
            locations: FxHashMap::default(),
            outgoing: FxHashMap::default(),
            memory: FxHashMap::default(),
            saved_registers: Vec::new(),
            host_functions: FxHashMap::default(),
            flags: None,
            stack_check_offset: frame.stack_check_offset() as u64,
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
        }
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Make `function` callable at `address`. It receives the arguments of the call as raw bits
    /// and returns its results the same way.
    pub fn register_host_function(
        &mut self,
        address: u64,
        function: impl FnMut(&[u64]) -> Vec<u64> + 'a,
    ) {
        self.host_functions.insert(address, Box::new(function));
    }

    pub fn write_memory(&mut self, address: u64, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u64), *byte);
        }
    }

    /// Read `len` bytes at `address`; memory never written reads as zero
    pub fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|offset| self.memory.get(&address.wrapping_add(offset)).copied().unwrap_or(0))
            .collect()
    }

    /// The number of instructions executed by the last run
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Run the function with `arguments` in the locations of its incoming parameters
    pub fn run(&mut self, arguments: &[u64]) -> Result<Outcome, SimulationError> {
        self.locations.clear();
        self.outgoing.clear();
        self.saved_registers.clear();
        self.flags = None;
        self.steps = 0;
        self.locations.insert(Location::Register(regs::ROOT), Linkage::ROOTS_TABLE_ADDRESS as u128);
        let linkage = Linkage::new(self.sequence.incoming.clone());
        for (argument, location) in arguments.iter().zip(linkage.incoming().parameters.iter()) {
            self.locations.insert(location.to_location(), *argument as u128);
        }

        let mut block = RpoNumber::from_u32(0);
        loop {
            log::trace!(target: "simulator", "entering {block}");
            match self.run_block(block)? {
                Control::Jump(target) => block = target,
                Control::Exit(outcome) => {
                    log::debug!(target: "simulator", "{outcome:?} after {} instructions", self.steps);
                    return Ok(outcome);
                }
                Control::Next => return Err(SimulationError::FellThrough(block)),
            }
        }
    }

    fn run_block(&mut self, block: RpoNumber) -> Result<Control, SimulationError> {
        let sequence = self.sequence;
        let mut resolver = GapResolver::new();
        for index in sequence.blocks[block].instruction_range() {
            self.steps += 1;
            if self.steps > self.step_limit {
                return Err(SimulationError::StepLimitExceeded(self.step_limit));
            }
            let instruction = &sequence.instructions[index];
            for gap in sequence.gaps_before(index) {
                self.perform_moves(&mut resolver, index, gap)?;
            }
            match self.execute(index, instruction)? {
                Control::Next => (),
                control => return Ok(control),
            }
            for gap in sequence.gaps_after(index) {
                self.perform_moves(&mut resolver, index, gap)?;
            }
        }
        Ok(Control::Next)
    }

    fn perform_moves(
        &mut self,
        resolver: &mut GapResolver,
        index: usize,
        moves: &ParallelMove,
    ) -> Result<(), SimulationError> {
        let mut emitter = MoveExecutor {
            simulator: self,
            index,
        };
        resolver.resolve(moves, &mut emitter)
    }

    fn read(&self, index: usize, operand: &InstructionOperand) -> Result<u128, SimulationError> {
        match *operand {
            InstructionOperand::Allocated(allocated) => self
                .locations
                .get(&allocated.location)
                .copied()
                .ok_or(SimulationError::Uninitialized {
                    index,
                    location: allocated.location,
                }),
            InstructionOperand::Constant(vreg) => match self.sequence.constants.get(&vreg) {
                Some(Constant::Simd128(bytes)) => Ok(u128::from_le_bytes(*bytes)),
                Some(constant) => Ok(constant.bits() as u128),
                None => Err(invalid(index, operand)),
            },
            InstructionOperand::Immediate(Immediate::Int32(value)) => Ok(value as i64 as u64 as u128),
            InstructionOperand::Immediate(Immediate::Int64(value)) => Ok(value as u64 as u128),
            _ => Err(invalid(index, operand)),
        }
    }

    fn word(&self, index: usize, operand: &InstructionOperand) -> Result<u64, SimulationError> {
        self.read(index, operand).map(|value| value as u64)
    }

    fn write(
        &mut self,
        index: usize,
        operand: &InstructionOperand,
        value: u128,
    ) -> Result<(), SimulationError> {
        let InstructionOperand::Allocated(allocated) = *operand else {
            return Err(invalid(index, operand));
        };
        let value = match allocated.rep.bit_width() {
            32 => value as u32 as u128,
            64 => value as u64 as u128,
            _ => value,
        };
        self.locations.insert(allocated.location, value);
        Ok(())
    }

    fn block_target(index: usize, operand: &InstructionOperand) -> Result<RpoNumber, SimulationError> {
        operand.as_block().ok_or_else(|| invalid(index, operand))
    }

    fn execute(&mut self, index: usize, instruction: &Instruction) -> Result<Control, SimulationError> {
        let inputs = instruction.own_inputs();
        let mut result = None;
        match instruction.opcode() {
            ArchOpcode::ArchNop | ArchOpcode::ArchStackCheck => (),
            ArchOpcode::ArchJmp => return Ok(Control::Jump(Self::block_target(index, &inputs[0])?)),
            ArchOpcode::ArchRet => {
                let values = inputs[1..]
                    .iter()
                    .map(|input| self.word(index, input))
                    .collect::<Result<_, _>>()?;
                return Ok(Control::Exit(Outcome::Returned(values)));
            }
            ArchOpcode::ArchTableSwitch => {
                let value = self.word(index, &inputs[0])? as u32 as usize;
                let target = inputs[2..].get(value).unwrap_or(&inputs[1]);
                return Ok(Control::Jump(Self::block_target(index, target)?));
            }
            ArchOpcode::ArchBinarySearchSwitch => {
                let value = self.word(index, &inputs[0])? as u32 as i32;
                let mut target = &inputs[1];
                for case in inputs[2..].chunks(2) {
                    if case[0] == InstructionOperand::Immediate(Immediate::Int32(value)) {
                        target = &case[1];
                    }
                }
                return Ok(Control::Jump(Self::block_target(index, target)?));
            }
            ArchOpcode::ArchCall { descriptor } => self.call(index, instruction, descriptor)?,
            ArchOpcode::ArchSaveCallerRegisters { fp } => self.save_caller_registers(fp),
            ArchOpcode::ArchRestoreCallerRegisters { .. } => self.restore_caller_registers(),
            ArchOpcode::ArchDeoptimize => {
                return Ok(Control::Exit(self.deoptimize(index, inputs)?));
            }
            ArchOpcode::ArchUnreachable => return Ok(Control::Exit(Outcome::Unreachable)),
            ArchOpcode::ArchStackCheckOffset => result = Some(self.stack_check_offset as u128),
            ArchOpcode::ArchStackPointerGreaterThan => {
                self.flags = Some(Flags::Compare {
                    left: STACK_POINTER,
                    right: self.word(index, &inputs[0])?,
                    rep: WordRepresentation::Word64,
                });
            }
            ArchOpcode::ArchPoke { slot } => {
                let value = self.read(index, &inputs[0])?;
                self.outgoing.insert(slot, value);
            }
            ArchOpcode::ArchPeek { slot } => {
                let value = self.outgoing.get(&slot).copied().ok_or(SimulationError::Uninitialized {
                    index,
                    location: Location::StackSlot(-(slot as i32) - 1),
                })?;
                result = Some(value);
            }
            _ => result = self.execute_alu(index, instruction)?,
        }

        let mode = instruction.flags_mode();
        let flags_outputs = usize::from(matches!(mode, FlagsMode::Set | FlagsMode::Select));
        if let Some(value) = result {
            if instruction.outputs.len() > flags_outputs {
                self.write(index, &instruction.outputs[0], value)?;
            }
        }
        self.continue_with_flags(index, instruction)
    }

    fn continue_with_flags(
        &mut self,
        index: usize,
        instruction: &Instruction,
    ) -> Result<Control, SimulationError> {
        let mode = instruction.flags_mode();
        if mode == FlagsMode::None {
            return Ok(Control::Next);
        }
        let condition = instruction.flags_condition();
        let holds = self
            .flags
            .and_then(|flags| flags.test(condition))
            .ok_or(SimulationError::InvalidCondition { index, condition })?;
        let operands = instruction.flags_inputs();
        let last_output = instruction.outputs.last();
        match mode {
            FlagsMode::None => Ok(Control::Next),
            FlagsMode::Branch => {
                let target = if holds { &operands[0] } else { &operands[1] };
                Ok(Control::Jump(Self::block_target(index, target)?))
            }
            FlagsMode::Set => {
                let output = last_output.ok_or_else(|| invalid(index, &InstructionOperand::Invalid))?;
                self.write(index, output, holds as u128)?;
                Ok(Control::Next)
            }
            FlagsMode::Select => {
                let value = self.read(index, if holds { &operands[0] } else { &operands[1] })?;
                let output = last_output.ok_or_else(|| invalid(index, &InstructionOperand::Invalid))?;
                self.write(index, output, value)?;
                Ok(Control::Next)
            }
            FlagsMode::Deoptimize if holds => Ok(Control::Exit(self.deoptimize(index, operands)?)),
            FlagsMode::Trap if holds => match operands.first() {
                Some(InstructionOperand::Immediate(Immediate::Int32(trap))) => {
                    Ok(Control::Exit(Outcome::Trapped(*trap)))
                }
                other => Err(invalid(index, other.unwrap_or(&InstructionOperand::Invalid))),
            },
            FlagsMode::Deoptimize | FlagsMode::Trap => Ok(Control::Next),
        }
    }

    /// `operands` are the deoptimization entry followed by the frame state values
    fn deoptimize(
        &self,
        index: usize,
        operands: &[InstructionOperand],
    ) -> Result<Outcome, SimulationError> {
        let entry = operands
            .first()
            .and_then(InstructionOperand::as_index)
            .ok_or_else(|| invalid(index, operands.first().unwrap_or(&InstructionOperand::Invalid)))?;
        let reason = self
            .sequence
            .deoptimization_entries
            .get(entry as usize)
            .map_or(DeoptimizeReason::Unknown, |entry| entry.reason);
        let values = operands[1..]
            .iter()
            .map(|operand| self.word(index, operand))
            .collect::<Result<_, _>>()?;
        Ok(Outcome::Deoptimized {
            entry,
            reason,
            values,
        })
    }

    fn call(
        &mut self,
        index: usize,
        instruction: &Instruction,
        descriptor: u32,
    ) -> Result<(), SimulationError> {
        let sequence = self.sequence;
        let descriptor = sequence.call_descriptor(descriptor);
        let linkage = CallLinkage::new(descriptor);
        let address = match instruction.inputs[0] {
            InstructionOperand::Immediate(Immediate::Int64(address)) => address as u64,
            ref target => self.word(index, target)?,
        };
        let arguments = linkage
            .parameters
            .iter()
            .map(|location| self.read_linkage_location(index, *location).map(|value| value as u64))
            .collect::<Result<Vec<_>, _>>()?;
        let function = self
            .host_functions
            .get_mut(&address)
            .ok_or(SimulationError::UnknownCallTarget(address))?;
        log::trace!(target: "simulator", "calling {address:#x} with {arguments:?}");
        let results = function(&arguments);
        if results.len() != linkage.returns.len() {
            return Err(SimulationError::ReturnCountMismatch {
                address,
                expected: linkage.returns.len(),
                actual: results.len(),
            });
        }

        self.clobber_registers();
        for (value, location) in results.into_iter().zip(linkage.returns.iter()) {
            match *location {
                LinkageLocation::Register(reg) => {
                    self.locations.insert(Location::Register(reg), value as u128);
                }
                LinkageLocation::CallerFrameSlot(_) => {
                    if let Some(slot) = CallLinkage::outgoing_slot(*location) {
                        self.outgoing.insert(slot, value as u128);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_linkage_location(
        &self,
        index: usize,
        location: LinkageLocation,
    ) -> Result<u128, SimulationError> {
        let value = match CallLinkage::outgoing_slot(location) {
            Some(slot) => self.outgoing.get(&slot).copied(),
            None => self.locations.get(&location.to_location()).copied(),
        };
        value.ok_or(SimulationError::Uninitialized {
            index,
            location: location.to_location(),
        })
    }

    /// Forget the values of every register a callee may overwrite
    fn clobber_registers(&mut self) {
        let config = RegisterConfiguration::reference();
        for class in RegisterClass::ALL {
            for reg in config.allocatable(class) {
                self.locations.remove(&Location::Register(reg));
            }
        }
    }

    fn save_caller_registers(&mut self, fp: bool) {
        let config = RegisterConfiguration::reference();
        let classes: &[RegisterClass] = if fp {
            &RegisterClass::ALL
        } else {
            &[RegisterClass::General]
        };
        let saved = classes
            .iter()
            .flat_map(|class| config.allocatable(*class))
            .filter_map(|reg| {
                let location = Location::Register(reg);
                self.locations.get(&location).map(|value| (location, *value))
            })
            .collect();
        self.saved_registers.push(saved);
    }

    /// Reload the registers of the innermost bracket, leaving the results of the call in place
    fn restore_caller_registers(&mut self) {
        let Some(saved) = self.saved_registers.pop() else {
            return;
        };
        for (location, value) in saved {
            let Location::Register(reg) = location else {
                continue;
            };
            if !Linkage::is_return_register(reg) {
                self.locations.insert(location, value);
            }
        }
    }

    /// Poison the temporaries of an instruction, which hold no useful value afterwards
    fn clobber_temps(&mut self, instruction: &Instruction) {
        for temp in instruction.temps.iter() {
            if let Some(location) = temp.location() {
                self.locations.insert(location, 0xdead_beef_dead_beef);
            }
        }
    }
}

fn invalid(index: usize, operand: &InstructionOperand) -> SimulationError {
    SimulationError::InvalidOperand {
        index,
        operand: operand.to_string(),
    }
}

/// Executes the moves of a gap one at a time on the simulator state
struct MoveExecutor<'s, 'a> {
    simulator: &'s mut Simulator<'a>,
    index: usize,
}

impl MoveEmitter for MoveExecutor<'_, '_> {
    type Error = SimulationError;

    fn emit_move(
        &mut self,
        source: &InstructionOperand,
        destination: &InstructionOperand,
    ) -> Result<(), SimulationError> {
        let value = self.simulator.read(self.index, source)?;
        log::trace!(target: "simulator", "{destination} = {source} ({value:#x})");
        self.simulator.write(self.index, destination, value)
    }
}

impl Simulator<'_> {
    /// The value of `reg` after the last run, if it holds one
    pub fn register(&self, reg: Register) -> Option<u128> {
        self.locations.get(&Location::Register(reg)).copied()
    }

    pub fn stack_slot(&self, slot: i32) -> Option<u128> {
        self.locations.get(&Location::StackSlot(slot)).copied()
    }
}
