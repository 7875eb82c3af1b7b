use shaftc_ir::{
    FloatBinopKind, FloatRepresentation, FloatUnaryKind, MemoryRepresentation,
    OverflowCheckedBinopKind, RegisterRepresentation, ShiftKind, Simd128BinopKind, WordBinopKind,
    WordRepresentation,
};

use super::{Flags, SimulationError, Simulator, invalid};
use crate::{AddressingMode, ArchOpcode, Instruction, InstructionOperand, Linkage, regs};

impl Simulator<'_> {
    /// Execute an instruction that computes a value, setting the flags as the target does.
    /// Returns the value of the first output.
    pub(super) fn execute_alu(
        &mut self,
        index: usize,
        instruction: &Instruction,
    ) -> Result<Option<u128>, SimulationError> {
        let inputs = instruction.own_inputs();
        let mode = instruction.addressing_mode();
        let opcode = instruction.opcode();
        let value = match opcode {
            ArchOpcode::RtAdd(rep)
            | ArchOpcode::RtSub(rep)
            | ArchOpcode::RtMul(rep)
            | ArchOpcode::RtAnd(rep)
            | ArchOpcode::RtOr(rep)
            | ArchOpcode::RtXor(rep) => {
                let left = self.word(index, &inputs[0])?;
                let right = self.right_operand(index, inputs, mode, rep)?;
                let (result, overflow) = match opcode {
                    ArchOpcode::RtAdd(_) => OverflowCheckedBinopKind::SignedAdd.fold(left, right, rep),
                    ArchOpcode::RtSub(_) => OverflowCheckedBinopKind::SignedSub.fold(left, right, rep),
                    ArchOpcode::RtMul(_) => OverflowCheckedBinopKind::SignedMul.fold(left, right, rep),
                    ArchOpcode::RtAnd(_) => (rep.truncate(left & right), false),
                    ArchOpcode::RtOr(_) => (rep.truncate(left | right), false),
                    _ => (rep.truncate(left ^ right), false),
                };
                self.flags = Some(Flags::Arithmetic {
                    result,
                    overflow,
                    rep,
                });
                result as u128
            }
            ArchOpcode::RtIdiv(rep)
            | ArchOpcode::RtUdiv(rep)
            | ArchOpcode::RtImod(rep)
            | ArchOpcode::RtUmod(rep) => {
                let kind = match opcode {
                    ArchOpcode::RtIdiv(_) => WordBinopKind::SignedDiv,
                    ArchOpcode::RtUdiv(_) => WordBinopKind::UnsignedDiv,
                    ArchOpcode::RtImod(_) => WordBinopKind::SignedMod,
                    _ => WordBinopKind::UnsignedMod,
                };
                let left = self.word(index, &inputs[0])?;
                let right = self.word(index, &inputs[1])?;
                kind.fold(left, right, rep).ok_or(SimulationError::DivisionByZero(index))? as u128
            }
            ArchOpcode::RtShl(rep)
            | ArchOpcode::RtSar(rep)
            | ArchOpcode::RtShr(rep)
            | ArchOpcode::RtRor(rep) => {
                let kind = match opcode {
                    ArchOpcode::RtShl(_) => ShiftKind::ShiftLeft,
                    ArchOpcode::RtSar(_) => ShiftKind::ShiftRightArithmetic,
                    ArchOpcode::RtShr(_) => ShiftKind::ShiftRightLogical,
                    _ => ShiftKind::RotateRight,
                };
                let left = self.word(index, &inputs[0])?;
                let right = self.word(index, &inputs[1])?;
                kind.fold(left, right, rep) as u128
            }
            ArchOpcode::RtCmp(rep) => {
                let left = self.word(index, &inputs[0])?;
                let right = self.right_operand(index, inputs, mode, rep)?;
                self.flags = Some(Flags::Compare { left, right, rep });
                return Ok(None);
            }
            ArchOpcode::RtTest(rep) => {
                let left = self.word(index, &inputs[0])?;
                let right = self.word(index, &inputs[1])?;
                self.flags = Some(Flags::Arithmetic {
                    result: rep.truncate(left & right),
                    overflow: false,
                    rep,
                });
                return Ok(None);
            }
            ArchOpcode::RtLea(rep) => rep.truncate(self.address(index, inputs, mode)?) as u128,
            ArchOpcode::RtMovl => self.word(index, &inputs[0])? as u32 as u128,
            ArchOpcode::RtMovsxlq => self.word(index, &inputs[0])? as u32 as i32 as i64 as u64 as u128,
            ArchOpcode::RtLoad(rep) => {
                let address = self.address(index, inputs, mode)?;
                self.load(address, rep)
            }
            ArchOpcode::RtLoadDecompressTagged => {
                let address = self.address(index, inputs, mode)?;
                let compressed = self.load(address, MemoryRepresentation::Uint32) as u64;
                Linkage::CAGE_BASE.wrapping_add(compressed) as u128
            }
            ArchOpcode::RtStore(rep) | ArchOpcode::RtStoreWithWriteBarrier(rep) => {
                let address = self.address(index, inputs, mode)?;
                let value = match inputs.last() {
                    Some(value) => self.read(index, value)?,
                    None => return Err(invalid(index, &InstructionOperand::Invalid)),
                };
                let size = rep.size_in_bytes(false) as usize;
                self.write_memory(address, &value.to_le_bytes()[..size]);
                self.clobber_temps(instruction);
                return Ok(None);
            }
            ArchOpcode::RtFloatBinop(kind, rep) => {
                let left = float_value(self.read(index, &inputs[0])?, rep);
                let right = float_value(self.read(index, &inputs[1])?, rep);
                let result = match kind {
                    FloatBinopKind::Add => left + right,
                    FloatBinopKind::Sub => left - right,
                    FloatBinopKind::Mul => left * right,
                    FloatBinopKind::Div => left / right,
                    FloatBinopKind::Min if left.is_nan() || right.is_nan() => f64::NAN,
                    FloatBinopKind::Max if left.is_nan() || right.is_nan() => f64::NAN,
                    FloatBinopKind::Min => left.min(right),
                    FloatBinopKind::Max => left.max(right),
                };
                float_bits(result, rep)
            }
            ArchOpcode::RtFloatUnary(kind, rep) => {
                let input = float_value(self.read(index, &inputs[0])?, rep);
                let result = match kind {
                    FloatUnaryKind::Abs => input.abs(),
                    FloatUnaryKind::Negate => -input,
                    FloatUnaryKind::Sqrt => input.sqrt(),
                };
                float_bits(result, rep)
            }
            ArchOpcode::RtFloatCmp(rep) => {
                let left = float_value(self.read(index, &inputs[0])?, rep);
                let right = float_value(self.read(index, &inputs[1])?, rep);
                self.flags = Some(Flags::Float { left, right });
                return Ok(None);
            }
            ArchOpcode::RtIntToFloat { signed, from, to } => {
                let input = self.word(index, &inputs[0])?;
                let value = if signed {
                    from.sign_extend(input) as f64
                } else {
                    from.truncate(input) as f64
                };
                float_bits(value, to)
            }
            ArchOpcode::RtFloatToInt { from, to } => {
                let input = float_value(self.read(index, &inputs[0])?, from);
                let value = match to {
                    WordRepresentation::Word32 => input as i32 as u32 as u64,
                    WordRepresentation::Word64 => input as i64 as u64,
                };
                value as u128
            }
            ArchOpcode::RtFloatConvert(to) => {
                let from = match to {
                    FloatRepresentation::Float32 => FloatRepresentation::Float64,
                    FloatRepresentation::Float64 => FloatRepresentation::Float32,
                };
                float_bits(float_value(self.read(index, &inputs[0])?, from), to)
            }
            ArchOpcode::RtBitcast(to) => {
                let value = self.read(index, &inputs[0])?;
                match to {
                    RegisterRepresentation::Word32 | RegisterRepresentation::Float32 => {
                        value as u32 as u128
                    }
                    _ => value as u64 as u128,
                }
            }
            ArchOpcode::RtSimd128Binop(kind) => {
                let left = self.read(index, &inputs[0])?;
                let right = self.read(index, &inputs[1])?;
                simd128_binop(kind, left, right)
            }
            _ => return Err(invalid(index, &InstructionOperand::Invalid)),
        };
        Ok(Some(value))
    }

    /// The right operand of a two-address instruction: an immediate, a register, or the contents
    /// of the memory operand following the left input
    fn right_operand(
        &self,
        index: usize,
        inputs: &[InstructionOperand],
        mode: AddressingMode,
        rep: WordRepresentation,
    ) -> Result<u64, SimulationError> {
        if mode == AddressingMode::None {
            return self.word(index, &inputs[1]).map(|value| rep.truncate(value));
        }
        let address = self.address(index, &inputs[1..], mode)?;
        let memory_rep = match rep {
            WordRepresentation::Word32 => MemoryRepresentation::Uint32,
            WordRepresentation::Word64 => MemoryRepresentation::Uint64,
        };
        Ok(self.load(address, memory_rep) as u64)
    }

    /// The effective address of the memory operand at the start of `inputs`
    fn address(
        &self,
        index: usize,
        inputs: &[InstructionOperand],
        mode: AddressingMode,
    ) -> Result<u64, SimulationError> {
        let input = |i: usize| match inputs.get(i) {
            Some(operand) => self.word(index, operand),
            None => Err(invalid(index, &InstructionOperand::Invalid)),
        };
        let address = match mode {
            AddressingMode::None | AddressingMode::MR => input(0)?,
            AddressingMode::MRI => input(0)?.wrapping_add(input(1)?),
            AddressingMode::MRn(scale) => input(0)?.wrapping_add(input(1)? << scale),
            AddressingMode::MRnI(scale) => input(0)?
                .wrapping_add(input(1)? << scale)
                .wrapping_add(input(2)?),
            AddressingMode::MnI(scale) => (input(0)? << scale).wrapping_add(input(1)?),
            AddressingMode::Root => {
                let root = self.register(regs::ROOT).unwrap_or(0) as u64;
                root.wrapping_add(input(0)?)
            }
        };
        Ok(address)
    }

    /// Load a value of `rep` from memory, extended to the width of its register
    fn load(&self, address: u64, rep: MemoryRepresentation) -> u128 {
        let size = rep.size_in_bytes(false) as usize;
        let mut bytes = [0u8; 16];
        bytes[..size].copy_from_slice(&self.read_memory(address, size));
        let value = u128::from_le_bytes(bytes);
        if !rep.is_signed() {
            return value;
        }
        let shift = 128 - 8 * size as u32;
        let extended = ((value << shift) as i128 >> shift) as u128;
        match rep {
            MemoryRepresentation::Int64 => extended as u64 as u128,
            _ => extended as u32 as u128,
        }
    }
}

fn float_value(bits: u128, rep: FloatRepresentation) -> f64 {
    match rep {
        FloatRepresentation::Float32 => f32::from_bits(bits as u32) as f64,
        FloatRepresentation::Float64 => f64::from_bits(bits as u64),
    }
}

fn float_bits(value: f64, rep: FloatRepresentation) -> u128 {
    match rep {
        FloatRepresentation::Float32 => (value as f32).to_bits() as u128,
        FloatRepresentation::Float64 => value.to_bits() as u128,
    }
}

fn simd128_binop(kind: Simd128BinopKind, left: u128, right: u128) -> u128 {
    fn lanes<const N: usize>(
        left: u128,
        right: u128,
        op: impl Fn(u64, u64) -> u64,
    ) -> u128 {
        let width = 128 / N as u32;
        let mask = (1u128 << width) - 1;
        (0..N as u32).fold(0u128, |result, lane| {
            let shift = lane * width;
            let l = ((left >> shift) & mask) as u64;
            let r = ((right >> shift) & mask) as u64;
            result | ((op(l, r) as u128 & mask) << shift)
        })
    }

    match kind {
        Simd128BinopKind::I32x4Add => lanes::<4>(left, right, |l, r| l.wrapping_add(r)),
        Simd128BinopKind::I32x4Sub => lanes::<4>(left, right, |l, r| l.wrapping_sub(r)),
        Simd128BinopKind::I32x4Mul => lanes::<4>(left, right, |l, r| l.wrapping_mul(r)),
        Simd128BinopKind::F32x4Add => lanes::<4>(left, right, |l, r| {
            (f32::from_bits(l as u32) + f32::from_bits(r as u32)).to_bits() as u64
        }),
        Simd128BinopKind::F64x2Add => {
            lanes::<2>(left, right, |l, r| (f64::from_bits(l) + f64::from_bits(r)).to_bits())
        }
        Simd128BinopKind::F64x2Mul => {
            lanes::<2>(left, right, |l, r| (f64::from_bits(l) * f64::from_bits(r)).to_bits())
        }
        Simd128BinopKind::S128And => left & right,
        Simd128BinopKind::S128Or => left | right,
        Simd128BinopKind::S128Xor => left ^ right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32x4_lanes_wrap_independently() {
        let left = u128::from_le_bytes(
            [u32::MAX.to_le_bytes(), 1u32.to_le_bytes(), 2u32.to_le_bytes(), 3u32.to_le_bytes()]
                .concat()
                .try_into()
                .unwrap(),
        );
        let right = u128::from_le_bytes(
            [1u32.to_le_bytes(); 4].concat().try_into().unwrap(),
        );
        let sum = simd128_binop(Simd128BinopKind::I32x4Add, left, right);
        let lanes: Vec<u32> = (0..4).map(|lane| (sum >> (32 * lane)) as u32).collect();
        assert_eq!(lanes, vec![0, 2, 3, 4]);
    }

    #[test]
    fn float32_values_round_trip_through_f64() {
        let bits = float_bits(1.5, FloatRepresentation::Float32);
        assert_eq!(bits, 1.5f32.to_bits() as u128);
        assert_eq!(float_value(bits, FloatRepresentation::Float32), 1.5);
    }
}
