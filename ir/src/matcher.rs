//! Pattern-matching helpers over the operations of a [Graph]

use crate::{
    ComparisonKind, ConstantKind, Graph, OpIndex, Operation, RegisterRepresentation, WordBinopKind,
    WordRepresentation,
};

impl Graph {
    pub fn match_constant(&self, op: OpIndex) -> Option<ConstantKind> {
        match self.get(op) {
            Operation::Constant { kind } => Some(*kind),
            _ => None,
        }
    }

    /// Match a word constant of any width, zero-extended to 64 bits
    pub fn match_integral_constant(&self, op: OpIndex) -> Option<u64> {
        self.match_constant(op)?.integral()
    }

    /// Match a word constant whose width is `rep`
    pub fn match_integral_word_constant(&self, op: OpIndex, rep: WordRepresentation) -> Option<u64> {
        match (self.match_constant(op)?, rep) {
            (ConstantKind::Word32(value), WordRepresentation::Word32) => Some(value as u64),
            (ConstantKind::Word64(value), WordRepresentation::Word64) => Some(value),
            _ => None,
        }
    }

    /// Match a word constant, sign-extended from its width
    pub fn match_signed_integral_constant(&self, op: OpIndex) -> Option<i64> {
        self.match_constant(op)?.signed_integral()
    }

    pub fn match_word32_constant(&self, op: OpIndex) -> Option<u32> {
        match self.match_constant(op)? {
            ConstantKind::Word32(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_zero(&self, op: OpIndex) -> bool {
        self.match_integral_constant(op) == Some(0)
    }

    pub fn match_phi(&self, op: OpIndex) -> Option<&[OpIndex]> {
        match self.get(op) {
            Operation::Phi { inputs, .. } => Some(inputs.as_slice()),
            _ => None,
        }
    }

    pub fn match_word_binop(
        &self,
        op: OpIndex,
    ) -> Option<(OpIndex, OpIndex, WordBinopKind, WordRepresentation)> {
        match self.get(op) {
            Operation::WordBinop {
                left,
                right,
                kind,
                rep,
            } => Some((*left, *right, *kind, *rep)),
            _ => None,
        }
    }

    pub fn match_comparison(
        &self,
        op: OpIndex,
    ) -> Option<(OpIndex, OpIndex, ComparisonKind, RegisterRepresentation)> {
        match self.get(op) {
            Operation::Comparison {
                left,
                right,
                kind,
                rep,
            } => Some((*left, *right, *kind, *rep)),
            _ => None,
        }
    }

    pub fn match_equal(&self, op: OpIndex) -> Option<(OpIndex, OpIndex, RegisterRepresentation)> {
        match self.get(op) {
            Operation::Equal { left, right, rep } => Some((*left, *right, *rep)),
            _ => None,
        }
    }

    /// Match `op == 0` with either operand being the zero constant, returning the other operand
    pub fn match_equal_zero(&self, op: OpIndex) -> Option<OpIndex> {
        let (left, right, rep) = self.match_equal(op)?;
        if !rep.is_word() {
            return None;
        }
        if self.is_zero(right) {
            Some(left)
        } else if self.is_zero(left) {
            Some(right)
        } else {
            None
        }
    }
}
