//! A lattice of value types used by type inference.
//!
//! Word types are unsigned, non-wrapping ranges: `Word32 { min, max }` holds every value `v` with
//! `min <= v <= max` interpreted as an unsigned integer. Float types are ranges with an additional
//! flag recording whether NaN may occur.

use core::fmt;

use crate::{
    ComparisonKind, ConstantKind, FloatBinopKind, RegisterRepresentation, ShiftKind, WordBinopKind,
    WordRepresentation,
};

#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub enum Type {
    /// No value; the type of unreachable code
    #[default]
    None,
    Word32 { min: u32, max: u32 },
    Word64 { min: u64, max: u64 },
    Float64 { min: f64, max: f64, maybe_nan: bool },
    /// Any value of any representation
    Any,
}

impl Type {
    pub const fn word32_constant(value: u32) -> Self {
        Self::Word32 {
            min: value,
            max: value,
        }
    }

    pub const fn word64_constant(value: u64) -> Self {
        Self::Word64 {
            min: value,
            max: value,
        }
    }

    pub fn float64_constant(value: f64) -> Self {
        if value.is_nan() {
            Self::Float64 {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                maybe_nan: true,
            }
        } else {
            Self::Float64 {
                min: value,
                max: value,
                maybe_nan: false,
            }
        }
    }

    /// The type of a boolean produced by a comparison
    pub const BOOLEAN: Self = Self::Word32 { min: 0, max: 1 };

    pub const fn word32_any() -> Self {
        Self::Word32 {
            min: 0,
            max: u32::MAX,
        }
    }

    pub const fn word64_any() -> Self {
        Self::Word64 {
            min: 0,
            max: u64::MAX,
        }
    }

    pub const fn float64_any() -> Self {
        Self::Float64 {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            maybe_nan: true,
        }
    }

    pub fn word_any(rep: WordRepresentation) -> Self {
        match rep {
            WordRepresentation::Word32 => Self::word32_any(),
            WordRepresentation::Word64 => Self::word64_any(),
        }
    }

    /// The most general type of values held in `rep`
    pub fn for_representation(rep: RegisterRepresentation) -> Self {
        match rep {
            RegisterRepresentation::Word32 => Self::word32_any(),
            RegisterRepresentation::Word64 => Self::word64_any(),
            RegisterRepresentation::Float64 => Self::float64_any(),
            _ => Self::Any,
        }
    }

    /// The type of a constant
    pub fn of_constant(kind: &ConstantKind) -> Self {
        match *kind {
            ConstantKind::Word32(value) => Self::word32_constant(value),
            ConstantKind::Word64(value) => Self::word64_constant(value),
            ConstantKind::Float64(value) => Self::float64_constant(value),
            _ => Self::Any,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// The word range of this type as 64-bit bounds, if it is a word type
    pub fn word_range(&self) -> Option<(u64, u64)> {
        match *self {
            Self::Word32 { min, max } => Some((min as u64, max as u64)),
            Self::Word64 { min, max } => Some((min, max)),
            _ => None,
        }
    }

    /// If this type contains exactly one value, the constant producing it
    pub fn as_constant(&self) -> Option<ConstantKind> {
        match *self {
            Self::Word32 { min, max } if min == max => Some(ConstantKind::Word32(min)),
            Self::Word64 { min, max } if min == max => Some(ConstantKind::Word64(min)),
            Self::Float64 {
                min,
                max,
                maybe_nan: false,
            } if min == max && min != 0.0 => Some(ConstantKind::Float64(min)),
            _ => None,
        }
    }

    pub fn as_word32_constant(&self) -> Option<u32> {
        match *self {
            Self::Word32 { min, max } if min == max => Some(min),
            _ => None,
        }
    }

    /// The smallest type containing both `self` and `other`
    pub fn least_upper_bound(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Self::None, t) | (t, Self::None) => t,
            (Self::Word32 { min: a, max: b }, Self::Word32 { min: c, max: d }) => Self::Word32 {
                min: a.min(c),
                max: b.max(d),
            },
            (Self::Word64 { min: a, max: b }, Self::Word64 { min: c, max: d }) => Self::Word64 {
                min: a.min(c),
                max: b.max(d),
            },
            (
                Self::Float64 {
                    min: a,
                    max: b,
                    maybe_nan: n1,
                },
                Self::Float64 {
                    min: c,
                    max: d,
                    maybe_nan: n2,
                },
            ) => Self::Float64 {
                min: a.min(c),
                max: b.max(d),
                maybe_nan: n1 || n2,
            },
            _ => Self::Any,
        }
    }

    /// The largest type contained in both `self` and `other`
    pub fn intersect(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Self::None, _) | (_, Self::None) => Self::None,
            (Self::Any, t) | (t, Self::Any) => t,
            (Self::Word32 { min: a, max: b }, Self::Word32 { min: c, max: d }) => {
                let (min, max) = (a.max(c), b.min(d));
                if min > max { Self::None } else { Self::Word32 { min, max } }
            }
            (Self::Word64 { min: a, max: b }, Self::Word64 { min: c, max: d }) => {
                let (min, max) = (a.max(c), b.min(d));
                if min > max { Self::None } else { Self::Word64 { min, max } }
            }
            _ => *self,
        }
    }

    /// Widen `self`, the type of a loop phi in the previous iteration, with `new`, its type in the
    /// current iteration: bounds that grew jump to the extreme of the domain so that the fixpoint
    /// iteration over a loop terminates.
    pub fn widen(&self, new: &Self) -> Self {
        match (*self, new.least_upper_bound(self)) {
            (Self::Word32 { min: a, max: b }, Self::Word32 { min: c, max: d }) => Self::Word32 {
                min: if c < a { 0 } else { a },
                max: if d > b { u32::MAX } else { b },
            },
            (Self::Word64 { min: a, max: b }, Self::Word64 { min: c, max: d }) => Self::Word64 {
                min: if c < a { 0 } else { a },
                max: if d > b { u64::MAX } else { b },
            },
            (
                Self::Float64 { min: a, max: b, .. },
                Self::Float64 {
                    min: c,
                    max: d,
                    maybe_nan,
                },
            ) => Self::Float64 {
                min: if c < a { f64::NEG_INFINITY } else { a },
                max: if d > b { f64::INFINITY } else { b },
                maybe_nan,
            },
            (_, joined) => joined,
        }
    }

    /// True if every value of `self` is a value of `other`
    pub fn is_subtype_of(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Self::None, _) | (_, Self::Any) => true,
            (Self::Word32 { min: a, max: b }, Self::Word32 { min: c, max: d }) => c <= a && b <= d,
            (Self::Word64 { min: a, max: b }, Self::Word64 { min: c, max: d }) => c <= a && b <= d,
            (
                Self::Float64 {
                    min: a,
                    max: b,
                    maybe_nan: n1,
                },
                Self::Float64 {
                    min: c,
                    max: d,
                    maybe_nan: n2,
                },
            ) => c <= a && b <= d && (!n1 || n2),
            _ => false,
        }
    }

    fn from_word_range(rep: WordRepresentation, min: u64, max: u64) -> Self {
        match rep {
            WordRepresentation::Word32 => {
                if max > u32::MAX as u64 {
                    Self::word32_any()
                } else {
                    Self::Word32 {
                        min: min as u32,
                        max: max as u32,
                    }
                }
            }
            WordRepresentation::Word64 => Self::Word64 { min, max },
        }
    }

    /// The type of `left <kind> right` with both operands of width `rep`
    pub fn word_binop(kind: WordBinopKind, rep: WordRepresentation, left: &Self, right: &Self) -> Self {
        if left.is_none() || right.is_none() {
            return Self::None;
        }
        let (Some((a, b)), Some((c, d))) = (left.word_range(), right.word_range()) else {
            return Self::word_any(rep);
        };
        let max = rep.max_unsigned_value();
        if a == b && c == d {
            return match kind.fold(a, c, rep) {
                Some(value) => Self::from_word_range(rep, value, value),
                None => Self::word_any(rep),
            };
        }
        match kind {
            WordBinopKind::Add => match (a.checked_add(c), b.checked_add(d)) {
                (Some(lo), Some(hi)) if hi <= max => Self::from_word_range(rep, lo, hi),
                _ => Self::word_any(rep),
            },
            WordBinopKind::Sub if a >= d => Self::from_word_range(rep, a - d, b - c),
            WordBinopKind::Mul => match (a.checked_mul(c), b.checked_mul(d)) {
                (Some(lo), Some(hi)) if hi <= max => Self::from_word_range(rep, lo, hi),
                _ => Self::word_any(rep),
            },
            WordBinopKind::BitwiseAnd => Self::from_word_range(rep, 0, b.min(d)),
            WordBinopKind::UnsignedDiv if c > 0 => Self::from_word_range(rep, a / d, b / c),
            WordBinopKind::UnsignedMod if c > 0 => Self::from_word_range(rep, 0, b.min(d - 1)),
            _ => Self::word_any(rep),
        }
    }

    pub fn shift(kind: ShiftKind, rep: WordRepresentation, left: &Self, right: &Self) -> Self {
        if left.is_none() || right.is_none() {
            return Self::None;
        }
        let (Some((a, b)), Some((c, d))) = (left.word_range(), right.word_range()) else {
            return Self::word_any(rep);
        };
        if c != d {
            return Self::word_any(rep);
        }
        if a == b {
            let value = kind.fold(a, c, rep);
            return Self::from_word_range(rep, value, value);
        }
        let amount = (c % rep.bit_width() as u64) as u32;
        match kind {
            ShiftKind::ShiftRightLogical => Self::from_word_range(rep, a >> amount, b >> amount),
            ShiftKind::ShiftLeft if b.leading_zeros() >= amount + (64 - rep.bit_width()) => {
                Self::from_word_range(rep, a << amount, b << amount)
            }
            _ => Self::word_any(rep),
        }
    }

    pub fn comparison(
        kind: ComparisonKind,
        rep: RegisterRepresentation,
        left: &Self,
        right: &Self,
    ) -> Self {
        if left.is_none() || right.is_none() {
            return Self::None;
        }
        let Some(word) = rep.as_word() else {
            return Self::BOOLEAN;
        };
        let (Some((a, b)), Some((c, d))) = (left.word_range(), right.word_range()) else {
            return Self::BOOLEAN;
        };
        let (a, b, c, d) = if kind.is_signed() {
            // Only ranges that do not cross the sign boundary are ordered the same way
            let half = 1u64 << (word.bit_width() - 1);
            if (a < half) != (b < half) || (c < half) != (d < half) {
                return Self::BOOLEAN;
            }
            (
                word.sign_extend(a),
                word.sign_extend(b),
                word.sign_extend(c),
                word.sign_extend(d),
            )
        } else {
            (a as i64, b as i64, c as i64, d as i64)
        };
        let (always, never) = match kind {
            ComparisonKind::SignedLessThan | ComparisonKind::UnsignedLessThan => (b < c, a >= d),
            ComparisonKind::SignedLessThanOrEqual | ComparisonKind::UnsignedLessThanOrEqual => {
                (b <= c, a > d)
            }
        };
        match (always, never) {
            (true, _) => Self::word32_constant(1),
            (_, true) => Self::word32_constant(0),
            _ => Self::BOOLEAN,
        }
    }

    pub fn equal(left: &Self, right: &Self) -> Self {
        if left.is_none() || right.is_none() {
            return Self::None;
        }
        match (left.word_range(), right.word_range()) {
            (Some((a, b)), Some((c, d))) => {
                if a == b && c == d && a == c {
                    Self::word32_constant(1)
                } else if b < c || d < a {
                    Self::word32_constant(0)
                } else {
                    Self::BOOLEAN
                }
            }
            _ => Self::BOOLEAN,
        }
    }

    pub fn float64_binop(kind: FloatBinopKind, left: &Self, right: &Self) -> Self {
        match (*left, *right) {
            (Self::None, _) | (_, Self::None) => Self::None,
            (
                Self::Float64 {
                    min: a,
                    max: b,
                    maybe_nan: false,
                },
                Self::Float64 {
                    min: c,
                    max: d,
                    maybe_nan: false,
                },
            ) if a == b && c == d => {
                let value = match kind {
                    FloatBinopKind::Add => a + c,
                    FloatBinopKind::Sub => a - c,
                    FloatBinopKind::Mul => a * c,
                    FloatBinopKind::Div => a / c,
                    FloatBinopKind::Min => a.min(c),
                    FloatBinopKind::Max => a.max(c),
                };
                Self::float64_constant(value)
            }
            _ => Self::float64_any(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Any => f.write_str("Any"),
            Self::Word32 { min, max } if min == max => write!(f, "Word32{{{min}}}"),
            Self::Word32 { min, max } => write!(f, "Word32[{min}, {max}]"),
            Self::Word64 { min, max } if min == max => write!(f, "Word64{{{min}}}"),
            Self::Word64 { min, max } => write!(f, "Word64[{min}, {max}]"),
            Self::Float64 {
                min,
                max,
                maybe_nan,
            } => {
                write!(f, "Float64[{min}, {max}]")?;
                if *maybe_nan {
                    f.write_str("|NaN")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn least_upper_bound_of_ranges() {
        let a = Type::word32_constant(3);
        let b = Type::Word32 { min: 10, max: 20 };
        assert_eq!(a.least_upper_bound(&b), Type::Word32 { min: 3, max: 20 });
        assert_eq!(Type::None.least_upper_bound(&b), b);
        assert_eq!(a.least_upper_bound(&Type::word64_constant(3)), Type::Any);
    }

    #[test]
    fn widening_jumps_to_domain_bounds() {
        let previous = Type::Word32 { min: 0, max: 1 };
        let current = Type::Word32 { min: 0, max: 2 };
        assert_eq!(
            previous.widen(&current),
            Type::Word32 {
                min: 0,
                max: u32::MAX
            }
        );
        assert_eq!(previous.widen(&previous), previous);
    }

    #[test]
    fn word_arithmetic_ranges() {
        let x = Type::Word32 { min: 0, max: 9 };
        let one = Type::word32_constant(1);
        assert_eq!(
            Type::word_binop(WordBinopKind::Add, WordRepresentation::Word32, &x, &one),
            Type::Word32 { min: 1, max: 10 }
        );
        let big = Type::Word32 {
            min: 0,
            max: u32::MAX,
        };
        assert_eq!(
            Type::word_binop(WordBinopKind::Add, WordRepresentation::Word32, &big, &one),
            Type::word32_any()
        );
        assert_eq!(
            Type::word_binop(
                WordBinopKind::Mul,
                WordRepresentation::Word32,
                &Type::word32_constant(6),
                &Type::word32_constant(7)
            )
            .as_constant(),
            Some(ConstantKind::Word32(42))
        );
    }

    #[test]
    fn comparisons_of_disjoint_ranges_are_constant() {
        let x = Type::Word32 { min: 0, max: 3 };
        let ten = Type::word32_constant(10);
        let rep = RegisterRepresentation::Word32;
        assert_eq!(
            Type::comparison(ComparisonKind::SignedLessThan, rep, &x, &ten),
            Type::word32_constant(1)
        );
        assert_eq!(
            Type::comparison(ComparisonKind::UnsignedLessThan, rep, &ten, &x),
            Type::word32_constant(0)
        );
        let negative = Type::word32_constant(-1i32 as u32);
        assert_eq!(
            Type::comparison(ComparisonKind::SignedLessThan, rep, &negative, &x),
            Type::word32_constant(1)
        );
        assert_eq!(Type::equal(&x, &ten), Type::word32_constant(0));
    }
}
