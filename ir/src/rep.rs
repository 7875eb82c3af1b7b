use core::fmt;

/// The representation of a value as held in a register
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegisterRepresentation {
    Word32,
    Word64,
    Float32,
    Float64,
    /// A full-width tagged pointer (or small integer)
    Tagged,
    /// A 32-bit compressed tagged value, decompressed relative to the cage base
    Compressed,
    Simd128,
}

impl RegisterRepresentation {
    /// The word representation the size of a pointer on the reference target
    pub const POINTER: Self = Self::Word64;

    #[inline]
    pub fn is_word(self) -> bool {
        matches!(self, Self::Word32 | Self::Word64)
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    #[inline]
    pub fn is_tagged(self) -> bool {
        matches!(self, Self::Tagged | Self::Compressed)
    }

    /// True if the value is held in a general purpose register
    #[inline]
    pub fn is_general(self) -> bool {
        !self.is_float() && self != Self::Simd128
    }

    pub fn bit_width(self) -> u32 {
        match self {
            Self::Word32 | Self::Float32 | Self::Compressed => 32,
            Self::Word64 | Self::Float64 | Self::Tagged => 64,
            Self::Simd128 => 128,
        }
    }

    pub fn as_word(self) -> Option<WordRepresentation> {
        match self {
            Self::Word32 => Some(WordRepresentation::Word32),
            Self::Word64 => Some(WordRepresentation::Word64),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Word32 => "w32",
            Self::Word64 => "w64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Tagged => "tagged",
            Self::Compressed => "compressed",
            Self::Simd128 => "s128",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WordRepresentation {
    Word32,
    Word64,
}

impl WordRepresentation {
    pub fn bit_width(self) -> u32 {
        match self {
            Self::Word32 => 32,
            Self::Word64 => 64,
        }
    }

    pub fn max_unsigned_value(self) -> u64 {
        match self {
            Self::Word32 => u32::MAX as u64,
            Self::Word64 => u64::MAX,
        }
    }

    /// Truncate `value` to the width of this representation
    #[inline]
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Self::Word32 => value as u32 as u64,
            Self::Word64 => value,
        }
    }

    /// Reinterpret the low bits of `value` as a signed integer of this width
    #[inline]
    pub fn sign_extend(self, value: u64) -> i64 {
        match self {
            Self::Word32 => value as u32 as i32 as i64,
            Self::Word64 => value as i64,
        }
    }
}

impl From<WordRepresentation> for RegisterRepresentation {
    fn from(rep: WordRepresentation) -> Self {
        match rep {
            WordRepresentation::Word32 => Self::Word32,
            WordRepresentation::Word64 => Self::Word64,
        }
    }
}

impl fmt::Display for WordRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RegisterRepresentation::from(*self).fmt(f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FloatRepresentation {
    Float32,
    Float64,
}

impl From<FloatRepresentation> for RegisterRepresentation {
    fn from(rep: FloatRepresentation) -> Self {
        match rep {
            FloatRepresentation::Float32 => Self::Float32,
            FloatRepresentation::Float64 => Self::Float64,
        }
    }
}

impl fmt::Display for FloatRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RegisterRepresentation::from(*self).fmt(f)
    }
}

/// The representation of a value in memory, as read by a load or written by a store
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryRepresentation {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    AnyTagged,
    TaggedPointer,
    TaggedSigned,
    Simd128,
}

impl MemoryRepresentation {
    pub fn size_in_bytes(self, pointer_compression: bool) -> u32 {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
            Self::AnyTagged | Self::TaggedPointer | Self::TaggedSigned => {
                if pointer_compression {
                    4
                } else {
                    8
                }
            }
            Self::Simd128 => 16,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub fn is_tagged(self) -> bool {
        matches!(self, Self::AnyTagged | Self::TaggedPointer | Self::TaggedSigned)
    }

    /// The representation a value loaded with this memory representation has in a register
    pub fn to_register_representation(self) -> RegisterRepresentation {
        match self {
            Self::Int8 | Self::Uint8 | Self::Int16 | Self::Uint16 | Self::Int32 | Self::Uint32 => {
                RegisterRepresentation::Word32
            }
            Self::Int64 | Self::Uint64 => RegisterRepresentation::Word64,
            Self::Float32 => RegisterRepresentation::Float32,
            Self::Float64 => RegisterRepresentation::Float64,
            Self::AnyTagged | Self::TaggedPointer | Self::TaggedSigned => {
                RegisterRepresentation::Tagged
            }
            Self::Simd128 => RegisterRepresentation::Simd128,
        }
    }
}

impl fmt::Display for MemoryRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int8 => "i8",
            Self::Uint8 => "u8",
            Self::Int16 => "i16",
            Self::Uint16 => "u16",
            Self::Int32 => "i32",
            Self::Uint32 => "u32",
            Self::Int64 => "i64",
            Self::Uint64 => "u64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::AnyTagged => "any-tagged",
            Self::TaggedPointer => "tagged-ptr",
            Self::TaggedSigned => "tagged-signed",
            Self::Simd128 => "s128",
        })
    }
}
