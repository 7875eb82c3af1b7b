use core::fmt;

use smallvec::SmallVec;

use crate::RegisterRepresentation;

/// How the callee of a call is invoked
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Call the entry of a code object
    CodeObject,
    /// Call a JavaScript function object through its code entry
    JSFunction,
    /// Call a function following the C calling convention
    CFunction,
    /// Call a raw code address
    Address,
    /// Call a builtin given as an index into the builtin entry table
    BuiltinPointer,
}

bitflags::bitflags! {
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CallDescriptorFlags: u16 {
        /// The call may deoptimize lazily and carries a frame state
        const NEEDS_FRAME_STATE = 1 << 0;
        /// The caller must preserve all allocatable general registers around the call
        const CALLER_SAVED_REGISTERS = 1 << 1;
        /// The caller must preserve all allocatable float registers around the call
        const CALLER_SAVED_FP_REGISTERS = 1 << 2;
        /// The call target must be passed in the designated call target register
        const FIXED_TARGET_REGISTER = 1 << 3;
        /// The callee never triggers a garbage collection, so no safepoint is recorded
        const NO_ALLOCATE = 1 << 4;
    }
}

/// A description of the signature and conventions of a call or of the function being compiled.
///
/// Where each parameter and return value lives is decided by the target's linkage; the descriptor
/// only says what is passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    pub kind: CallKind,
    pub parameters: SmallVec<[RegisterRepresentation; 4]>,
    pub returns: SmallVec<[RegisterRepresentation; 2]>,
    pub flags: CallDescriptorFlags,
    pub debug_name: &'static str,
}

impl CallDescriptor {
    pub fn new(
        kind: CallKind,
        parameters: impl IntoIterator<Item = RegisterRepresentation>,
        returns: impl IntoIterator<Item = RegisterRepresentation>,
    ) -> Self {
        Self {
            kind,
            parameters: parameters.into_iter().collect(),
            returns: returns.into_iter().collect(),
            flags: CallDescriptorFlags::empty(),
            debug_name: "",
        }
    }

    pub fn with_flags(mut self, flags: CallDescriptorFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.debug_name = name;
        self
    }

    #[inline]
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    #[inline]
    pub fn return_count(&self) -> usize {
        self.returns.len()
    }

    #[inline]
    pub fn needs_frame_state(&self) -> bool {
        self.flags.contains(CallDescriptorFlags::NEEDS_FRAME_STATE)
    }

    #[inline]
    pub fn is_c_function_call(&self) -> bool {
        self.kind == CallKind::CFunction
    }

    #[inline]
    pub fn needs_caller_saved_registers(&self) -> bool {
        self.flags.contains(CallDescriptorFlags::CALLER_SAVED_REGISTERS)
    }

    #[inline]
    pub fn needs_caller_saved_fp_registers(&self) -> bool {
        self.flags.contains(CallDescriptorFlags::CALLER_SAVED_FP_REGISTERS)
    }

    #[inline]
    pub fn can_allocate(&self) -> bool {
        !self.flags.contains(CallDescriptorFlags::NO_ALLOCATE)
    }
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.debug_name.is_empty() {
            write!(f, "{}:", self.debug_name)?;
        }
        write!(f, "{:?}(", self.kind)?;
        for (i, param) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(") -> (")?;
        for (i, ret) in self.returns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ret}")?;
        }
        f.write_str(")")
    }
}

/// Describes the unoptimized frame reconstructed when deoptimizing at a frame state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameStateInfo {
    pub bytecode_offset: u32,
    pub parameter_count: u16,
    pub local_count: u16,
    /// Size in bytes of the unoptimized frame that deoptimization materializes
    pub unoptimized_frame_height: u32,
}
