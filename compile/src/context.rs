use std::sync::Arc;

use shaftc_codegen::{Linkage, RegisterConfiguration};
use shaftc_ir::CallDescriptor;
use shaftc_session::Session;

/// Everything the stages of one compilation share: the session, the calling convention of the
/// function being compiled and the registers the allocator may use.
///
/// A context lives exactly as long as the compilation of its function.
pub struct CompilationContext {
    session: Session,
    linkage: Linkage,
    registers: RegisterConfiguration,
}

impl CompilationContext {
    pub fn new(session: Session, descriptor: Arc<CallDescriptor>) -> Self {
        Self {
            session,
            linkage: Linkage::new(descriptor),
            registers: RegisterConfiguration::reference(),
        }
    }

    /// Restrict allocation to `registers`, e.g. to force spilling
    pub fn with_registers(mut self, registers: RegisterConfiguration) -> Self {
        self.registers = registers;
        self
    }

    #[inline]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[inline]
    pub fn linkage(&self) -> &Linkage {
        &self.linkage
    }

    #[inline]
    pub fn registers(&self) -> &RegisterConfiguration {
        &self.registers
    }
}
