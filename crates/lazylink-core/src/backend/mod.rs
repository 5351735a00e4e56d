//! Code generation backends
//!
//! A backend turns finished [`StubProgram`]s into executable code and hands
//! back stable addresses. Compilation happens inside a [`CompileSession`],
//! which brackets a batch of compilations with the backend's scratch
//! resources:
//!
//! ```text
//! prepare → compile* → reset → dispose      (reset/dispose run on every exit)
//! ```

mod cranelift;
pub mod types;

pub use cranelift::CraneliftBackend;

use crate::abi::GuestFunction;
use crate::ir::StubProgram;
use crate::resolve::RoutineTable;
use crate::JitResult;

/// Compiler plus executable-code cache
pub trait CodeBackend {
    /// Acquire scratch compilation resources
    fn prepare(&mut self) -> JitResult<()>;

    /// Lower `program` to native code and return its permanent address
    ///
    /// Routines invoked by the program are bound through `routines`.
    fn compile(&mut self, program: &StubProgram, routines: &RoutineTable)
        -> JitResult<GuestFunction>;

    /// Return scratch resources to their pristine state
    fn reset(&mut self);

    /// Release scratch resources
    fn dispose(&mut self);
}

/// Scope guard for a batch of compilations
///
/// Dropping the session resets and disposes the backend's scratch resources,
/// including when a compilation in the batch failed.
pub struct CompileSession<'a, B: CodeBackend + ?Sized> {
    backend: &'a mut B,
}

impl<'a, B: CodeBackend + ?Sized> CompileSession<'a, B> {
    /// Prepare the backend for compilation
    pub fn begin(backend: &'a mut B) -> JitResult<Self> {
        if let Err(error) = backend.prepare() {
            backend.dispose();
            return Err(error);
        }
        Ok(Self { backend })
    }

    /// Compile one program
    pub fn compile(
        &mut self,
        program: &StubProgram,
        routines: &RoutineTable,
    ) -> JitResult<GuestFunction> {
        self.backend.compile(program, routines)
    }
}

impl<B: CodeBackend + ?Sized> Drop for CompileSession<'_, B> {
    fn drop(&mut self) {
        self.backend.reset();
        self.backend.dispose();
    }
}
