//! Lazylink Core - lazy call linking for a dynamic binary translator
//!
//! Translated guest functions call each other through small pre-compiled
//! trampolines ("call stubs") whenever the host address of the callee is not
//! known yet. A stub resolves the callee at call time, optionally publishes
//! the result into a dispatch table so later calls skip resolution, and then
//! transfers control with either a nested call or a tail call.
//!
//! # Architecture
//!
//! ```text
//! guest code → call-address slot → stub → ResolutionService → resolved code
//! ```
//!
//! - ABI: the single-argument calling convention shared by all generated code
//! - IR: the tiny instruction list stub bodies are described with
//! - Stubs: the four stub variants and the cache that owns them
//! - Backend: lowering of IR to native code (Cranelift)
//! - Resolve: the Resolution Service seam and a tiered reference resolver
//! - Dispatch: atomic dispatch-table entries for indirect calls

use thiserror::Error;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Native calling convention and call-context layout
#[allow(unsafe_code, clippy::missing_safety_doc)]
pub mod abi;

/// Backends that lower IR programs to executable code
#[allow(unsafe_code, clippy::missing_safety_doc)]
pub mod backend;

/// Call-site emission helpers for translated guest code
pub mod callsite;

/// Configuration loading
pub mod config;

/// Dispatch tables for indirect calls
#[allow(unsafe_code, clippy::missing_safety_doc)]
pub mod dispatch;

/// Intermediate representation used to describe stub bodies
pub mod ir;

/// Resolution Service seam and native routine shims
#[allow(unsafe_code, clippy::missing_safety_doc)]
pub mod resolve;

/// Call stub construction and caching
pub mod stubs;

pub use abi::{CallContext, GuestFunction, HostEntry, CALL_ADDRESS_OFFSET};
pub use backend::{CodeBackend, CompileSession, CraneliftBackend};
pub use config::LazylinkConfig;
pub use dispatch::{DispatchEntry, DispatchTable};
pub use ir::{Emitter, Operand, Routine, StubProgram};
pub use resolve::{ResolutionService, RoutineTable};
pub use stubs::{CallStubs, StubKind, StubVariant};

/// Errors that can occur while building stubs or linking calls
#[derive(Debug, Error)]
pub enum JitError {
    /// Cranelift compilation or module error
    #[error("Cranelift compilation error: {0}")]
    Cranelift(String),

    /// The host machine cannot run generated code
    #[error("Host machine is not supported: {0}")]
    UnsupportedHost(String),

    /// Malformed IR program
    #[error("Invalid IR program: {0}")]
    InvalidProgram(String),

    /// A program invokes a routine the routine table has no binding for
    #[error("No host binding for routine {0}")]
    UnboundRoutine(&'static str),

    /// One of the call stubs could not be built; the stub cache is unusable
    #[error("Failed to construct {variant} stub: {source}")]
    StubConstruction {
        variant: StubVariant,
        #[source]
        source: Box<JitError>,
    },

    /// Every dispatch-table entry is claimed
    #[error("Dispatch table is full ({capacity} entries)")]
    DispatchTableFull { capacity: usize },

    /// The guest translator could not produce code for a target
    #[error("Failed to translate guest function {guest:#x}: {reason}")]
    Translation { guest: u64, reason: String },

    /// Configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type for JIT operations
pub type JitResult<T> = Result<T, JitError>;
