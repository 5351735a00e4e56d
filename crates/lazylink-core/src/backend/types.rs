//! Type mapping between the linker IR and Cranelift
//!
//! The IR is untyped: every value is a machine word. This module pins down
//! what that means in Cranelift IR and which signatures generated code uses.

use cranelift_codegen::ir::{types, AbiParam, Signature, Type as ClifType};
use cranelift_codegen::isa::CallConv;

/// Cranelift type mappings for linker values
#[derive(Debug, Clone, Copy)]
pub struct CraneliftTypes;

impl CraneliftTypes {
    /// Every IR value: pointers, tokens and results
    pub const WORD: ClifType = types::I64;
}

/// Signature of all generated guest-ABI code: `(i64 context) -> i64`
///
/// Uses the `tail` calling convention so stubs can `return_call_indirect`.
#[must_use]
pub fn guest_signature() -> Signature {
    let mut sig = Signature::new(CallConv::Tail);
    sig.params.push(AbiParam::new(CraneliftTypes::WORD));
    sig.returns.push(AbiParam::new(CraneliftTypes::WORD));
    sig
}

/// Signature of a host routine: `(env, args...) -> i64` in the host convention
#[must_use]
pub fn routine_signature(call_conv: CallConv, arity: usize) -> Signature {
    let mut sig = Signature::new(call_conv);
    for _ in 0..=arity {
        sig.params.push(AbiParam::new(CraneliftTypes::WORD));
    }
    sig.returns.push(AbiParam::new(CraneliftTypes::WORD));
    sig
}

/// Signature of the host entry trampoline: `(code, context) -> i64`
#[must_use]
pub fn host_entry_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(CraneliftTypes::WORD));
    sig.params.push(AbiParam::new(CraneliftTypes::WORD));
    sig.returns.push(AbiParam::new(CraneliftTypes::WORD));
    sig
}

/// Memory flags for Cranelift memory operations
pub mod mem_flags {
    use cranelift_codegen::ir::MemFlags;

    /// Word accesses to call contexts and dispatch entries, which are always
    /// aligned and mapped
    pub fn aligned() -> MemFlags {
        MemFlags::trusted()
    }
}
