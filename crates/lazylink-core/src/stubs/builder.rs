//! Stub body construction
//!
//! Builds the IR for the four stub variants. Building never compiles or
//! runs anything; lowering is the backend's job.

use crate::abi::CALL_ADDRESS_OFFSET;
use crate::dispatch::DispatchEntry;
use crate::ir::{Emitter, Operand, Routine, StubProgram};
use crate::JitResult;

use super::{StubKind, StubVariant};

/// Build the body of any stub variant
pub fn build_stub(variant: StubVariant) -> JitResult<StubProgram> {
    match variant.kind {
        StubKind::Direct => build_direct_stub(variant.tail_call),
        StubKind::Indirect => build_indirect_stub(variant.tail_call),
    }
}

/// Stub used by direct calls whose jump target has no host address yet
///
/// The call-address slot holds the direct-call token. The stub hands it to
/// `resolve_direct` and transfers control to whatever comes back. Publishing
/// the optimized target over the call site is the resolver's business.
pub fn build_direct_stub(tail_call: bool) -> JitResult<StubProgram> {
    let mut e = Emitter::new();

    let context = e.load_argument(0);
    let token = load_call_address(&mut e, context);

    let target = e.invoke(Routine::ResolveDirect, &[token]);
    emit_transfer(&mut e, target, tail_call);

    e.finish()
}

/// Stub used by indirect calls through a claimed dispatch-table entry
///
/// The call-address slot holds the entry address, and the entry's first
/// word holds the guest token. `resolve_indirect` may publish an optimized
/// target into the entry's host word; either way the stub calls the result.
pub fn build_indirect_stub(tail_call: bool) -> JitResult<StubProgram> {
    let mut e = Emitter::new();

    let context = e.load_argument(0);
    let entry = load_call_address(&mut e, context);
    let token = load_entry_token(&mut e, entry);

    let target = e.invoke(Routine::ResolveIndirect, &[token, entry]);
    emit_transfer(&mut e, target, tail_call);

    e.finish()
}

/// Load the call-address slot of the context in `context`
pub(crate) fn load_call_address(e: &mut Emitter, context: Operand) -> Operand {
    let offset = e.constant(CALL_ADDRESS_OFFSET as u64);
    let slot = e.add(context, offset);
    e.load(slot)
}

// The token is the first word of an entry, so the entry address is also the
// token address.
fn load_entry_token(e: &mut Emitter, entry: Operand) -> Operand {
    const _: () = assert!(DispatchEntry::GUEST_OFFSET == 0);
    e.load_atomic(entry)
}

/// Call or tail-call `target`, forwarding the incoming context unchanged
pub(crate) fn emit_transfer(e: &mut Emitter, target: Operand, tail_call: bool) {
    let context = e.load_argument(0);
    if tail_call {
        e.tail_call(target, context);
    } else {
        let result = e.call(target, context);
        e.ret(result);
    }
}
