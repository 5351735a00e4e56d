//! Call-site emission for translated guest code
//!
//! A translated function calls another guest function in one of two ways:
//!
//! - direct: the target guest address is known at translation time. The
//!   token goes into the call-address slot and control passes to whatever
//!   currently serves that target (a direct stub until the target is
//!   compiled).
//! - indirect: the target is only known at run time and has a dispatch
//!   entry. The entry address goes into the slot and control passes to the
//!   entry's host word, atomically loaded.

use crate::abi::{GuestFunction, CALL_ADDRESS_OFFSET};
use crate::dispatch::DispatchEntry;
use crate::ir::{Emitter, Operand};

fn store_call_address(e: &mut Emitter, context: Operand, value: u64) {
    let offset = e.constant(CALL_ADDRESS_OFFSET as u64);
    let slot = e.add(context, offset);
    let value = e.constant(value);
    e.store(slot, value);
}

fn direct_target(e: &mut Emitter, context: Operand, token: u64, target: GuestFunction) -> Operand {
    store_call_address(e, context, token);
    e.constant(target.address())
}

fn dispatch_target(e: &mut Emitter, context: Operand, entry: &DispatchEntry) -> Operand {
    store_call_address(e, context, entry.address());
    let host_word = e.constant(entry.address() + DispatchEntry::HOST_OFFSET as u64);
    e.load_atomic(host_word)
}

/// Call `target` with `token` in the call-address slot and yield its result
pub fn emit_direct_call(
    e: &mut Emitter,
    context: Operand,
    token: u64,
    target: GuestFunction,
) -> Operand {
    let target = direct_target(e, context, token, target);
    e.call(target, context)
}

/// Tail-call `target` with `token` in the call-address slot
pub fn emit_direct_tail_call(e: &mut Emitter, context: Operand, token: u64, target: GuestFunction) {
    let target = direct_target(e, context, token, target);
    e.tail_call(target, context);
}

/// Call through `entry` and yield the result
pub fn emit_dispatch_call(e: &mut Emitter, context: Operand, entry: &DispatchEntry) -> Operand {
    let target = dispatch_target(e, context, entry);
    e.call(target, context)
}

/// Tail-call through `entry`
pub fn emit_dispatch_tail_call(e: &mut Emitter, context: Operand, entry: &DispatchEntry) {
    let target = dispatch_target(e, context, entry);
    e.tail_call(target, context);
}
