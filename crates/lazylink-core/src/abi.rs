//! Native calling convention shared by all generated code
//!
//! Every piece of generated code, whether a guest translation at any tier or
//! one of the call stubs, has the same shape:
//!
//! ```text
//! fn(call_context: i64) -> i64        (Cranelift `tail` calling convention)
//! ```
//!
//! The uniform shape is what lets a stub, a baseline translation and an
//! optimized translation sit in the same dispatch-table cell and be invoked
//! identically. The `tail` convention is used so stubs can replace their own
//! activation with `return_call_indirect`. Host code cannot call the `tail`
//! convention directly and enters generated code through a [`HostEntry`].

use std::fmt;
use std::mem::offset_of;
use std::ptr::NonNull;

/// Number of general-purpose register words in the call context
pub const REGISTER_COUNT: usize = 32;

/// Per-call context passed by address to every guest function and stub
///
/// Layout (all fields are machine words):
///
/// ```text
/// struct CallContext {
///     registers: [u64; 32],   // guest register file
///     call_address: u64,      // token or dispatch-entry address for stubs
///     user: u64,              // free for the embedding translator
/// }
/// ```
#[repr(C, align(16))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Guest general-purpose registers
    pub registers: [u64; REGISTER_COUNT],
    call_address: u64,
    /// Word reserved for the embedder
    pub user: u64,
}

/// Byte offset of the call-address slot inside [`CallContext`]
pub const CALL_ADDRESS_OFFSET: usize = offset_of!(CallContext, call_address);

impl CallContext {
    /// Create a zeroed call context
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registers: [0; REGISTER_COUNT],
            call_address: 0,
            user: 0,
        }
    }

    /// Current value of the call-address slot
    #[must_use]
    pub const fn call_address(&self) -> u64 {
        self.call_address
    }

    /// Fill the call-address slot before entering a stub
    pub fn set_call_address(&mut self, value: u64) {
        self.call_address = value;
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Address of finalized code conforming to the guest calling convention
///
/// Only backends mint these; the raw constructors are `unsafe` because the
/// type is a promise that calling the address with a call-context pointer
/// is sound.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GuestFunction(NonNull<u8>);

// Finalized code is never written again.
unsafe impl Send for GuestFunction {}
unsafe impl Sync for GuestFunction {}

impl GuestFunction {
    /// Wrap a code pointer, returning `None` for null
    ///
    /// # Safety
    /// `code` must point to finalized code with the guest signature, and the
    /// code must stay mapped for as long as the handle is used.
    pub unsafe fn from_raw(code: *const u8) -> Option<Self> {
        NonNull::new(code.cast_mut()).map(Self)
    }

    /// Wrap a code address held in a machine word
    ///
    /// # Safety
    /// Same contract as [`GuestFunction::from_raw`].
    pub unsafe fn from_address(address: u64) -> Option<Self> {
        Self::from_raw(address as usize as *const u8)
    }

    /// Raw code pointer
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Code address as a machine word, the form stored in dispatch entries
    #[must_use]
    pub fn address(self) -> u64 {
        self.0.as_ptr() as usize as u64
    }
}

impl fmt::Debug for GuestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestFunction({:#x})", self.address())
    }
}

/// Host-ABI signature of the entry trampoline
pub type HostEntryFn = unsafe extern "C" fn(u64, *mut CallContext) -> u64;

/// Trampoline that lets host code call into generated code
#[derive(Clone, Copy)]
pub struct HostEntry(HostEntryFn);

impl HostEntry {
    /// Wrap a finalized entry trampoline
    ///
    /// # Safety
    /// `code` must be a finalized function with the [`HostEntryFn`] signature
    /// that forwards its second argument to the code named by its first.
    pub unsafe fn from_raw(code: *const u8) -> Self {
        Self(std::mem::transmute::<*const u8, HostEntryFn>(code))
    }

    /// Call `function` with `context` and return its result
    ///
    /// # Safety
    /// The backend that produced `function` and this entry must still be
    /// alive, and every routine the call can reach must be sound to run.
    pub unsafe fn invoke(self, function: GuestFunction, context: &mut CallContext) -> u64 {
        (self.0)(function.address(), context)
    }
}

impl fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostEntry({:p})", self.0 as *const u8)
    }
}
