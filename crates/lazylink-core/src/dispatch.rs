//! Dispatch tables for indirect calls
//!
//! An indirect call site calls through the host word of a dispatch entry.
//! The word always holds callable code: initially the indirect stub, later
//! possibly an optimized translation published by the resolver.
//!
//! Layout: each entry is 16 bytes (2 x u64).
//!
//! ```text
//! struct DispatchEntry {
//!     guest: u64,   // guest target address, 0 while unclaimed
//!     host: u64,    // code to call; indirect stub or published target
//! }
//! ```
//!
//! Both words are atomics. Generated code reads the host word with an atomic
//! load and the resolver publishes with a single release store, so a racing
//! caller sees either the old or the new target, and the old one (the stub)
//! simply resolves again.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::abi::GuestFunction;
use crate::config::TieringConfig;
use crate::{JitError, JitResult};

/// One dispatch-table cell pair
#[repr(C, align(16))]
#[derive(Debug)]
pub struct DispatchEntry {
    guest: AtomicU64,
    host: AtomicU64,
}

impl DispatchEntry {
    /// Byte offset of the guest-address word
    pub const GUEST_OFFSET: usize = offset_of!(DispatchEntry, guest);

    /// Byte offset of the host-address word
    pub const HOST_OFFSET: usize = offset_of!(DispatchEntry, host);

    /// Guest word of an entry nobody has claimed
    pub const UNCLAIMED: u64 = 0;

    fn new(fallback: GuestFunction) -> Self {
        Self {
            guest: AtomicU64::new(Self::UNCLAIMED),
            host: AtomicU64::new(fallback.address()),
        }
    }

    /// Reinterpret an entry address handed to native code
    ///
    /// # Safety
    /// `address` must be the [`DispatchEntry::address`] of an entry whose
    /// table outlives `'a`.
    pub unsafe fn from_address<'a>(address: u64) -> &'a DispatchEntry {
        &*(address as usize as *const DispatchEntry)
    }

    /// Address of the entry, the value placed in the call-address slot
    #[must_use]
    pub fn address(&self) -> u64 {
        std::ptr::from_ref(self) as usize as u64
    }

    /// Guest address the entry was claimed for
    #[must_use]
    pub fn guest_address(&self) -> u64 {
        self.guest.load(Ordering::Acquire)
    }

    /// Current host word
    #[must_use]
    pub fn host_address(&self) -> u64 {
        self.host.load(Ordering::Acquire)
    }

    /// Code an indirect call through this entry would reach right now
    #[must_use]
    pub fn target(&self) -> GuestFunction {
        let address = self.host_address();
        // Safety: the host word is only ever written from a GuestFunction,
        // and it starts out as one.
        match unsafe { GuestFunction::from_address(address) } {
            Some(func) => func,
            None => unreachable!("dispatch entry host word is never null"),
        }
    }

    /// Replace the host word with `function` in one atomic store
    pub fn publish(&self, function: GuestFunction) {
        self.host.store(function.address(), Ordering::Release);
        debug!(
            entry = format_args!("{:#x}", self.address()),
            guest = format_args!("{:#x}", self.guest_address()),
            code = ?function,
            "published dispatch entry"
        );
    }
}

/// Fixed-capacity table of dispatch entries
///
/// Entries never move, so their addresses can be baked into generated code
/// for as long as the table lives.
#[derive(Debug)]
pub struct DispatchTable {
    entries: Box<[DispatchEntry]>,
    fallback: GuestFunction,
}

impl DispatchTable {
    /// Create a table whose every host word starts at `fallback`
    ///
    /// `fallback` is normally one of the indirect call stubs.
    #[must_use]
    pub fn new(capacity: usize, fallback: GuestFunction) -> Self {
        let entries = (0..capacity).map(|_| DispatchEntry::new(fallback)).collect();
        Self { entries, fallback }
    }

    /// Create a table sized by `[tiering] dispatch_capacity`
    #[must_use]
    pub fn from_config(config: &TieringConfig, fallback: GuestFunction) -> Self {
        Self::new(config.dispatch_capacity, fallback)
    }

    /// Number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Code unresolved entries call
    #[must_use]
    pub fn fallback(&self) -> GuestFunction {
        self.fallback
    }

    /// Entry by index
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&DispatchEntry> {
        self.entries.get(index)
    }

    fn probe(&self, guest: u64) -> impl Iterator<Item = usize> {
        let capacity = self.entries.len();
        // Fibonacci hashing spreads the aligned guest addresses.
        let start = if capacity == 0 {
            0
        } else {
            (guest.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % capacity
        };
        (0..capacity).map(move |i| (start + i) % capacity)
    }

    /// Claim an entry for `guest`, or return the one already claimed for it
    pub fn claim(&self, guest: u64) -> JitResult<usize> {
        if guest == DispatchEntry::UNCLAIMED {
            return Err(JitError::Translation {
                guest,
                reason: "guest address 0 is reserved for unclaimed entries".to_string(),
            });
        }

        for index in self.probe(guest) {
            let entry = &self.entries[index];
            match entry.guest.compare_exchange(
                DispatchEntry::UNCLAIMED,
                guest,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(index, guest = format_args!("{guest:#x}"), "claimed dispatch entry");
                    return Ok(index);
                }
                Err(existing) if existing == guest => return Ok(index),
                Err(_) => {}
            }
        }

        Err(JitError::DispatchTableFull {
            capacity: self.capacity(),
        })
    }

    /// Index of the entry claimed for `guest`
    #[must_use]
    pub fn lookup(&self, guest: u64) -> Option<usize> {
        self.probe(guest).find(|&index| {
            let claimed = self.entries[index].guest_address();
            claimed == guest && claimed != DispatchEntry::UNCLAIMED
        })
    }

    /// Claimed entries in index order
    pub fn claimed(&self) -> impl Iterator<Item = (usize, &DispatchEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.guest_address() != DispatchEntry::UNCLAIMED)
    }
}
