//! Resolution Service seam
//!
//! Stubs call back into the host to turn a call token into code. This module
//! defines the trait the host implements and the `extern "C"` shims native
//! code actually calls:
//!
//! - `resolve_direct(env, token) -> address`
//! - `resolve_indirect(env, token, entry_address) -> address`
//!
//! The environment word points at a [`RoutineEnv`] owned by a
//! [`RoutineTable`], which in turn is kept alive by whoever owns the stubs.

mod tiered;

pub use tiered::{
    CallCountPolicy, GuestTranslator, NeverPromote, PromotionPolicy, Tier, TieredResolver,
};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::abi::GuestFunction;
use crate::dispatch::DispatchEntry;
use crate::ir::{HostRoutine, Routine};
use crate::{JitError, JitResult};

/// Produces callable code for call tokens
///
/// Implementations must tolerate concurrent calls for the same token; at
/// worst work is duplicated. A failure to resolve is fatal and should be
/// reported by panicking, which aborts the process at the native boundary.
pub trait ResolutionService: Send + Sync {
    /// Resolve a direct-call token, compiling on demand
    fn resolve_direct(&self, token: u64) -> GuestFunction;

    /// Resolve the token stored in `entry`
    ///
    /// May publish the result into `entry` when it is worth caching; the
    /// publication must be a single atomic store ([`DispatchEntry::publish`]).
    fn resolve_indirect(&self, token: u64, entry: &DispatchEntry) -> GuestFunction;
}

/// Environment handed to the resolution shims
pub struct RoutineEnv {
    service: Arc<dyn ResolutionService>,
}

/// Binds the symbolic routines in IR programs to host functions
#[derive(Clone, Default)]
pub struct RoutineTable {
    env: Option<Arc<RoutineEnv>>,
}

impl RoutineTable {
    /// A table that only accepts [`Routine::Host`]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A table whose resolution routines call into `service`
    #[must_use]
    pub fn for_service(service: Arc<dyn ResolutionService>) -> Self {
        Self {
            env: Some(Arc::new(RoutineEnv { service })),
        }
    }

    /// The bound service, if any
    #[must_use]
    pub fn service(&self) -> Option<&Arc<dyn ResolutionService>> {
        self.env.as_ref().map(|env| &env.service)
    }

    /// Concrete host function for `routine`
    pub fn bind(&self, routine: Routine) -> JitResult<HostRoutine> {
        let entry = match routine {
            Routine::Host(host) => return Ok(host),
            Routine::ResolveDirect => resolve_direct_shim as usize,
            Routine::ResolveIndirect => resolve_indirect_shim as usize,
        };
        let env = self
            .env
            .as_ref()
            .ok_or(JitError::UnboundRoutine(routine.name()))?;

        Ok(HostRoutine {
            entry,
            env: Arc::as_ptr(env) as usize,
            arity: routine.arity(),
        })
    }
}

impl fmt::Debug for RoutineTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutineTable")
            .field("bound", &self.env.is_some())
            .finish()
    }
}

unsafe extern "C" fn resolve_direct_shim(env: u64, token: u64) -> u64 {
    let env = &*(env as usize as *const RoutineEnv);
    resolve_or_abort(Routine::ResolveDirect, token, || {
        env.service.resolve_direct(token)
    })
    .address()
}

unsafe extern "C" fn resolve_indirect_shim(env: u64, token: u64, entry: u64) -> u64 {
    let env = &*(env as usize as *const RoutineEnv);
    let entry = DispatchEntry::from_address(entry);
    resolve_or_abort(Routine::ResolveIndirect, token, || {
        env.service.resolve_indirect(token, entry)
    })
    .address()
}

// Unwinding into generated frames is undefined, and stubs have nowhere to
// report failure to.
fn resolve_or_abort(
    routine: Routine,
    token: u64,
    resolve: impl FnOnce() -> GuestFunction,
) -> GuestFunction {
    match panic::catch_unwind(AssertUnwindSafe(resolve)) {
        Ok(function) => {
            trace!(
                routine = routine.name(),
                token = format_args!("{token:#x}"),
                code = ?function,
                "resolved call"
            );
            function
        }
        Err(payload) => {
            error!(
                routine = routine.name(),
                token = format_args!("{token:#x}"),
                reason = panic_message(payload.as_ref()),
                "call resolution failed; aborting"
            );
            std::process::abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
