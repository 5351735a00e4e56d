//! Call stubs
//!
//! Four trampolines cover every unresolved call: {direct, indirect} x
//! {call, tail-call}. [`CallStubs`] builds all four in one compile session
//! while holding the backend lock, and afterwards hands out their addresses
//! without locking.

pub mod builder;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::abi::GuestFunction;
use crate::backend::{CodeBackend, CompileSession};
use crate::resolve::{ResolutionService, RoutineTable};
use crate::{JitError, JitResult};

/// How a stub finds its callee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubKind {
    /// The call-address slot holds the target token
    Direct,
    /// The call-address slot holds a dispatch-entry address
    Indirect,
}

/// One of the four stubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubVariant {
    pub kind: StubKind,
    pub tail_call: bool,
}

impl StubVariant {
    /// Every variant, in storage order
    pub const ALL: [StubVariant; 4] = [
        StubVariant::new(StubKind::Direct, false),
        StubVariant::new(StubKind::Direct, true),
        StubVariant::new(StubKind::Indirect, false),
        StubVariant::new(StubKind::Indirect, true),
    ];

    #[must_use]
    pub const fn new(kind: StubKind, tail_call: bool) -> Self {
        Self { kind, tail_call }
    }

    const fn slot(self) -> usize {
        let base = match self.kind {
            StubKind::Direct => 0,
            StubKind::Indirect => 2,
        };
        base + self.tail_call as usize
    }
}

impl fmt::Display for StubVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            StubKind::Direct => "direct",
            StubKind::Indirect => "indirect",
        };
        let transfer = if self.tail_call { "tail-call" } else { "call" };
        write!(f, "{kind} {transfer}")
    }
}

/// The four compiled call stubs
///
/// Immutable once built. The stubs call back into the resolution service
/// bound at construction, which this value keeps alive; the backend that
/// compiled them must outlive every call through them.
#[derive(Debug)]
pub struct CallStubs {
    stubs: [GuestFunction; 4],
    routines: RoutineTable,
}

impl CallStubs {
    /// Build all four stubs, holding the backend lock for the whole batch
    pub fn build<B: CodeBackend + ?Sized>(
        backend: &Mutex<B>,
        service: Arc<dyn ResolutionService>,
    ) -> JitResult<Self> {
        let mut backend = backend.lock().unwrap_or_else(PoisonError::into_inner);
        Self::build_with(&mut *backend, service)
    }

    /// Build all four stubs on a backend the caller already has exclusive
    /// access to
    ///
    /// Any failure is a [`JitError::StubConstruction`]; no partial set of
    /// stubs is ever returned.
    pub fn build_with<B: CodeBackend + ?Sized>(
        backend: &mut B,
        service: Arc<dyn ResolutionService>,
    ) -> JitResult<Self> {
        let routines = RoutineTable::for_service(service);
        let mut session = CompileSession::begin(backend)?;

        let mut compile = |variant: StubVariant| -> JitResult<GuestFunction> {
            let stub = builder::build_stub(variant)
                .and_then(|program| session.compile(&program, &routines))
                .map_err(|source| JitError::StubConstruction {
                    variant,
                    source: Box::new(source),
                })?;
            debug!(%variant, code = ?stub, "compiled call stub");
            Ok(stub)
        };

        let [a, b, c, d] = StubVariant::ALL;
        let stubs = [compile(a)?, compile(b)?, compile(c)?, compile(d)?];
        drop(session);

        info!(
            direct = ?stubs[0],
            direct_tail = ?stubs[1],
            indirect = ?stubs[2],
            indirect_tail = ?stubs[3],
            "call stubs ready"
        );

        Ok(Self { stubs, routines })
    }

    /// Stub for a direct call whose target has no host address yet
    #[must_use]
    pub fn direct_call_stub(&self, tail_call: bool) -> GuestFunction {
        self.stub(StubVariant::new(StubKind::Direct, tail_call))
    }

    /// Stub for an indirect call through a dispatch entry
    #[must_use]
    pub fn indirect_call_stub(&self, tail_call: bool) -> GuestFunction {
        self.stub(StubVariant::new(StubKind::Indirect, tail_call))
    }

    #[must_use]
    pub fn stub(&self, variant: StubVariant) -> GuestFunction {
        self.stubs[variant.slot()]
    }

    /// Routine bindings the stubs were compiled against
    #[must_use]
    pub fn routines(&self) -> &RoutineTable {
        &self.routines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Event, RecordingBackend};
    use crate::dispatch::DispatchEntry;
    use crate::ir::Routine;

    struct Unreachable;

    impl ResolutionService for Unreachable {
        fn resolve_direct(&self, _token: u64) -> GuestFunction {
            unreachable!("stubs are never run by the recording backend")
        }

        fn resolve_indirect(&self, _token: u64, _entry: &DispatchEntry) -> GuestFunction {
            unreachable!("stubs are never run by the recording backend")
        }
    }

    #[test]
    fn slots_follow_all_order() {
        for (i, variant) in StubVariant::ALL.iter().enumerate() {
            assert_eq!(variant.slot(), i);
        }
    }

    #[test]
    fn variant_display() {
        assert_eq!(StubVariant::new(StubKind::Direct, false).to_string(), "direct call");
        assert_eq!(StubVariant::new(StubKind::Indirect, true).to_string(), "indirect tail-call");
    }

    #[test]
    fn builds_four_stubs_in_one_session() {
        let backend = Mutex::new(RecordingBackend::default());
        let stubs = CallStubs::build(&backend, Arc::new(Unreachable)).unwrap();

        let backend = backend.into_inner().unwrap();
        assert_eq!(
            backend.events,
            vec![
                Event::Prepare,
                Event::Compile(0),
                Event::Compile(1),
                Event::Compile(2),
                Event::Compile(3),
                Event::Reset,
                Event::Dispose,
            ]
        );

        let routines: Vec<Routine> = backend.programs.iter().flat_map(|p| p.routines()).collect();
        assert_eq!(
            routines,
            vec![
                Routine::ResolveDirect,
                Routine::ResolveDirect,
                Routine::ResolveIndirect,
                Routine::ResolveIndirect,
            ]
        );
        assert!(stubs.routines().service().is_some());
    }

    #[test]
    fn accessors_are_stable_and_distinct() {
        let backend = Mutex::new(RecordingBackend::default());
        let stubs = CallStubs::build(&backend, Arc::new(Unreachable)).unwrap();

        let all: Vec<GuestFunction> = StubVariant::ALL.iter().map(|v| stubs.stub(*v)).collect();
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.address(), 0);
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }

        for _ in 0..3 {
            assert_eq!(stubs.direct_call_stub(false), all[0]);
            assert_eq!(stubs.direct_call_stub(true), all[1]);
            assert_eq!(stubs.indirect_call_stub(false), all[2]);
            assert_eq!(stubs.indirect_call_stub(true), all[3]);
        }
    }

    #[test]
    fn construction_failure_is_reported_and_releases_scratch() {
        let mut backend = RecordingBackend {
            fail_on_compile: Some(2),
            ..RecordingBackend::default()
        };

        let err = CallStubs::build_with(&mut backend, Arc::new(Unreachable)).unwrap_err();
        match err {
            JitError::StubConstruction { variant, .. } => {
                assert_eq!(variant, StubVariant::new(StubKind::Indirect, false));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(
            &backend.events[backend.events.len() - 2..],
            &[Event::Reset, Event::Dispose]
        );
        assert!(!backend.events.contains(&Event::Compile(3)));
    }

    #[test]
    fn prepare_failure_aborts_construction() {
        let mut backend = RecordingBackend {
            fail_prepare: true,
            ..RecordingBackend::default()
        };
        assert!(CallStubs::build_with(&mut backend, Arc::new(Unreachable)).is_err());
        assert_eq!(backend.events, vec![Event::Prepare, Event::Dispose]);
    }
}
