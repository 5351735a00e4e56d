//! Integration tests for the call stubs running on the Cranelift backend

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;

use lazylink_core::callsite::{
    emit_direct_call, emit_direct_tail_call, emit_dispatch_call, emit_dispatch_tail_call,
};
use lazylink_core::{
    CallContext, CallStubs, CodeBackend, CompileSession, CraneliftBackend, DispatchEntry,
    DispatchTable, Emitter, GuestFunction, HostEntry, JitError, JitResult, LazylinkConfig,
    ResolutionService, RoutineTable, StubKind, StubProgram, StubVariant,
};

struct Harness {
    backend: Mutex<CraneliftBackend>,
    entry: HostEntry,
}

impl Harness {
    fn new() -> Self {
        let backend = CraneliftBackend::host().unwrap();
        let entry = backend.host_entry();
        Self {
            backend: Mutex::new(backend),
            entry,
        }
    }

    fn compile(&self, program: &StubProgram) -> GuestFunction {
        let mut backend = self.backend.lock().unwrap();
        let mut session = CompileSession::begin(&mut *backend).unwrap();
        session.compile(program, &RoutineTable::empty()).unwrap()
    }

    fn run(&self, function: GuestFunction, context: &mut CallContext) -> u64 {
        unsafe { self.entry.invoke(function, context) }
    }
}

/// `registers[0] + addend`
fn add_register_program(addend: u64) -> StubProgram {
    let mut e = Emitter::new();
    let ctx = e.load_argument(0);
    let r0 = e.load(ctx);
    let k = e.constant(addend);
    let sum = e.add(r0, k);
    e.ret(sum);
    e.finish().unwrap()
}

fn constant_program(value: u64) -> StubProgram {
    let mut e = Emitter::new();
    let c = e.constant(value);
    e.ret(c);
    e.finish().unwrap()
}

/// Fixed token-to-code directory that counts every resolution
#[derive(Default)]
struct Directory {
    targets: DashMap<u64, GuestFunction>,
    publish: bool,
    direct_calls: AtomicUsize,
    indirect_calls: AtomicUsize,
    last_token: AtomicU64,
    last_entry: AtomicU64,
}

impl Directory {
    fn with_targets(targets: &[(u64, GuestFunction)], publish: bool) -> Arc<Self> {
        let directory = Self {
            publish,
            ..Self::default()
        };
        for (token, target) in targets {
            directory.targets.insert(*token, *target);
        }
        Arc::new(directory)
    }

    fn lookup(&self, token: u64) -> GuestFunction {
        match self.targets.get(&token) {
            Some(target) => *target,
            None => panic!("unknown token {token:#x}"),
        }
    }
}

impl ResolutionService for Directory {
    fn resolve_direct(&self, token: u64) -> GuestFunction {
        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        self.last_token.store(token, Ordering::SeqCst);
        self.lookup(token)
    }

    fn resolve_indirect(&self, token: u64, entry: &DispatchEntry) -> GuestFunction {
        self.indirect_calls.fetch_add(1, Ordering::SeqCst);
        self.last_token.store(token, Ordering::SeqCst);
        self.last_entry.store(entry.address(), Ordering::SeqCst);
        let target = self.lookup(token);
        if self.publish {
            entry.publish(target);
        }
        target
    }
}

#[test]
fn test_stubs_are_built_once_and_stable() {
    let h = Harness::new();
    let directory = Directory::with_targets(&[], false);
    let stubs = CallStubs::build(&h.backend, directory).unwrap();

    {
        let backend = h.backend.lock().unwrap();
        assert_eq!(backend.compiled_count(), 4);
        assert!(!backend.has_scratch());
    }

    let all: Vec<GuestFunction> = StubVariant::ALL.iter().map(|v| stubs.stub(*v)).collect();
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert_ne!(a, b);
        }
    }
    assert_eq!(stubs.direct_call_stub(true), stubs.direct_call_stub(true));
    assert_eq!(stubs.indirect_call_stub(false), all[2]);
}

#[test]
fn test_direct_stub_call_forwards_context() {
    let h = Harness::new();
    let target = h.compile(&add_register_program(100));
    let directory = Directory::with_targets(&[(0x4000, target)], false);
    let stubs = CallStubs::build(&h.backend, directory.clone()).unwrap();

    for tail_call in [false, true] {
        let mut ctx = CallContext::new();
        ctx.registers[0] = 23;
        ctx.set_call_address(0x4000);

        let result = h.run(stubs.direct_call_stub(tail_call), &mut ctx);
        assert_eq!(result, 123, "tail_call = {tail_call}");
        assert_eq!(ctx.call_address(), 0x4000);
    }

    assert_eq!(directory.direct_calls.load(Ordering::SeqCst), 2);
    assert_eq!(directory.last_token.load(Ordering::SeqCst), 0x4000);
    assert_eq!(directory.indirect_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_direct_call_site_resolves_every_call() {
    let h = Harness::new();
    let target = h.compile(&add_register_program(1));
    let directory = Directory::with_targets(&[(0x4000, target)], false);
    let stubs = CallStubs::build(&h.backend, directory.clone()).unwrap();

    let mut e = Emitter::new();
    let ctx = e.load_argument(0);
    let result = emit_direct_call(&mut e, ctx, 0x4000, stubs.direct_call_stub(false));
    e.ret(result);
    let caller = h.compile(&e.finish().unwrap());

    let mut ctx = CallContext::new();
    for i in 0..3 {
        ctx.registers[0] = i;
        assert_eq!(h.run(caller, &mut ctx), i + 1);
    }
    // Direct stubs never patch the call site.
    assert_eq!(directory.direct_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_indirect_stub_receives_token_and_entry() {
    let h = Harness::new();
    let target = h.compile(&add_register_program(7));
    let directory = Directory::with_targets(&[(0x5000, target)], false);
    let stubs = CallStubs::build(&h.backend, directory.clone()).unwrap();

    let table = DispatchTable::new(16, stubs.indirect_call_stub(false));
    let entry = table.get(table.claim(0x5000).unwrap()).unwrap();

    for tail_call in [false, true] {
        let mut ctx = CallContext::new();
        ctx.registers[0] = 35;
        ctx.set_call_address(entry.address());

        assert_eq!(h.run(stubs.indirect_call_stub(tail_call), &mut ctx), 42);
    }

    assert_eq!(directory.indirect_calls.load(Ordering::SeqCst), 2);
    assert_eq!(directory.last_token.load(Ordering::SeqCst), 0x5000);
    assert_eq!(directory.last_entry.load(Ordering::SeqCst), entry.address());
    assert_eq!(entry.target(), stubs.indirect_call_stub(false));
}

#[test]
fn test_published_entry_skips_resolution() {
    let h = Harness::new();
    let target = h.compile(&add_register_program(100));
    let directory = Directory::with_targets(&[(0x5000, target)], true);
    let stubs = CallStubs::build(&h.backend, directory.clone()).unwrap();

    for tail_call in [false, true] {
        let table = DispatchTable::new(16, stubs.indirect_call_stub(tail_call));
        let entry = table.get(table.claim(0x5000).unwrap()).unwrap();

        let mut e = Emitter::new();
        let ctx = e.load_argument(0);
        if tail_call {
            emit_dispatch_tail_call(&mut e, ctx, entry);
        } else {
            let result = emit_dispatch_call(&mut e, ctx, entry);
            e.ret(result);
        }
        let caller = h.compile(&e.finish().unwrap());

        let before = directory.indirect_calls.load(Ordering::SeqCst);
        let mut ctx = CallContext::new();
        ctx.registers[0] = 1;

        assert_eq!(h.run(caller, &mut ctx), 101);
        assert_eq!(directory.indirect_calls.load(Ordering::SeqCst), before + 1);
        assert_eq!(entry.target(), target);

        ctx.registers[0] = 2;
        assert_eq!(h.run(caller, &mut ctx), 102);
        assert_eq!(h.run(caller, &mut ctx), 102);
        assert_eq!(directory.indirect_calls.load(Ordering::SeqCst), before + 1);
    }
}

#[test]
fn test_unpublished_entry_keeps_calling_stub() {
    let h = Harness::new();
    let target = h.compile(&constant_program(9));
    let directory = Directory::with_targets(&[(0x6000, target)], false);
    let stubs = CallStubs::build(&h.backend, directory.clone()).unwrap();

    let table = DispatchTable::new(4, stubs.indirect_call_stub(true));
    let entry = table.get(table.claim(0x6000).unwrap()).unwrap();

    let mut e = Emitter::new();
    let ctx = e.load_argument(0);
    emit_dispatch_tail_call(&mut e, ctx, entry);
    let caller = h.compile(&e.finish().unwrap());

    let mut ctx = CallContext::new();
    for _ in 0..3 {
        assert_eq!(h.run(caller, &mut ctx), 9);
    }
    assert_eq!(directory.indirect_calls.load(Ordering::SeqCst), 3);
    assert_eq!(entry.target(), stubs.indirect_call_stub(true));
}

/// Resolves one token to `bounce` a fixed number of times, then to `finish`,
/// recording how deep the native stack is at every resolution
struct Bouncer {
    remaining: AtomicU64,
    resolutions: AtomicU64,
    bounce: OnceLock<GuestFunction>,
    finish: OnceLock<GuestFunction>,
    lowest: AtomicUsize,
    highest: AtomicUsize,
}

impl Bouncer {
    fn new(bounces: u64) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU64::new(bounces),
            resolutions: AtomicU64::new(0),
            bounce: OnceLock::new(),
            finish: OnceLock::new(),
            lowest: AtomicUsize::new(usize::MAX),
            highest: AtomicUsize::new(0),
        })
    }

    fn stack_spread(&self) -> usize {
        self.highest.load(Ordering::SeqCst) - self.lowest.load(Ordering::SeqCst)
    }
}

impl ResolutionService for Bouncer {
    fn resolve_direct(&self, _token: u64) -> GuestFunction {
        let marker = 0_u8;
        let depth = std::hint::black_box(std::ptr::addr_of!(marker)) as usize;
        self.lowest.fetch_min(depth, Ordering::SeqCst);
        self.highest.fetch_max(depth, Ordering::SeqCst);
        self.resolutions.fetch_add(1, Ordering::SeqCst);

        let left = self.remaining.load(Ordering::SeqCst);
        let next = if left == 0 {
            &self.finish
        } else {
            self.remaining.store(left - 1, Ordering::SeqCst);
            &self.bounce
        };
        *next.get().expect("bouncer targets are compiled before running")
    }

    fn resolve_indirect(&self, token: u64, _entry: &DispatchEntry) -> GuestFunction {
        self.resolve_direct(token)
    }
}

const BOUNCE_TOKEN: u64 = 0xB0;

fn run_bouncer(bounces: u64, tail_call: bool) -> Arc<Bouncer> {
    let h = Harness::new();
    let bouncer = Bouncer::new(bounces);
    let stubs = CallStubs::build(&h.backend, bouncer.clone()).unwrap();

    let mut e = Emitter::new();
    let ctx = e.load_argument(0);
    let stub = stubs.direct_call_stub(tail_call);
    if tail_call {
        emit_direct_tail_call(&mut e, ctx, BOUNCE_TOKEN, stub);
    } else {
        let result = emit_direct_call(&mut e, ctx, BOUNCE_TOKEN, stub);
        e.ret(result);
    }
    let bounce = h.compile(&e.finish().unwrap());
    let finish = h.compile(&constant_program(99));
    bouncer.bounce.set(bounce).unwrap();
    bouncer.finish.set(finish).unwrap();

    let mut ctx = CallContext::new();
    assert_eq!(h.run(bounce, &mut ctx), 99);
    assert_eq!(bouncer.resolutions.load(Ordering::SeqCst), bounces + 1);
    bouncer
}

#[test]
fn test_tail_call_stub_keeps_stack_bounded() {
    let bouncer = run_bouncer(10_000, true);
    assert!(
        bouncer.stack_spread() < 4096,
        "stack grew by {} bytes over 10000 tail calls",
        bouncer.stack_spread()
    );
}

#[test]
fn test_nested_call_stub_grows_stack() {
    let bounces = 200;
    let bouncer = run_bouncer(bounces, false);
    // Every level keeps at least the caller's and the stub's frame records.
    assert!(bouncer.stack_spread() >= 16 * bounces as usize);
}

/// Cranelift backend that fails its nth compilation
struct FailingBackend {
    inner: CraneliftBackend,
    fail_at: usize,
    attempts: usize,
}

impl CodeBackend for FailingBackend {
    fn prepare(&mut self) -> JitResult<()> {
        self.inner.prepare()
    }

    fn compile(
        &mut self,
        program: &StubProgram,
        routines: &RoutineTable,
    ) -> JitResult<GuestFunction> {
        let attempt = self.attempts;
        self.attempts += 1;
        if attempt == self.fail_at {
            return Err(JitError::Cranelift("out of executable memory".to_string()));
        }
        self.inner.compile(program, routines)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

#[test]
fn test_construction_failure_names_variant() {
    let backend = Mutex::new(FailingBackend {
        inner: CraneliftBackend::host().unwrap(),
        fail_at: 3,
        attempts: 0,
    });
    let directory = Directory::with_targets(&[], false);

    match CallStubs::build(&backend, directory).unwrap_err() {
        JitError::StubConstruction { variant, source } => {
            assert_eq!(variant, StubVariant::new(StubKind::Indirect, true));
            assert!(matches!(*source, JitError::Cranelift(_)));
        }
        other => panic!("expected stub construction error, got {other}"),
    }

    let backend = backend.into_inner().unwrap();
    assert_eq!(backend.inner.compiled_count(), 3);
    assert!(!backend.inner.has_scratch());
}

#[test]
fn test_backend_from_config() {
    let config = LazylinkConfig::from_toml_str(
        r#"
        [backend]
        opt_level = "none"
        enable_verifier = true
        "#,
    )
    .unwrap();

    let backend = CraneliftBackend::new(&config.backend).unwrap();
    let h = Harness {
        entry: backend.host_entry(),
        backend: Mutex::new(backend),
    };

    let target = h.compile(&add_register_program(5));
    let directory = Directory::with_targets(&[(0x7000, target)], false);
    let stubs = CallStubs::build(&h.backend, directory).unwrap();

    let mut ctx = CallContext::new();
    ctx.registers[0] = 10;
    ctx.set_call_address(0x7000);
    assert_eq!(h.run(stubs.direct_call_stub(true), &mut ctx), 15);
}
