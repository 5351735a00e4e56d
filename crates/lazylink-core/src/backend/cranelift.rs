//! Cranelift JIT backend
//!
//! Lowers [`StubProgram`]s to native code with Cranelift and keeps the code
//! in a `JITModule`, which never unmaps finalized functions:
//!
//! ```text
//! StubProgram → Cranelift IR → native code → GuestFunction
//! ```
//!
//! The backend also owns the host entry trampoline, a host-ABI function that
//! calls guest-ABI code on behalf of Rust.

use std::sync::Arc;

use cranelift_codegen::ir::{InstBuilder, Signature, UserFuncName, Value};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use target_lexicon::PointerWidth;
use tracing::debug;

use crate::abi::{GuestFunction, HostEntry};
use crate::config::BackendConfig;
use crate::ir::{Op, Operand, StubProgram};
use crate::resolve::RoutineTable;
use crate::{JitError, JitResult};

use super::types::{self, mem_flags, CraneliftTypes};
use super::CodeBackend;

/// Function-building scratch space, reused between compilations
struct Scratch {
    ctx: Context,
    builder_ctx: FunctionBuilderContext,
}

impl Scratch {
    fn new() -> Self {
        Self {
            ctx: Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
        }
    }
}

/// Native code generator for the host machine
pub struct CraneliftBackend {
    /// The Cranelift JIT module; doubles as the code cache
    module: JITModule,

    /// Target ISA for code generation
    isa: Arc<dyn TargetIsa>,

    /// Scratch space, present between prepare and dispose
    scratch: Option<Scratch>,

    /// Trampoline for entering generated code from Rust
    host_entry: HostEntry,

    /// Number of programs compiled so far
    compiled: usize,
}

// The module is only reachable through `&mut self`, and finalized code is
// immutable.
unsafe impl Send for CraneliftBackend {}

impl CraneliftBackend {
    /// Create a backend for the host machine
    pub fn new(config: &BackendConfig) -> JitResult<Self> {
        let mut flag_builder = settings::builder();
        let verifier = if config.enable_verifier { "true" } else { "false" };
        for (name, value) in [
            ("opt_level", config.opt_level.as_setting()),
            ("is_pic", "false"),
            ("enable_verifier", verifier),
            // x64 `return_call` lowering relies on frame pointers
            ("preserve_frame_pointers", "true"),
        ] {
            flag_builder
                .set(name, value)
                .map_err(|e| JitError::Cranelift(e.to_string()))?;
        }

        let isa_builder =
            cranelift_native::builder().map_err(|msg| JitError::UnsupportedHost(msg.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Cranelift(e.to_string()))?;

        match isa.triple().pointer_width() {
            Ok(PointerWidth::U64) => {}
            other => {
                return Err(JitError::UnsupportedHost(format!(
                    "{} has pointer width {:?}, need 64 bits",
                    isa.triple(),
                    other
                )))
            }
        }

        let jit_builder = JITBuilder::with_isa(isa.clone(), cranelift_module::default_libcall_names());
        let mut module = JITModule::new(jit_builder);

        let mut scratch = Scratch::new();
        let entry = define_function(
            &mut module,
            &mut scratch,
            types::host_entry_signature(isa.default_call_conv()),
            lower_host_entry,
        )?;
        // Safety: lower_host_entry builds exactly the HostEntryFn shape.
        let host_entry = unsafe { HostEntry::from_raw(entry) };

        debug!(triple = %isa.triple(), opt_level = config.opt_level.as_setting(), "cranelift backend ready");

        Ok(Self {
            module,
            isa,
            scratch: None,
            host_entry,
            compiled: 0,
        })
    }

    /// Backend with the default configuration
    pub fn host() -> JitResult<Self> {
        Self::new(&BackendConfig::default())
    }

    /// Trampoline for calling generated code from Rust
    #[must_use]
    pub fn host_entry(&self) -> HostEntry {
        self.host_entry
    }

    /// Target ISA in use
    #[must_use]
    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    /// Number of programs compiled (the entry trampoline not included)
    #[must_use]
    pub fn compiled_count(&self) -> usize {
        self.compiled
    }

    /// Whether scratch compilation resources are currently held
    #[must_use]
    pub fn has_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}

impl CodeBackend for CraneliftBackend {
    fn prepare(&mut self) -> JitResult<()> {
        self.scratch.get_or_insert_with(Scratch::new);
        Ok(())
    }

    fn compile(
        &mut self,
        program: &StubProgram,
        routines: &RoutineTable,
    ) -> JitResult<GuestFunction> {
        let call_conv = self.isa.default_call_conv();
        let scratch = self.scratch.get_or_insert_with(Scratch::new);

        let code = define_function(&mut self.module, scratch, types::guest_signature(), |builder| {
            lower_program(builder, program, routines, call_conv)
        })?;

        // Safety: the code was just finalized with the guest signature.
        let function = unsafe { GuestFunction::from_raw(code) }
            .ok_or_else(|| JitError::Cranelift("finalized function has no address".to_string()))?;

        self.compiled += 1;
        debug!(
            instructions = program.instructions().len(),
            tail_call = program.ends_in_tail_call(),
            code = ?function,
            "compiled program"
        );
        Ok(function)
    }

    fn reset(&mut self) {
        if let Some(scratch) = self.scratch.as_mut() {
            self.module.clear_context(&mut scratch.ctx);
            scratch.builder_ctx = FunctionBuilderContext::new();
        }
    }

    fn dispose(&mut self) {
        self.scratch = None;
    }
}

/// Declare, build, define and finalize one anonymous function
fn define_function(
    module: &mut JITModule,
    scratch: &mut Scratch,
    signature: Signature,
    lower: impl FnOnce(&mut FunctionBuilder<'_>) -> JitResult<()>,
) -> JitResult<*const u8> {
    let func_id = module
        .declare_anonymous_function(&signature)
        .map_err(|e| JitError::Cranelift(e.to_string()))?;

    scratch.ctx.func.signature = signature;
    scratch.ctx.func.name = UserFuncName::user(0, func_id.as_u32());

    let lowered = {
        let mut builder = FunctionBuilder::new(&mut scratch.ctx.func, &mut scratch.builder_ctx);
        let lowered = lower(&mut builder);
        if lowered.is_ok() {
            builder.finalize();
        }
        lowered
    };
    if let Err(error) = lowered {
        module.clear_context(&mut scratch.ctx);
        scratch.builder_ctx = FunctionBuilderContext::new();
        return Err(error);
    }

    let defined = module.define_function(func_id, &mut scratch.ctx);
    module.clear_context(&mut scratch.ctx);
    defined.map_err(|e| JitError::Cranelift(e.to_string()))?;

    module
        .finalize_definitions()
        .map_err(|e| JitError::Cranelift(e.to_string()))?;

    Ok(module.get_finalized_function(func_id))
}

/// `(code, context) -> code(context)` in the host calling convention
fn lower_host_entry(builder: &mut FunctionBuilder<'_>) -> JitResult<()> {
    let block = builder.create_block();
    builder.append_block_params_for_function_params(block);
    builder.switch_to_block(block);
    builder.seal_block(block);

    let code = builder.block_params(block)[0];
    let context = builder.block_params(block)[1];

    let sig_ref = builder.import_signature(types::guest_signature());
    let call = builder.ins().call_indirect(sig_ref, code, &[context]);
    let result = builder.inst_results(call)[0];
    builder.ins().return_(&[result]);

    Ok(())
}

fn operand(values: &[Option<Value>], operand: Operand) -> JitResult<Value> {
    values
        .get(operand.index())
        .copied()
        .flatten()
        .ok_or_else(|| JitError::InvalidProgram(format!("{operand} has no value")))
}

/// Translate a straight-line program into a single Cranelift block
fn lower_program(
    builder: &mut FunctionBuilder<'_>,
    program: &StubProgram,
    routines: &RoutineTable,
    host_call_conv: CallConv,
) -> JitResult<()> {
    let block = builder.create_block();
    builder.append_block_params_for_function_params(block);
    builder.switch_to_block(block);
    builder.seal_block(block);

    let guest_sig = builder.import_signature(types::guest_signature());
    let mut values: Vec<Option<Value>> = Vec::with_capacity(program.instructions().len());

    for op in program.instructions() {
        let value = match op {
            Op::Argument(index) => {
                let param = builder.block_params(block).get(*index).copied();
                Some(param.ok_or_else(|| {
                    JitError::InvalidProgram(format!("argument {index} does not exist"))
                })?)
            }
            Op::Const(constant) => Some(builder.ins().iconst(CraneliftTypes::WORD, *constant as i64)),
            Op::Add(lhs, rhs) => {
                let lhs = operand(&values, *lhs)?;
                let rhs = operand(&values, *rhs)?;
                Some(builder.ins().iadd(lhs, rhs))
            }
            Op::Load(address) => {
                let address = operand(&values, *address)?;
                Some(builder.ins().load(CraneliftTypes::WORD, mem_flags::aligned(), address, 0))
            }
            Op::LoadAtomic(address) => {
                let address = operand(&values, *address)?;
                Some(builder.ins().atomic_load(CraneliftTypes::WORD, mem_flags::aligned(), address))
            }
            Op::Store { address, value } => {
                let address = operand(&values, *address)?;
                let value = operand(&values, *value)?;
                builder.ins().store(mem_flags::aligned(), value, address, 0);
                None
            }
            Op::StoreAtomic { address, value } => {
                let address = operand(&values, *address)?;
                let value = operand(&values, *value)?;
                builder.ins().atomic_store(mem_flags::aligned(), value, address);
                None
            }
            Op::Invoke { routine, args } => {
                let host = routines.bind(*routine)?;
                let sig_ref =
                    builder.import_signature(types::routine_signature(host_call_conv, host.arity));

                let callee = builder.ins().iconst(CraneliftTypes::WORD, host.entry as i64);
                let env = builder.ins().iconst(CraneliftTypes::WORD, host.env as i64);
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(env);
                for arg in args {
                    call_args.push(operand(&values, *arg)?);
                }

                let call = builder.ins().call_indirect(sig_ref, callee, &call_args);
                Some(builder.inst_results(call)[0])
            }
            Op::Call { target, context } => {
                let target = operand(&values, *target)?;
                let context = operand(&values, *context)?;
                let call = builder.ins().call_indirect(guest_sig, target, &[context]);
                Some(builder.inst_results(call)[0])
            }
            Op::TailCall { target, context } => {
                let target = operand(&values, *target)?;
                let context = operand(&values, *context)?;
                builder.ins().return_call_indirect(guest_sig, target, &[context]);
                None
            }
            Op::Return(value) => {
                let value = operand(&values, *value)?;
                builder.ins().return_(&[value]);
                None
            }
        };
        values.push(value);
    }

    Ok(())
}
