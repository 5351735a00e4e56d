//! Linear IR for stub and call-site bodies
//!
//! Stub bodies are straight-line code: load the context, compute an address,
//! call out to a routine, transfer control. The IR mirrors that and nothing
//! more. Every instruction occupies one slot; instructions that produce a
//! value are referred to by the [`Operand`] of their slot.
//!
//! ```text
//! v0 = arg 0
//! v1 = const 0x100
//! v2 = add v0, v1
//! v3 = load v2
//! v4 = invoke resolve_direct(v3)
//!      tail_call v4(v0)
//! ```

use std::fmt;

use crate::{JitError, JitResult};

/// Value produced by an earlier instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand(u32);

impl Operand {
    /// Slot index of the producing instruction
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A host function callable from generated code
///
/// The function has the host C ABI and the shape
/// `extern "C" fn(env: u64, args: u64...) -> u64` with `arity` trailing
/// arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRoutine {
    /// Address of the `extern "C"` function
    pub entry: usize,
    /// Environment word passed as the first argument
    pub env: usize,
    /// Number of arguments after `env`
    pub arity: usize,
}

/// Routine invoked by an [`Op::Invoke`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Routine {
    /// `resolve_direct(token) -> address`
    ResolveDirect,
    /// `resolve_indirect(token, entry_address) -> address`
    ResolveIndirect,
    /// Any other host function
    Host(HostRoutine),
}

impl Routine {
    /// Number of arguments the routine takes, not counting its environment
    #[must_use]
    pub const fn arity(&self) -> usize {
        match self {
            Routine::ResolveDirect => 1,
            Routine::ResolveIndirect => 2,
            Routine::Host(host) => host.arity,
        }
    }

    /// Short name used in diagnostics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Routine::ResolveDirect => "resolve_direct",
            Routine::ResolveIndirect => "resolve_indirect",
            Routine::Host(_) => "host",
        }
    }
}

/// A single IR instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Function argument by position
    Argument(usize),
    /// 64-bit constant
    Const(u64),
    /// Wrapping 64-bit add
    Add(Operand, Operand),
    /// Plain word load
    Load(Operand),
    /// Word load that cannot observe a torn value
    LoadAtomic(Operand),
    /// Plain word store
    Store { address: Operand, value: Operand },
    /// Single atomic word store
    StoreAtomic { address: Operand, value: Operand },
    /// Call a host routine
    Invoke { routine: Routine, args: Vec<Operand> },
    /// Nested call of guest-ABI code
    Call { target: Operand, context: Operand },
    /// Replace the current activation with a call of guest-ABI code
    TailCall { target: Operand, context: Operand },
    /// Return a value to the caller
    Return(Operand),
}

impl Op {
    /// Whether later instructions may refer to this one's result
    #[must_use]
    pub fn produces_value(&self) -> bool {
        !matches!(
            self,
            Op::Store { .. } | Op::StoreAtomic { .. } | Op::TailCall { .. } | Op::Return(_)
        )
    }

    /// Whether the instruction ends the body
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::TailCall { .. } | Op::Return(_))
    }

    /// Operands read by the instruction
    #[must_use]
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Op::Argument(_) | Op::Const(_) => Vec::new(),
            Op::Load(a) | Op::LoadAtomic(a) | Op::Return(a) => vec![*a],
            Op::Add(a, b) => vec![*a, *b],
            Op::Store { address, value } | Op::StoreAtomic { address, value } => {
                vec![*address, *value]
            }
            Op::Invoke { args, .. } => args.clone(),
            Op::Call { target, context } | Op::TailCall { target, context } => {
                vec![*target, *context]
            }
        }
    }
}

/// Incremental builder for a [`StubProgram`]
///
/// Emission is pure: the same sequence of calls always yields the same
/// program. Structural checks are deferred to [`Emitter::finish`].
#[derive(Debug, Default)]
pub struct Emitter {
    insts: Vec<Op>,
}

impl Emitter {
    /// Create an empty emitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, op: Op) -> Operand {
        let operand = Operand(self.insts.len() as u32);
        self.insts.push(op);
        operand
    }

    /// Load a function argument; guest-ABI code has exactly one
    pub fn load_argument(&mut self, index: usize) -> Operand {
        self.push(Op::Argument(index))
    }

    /// Materialize a constant
    pub fn constant(&mut self, value: u64) -> Operand {
        self.push(Op::Const(value))
    }

    pub fn add(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        self.push(Op::Add(lhs, rhs))
    }

    pub fn load(&mut self, address: Operand) -> Operand {
        self.push(Op::Load(address))
    }

    pub fn load_atomic(&mut self, address: Operand) -> Operand {
        self.push(Op::LoadAtomic(address))
    }

    pub fn store(&mut self, address: Operand, value: Operand) {
        self.push(Op::Store { address, value });
    }

    pub fn store_atomic(&mut self, address: Operand, value: Operand) {
        self.push(Op::StoreAtomic { address, value });
    }

    /// Call a host routine and yield its result
    pub fn invoke(&mut self, routine: Routine, args: &[Operand]) -> Operand {
        self.push(Op::Invoke {
            routine,
            args: args.to_vec(),
        })
    }

    /// Nested call of guest-ABI code
    pub fn call(&mut self, target: Operand, context: Operand) -> Operand {
        self.push(Op::Call { target, context })
    }

    /// Tail call of guest-ABI code; ends the body
    pub fn tail_call(&mut self, target: Operand, context: Operand) {
        self.push(Op::TailCall { target, context });
    }

    /// Return a value; ends the body
    pub fn ret(&mut self, value: Operand) {
        self.push(Op::Return(value));
    }

    /// Validate and seal the program
    pub fn finish(self) -> JitResult<StubProgram> {
        let program = StubProgram { insts: self.insts };
        program.validate()?;
        Ok(program)
    }
}

/// A finished, validated straight-line body with the guest signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubProgram {
    insts: Vec<Op>,
}

impl StubProgram {
    /// Instructions in emission order
    #[must_use]
    pub fn instructions(&self) -> &[Op] {
        &self.insts
    }

    /// Routines invoked by the program, in order
    pub fn routines(&self) -> impl Iterator<Item = Routine> + '_ {
        self.insts.iter().filter_map(|op| match op {
            Op::Invoke { routine, .. } => Some(*routine),
            _ => None,
        })
    }

    /// Whether the program leaves through a tail call
    #[must_use]
    pub fn ends_in_tail_call(&self) -> bool {
        matches!(self.insts.last(), Some(Op::TailCall { .. }))
    }

    fn validate(&self) -> JitResult<()> {
        let Some(last) = self.insts.last() else {
            return Err(JitError::InvalidProgram("empty program".to_string()));
        };
        if !last.is_terminator() {
            return Err(JitError::InvalidProgram(
                "program does not end in return or tail call".to_string(),
            ));
        }

        for (slot, op) in self.insts.iter().enumerate() {
            if op.is_terminator() && slot + 1 != self.insts.len() {
                return Err(JitError::InvalidProgram(format!(
                    "instruction after terminator at v{slot}"
                )));
            }

            for operand in op.operands() {
                let producer = self.insts.get(operand.index());
                let valid = operand.index() < slot && producer.is_some_and(Op::produces_value);
                if !valid {
                    return Err(JitError::InvalidProgram(format!(
                        "v{slot} reads {operand}, which is not an earlier value"
                    )));
                }
            }

            match op {
                Op::Argument(index) if *index != 0 => {
                    return Err(JitError::InvalidProgram(format!(
                        "argument {index} does not exist in the guest signature"
                    )));
                }
                Op::Invoke { routine, args } if routine.arity() != args.len() => {
                    return Err(JitError::InvalidProgram(format!(
                        "{} expects {} arguments, got {}",
                        routine.name(),
                        routine.arity(),
                        args.len()
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl fmt::Display for StubProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (slot, op) in self.insts.iter().enumerate() {
            let dest = Operand(slot as u32);
            match op {
                Op::Argument(i) => writeln!(f, "{dest} = arg {i}")?,
                Op::Const(c) => writeln!(f, "{dest} = const {c:#x}")?,
                Op::Add(a, b) => writeln!(f, "{dest} = add {a}, {b}")?,
                Op::Load(a) => writeln!(f, "{dest} = load {a}")?,
                Op::LoadAtomic(a) => writeln!(f, "{dest} = load.atomic {a}")?,
                Op::Store { address, value } => writeln!(f, "     store {value}, {address}")?,
                Op::StoreAtomic { address, value } => {
                    writeln!(f, "     store.atomic {value}, {address}")?;
                }
                Op::Invoke { routine, args } => {
                    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                    writeln!(f, "{dest} = invoke {}({})", routine.name(), args.join(", "))?;
                }
                Op::Call { target, context } => writeln!(f, "{dest} = call {target}({context})")?,
                Op::TailCall { target, context } => {
                    writeln!(f, "     tail_call {target}({context})")?;
                }
                Op::Return(v) => writeln!(f, "     return {v}")?,
            }
        }
        Ok(())
    }
}
