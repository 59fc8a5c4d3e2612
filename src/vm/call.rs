//! Call protocol.
//!
//! Activation storage is the engine's value stack. A call site leaves
//! `[this, args...]` on top of the stack; the callee's frame is built in
//! place around those slots:
//!
//! ```text
//! base -> this
//!         arg 0 .. arg n-1     (padded with undefined up to the formal count)
//!         local 0 .. local k-1 (start uninitialized)
//!         operands...
//! ```
//!
//! Whatever happens inside, the callee consumes every slot from `base` up and
//! returns an owned result.

use std::rc::Rc;

use log::trace;

use super::builtins;
use super::engine::Engine;
use super::error::{ErrorKind, FatalError, VmResult};
use super::heap::{BuiltinId, ObjectClass, Proto};
use super::value::Value;

/// Per-call bookkeeping for an interpreted function.
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    pub func: u32,
    /// Stack index of `this`. Arguments follow.
    pub base: usize,
    /// Number of arguments actually passed
    pub argc: usize,
    pub locals: usize,
    pub operands: usize,
    /// Current environment (owned)
    pub env: Value,
    /// Materialized arguments object (owned), or NONE
    pub arguments: Value,
    /// Function object being run (owned), or NONE for raw code references
    pub callee: Value,
    pub strict: bool,
    pub uses_arguments: bool,
}

impl Activation {
    pub fn arg_slot(&self, i: usize) -> Option<usize> {
        let slot = self.base + 1 + i;
        (slot < self.locals).then_some(slot)
    }
}

enum Target {
    Interpreted { func: u32, env: Value },
    Native(u16),
}

impl Engine {
    fn resolve(&mut self, callee: Value) -> VmResult<Target> {
        if let Some(func) = callee.as_function() {
            return Ok(Target::Interpreted {
                func,
                env: Value::UNDEFINED,
            });
        }
        if let Some(obj) = callee.as_object()
            && let Some(info) = self.heap.function_info(obj)
        {
            return Ok(if info.native {
                Target::Native(info.code as u16)
            } else {
                Target::Interpreted {
                    func: info.code,
                    env: info.env,
                }
            });
        }
        let what = super::arith::type_of(&self.heap, callee);
        Err(self.throw_error(ErrorKind::TypeError, format!("{} is not a function", what)))
    }

    /// Call `callee` with a fresh copy of `this` and `args` pushed onto the
    /// stack. The result is owned by the caller.
    pub fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> VmResult<Value> {
        let base = self.stack.len();
        self.push(this);
        for &arg in args {
            self.push(arg);
        }
        self.invoke(callee, base, args.len())
    }

    /// Call with `this` at `stack[base]` and `argc` arguments above it. Every
    /// slot from `base` up is released before returning. The caller keeps
    /// `callee` alive for the duration.
    pub(crate) fn invoke(&mut self, callee: Value, base: usize, argc: usize) -> VmResult<Value> {
        match self.resolve(callee) {
            Ok(Target::Native(id)) => self.invoke_native(id, base, argc),
            Ok(Target::Interpreted { func, env }) => self.invoke_interpreted(func, env, callee, base, argc),
            Err(e) => {
                self.truncate_stack(base)?;
                Err(e)
            }
        }
    }

    pub(crate) fn invoke_native(&mut self, id: u16, base: usize, argc: usize) -> VmResult<Value> {
        let this = self.stack[base];
        let args = self.stack[base + 1..base + 1 + argc].to_vec();
        let result = builtins::call_native(self, id, this, &args).map(|v| self.retain(v));
        self.truncate_stack(base)?;
        result
    }

    fn invoke_interpreted(
        &mut self,
        func: u32,
        closure_env: Value,
        callee: Value,
        base: usize,
        argc: usize,
    ) -> VmResult<Value> {
        if self.frames.len() >= self.config.max_call_depth {
            self.truncate_stack(base)?;
            return Err(self.throw_error(ErrorKind::RangeError, "maximum call depth exceeded"));
        }
        let module = Rc::clone(&self.module);
        let header = module
            .header(func)
            .map_err(|e| FatalError::BadBytecode(e.to_string()))?;
        let start = module
            .code_start(func)
            .map_err(|e| FatalError::BadBytecode(e.to_string()))?;

        for _ in argc..header.formals as usize {
            self.push_owned(Value::UNDEFINED);
        }
        let locals = self.stack.len();
        self.stack.resize(locals + header.frame_size as usize, Value::NONE);

        let env = if header.upvalues > 0 {
            Value::env(self.heap.alloc_env(header.upvalues as u32, closure_env)?)
        } else {
            closure_env
        };
        let env = self.retain(env);
        let callee = if callee.is_object() { self.retain(callee) } else { Value::NONE };
        self.frames.push(Activation {
            func,
            base,
            argc,
            locals,
            operands: self.stack.len(),
            env,
            arguments: Value::NONE,
            callee,
            strict: header.is_strict(),
            uses_arguments: header.uses_arguments(),
        });
        let owner = self.frames.len();
        trace!("enter {} (#{}) depth {}", module.function_name(func), func, owner);

        let result = self.run(owner, start);
        self.leave_activation(owner)?;
        result
    }

    /// Tear down the innermost activation.
    fn leave_activation(&mut self, owner: usize) -> Result<(), FatalError> {
        self.eh.unwind_owner(&mut self.heap, owner)?;
        let frame = self
            .frames
            .pop()
            .ok_or(FatalError::HandlerStack("activation stack underflow"))?;
        self.truncate_stack(frame.base)?;
        self.heap.dec_ref(frame.arguments)?;
        self.heap.dec_ref(frame.callee)?;
        self.heap.dec_ref(frame.env)
    }

    pub(crate) fn frame(&self) -> Result<&Activation, FatalError> {
        self.frames
            .last()
            .ok_or_else(|| FatalError::BadBytecode("no active function".to_string()))
    }

    fn frame_mut(&mut self) -> Result<&mut Activation, FatalError> {
        self.frames
            .last_mut()
            .ok_or_else(|| FatalError::BadBytecode("no active function".to_string()))
    }

    /// Swap the current activation's environment.
    pub(crate) fn set_frame_env(&mut self, env: Value) -> Result<(), FatalError> {
        self.heap.inc_ref(env);
        let frame = self.frame_mut()?;
        let old = std::mem::replace(&mut frame.env, env);
        self.heap.dec_ref(old)
    }

    /// The current activation's arguments object, created on first use.
    /// The frame keeps the reference.
    pub(crate) fn arguments_object(&mut self) -> VmResult<Value> {
        let frame = *self.frame()?;
        if !frame.uses_arguments {
            return Err(FatalError::BadBytecode(format!(
                "function #{} reads arguments without declaring it",
                frame.func
            ))
            .into());
        }
        if !frame.arguments.is_none() {
            return Ok(frame.arguments);
        }
        let args = self.stack[frame.base + 1..frame.base + 1 + frame.argc].to_vec();
        let obj = Value::object(self.heap.alloc_arguments(&args)?);
        let obj = self.retain(obj);
        self.frame_mut()?.arguments = obj;
        Ok(obj)
    }

    /// `new callee(args...)`: the callee sits at `stack[base]` with its
    /// arguments above it. Its slot is reused for the fresh `this`.
    pub(crate) fn construct(&mut self, base: usize, argc: usize) -> VmResult<Value> {
        let callee = self.stack[base];
        let proto = match callee.as_object() {
            Some(f) => match self.heap.get_named(f, self.names.prototype) {
                Some(p) if p.is_object() => p.as_object().map(Proto::Object),
                _ => None,
            },
            None => None,
        }
        .unwrap_or(Proto::Builtin(BuiltinId::ObjectProto));
        let this = Value::object(self.heap.alloc_object(ObjectClass::Object, proto)?);
        // One reference for the slot, one kept across the call.
        self.heap.inc_ref(this);
        self.heap.inc_ref(this);
        self.stack[base] = this;

        let result = self.invoke(callee, base, argc);
        self.heap.dec_ref(callee)?;
        match result {
            Ok(v) if v.is_object() => {
                self.release(this)?;
                Ok(v)
            }
            Ok(v) => {
                self.release(v)?;
                Ok(this)
            }
            Err(e) => {
                self.release(this)?;
                Err(e)
            }
        }
    }
}
