//! The dispatcher: one opcode at a time over the current activation.

use std::rc::Rc;

use log::{Level, log_enabled, trace};

use super::arith::{BinaryOp, Relation, strict_equals, type_of};
use super::builtins;
use super::bytecode::{branch_target, operand_i32, operand_u8, operand_u16, operand_u32, operand_u64};
use super::convert::to_int32;
use super::eh::{Resolution, RetsubAction};
use super::engine::Engine;
use super::error::{ErrorKind, FatalError, VmError, VmResult};
use super::heap::{BuiltinId, GcRef, ObjectClass, Proto};
use super::object::PropKey;
use super::ops::{Opcode, PrimOp, PrimType};
use super::value::{Kind, Value};

enum Flow {
    Next(usize),
    /// Leave the activation with an owned result.
    Return(Value),
}

fn bad(msg: impl Into<String>) -> FatalError {
    FatalError::BadBytecode(msg.into())
}

impl Engine {
    /// Run the innermost activation (`owner`) from `pc` until it returns or
    /// throws past its last handler.
    pub(crate) fn run(&mut self, owner: usize, mut pc: usize) -> VmResult<Value> {
        let module = Rc::clone(&self.module);
        let code = module.code.as_slice();
        loop {
            self.safe_point()?;
            match self.step(code, owner, pc) {
                Ok(Flow::Next(next)) => pc = next,
                Ok(Flow::Return(v)) => return Ok(v),
                Err(VmError::Exception(v)) => pc = self.unwind_to_handler(owner, v)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Route a thrown value to a handler of this activation or hand it back.
    fn unwind_to_handler(&mut self, owner: usize, v: Value) -> VmResult<usize> {
        match self.eh.throw_value(&mut self.heap, owner, v)? {
            Resolution::Handler { pc, stack_depth, env } => {
                trace!("exception handled at {}", pc);
                self.truncate_stack(stack_depth)?;
                self.set_frame_env(env)?;
                Ok(pc)
            }
            Resolution::Unhandled(v) => Err(VmError::Exception(v)),
        }
    }

    fn step(&mut self, code: &[u8], owner: usize, pc: usize) -> VmResult<Flow> {
        let byte = *code
            .get(pc)
            .ok_or_else(|| bad(format!("pc {} past end of code", pc)))?;
        let op = Opcode::from_u8(byte).ok_or(FatalError::UnknownOpcode { op: byte, pc })?;
        self.instructions += 1;
        if log_enabled!(Level::Trace) {
            trace!("{:>6}  {:<16} sp={}", pc, op.mnemonic(), self.stack.len());
        }
        let next = match op.shape().len() {
            Some(n) => pc + 1 + n,
            None => pc,
        };
        let at = pc + 1;

        match op {
            Opcode::Nop => {}

            // ----------------------------------------------------------------
            // Constants and stack
            // ----------------------------------------------------------------
            Opcode::PushUndefined => self.push_owned(Value::UNDEFINED),
            Opcode::PushNull => self.push_owned(Value::NULL),
            Opcode::PushTrue => self.push_owned(Value::TRUE),
            Opcode::PushFalse => self.push_owned(Value::FALSE),
            Opcode::PushInt => self.push_owned(Value::int(operand_i32(code, at)?)),
            Opcode::PushDouble => {
                let bits = operand_u64(code, at)?;
                let v = Value::from_bits(bits)
                    .filter(|v| v.is_number())
                    .ok_or_else(|| bad(format!("push.double of non-number word {:#x}", bits)))?;
                self.push_owned(v);
            }
            Opcode::PushString => {
                let idx = operand_u32(code, at)? as usize;
                let s = *self
                    .constants
                    .get(idx)
                    .ok_or_else(|| bad(format!("string constant {} out of range", idx)))?;
                self.push(s);
            }
            Opcode::PushFunction => {
                let func = self.function_operand(code, at)?;
                self.push_owned(Value::function(func));
            }
            Opcode::NewClosure => {
                let func = self.function_operand(code, at)?;
                let env = self.frame()?.env;
                let f = self.heap.alloc_function(func, false, env)?;
                self.push(Value::object(f));
            }
            Opcode::PushNative => {
                let f = self.native_function(operand_u16(code, at)?)?;
                self.push(f);
            }
            Opcode::PushThis => {
                let this = self.stack[self.frame()?.base];
                self.push(this);
            }
            Opcode::Pop => {
                let v = self.pop()?;
                self.release(v)?;
            }
            Opcode::Dup => {
                let v = self.peek(0)?;
                self.push(v);
            }
            Opcode::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(bad("operand stack underflow").into());
                }
                self.stack.swap(len - 1, len - 2);
            }

            // ----------------------------------------------------------------
            // Variables
            // ----------------------------------------------------------------
            Opcode::LoadArg => {
                let i = operand_u16(code, at)? as usize;
                let v = match self.frame()?.arg_slot(i) {
                    Some(slot) => self.stack[slot],
                    None => Value::UNDEFINED,
                };
                self.push(v);
            }
            Opcode::StoreArg => {
                let i = operand_u16(code, at)? as usize;
                let slot = self
                    .frame()?
                    .arg_slot(i)
                    .ok_or_else(|| bad(format!("store to undeclared argument {}", i)))?;
                let v = self.pop()?;
                self.store_slot(slot, v)?;
                self.release(v)?;
            }
            Opcode::LoadLocal => {
                let slot = self.local_slot(code, at)?;
                let v = self.stack[slot];
                if v.is_none() {
                    return Err(self.throw_error(ErrorKind::ReferenceError, "local read before initialization"));
                }
                self.push(v);
            }
            Opcode::StoreLocal => {
                let slot = self.local_slot(code, at)?;
                let v = self.pop()?;
                self.store_slot(slot, v)?;
                self.release(v)?;
            }
            Opcode::LoadGlobal => {
                let i = operand_u16(code, at)? as usize;
                let v = *self
                    .globals
                    .get(i)
                    .ok_or_else(|| bad(format!("global {} out of range", i)))?;
                if v.is_none() {
                    return Err(self.throw_error(ErrorKind::ReferenceError, format!("global {} is not defined", i)));
                }
                self.push(v);
            }
            Opcode::StoreGlobal => {
                let i = operand_u16(code, at)? as usize;
                if i >= self.globals.len() {
                    return Err(bad(format!("global {} out of range", i)).into());
                }
                let v = self.pop()?;
                let old = std::mem::replace(&mut self.globals[i], v);
                self.release(old)?;
            }
            Opcode::LoadEnv => {
                let (env, slot) = self.env_operand(code, at)?;
                let v = self
                    .heap
                    .env_get(env, slot)
                    .ok_or_else(|| bad(format!("environment slot {} out of range", slot)))?;
                if v.is_none() {
                    return Err(self.throw_error(ErrorKind::ReferenceError, "binding read before initialization"));
                }
                self.push(v);
            }
            Opcode::StoreEnv => {
                let (env, slot) = self.env_operand(code, at)?;
                let v = self.peek(0)?;
                if !self.heap.env_set(env, slot, v)? {
                    return Err(bad(format!("environment slot {} out of range", slot)).into());
                }
                let v = self.pop()?;
                self.release(v)?;
            }
            Opcode::EnterEnv => {
                let count = operand_u16(code, at)? as u32;
                let parent = self.frame()?.env;
                let env = Value::env(self.heap.alloc_env(count, parent)?);
                self.set_frame_env(env)?;
            }
            Opcode::LeaveEnv => {
                let env = self
                    .frame()?
                    .env
                    .as_env()
                    .ok_or_else(|| bad("leave.env without an environment"))?;
                let parent = self.heap.env_parent(env);
                self.set_frame_env(parent)?;
            }
            Opcode::GetArguments => {
                let args = self.arguments_object()?;
                self.push(args);
            }

            // ----------------------------------------------------------------
            // Arithmetic
            // ----------------------------------------------------------------
            Opcode::Add => self.binary_top(BinaryOp::Add)?,
            Opcode::Sub => self.binary_top(BinaryOp::Sub)?,
            Opcode::Mul => self.binary_top(BinaryOp::Mul)?,
            Opcode::Div => self.binary_top(BinaryOp::Div)?,
            Opcode::Rem => self.binary_top(BinaryOp::Rem)?,
            Opcode::BitAnd => self.binary_top(BinaryOp::BitAnd)?,
            Opcode::BitOr => self.binary_top(BinaryOp::BitOr)?,
            Opcode::BitXor => self.binary_top(BinaryOp::BitXor)?,
            Opcode::Shl => self.binary_top(BinaryOp::Shl)?,
            Opcode::Shr => self.binary_top(BinaryOp::Shr)?,
            Opcode::UShr => self.binary_top(BinaryOp::UShr)?,
            Opcode::Neg => {
                let v = self.peek(0)?;
                let r = self.negate(v)?;
                self.replace_top(1, r)?;
            }
            Opcode::Plus => {
                let v = self.peek(0)?;
                let x = self.to_number(v)?;
                self.replace_top(1, Value::number(x))?;
            }
            Opcode::BitNot => {
                let v = self.peek(0)?;
                let x = self.to_number(v)?;
                self.replace_top(1, Value::int(!to_int32(x)))?;
            }
            Opcode::Not => {
                let v = self.peek(0)?;
                let b = !self.to_boolean(v);
                self.replace_top(1, Value::bool(b))?;
            }
            Opcode::Typeof => {
                let v = self.peek(0)?;
                let name = self.heap.intern(type_of(&self.heap, v))?;
                self.replace_top(1, name)?;
            }
            Opcode::PrimBinary => {
                let op_byte = operand_u8(code, at)?;
                let ty_byte = operand_u8(code, at + 1)?;
                let op = PrimOp::from_u8(op_byte).ok_or_else(|| bad(format!("bad primitive op {}", op_byte)))?;
                let ty =
                    PrimType::from_u8(ty_byte).ok_or_else(|| bad(format!("bad primitive type {}", ty_byte)))?;
                let (a, b) = (self.peek(1)?, self.peek(0)?);
                let r = self.prim_binary(op, ty, a, b)?;
                self.replace_top(2, r)?;
            }

            // ----------------------------------------------------------------
            // Comparison
            // ----------------------------------------------------------------
            Opcode::Eq | Opcode::Ne => {
                let (a, b) = (self.peek(1)?, self.peek(0)?);
                let eq = self.loose_equals(a, b)?;
                self.replace_top(2, Value::bool(eq == (op == Opcode::Eq)))?;
            }
            Opcode::StrictEq | Opcode::StrictNe => {
                let (a, b) = (self.peek(1)?, self.peek(0)?);
                let eq = strict_equals(&self.heap, a, b);
                self.replace_top(2, Value::bool(eq == (op == Opcode::StrictEq)))?;
            }
            Opcode::Lt => self.compare_top(Relation::Lt)?,
            Opcode::Le => self.compare_top(Relation::Le)?,
            Opcode::Gt => self.compare_top(Relation::Gt)?,
            Opcode::Ge => self.compare_top(Relation::Ge)?,

            // ----------------------------------------------------------------
            // Control flow
            // ----------------------------------------------------------------
            Opcode::Jump => return Ok(Flow::Next(branch_target(pc, operand_i32(code, at)?)?)),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let v = self.pop()?;
                let truthy = self.to_boolean(v);
                self.release(v)?;
                if truthy == (op == Opcode::JumpIfTrue) {
                    return Ok(Flow::Next(branch_target(pc, operand_i32(code, at)?)?));
                }
            }
            Opcode::Switch => {
                let low = operand_i32(code, at)? as i64;
                let count = operand_u16(code, at + 4)? as i64;
                let default = operand_i32(code, at + 6)?;
                let v = self.pop()?;
                self.release(v)?;
                let offset = match v.as_f64() {
                    Some(x) if x.fract() == 0.0 && (low as f64..(low + count) as f64).contains(&x) => {
                        let k = (x as i64 - low) as usize;
                        operand_i32(code, at + 10 + 4 * k)?
                    }
                    _ => default,
                };
                return Ok(Flow::Next(branch_target(pc, offset)?));
            }

            // ----------------------------------------------------------------
            // Objects
            // ----------------------------------------------------------------
            Opcode::NewObject => {
                let obj = self
                    .heap
                    .alloc_object(ObjectClass::Object, Proto::Builtin(BuiltinId::ObjectProto))?;
                self.push(Value::object(obj));
            }
            Opcode::NewArray => {
                let n = operand_u16(code, at)? as usize;
                let first = self
                    .stack
                    .len()
                    .checked_sub(n)
                    .ok_or_else(|| bad("operand stack underflow"))?;
                let arr = self.heap.alloc_array(n as u32)?;
                for k in 0..n {
                    let v = self.stack[first + k];
                    self.heap.array_set(arr, k as u32, v)?;
                }
                self.replace_top(n, Value::object(arr))?;
            }
            Opcode::GetProp => {
                let (base, key) = (self.peek(1)?, self.peek(0)?);
                let (key, temp) = self.to_key(key)?;
                let v = self.get_property(base, key);
                self.heap.release_if_floating(temp)?;
                self.replace_top(2, v?)?;
            }
            Opcode::SetProp => {
                let (base, key, v) = (self.peek(2)?, self.peek(1)?, self.peek(0)?);
                let (key, temp) = self.to_key(key)?;
                let done = self.set_property(base, key, v);
                self.heap.release_if_floating(temp)?;
                done?;
                self.replace_top(3, v)?;
            }
            Opcode::GetPropByName => {
                let name = self.name_operand(code, at)?;
                let base = self.peek(0)?;
                let key = self.heap.key_for_string(name);
                let v = self.get_property(base, key)?;
                self.replace_top(1, v)?;
            }
            Opcode::SetPropByName => {
                let name = self.name_operand(code, at)?;
                let (base, v) = (self.peek(1)?, self.peek(0)?);
                let key = self.heap.key_for_string(name);
                self.set_property(base, key, v)?;
                self.replace_top(2, v)?;
            }
            Opcode::InitPropByName => {
                let name = self.name_operand(code, at)?;
                let obj = self
                    .peek(1)?
                    .as_object()
                    .ok_or_else(|| bad("init.named on a non-object"))?;
                let v = self.pop()?;
                let key = self.heap.key_for_string(name);
                self.heap.define_own(obj, key, v)?;
                self.release(v)?;
            }
            Opcode::DeleteProp => {
                let (base, key) = (self.peek(1)?, self.peek(0)?);
                let (key, temp) = self.to_key(key)?;
                let deleted = self.delete_property(base, key);
                self.heap.release_if_floating(temp)?;
                self.replace_top(2, Value::bool(deleted?))?;
            }
            Opcode::In => {
                let (key, target) = (self.peek(1)?, self.peek(0)?);
                let Some(obj) = target.as_object() else {
                    return Err(self.throw_error(ErrorKind::TypeError, "right-hand side of 'in' is not an object"));
                };
                let (key, temp) = self.to_key(key)?;
                let found = self.heap.has_property(obj, key);
                self.heap.release_if_floating(temp)?;
                self.replace_top(2, Value::bool(found))?;
            }
            Opcode::InstanceOf => {
                let (v, ctor) = (self.peek(1)?, self.peek(0)?);
                let result = self.instance_of(v, ctor)?;
                self.replace_top(2, Value::bool(result))?;
            }

            // ----------------------------------------------------------------
            // Calls
            // ----------------------------------------------------------------
            Opcode::Call => {
                let func = self.function_operand(code, at)?;
                let argc = operand_u8(code, at + 4)? as usize;
                let base = self.call_base(argc)?;
                let r = self.invoke(Value::function(func), base, argc)?;
                self.push_owned(r);
            }
            Opcode::CallValue => {
                let argc = operand_u8(code, at)? as usize;
                let base = self.call_base(argc)?;
                let slot = base.checked_sub(1).ok_or_else(|| bad("call.value without a callee"))?;
                let callee = self.stack[slot];
                let r = self.invoke(callee, base, argc)?;
                let callee = self.pop()?;
                self.release(callee)?;
                self.push_owned(r);
            }
            Opcode::New => {
                let argc = operand_u8(code, at)? as usize;
                let base = self.call_base(argc)?;
                let r = self.construct(base, argc)?;
                self.push_owned(r);
            }
            Opcode::CallNative => {
                let id = operand_u16(code, at)?;
                let argc = operand_u8(code, at + 2)? as usize;
                if builtins::native_name(id).is_none() {
                    return Err(bad(format!("unknown native #{}", id)).into());
                }
                let base = self.call_base(argc)?;
                let r = self.invoke_native(id, base, argc)?;
                self.push_owned(r);
            }
            Opcode::Return => return Ok(Flow::Return(self.pop()?)),
            Opcode::ReturnUndefined => return Ok(Flow::Return(Value::UNDEFINED)),

            // ----------------------------------------------------------------
            // Exceptions
            // ----------------------------------------------------------------
            Opcode::Try => {
                let target = |off: i32| -> Result<Option<usize>, FatalError> {
                    if off == 0 { Ok(None) } else { branch_target(pc, off).map(Some) }
                };
                let catch = target(operand_i32(code, at)?)?;
                let finally = target(operand_i32(code, at + 4)?)?;
                let env = self.frame()?.env;
                let depth = self.stack.len();
                self.eh
                    .enter_try(&mut self.heap, owner, pc, catch, finally, depth, env)?;
            }
            Opcode::Catch => {
                let v = self.eh.enter_catch(&mut self.heap, owner)?;
                self.push_owned(v);
            }
            Opcode::Finally => self.eh.enter_finally(&mut self.heap, owner)?,
            Opcode::EndTry => self.eh.leave_try(&mut self.heap, owner)?,
            Opcode::Throw => {
                let v = self.pop()?;
                return Err(VmError::Exception(v));
            }
            Opcode::Gosub => {
                self.eh.gosub(&mut self.heap, owner, next)?;
                return Ok(Flow::Next(branch_target(pc, operand_i32(code, at)?)?));
            }
            Opcode::Retsub => match self.eh.retsub(&mut self.heap, owner)? {
                RetsubAction::Return(to) => return Ok(Flow::Next(to)),
                RetsubAction::Rethrow(v) => return Err(VmError::Exception(v)),
            },

            Opcode::IReadFpOff32 | Opcode::IAssignFpOff32 | Opcode::IRead32 | Opcode::IAssign32 => {
                return Err(FatalError::Unsupported {
                    name: op.mnemonic(),
                    pc,
                }
                .into());
            }
        }
        Ok(Flow::Next(next))
    }

    // -------------------------------------------------------------------------
    // Operand decoding
    // -------------------------------------------------------------------------

    fn function_operand(&self, code: &[u8], at: usize) -> Result<u32, FatalError> {
        let func = operand_u32(code, at)?;
        if func as usize >= self.module.functions.len() {
            return Err(bad(format!("function #{} out of range", func)));
        }
        Ok(func)
    }

    fn local_slot(&self, code: &[u8], at: usize) -> Result<usize, FatalError> {
        let i = operand_u16(code, at)? as usize;
        let frame = self.frame()?;
        let slot = frame.locals + i;
        if slot >= frame.operands {
            return Err(bad(format!("local {} out of range", i)));
        }
        Ok(slot)
    }

    fn env_operand(&self, code: &[u8], at: usize) -> Result<(GcRef, u32), FatalError> {
        let depth = operand_u8(code, at)?;
        let slot = operand_u16(code, at + 1)? as u32;
        let mut env = self.frame()?.env;
        for _ in 0..depth {
            env = env
                .as_env()
                .map(|e| self.heap.env_parent(e))
                .ok_or_else(|| bad(format!("no environment at depth {}", depth)))?;
        }
        let env = env
            .as_env()
            .ok_or_else(|| bad(format!("no environment at depth {}", depth)))?;
        Ok((env, slot))
    }

    fn name_operand(&self, code: &[u8], at: usize) -> Result<Value, FatalError> {
        let idx = operand_u32(code, at)? as usize;
        self.constants
            .get(idx)
            .copied()
            .ok_or_else(|| bad(format!("string constant {} out of range", idx)))
    }

    /// Stack index of `this` for a call with `argc` arguments on top.
    fn call_base(&self, argc: usize) -> Result<usize, FatalError> {
        self.stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| bad("operand stack underflow at call"))
    }

    fn binary_top(&mut self, op: BinaryOp) -> VmResult<()> {
        let (a, b) = (self.peek(1)?, self.peek(0)?);
        let r = self.binary(op, a, b)?;
        Ok(self.replace_top(2, r)?)
    }

    fn compare_top(&mut self, rel: Relation) -> VmResult<()> {
        let (a, b) = (self.peek(1)?, self.peek(0)?);
        let r = self.compare(rel, a, b)?;
        Ok(self.replace_top(2, Value::bool(r))?)
    }

    // -------------------------------------------------------------------------
    // Property access
    // -------------------------------------------------------------------------

    /// Property key for a key operand, plus a temporary string to drop once
    /// the access is done (UNDEFINED when none was made).
    fn to_key(&mut self, v: Value) -> VmResult<(PropKey, Value)> {
        if let Some(key) = self.heap.key_for_primitive(v) {
            return Ok((key, Value::UNDEFINED));
        }
        let s = self.to_string_value(v)?;
        Ok((self.heap.key_for_string(s), s))
    }

    fn key_text(&self, key: PropKey) -> String {
        match key {
            PropKey::Index(i) => i.to_string(),
            PropKey::Name(n) => self.heap.string_of(n).unwrap_or_default().to_string(),
        }
    }

    /// The object that answers property reads on `base`.
    fn holder(&mut self, base: Value, key: PropKey) -> VmResult<GcRef> {
        let proto = match base.kind() {
            Kind::Object => return Ok(base.as_object().ok_or_else(|| bad("bad object word"))?),
            Kind::String => BuiltinId::StringProto,
            Kind::Boolean => BuiltinId::BooleanProto,
            Kind::Function => BuiltinId::FunctionProto,
            _ if base.is_number() => BuiltinId::NumberProto,
            _ => {
                let msg = format!("cannot read property '{}' of {}", self.key_text(key), type_of(&self.heap, base));
                return Err(self.throw_error(ErrorKind::TypeError, msg));
            }
        };
        Ok(self.heap.builtin(proto))
    }

    /// Property read. The result is unowned.
    pub(crate) fn get_property(&mut self, base: Value, key: PropKey) -> VmResult<Value> {
        if let Some(s) = self.heap.string_of(base) {
            match key {
                PropKey::Index(i) => {
                    if let Some(unit) = s.encode_utf16().nth(i as usize) {
                        let ch = String::from_utf16_lossy(&[unit]);
                        return Ok(self.heap.alloc_string(&ch)?);
                    }
                    return Ok(Value::UNDEFINED);
                }
                PropKey::Name(n) if n == self.names.length || self.heap.string_of(n) == Some("length") => {
                    return Ok(Value::number(s.encode_utf16().count() as f64));
                }
                PropKey::Name(_) => {}
            }
        }
        let obj = self.holder(base, key)?;
        let v = match key {
            PropKey::Name(name) => self.heap.get_named(obj, name),
            PropKey::Index(_) => self.heap.get(obj, key),
        };
        Ok(v.unwrap_or(Value::UNDEFINED))
    }

    pub(crate) fn set_property(&mut self, base: Value, key: PropKey, v: Value) -> VmResult<()> {
        let strict = self.frame()?.strict;
        let Some(obj) = base.as_object() else {
            if base.is_nullish() || base.is_none() || strict {
                let msg = format!("cannot set property '{}' of {}", self.key_text(key), type_of(&self.heap, base));
                return Err(self.throw_error(ErrorKind::TypeError, msg));
            }
            return Ok(());
        };
        if !self.heap.put(obj, key, v)? && strict {
            let msg = format!("cannot assign to property '{}'", self.key_text(key));
            return Err(self.throw_error(ErrorKind::TypeError, msg));
        }
        Ok(())
    }

    fn delete_property(&mut self, base: Value, key: PropKey) -> VmResult<bool> {
        let Some(obj) = base.as_object() else {
            if base.is_nullish() || base.is_none() {
                let msg = format!("cannot delete property '{}' of {}", self.key_text(key), type_of(&self.heap, base));
                return Err(self.throw_error(ErrorKind::TypeError, msg));
            }
            return Ok(true);
        };
        let deleted = self.heap.delete(obj, key)?;
        if !deleted && self.frame()?.strict {
            let msg = format!("cannot delete property '{}'", self.key_text(key));
            return Err(self.throw_error(ErrorKind::TypeError, msg));
        }
        Ok(deleted)
    }

    fn instance_of(&mut self, v: Value, ctor: Value) -> VmResult<bool> {
        if !self.is_callable(ctor) {
            return Err(self.throw_error(ErrorKind::TypeError, "right-hand side of 'instanceof' is not callable"));
        }
        let proto = ctor
            .as_object()
            .and_then(|f| self.heap.get_named(f, self.names.prototype))
            .and_then(Value::as_object);
        let Some(proto) = proto else {
            return Err(self.throw_error(ErrorKind::TypeError, "function has no prototype object"));
        };
        Ok(v.as_object().is_some_and(|o| self.heap.inherits_from(o, proto)))
    }
}
