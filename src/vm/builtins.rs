//! Native functions.
//!
//! A native is a plain Rust function over the engine. It receives `this` and
//! a copy of the argument words (the caller's stack keeps them alive) and
//! returns an unowned value: either one it borrowed from its inputs or the
//! heap, or a fresh allocation.

use log::debug;

use super::engine::Engine;
use super::error::{ErrorKind, FatalError, VmError, VmResult};
use super::heap::{BuiltinId, ObjectClass, Proto};
use super::object::PropKey;
use super::value::{Kind, Value};

pub type NativeFn = fn(&mut Engine, Value, &[Value]) -> VmResult<Value>;

pub struct NativeEntry {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Native table, indexed by native id.
pub const NATIVES: &[NativeEntry] = &[
    NativeEntry { name: "print", func: native_print },
    NativeEntry { name: "error", func: native_error },
    NativeEntry { name: "assert", func: native_assert },
    NativeEntry { name: "gc", func: native_gc },
    NativeEntry { name: "Object", func: native_object },
    NativeEntry { name: "keys", func: native_keys },
    NativeEntry { name: "preventExtensions", func: native_prevent_extensions },
    NativeEntry { name: "Error", func: ctor_error },
    NativeEntry { name: "TypeError", func: ctor_type_error },
    NativeEntry { name: "RangeError", func: ctor_range_error },
    NativeEntry { name: "ReferenceError", func: ctor_reference_error },
    NativeEntry { name: "SyntaxError", func: ctor_syntax_error },
    NativeEntry { name: "URIError", func: ctor_uri_error },
];

/// Native id for `name`.
pub fn native_id(name: &str) -> Option<u16> {
    NATIVES.iter().position(|n| n.name == name).map(|i| i as u16)
}

pub fn native_name(id: u16) -> Option<&'static str> {
    NATIVES.get(id as usize).map(|n| n.name)
}

pub(crate) fn call_native(engine: &mut Engine, id: u16, this: Value, args: &[Value]) -> VmResult<Value> {
    let entry = NATIVES
        .get(id as usize)
        .ok_or_else(|| FatalError::BadBytecode(format!("unknown native #{}", id)))?;
    (entry.func)(engine, this, args)
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::UNDEFINED)
}

// -----------------------------------------------------------------------------
// Engine services
// -----------------------------------------------------------------------------

fn native_print(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    let mut parts = Vec::with_capacity(args.len());
    for &a in args {
        parts.push(engine.to_display(a)?);
    }
    engine.write_line(&parts.join(" "))?;
    Ok(Value::UNDEFINED)
}

/// Engine-level error report. Not catchable.
fn native_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    let message = engine.to_display(arg(args, 0))?;
    Err(VmError::Report(message))
}

fn native_assert(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    if engine.to_boolean(arg(args, 0)) {
        return Ok(Value::UNDEFINED);
    }
    let message = match args.get(1) {
        Some(&m) => format!("assertion failed: {}", engine.to_display(m)?),
        None => "assertion failed".to_string(),
    };
    Err(engine.throw_error(ErrorKind::Error, message))
}

/// Force a cycle-collection pass. Returns the number of blocks reclaimed.
fn native_gc(engine: &mut Engine, _this: Value, _args: &[Value]) -> VmResult<Value> {
    let freed = engine.collect_cycles()?;
    debug!("gc(): {} blocks reclaimed", freed);
    Ok(Value::number(freed as f64))
}

// -----------------------------------------------------------------------------
// Objects
// -----------------------------------------------------------------------------

/// ToObject: wraps primitives, passes objects through.
fn native_object(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    let v = arg(args, 0);
    if v.is_object() {
        return Ok(v);
    }
    let (class, proto) = match v.kind() {
        Kind::String => (ObjectClass::StringBox, BuiltinId::StringProto),
        Kind::Boolean => (ObjectClass::BooleanBox, BuiltinId::BooleanProto),
        _ if v.is_number() => (ObjectClass::NumberBox, BuiltinId::NumberProto),
        _ => (ObjectClass::Object, BuiltinId::ObjectProto),
    };
    let obj = engine.heap.alloc_object(class, Proto::Builtin(proto))?;
    if class != ObjectClass::Object {
        engine.heap.set_boxed_primitive(obj, v);
    }
    Ok(Value::object(obj))
}

/// Own enumerable keys as an array of strings.
fn native_keys(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    let Some(obj) = arg(args, 0).as_object() else {
        return Err(engine.throw_error(ErrorKind::TypeError, "keys called on non-object"));
    };
    let keys = engine.heap.own_keys(obj);
    let out = engine.heap.alloc_array(keys.len() as u32)?;
    let mut n = 0;
    for key in keys {
        if !engine.heap.is_enumerable(obj, key) {
            continue;
        }
        let name = match key {
            PropKey::Index(i) => engine.heap.alloc_string(&i.to_string())?,
            PropKey::Name(name) => name,
        };
        engine.heap.array_set(out, n, name)?;
        n += 1;
    }
    Ok(Value::object(out))
}

fn native_prevent_extensions(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    let v = arg(args, 0);
    if let Some(obj) = v.as_object() {
        engine.heap.prevent_extensions(obj);
    }
    Ok(v)
}

// -----------------------------------------------------------------------------
// Error constructors
// -----------------------------------------------------------------------------

fn construct_error(engine: &mut Engine, kind: ErrorKind, args: &[Value]) -> VmResult<Value> {
    let message = match arg(args, 0) {
        m if m.is_undefined() => String::new(),
        m => engine.to_display(m)?,
    };
    Ok(engine.make_error(kind, &message)?)
}

fn ctor_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    construct_error(engine, ErrorKind::Error, args)
}

fn ctor_type_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    construct_error(engine, ErrorKind::TypeError, args)
}

fn ctor_range_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    construct_error(engine, ErrorKind::RangeError, args)
}

fn ctor_reference_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    construct_error(engine, ErrorKind::ReferenceError, args)
}

fn ctor_syntax_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    construct_error(engine, ErrorKind::SyntaxError, args)
}

fn ctor_uri_error(engine: &mut Engine, _this: Value, args: &[Value]) -> VmResult<Value> {
    construct_error(engine, ErrorKind::UriError, args)
}

impl Engine {
    /// The shared function object for native `id`, created on first use.
    pub(crate) fn native_function(&mut self, id: u16) -> VmResult<Value> {
        if native_name(id).is_none() {
            return Err(FatalError::BadBytecode(format!("unknown native #{}", id)).into());
        }
        if let Some(&f) = self.natives.get(&id) {
            return Ok(f);
        }
        let obj = self.heap.alloc_function(id as u32, true, Value::UNDEFINED)?;
        let f = Value::object(obj);
        self.heap.pin(f);
        // Constructors expose their builtin prototype for `instanceof`.
        let proto = match native_name(id) {
            Some("Object") => Some(BuiltinId::ObjectProto),
            Some(name) if name.ends_with("Error") => Some(BuiltinId::ErrorProto),
            _ => None,
        };
        if let Some(proto) = proto {
            let p = Value::object(self.heap.builtin(proto));
            self.heap.define_own(obj, PropKey::Name(self.names.prototype), p)?;
        }
        self.natives.insert(id, f);
        Ok(f)
    }
}
