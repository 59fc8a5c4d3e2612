//! Arithmetic, comparison and type conversion.
//!
//! Every operator has a fast path over number words that needs no heap
//! access, and a slow path on [`Engine`] that may call `valueOf`/`toString`
//! on objects and therefore may throw.

use std::cmp::Ordering;

use super::convert::{number_to_string, string_to_number, to_int32, to_uint32};
use super::engine::Engine;
use super::error::{ErrorKind, VmResult};
use super::heap::{GcRef, Heap, ObjectClass};
use super::ops::{PrimOp, PrimType};
use super::value::{Kind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    fn holds(self, x: f64, y: f64) -> bool {
        match self {
            Relation::Lt => x < y,
            Relation::Le => x <= y,
            Relation::Gt => x > y,
            Relation::Ge => x >= y,
        }
    }

    fn holds_ord(self, ord: Ordering) -> bool {
        match self {
            Relation::Lt => ord == Ordering::Less,
            Relation::Le => ord != Ordering::Greater,
            Relation::Gt => ord == Ordering::Greater,
            Relation::Ge => ord != Ordering::Less,
        }
    }
}

/// Preferred type for ToPrimitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Default,
    Number,
    String,
}

// =============================================================================
// Fast paths
// =============================================================================

/// Both operands are numbers: compute without touching the heap.
#[inline]
pub fn fast_binary(op: BinaryOp, a: Value, b: Value) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Some(int_binary(op, x, y));
    }
    Some(double_binary(op, a.as_f64()?, b.as_f64()?))
}

fn int_binary(op: BinaryOp, x: i32, y: i32) -> Value {
    let (a, b) = (x as i64, y as i64);
    match op {
        BinaryOp::Add => Value::number((a + b) as f64),
        BinaryOp::Sub => Value::number((a - b) as f64),
        BinaryOp::Mul => {
            let p = a * b;
            if p == 0 && (a < 0 || b < 0) {
                Value::double(-0.0)
            } else {
                Value::number(p as f64)
            }
        }
        BinaryOp::Div => {
            if b != 0 && a % b == 0 && !(a == 0 && b < 0) {
                Value::number((a / b) as f64)
            } else {
                double_binary(op, x as f64, y as f64)
            }
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Value::NAN;
            }
            let r = a % b;
            if r == 0 && a < 0 {
                Value::double(-0.0)
            } else {
                Value::int(r as i32)
            }
        }
        BinaryOp::BitAnd => Value::int(x & y),
        BinaryOp::BitOr => Value::int(x | y),
        BinaryOp::BitXor => Value::int(x ^ y),
        BinaryOp::Shl => Value::int(x.wrapping_shl(y as u32 & 31)),
        BinaryOp::Shr => Value::int(x >> (y as u32 & 31)),
        BinaryOp::UShr => Value::number(((x as u32) >> (y as u32 & 31)) as f64),
    }
}

fn double_binary(op: BinaryOp, x: f64, y: f64) -> Value {
    let shift = || to_uint32(y) & 31;
    match op {
        BinaryOp::Add => Value::number(x + y),
        BinaryOp::Sub => Value::number(x - y),
        BinaryOp::Mul => Value::number(x * y),
        BinaryOp::Div => Value::number(x / y),
        BinaryOp::Rem => Value::number(x % y),
        BinaryOp::BitAnd => Value::int(to_int32(x) & to_int32(y)),
        BinaryOp::BitOr => Value::int(to_int32(x) | to_int32(y)),
        BinaryOp::BitXor => Value::int(to_int32(x) ^ to_int32(y)),
        BinaryOp::Shl => Value::int(to_int32(x).wrapping_shl(shift())),
        BinaryOp::Shr => Value::int(to_int32(x) >> shift()),
        BinaryOp::UShr => Value::number((to_uint32(x) >> shift()) as f64),
    }
}

/// `===`: numbers by value (NaN unequal, zeros equal), strings by contents,
/// everything else by identity.
pub fn strict_equals(heap: &Heap, a: Value, b: Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    if let (Some(s), Some(t)) = (heap.string_of(a), heap.string_of(b)) {
        return s == t;
    }
    a == b
}

pub fn type_of(heap: &Heap, v: Value) -> &'static str {
    match v.kind() {
        Kind::None | Kind::Undefined => "undefined",
        Kind::Null => "object",
        Kind::Boolean => "boolean",
        Kind::Int32 | Kind::Double | Kind::NaN | Kind::Infinity => "number",
        Kind::String => "string",
        Kind::Function => "function",
        Kind::Object => match v.as_object().map(|o| heap.object_class(o)) {
            Some(ObjectClass::Function) => "function",
            _ => "object",
        },
        Kind::Env | Kind::SpBase | Kind::FpBase | Kind::GpBase => "internal",
    }
}

// =============================================================================
// Slow paths
// =============================================================================

impl Engine {
    pub(crate) fn to_boolean(&self, v: Value) -> bool {
        v.truthy_primitive()
            .unwrap_or_else(|| self.heap.string_of(v).is_some_and(|s| !s.is_empty()))
    }

    pub(crate) fn is_callable(&self, v: Value) -> bool {
        match v.kind() {
            Kind::Function => true,
            Kind::Object => v
                .as_object()
                .is_some_and(|o| self.heap.function_info(o).is_some()),
            _ => false,
        }
    }

    fn uninitialized(&mut self) -> super::error::VmError {
        self.throw_error(ErrorKind::ReferenceError, "read of uninitialized binding")
    }

    /// ToPrimitive. The result is owned by the caller.
    pub(crate) fn to_primitive(&mut self, v: Value, hint: Hint) -> VmResult<Value> {
        let Some(obj) = v.as_object() else {
            if v.is_none() {
                return Err(self.uninitialized());
            }
            return Ok(self.retain(v));
        };
        let order = match hint {
            Hint::String => [self.names.to_string, self.names.value_of],
            Hint::Default | Hint::Number => [self.names.value_of, self.names.to_string],
        };
        for name in order {
            let Some(method) = self.heap.get_named(obj, name) else {
                continue;
            };
            if !self.is_callable(method) {
                continue;
            }
            let method = self.retain(method);
            let result = self.call(method, v, &[]);
            self.release(method)?;
            let r = result?;
            if !r.is_object() {
                return Ok(r);
            }
            self.release(r)?;
        }
        let p = self.default_primitive(obj)?;
        Ok(self.retain(p))
    }

    /// Class-specific conversion for objects without a usable
    /// `valueOf`/`toString`. The result is unowned.
    fn default_primitive(&mut self, obj: GcRef) -> VmResult<Value> {
        let v = match self.heap.object_class(obj) {
            ObjectClass::StringBox | ObjectClass::NumberBox | ObjectClass::BooleanBox => {
                self.heap.boxed_primitive(obj).unwrap_or(Value::UNDEFINED)
            }
            ObjectClass::Error => {
                let text = self.error_text(obj)?;
                self.heap.alloc_string(&text)?
            }
            ObjectClass::Array => {
                let mut visiting = Vec::new();
                let text = self.join_array(obj, &mut visiting)?;
                self.heap.alloc_string(&text)?
            }
            ObjectClass::Function => self.heap.intern("function")?,
            ObjectClass::Arguments => self.heap.intern("[object Arguments]")?,
            ObjectClass::Object => self.heap.intern("[object Object]")?,
        };
        Ok(v)
    }

    /// `name: message`, or `name` alone when the message is empty.
    pub(crate) fn error_text(&mut self, obj: GcRef) -> VmResult<String> {
        let name = match self.heap.get_named(obj, self.names.name) {
            Some(v) if !v.is_undefined() => self.to_display(v)?,
            _ => "Error".to_string(),
        };
        let message = match self.heap.get_named(obj, self.names.message) {
            Some(v) if !v.is_undefined() => self.to_display(v)?,
            _ => String::new(),
        };
        Ok(if message.is_empty() {
            name
        } else {
            format!("{}: {}", name, message)
        })
    }

    fn join_array(&mut self, obj: GcRef, visiting: &mut Vec<GcRef>) -> VmResult<String> {
        if visiting.contains(&obj) {
            return Ok(String::new());
        }
        visiting.push(obj);
        let mut out = String::new();
        for i in 0..self.heap.array_len(obj) {
            if i > 0 {
                out.push(',');
            }
            match self.heap.array_get(obj, i) {
                None => {}
                Some(v) if v.is_nullish() => {}
                Some(v) => match v.as_object() {
                    Some(inner) if self.heap.object_class(inner) == ObjectClass::Array => {
                        out.push_str(&self.join_array(inner, visiting)?)
                    }
                    _ => out.push_str(&self.to_display(v)?),
                },
            }
        }
        visiting.pop();
        Ok(out)
    }

    pub(crate) fn to_number(&mut self, v: Value) -> VmResult<f64> {
        if let Some(x) = v.as_f64() {
            return Ok(x);
        }
        Ok(match v.kind() {
            Kind::Undefined => f64::NAN,
            Kind::Null => 0.0,
            Kind::Boolean => {
                if v == Value::TRUE {
                    1.0
                } else {
                    0.0
                }
            }
            Kind::String => string_to_number(self.heap.string_of(v).unwrap_or_default()),
            Kind::Object => {
                let p = self.to_primitive(v, Hint::Number)?;
                let n = self.to_number(p);
                self.release(p)?;
                n?
            }
            Kind::None => return Err(self.uninitialized()),
            _ => f64::NAN,
        })
    }

    /// ToString, as a Rust string.
    pub(crate) fn to_display(&mut self, v: Value) -> VmResult<String> {
        if let Some(x) = v.as_f64() {
            return Ok(number_to_string(x));
        }
        Ok(match v.kind() {
            Kind::String => self.heap.string_of(v).unwrap_or_default().to_string(),
            Kind::Undefined => "undefined".to_string(),
            Kind::Null => "null".to_string(),
            Kind::Boolean => (v == Value::TRUE).to_string(),
            Kind::Function => "function".to_string(),
            Kind::Object => {
                let p = self.to_primitive(v, Hint::String)?;
                let s = self.to_display(p);
                self.release(p)?;
                s?
            }
            Kind::None => return Err(self.uninitialized()),
            _ => "[internal]".to_string(),
        })
    }

    /// ToString as a string word. Strings come back as-is; anything else is a
    /// fresh unowned string.
    pub(crate) fn to_string_value(&mut self, v: Value) -> VmResult<Value> {
        if v.is_string() {
            return Ok(v);
        }
        let s = self.to_display(v)?;
        Ok(self.heap.alloc_string(&s)?)
    }

    /// Slow path of the binary operators. The result is unowned.
    pub(crate) fn binary(&mut self, op: BinaryOp, a: Value, b: Value) -> VmResult<Value> {
        if let Some(v) = fast_binary(op, a, b) {
            return Ok(v);
        }
        if op == BinaryOp::Add {
            let pa = self.to_primitive(a, Hint::Default)?;
            let pb = match self.with_root(pa, |e| e.to_primitive(b, Hint::Default)) {
                Ok(pb) => pb,
                Err(e) => {
                    self.release(pa)?;
                    return Err(e);
                }
            };
            let result = self.add_primitives(pa, pb);
            self.release(pa)?;
            self.release(pb)?;
            return result;
        }
        let x = self.to_number(a)?;
        let y = self.to_number(b)?;
        Ok(double_binary(op, x, y))
    }

    fn add_primitives(&mut self, a: Value, b: Value) -> VmResult<Value> {
        if a.is_string() || b.is_string() {
            let mut s = self.to_display(a)?;
            s.push_str(&self.to_display(b)?);
            return Ok(self.heap.alloc_string(&s)?);
        }
        let x = self.to_number(a)?;
        let y = self.to_number(b)?;
        Ok(Value::number(x + y))
    }

    /// Unary minus.
    pub(crate) fn negate(&mut self, v: Value) -> VmResult<Value> {
        let x = match v.as_f64() {
            Some(x) => x,
            None => self.to_number(v)?,
        };
        Ok(Value::number(-x))
    }

    pub(crate) fn compare(&mut self, rel: Relation, a: Value, b: Value) -> VmResult<bool> {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return Ok(rel.holds(x, y));
        }
        let pa = self.to_primitive(a, Hint::Number)?;
        let pb = match self.with_root(pa, |e| e.to_primitive(b, Hint::Number)) {
            Ok(pb) => pb,
            Err(e) => {
                self.release(pa)?;
                return Err(e);
            }
        };
        let ordering = match (self.heap.string_of(pa), self.heap.string_of(pb)) {
            (Some(s), Some(t)) => Some(s.encode_utf16().cmp(t.encode_utf16())),
            _ => None,
        };
        let result = match ordering {
            Some(ord) => Ok(rel.holds_ord(ord)),
            None => self
                .to_number(pa)
                .and_then(|x| Ok(rel.holds(x, self.to_number(pb)?))),
        };
        self.release(pa)?;
        self.release(pb)?;
        result
    }

    /// `==`
    pub(crate) fn loose_equals(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if (a.is_number() && b.is_number()) || a.kind() == b.kind() {
            return Ok(strict_equals(&self.heap, a, b));
        }
        if a.is_nullish() || b.is_nullish() {
            return Ok(a.is_nullish() && b.is_nullish());
        }
        if a.is_number() && b.is_string() {
            let y = self.to_number(b)?;
            return Ok(a.as_f64() == Some(y));
        }
        if a.is_string() && b.is_number() {
            let x = self.to_number(a)?;
            return Ok(Some(x) == b.as_f64());
        }
        if a.kind() == Kind::Boolean {
            let x = self.to_number(a)?;
            return self.loose_equals(Value::number(x), b);
        }
        if b.kind() == Kind::Boolean {
            let y = self.to_number(b)?;
            return self.loose_equals(a, Value::number(y));
        }
        let (obj, other) = match (a.is_object(), b.is_object()) {
            (true, false) => (a, b),
            (false, true) => (b, a),
            _ => return Ok(false),
        };
        if !(other.is_number() || other.is_string()) {
            return Ok(false);
        }
        let p = self.to_primitive(obj, Hint::Default)?;
        let result = self.loose_equals(p, other);
        self.release(p)?;
        result
    }

    /// `PrimBinary`: wrapping integer arithmetic in a fixed-width type.
    pub(crate) fn prim_binary(&mut self, op: PrimOp, ty: PrimType, a: Value, b: Value) -> VmResult<Value> {
        let x = ty.wrap(to_int32(self.to_number(a)?) as i64);
        let y = ty.wrap(to_int32(self.to_number(b)?) as i64);
        let shift = (y as u32) & (ty.bits() - 1);
        let r = match op {
            PrimOp::Add => x.wrapping_add(y),
            PrimOp::Sub => x.wrapping_sub(y),
            PrimOp::Mul => x.wrapping_mul(y),
            PrimOp::Div | PrimOp::Rem if y == 0 => {
                return Err(self.throw_error(
                    ErrorKind::RangeError,
                    format!("{} division by zero", ty.name()),
                ));
            }
            PrimOp::Div => x / y,
            PrimOp::Rem => x % y,
            PrimOp::And => x & y,
            PrimOp::Or => x | y,
            PrimOp::Xor => x ^ y,
            PrimOp::Shl => x.wrapping_shl(shift),
            PrimOp::Shr => x >> shift,
        };
        Ok(Value::number(ty.wrap(r) as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::arena::HeapArena;

    fn num(v: Value) -> f64 {
        v.as_f64().unwrap()
    }

    #[test]
    fn test_int_overflow_promotes() {
        let v = fast_binary(BinaryOp::Add, Value::int(i32::MAX), Value::int(1)).unwrap();
        assert_eq!(v.kind(), Kind::Double);
        assert_eq!(num(v), 2147483648.0);
        let v = fast_binary(BinaryOp::Mul, Value::int(65536), Value::int(65536)).unwrap();
        assert_eq!(num(v), 4294967296.0);
    }

    #[test]
    fn test_negative_zero_results() {
        let v = fast_binary(BinaryOp::Mul, Value::int(0), Value::int(-3)).unwrap();
        assert!(num(v) == 0.0 && num(v).is_sign_negative());
        let v = fast_binary(BinaryOp::Rem, Value::int(-4), Value::int(2)).unwrap();
        assert!(num(v).is_sign_negative());
        let v = fast_binary(BinaryOp::Div, Value::int(0), Value::int(-1)).unwrap();
        assert!(num(v).is_sign_negative());
    }

    #[test]
    fn test_division() {
        assert_eq!(fast_binary(BinaryOp::Div, Value::int(6), Value::int(3)), Some(Value::int(2)));
        assert_eq!(num(fast_binary(BinaryOp::Div, Value::int(7), Value::int(2)).unwrap()), 3.5);
        assert_eq!(fast_binary(BinaryOp::Div, Value::int(1), Value::int(0)), Some(Value::INFINITY));
        assert_eq!(fast_binary(BinaryOp::Div, Value::int(0), Value::int(0)), Some(Value::NAN));
        assert_eq!(fast_binary(BinaryOp::Rem, Value::int(5), Value::int(0)), Some(Value::NAN));
        let v = fast_binary(BinaryOp::Div, Value::int(i32::MIN), Value::int(-1)).unwrap();
        assert_eq!(num(v), 2147483648.0);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(fast_binary(BinaryOp::Shl, Value::int(1), Value::int(33)), Some(Value::int(2)));
        assert_eq!(fast_binary(BinaryOp::Shr, Value::int(-8), Value::int(1)), Some(Value::int(-4)));
        let v = fast_binary(BinaryOp::UShr, Value::int(-1), Value::int(0)).unwrap();
        assert_eq!(num(v), 4294967295.0);
        let v = fast_binary(BinaryOp::BitOr, Value::double(4294967296.5), Value::int(0)).unwrap();
        assert_eq!(v, Value::int(0));
    }

    #[test]
    fn test_non_numbers_take_slow_path() {
        assert_eq!(fast_binary(BinaryOp::Add, Value::int(1), Value::UNDEFINED), None);
        assert_eq!(fast_binary(BinaryOp::Sub, Value::TRUE, Value::int(1)), None);
    }

    #[test]
    fn test_strict_equality() {
        let mut heap = Heap::new(HeapArena::new(256 * 1024, 64 * 1024, 64 * 1024), false).unwrap();
        assert!(strict_equals(&heap, Value::int(1), Value::double(1.0)));
        assert!(!strict_equals(&heap, Value::NAN, Value::NAN));
        assert!(strict_equals(&heap, Value::int(0), Value::double(-0.0)));
        let a = heap.alloc_string("abc").unwrap();
        let b = heap.alloc_string("abc").unwrap();
        assert!(strict_equals(&heap, a, b));
        assert!(!strict_equals(&heap, Value::NULL, Value::UNDEFINED));
    }

    #[test]
    fn test_type_of() {
        let mut heap = Heap::new(HeapArena::new(256 * 1024, 64 * 1024, 64 * 1024), false).unwrap();
        let f = heap.alloc_function(0, false, Value::UNDEFINED).unwrap();
        assert_eq!(type_of(&heap, Value::object(f)), "function");
        assert_eq!(type_of(&heap, Value::function(3)), "function");
        assert_eq!(type_of(&heap, Value::NULL), "object");
        assert_eq!(type_of(&heap, Value::NAN), "number");
    }
}
