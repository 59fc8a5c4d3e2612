use std::fmt;

use super::heap::GcRef;

// =============================================================================
// Word layout
// =============================================================================
//
// +------------------+----------+--------------------------------------+
// | prefix 0xFFFA    | tag (8)  | payload (40)                         |
// | bits 48-63       | bits 40-47 | bits 0-39                          |
// +------------------+----------+--------------------------------------+
//
// Any word whose top 16 bits differ from the prefix is a finite f64. NaN and
// the infinities are never stored raw, so the prefix space is free for tags.

const BOX_PREFIX: u64 = 0xFFFA_0000_0000_0000;
const PREFIX_MASK: u64 = 0xFFFF_0000_0000_0000;
const TAG_SHIFT: u32 = 40;
const TAG_MASK: u64 = 0xFF << TAG_SHIFT;
const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Discriminant of a value word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Uninitialized slot. Reading one is a ReferenceError.
    None = 0,
    Undefined = 1,
    Null = 2,
    Boolean = 3,
    Int32 = 4,
    NaN = 5,
    /// Payload 0 for +Infinity, 1 for -Infinity.
    Infinity = 6,
    String = 7,
    Object = 8,
    /// Raw code reference (function table index), not refcounted.
    Function = 9,
    Env = 10,
    SpBase = 11,
    FpBase = 12,
    GpBase = 13,
    /// Unboxed finite double. Never stored in the tag byte.
    Double = 0xFF,
}

impl Kind {
    fn from_tag(tag: u8) -> Option<Kind> {
        Some(match tag {
            0 => Kind::None,
            1 => Kind::Undefined,
            2 => Kind::Null,
            3 => Kind::Boolean,
            4 => Kind::Int32,
            5 => Kind::NaN,
            6 => Kind::Infinity,
            7 => Kind::String,
            8 => Kind::Object,
            9 => Kind::Function,
            10 => Kind::Env,
            11 => Kind::SpBase,
            12 => Kind::FpBase,
            13 => Kind::GpBase,
            _ => return None,
        })
    }

    /// Kinds whose payload is a heap handle owned through a refcount.
    pub fn needs_rc(self) -> bool {
        matches!(self, Kind::String | Kind::Object | Kind::Env)
    }

    pub fn is_number(self) -> bool {
        matches!(self, Kind::Int32 | Kind::Double | Kind::NaN | Kind::Infinity)
    }
}

/// A tagged 64-bit value word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const NONE: Value = Value::boxed(Kind::None, 0);
    pub const UNDEFINED: Value = Value::boxed(Kind::Undefined, 0);
    pub const NULL: Value = Value::boxed(Kind::Null, 0);
    pub const TRUE: Value = Value::boxed(Kind::Boolean, 1);
    pub const FALSE: Value = Value::boxed(Kind::Boolean, 0);
    pub const NAN: Value = Value::boxed(Kind::NaN, 0);
    pub const INFINITY: Value = Value::boxed(Kind::Infinity, 0);
    pub const NEG_INFINITY: Value = Value::boxed(Kind::Infinity, 1);

    const fn boxed(kind: Kind, payload: u64) -> Value {
        Value(BOX_PREFIX | ((kind as u64) << TAG_SHIFT) | (payload & PAYLOAD_MASK))
    }

    /// Build a word from a kind and a payload.
    ///
    /// For `Double` the payload is the raw f64 bit pattern and must describe a
    /// finite number; other kinds keep the low 40 bits.
    pub fn encode(kind: Kind, payload: u64) -> Value {
        match kind {
            Kind::Double => {
                debug_assert!(f64::from_bits(payload).is_finite(), "non-finite raw double");
                Value(payload)
            }
            _ => Value::boxed(kind, payload),
        }
    }

    /// Split a word into its kind and payload. Inverse of [`Value::encode`].
    pub fn decode(self) -> (Kind, u64) {
        let kind = self.kind();
        match kind {
            Kind::Double => (kind, self.0),
            _ => (kind, self.0 & PAYLOAD_MASK),
        }
    }

    #[inline]
    fn is_boxed(self) -> bool {
        self.0 & PREFIX_MASK == BOX_PREFIX
    }

    #[inline]
    pub fn kind(self) -> Kind {
        if !self.is_boxed() {
            return Kind::Double;
        }
        let tag = ((self.0 & TAG_MASK) >> TAG_SHIFT) as u8;
        // Boxed words are only ever produced by `boxed`, so the tag is known.
        Kind::from_tag(tag).unwrap_or(Kind::None)
    }

    #[inline]
    fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Option<Value> {
        let v = Value(bits);
        if v.is_boxed() && Kind::from_tag(((bits & TAG_MASK) >> TAG_SHIFT) as u8).is_none() {
            return None;
        }
        Some(v)
    }

    // -------------------------------------------------------------------------
    // Constructors
    // -------------------------------------------------------------------------

    pub fn bool(b: bool) -> Value {
        if b { Value::TRUE } else { Value::FALSE }
    }

    pub fn int(n: i32) -> Value {
        Value::boxed(Kind::Int32, n as u32 as u64)
    }

    /// A double-tagged number. NaN and the infinities get their own tags.
    pub fn double(f: f64) -> Value {
        if f.is_nan() {
            Value::NAN
        } else if f.is_infinite() {
            if f > 0.0 { Value::INFINITY } else { Value::NEG_INFINITY }
        } else {
            Value(f.to_bits())
        }
    }

    /// A number, narrowed to Int32 when the value is integral and fits.
    pub fn number(f: f64) -> Value {
        if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 {
            if f == 0.0 && f.is_sign_negative() {
                return Value::double(f);
            }
            return Value::int(f as i32);
        }
        Value::double(f)
    }

    pub fn string(r: GcRef) -> Value {
        Value::boxed(Kind::String, r.offset() as u64)
    }

    pub fn object(r: GcRef) -> Value {
        Value::boxed(Kind::Object, r.offset() as u64)
    }

    pub fn env(r: GcRef) -> Value {
        Value::boxed(Kind::Env, r.offset() as u64)
    }

    pub fn function(index: u32) -> Value {
        Value::boxed(Kind::Function, index as u64)
    }

    pub fn base(kind: Kind, offset: u32) -> Value {
        debug_assert!(matches!(kind, Kind::SpBase | Kind::FpBase | Kind::GpBase));
        Value::boxed(kind, offset as u64)
    }

    // -------------------------------------------------------------------------
    // Predicates and accessors
    // -------------------------------------------------------------------------

    pub fn is_none(self) -> bool {
        self == Value::NONE
    }

    pub fn is_undefined(self) -> bool {
        self == Value::UNDEFINED
    }

    pub fn is_null(self) -> bool {
        self == Value::NULL
    }

    pub fn is_nullish(self) -> bool {
        self.is_undefined() || self.is_null()
    }

    pub fn is_number(self) -> bool {
        self.kind().is_number()
    }

    pub fn is_string(self) -> bool {
        self.kind() == Kind::String
    }

    pub fn is_object(self) -> bool {
        self.kind() == Kind::Object
    }

    pub fn needs_rc(self) -> bool {
        self.kind().needs_rc()
    }

    pub fn as_bool(self) -> Option<bool> {
        match self.kind() {
            Kind::Boolean => Some(self.payload() != 0),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self.kind() {
            Kind::Int32 => Some(self.payload() as u32 as i32),
            _ => None,
        }
    }

    /// Numeric payload of any number kind.
    pub fn as_f64(self) -> Option<f64> {
        match self.kind() {
            Kind::Double => Some(f64::from_bits(self.0)),
            Kind::Int32 => Some(self.payload() as u32 as i32 as f64),
            Kind::NaN => Some(f64::NAN),
            Kind::Infinity => Some(if self.payload() == 0 {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            }),
            _ => None,
        }
    }

    /// Heap handle of a refcounted word.
    pub fn as_ref(self) -> Option<GcRef> {
        if self.needs_rc() {
            Some(GcRef::new(self.payload() as u32))
        } else {
            None
        }
    }

    pub fn as_object(self) -> Option<GcRef> {
        match self.kind() {
            Kind::Object => Some(GcRef::new(self.payload() as u32)),
            _ => None,
        }
    }

    pub fn as_string(self) -> Option<GcRef> {
        match self.kind() {
            Kind::String => Some(GcRef::new(self.payload() as u32)),
            _ => None,
        }
    }

    pub fn as_env(self) -> Option<GcRef> {
        match self.kind() {
            Kind::Env => Some(GcRef::new(self.payload() as u32)),
            _ => None,
        }
    }

    pub fn as_function(self) -> Option<u32> {
        match self.kind() {
            Kind::Function => Some(self.payload() as u32),
            _ => None,
        }
    }

    /// ToBoolean for everything but strings, which need their length.
    pub fn truthy_primitive(self) -> Option<bool> {
        match self.kind() {
            Kind::None | Kind::Undefined | Kind::Null | Kind::NaN => Some(false),
            Kind::Boolean => Some(self.payload() != 0),
            Kind::Int32 => Some(self.payload() != 0),
            Kind::Double => Some(f64::from_bits(self.0) != 0.0),
            Kind::Infinity => Some(true),
            Kind::Object | Kind::Function | Kind::Env => Some(true),
            Kind::SpBase | Kind::FpBase | Kind::GpBase => Some(true),
            Kind::String => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::UNDEFINED
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Kind::None => write!(f, "None"),
            Kind::Undefined => write!(f, "Undefined"),
            Kind::Null => write!(f, "Null"),
            Kind::Boolean => write!(f, "Boolean({})", self.payload() != 0),
            Kind::Int32 => write!(f, "Int32({})", self.payload() as u32 as i32),
            Kind::Double => write!(f, "Double({:?})", f64::from_bits(self.0)),
            Kind::NaN => write!(f, "NaN"),
            Kind::Infinity if self.payload() == 0 => write!(f, "Infinity"),
            Kind::Infinity => write!(f, "-Infinity"),
            Kind::String => write!(f, "String(@{})", self.payload()),
            Kind::Object => write!(f, "Object(@{})", self.payload()),
            Kind::Function => write!(f, "Function(#{})", self.payload()),
            Kind::Env => write!(f, "Env(@{})", self.payload()),
            Kind::SpBase => write!(f, "SpBase({})", self.payload()),
            Kind::FpBase => write!(f, "FpBase({})", self.payload()),
            Kind::GpBase => write!(f, "GpBase({})", self.payload()),
        }
    }
}
