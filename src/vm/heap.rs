use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use super::arena::{ArenaError, ArenaStats, HeapArena, Region};
use super::error::FatalError;
use super::object::OwnedKey;
use super::prop_cache::PropertyCache;
use super::value::{Kind, Value};

// =============================================================================
// Handles
// =============================================================================

/// Checked handle to a block in the application heap (offset of its header).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcRef {
    offset: u32,
}

impl GcRef {
    pub const NULL: GcRef = GcRef { offset: 0 };

    pub fn new(offset: u32) -> Self {
        Self { offset }
    }

    pub fn offset(self) -> u32 {
        self.offset
    }

    pub fn is_null(self) -> bool {
        self.offset == 0
    }
}

// =============================================================================
// MemHeader Layout (64 bits)
// =============================================================================
//
// +--------+--------+--------+----------+---------------------+
// | tag    | color  | flags  | reserved | refcount (u32)      |
// | byte 0 | byte 1 | byte 2 | byte 3   | bytes 4-7           |
// +--------+--------+--------+----------+---------------------+
//
// - flags bit 0: in-roots (queued as a cycle candidate)
// - flags bit 1: marked (mark-and-sweep backend)
// - A tag of 0 marks a freed block.

pub const HEADER_SIZE: u32 = 8;
const HDR_TAG: u32 = 0;
const HDR_COLOR: u32 = 1;
const HDR_FLAGS: u32 = 2;
const HDR_RC: u32 = 4;

const FLAG_IN_ROOTS: u8 = 1 << 0;
const FLAG_MARKED: u8 = 1 << 1;

/// A refcount that has saturated. Pinned blocks are never released.
pub const RC_PINNED: u32 = u32::MAX;

// Record layouts. Offsets are from the start of the block (header included).

pub(crate) const STR_LEN: u32 = 8;
pub(crate) const STR_DATA: u32 = 16;

pub(crate) const OBJ_CLASS: u32 = 8;
pub(crate) const OBJ_FLAGS: u32 = 9;
pub(crate) const OBJ_BUILTIN_PROTO: u32 = 10;
pub(crate) const OBJ_COUNT: u32 = 12;
pub(crate) const OBJ_HEAD: u32 = 16;
pub(crate) const OBJ_TAIL: u32 = 20;
pub(crate) const OBJ_PROTO: u32 = 24;
pub(crate) const OBJ_PAYLOAD: u32 = 32;
pub(crate) const OBJ_SIZE: u32 = 40;

pub(crate) const OBJ_EXTENSIBLE: u8 = 1 << 0;
pub(crate) const OBJ_PROTO_BUILTIN: u8 = 1 << 1;
pub(crate) const OBJ_IS_PROTOTYPE: u8 = 1 << 2;

pub(crate) const PROP_NEXT: u32 = 8;
pub(crate) const PROP_FLAGS: u32 = 12;
pub(crate) const PROP_KEY: u32 = 16;
pub(crate) const PROP_VALUE: u32 = 24;
pub(crate) const PROP_SIZE: u32 = 32;

pub(crate) const ELEM_LEN: u32 = 8;
pub(crate) const ELEM_CAP: u32 = 12;
pub(crate) const ELEM_DATA: u32 = 16;

const FUNC_CODE: u32 = 8;
const FUNC_ATTRS: u32 = 12;
const FUNC_ENV: u32 = 16;
const FUNC_SIZE: u32 = 24;

const FUNC_ATTR_NATIVE: u32 = 1 << 0;

const ENV_COUNT: u32 = 8;
const ENV_PARENT: u32 = 16;
const ENV_SLOTS: u32 = 24;

/// Allocation tag stored in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemTag {
    String = 1,
    Object = 2,
    Prop = 3,
    Elements = 4,
    Function = 5,
    Env = 6,
}

impl MemTag {
    fn from_u8(b: u8) -> Option<MemTag> {
        Some(match b {
            1 => MemTag::String,
            2 => MemTag::Object,
            3 => MemTag::Prop,
            4 => MemTag::Elements,
            5 => MemTag::Function,
            6 => MemTag::Env,
            _ => return None,
        })
    }
}

/// Cycle-collector color. Only meaningful during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Green = 0,
    Red = 1,
    Blue = 2,
}

/// Object specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectClass {
    Object = 0,
    Array = 1,
    Function = 2,
    StringBox = 3,
    NumberBox = 4,
    BooleanBox = 5,
    Error = 6,
    Arguments = 7,
}

impl ObjectClass {
    fn from_u8(b: u8) -> ObjectClass {
        match b {
            1 => ObjectClass::Array,
            2 => ObjectClass::Function,
            3 => ObjectClass::StringBox,
            4 => ObjectClass::NumberBox,
            5 => ObjectClass::BooleanBox,
            6 => ObjectClass::Error,
            7 => ObjectClass::Arguments,
            _ => ObjectClass::Object,
        }
    }
}

/// Engine-owned prototype objects, referenced inline by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuiltinId {
    ObjectProto = 0,
    FunctionProto = 1,
    ArrayProto = 2,
    ErrorProto = 3,
    StringProto = 4,
    NumberProto = 5,
    BooleanProto = 6,
}

impl BuiltinId {
    pub const COUNT: usize = 7;

    pub const ALL: [BuiltinId; BuiltinId::COUNT] = [
        BuiltinId::ObjectProto,
        BuiltinId::FunctionProto,
        BuiltinId::ArrayProto,
        BuiltinId::ErrorProto,
        BuiltinId::StringProto,
        BuiltinId::NumberProto,
        BuiltinId::BooleanProto,
    ];

    fn from_u8(b: u8) -> BuiltinId {
        BuiltinId::ALL
            .get(b as usize)
            .copied()
            .unwrap_or(BuiltinId::ObjectProto)
    }
}

/// An object's prototype link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Null,
    Builtin(BuiltinId),
    Object(GcRef),
}

/// Decoded function record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionInfo {
    /// Function table index, or native id when `native` is set.
    pub code: u32,
    pub native: bool,
    pub env: Value,
}

/// GC statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GcStats {
    pub strings_allocated: u64,
    pub objects_allocated: u64,
    pub envs_allocated: u64,
    pub strings_live: u64,
    pub objects_live: u64,
    pub envs_live: u64,
    /// Blocks freed because their refcount reached zero.
    pub released: u64,
    pub cycle_passes: u64,
    pub cycle_garbage: u64,
    pub sweep_passes: u64,
    pub sweep_garbage: u64,
    pub candidates: u64,
    pub peak_candidates: u64,
}

/// The application heap: block headers, record layouts and refcounting.
pub struct Heap {
    arena: HeapArena,
    candidates: BTreeSet<GcRef>,
    allocated_since_pass: u64,
    pub(crate) cache: PropertyCache,
    pub(crate) prop_index: HashMap<GcRef, HashMap<OwnedKey, GcRef>>,
    pub(crate) builtins: [GcRef; BuiltinId::COUNT],
    interned: HashMap<String, Value>,
    track_all: bool,
    all: BTreeSet<GcRef>,
    pub(crate) stats: GcStats,
}

impl Heap {
    /// Create a heap over `arena` and install the builtin prototypes.
    ///
    /// `track_all` keeps a set of every string, object and environment, which
    /// the mark-and-sweep backend needs for its sweep phase.
    pub fn new(arena: HeapArena, track_all: bool) -> Result<Self, FatalError> {
        let mut heap = Self {
            arena,
            candidates: BTreeSet::new(),
            allocated_since_pass: 0,
            cache: PropertyCache::new(),
            prop_index: HashMap::new(),
            builtins: [GcRef::NULL; BuiltinId::COUNT],
            interned: HashMap::new(),
            track_all,
            all: BTreeSet::new(),
            stats: GcStats::default(),
        };
        heap.install_builtins()?;
        heap.allocated_since_pass = 0;
        Ok(heap)
    }

    pub fn arena(&self) -> &HeapArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut HeapArena {
        &mut self.arena
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            candidates: self.candidates.len() as u64,
            ..self.stats
        }
    }

    pub fn builtin(&self, id: BuiltinId) -> GcRef {
        self.builtins[id as usize]
    }

    #[inline]
    pub(crate) fn region(&self) -> &Region {
        self.arena.app()
    }

    #[inline]
    pub(crate) fn region_mut(&mut self) -> &mut Region {
        self.arena.app_mut()
    }

    // -------------------------------------------------------------------------
    // Header access
    // -------------------------------------------------------------------------

    pub fn tag(&self, g: GcRef) -> Option<MemTag> {
        if g.is_null() || g.offset() >= self.region().capacity() {
            return None;
        }
        MemTag::from_u8(self.region().read_u8(g.offset() + HDR_TAG))
    }

    /// Whether `g` currently names an allocated block.
    pub fn is_live(&self, g: GcRef) -> bool {
        self.tag(g).is_some()
    }

    pub fn refcount(&self, g: GcRef) -> u32 {
        self.region().read_u32(g.offset() + HDR_RC)
    }

    pub(crate) fn set_refcount(&mut self, g: GcRef, rc: u32) {
        self.region_mut().write_u32(g.offset() + HDR_RC, rc);
    }

    pub fn color(&self, g: GcRef) -> Color {
        match self.region().read_u8(g.offset() + HDR_COLOR) {
            1 => Color::Red,
            2 => Color::Blue,
            _ => Color::Green,
        }
    }

    pub(crate) fn set_color(&mut self, g: GcRef, color: Color) {
        self.region_mut().write_u8(g.offset() + HDR_COLOR, color as u8);
    }

    fn flags(&self, g: GcRef) -> u8 {
        self.region().read_u8(g.offset() + HDR_FLAGS)
    }

    fn set_flag(&mut self, g: GcRef, flag: u8, on: bool) {
        let flags = self.flags(g);
        let flags = if on { flags | flag } else { flags & !flag };
        self.region_mut().write_u8(g.offset() + HDR_FLAGS, flags);
    }

    pub fn in_roots(&self, g: GcRef) -> bool {
        self.flags(g) & FLAG_IN_ROOTS != 0
    }

    pub(crate) fn set_in_roots(&mut self, g: GcRef, on: bool) {
        self.set_flag(g, FLAG_IN_ROOTS, on);
    }

    pub(crate) fn marked(&self, g: GcRef) -> bool {
        self.flags(g) & FLAG_MARKED != 0
    }

    pub(crate) fn set_marked(&mut self, g: GcRef, on: bool) {
        self.set_flag(g, FLAG_MARKED, on);
    }

    /// Make a block immortal.
    pub fn pin(&mut self, v: Value) {
        if let Some(g) = v.as_ref() {
            self.set_refcount(g, RC_PINNED);
        }
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    fn alloc_block(&mut self, tag: MemTag, size: u32) -> Result<GcRef, ArenaError> {
        let offset = self.arena.alloc(size, true)?;
        let g = GcRef::new(offset);
        self.region_mut().write_u8(offset + HDR_TAG, tag as u8);
        self.allocated_since_pass += size as u64;
        match tag {
            MemTag::String => {
                self.stats.strings_allocated += 1;
                self.stats.strings_live += 1;
            }
            MemTag::Object => {
                self.stats.objects_allocated += 1;
                self.stats.objects_live += 1;
            }
            MemTag::Env => {
                self.stats.envs_allocated += 1;
                self.stats.envs_live += 1;
            }
            _ => {}
        }
        if self.track_all && matches!(tag, MemTag::String | MemTag::Object | MemTag::Env) {
            self.all.insert(g);
        }
        Ok(g)
    }

    /// Size in bytes of the block at `g`, derived from its contents.
    fn block_size(&self, g: GcRef) -> u32 {
        let r = self.region();
        match self.tag(g) {
            Some(MemTag::String) => STR_DATA + r.read_u32(g.offset() + STR_LEN),
            Some(MemTag::Object) => OBJ_SIZE,
            Some(MemTag::Prop) => PROP_SIZE,
            Some(MemTag::Elements) => ELEM_DATA + 8 * r.read_u32(g.offset() + ELEM_CAP),
            Some(MemTag::Function) => FUNC_SIZE,
            Some(MemTag::Env) => ENV_SLOTS + 8 * r.read_u32(g.offset() + ENV_COUNT),
            None => 0,
        }
    }

    pub fn alloc_string(&mut self, s: &str) -> Result<Value, ArenaError> {
        let len = u32::try_from(s.len())
            .ok()
            .and_then(|len| len.checked_add(STR_DATA).map(|_| len))
            .ok_or(ArenaError::Exhausted {
                region: "application",
                requested: u32::MAX,
            })?;
        let g = self.alloc_block(MemTag::String, STR_DATA + len)?;
        let r = self.region_mut();
        r.write_u32(g.offset() + STR_LEN, len);
        r.slice_mut(g.offset() + STR_DATA, len).copy_from_slice(s.as_bytes());
        Ok(Value::string(g))
    }

    /// A pinned string shared by every caller asking for the same contents.
    pub fn intern(&mut self, s: &str) -> Result<Value, ArenaError> {
        if let Some(&v) = self.interned.get(s) {
            return Ok(v);
        }
        let v = self.alloc_string(s)?;
        self.pin(v);
        self.interned.insert(s.to_string(), v);
        Ok(v)
    }

    /// Whether `v` is an interned (pinned) string.
    pub fn is_interned(&self, v: Value) -> bool {
        v.as_string().is_some_and(|g| self.refcount(g) == RC_PINNED)
    }

    /// Contents of the string block at `g`.
    pub fn str(&self, g: GcRef) -> &str {
        let len = self.region().read_u32(g.offset() + STR_LEN);
        std::str::from_utf8(self.region().slice(g.offset() + STR_DATA, len)).unwrap_or_default()
    }

    pub fn string_of(&self, v: Value) -> Option<&str> {
        v.as_string().map(|g| self.str(g))
    }

    pub fn alloc_object(&mut self, class: ObjectClass, proto: Proto) -> Result<GcRef, ArenaError> {
        let g = self.alloc_block(MemTag::Object, OBJ_SIZE)?;
        let r = self.region_mut();
        r.write_u8(g.offset() + OBJ_CLASS, class as u8);
        r.write_u8(g.offset() + OBJ_FLAGS, OBJ_EXTENSIBLE);
        r.write_u64(g.offset() + OBJ_PROTO, Value::NULL.bits());
        self.write_proto(g, proto);
        Ok(g)
    }

    pub fn object_class(&self, g: GcRef) -> ObjectClass {
        ObjectClass::from_u8(self.region().read_u8(g.offset() + OBJ_CLASS))
    }

    pub(crate) fn object_flags(&self, g: GcRef) -> u8 {
        self.region().read_u8(g.offset() + OBJ_FLAGS)
    }

    pub(crate) fn set_object_flags(&mut self, g: GcRef, flags: u8) {
        self.region_mut().write_u8(g.offset() + OBJ_FLAGS, flags);
    }

    pub(crate) fn payload(&self, g: GcRef) -> u64 {
        self.region().read_u64(g.offset() + OBJ_PAYLOAD)
    }

    pub(crate) fn set_payload(&mut self, g: GcRef, payload: u64) {
        self.region_mut().write_u64(g.offset() + OBJ_PAYLOAD, payload);
    }

    /// Primitive held by a StringBox/NumberBox/BooleanBox.
    pub fn boxed_primitive(&self, g: GcRef) -> Option<Value> {
        match self.object_class(g) {
            ObjectClass::StringBox | ObjectClass::NumberBox | ObjectClass::BooleanBox => {
                Value::from_bits(self.payload(g))
            }
            _ => None,
        }
    }

    /// Store a primitive in a box object, taking a reference to it.
    pub fn set_boxed_primitive(&mut self, g: GcRef, v: Value) {
        self.inc_ref(v);
        self.set_payload(g, v.bits());
    }

    pub fn proto(&self, g: GcRef) -> Proto {
        let flags = self.object_flags(g);
        if flags & OBJ_PROTO_BUILTIN != 0 {
            return Proto::Builtin(BuiltinId::from_u8(
                self.region().read_u8(g.offset() + OBJ_BUILTIN_PROTO),
            ));
        }
        match Value::from_bits(self.region().read_u64(g.offset() + OBJ_PROTO)).and_then(Value::as_object) {
            Some(p) => Proto::Object(p),
            None => Proto::Null,
        }
    }

    /// Resolved prototype object, if any.
    pub fn proto_object(&self, g: GcRef) -> Option<GcRef> {
        match self.proto(g) {
            Proto::Null => None,
            Proto::Builtin(id) => Some(self.builtin(id)).filter(|p| !p.is_null()),
            Proto::Object(p) => Some(p),
        }
    }

    fn write_proto(&mut self, g: GcRef, proto: Proto) {
        let flags = self.object_flags(g);
        match proto {
            Proto::Null => {
                self.set_object_flags(g, flags & !OBJ_PROTO_BUILTIN);
                self.region_mut().write_u64(g.offset() + OBJ_PROTO, Value::NULL.bits());
            }
            Proto::Builtin(id) => {
                self.set_object_flags(g, flags | OBJ_PROTO_BUILTIN);
                self.region_mut().write_u8(g.offset() + OBJ_BUILTIN_PROTO, id as u8);
                self.region_mut().write_u64(g.offset() + OBJ_PROTO, Value::NULL.bits());
            }
            Proto::Object(p) => {
                self.inc_ref(Value::object(p));
                self.set_object_flags(g, flags & !OBJ_PROTO_BUILTIN);
                self.region_mut().write_u64(g.offset() + OBJ_PROTO, Value::object(p).bits());
                let pflags = self.object_flags(p);
                self.set_object_flags(p, pflags | OBJ_IS_PROTOTYPE);
            }
        }
    }

    /// Replace the prototype link. Returns false if it would form a cycle.
    pub fn set_proto(&mut self, g: GcRef, proto: Proto) -> Result<bool, FatalError> {
        if let Proto::Object(p) = proto {
            let mut cursor = Some(p);
            while let Some(c) = cursor {
                if c == g {
                    return Ok(false);
                }
                cursor = self.proto_object(c);
            }
        }
        let old = self.proto(g);
        self.write_proto(g, proto);
        if let Proto::Object(old) = old {
            self.dec_ref(Value::object(old))?;
        }
        self.cache.invalidate_all();
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Function records
    // -------------------------------------------------------------------------

    /// A Function-class object over interpreted code or a native.
    pub fn alloc_function(&mut self, code: u32, native: bool, env: Value) -> Result<GcRef, ArenaError> {
        let obj = self.alloc_object(ObjectClass::Function, Proto::Builtin(BuiltinId::FunctionProto))?;
        let rec = self.alloc_block(MemTag::Function, FUNC_SIZE)?;
        self.inc_ref(env);
        let r = self.region_mut();
        r.write_u32(rec.offset() + FUNC_CODE, code);
        r.write_u32(rec.offset() + FUNC_ATTRS, if native { FUNC_ATTR_NATIVE } else { 0 });
        r.write_u64(rec.offset() + FUNC_ENV, env.bits());
        self.set_payload(obj, rec.offset() as u64);
        Ok(obj)
    }

    pub fn function_info(&self, obj: GcRef) -> Option<FunctionInfo> {
        if self.object_class(obj) != ObjectClass::Function {
            return None;
        }
        let rec = self.payload(obj) as u32;
        if rec == 0 {
            return None;
        }
        let r = self.region();
        Some(FunctionInfo {
            code: r.read_u32(rec + FUNC_CODE),
            native: r.read_u32(rec + FUNC_ATTRS) & FUNC_ATTR_NATIVE != 0,
            env: Value::from_bits(r.read_u64(rec + FUNC_ENV)).unwrap_or(Value::UNDEFINED),
        })
    }

    // -------------------------------------------------------------------------
    // Environments
    // -------------------------------------------------------------------------

    /// A closure environment with `count` uninitialized slots.
    pub fn alloc_env(&mut self, count: u32, parent: Value) -> Result<GcRef, ArenaError> {
        let size = count
            .checked_mul(8)
            .and_then(|n| n.checked_add(ENV_SLOTS))
            .ok_or(ArenaError::Exhausted {
                region: "application",
                requested: u32::MAX,
            })?;
        let g = self.alloc_block(MemTag::Env, size)?;
        self.inc_ref(parent);
        let r = self.region_mut();
        r.write_u32(g.offset() + ENV_COUNT, count);
        r.write_u64(g.offset() + ENV_PARENT, parent.bits());
        for i in 0..count {
            r.write_u64(g.offset() + ENV_SLOTS + 8 * i, Value::NONE.bits());
        }
        Ok(g)
    }

    pub fn env_count(&self, g: GcRef) -> u32 {
        self.region().read_u32(g.offset() + ENV_COUNT)
    }

    pub fn env_parent(&self, g: GcRef) -> Value {
        Value::from_bits(self.region().read_u64(g.offset() + ENV_PARENT)).unwrap_or(Value::UNDEFINED)
    }

    pub fn env_get(&self, g: GcRef, slot: u32) -> Option<Value> {
        if slot >= self.env_count(g) {
            return None;
        }
        Value::from_bits(self.region().read_u64(g.offset() + ENV_SLOTS + 8 * slot))
    }

    /// Store into an environment slot. Returns false when out of range.
    pub fn env_set(&mut self, g: GcRef, slot: u32, v: Value) -> Result<bool, FatalError> {
        let Some(old) = self.env_get(g, slot) else {
            return Ok(false);
        };
        self.inc_ref(v);
        self.region_mut().write_u64(g.offset() + ENV_SLOTS + 8 * slot, v.bits());
        self.dec_ref(old)?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Element vectors
    // -------------------------------------------------------------------------

    pub(crate) fn alloc_elements(&mut self, cap: u32) -> Result<GcRef, ArenaError> {
        let g = self.alloc_block(MemTag::Elements, ELEM_DATA + 8 * cap)?;
        let r = self.region_mut();
        r.write_u32(g.offset() + ELEM_CAP, cap);
        for i in 0..cap {
            r.write_u64(g.offset() + ELEM_DATA + 8 * i, Value::NONE.bits());
        }
        Ok(g)
    }

    /// Grow an element vector to at least `min_cap` slots, returning its
    /// possibly moved handle. New slots are holes.
    pub(crate) fn grow_elements(&mut self, g: GcRef, min_cap: u32) -> Result<GcRef, ArenaError> {
        let cap = self.region().read_u32(g.offset() + ELEM_CAP);
        if min_cap <= cap {
            return Ok(g);
        }
        let new_cap = min_cap.max(cap.saturating_mul(2)).max(4);
        let old_size = ELEM_DATA + 8 * cap;
        let new_size = new_cap
            .checked_mul(8)
            .and_then(|n| n.checked_add(ELEM_DATA))
            .ok_or(ArenaError::Exhausted {
                region: "application",
                requested: u32::MAX,
            })?;
        let offset = self.arena.realloc(g.offset(), old_size, new_size)?;
        let r = self.region_mut();
        r.write_u32(offset + ELEM_CAP, new_cap);
        for i in cap..new_cap {
            r.write_u64(offset + ELEM_DATA + 8 * i, Value::NONE.bits());
        }
        Ok(GcRef::new(offset))
    }

    pub(crate) fn elements_len(&self, g: GcRef) -> u32 {
        self.region().read_u32(g.offset() + ELEM_LEN)
    }

    pub(crate) fn set_elements_len(&mut self, g: GcRef, len: u32) {
        self.region_mut().write_u32(g.offset() + ELEM_LEN, len);
    }

    pub(crate) fn elements_cap(&self, g: GcRef) -> u32 {
        self.region().read_u32(g.offset() + ELEM_CAP)
    }

    pub(crate) fn element(&self, g: GcRef, i: u32) -> Value {
        Value::from_bits(self.region().read_u64(g.offset() + ELEM_DATA + 8 * i)).unwrap_or(Value::NONE)
    }

    /// Raw slot write; the caller manages refcounts.
    pub(crate) fn write_element(&mut self, g: GcRef, i: u32, v: Value) {
        self.region_mut().write_u64(g.offset() + ELEM_DATA + 8 * i, v.bits());
    }

    // -------------------------------------------------------------------------
    // Reference counting
    // -------------------------------------------------------------------------

    /// Take a reference to `v` if it is a heap kind.
    pub fn inc_ref(&mut self, v: Value) {
        if let Some(g) = v.as_ref() {
            let rc = self.refcount(g);
            if rc != RC_PINNED {
                self.set_refcount(g, rc + 1);
            }
        }
    }

    /// Drop a reference to `v`. Reaching zero releases the block and,
    /// transitively, everything it owned.
    pub fn dec_ref(&mut self, v: Value) -> Result<(), FatalError> {
        let Some(g) = v.as_ref() else {
            return Ok(());
        };
        let rc = self.refcount(g);
        if rc == RC_PINNED {
            return Ok(());
        }
        if rc == 0 || !self.is_live(g) {
            return Err(FatalError::GcInvariant(format!(
                "decrement of unowned block @{}",
                g.offset()
            )));
        }
        self.set_refcount(g, rc - 1);
        if rc == 1 {
            self.release(g)
        } else {
            self.note_candidate(g);
            Ok(())
        }
    }

    /// Release a freshly allocated block that never gained an owner.
    pub fn release_if_floating(&mut self, v: Value) -> Result<(), FatalError> {
        if let Some(g) = v.as_ref()
            && self.is_live(g)
            && self.refcount(g) == 0
        {
            self.release(g)?;
        }
        Ok(())
    }

    /// A refcount that survived a decrement may be held up only by a cycle.
    fn note_candidate(&mut self, g: GcRef) {
        if matches!(self.tag(g), Some(MemTag::Object | MemTag::Env)) && !self.in_roots(g) {
            self.set_in_roots(g, true);
            self.candidates.insert(g);
            self.stats.peak_candidates = self.stats.peak_candidates.max(self.candidates.len() as u64);
        }
    }

    fn release(&mut self, root: GcRef) -> Result<(), FatalError> {
        let mut work = vec![root];
        while let Some(g) = work.pop() {
            let children = self.owned_words(g);
            self.free_record(g)?;
            self.stats.released += 1;
            for child in children {
                let Some(c) = child.as_ref() else { continue };
                let rc = self.refcount(c);
                if rc == RC_PINNED {
                    continue;
                }
                if rc == 0 {
                    return Err(FatalError::GcInvariant(format!(
                        "child @{} of released block already dead",
                        c.offset()
                    )));
                }
                self.set_refcount(c, rc - 1);
                if rc == 1 {
                    work.push(c);
                } else {
                    self.note_candidate(c);
                }
            }
        }
        Ok(())
    }

    /// Every refcounted word owned by the block at `g`.
    pub(crate) fn owned_words(&self, g: GcRef) -> Vec<Value> {
        let mut out = Vec::new();
        match self.tag(g) {
            Some(MemTag::Object) => {
                let mut prop = self.prop_head(g);
                while !prop.is_null() {
                    let (key, value) = (self.prop_key_word(prop), self.prop_value(prop));
                    if key.needs_rc() && !self.prop_is_index(prop) {
                        out.push(key);
                    }
                    if value.needs_rc() {
                        out.push(value);
                    }
                    prop = self.prop_next(prop);
                }
                if let Proto::Object(p) = self.proto(g) {
                    out.push(Value::object(p));
                }
                match self.object_class(g) {
                    ObjectClass::Array | ObjectClass::Arguments => {
                        let elems = GcRef::new(self.payload(g) as u32);
                        if !elems.is_null() {
                            for i in 0..self.elements_len(elems) {
                                let v = self.element(elems, i);
                                if v.needs_rc() {
                                    out.push(v);
                                }
                            }
                        }
                    }
                    ObjectClass::Function => {
                        if let Some(info) = self.function_info(g)
                            && info.env.needs_rc()
                        {
                            out.push(info.env);
                        }
                    }
                    ObjectClass::StringBox | ObjectClass::NumberBox | ObjectClass::BooleanBox => {
                        if let Some(v) = self.boxed_primitive(g)
                            && v.needs_rc()
                        {
                            out.push(v);
                        }
                    }
                    _ => {}
                }
            }
            Some(MemTag::Env) => {
                let parent = self.env_parent(g);
                if parent.needs_rc() {
                    out.push(parent);
                }
                for i in 0..self.env_count(g) {
                    if let Some(v) = self.env_get(g, i)
                        && v.needs_rc()
                    {
                        out.push(v);
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Object and environment children, the nodes a cycle can run through.
    pub(crate) fn node_children(&self, g: GcRef) -> Vec<GcRef> {
        self.owned_words(g)
            .into_iter()
            .filter(|v| matches!(v.kind(), Kind::Object | Kind::Env))
            .filter_map(Value::as_ref)
            .collect()
    }

    /// Return a block and its private sub-records to the arena without
    /// touching the refcounts of anything it referenced.
    fn free_record(&mut self, g: GcRef) -> Result<(), FatalError> {
        match self.tag(g) {
            Some(MemTag::String) => self.stats.strings_live -= 1,
            Some(MemTag::Env) => self.stats.envs_live -= 1,
            Some(MemTag::Object) => {
                self.stats.objects_live -= 1;
                let mut prop = self.prop_head(g);
                while !prop.is_null() {
                    let next = self.prop_next(prop);
                    self.free_sub_record(prop)?;
                    prop = next;
                }
                match self.object_class(g) {
                    ObjectClass::Array | ObjectClass::Arguments | ObjectClass::Function => {
                        let sub = GcRef::new(self.payload(g) as u32);
                        if !sub.is_null() {
                            self.free_sub_record(sub)?;
                        }
                    }
                    _ => {}
                }
                self.prop_index.remove(&g);
                // The handle may be reused by the next allocation.
                self.cache.invalidate_all();
            }
            _ => {
                return Err(FatalError::GcInvariant(format!(
                    "free of non-root block @{}",
                    g.offset()
                )));
            }
        }
        if self.in_roots(g) {
            self.candidates.remove(&g);
        }
        if self.track_all {
            self.all.remove(&g);
        }
        self.free_sub_record(g)
    }

    fn free_sub_record(&mut self, g: GcRef) -> Result<(), FatalError> {
        let size = self.block_size(g);
        if size == 0 {
            return Err(FatalError::GcInvariant(format!("double free of @{}", g.offset())));
        }
        self.region_mut().write_u8(g.offset() + HDR_TAG, 0);
        self.region_mut().write_u8(g.offset() + HDR_FLAGS, 0);
        self.arena.free(g.offset(), size)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Collector hooks
    // -------------------------------------------------------------------------

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn allocated_since_pass(&self) -> u64 {
        self.allocated_since_pass
    }

    pub(crate) fn take_candidates(&mut self) -> Vec<GcRef> {
        std::mem::take(&mut self.candidates).into_iter().collect()
    }

    pub(crate) fn all_blocks(&self) -> Vec<GcRef> {
        self.all.iter().copied().collect()
    }

    pub(crate) fn tracks_all(&self) -> bool {
        self.track_all
    }

    pub(crate) fn finish_pass(&mut self) {
        self.allocated_since_pass = 0;
    }

    /// Free a block found to be garbage by a collector. Only the children
    /// selected by `release_child` have their refcounts dropped.
    pub(crate) fn free_garbage(
        &mut self,
        g: GcRef,
        release_child: &dyn Fn(&Heap, Value) -> bool,
    ) -> Result<(), FatalError> {
        if !self.is_live(g) {
            return Ok(());
        }
        let children: Vec<Value> = self
            .owned_words(g)
            .into_iter()
            .filter(|&v| release_child(self, v))
            .collect();
        self.free_record(g)?;
        for child in children {
            self.dec_ref(child)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(HeapArena::new(256 * 1024, 64 * 1024, 64 * 1024), false).unwrap()
    }

    #[test]
    fn test_builtins_are_pinned() {
        let heap = heap();
        for id in BuiltinId::ALL {
            let g = heap.builtin(id);
            assert_eq!(heap.tag(g), Some(MemTag::Object));
            assert_eq!(heap.refcount(g), RC_PINNED);
        }
        assert_eq!(heap.proto(heap.builtin(BuiltinId::ObjectProto)), Proto::Null);
        assert_eq!(
            heap.proto(heap.builtin(BuiltinId::ArrayProto)),
            Proto::Builtin(BuiltinId::ObjectProto)
        );
    }

    #[test]
    fn test_string_roundtrip() {
        let mut heap = heap();
        let s = heap.alloc_string("héllo").unwrap();
        assert_eq!(heap.string_of(s), Some("héllo"));
        assert_eq!(heap.refcount(s.as_string().unwrap()), 0);
    }

    #[test]
    fn test_inc_dec_frees_at_zero() {
        let mut heap = heap();
        let s = heap.alloc_string("x").unwrap();
        let g = s.as_string().unwrap();
        heap.inc_ref(s);
        heap.inc_ref(s);
        heap.dec_ref(s).unwrap();
        assert!(heap.is_live(g));
        heap.dec_ref(s).unwrap();
        assert!(!heap.is_live(g));
        assert_eq!(heap.stats().strings_live, 0);
    }

    #[test]
    fn test_dec_of_dead_block_is_fatal() {
        let mut heap = heap();
        let s = heap.alloc_string("x").unwrap();
        heap.inc_ref(s);
        heap.dec_ref(s).unwrap();
        assert!(matches!(heap.dec_ref(s), Err(FatalError::GcInvariant(_))));
    }

    #[test]
    fn test_release_recurses_into_children() {
        let mut heap = heap();
        let env = heap.alloc_env(2, Value::UNDEFINED).unwrap();
        let s = heap.alloc_string("captured").unwrap();
        heap.env_set(env, 0, s).unwrap();
        let f = heap.alloc_function(3, false, Value::env(env)).unwrap();
        heap.inc_ref(Value::object(f));
        assert_eq!(heap.refcount(env), 1);

        heap.dec_ref(Value::object(f)).unwrap();
        assert!(!heap.is_live(f));
        assert!(!heap.is_live(env));
        assert!(!heap.is_live(s.as_string().unwrap()));
    }

    #[test]
    fn test_surviving_decrement_marks_candidate() {
        let mut heap = heap();
        let obj = heap.alloc_object(ObjectClass::Object, Proto::Builtin(BuiltinId::ObjectProto)).unwrap();
        let v = Value::object(obj);
        heap.inc_ref(v);
        heap.inc_ref(v);
        heap.dec_ref(v).unwrap();
        assert!(heap.in_roots(obj));
        assert_eq!(heap.candidate_count(), 1);
        heap.dec_ref(v).unwrap();
        assert_eq!(heap.candidate_count(), 0);
    }

    #[test]
    fn test_pinned_blocks_survive() {
        let mut heap = heap();
        let s = heap.alloc_string("pinned").unwrap();
        heap.pin(s);
        heap.dec_ref(s).unwrap();
        heap.dec_ref(s).unwrap();
        assert!(heap.is_live(s.as_string().unwrap()));
    }

    #[test]
    fn test_release_if_floating() {
        let mut heap = heap();
        let s = heap.alloc_string("tmp").unwrap();
        heap.release_if_floating(s).unwrap();
        assert!(!heap.is_live(s.as_string().unwrap()));
    }

    #[test]
    fn test_proto_cycle_rejected() {
        let mut heap = heap();
        let a = heap.alloc_object(ObjectClass::Object, Proto::Null).unwrap();
        let b = heap.alloc_object(ObjectClass::Object, Proto::Object(a)).unwrap();
        assert!(!heap.set_proto(a, Proto::Object(b)).unwrap());
        assert_eq!(heap.refcount(a), 1);
    }

    #[test]
    fn test_env_set_out_of_range() {
        let mut heap = heap();
        let env = heap.alloc_env(1, Value::UNDEFINED).unwrap();
        assert!(!heap.env_set(env, 1, Value::int(1)).unwrap());
        assert_eq!(heap.env_get(env, 0), Some(Value::NONE));
    }

    #[test]
    fn test_grow_elements_fills_holes() {
        let mut heap = heap();
        let e = heap.alloc_elements(2).unwrap();
        heap.write_element(e, 0, Value::int(7));
        let e = heap.grow_elements(e, 9).unwrap();
        assert!(heap.elements_cap(e) >= 9);
        assert_eq!(heap.element(e, 0), Value::int(7));
        assert_eq!(heap.element(e, 8), Value::NONE);
    }
}
