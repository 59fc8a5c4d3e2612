//! Property storage on heap objects.
//!
//! Properties are a singly linked list of Prop records hanging off the object,
//! in insertion order. Objects that grow past [`INDEX_THRESHOLD`] properties
//! also get a hash index from key to record. Arrays and arguments objects keep
//! their indexed elements in a separate Elements vector.

use std::collections::HashMap;

use super::convert::{array_index, number_to_index};
use super::error::FatalError;
use super::heap::{
    BuiltinId, GcRef, Heap, MemTag, OBJ_COUNT, OBJ_EXTENSIBLE, OBJ_HEAD, OBJ_IS_PROTOTYPE, OBJ_TAIL,
    ObjectClass, PROP_FLAGS, PROP_KEY, PROP_NEXT, PROP_SIZE, PROP_VALUE, Proto,
};
use super::value::Value;

/// Property count above which an object gets a hash index.
pub const INDEX_THRESHOLD: u32 = 8;

pub const PROP_KEY_INDEX: u32 = 1 << 0;
pub const PROP_WRITABLE: u32 = 1 << 1;
pub const PROP_ENUMERABLE: u32 = 1 << 2;
pub const PROP_CONFIGURABLE: u32 = 1 << 3;

const PROP_DEFAULT: u32 = PROP_WRITABLE | PROP_ENUMERABLE | PROP_CONFIGURABLE;

/// A canonical property key. Strings that spell an array index are indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKey {
    Index(u32),
    /// A string word.
    Name(Value),
}

/// Heap-independent form of a key, used by the per-object index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnedKey {
    Index(u32),
    Name(String),
}

impl Heap {
    // -------------------------------------------------------------------------
    // Prop records
    // -------------------------------------------------------------------------

    pub(crate) fn prop_head(&self, obj: GcRef) -> GcRef {
        GcRef::new(self.region().read_u32(obj.offset() + OBJ_HEAD))
    }

    pub(crate) fn prop_next(&self, prop: GcRef) -> GcRef {
        GcRef::new(self.region().read_u32(prop.offset() + PROP_NEXT))
    }

    pub(crate) fn prop_flags(&self, prop: GcRef) -> u32 {
        self.region().read_u32(prop.offset() + PROP_FLAGS)
    }

    pub(crate) fn prop_is_index(&self, prop: GcRef) -> bool {
        self.prop_flags(prop) & PROP_KEY_INDEX != 0
    }

    /// Raw key word. For index keys this is the index, not a value word.
    pub(crate) fn prop_key_word(&self, prop: GcRef) -> Value {
        Value::from_bits(self.region().read_u64(prop.offset() + PROP_KEY)).unwrap_or(Value::NONE)
    }

    pub(crate) fn prop_value(&self, prop: GcRef) -> Value {
        Value::from_bits(self.region().read_u64(prop.offset() + PROP_VALUE)).unwrap_or(Value::UNDEFINED)
    }

    fn prop_key(&self, prop: GcRef) -> PropKey {
        if self.prop_is_index(prop) {
            PropKey::Index(self.region().read_u64(prop.offset() + PROP_KEY) as u32)
        } else {
            PropKey::Name(self.prop_key_word(prop))
        }
    }

    pub fn prop_count(&self, obj: GcRef) -> u32 {
        self.region().read_u32(obj.offset() + OBJ_COUNT)
    }

    fn owned_key(&self, key: PropKey) -> OwnedKey {
        match key {
            PropKey::Index(i) => OwnedKey::Index(i),
            PropKey::Name(v) => OwnedKey::Name(self.string_of(v).unwrap_or_default().to_string()),
        }
    }

    fn key_matches(&self, prop: GcRef, key: PropKey) -> bool {
        match (self.prop_key(prop), key) {
            (PropKey::Index(a), PropKey::Index(b)) => a == b,
            (PropKey::Name(a), PropKey::Name(b)) => a == b || self.string_of(a) == self.string_of(b),
            _ => false,
        }
    }

    /// Canonical key for a string word.
    pub fn key_for_string(&self, name: Value) -> PropKey {
        match self.string_of(name).and_then(array_index) {
            Some(i) => PropKey::Index(i),
            None => PropKey::Name(name),
        }
    }

    /// Canonical key for a primitive that needs no string conversion.
    pub fn key_for_primitive(&self, v: Value) -> Option<PropKey> {
        if v.is_string() {
            return Some(self.key_for_string(v));
        }
        v.as_f64().and_then(number_to_index).map(PropKey::Index)
    }

    fn is_named(&self, key: PropKey, name: &str) -> bool {
        matches!(key, PropKey::Name(v) if self.string_of(v) == Some(name))
    }

    /// Own property record for `key`, if any.
    pub(crate) fn find_own(&self, obj: GcRef, key: PropKey) -> Option<GcRef> {
        if let Some(index) = self.prop_index.get(&obj) {
            return index.get(&self.owned_key(key)).copied();
        }
        let mut prop = self.prop_head(obj);
        while !prop.is_null() {
            if self.key_matches(prop, key) {
                return Some(prop);
            }
            prop = self.prop_next(prop);
        }
        None
    }

    fn append_prop(&mut self, obj: GcRef, key: PropKey, v: Value, flags: u32) -> Result<GcRef, FatalError> {
        let prop = GcRef::new(self.arena_mut().alloc(PROP_SIZE, true)?);
        let (key_bits, flags) = match key {
            PropKey::Index(i) => (i as u64, flags | PROP_KEY_INDEX),
            PropKey::Name(name) => {
                self.inc_ref(name);
                (name.bits(), flags & !PROP_KEY_INDEX)
            }
        };
        self.inc_ref(v);
        let r = self.region_mut();
        r.write_u8(prop.offset(), MemTag::Prop as u8);
        r.write_u32(prop.offset() + PROP_FLAGS, flags);
        r.write_u64(prop.offset() + PROP_KEY, key_bits);
        r.write_u64(prop.offset() + PROP_VALUE, v.bits());

        let tail = GcRef::new(self.region().read_u32(obj.offset() + OBJ_TAIL));
        if tail.is_null() {
            self.region_mut().write_u32(obj.offset() + OBJ_HEAD, prop.offset());
        } else {
            self.region_mut().write_u32(tail.offset() + PROP_NEXT, prop.offset());
        }
        self.region_mut().write_u32(obj.offset() + OBJ_TAIL, prop.offset());
        let count = self.prop_count(obj) + 1;
        self.region_mut().write_u32(obj.offset() + OBJ_COUNT, count);

        if self.prop_index.contains_key(&obj) {
            let owned = self.owned_key(key);
            if let Some(index) = self.prop_index.get_mut(&obj) {
                index.insert(owned, prop);
            }
        } else if count > INDEX_THRESHOLD {
            self.build_index(obj);
        }
        // A new own property may shadow a cached inherited one.
        self.cache.invalidate_all();
        Ok(prop)
    }

    fn build_index(&mut self, obj: GcRef) {
        let mut index = HashMap::new();
        let mut prop = self.prop_head(obj);
        while !prop.is_null() {
            index.insert(self.owned_key(self.prop_key(prop)), prop);
            prop = self.prop_next(prop);
        }
        self.prop_index.insert(obj, index);
    }

    fn overwrite_prop(&mut self, obj: GcRef, prop: GcRef, key: PropKey, v: Value) -> Result<(), FatalError> {
        let old = self.prop_value(prop);
        self.inc_ref(v);
        self.region_mut().write_u64(prop.offset() + PROP_VALUE, v.bits());
        match key {
            PropKey::Name(name)
                if self.is_interned(name) && self.object_flags(obj) & OBJ_IS_PROTOTYPE == 0 =>
            {
                self.cache.reset(obj, name);
            }
            _ => self.cache.invalidate_all(),
        }
        self.dec_ref(old)
    }

    // -------------------------------------------------------------------------
    // Elements
    // -------------------------------------------------------------------------

    fn elements_of(&self, obj: GcRef) -> Option<GcRef> {
        match self.object_class(obj) {
            ObjectClass::Array | ObjectClass::Arguments => {
                Some(GcRef::new(self.payload(obj) as u32)).filter(|e| !e.is_null())
            }
            _ => None,
        }
    }

    fn has_elements(&self, obj: GcRef) -> bool {
        matches!(self.object_class(obj), ObjectClass::Array | ObjectClass::Arguments)
    }

    /// A new array with room for `cap` elements.
    pub fn alloc_array(&mut self, cap: u32) -> Result<GcRef, FatalError> {
        self.alloc_indexed(ObjectClass::Array, BuiltinId::ArrayProto, cap)
    }

    pub fn alloc_arguments(&mut self, args: &[Value]) -> Result<GcRef, FatalError> {
        let obj = self.alloc_indexed(ObjectClass::Arguments, BuiltinId::ObjectProto, args.len() as u32)?;
        for (i, &v) in args.iter().enumerate() {
            self.array_set(obj, i as u32, v)?;
        }
        Ok(obj)
    }

    fn alloc_indexed(&mut self, class: ObjectClass, proto: BuiltinId, cap: u32) -> Result<GcRef, FatalError> {
        let obj = self.alloc_object(class, Proto::Builtin(proto))?;
        let elems = self.alloc_elements(cap)?;
        self.set_payload(obj, elems.offset() as u64);
        Ok(obj)
    }

    pub fn array_len(&self, obj: GcRef) -> u32 {
        self.elements_of(obj).map_or(0, |e| self.elements_len(e))
    }

    /// Element `i`, or None for a hole or out-of-range index.
    pub fn array_get(&self, obj: GcRef, i: u32) -> Option<Value> {
        let elems = self.elements_of(obj)?;
        if i >= self.elements_len(elems) {
            return None;
        }
        Some(self.element(elems, i)).filter(|v| !v.is_none())
    }

    pub fn array_set(&mut self, obj: GcRef, i: u32, v: Value) -> Result<(), FatalError> {
        let Some(mut elems) = self.elements_of(obj) else {
            return Err(FatalError::GcInvariant(format!("object @{} has no elements", obj.offset())));
        };
        if i >= self.elements_cap(elems) {
            elems = self.grow_elements(elems, i.saturating_add(1))?;
            self.set_payload(obj, elems.offset() as u64);
        }
        if i >= self.elements_len(elems) {
            self.set_elements_len(elems, i + 1);
        }
        let old = self.element(elems, i);
        self.inc_ref(v);
        self.write_element(elems, i, v);
        self.dec_ref(old)
    }

    /// Truncate or extend an array. Dropped elements are released.
    pub fn set_array_len(&mut self, obj: GcRef, len: u32) -> Result<(), FatalError> {
        let Some(mut elems) = self.elements_of(obj) else {
            return Ok(());
        };
        let old_len = self.elements_len(elems);
        if len < old_len {
            for i in len..old_len {
                let old = self.element(elems, i);
                self.write_element(elems, i, Value::NONE);
                self.dec_ref(old)?;
            }
        } else if len > self.elements_cap(elems) {
            elems = self.grow_elements(elems, len)?;
            self.set_payload(obj, elems.offset() as u64);
        }
        self.set_elements_len(elems, len);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Property operations
    // -------------------------------------------------------------------------

    /// Own property lookup, including array elements and `length`.
    pub fn get_own(&self, obj: GcRef, key: PropKey) -> Option<Value> {
        self.virtual_own(obj, key)
            .or_else(|| self.find_own(obj, key).map(|prop| self.prop_value(prop)))
    }

    /// Elements and `length` of indexed objects and string boxes. These
    /// shadow stored properties and are never cached.
    fn virtual_own(&self, obj: GcRef, key: PropKey) -> Option<Value> {
        if self.has_elements(obj) {
            if let PropKey::Index(i) = key {
                return self.array_get(obj, i);
            }
            if self.is_named(key, "length") {
                return Some(Value::number(self.array_len(obj) as f64));
            }
        }
        if self.object_class(obj) == ObjectClass::StringBox && self.is_named(key, "length") {
            let len = self
                .boxed_primitive(obj)
                .and_then(|s| self.string_of(s))
                .map_or(0, |s| s.encode_utf16().count());
            return Some(Value::number(len as f64));
        }
        None
    }

    /// Lookup along the prototype chain.
    pub fn get(&self, obj: GcRef, key: PropKey) -> Option<Value> {
        let mut cursor = Some(obj);
        while let Some(o) = cursor {
            if let Some(v) = self.get_own(o, key) {
                return Some(v);
            }
            cursor = self.proto_object(o);
        }
        None
    }

    /// Cached by-name lookup. Only interned names are cached.
    pub fn get_named(&mut self, obj: GcRef, name: Value) -> Option<Value> {
        let key = self.key_for_string(name);
        let cacheable = matches!(key, PropKey::Name(_)) && self.is_interned(name);
        if cacheable && let Some(v) = self.cache.lookup(obj, name) {
            return Some(v);
        }
        let mut cursor = Some(obj);
        while let Some(o) = cursor {
            if let Some(v) = self.virtual_own(o, key) {
                return Some(v);
            }
            if let Some(prop) = self.find_own(o, key) {
                let v = self.prop_value(prop);
                if cacheable {
                    self.cache.store(obj, name, v);
                }
                return Some(v);
            }
            cursor = self.proto_object(o);
        }
        None
    }

    pub fn has_property(&self, obj: GcRef, key: PropKey) -> bool {
        self.get(obj, key).is_some()
    }

    pub fn is_extensible(&self, obj: GcRef) -> bool {
        self.object_flags(obj) & OBJ_EXTENSIBLE != 0
    }

    pub fn prevent_extensions(&mut self, obj: GcRef) {
        let flags = self.object_flags(obj);
        self.set_object_flags(obj, flags & !OBJ_EXTENSIBLE);
    }

    /// Assignment. Returns false when the write is rejected (read-only
    /// property or non-extensible object).
    pub fn put(&mut self, obj: GcRef, key: PropKey, v: Value) -> Result<bool, FatalError> {
        if self.has_elements(obj) {
            if let PropKey::Index(i) = key {
                if self.array_get(obj, i).is_none() && !self.is_extensible(obj) {
                    return Ok(false);
                }
                self.array_set(obj, i, v)?;
                return Ok(true);
            }
            if self.is_named(key, "length") {
                return match v.as_f64().and_then(number_to_index) {
                    Some(len) => self.set_array_len(obj, len).map(|_| true),
                    None => Ok(false),
                };
            }
        }
        match self.find_own(obj, key) {
            Some(prop) => {
                if self.prop_flags(prop) & PROP_WRITABLE == 0 {
                    return Ok(false);
                }
                self.overwrite_prop(obj, prop, key, v)?;
                Ok(true)
            }
            None => {
                if !self.is_extensible(obj) {
                    return Ok(false);
                }
                self.append_prop(obj, key, v, PROP_DEFAULT)?;
                Ok(true)
            }
        }
    }

    /// Own data property definition (object literals). Overwrites regardless
    /// of the writable flag.
    pub fn define_own(&mut self, obj: GcRef, key: PropKey, v: Value) -> Result<(), FatalError> {
        if self.has_elements(obj)
            && let PropKey::Index(i) = key
        {
            return self.array_set(obj, i, v);
        }
        match self.find_own(obj, key) {
            Some(prop) => self.overwrite_prop(obj, prop, key, v),
            None => self.append_prop(obj, key, v, PROP_DEFAULT).map(|_| ()),
        }
    }

    /// Define a property with explicit attribute flags.
    pub fn define_with_flags(&mut self, obj: GcRef, key: PropKey, v: Value, flags: u32) -> Result<(), FatalError> {
        match self.find_own(obj, key) {
            Some(prop) => {
                self.overwrite_prop(obj, prop, key, v)?;
                let keep = self.prop_flags(prop) & PROP_KEY_INDEX;
                self.region_mut().write_u32(prop.offset() + PROP_FLAGS, keep | (flags & !PROP_KEY_INDEX));
                Ok(())
            }
            None => self.append_prop(obj, key, v, flags).map(|_| ()),
        }
    }

    /// Remove an own property. Returns false for non-configurable ones.
    pub fn delete(&mut self, obj: GcRef, key: PropKey) -> Result<bool, FatalError> {
        if self.has_elements(obj)
            && let PropKey::Index(i) = key
        {
            if let Some(elems) = self.elements_of(obj)
                && i < self.elements_len(elems)
            {
                let old = self.element(elems, i);
                self.write_element(elems, i, Value::NONE);
                self.dec_ref(old)?;
            }
            return Ok(true);
        }

        let mut prev = GcRef::NULL;
        let mut prop = self.prop_head(obj);
        while !prop.is_null() && !self.key_matches(prop, key) {
            prev = prop;
            prop = self.prop_next(prop);
        }
        if prop.is_null() {
            return Ok(true);
        }
        if self.prop_flags(prop) & PROP_CONFIGURABLE == 0 {
            return Ok(false);
        }

        let next = self.prop_next(prop);
        if prev.is_null() {
            self.region_mut().write_u32(obj.offset() + OBJ_HEAD, next.offset());
        } else {
            self.region_mut().write_u32(prev.offset() + PROP_NEXT, next.offset());
        }
        if next.is_null() {
            self.region_mut().write_u32(obj.offset() + OBJ_TAIL, prev.offset());
        }
        let count = self.prop_count(obj) - 1;
        self.region_mut().write_u32(obj.offset() + OBJ_COUNT, count);
        let owned = self.owned_key(self.prop_key(prop));
        if let Some(index) = self.prop_index.get_mut(&obj) {
            index.remove(&owned);
        }
        self.cache.invalidate_all();

        let key_word = self.prop_key_word(prop);
        let is_index = self.prop_is_index(prop);
        let value = self.prop_value(prop);
        self.region_mut().write_u8(prop.offset(), 0);
        self.arena_mut().free(prop.offset(), PROP_SIZE)?;
        if !is_index {
            self.dec_ref(key_word)?;
        }
        self.dec_ref(value)?;
        Ok(true)
    }

    /// Own keys in insertion order, elements first.
    pub fn own_keys(&self, obj: GcRef) -> Vec<PropKey> {
        let mut keys = Vec::new();
        if let Some(elems) = self.elements_of(obj) {
            for i in 0..self.elements_len(elems) {
                if !self.element(elems, i).is_none() {
                    keys.push(PropKey::Index(i));
                }
            }
        }
        let mut prop = self.prop_head(obj);
        while !prop.is_null() {
            keys.push(self.prop_key(prop));
            prop = self.prop_next(prop);
        }
        keys
    }

    /// Whether the own property `key` shows up in key enumeration.
    pub fn is_enumerable(&self, obj: GcRef, key: PropKey) -> bool {
        if self.has_elements(obj) && matches!(key, PropKey::Index(_)) {
            return true;
        }
        self.find_own(obj, key)
            .is_some_and(|prop| self.prop_flags(prop) & PROP_ENUMERABLE != 0)
    }

    /// Whether `proto` appears on the prototype chain of `obj`.
    pub fn inherits_from(&self, obj: GcRef, proto: GcRef) -> bool {
        let mut cursor = self.proto_object(obj);
        while let Some(o) = cursor {
            if o == proto {
                return true;
            }
            cursor = self.proto_object(o);
        }
        false
    }

    // -------------------------------------------------------------------------
    // Builtin prototypes
    // -------------------------------------------------------------------------

    pub(crate) fn install_builtins(&mut self) -> Result<(), FatalError> {
        for id in BuiltinId::ALL {
            let proto = match id {
                BuiltinId::ObjectProto => Proto::Null,
                _ => Proto::Builtin(BuiltinId::ObjectProto),
            };
            let class = match id {
                BuiltinId::ArrayProto => ObjectClass::Array,
                _ => ObjectClass::Object,
            };
            let obj = self.alloc_object(class, proto)?;
            if class == ObjectClass::Array {
                let elems = self.alloc_elements(0)?;
                self.set_payload(obj, elems.offset() as u64);
            }
            self.pin(Value::object(obj));
            let flags = self.object_flags(obj);
            self.set_object_flags(obj, flags | OBJ_IS_PROTOTYPE);
            self.builtins[id as usize] = obj;
        }

        let error_proto = self.builtin(BuiltinId::ErrorProto);
        let name = self.intern("name")?;
        let message = self.intern("message")?;
        let error = self.intern("Error")?;
        let empty = self.intern("")?;
        self.define_with_flags(error_proto, PropKey::Name(name), error, PROP_WRITABLE | PROP_CONFIGURABLE)?;
        self.define_with_flags(error_proto, PropKey::Name(message), empty, PROP_WRITABLE | PROP_CONFIGURABLE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::arena::HeapArena;

    fn heap() -> Heap {
        Heap::new(HeapArena::new(512 * 1024, 64 * 1024, 64 * 1024), false).unwrap()
    }

    fn plain(heap: &mut Heap) -> GcRef {
        let obj = heap.alloc_object(ObjectClass::Object, Proto::Builtin(BuiltinId::ObjectProto)).unwrap();
        heap.inc_ref(Value::object(obj));
        obj
    }

    fn name(heap: &mut Heap, s: &str) -> PropKey {
        PropKey::Name(heap.intern(s).unwrap())
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        let x = name(&mut heap, "x");
        assert!(heap.put(obj, x, Value::int(1)).unwrap());
        assert_eq!(heap.get(obj, x), Some(Value::int(1)));
        assert!(heap.put(obj, x, Value::int(2)).unwrap());
        assert_eq!(heap.get(obj, x), Some(Value::int(2)));
        assert_eq!(heap.prop_count(obj), 1);
    }

    #[test]
    fn test_names_match_by_contents() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        let interned = name(&mut heap, "field");
        let runtime = heap.alloc_string("field").unwrap();
        heap.put(obj, interned, Value::TRUE).unwrap();
        assert_eq!(heap.get(obj, PropKey::Name(runtime)), Some(Value::TRUE));
        heap.release_if_floating(runtime).unwrap();
    }

    #[test]
    fn test_numeric_strings_are_indices() {
        let mut heap = heap();
        let s = heap.alloc_string("3").unwrap();
        assert_eq!(heap.key_for_string(s), PropKey::Index(3));
        let s2 = heap.alloc_string("03").unwrap();
        assert_eq!(heap.key_for_string(s2), PropKey::Name(s2));
    }

    #[test]
    fn test_string_box_length_shadows_stored_property() {
        let mut heap = heap();
        let obj = heap.alloc_object(ObjectClass::StringBox, Proto::Builtin(BuiltinId::StringProto)).unwrap();
        heap.inc_ref(Value::object(obj));
        let s = heap.alloc_string("hello").unwrap();
        heap.set_boxed_primitive(obj, s);
        let length = heap.intern("length").unwrap();
        heap.define_own(obj, PropKey::Name(length), Value::int(99)).unwrap();

        assert_eq!(heap.get(obj, PropKey::Name(length)), Some(Value::number(5.0)));
        assert_eq!(heap.get_named(obj, length), Some(Value::number(5.0)));
        assert_eq!(heap.get_named(obj, length), Some(Value::number(5.0)));
    }

    #[test]
    fn test_proto_chain_lookup() {
        let mut heap = heap();
        let parent = plain(&mut heap);
        let k = name(&mut heap, "inherited");
        heap.put(parent, k, Value::int(9)).unwrap();
        let child = heap.alloc_object(ObjectClass::Object, Proto::Object(parent)).unwrap();
        assert_eq!(heap.get(child, k), Some(Value::int(9)));
        assert!(heap.inherits_from(child, parent));
        assert_eq!(heap.get_own(child, k), None);
    }

    #[test]
    fn test_error_proto_defaults() {
        let mut heap = heap();
        let err = heap.alloc_object(ObjectClass::Error, Proto::Builtin(BuiltinId::ErrorProto)).unwrap();
        let n = name(&mut heap, "name");
        let v = heap.get(err, n).unwrap();
        assert_eq!(heap.string_of(v), Some("Error"));
    }

    #[test]
    fn test_index_built_past_threshold() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        for i in 0..=INDEX_THRESHOLD {
            let k = name(&mut heap, &format!("p{i}"));
            heap.put(obj, k, Value::int(i as i32)).unwrap();
        }
        assert!(heap.prop_index.contains_key(&obj));
        let k = name(&mut heap, "p5");
        assert_eq!(heap.get(obj, k), Some(Value::int(5)));
        heap.delete(obj, k).unwrap();
        assert_eq!(heap.get(obj, k), None);
        assert_eq!(heap.prop_count(obj), INDEX_THRESHOLD);
    }

    #[test]
    fn test_delete_releases_value() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        let k = name(&mut heap, "s");
        let s = heap.alloc_string("owned").unwrap();
        heap.put(obj, k, s).unwrap();
        assert_eq!(heap.refcount(s.as_string().unwrap()), 1);
        assert!(heap.delete(obj, k).unwrap());
        assert!(!heap.is_live(s.as_string().unwrap()));
        assert_eq!(heap.own_keys(obj), vec![]);
    }

    #[test]
    fn test_delete_middle_keeps_order() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        let (a, b, c) = (name(&mut heap, "a"), name(&mut heap, "b"), name(&mut heap, "c"));
        for k in [a, b, c] {
            heap.put(obj, k, Value::NULL).unwrap();
        }
        heap.delete(obj, b).unwrap();
        assert_eq!(heap.own_keys(obj), vec![a, c]);
        heap.delete(obj, c).unwrap();
        let d = name(&mut heap, "d");
        heap.put(obj, d, Value::NULL).unwrap();
        assert_eq!(heap.own_keys(obj), vec![a, d]);
    }

    #[test]
    fn test_array_grows_with_holes() {
        let mut heap = heap();
        let arr = heap.alloc_array(0).unwrap();
        heap.put(arr, PropKey::Index(5), Value::int(1)).unwrap();
        assert_eq!(heap.array_len(arr), 6);
        assert_eq!(heap.array_get(arr, 2), None);
        let len = name(&mut heap, "length");
        assert_eq!(heap.get(arr, len), Some(Value::int(6)));
        heap.put(arr, len, Value::int(2)).unwrap();
        assert_eq!(heap.array_len(arr), 2);
        assert_eq!(heap.get(arr, PropKey::Index(5)), None);
    }

    #[test]
    fn test_non_extensible_rejects_new_props() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        heap.prevent_extensions(obj);
        let k = name(&mut heap, "x");
        assert!(!heap.put(obj, k, Value::int(1)).unwrap());
    }

    #[test]
    fn test_cache_reset_on_overwrite() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        let x = heap.intern("x").unwrap();
        heap.put(obj, PropKey::Name(x), Value::int(1)).unwrap();
        assert_eq!(heap.get_named(obj, x), Some(Value::int(1)));
        assert_eq!(heap.cache.lookup(obj, x), Some(Value::int(1)));
        heap.put(obj, PropKey::Name(x), Value::int(2)).unwrap();
        assert_eq!(heap.get_named(obj, x), Some(Value::int(2)));
    }

    #[test]
    fn test_cache_invalidated_by_prototype_write() {
        let mut heap = heap();
        let parent = plain(&mut heap);
        let x = heap.intern("x").unwrap();
        heap.put(parent, PropKey::Name(x), Value::int(1)).unwrap();
        let child = heap.alloc_object(ObjectClass::Object, Proto::Object(parent)).unwrap();
        heap.inc_ref(Value::object(child));
        assert_eq!(heap.get_named(child, x), Some(Value::int(1)));
        heap.put(parent, PropKey::Name(x), Value::int(2)).unwrap();
        assert_eq!(heap.get_named(child, x), Some(Value::int(2)));
    }

    #[test]
    fn test_release_object_frees_props() {
        let mut heap = heap();
        let obj = plain(&mut heap);
        let k = name(&mut heap, "inner");
        let inner = heap.alloc_object(ObjectClass::Object, Proto::Null).unwrap();
        heap.put(obj, k, Value::object(inner)).unwrap();
        let live = heap.stats().objects_live;
        heap.dec_ref(Value::object(obj)).unwrap();
        assert_eq!(heap.stats().objects_live, live - 2);
        assert!(!heap.is_live(inner));
    }
}
