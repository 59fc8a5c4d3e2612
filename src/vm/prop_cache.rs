//! Property cache for by-name property reads.
//!
//! A direct-mapped table keyed by (object, name word). Every slot carries the
//! generation it was written in; bumping the global generation makes every
//! slot stale at once. The cache never owns the values it holds: anything that
//! could change or free a cached value must reset or invalidate first.

use serde::Serialize;

use super::heap::GcRef;
use super::value::Value;

/// Number of slots. Must be a power of two.
pub const PROP_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u64,
    object: GcRef,
    name: Value,
    value: Value,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub generation: u64,
}

#[derive(Debug)]
pub struct PropertyCache {
    slots: Vec<Slot>,
    /// Slots start at generation 0, so the first generation is 1.
    generation: u64,
    hits: u64,
    misses: u64,
}

impl PropertyCache {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::default(); PROP_CACHE_SIZE],
            generation: 1,
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    fn index(object: GcRef, name: Value) -> usize {
        (((object.offset() >> 3) ^ name.bits() as u32) as usize) & (PROP_CACHE_SIZE - 1)
    }

    /// Cached value for (object, name), if the slot is current and matches.
    #[inline]
    pub fn lookup(&mut self, object: GcRef, name: Value) -> Option<Value> {
        let slot = &self.slots[Self::index(object, name)];
        if slot.generation == self.generation && slot.object == object && slot.name == name {
            self.hits += 1;
            Some(slot.value)
        } else {
            self.misses += 1;
            None
        }
    }

    /// Last writer wins.
    #[inline]
    pub fn store(&mut self, object: GcRef, name: Value, value: Value) {
        let generation = self.generation;
        self.slots[Self::index(object, name)] = Slot {
            generation,
            object,
            name,
            value,
        };
    }

    /// Forget the entry for one key, if present.
    pub fn reset(&mut self, object: GcRef, name: Value) {
        let slot = &mut self.slots[Self::index(object, name)];
        if slot.object == object && slot.name == name {
            slot.generation = 0;
        }
    }

    /// Make every slot stale in O(1).
    pub fn invalidate_all(&mut self) {
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            generation: self.generation,
        }
    }
}

impl Default for PropertyCache {
    fn default() -> Self {
        Self::new()
    }
}
