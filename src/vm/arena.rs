//! Flat byte regions with segregated free lists.
//!
//! Two regions exist: the application heap (strings, objects, environments)
//! and the engine-internal region (handler frames and other bookkeeping).
//! Free spans are described by `MemoryChunk` nodes kept in a separate node
//! pool so that freeing never allocates from the region being freed into.

use serde::Serialize;
use thiserror::Error;

/// Allocation quantum in bytes.
pub const ALIGN: u32 = 8;

/// Number of free-list heads per region. Index `size / ALIGN` selects a small
/// class; the last head is the offset-ordered "big" list.
pub const SIZE_CLASSES: usize = 128;

const BIG_CLASS: usize = SIZE_CLASSES - 1;

/// Bytes per `MemoryChunk` node in the pool.
const NODE_SIZE: u32 = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("{region} region exhausted (requested {requested} bytes)")]
    Exhausted { region: &'static str, requested: u32 },
    #[error("free-list node pool exhausted")]
    NodePoolExhausted,
    #[error("overlapping free chunks at offset {offset} in {region} region")]
    Overlap { region: &'static str, offset: u32 },
    #[error("invalid free of {size} bytes at offset {offset} in {region} region")]
    BadFree {
        region: &'static str,
        offset: u32,
        size: u32,
    },
}

#[inline]
fn round_up(size: u32) -> u32 {
    size.max(ALIGN).saturating_add(ALIGN - 1) & !(ALIGN - 1)
}

#[inline]
fn class_of(size: u32) -> usize {
    ((size / ALIGN) as usize).min(BIG_CLASS)
}

// =============================================================================
// MemoryChunk node pool
// =============================================================================

/// A reclaimed, not-yet-reused span of region bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryChunk {
    pub offset: u32,
    pub size: u32,
    /// Next node in the same list (0 = end).
    pub next: u32,
}

/// Storage for `MemoryChunk` nodes. Node 0 is reserved as the list terminator.
#[derive(Debug)]
struct ChunkPool {
    bytes: Vec<u8>,
    top: u32,
    recycled: u32,
    live: u32,
}

impl ChunkPool {
    fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            top: NODE_SIZE,
            recycled: 0,
            live: 0,
        }
    }

    fn alloc(&mut self, chunk: MemoryChunk) -> Result<u32, ArenaError> {
        let node = if self.recycled != 0 {
            let node = self.recycled;
            self.recycled = self.get(node).next;
            node
        } else {
            if (self.top + NODE_SIZE) as usize > self.bytes.len() {
                return Err(ArenaError::NodePoolExhausted);
            }
            let node = self.top;
            self.top += NODE_SIZE;
            node
        };
        self.set(node, chunk);
        self.live += 1;
        Ok(node)
    }

    fn free(&mut self, node: u32) {
        let recycled = self.recycled;
        self.set_next(node, recycled);
        self.recycled = node;
        self.live -= 1;
    }

    fn get(&self, node: u32) -> MemoryChunk {
        let base = node as usize;
        MemoryChunk {
            offset: read_u32(&self.bytes, base),
            size: read_u32(&self.bytes, base + 4),
            next: read_u32(&self.bytes, base + 8),
        }
    }

    fn set(&mut self, node: u32, chunk: MemoryChunk) {
        let base = node as usize;
        write_u32(&mut self.bytes, base, chunk.offset);
        write_u32(&mut self.bytes, base + 4, chunk.size);
        write_u32(&mut self.bytes, base + 8, chunk.next);
    }

    fn set_next(&mut self, node: u32, next: u32) {
        write_u32(&mut self.bytes, node as usize + 8, next);
    }
}

// =============================================================================
// Byte-level access helpers
// =============================================================================

#[inline(always)]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline(always)]
fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline(always)]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[inline(always)]
fn write_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Region
// =============================================================================

/// Counters for one region.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegionStats {
    pub capacity: u32,
    pub live_bytes: u64,
    pub peak_live_bytes: u64,
    pub high_water: u32,
    pub allocations: u64,
    pub frees: u64,
    pub reused: u64,
}

/// One flat byte region.
///
/// Small requests bump upward from the start; big requests bump from the
/// midpoint. Offset 0 is never handed out so it can serve as a null handle.
#[derive(Debug)]
pub struct Region {
    name: &'static str,
    bytes: Vec<u8>,
    small_top: u32,
    big_start: u32,
    big_top: u32,
    heads: [u32; SIZE_CLASSES],
    stats: RegionStats,
}

impl Region {
    fn new(name: &'static str, size: usize) -> Self {
        let size = (size.min(u32::MAX as usize) as u32) & !(ALIGN - 1);
        let size = size.max(4 * ALIGN);
        let big_start = (size / 2) & !(ALIGN - 1);
        Self {
            name,
            bytes: vec![0; size as usize],
            small_top: ALIGN,
            big_start,
            big_top: big_start,
            heads: [0; SIZE_CLASSES],
            stats: RegionStats {
                capacity: size,
                ..RegionStats::default()
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Bytes ever handed out by bumping, across both halves.
    pub fn high_water(&self) -> u32 {
        (self.small_top - ALIGN) + (self.big_top - self.big_start)
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            high_water: self.high_water(),
            ..self.stats
        }
    }

    fn allocate(&mut self, pool: &mut ChunkPool, size: u32) -> Result<u32, ArenaError> {
        let size = round_up(size);
        let class = class_of(size);
        let offset = if class < BIG_CLASS {
            match self.pop_small(pool, class) {
                Some(offset) => {
                    self.stats.reused += 1;
                    offset
                }
                None if self.small_top + size <= self.big_start => {
                    let offset = self.small_top;
                    self.small_top += size;
                    offset
                }
                // Small half is full: borrow from the big half.
                None => self.allocate_big(pool, size)?,
            }
        } else {
            self.allocate_big(pool, size)?
        };
        self.stats.allocations += 1;
        self.stats.live_bytes += size as u64;
        self.stats.peak_live_bytes = self.stats.peak_live_bytes.max(self.stats.live_bytes);
        Ok(offset)
    }

    fn pop_small(&mut self, pool: &mut ChunkPool, class: usize) -> Option<u32> {
        let node = self.heads[class];
        if node == 0 {
            return None;
        }
        let chunk = pool.get(node);
        self.heads[class] = chunk.next;
        pool.free(node);
        Some(chunk.offset)
    }

    fn allocate_big(&mut self, pool: &mut ChunkPool, size: u32) -> Result<u32, ArenaError> {
        if let Some(offset) = self.first_fit(pool, size)? {
            self.stats.reused += 1;
            return Ok(offset);
        }
        if self.big_top as u64 + size as u64 <= self.bytes.len() as u64 {
            let offset = self.big_top;
            self.big_top += size;
            return Ok(offset);
        }
        self.merge_big(pool)?;
        if let Some(offset) = self.first_fit(pool, size)? {
            self.stats.reused += 1;
            return Ok(offset);
        }
        if self.big_top as u64 + size as u64 <= self.bytes.len() as u64 {
            let offset = self.big_top;
            self.big_top += size;
            return Ok(offset);
        }
        Err(ArenaError::Exhausted {
            region: self.name,
            requested: size,
        })
    }

    /// First-fit search of the big list, splitting off any remainder.
    fn first_fit(&mut self, pool: &mut ChunkPool, size: u32) -> Result<Option<u32>, ArenaError> {
        let mut prev = 0u32;
        let mut node = self.heads[BIG_CLASS];
        while node != 0 {
            let chunk = pool.get(node);
            if chunk.size >= size {
                if prev == 0 {
                    self.heads[BIG_CLASS] = chunk.next;
                } else {
                    pool.set_next(prev, chunk.next);
                }
                pool.free(node);
                let remainder = chunk.size - size;
                if remainder > 0 {
                    self.insert_free(pool, chunk.offset + size, remainder)?;
                }
                return Ok(Some(chunk.offset));
            }
            prev = node;
            node = chunk.next;
        }
        Ok(None)
    }

    fn free(&mut self, pool: &mut ChunkPool, offset: u32, size: u32) -> Result<(), ArenaError> {
        let size = round_up(size);
        if offset < ALIGN
            || offset % ALIGN != 0
            || offset as u64 + size as u64 > self.bytes.len() as u64
        {
            return Err(ArenaError::BadFree {
                region: self.name,
                offset,
                size,
            });
        }
        self.insert_free(pool, offset, size)?;
        self.stats.frees += 1;
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(size as u64);
        Ok(())
    }

    fn insert_free(&mut self, pool: &mut ChunkPool, offset: u32, size: u32) -> Result<(), ArenaError> {
        let class = class_of(size);
        if class < BIG_CLASS {
            let node = pool.alloc(MemoryChunk {
                offset,
                size,
                next: self.heads[class],
            })?;
            self.heads[class] = node;
            return Ok(());
        }

        // Big list stays ordered by offset.
        let mut prev = 0u32;
        let mut node = self.heads[BIG_CLASS];
        while node != 0 {
            let chunk = pool.get(node);
            if chunk.offset >= offset {
                if offset + size > chunk.offset {
                    return Err(ArenaError::Overlap {
                        region: self.name,
                        offset,
                    });
                }
                break;
            }
            prev = node;
            node = chunk.next;
        }
        if prev != 0 {
            let before = pool.get(prev);
            if before.offset + before.size > offset {
                return Err(ArenaError::Overlap {
                    region: self.name,
                    offset,
                });
            }
        }
        let new_node = pool.alloc(MemoryChunk { offset, size, next: node })?;
        if prev == 0 {
            self.heads[BIG_CLASS] = new_node;
        } else {
            pool.set_next(prev, new_node);
        }
        Ok(())
    }

    /// Coalesce adjacent big chunks and hand a trailing chunk back to the
    /// bump pointer.
    fn merge_big(&mut self, pool: &mut ChunkPool) -> Result<(), ArenaError> {
        let mut node = self.heads[BIG_CLASS];
        while node != 0 {
            let mut chunk = pool.get(node);
            while chunk.next != 0 {
                let next = pool.get(chunk.next);
                let end = chunk.offset + chunk.size;
                if end > next.offset {
                    return Err(ArenaError::Overlap {
                        region: self.name,
                        offset: next.offset,
                    });
                }
                if end != next.offset {
                    break;
                }
                pool.free(chunk.next);
                chunk.size += next.size;
                chunk.next = next.next;
                pool.set(node, chunk);
            }
            node = chunk.next;
        }

        // Drop a chunk that ends exactly at the big bump pointer.
        let mut prev = 0u32;
        let mut node = self.heads[BIG_CLASS];
        while node != 0 {
            let chunk = pool.get(node);
            if chunk.next == 0 {
                if chunk.offset >= self.big_start && chunk.offset + chunk.size == self.big_top {
                    self.big_top = chunk.offset;
                    if prev == 0 {
                        self.heads[BIG_CLASS] = 0;
                    } else {
                        pool.set_next(prev, 0);
                    }
                    pool.free(node);
                }
                break;
            }
            prev = node;
            node = chunk.next;
        }
        Ok(())
    }

    /// Number of chunks waiting in the free list for `size`.
    pub fn free_chunks(&self, arena: &HeapArena, size: u32) -> usize {
        let mut count = 0;
        let mut node = self.heads[class_of(round_up(size))];
        while node != 0 {
            count += 1;
            node = arena.pool.get(node).next;
        }
        count
    }

    // -------------------------------------------------------------------------
    // Byte access
    // -------------------------------------------------------------------------

    #[inline]
    pub fn read_u8(&self, at: u32) -> u8 {
        self.bytes[at as usize]
    }

    #[inline]
    pub fn write_u8(&mut self, at: u32, value: u8) {
        self.bytes[at as usize] = value;
    }

    #[inline]
    pub fn read_u32(&self, at: u32) -> u32 {
        read_u32(&self.bytes, at as usize)
    }

    #[inline]
    pub fn write_u32(&mut self, at: u32, value: u32) {
        write_u32(&mut self.bytes, at as usize, value)
    }

    #[inline]
    pub fn read_u64(&self, at: u32) -> u64 {
        read_u64(&self.bytes, at as usize)
    }

    #[inline]
    pub fn write_u64(&mut self, at: u32, value: u64) {
        write_u64(&mut self.bytes, at as usize, value)
    }

    pub fn slice(&self, at: u32, len: u32) -> &[u8] {
        &self.bytes[at as usize..(at + len) as usize]
    }

    pub fn slice_mut(&mut self, at: u32, len: u32) -> &mut [u8] {
        &mut self.bytes[at as usize..(at + len) as usize]
    }

    fn zero(&mut self, at: u32, len: u32) {
        self.slice_mut(at, len).fill(0);
    }
}

// =============================================================================
// HeapArena
// =============================================================================

/// Serializable snapshot of both regions.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArenaStats {
    pub app: RegionStats,
    pub internal: RegionStats,
    pub free_nodes_live: u32,
}

#[derive(Debug)]
pub struct HeapArena {
    app: Region,
    internal: Region,
    pool: ChunkPool,
}

impl HeapArena {
    pub fn new(app_bytes: usize, internal_bytes: usize, node_pool_bytes: usize) -> Self {
        Self {
            app: Region::new("application", app_bytes),
            internal: Region::new("internal", internal_bytes),
            pool: ChunkPool::new(node_pool_bytes),
        }
    }

    pub fn app(&self) -> &Region {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut Region {
        &mut self.app
    }

    pub fn internal(&self) -> &Region {
        &self.internal
    }

    pub fn internal_mut(&mut self) -> &mut Region {
        &mut self.internal
    }

    /// Allocate `size` bytes from the application heap.
    pub fn alloc(&mut self, size: u32, zero_fill: bool) -> Result<u32, ArenaError> {
        let offset = self.app.allocate(&mut self.pool, size)?;
        if zero_fill {
            self.app.zero(offset, round_up(size));
        }
        Ok(offset)
    }

    pub fn free(&mut self, offset: u32, size: u32) -> Result<(), ArenaError> {
        self.app.free(&mut self.pool, offset, size)
    }

    /// Allocate, copy the common prefix, zero the tail and free the old span.
    pub fn realloc(&mut self, offset: u32, old_size: u32, new_size: u32) -> Result<u32, ArenaError> {
        let new_offset = self.alloc(new_size, true)?;
        let keep = round_up(old_size.min(new_size));
        let from = offset as usize..(offset + keep) as usize;
        self.app.bytes.copy_within(from, new_offset as usize);
        self.free(offset, old_size)?;
        Ok(new_offset)
    }

    /// Allocate zeroed bytes from the engine-internal region.
    pub fn alloc_internal(&mut self, size: u32) -> Result<u32, ArenaError> {
        let offset = self.internal.allocate(&mut self.pool, size)?;
        self.internal.zero(offset, round_up(size));
        Ok(offset)
    }

    pub fn free_internal(&mut self, offset: u32, size: u32) -> Result<(), ArenaError> {
        self.internal.free(&mut self.pool, offset, size)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            app: self.app.stats(),
            internal: self.internal.stats(),
            free_nodes_live: self.pool.live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> HeapArena {
        HeapArena::new(64 * 1024, 16 * 1024, 16 * 1024)
    }

    #[test]
    fn test_alloc_is_aligned_and_nonzero() {
        let mut arena = arena();
        let a = arena.alloc(3, true).unwrap();
        let b = arena.alloc(17, true).unwrap();
        assert!(a >= ALIGN);
        assert_eq!(a % ALIGN, 0);
        assert_eq!(b % ALIGN, 0);
        assert_eq!(b, a + 8);
    }

    #[test]
    fn test_small_free_list_reuse() {
        let mut arena = arena();
        let a = arena.alloc(32, false).unwrap();
        arena.free(a, 32).unwrap();
        let b = arena.alloc(32, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(arena.stats().app.reused, 1);
    }

    #[test]
    fn test_repeated_cycles_do_not_grow_high_water() {
        let mut arena = arena();
        for size in [24u32, 2048] {
            let first = arena.alloc(size, true).unwrap();
            arena.free(first, size).unwrap();
            let mark = arena.app().high_water();
            for _ in 0..100 {
                let p = arena.alloc(size, true).unwrap();
                arena.free(p, size).unwrap();
            }
            assert_eq!(arena.app().high_water(), mark);
        }
    }

    #[test]
    fn test_big_first_fit_splits() {
        let mut arena = arena();
        let a = arena.alloc(4096, false).unwrap();
        let _guard = arena.alloc(2048, false).unwrap();
        arena.free(a, 4096).unwrap();
        let b = arena.alloc(2048, false).unwrap();
        assert_eq!(b, a);
        // The 2048-byte remainder is still on the big list.
        let c = arena.alloc(2048, false).unwrap();
        assert_eq!(c, a + 2048);
    }

    #[test]
    fn test_big_chunks_coalesce_when_exhausted() {
        let mut arena = HeapArena::new(16 * 1024, 4096, 4096);
        // Big half is 8 KiB: fill it with four 2 KiB blocks.
        let blocks: Vec<u32> = (0..4).map(|_| arena.alloc(2048, false).unwrap()).collect();
        assert!(arena.alloc(2048, false).is_err());
        arena.free(blocks[1], 2048).unwrap();
        arena.free(blocks[2], 2048).unwrap();
        // Neither chunk alone fits 4 KiB; coalescing makes room.
        let merged = arena.alloc(4096, false).unwrap();
        assert_eq!(merged, blocks[1]);
    }

    #[test]
    fn test_trailing_chunk_returns_to_bump_pointer() {
        let mut arena = arena();
        let before = arena.app().high_water();
        let a = arena.alloc(4096, false).unwrap();
        arena.free(a, 4096).unwrap();
        // Force a merge pass by requesting more than the big half holds.
        assert!(arena.alloc(64 * 1024, false).is_err());
        assert_eq!(arena.app().high_water(), before);
    }

    #[test]
    fn test_double_free_of_big_chunk_is_overlap() {
        let mut arena = arena();
        let a = arena.alloc(2048, false).unwrap();
        arena.free(a, 2048).unwrap();
        let err = arena.free(a, 2048).unwrap_err();
        assert!(matches!(err, ArenaError::Overlap { .. }));
    }

    #[test]
    fn test_bad_free_rejected() {
        let mut arena = arena();
        assert!(matches!(arena.free(0, 8), Err(ArenaError::BadFree { .. })));
        assert!(matches!(arena.free(12, 8), Err(ArenaError::BadFree { .. })));
    }

    #[test]
    fn test_small_requests_borrow_big_half() {
        let mut arena = HeapArena::new(1024, 1024, 4096);
        // Small half holds 504 usable bytes; keep allocating 64-byte blocks.
        let mut offsets = Vec::new();
        while let Ok(p) = arena.alloc(64, false) {
            offsets.push(p);
        }
        assert!(offsets.iter().any(|&p| p >= 512));
    }

    #[test]
    fn test_realloc_copies_and_zero_extends() {
        let mut arena = arena();
        let a = arena.alloc(16, true).unwrap();
        arena.app_mut().write_u64(a, 0xDEAD_BEEF);
        arena.app_mut().write_u64(a + 8, 7);
        let b = arena.realloc(a, 16, 48).unwrap();
        assert_eq!(arena.app().read_u64(b), 0xDEAD_BEEF);
        assert_eq!(arena.app().read_u64(b + 8), 7);
        assert_eq!(arena.app().read_u64(b + 16), 0);
        assert_eq!(arena.app().read_u64(b + 40), 0);
    }

    #[test]
    fn test_internal_region_is_separate() {
        let mut arena = arena();
        let a = arena.alloc(40, false).unwrap();
        let i = arena.alloc_internal(40).unwrap();
        arena.free_internal(i, 40).unwrap();
        assert_eq!(arena.app().stats().live_bytes, 40);
        assert_eq!(arena.internal().stats().live_bytes, 0);
        arena.free(a, 40).unwrap();
        assert_eq!(arena.internal().free_chunks(&arena, 40), 1);
        assert_eq!(arena.app().free_chunks(&arena, 40), 1);
    }
}
