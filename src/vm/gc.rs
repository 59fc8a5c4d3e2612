//! Cycle collection.
//!
//! Reference counting frees acyclic garbage as soon as the last reference
//! drops. A [`Collector`] reclaims what refcounting cannot: groups of objects
//! and environments that only keep each other alive. Collectors run at
//! instruction boundaries, when every live reference is held by the operand
//! stack, globals, handler frames or the heap itself.

use log::debug;

use super::error::FatalError;
use super::heap::{Color, GcRef, Heap, RC_PINNED};
use super::value::Value;
use crate::config::CollectorKind;

pub trait Collector {
    fn name(&self) -> &'static str;

    /// Whether a pass is due.
    fn should_collect(&self, heap: &Heap) -> bool;

    /// Run one pass and return the number of blocks reclaimed. `roots` holds
    /// every engine-owned reference.
    fn collect(&mut self, heap: &mut Heap, roots: &[Value]) -> Result<usize, FatalError>;
}

pub fn new_collector(kind: CollectorKind, trigger_bytes: u64) -> Box<dyn Collector> {
    match kind {
        CollectorKind::TrialDeletion => Box::new(TrialDeletion::new(trigger_bytes)),
        CollectorKind::MarkSweep => Box::new(MarkSweep::new(trigger_bytes)),
    }
}

fn is_pinned(heap: &Heap, g: GcRef) -> bool {
    heap.refcount(g) == RC_PINNED
}

// =============================================================================
// Trial deletion
// =============================================================================

/// Synchronous cycle collection over the candidate set.
///
/// 1. Red: subtract internal references reachable from each candidate.
/// 2. Scan: nodes whose count stays positive are externally held; restore
///    them and everything they reach to green. The rest turn blue.
/// 3. Collect: blue nodes are garbage. Their string children are released;
///    their object and environment children are either garbage themselves or
///    already had this edge subtracted.
pub struct TrialDeletion {
    trigger: u64,
}

impl TrialDeletion {
    pub fn new(trigger: u64) -> Self {
        Self { trigger }
    }

    fn mark_red(heap: &mut Heap, root: GcRef) {
        if heap.color(root) == Color::Red {
            return;
        }
        heap.set_color(root, Color::Red);
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            for c in heap.node_children(n) {
                if is_pinned(heap, c) {
                    continue;
                }
                let rc = heap.refcount(c);
                heap.set_refcount(c, rc.saturating_sub(1));
                if heap.color(c) != Color::Red {
                    heap.set_color(c, Color::Red);
                    stack.push(c);
                }
            }
        }
    }

    fn scan(heap: &mut Heap, root: GcRef) {
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if heap.color(n) != Color::Red {
                continue;
            }
            if heap.refcount(n) > 0 {
                Self::scan_green(heap, n);
            } else {
                heap.set_color(n, Color::Blue);
                stack.extend(heap.node_children(n).into_iter().filter(|&c| !is_pinned(heap, c)));
            }
        }
    }

    fn scan_green(heap: &mut Heap, root: GcRef) {
        heap.set_color(root, Color::Green);
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            for c in heap.node_children(n) {
                if is_pinned(heap, c) {
                    continue;
                }
                let rc = heap.refcount(c);
                heap.set_refcount(c, rc + 1);
                if heap.color(c) != Color::Green {
                    heap.set_color(c, Color::Green);
                    stack.push(c);
                }
            }
        }
    }

    fn collect_blue(heap: &mut Heap, root: GcRef, garbage: &mut Vec<GcRef>) {
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if heap.color(n) != Color::Blue {
                continue;
            }
            heap.set_color(n, Color::Green);
            garbage.push(n);
            stack.extend(heap.node_children(n).into_iter().filter(|&c| !is_pinned(heap, c)));
        }
    }
}

impl Collector for TrialDeletion {
    fn name(&self) -> &'static str {
        "trial-deletion"
    }

    fn should_collect(&self, heap: &Heap) -> bool {
        heap.allocated_since_pass() >= self.trigger && heap.candidate_count() > 0
    }

    fn collect(&mut self, heap: &mut Heap, _roots: &[Value]) -> Result<usize, FatalError> {
        let candidates = heap.take_candidates();
        let mut roots = Vec::with_capacity(candidates.len());
        for g in candidates {
            if !heap.is_live(g) {
                continue;
            }
            heap.set_in_roots(g, false);
            let rc = heap.refcount(g);
            if rc > 0 && rc != RC_PINNED {
                roots.push(g);
            }
        }

        for &g in &roots {
            Self::mark_red(heap, g);
        }
        for &g in &roots {
            Self::scan(heap, g);
        }
        let mut garbage = Vec::new();
        for &g in &roots {
            Self::collect_blue(heap, g, &mut garbage);
        }

        for &g in &garbage {
            heap.free_garbage(g, &|_, v| v.is_string())?;
        }

        heap.stats.cycle_passes += 1;
        heap.stats.cycle_garbage += garbage.len() as u64;
        heap.finish_pass();
        debug!(
            "{}: {} candidates, {} blocks reclaimed",
            self.name(),
            roots.len(),
            garbage.len()
        );
        Ok(garbage.len())
    }
}

// =============================================================================
// Mark and sweep
// =============================================================================

/// Tracing backend. Marks from the engine roots and frees every unmarked
/// string, object and environment. Needs a heap created with block tracking.
pub struct MarkSweep {
    trigger: u64,
}

impl MarkSweep {
    pub fn new(trigger: u64) -> Self {
        Self { trigger }
    }

    /// Mark everything reachable from `roots` and from pinned blocks, which
    /// may own ordinary ones (properties set on builtin prototypes).
    fn mark(heap: &mut Heap, roots: &[Value], blocks: &[GcRef]) {
        let mut stack: Vec<GcRef> = roots.iter().filter_map(|v| v.as_ref()).collect();
        stack.extend(blocks.iter().copied().filter(|&g| heap.is_live(g) && is_pinned(heap, g)));
        while let Some(g) = stack.pop() {
            if !heap.is_live(g) || heap.marked(g) {
                continue;
            }
            heap.set_marked(g, true);
            stack.extend(heap.owned_words(g).into_iter().filter_map(Value::as_ref));
        }
    }
}

impl Collector for MarkSweep {
    fn name(&self) -> &'static str {
        "mark-sweep"
    }

    fn should_collect(&self, heap: &Heap) -> bool {
        heap.allocated_since_pass() >= self.trigger
    }

    fn collect(&mut self, heap: &mut Heap, roots: &[Value]) -> Result<usize, FatalError> {
        if !heap.tracks_all() {
            return Err(FatalError::GcInvariant(
                "mark-and-sweep requires a heap with block tracking".to_string(),
            ));
        }
        for g in heap.take_candidates() {
            if heap.is_live(g) {
                heap.set_in_roots(g, false);
            }
        }

        let blocks = heap.all_blocks();
        Self::mark(heap, roots, &blocks);
        let garbage: Vec<GcRef> = blocks
            .iter()
            .copied()
            .filter(|&g| heap.is_live(g) && !heap.marked(g) && !is_pinned(heap, g))
            .collect();

        // Only references into surviving blocks are counted down.
        for &g in &garbage {
            heap.free_garbage(g, &|h, v| v.as_ref().is_some_and(|c| h.is_live(c) && h.marked(c)))?;
        }
        for g in blocks {
            if heap.is_live(g) {
                heap.set_marked(g, false);
            }
        }

        heap.stats.sweep_passes += 1;
        heap.stats.sweep_garbage += garbage.len() as u64;
        heap.finish_pass();
        debug!("{}: {} blocks reclaimed", self.name(), garbage.len());
        Ok(garbage.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::arena::HeapArena;
    use crate::vm::heap::{BuiltinId, ObjectClass, Proto};
    use crate::vm::object::PropKey;

    fn heap(track_all: bool) -> Heap {
        Heap::new(HeapArena::new(512 * 1024, 64 * 1024, 64 * 1024), track_all).unwrap()
    }

    fn object(heap: &mut Heap) -> GcRef {
        heap.alloc_object(ObjectClass::Object, Proto::Builtin(BuiltinId::ObjectProto))
            .unwrap()
    }

    /// Two objects pointing at each other, with one external reference to `a`.
    fn pair(heap: &mut Heap) -> (GcRef, GcRef) {
        let (a, b) = (object(heap), object(heap));
        let x = PropKey::Name(heap.intern("x").unwrap());
        heap.put(a, x, Value::object(b)).unwrap();
        heap.put(b, x, Value::object(a)).unwrap();
        heap.inc_ref(Value::object(a));
        (a, b)
    }

    #[test]
    fn test_trial_deletion_frees_cycle() {
        let mut heap = heap(false);
        let (a, b) = pair(&mut heap);
        let live = heap.stats().objects_live;
        heap.dec_ref(Value::object(a)).unwrap();
        assert!(heap.is_live(a));
        assert_eq!(heap.candidate_count(), 1);

        let freed = TrialDeletion::new(0).collect(&mut heap, &[]).unwrap();
        assert_eq!(freed, 2);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
        assert_eq!(heap.stats().objects_live, live - 2);
        assert_eq!(heap.candidate_count(), 0);
    }

    #[test]
    fn test_trial_deletion_keeps_externally_held_cycle() {
        let mut heap = heap(false);
        let (a, b) = pair(&mut heap);
        heap.inc_ref(Value::object(b));
        heap.dec_ref(Value::object(a)).unwrap();

        let freed = TrialDeletion::new(0).collect(&mut heap, &[]).unwrap();
        assert_eq!(freed, 0);
        assert_eq!(heap.refcount(a), 1);
        assert_eq!(heap.refcount(b), 2);
        assert_eq!(heap.color(a), Color::Green);
        assert!(!heap.in_roots(a));

        heap.dec_ref(Value::object(b)).unwrap();
        assert_eq!(TrialDeletion::new(0).collect(&mut heap, &[]).unwrap(), 2);
    }

    #[test]
    fn test_trial_deletion_releases_string_children() {
        let mut heap = heap(false);
        let (a, _) = pair(&mut heap);
        let s = heap.alloc_string("payload").unwrap();
        let k = PropKey::Name(heap.intern("s").unwrap());
        heap.put(a, k, s).unwrap();
        heap.dec_ref(Value::object(a)).unwrap();
        TrialDeletion::new(0).collect(&mut heap, &[]).unwrap();
        assert!(!heap.is_live(s.as_string().unwrap()));
        assert_eq!(heap.stats().strings_live, heap.stats().strings_allocated - 1);
    }

    #[test]
    fn test_trial_deletion_frees_closure_env_cycle() {
        let mut heap = heap(false);
        let env = heap.alloc_env(1, Value::UNDEFINED).unwrap();
        let f = heap.alloc_function(0, false, Value::env(env)).unwrap();
        heap.env_set(env, 0, Value::object(f)).unwrap();
        heap.inc_ref(Value::object(f));
        heap.dec_ref(Value::object(f)).unwrap();
        assert!(heap.is_live(f));

        assert_eq!(TrialDeletion::new(0).collect(&mut heap, &[]).unwrap(), 2);
        assert!(!heap.is_live(env));
        assert_eq!(heap.stats().envs_live, 0);
    }

    #[test]
    fn test_trial_deletion_trigger() {
        let mut heap = heap(false);
        let (a, _) = pair(&mut heap);
        let collector = TrialDeletion::new(u64::MAX);
        heap.dec_ref(Value::object(a)).unwrap();
        assert!(!collector.should_collect(&heap));
        assert!(TrialDeletion::new(1).should_collect(&heap));
    }

    #[test]
    fn test_mark_sweep_frees_unreachable_cycle() {
        let mut heap = heap(true);
        let (a, b) = pair(&mut heap);
        let kept = object(&mut heap);
        heap.inc_ref(Value::object(kept));
        heap.dec_ref(Value::object(a)).unwrap();

        let freed = MarkSweep::new(0).collect(&mut heap, &[Value::object(kept)]).unwrap();
        assert_eq!(freed, 2);
        assert!(!heap.is_live(a) && !heap.is_live(b));
        assert!(heap.is_live(kept));
        assert_eq!(heap.refcount(kept), 1);
    }

    #[test]
    fn test_mark_sweep_keeps_rooted_cycle() {
        let mut heap = heap(true);
        let (a, b) = pair(&mut heap);
        let freed = MarkSweep::new(0).collect(&mut heap, &[Value::object(a)]).unwrap();
        assert_eq!(freed, 0);
        assert_eq!(heap.refcount(b), 1);
        assert!(!heap.marked(a));
    }

    #[test]
    fn test_mark_sweep_decrements_surviving_children() {
        let mut heap = heap(true);
        let (a, _) = pair(&mut heap);
        let shared = object(&mut heap);
        heap.inc_ref(Value::object(shared));
        let k = PropKey::Name(heap.intern("shared").unwrap());
        heap.put(a, k, Value::object(shared)).unwrap();
        assert_eq!(heap.refcount(shared), 2);
        heap.dec_ref(Value::object(a)).unwrap();

        MarkSweep::new(0).collect(&mut heap, &[Value::object(shared)]).unwrap();
        assert_eq!(heap.refcount(shared), 1);
    }

    #[test]
    fn test_mark_sweep_requires_tracking() {
        let mut heap = heap(false);
        assert!(matches!(
            MarkSweep::new(0).collect(&mut heap, &[]),
            Err(FatalError::GcInvariant(_))
        ));
    }
}
