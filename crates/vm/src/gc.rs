//! Garbage collector module for the Erkao VM.
//!
//! Generational tri-colour mark-sweep over the [`Heap`]'s slab. Minor
//! cycles trace only the young generation, treating remembered old objects
//! as roots; full cycles trace everything and then sweep the old generation
//! incrementally, a bounded batch per safepoint, so long-lived heaps never
//! stall the dispatch loop.
//!
//! Collection entry points take a flat root slice. The VM gathers roots
//! (value stack, frame state, globals, module registry, pinned values)
//! immediately before calling in; nothing here re-derives VM state.

use crate::heap::{Handle, Heap};
use crate::object::Generation;
use crate::value::Value;

impl Heap {
    /// Safepoint hook: advances an in-flight old sweep, otherwise starts
    /// whichever collection the allocation counters made pending.
    pub fn gc_maybe(&mut self, roots: &[Value]) {
        if self.old_sweep_cursor.is_some() {
            self.advance_old_sweep();
            return;
        }
        if self.full_pending {
            self.collect_full(roots);
        } else if self.minor_pending {
            self.collect_minor(roots);
        }
    }

    /// Runs a full collection and drains the old sweep to completion;
    /// used on heap-cap breach where the final byte count matters now.
    pub fn collect_now(&mut self, roots: &[Value]) {
        self.collect_full(roots);
        self.finish_old_sweep();
    }

    /// Minor cycle: collects the young generation only.
    pub fn collect_minor(&mut self, roots: &[Value]) {
        // Promotion must not append into a half-swept old list
        self.finish_old_sweep();
        let before = self.young_bytes;

        self.gray.clear();
        for root in roots {
            if let Value::Obj(handle) = root {
                self.mark_young(*handle);
            }
        }
        // Remembered old objects stand in for the rest of their generation
        let remembered = std::mem::take(&mut self.remembered);
        let mut scratch = Vec::new();
        for owner in &remembered {
            scratch.clear();
            self.push_children(*owner, &mut scratch);
            for child in &scratch {
                self.mark_young(*child);
            }
        }
        self.remembered = remembered;

        self.trace_gray(false, &mut scratch);
        self.sweep_young(false);
        self.refilter_remembered();

        self.young_next = ((self.young_bytes as f64 * self.tuning.young_growth_factor) as usize)
            .max(self.tuning.min_young_bytes);
        self.minor_pending = false;

        log::debug!(
            "GC minor: {} -> {} young bytes, {} objects live",
            before,
            self.young_bytes,
            self.object_count()
        );
    }

    /// Full cycle: traces the entire heap, sweeps the young generation and
    /// parks the incremental old sweep.
    pub fn collect_full(&mut self, roots: &[Value]) {
        self.finish_old_sweep();
        let before = self.bytes_total();

        self.gray.clear();
        for root in roots {
            if let Value::Obj(handle) = root {
                self.mark_any(*handle);
            }
        }
        let mut scratch = Vec::new();
        self.trace_gray(true, &mut scratch);

        // Survivors promoted now keep their mark so the pending old sweep
        // recognises them as live
        self.sweep_young(true);
        self.refilter_remembered();
        self.old_sweep_cursor = Some(0);
        self.full_pending = false;
        self.minor_pending = false;

        self.young_next = ((self.young_bytes as f64 * self.tuning.young_growth_factor) as usize)
            .max(self.tuning.min_young_bytes);

        log::debug!(
            "GC full: {} bytes before, {} young after, old sweep parked over {} objects",
            before,
            self.young_bytes,
            self.old.len()
        );
    }

    /// True while a full cycle's old sweep is still in flight.
    pub fn old_sweep_active(&self) -> bool {
        self.old_sweep_cursor.is_some()
    }

    /// Drains the incremental sweep to completion.
    pub fn finish_old_sweep(&mut self) {
        while self.old_sweep_cursor.is_some() {
            self.advance_old_sweep();
        }
    }

    /// Sweeps one bounded batch of the old generation.
    pub(crate) fn advance_old_sweep(&mut self) {
        let Some(mut i) = self.old_sweep_cursor else {
            return;
        };
        let batch = self.tuning.sweep_batch.max(1);
        let mut processed = 0;
        let mut freed = 0usize;
        while processed < batch && i < self.old.len() {
            let handle = self.old[i];
            let marked = self.header(handle).is_some_and(|h| h.marked);
            if marked {
                if let Some(header) = self.header_mut(handle) {
                    header.marked = false;
                }
                i += 1;
            } else {
                let size = self.free_object(handle);
                self.old_bytes = self.old_bytes.saturating_sub(size);
                freed += size;
                // The tail object swapped into `i` is processed next round
                self.old.swap_remove(i);
            }
            processed += 1;
        }
        if freed > 0 {
            log::trace!("GC old sweep batch freed {freed} bytes");
        }
        if i >= self.old.len() {
            self.old_sweep_cursor = None;
            self.heap_next = ((self.bytes_total() as f64 * self.tuning.heap_growth_factor)
                as usize)
                .max(self.tuning.min_heap_bytes);
        } else {
            self.old_sweep_cursor = Some(i);
        }
    }

    // === Marking ===

    fn mark_young(&mut self, handle: Handle) {
        let Some(header) = self.header_mut(handle) else {
            return;
        };
        if header.generation == Generation::Young && !header.marked {
            header.marked = true;
            self.gray.push(handle);
        }
    }

    fn mark_any(&mut self, handle: Handle) {
        let Some(header) = self.header_mut(handle) else {
            return;
        };
        if !header.marked {
            header.marked = true;
            self.gray.push(handle);
        }
    }

    /// Drains the gray queue. A minor trace treats old objects as opaque:
    /// they never enter the queue, so only young children are followed.
    fn trace_gray(&mut self, full: bool, scratch: &mut Vec<Handle>) {
        while let Some(handle) = self.gray.pop() {
            scratch.clear();
            self.push_children(handle, scratch);
            for child in scratch.iter() {
                if full {
                    self.mark_any(*child);
                } else {
                    self.mark_young(*child);
                }
            }
        }
    }

    pub(crate) fn push_children(&self, handle: Handle, out: &mut Vec<Handle>) {
        if let Some(object) = self.get(handle) {
            object.for_each_child(|child| out.push(child));
        }
    }

    // === Sweeping ===

    /// Partitions the young list: live objects age (and possibly promote),
    /// dead objects are freed. During a full cycle promoted objects keep
    /// their mark for the old sweep that follows.
    fn sweep_young(&mut self, promote_marked: bool) {
        let young = std::mem::take(&mut self.young);
        let promotion_age = self.tuning.promotion_age;
        let mut kept = Vec::with_capacity(young.len());
        let mut scratch = Vec::new();
        let mut freed_bytes = 0usize;

        for handle in young {
            let Some(header) = self.header_mut(handle) else {
                continue;
            };
            if !header.marked {
                let size = self.free_object(handle);
                self.young_bytes = self.young_bytes.saturating_sub(size);
                freed_bytes += size;
                continue;
            }

            header.age = header.age.saturating_add(1);
            if header.age >= promotion_age {
                // Promote
                header.generation = Generation::Old;
                header.age = 0;
                header.marked = promote_marked;
                let size = header.size;
                self.young_bytes = self.young_bytes.saturating_sub(size);
                self.old_bytes += size;
                self.old.push(handle);

                // A promoted object may carry young children with it
                scratch.clear();
                self.push_children(handle, &mut scratch);
                let carries_young = scratch.iter().any(|child| {
                    matches!(
                        self.header(*child).map(|h| h.generation),
                        Some(Generation::Young)
                    )
                });
                if carries_young {
                    self.remember(handle);
                }
            } else {
                header.marked = false;
                kept.push(handle);
            }
        }

        self.young = kept;
        if freed_bytes > 0 {
            log::trace!("GC young sweep freed {freed_bytes} bytes");
        }
    }

    /// Drops remembered-set entries that no longer hold young references.
    fn refilter_remembered(&mut self) {
        let remembered = std::mem::take(&mut self.remembered);
        let mut scratch = Vec::new();
        for owner in remembered {
            let alive_old = matches!(
                self.header(owner).map(|h| h.generation),
                Some(Generation::Old)
            );
            if !alive_old {
                if let Some(header) = self.header_mut(owner) {
                    header.remembered = false;
                }
                continue;
            }
            scratch.clear();
            self.push_children(owner, &mut scratch);
            let still_needed = scratch.iter().any(|child| {
                matches!(
                    self.header(*child).map(|h| h.generation),
                    Some(Generation::Young)
                )
            });
            if still_needed {
                self.remembered.push(owner);
            } else if let Some(header) = self.header_mut(owner) {
                header.remembered = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::GcTuning;
    use crate::object::{ObjArray, Object};

    fn heap() -> Heap {
        Heap::new(GcTuning {
            promotion_age: 2,
            sweep_batch: 4,
            ..GcTuning::default()
        })
    }

    fn alloc_array(heap: &mut Heap, items: Vec<Value>) -> Handle {
        heap.alloc(Object::Array(ObjArray { items }))
    }

    #[test]
    fn test_minor_frees_unreachable_young() {
        let mut h = heap();
        let live = alloc_array(&mut h, vec![]);
        let _dead = alloc_array(&mut h, vec![]);
        assert_eq!(h.object_count(), 2);

        h.collect_minor(&[Value::Obj(live)]);
        assert_eq!(h.object_count(), 1);
        assert!(h.get(live).is_some());
    }

    #[test]
    fn test_minor_traces_young_children() {
        let mut h = heap();
        let child = h.intern("payload");
        let parent = alloc_array(&mut h, vec![Value::Obj(child)]);

        h.collect_minor(&[Value::Obj(parent)]);
        assert!(h.get(child).is_some());
        assert!(h.is_interned("payload"));
    }

    #[test]
    fn test_promotion_after_surviving_minors() {
        let mut h = heap();
        let obj = alloc_array(&mut h, vec![]);
        let roots = [Value::Obj(obj)];
        h.collect_minor(&roots);
        assert_eq!(h.header(obj).unwrap().generation, Generation::Young);
        h.collect_minor(&roots);
        assert_eq!(h.header(obj).unwrap().generation, Generation::Old);
        assert_eq!(h.header(obj).unwrap().age, 0);
    }

    #[test]
    fn test_remembered_set_keeps_young_child_alive() {
        let mut h = heap();
        let owner = alloc_array(&mut h, vec![]);
        let roots = [Value::Obj(owner)];
        // Promote the owner
        h.collect_minor(&roots);
        h.collect_minor(&roots);
        assert_eq!(h.header(owner).unwrap().generation, Generation::Old);

        // Store a young child through the barrier; owner is NOT in the
        // minor root set
        let child = alloc_array(&mut h, vec![]);
        h.array_push(owner, Value::Obj(child)).unwrap();
        assert!(h.header(owner).unwrap().remembered);

        h.collect_minor(&[]);
        assert!(h.get(child).is_some(), "remembered set must root the child");
    }

    #[test]
    fn test_young_store_into_young_owner_needs_no_barrier_entry() {
        let mut h = heap();
        let owner = alloc_array(&mut h, vec![]);
        let child = alloc_array(&mut h, vec![]);
        h.array_push(owner, Value::Obj(child)).unwrap();
        assert!(!h.header(owner).unwrap().remembered);
    }

    #[test]
    fn test_full_collection_reclaims_old_garbage() {
        let mut h = heap();
        let obj = alloc_array(&mut h, vec![]);
        let roots = [Value::Obj(obj)];
        h.collect_minor(&roots);
        h.collect_minor(&roots);
        assert_eq!(h.header(obj).unwrap().generation, Generation::Old);

        // Now drop the root: a full cycle plus a drained sweep frees it
        h.collect_full(&[]);
        assert!(h.old_sweep_active());
        h.finish_old_sweep();
        assert!(h.get(obj).is_none());
        assert_eq!(h.object_count(), 0);
    }

    #[test]
    fn test_incremental_sweep_advances_in_batches() {
        let mut h = heap();
        let mut keep = Vec::new();
        for _ in 0..10 {
            keep.push(Value::Obj(alloc_array(&mut h, vec![])));
        }
        h.collect_minor(&keep);
        h.collect_minor(&keep);
        assert_eq!(h.old.len(), 10);

        // Everything is garbage now
        h.collect_full(&[]);
        assert!(h.old_sweep_active());
        // batch size 4: three batches to drain
        h.advance_old_sweep();
        assert!(h.old_sweep_active());
        h.advance_old_sweep();
        h.advance_old_sweep();
        assert!(!h.old_sweep_active());
        assert_eq!(h.object_count(), 0);
    }

    #[test]
    fn test_full_cycle_promotes_survivors_safely() {
        let mut h = heap();
        let obj = alloc_array(&mut h, vec![]);
        let roots = [Value::Obj(obj)];
        h.collect_minor(&roots);
        // Second survival happens inside a full cycle; the promoted object
        // must survive the old sweep that follows
        h.collect_full(&roots);
        h.finish_old_sweep();
        assert!(h.get(obj).is_some());
        assert_eq!(h.header(obj).unwrap().generation, Generation::Old);
        assert!(!h.header(obj).unwrap().marked);
    }

    #[test]
    fn test_interner_entry_dies_with_string() {
        let mut h = heap();
        h.intern("ephemeral");
        assert!(h.is_interned("ephemeral"));
        h.collect_minor(&[]);
        assert!(!h.is_interned("ephemeral"));
    }
}
