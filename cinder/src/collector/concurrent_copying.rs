use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use crate::{
    Address, Color, GcRoot, MarkStack, MarkWord, ObjectRef, RootInfo, Runtime,
    collector::{CollectorKind, GcCause, GcStats, sweep_main_space},
};

/// Region-evacuating copying collector. A cycle condemns every populated
/// region (the flip), then marking and copying are one operation: reaching
/// a from-space object evacuates it to a fresh region and plants a
/// forwarding pointer in the old mark word, so racing markers agree on a
/// single copy via CAS. When tracing finishes, no live reference points at
/// from-space; the invariant is verified, the from-space regions are
/// scrubbed and the cycle ends with zero fragmentation in the survivors.
///
/// With `concurrent_mark` the bulk of the trace runs alongside mutators:
/// the flip pause heals and evacuates every root, so mutators start the
/// window on to-space addresses; their loads and stores heal through the
/// read barrier and their reference stores land on dirty lines, which the
/// re-mark pause rescans before references are processed.
///
/// Objects too large for a region live in the main space and are traced
/// in place via its mark bitmap, then swept.
pub struct ConcurrentCopying<'r> {
    rt: &'r Runtime,
    stack: MarkStack,
    concurrent: bool,
    objects_marked: AtomicUsize,
    objects_moved: AtomicUsize,
    references_cleared: AtomicUsize,
}

impl<'r> ConcurrentCopying<'r> {
    pub fn new(rt: &'r Runtime) -> Self {
        Self {
            rt,
            stack: MarkStack::new(rt.options().mark_stack_capacity),
            concurrent: rt.options().concurrent_mark,
            objects_marked: AtomicUsize::new(0),
            objects_moved: AtomicUsize::new(0),
            references_cleared: AtomicUsize::new(0),
        }
    }

    fn is_marked(&self, addr: Address) -> Option<Address> {
        let heap = self.rt.heap();
        if !heap.contains(addr) || heap.immune().lock().contains(addr) {
            return Some(addr);
        }
        if heap.main_space().contains(addr) {
            return heap.main_space().mark.is_marked(addr).then_some(addr);
        }
        if heap.region_space().is_from_space(addr) {
            let obj = heap.object_at(addr)?;
            let mark = heap.mark_word(obj);
            return mark.is_forwarded().then(|| mark.forwarding());
        }
        // To-space object: alive iff it was reached (copied or grayed).
        Some(addr)
    }

    /// Mark-and-maybe-move. Returns the address every reference to this
    /// object must use from now on.
    fn mark(&self, addr: Address) -> Address {
        let heap = self.rt.heap();
        if !heap.contains(addr) || heap.immune().lock().contains(addr) {
            return addr;
        }

        if heap.main_space().contains(addr) {
            if heap.main_space().mark.mark(addr) {
                self.objects_marked.fetch_add(1, Ordering::AcqRel);
                if let Some(obj) = heap.object_at(addr) {
                    self.stack.push(obj);
                }
            }
            return addr;
        }

        if !heap.region_space().contains(addr) {
            return addr;
        }
        let Some(obj) = heap.object_at(addr) else {
            return addr;
        };

        if heap.region_space().is_from_space(addr) {
            loop {
                let mark = heap.mark_word(obj);
                if mark.is_forwarded() {
                    return mark.forwarding();
                }
                let words = heap.size_of(obj);
                let to = heap
                    .region_space()
                    .alloc(words, true)
                    .unwrap_or_else(|| panic!("VM out of memory: to-space exhausted"));
                heap.copy_words(addr, to, words);
                if heap.cas_mark_word(obj, mark, MarkWord::forwarded(to)) {
                    let copy = heap.object_at(to).expect("fresh copy vanished");
                    heap.set_mark_word(copy, MarkWord::white().with_color(Color::Gray));
                    self.objects_marked.fetch_add(1, Ordering::AcqRel);
                    self.objects_moved.fetch_add(1, Ordering::AcqRel);
                    self.stack.push(copy);
                    return to;
                }
                // Lost the race; the winner's copy is authoritative. The
                // words bumped for our copy stay dead until the region is
                // reclaimed.
            }
        }

        // Already in to-space; gray it once.
        let mark = heap.mark_word(obj);
        if mark.color() == Color::White
            && heap.cas_mark_word(obj, mark, mark.with_color(Color::Gray))
        {
            self.objects_marked.fetch_add(1, Ordering::AcqRel);
            self.stack.push(obj);
        }
        addr
    }

    /// Blacken: rewrite every field to its to-space address, delaying
    /// reference-type referents for the processor.
    fn scan(&self, obj: ObjectRef) {
        let heap = self.rt.heap();
        let kind = heap.class_kind(obj);

        let first_field = if kind.is_reference() {
            let referent = heap.load_field(obj, crate::REFERENT_FIELD);
            if referent.is_null() {
                // Nothing to heal or delay.
            } else if let Some(to) = self.is_marked(referent) {
                if to != referent {
                    heap.store_field(obj, crate::REFERENT_FIELD, to);
                }
            } else {
                self.rt.reference_processor().delay_reference(heap, kind, obj);
            }
            // The pending-next link is queue bookkeeping, not a strong edge.
            crate::PENDING_NEXT_FIELD + 1
        } else {
            0
        };

        for i in first_field..heap.num_fields(obj) {
            let raw = Address::new(heap.load_word(obj.addr().offset(crate::FIELDS_OFFSET + i)));
            let to = self.mark(raw);
            if to != raw {
                heap.store_word(obj.addr().offset(crate::FIELDS_OFFSET + i), to.raw());
            }
        }

        if heap.region_space().contains(obj.addr()) {
            let mark = heap.mark_word(obj);
            if !mark.is_forwarded() {
                heap.set_mark_word(obj, mark.with_color(Color::Black));
            }
        }
    }

    fn drain(&self) {
        while let Some(obj) = self.stack.pop() {
            self.scan(obj);
        }
    }

    pub fn process_references(&self, clear_soft: bool) {
        let heap = self.rt.heap();
        self.rt.vm_refs().disable_weak_access();
        self.rt.reference_processor().process_references(
            heap,
            clear_soft,
            &mut |addr| self.is_marked(addr),
            &mut |addr| {
                let to = self.mark(addr);
                self.drain();
                to
            },
        );
        let cleared = self
            .rt
            .reference_processor()
            .enqueue_cleared_references(heap);
        self.references_cleared
            .fetch_add(cleared.len(), Ordering::AcqRel);
        self.rt.stash_cleared_references(cleared);

        let mut is_marked = |addr: Address| self.is_marked(addr);
        self.rt.intern_table().sweep_weaks(&mut is_marked);
        self.rt.vm_refs().sweep_jni_weak_globals(&mut is_marked);
        self.rt.vm_refs().enable_weak_access();
    }

    /// Walk every to-space copy and every marked main-space object and
    /// assert that no field still points into from-space. A violation
    /// means the trace missed an edge, which is unrecoverable.
    fn verify_to_space_invariant(&self) {
        let heap = self.rt.heap();
        let regions = heap.region_space();

        let mut check = |obj: ObjectRef| {
            for i in 0..heap.num_fields(obj) {
                let raw =
                    Address::new(heap.load_word(obj.addr().offset(crate::FIELDS_OFFSET + i)));
                assert!(
                    !regions.is_from_space(raw),
                    "to-space invariant violated: {:?} field {i} points at from-space {raw:?}",
                    obj.addr()
                );
            }
        };

        // Every occupied to-space region: copies made by the trace plus
        // regions claimed by mutators after the flip.
        for region in regions.regions() {
            let flags = region.flags();
            if flags.is_empty() || flags.contains(crate::RegionFlags::FromSpace) {
                continue;
            }
            let mut cursor = region.begin();
            while cursor < region.top() {
                match heap.object_at(cursor) {
                    Some(obj) => {
                        check(obj);
                        cursor = cursor.offset(heap.size_of(obj));
                    }
                    // Dead words from a lost copy race; skip the rest.
                    None => break,
                }
            }
        }
        heap.main_space().mark.walk_marked(|addr| {
            if let Some(obj) = heap.object_at(addr) {
                check(obj);
            }
        });
    }

    /// Flip pause: condemn the populated regions, raise the read barrier
    /// (and the write barrier when the trace runs concurrently), then heal
    /// and evacuate every root so mutators resume on to-space addresses.
    pub fn initial_mark(&self) {
        let heap = self.rt.heap();
        {
            let mut immune = heap.immune().lock();
            immune.reset();
            immune.add_range(heap.boot().begin(), heap.boot().end());
        }
        heap.main_space().mark.clear_all();
        heap.dirty_lines().clear_all();
        let condemned = heap.region_space().flip();
        heap.barrier().set_read_active(true);
        if self.concurrent {
            heap.barrier().set_marking_active(true);
        }

        let mut visitor = |root: &GcRoot, _info: RootInfo| {
            let addr = root.load();
            let to = self.mark(addr);
            if to != addr {
                root.store(to);
            }
        };
        self.rt.visit_roots(&mut visitor);
        log::debug!(
            "concurrent-copying: flipped {condemned} regions, {} roots gray",
            self.stack.len()
        );
    }

    /// Trace and evacuate from the grayed roots. In concurrent mode this
    /// runs with mutators going: their loads heal through the read barrier
    /// and their reference stores dirty lines for the re-mark pause.
    pub fn copy_from_roots(&self) {
        self.drain();
    }

    /// Rescan every object on a line dirtied during the window. The line
    /// may cover marked main-space objects, to-space copies, or objects
    /// allocated mid-window; from-space originals are skipped because any
    /// store to one went through the healed to-space address.
    fn rescan_line(&self, begin: Address, words: usize) {
        let heap = self.rt.heap();
        let end = begin.offset(words);
        heap.main_space()
            .mark
            .walk_marked_range(begin, end, |addr| {
                if let Some(obj) = heap.object_at(addr) {
                    self.scan(obj);
                }
            });
        for region in heap.region_space().regions() {
            let flags = region.flags();
            if flags.is_empty()
                || flags.contains(crate::RegionFlags::FromSpace)
                || region.top() <= begin
                || region.begin() >= end
            {
                continue;
            }
            let mut cursor = region.begin();
            while cursor < region.top() {
                let Some(obj) = heap.object_at(cursor) else {
                    // Dead words from a lost copy race; skip the rest.
                    break;
                };
                let size = heap.size_of(obj);
                if cursor < end && cursor.offset(size) > begin {
                    self.scan(obj);
                }
                cursor = cursor.offset(size);
            }
        }
    }

    /// Re-mark pause: drain the dirty lines, pick up roots stored since
    /// the flip, finish the trace and retire the write barrier.
    pub fn remark(&self) {
        let heap = self.rt.heap();
        heap.dirty_lines()
            .drain(&mut |begin, words| self.rescan_line(begin, words));

        let mut visitor = |root: &GcRoot, _info: RootInfo| {
            let addr = root.load();
            let to = self.mark(addr);
            if to != addr {
                root.store(to);
            }
        };
        self.rt.visit_roots(&mut visitor);
        self.drain();
        heap.barrier().set_marking_active(false);
    }

    /// Terminal pause phase: verify no live field still points into
    /// from-space, sweep the main space, scrub the condemned regions and
    /// drop the read barrier. Returns the words reclaimed.
    pub fn sweep(&self) -> usize {
        let heap = self.rt.heap();
        self.drain();
        self.verify_to_space_invariant();

        let (main_reclaimed, main_live) = sweep_main_space(heap);
        let region_reclaimed = heap
            .region_space()
            .reclaim_from_spaces(heap.memory_region());
        heap.region_space().clear_newly();
        heap.barrier().set_read_active(false);

        let region_live: usize = heap
            .region_space()
            .regions()
            .iter()
            .map(|r| r.top().raw() - r.begin().raw())
            .sum();
        heap.set_words_allocated(main_live + region_live);
        main_reclaimed + region_reclaimed
    }

    pub fn run(&self, cause: GcCause, clear_soft: bool) -> GcStats {
        let start = Instant::now();
        log::info!(
            "concurrent-copying start (cause {cause:?}, concurrent {}, clear_soft {clear_soft})",
            self.concurrent
        );

        let reclaimed = if self.concurrent {
            self.rt.run_paused(|| self.initial_mark());
            self.copy_from_roots();
            self.rt.run_paused(|| {
                self.remark();
                self.process_references(clear_soft);
                self.sweep()
            })
        } else {
            self.rt.run_paused(|| {
                self.initial_mark();
                self.copy_from_roots();
                self.remark();
                self.process_references(clear_soft);
                self.sweep()
            })
        };

        let stats = GcStats {
            kind: CollectorKind::ConcurrentCopying,
            cause,
            duration: start.elapsed(),
            objects_marked: self.objects_marked.load(Ordering::Acquire),
            words_reclaimed: reclaimed,
            objects_moved: self.objects_moved.load(Ordering::Acquire),
            references_cleared: self.references_cleared.load(Ordering::Acquire),
        };
        log::info!(
            "concurrent-copying done in {:?}: {} marked, {} moved, {} words reclaimed",
            stats.duration,
            stats.objects_marked,
            stats.objects_moved,
            stats.words_reclaimed
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassKind, CollectorType, GcOptions, REFERENT_FIELD, RegionFlags};

    fn runtime(concurrent: bool) -> Runtime {
        Runtime::new(GcOptions {
            collector: CollectorType::ConcurrentCopying,
            concurrent_mark: concurrent,
            heap_words: 8192,
            boot_words: 256,
            main_words: 1024,
            region_words: 256,
            ..Default::default()
        })
    }

    #[test]
    fn live_graph_is_evacuated_and_from_space_scrubbed() {
        let rt = runtime(false);
        let heap = rt.heap();

        let a = rt.allocate_ordinary(1).unwrap();
        let b = rt.allocate_ordinary(0).unwrap();
        let dead = rt.allocate_ordinary(0).unwrap();
        heap.store_field(a, 0, b.addr());
        let ha = rt.vm_refs().add_global(a.addr()).unwrap();

        let stats = ConcurrentCopying::new(&rt).run(GcCause::Explicit, false);
        assert_eq!(stats.objects_moved, 2, "only the live graph is copied");

        let new_a = heap.object_at(rt.vm_refs().decode_global(heap, ha)).unwrap();
        assert_ne!(new_a.addr(), a.addr());
        let new_b = heap.object_at(heap.load_field(new_a, 0)).unwrap();
        assert_ne!(new_b.addr(), b.addr());
        assert!(!heap.region_space().is_from_space(new_a.addr()));

        // Old copies and the dead object are gone.
        assert!(heap.object_at(a.addr()).is_none());
        assert!(heap.object_at(dead.addr()).is_none());

        // Survivor regions are plain active after the cycle.
        assert!(
            heap.region_space()
                .region_of(new_a.addr())
                .flags()
                .contains(RegionFlags::Active)
        );
        assert!(
            !heap.region_space()
                .region_of(new_a.addr())
                .flags()
                .contains(RegionFlags::Newly)
        );
    }

    #[test]
    fn identity_hash_survives_evacuation() {
        let rt = runtime(false);
        let heap = rt.heap();

        let obj = rt.allocate_ordinary(0).unwrap();
        let h = rt.vm_refs().add_global(obj.addr()).unwrap();
        let hash_before = heap.identity_hash(obj);

        ConcurrentCopying::new(&rt).run(GcCause::Explicit, false);

        let moved = heap.object_at(rt.vm_refs().decode_global(heap, h)).unwrap();
        assert_ne!(moved.addr(), obj.addr());
        assert_eq!(heap.identity_hash(moved), hash_before);
    }

    #[test]
    fn weak_global_follows_the_copy_or_clears() {
        let rt = runtime(false);
        let heap = rt.heap();

        let kept = rt.allocate_ordinary(0).unwrap();
        let doomed = rt.allocate_ordinary(0).unwrap();
        let strong = rt.vm_refs().add_global(kept.addr()).unwrap();
        let weak_kept = rt.vm_refs().add_weak_global(kept.addr()).unwrap();
        let weak_doomed = rt.vm_refs().add_weak_global(doomed.addr()).unwrap();

        ConcurrentCopying::new(&rt).run(GcCause::Explicit, false);

        let new_addr = rt.vm_refs().decode_global(heap, strong);
        assert_eq!(rt.vm_refs().decode_weak_global(heap, weak_kept), new_addr);
        assert_eq!(
            rt.vm_refs().decode_weak_global(heap, weak_doomed),
            Address::NULL
        );
    }

    #[test]
    fn weak_reference_object_is_processed_across_the_copy() {
        let rt = runtime(false);
        let heap = rt.heap();

        let referent = rt.allocate_ordinary(0).unwrap();
        let weak = rt
            .allocate_reference(ClassKind::WeakReference, referent.addr())
            .unwrap();
        let h = rt.vm_refs().add_global(weak.addr()).unwrap();

        ConcurrentCopying::new(&rt).run(GcCause::Explicit, false);

        let new_weak = heap.object_at(rt.vm_refs().decode_global(heap, h)).unwrap();
        assert_eq!(heap.load_field(new_weak, REFERENT_FIELD), Address::NULL);
        assert_eq!(rt.take_cleared_references(), vec![new_weak]);
    }

    #[test]
    fn consecutive_cycles_keep_the_graph_intact() {
        let rt = runtime(false);
        let heap = rt.heap();

        let a = rt.allocate_ordinary(1).unwrap();
        let b = rt.allocate_ordinary(1).unwrap();
        heap.store_field(a, 0, b.addr());
        heap.store_field(b, 0, a.addr());
        let ha = rt.vm_refs().add_global(a.addr()).unwrap();

        for _ in 0..3 {
            ConcurrentCopying::new(&rt).run(GcCause::Explicit, false);
        }

        let new_a = heap.object_at(rt.vm_refs().decode_global(heap, ha)).unwrap();
        let new_b = heap.object_at(heap.load_field(new_a, 0)).unwrap();
        assert_eq!(heap.load_field(new_b, 0), new_a.addr());
    }

    #[test]
    fn objects_published_during_the_copy_window_survive() {
        let rt = runtime(true);
        let heap = rt.heap();

        let holder = rt.allocate_ordinary(1).unwrap();
        let h = rt.vm_refs().add_global(holder.addr()).unwrap();

        let cc = ConcurrentCopying::new(&rt);
        cc.initial_mark();
        cc.copy_from_roots();

        // Mutator work during the window. `holder` is the stale pre-flip
        // address; the store heals to the evacuated copy and dirties its
        // line for the re-mark pause.
        let hidden = rt.allocate_ordinary(0).unwrap();
        heap.store_field(holder, 0, hidden.addr());
        assert!(heap.dirty_lines().is_dirty(heap.read_barrier_address(holder.addr())));

        // A root created mid-window, reachable from nothing traced so far.
        let late = rt.allocate_ordinary(0).unwrap();
        let hlate = rt.vm_refs().add_global(late.addr()).unwrap();

        cc.remark();
        cc.process_references(false);
        cc.sweep();

        let new_holder = heap.object_at(rt.vm_refs().decode_global(heap, h)).unwrap();
        assert_ne!(new_holder.addr(), holder.addr(), "holder was evacuated");
        let published = heap.load_field(new_holder, 0);
        assert!(heap.object_at(published).is_some(), "published edge survives");
        assert!(!heap.region_space().is_from_space(published));

        let new_late = rt.vm_refs().decode_global(heap, hlate);
        assert!(heap.object_at(new_late).is_some(), "mid-window root survives");
    }
}
