use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use crate::{
    Address, GcRoot, MarkStack, MarkWord, RootInfo, Runtime,
    collector::{CollectorKind, GcCause, GcStats, Marker},
};

/// Stop-the-world sliding compactor for the main space. Survivors slide
/// toward the space's start in address order, every reference (roots,
/// fields, weak tables) is rewritten to the new locations, and the freed
/// tail becomes one contiguous block. Also serves as the escalation path
/// when a regular cycle cannot satisfy an allocation: same space, zero
/// fragmentation afterwards.
pub struct MarkCompact<'r> {
    rt: &'r Runtime,
    stack: MarkStack,
    objects_marked: AtomicUsize,
    references_cleared: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct Relocation {
    src: Address,
    dest: Address,
    words: usize,
}

impl<'r> MarkCompact<'r> {
    pub fn new(rt: &'r Runtime) -> Self {
        Self {
            rt,
            stack: MarkStack::new(rt.options().mark_stack_capacity),
            objects_marked: AtomicUsize::new(0),
            references_cleared: AtomicUsize::new(0),
        }
    }

    fn mark_phase(&self) {
        let heap = self.rt.heap();
        {
            let mut immune = heap.immune().lock();
            immune.reset();
            immune.add_range(heap.boot().begin(), heap.boot().end());
        }
        heap.main_space().mark.clear_all();

        let marker = Marker::new(self.rt, &self.stack);
        let mut visitor = |root: &GcRoot, _info: RootInfo| marker.mark(root.load());
        self.rt.visit_roots(&mut visitor);
        marker.drain_parallel(self.rt.options().gc_threads);
        self.objects_marked
            .fetch_add(marker.objects_marked(), Ordering::AcqRel);
    }

    fn process_references(&self, clear_soft: bool) {
        let heap = self.rt.heap();
        let marker = Marker::new(self.rt, &self.stack);

        self.rt.vm_refs().disable_weak_access();
        self.rt.reference_processor().process_references(
            heap,
            clear_soft,
            &mut |addr| marker.is_marked(addr).then_some(addr),
            &mut |addr| {
                marker.mark(addr);
                marker.drain();
                addr
            },
        );
        let cleared = self
            .rt
            .reference_processor()
            .enqueue_cleared_references(heap);
        self.references_cleared
            .fetch_add(cleared.len(), Ordering::AcqRel);
        self.rt.stash_cleared_references(cleared);
        self.objects_marked
            .fetch_add(marker.objects_marked(), Ordering::AcqRel);
        // Weak access stays disabled until the fixup is complete; a weak
        // decode mid-slide would read a half-moved world.
    }

    /// Assign each survivor its slide target and plant the forwarding
    /// pointer in its mark word.
    fn compute_forwarding(&self) -> Vec<Relocation> {
        let heap = self.rt.heap();
        let main = heap.main_space();
        let mut plan = Vec::new();
        let mut dest = main.begin();

        let mut survivors = Vec::new();
        main.mark.walk_marked(|addr| survivors.push(addr));
        for src in survivors {
            let obj = heap.object_at(src).expect("marked address is not an object");
            let words = heap.size_of(obj);
            heap.set_mark_word(obj, MarkWord::forwarded(dest));
            plan.push(Relocation { src, dest, words });
            dest = dest.offset(words);
        }
        plan
    }

    /// Resolve an address through a planted forwarding pointer.
    fn forward(&self, addr: Address) -> Address {
        let heap = self.rt.heap();
        if !heap.contains(addr) || !heap.main_space().contains(addr) {
            return addr;
        }
        match heap.object_at(addr) {
            Some(obj) => {
                let mark = heap.mark_word(obj);
                if mark.is_forwarded() {
                    mark.forwarding()
                } else {
                    addr
                }
            }
            None => addr,
        }
    }

    /// Rewrite every reference in the heap to the slide targets: roots,
    /// weak tables, then the fields of every survivor (still at their old
    /// locations).
    fn update_references(&self, plan: &[Relocation]) {
        let heap = self.rt.heap();

        let mut visitor = |root: &GcRoot, _info: RootInfo| {
            let addr = root.load();
            let to = self.forward(addr);
            if to != addr {
                root.store(to);
            }
        };
        self.rt.visit_roots(&mut visitor);

        let mut forward_weak = |addr: Address| {
            let marker = Marker::new(self.rt, &self.stack);
            marker.is_marked(addr).then(|| self.forward(addr))
        };
        self.rt.intern_table().sweep_weaks(&mut forward_weak);
        self.rt.vm_refs().sweep_jni_weak_globals(&mut forward_weak);

        for reloc in plan {
            let obj = heap.object_at(reloc.src).expect("survivor vanished");
            for i in 0..heap.num_fields(obj) {
                let raw = Address::new(
                    heap.load_word(obj.addr().offset(crate::FIELDS_OFFSET + i)),
                );
                let to = self.forward(raw);
                if to != raw {
                    heap.store_word(obj.addr().offset(crate::FIELDS_OFFSET + i), to.raw());
                }
            }
        }
    }

    /// Slide the survivors in ascending order and hand the whole tail back
    /// as one free block.
    fn relocate(&self, plan: &[Relocation]) -> (usize, usize) {
        let heap = self.rt.heap();
        let main = heap.main_space();
        let mut moved = 0usize;
        let mut live_words = 0usize;
        let mut compact_top = main.begin();

        for reloc in plan {
            if reloc.dest != reloc.src {
                heap.copy_words(reloc.src, reloc.dest, reloc.words);
                moved += 1;
            }
            let obj = heap.object_at(reloc.dest).expect("relocated object vanished");
            heap.set_mark_word(obj, MarkWord::white());
            live_words += reloc.words;
            compact_top = reloc.dest.offset(reloc.words);
        }

        let tail = main.end().raw() - compact_top.raw();
        heap.memory_region().scrub(compact_top, tail);
        main.set_free_list(vec![crate::FreeBlock {
            begin: compact_top,
            words: tail,
        }]);
        main.live.clear_all();
        main.mark.clear_all();
        for reloc in plan {
            main.live.mark(reloc.dest);
        }
        heap.set_words_allocated(live_words);
        (moved, tail)
    }

    pub fn run(&self, cause: GcCause, clear_soft: bool) -> GcStats {
        let start = Instant::now();
        log::info!("mark-compact start (cause {cause:?}, clear_soft {clear_soft})");

        let (moved, reclaimed) = self.rt.run_paused(|| {
            self.mark_phase();
            self.process_references(clear_soft);
            let plan = self.compute_forwarding();
            self.update_references(&plan);
            let out = self.relocate(&plan);
            self.rt.vm_refs().enable_weak_access();
            out
        });

        let stats = GcStats {
            kind: CollectorKind::MarkCompact,
            cause,
            duration: start.elapsed(),
            objects_marked: self.objects_marked.load(Ordering::Acquire),
            words_reclaimed: reclaimed,
            objects_moved: moved,
            references_cleared: self.references_cleared.load(Ordering::Acquire),
        };
        log::info!(
            "mark-compact done in {:?}: {} marked, {} moved, {} words free",
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
    use crate::{ClassKind, CollectorType, GcOptions, REFERENT_FIELD, object_words};

    fn runtime() -> Runtime {
        Runtime::new(GcOptions {
            collector: CollectorType::MarkCompact,
            heap_words: 8192,
            boot_words: 256,
            main_words: 4096,
            region_words: 256,
            ..Default::default()
        })
    }

    #[test]
    fn survivors_slide_left_and_references_follow() {
        let rt = runtime();
        let heap = rt.heap();

        let dead = rt.allocate_ordinary(8).unwrap();
        let a = rt.allocate_ordinary(1).unwrap();
        let b = rt.allocate_ordinary(0).unwrap();
        heap.store_field(a, 0, b.addr());
        let ha = rt.vm_refs().add_global(a.addr()).unwrap();
        let hb = rt.vm_refs().add_global(b.addr()).unwrap();
        assert!(a.addr() > dead.addr());

        let stats = MarkCompact::new(&rt).run(GcCause::Explicit, false);
        assert_eq!(stats.objects_moved, 2);

        let new_a = heap.object_at(rt.vm_refs().decode_global(heap, ha)).unwrap();
        let new_b = heap.object_at(rt.vm_refs().decode_global(heap, hb)).unwrap();
        // Slid into the hole the dead object left.
        assert_eq!(new_a.addr(), heap.main_space().begin());
        assert_eq!(new_b.addr(), new_a.addr().offset(object_words(1)));
        // The field edge survived the slide.
        assert_eq!(heap.load_field(new_a, 0), new_b.addr());

        // One contiguous free block afterwards.
        assert_eq!(
            heap.main_space().free_words(),
            heap.main_space().size() - object_words(1) - object_words(0)
        );
    }

    #[test]
    fn identity_hash_is_stable_across_the_move() {
        let rt = runtime();
        let heap = rt.heap();

        let _dead = rt.allocate_ordinary(4).unwrap();
        let obj = rt.allocate_ordinary(0).unwrap();
        let h = rt.vm_refs().add_global(obj.addr()).unwrap();
        let hash_before = heap.identity_hash(obj);

        MarkCompact::new(&rt).run(GcCause::Explicit, false);

        let moved = heap.object_at(rt.vm_refs().decode_global(heap, h)).unwrap();
        assert_ne!(moved.addr(), obj.addr());
        assert_eq!(heap.identity_hash(moved), hash_before);
    }

    #[test]
    fn weak_tables_track_moved_objects() {
        let rt = runtime();
        let heap = rt.heap();

        let _dead = rt.allocate_ordinary(4).unwrap();
        let kept = rt.allocate_ordinary(0).unwrap();
        let strong = rt.vm_refs().add_global(kept.addr()).unwrap();
        let weak = rt.vm_refs().add_weak_global(kept.addr()).unwrap();

        MarkCompact::new(&rt).run(GcCause::Explicit, false);

        let new_addr = rt.vm_refs().decode_global(heap, strong);
        assert_ne!(new_addr, kept.addr());
        assert_eq!(rt.vm_refs().decode_weak_global(heap, weak), new_addr);
    }

    #[test]
    fn cleared_reference_is_delivered_at_its_new_address() {
        let rt = runtime();
        let heap = rt.heap();

        let _dead = rt.allocate_ordinary(4).unwrap();
        let referent = rt.allocate_ordinary(0).unwrap();
        let weak = rt
            .allocate_reference(ClassKind::WeakReference, referent.addr())
            .unwrap();
        let h = rt.vm_refs().add_global(weak.addr()).unwrap();

        MarkCompact::new(&rt).run(GcCause::Explicit, false);

        let new_weak = heap.object_at(rt.vm_refs().decode_global(heap, h)).unwrap();
        assert_eq!(heap.load_field(new_weak, REFERENT_FIELD), Address::NULL);
        assert_eq!(rt.take_cleared_references(), vec![new_weak]);
    }
}
