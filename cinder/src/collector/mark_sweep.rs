use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use crate::{
    Address, GcRoot, MarkStack, RootInfo, Runtime,
    collector::{CollectorKind, GcCause, GcStats, Marker, sweep_main_space},
};

/// Tracing collector for the main space. Runs fully stop-the-world by
/// default; with `concurrent_mark` the bulk of the trace runs alongside
/// mutators, and a short re-mark pause rescans the lines they dirtied.
///
/// The phase methods are public so an embedder (and the tests) can step
/// the cycle and interleave mutation deterministically; `run` drives the
/// standard sequence.
pub struct MarkSweep<'r> {
    rt: &'r Runtime,
    stack: MarkStack,
    concurrent: bool,
    objects_marked: AtomicUsize,
    references_cleared: AtomicUsize,
}

impl<'r> MarkSweep<'r> {
    pub fn new(rt: &'r Runtime) -> Self {
        let options = rt.options();
        Self {
            rt,
            stack: MarkStack::new(options.mark_stack_capacity),
            concurrent: options.concurrent_mark,
            objects_marked: AtomicUsize::new(0),
            references_cleared: AtomicUsize::new(0),
        }
    }

    pub fn mark_stack(&self) -> &MarkStack {
        &self.stack
    }

    fn marker(&self) -> Marker<'_> {
        Marker::new(self.rt, &self.stack)
    }

    fn note_marked(&self, marker: &Marker<'_>) {
        self.objects_marked
            .fetch_add(marker.objects_marked(), Ordering::AcqRel);
    }

    /// Pause phase: declare the boot space immune, reset the mark bitmap
    /// and gray every root. With concurrent marking the write barrier goes
    /// live here, before any mutator resumes.
    pub fn initial_mark(&self) {
        let heap = self.rt.heap();
        {
            let mut immune = heap.immune().lock();
            immune.reset();
            immune.add_range(heap.boot().begin(), heap.boot().end());
        }
        heap.main_space().mark.clear_all();
        heap.dirty_lines().clear_all();
        if self.concurrent {
            heap.barrier().set_marking_active(true);
        }

        let marker = self.marker();
        let mut visitor = |root: &GcRoot, _info: RootInfo| marker.mark(root.load());
        self.rt.visit_roots(&mut visitor);
        self.note_marked(&marker);
        log::debug!("mark-sweep: initial mark done, {} gray", self.stack.len());
    }

    /// Trace the graph from the grayed roots. Concurrent mode runs this
    /// with mutators going; otherwise it runs inside the pause.
    pub fn mark_from_roots(&self) {
        let marker = self.marker();
        marker.drain_parallel(self.rt.options().gc_threads);
        self.note_marked(&marker);
    }

    /// Re-mark pause: rescan objects on lines the mutators dirtied during
    /// the concurrent trace, pick up roots created since the initial mark,
    /// then finish the trace and retire the write barrier.
    pub fn remark(&self) {
        let heap = self.rt.heap();
        let marker = self.marker();

        let mut rescanned = 0usize;
        heap.dirty_lines().drain(&mut |begin, words| {
            heap.main_space()
                .mark
                .walk_marked_range(begin, begin.offset(words), |addr| {
                    if let Some(obj) = heap.object_at(addr) {
                        marker.scan(obj);
                        rescanned += 1;
                    }
                });
        });

        let mut visitor = |root: &GcRoot, _info: RootInfo| marker.mark(root.load());
        self.rt.visit_roots(&mut visitor);
        marker.drain();
        self.note_marked(&marker);

        heap.barrier().set_marking_active(false);
        log::debug!("mark-sweep: re-mark rescanned {rescanned} objects");
    }

    /// Decide reference fates now that marking is complete. Weak-table
    /// accesses block for the duration.
    pub fn process_references(&self, clear_soft: bool) {
        let heap = self.rt.heap();
        let marker = self.marker();

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

        let mut is_marked = |addr: Address| marker.is_marked(addr).then_some(addr);
        self.rt.intern_table().sweep_weaks(&mut is_marked);
        self.rt.vm_refs().sweep_jni_weak_globals(&mut is_marked);
        self.rt.vm_refs().enable_weak_access();
        self.note_marked(&marker);
    }

    /// Reclaim everything the trace left white and rebuild the free list.
    pub fn sweep(&self) -> usize {
        let (reclaimed, live) = sweep_main_space(self.rt.heap());
        log::debug!("mark-sweep: swept {reclaimed} words, {live} live");
        reclaimed
    }

    pub fn run(&self, cause: GcCause, clear_soft: bool) -> GcStats {
        let start = Instant::now();
        log::info!(
            "mark-sweep start (cause {cause:?}, concurrent {}, clear_soft {clear_soft})",
            self.concurrent
        );

        let words_reclaimed;
        if self.concurrent {
            self.rt.run_paused(|| self.initial_mark());
            self.mark_from_roots();
            words_reclaimed = self.rt.run_paused(|| {
                self.remark();
                self.process_references(clear_soft);
                self.sweep()
            });
        } else {
            words_reclaimed = self.rt.run_paused(|| {
                self.initial_mark();
                self.mark_from_roots();
                self.process_references(clear_soft);
                self.sweep()
            });
        }

        let stats = GcStats {
            kind: CollectorKind::MarkSweep,
            cause,
            duration: start.elapsed(),
            objects_marked: self.objects_marked.load(Ordering::Acquire),
            words_reclaimed,
            objects_moved: 0,
            references_cleared: self.references_cleared.load(Ordering::Acquire),
        };
        log::info!(
            "mark-sweep done in {:?}: {} marked, {} words reclaimed, {} refs cleared",
            stats.duration,
            stats.objects_marked,
            stats.words_reclaimed,
            stats.references_cleared
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassKind, GcOptions, ObjectRef, REFERENT_FIELD};

    fn runtime(concurrent: bool) -> Runtime {
        Runtime::new(GcOptions {
            heap_words: 8192,
            boot_words: 256,
            main_words: 4096,
            region_words: 256,
            concurrent_mark: concurrent,
            ..Default::default()
        })
    }

    fn is_live(rt: &Runtime, obj: ObjectRef) -> bool {
        rt.heap().main_space().live.is_marked(obj.addr())
            && rt.heap().object_at(obj.addr()).is_some()
    }

    #[test]
    fn unreachable_objects_are_reclaimed_and_scrubbed() {
        let rt = runtime(false);
        let live = rt.allocate_ordinary(1).unwrap();
        let child = rt.allocate_ordinary(0).unwrap();
        let dead = rt.allocate_ordinary(0).unwrap();
        rt.heap().store_field(live, 0, child.addr());
        let _root = rt.vm_refs().add_global(live.addr()).unwrap();

        let before = rt.heap().main_space().free_words();
        let ms = MarkSweep::new(&rt);
        let stats = ms.run(GcCause::Explicit, false);

        assert!(is_live(&rt, live));
        assert!(is_live(&rt, child));
        assert!(!is_live(&rt, dead), "unrooted object must be swept");
        assert!(rt.heap().object_at(dead.addr()).is_none(), "swept memory is scrubbed");
        assert!(rt.heap().main_space().free_words() > before);
        assert!(stats.objects_marked >= 2);
    }

    #[test]
    fn objects_reachable_only_through_a_dirty_write_survive_remark() {
        let rt = runtime(true);
        let holder = rt.allocate_ordinary(1).unwrap();
        let hidden = rt.allocate_ordinary(0).unwrap();
        let _root = rt.vm_refs().add_global(holder.addr()).unwrap();

        let ms = MarkSweep::new(&rt);
        ms.initial_mark();
        ms.mark_from_roots();

        // Mutator work during the concurrent window: publish `hidden`
        // through an already-black object. The write barrier dirties the
        // holder's line.
        rt.heap().store_field(holder, 0, hidden.addr());
        assert!(rt.heap().dirty_lines().is_dirty(holder.addr()));

        ms.remark();
        ms.process_references(false);
        ms.sweep();

        assert!(is_live(&rt, holder));
        assert!(is_live(&rt, hidden), "dirty-line rescan must keep it alive");
    }

    #[test]
    fn roots_added_during_the_concurrent_window_survive() {
        let rt = runtime(true);
        let early = rt.allocate_ordinary(0).unwrap();
        let _root = rt.vm_refs().add_global(early.addr()).unwrap();

        let ms = MarkSweep::new(&rt);
        ms.initial_mark();
        ms.mark_from_roots();

        // A brand-new object published only through a new global root.
        let late = rt.allocate_ordinary(0).unwrap();
        let _late_root = rt.vm_refs().add_global(late.addr()).unwrap();

        ms.remark();
        ms.process_references(false);
        ms.sweep();

        assert!(is_live(&rt, early));
        assert!(is_live(&rt, late), "re-mark revisits roots");
    }

    #[test]
    fn weak_reference_to_dead_object_is_cleared_and_delivered() {
        let rt = runtime(false);
        let referent = rt.allocate_ordinary(0).unwrap();
        let weak = rt
            .allocate_reference(ClassKind::WeakReference, referent.addr())
            .unwrap();
        let _root = rt.vm_refs().add_global(weak.addr()).unwrap();

        let ms = MarkSweep::new(&rt);
        let stats = ms.run(GcCause::Explicit, false);

        assert!(is_live(&rt, weak));
        assert!(!is_live(&rt, referent));
        assert_eq!(
            rt.reference_processor().get_referent(rt.heap(), weak),
            Address::NULL
        );
        assert_eq!(stats.references_cleared, 1);
        assert_eq!(rt.take_cleared_references(), vec![weak]);
    }

    #[test]
    fn strongly_reachable_referent_is_not_cleared() {
        let rt = runtime(false);
        let referent = rt.allocate_ordinary(0).unwrap();
        let weak = rt
            .allocate_reference(ClassKind::WeakReference, referent.addr())
            .unwrap();
        let _r1 = rt.vm_refs().add_global(weak.addr()).unwrap();
        let _r2 = rt.vm_refs().add_global(referent.addr()).unwrap();

        let ms = MarkSweep::new(&rt);
        ms.run(GcCause::Explicit, false);

        assert_eq!(
            rt.reference_processor().get_referent(rt.heap(), weak),
            referent.addr()
        );
        assert!(rt.take_cleared_references().is_empty());

        // The referent slot still reads through the normal field path too.
        assert_eq!(rt.heap().load_field(weak, REFERENT_FIELD), referent.addr());
    }

    #[test]
    fn finalizer_reference_outliving_its_first_cycle_stays_consistent() {
        let rt = runtime(false);
        let holder = rt.allocate_ordinary(1).unwrap();
        let referent = rt.allocate_ordinary(0).unwrap();
        rt.heap().store_field(holder, 0, referent.addr());
        let _hold = rt.vm_refs().add_global(holder.addr()).unwrap();
        let fin = rt
            .allocate_reference(ClassKind::FinalizerReference, referent.addr())
            .unwrap();
        let hfin = rt.vm_refs().add_global(fin.addr()).unwrap();

        // Cycle 1: the referent is strongly held through the holder, so
        // the delayed reference is dropped undelivered. No queue may hold
        // it once the cycle ends.
        MarkSweep::new(&rt).run(GcCause::Explicit, false);
        assert_eq!(
            rt.reference_processor().pending_counts(rt.heap()),
            (0, 0, 0, 0)
        );
        assert!(rt.take_cleared_references().is_empty());

        // Cycle 2: the reference itself dies while its referent lives on.
        rt.vm_refs().del_global(hfin);
        MarkSweep::new(&rt).run(GcCause::Explicit, false);
        assert!(!is_live(&rt, fin));

        // Cycle 3: nothing stale left behind from the swept reference.
        MarkSweep::new(&rt).run(GcCause::Explicit, false);
        assert!(is_live(&rt, referent));
        assert_eq!(
            rt.reference_processor().pending_counts(rt.heap()),
            (0, 0, 0, 0)
        );
    }

    #[test]
    fn boot_classes_never_enter_the_mark_stack() {
        let rt = runtime(false);
        let a = rt.allocate_ordinary(1).unwrap();
        let b = rt.allocate_ordinary(0).unwrap();
        rt.heap().store_field(a, 0, b.addr());
        let _root = rt.vm_refs().add_global(a.addr()).unwrap();

        let ms = MarkSweep::new(&rt);
        ms.run(GcCause::Explicit, false);

        // Every scanned object names its boot-space class, yet only the
        // two main-space objects ever hit the worklist.
        assert_eq!(ms.mark_stack().total_pushes(), 2);
    }

    #[test]
    fn second_cycle_after_sweep_is_consistent() {
        let rt = runtime(false);
        let keep = rt.allocate_ordinary(0).unwrap();
        let _root = rt.vm_refs().add_global(keep.addr()).unwrap();
        for _ in 0..10 {
            rt.allocate_ordinary(2).unwrap();
        }

        MarkSweep::new(&rt).run(GcCause::Explicit, false);
        let free_after_first = rt.heap().main_space().free_words();
        MarkSweep::new(&rt).run(GcCause::Explicit, false);

        assert!(is_live(&rt, keep));
        assert_eq!(rt.heap().main_space().free_words(), free_after_first);
    }
}
