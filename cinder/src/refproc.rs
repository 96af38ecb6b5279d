use parking_lot::{Condvar, Mutex};

use crate::{Address, ClassKind, Heap, ObjectRef, REFERENT_FIELD, ReferenceQueue};

/// Decides the fate of soft, weak, finalizer and phantom references once
/// marking has settled. The collector parks references with a live
/// reference-type class on the per-kind queues during the trace; after the
/// trace this processor clears the ones whose referent died, resurrects
/// finalizer referents, and hands the cleared batch back for delivery
/// outside the pause.
///
/// While the processor is deciding, mutator referent reads block on the
/// preserving condvar so they never observe a referent that is about to be
/// cleared.
#[derive(Debug, Default)]
pub struct ReferenceProcessor {
    preserving: Mutex<bool>,
    condition: Condvar,
    soft: ReferenceQueue,
    weak: ReferenceQueue,
    finalizer: ReferenceQueue,
    phantom: ReferenceQueue,
    cleared: ReferenceQueue,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector hook: park a reference whose referent was not yet marked
    /// when the trace reached it. Idempotent per reference.
    pub fn delay_reference(&self, heap: &Heap, kind: ClassKind, reference: ObjectRef) {
        let queue = match kind {
            ClassKind::SoftReference => &self.soft,
            ClassKind::WeakReference => &self.weak,
            ClassKind::FinalizerReference => &self.finalizer,
            ClassKind::PhantomReference => &self.phantom,
            ClassKind::Ordinary | ClassKind::Class => {
                panic!("delayed a non-reference object {:?}", reference.addr())
            }
        };
        queue.enqueue_if_not_enqueued(heap, reference);
    }

    /// Mutator path for `Reference.get()`. Blocks while the processor is
    /// mid-decision, then reads the referent through the read barrier.
    pub fn get_referent(&self, heap: &Heap, reference: ObjectRef) -> Address {
        {
            let mut preserving = self.preserving.lock();
            while *preserving {
                self.condition.wait(&mut preserving);
            }
        }
        heap.read_barrier_address(heap.load_field(reference, REFERENT_FIELD))
    }

    fn start_preserving_references(&self) {
        *self.preserving.lock() = true;
    }

    fn stop_preserving_references(&self) {
        let mut preserving = self.preserving.lock();
        *preserving = false;
        self.condition.notify_all();
    }

    /// Keep every delayed soft referent alive. Used when the cycle is not
    /// under memory pressure, so softly reachable objects survive.
    fn forward_soft_references(&self, heap: &Heap, mark_alive: &mut dyn FnMut(Address) -> Address) {
        let mut requeue = Vec::new();
        while let Some(reference) = self.soft.dequeue(heap) {
            let referent = heap.load_field(reference, REFERENT_FIELD);
            if !referent.is_null() {
                let forwarded = mark_alive(referent);
                heap.store_field(reference, REFERENT_FIELD, forwarded);
            }
            requeue.push(reference);
        }
        for reference in requeue {
            self.soft.enqueue_if_not_enqueued(heap, reference);
        }
    }

    /// Clear the referent of every queued reference whose referent stayed
    /// white; move cleared references to the cleared queue. Live referents
    /// get their slot updated in case the referent moved.
    fn clear_white_references(
        &self,
        heap: &Heap,
        queue: &ReferenceQueue,
        is_marked: &mut dyn FnMut(Address) -> Option<Address>,
    ) {
        while let Some(reference) = queue.dequeue(heap) {
            let referent = heap.load_field(reference, REFERENT_FIELD);
            if referent.is_null() {
                continue;
            }
            match is_marked(referent) {
                Some(forwarded) => {
                    heap.store_field(reference, REFERENT_FIELD, forwarded);
                }
                None => {
                    heap.store_field(reference, REFERENT_FIELD, Address::NULL);
                    self.cleared.enqueue_if_not_enqueued(heap, reference);
                }
            }
        }
    }

    /// Finalizer references resurrect their referent: the referent is
    /// marked alive again so the finalizer can run against it, and the
    /// reference itself is queued for delivery. The referent slot keeps
    /// pointing at the (possibly moved) object.
    ///
    /// References whose referent is still marked leave the queue like any
    /// other; the next cycle's trace re-delays them if the referent is
    /// white by then. Nothing may stay linked across cycles: the queue
    /// tails are raw addresses, not roots, so a leftover entry would go
    /// stale the moment its object is swept or moved.
    fn enqueue_finalizer_references(
        &self,
        heap: &Heap,
        is_marked: &mut dyn FnMut(Address) -> Option<Address>,
        mark_alive: &mut dyn FnMut(Address) -> Address,
    ) {
        while let Some(reference) = self.finalizer.dequeue(heap) {
            let referent = heap.load_field(reference, REFERENT_FIELD);
            if referent.is_null() {
                continue;
            }
            match is_marked(referent) {
                Some(forwarded) => {
                    heap.store_field(reference, REFERENT_FIELD, forwarded);
                }
                None => {
                    let resurrected = mark_alive(referent);
                    heap.store_field(reference, REFERENT_FIELD, resurrected);
                    self.cleared.enqueue_if_not_enqueued(heap, reference);
                }
            }
        }
    }

    /// Full post-marking pass. `is_marked` reports liveness (and the new
    /// address if the object moved); `mark_alive` revives an object,
    /// returning its final address, and must leave the mark transitively
    /// complete before this returns.
    pub fn process_references(
        &self,
        heap: &Heap,
        clear_soft: bool,
        is_marked: &mut dyn FnMut(Address) -> Option<Address>,
        mark_alive: &mut dyn FnMut(Address) -> Address,
    ) {
        self.start_preserving_references();
        if !clear_soft {
            self.forward_soft_references(heap, mark_alive);
        }
        self.clear_white_references(heap, &self.soft, is_marked);
        self.clear_white_references(heap, &self.weak, is_marked);
        self.enqueue_finalizer_references(heap, is_marked, mark_alive);
        self.clear_white_references(heap, &self.phantom, is_marked);
        self.stop_preserving_references();
    }

    /// Drain the cleared batch for delivery outside the GC pause.
    pub fn enqueue_cleared_references(&self, heap: &Heap) -> Vec<ObjectRef> {
        let mut cleared = Vec::new();
        while let Some(reference) = self.cleared.dequeue(heap) {
            cleared.push(reference);
        }
        cleared
    }

    pub fn pending_counts(&self, heap: &Heap) -> (usize, usize, usize, usize) {
        (
            self.soft.len(heap),
            self.weak.len(heap),
            self.finalizer.len(heap),
            self.phantom.len(heap),
        )
    }
}
