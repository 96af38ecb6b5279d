use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    Address, FreeBlock, Heap, HeapBitmap, MarkStack, ObjectRef, PENDING_NEXT_FIELD, REFERENT_FIELD,
    Runtime, SenseBarrier,
};

mod concurrent_copying;
mod mark_compact;
mod mark_sweep;

pub use concurrent_copying::ConcurrentCopying;
pub use mark_compact::MarkCompact;
pub use mark_sweep::MarkSweep;

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// An allocation could not be satisfied.
    ForAlloc,
    /// Explicit request by the embedder.
    Explicit,
    /// Escalation to a compacting cycle after a regular cycle failed to
    /// free enough.
    Escalation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    MarkSweep,
    MarkCompact,
    ConcurrentCopying,
}

/// Per-cycle outcome, logged and returned to the caller.
#[derive(Debug, Clone)]
pub struct GcStats {
    pub kind: CollectorKind,
    pub cause: GcCause,
    pub duration: Duration,
    pub objects_marked: usize,
    pub words_reclaimed: usize,
    pub objects_moved: usize,
    pub references_cleared: usize,
}

/// Tracing core shared by the non-moving collectors: tri-color via the
/// aggregate heap bitmap (the main space's mark bitmap registers at
/// construction), gray worklist on the mark stack, immune ranges
/// short-circuited before any bitmap or stack traffic.
pub(crate) struct Marker<'r> {
    rt: &'r Runtime,
    stack: &'r MarkStack,
    bitmap: HeapBitmap<'r>,
    marked: AtomicUsize,
}

impl<'r> Marker<'r> {
    pub(crate) fn new(rt: &'r Runtime, stack: &'r MarkStack) -> Self {
        let main = rt.heap().main_space();
        let mut bitmap = HeapBitmap::new();
        bitmap.add(main.begin(), main.end(), &main.mark);
        Self {
            rt,
            stack,
            bitmap,
            marked: AtomicUsize::new(0),
        }
    }

    pub(crate) fn objects_marked(&self) -> usize {
        self.marked.load(Ordering::Acquire)
    }

    pub(crate) fn is_marked(&self, addr: Address) -> bool {
        let heap = self.rt.heap();
        if !heap.contains(addr) {
            return true;
        }
        if heap.immune().lock().contains(addr) {
            return true;
        }
        match self.bitmap.bitmap_for(addr) {
            Some(bitmap) => bitmap.is_marked(addr),
            // No registered bitmap (boot space): live by construction.
            None => true,
        }
    }

    /// Mark one object gray. Immune addresses return without touching the
    /// bitmap or the stack; the bitmap CAS picks a single winner when
    /// workers race.
    pub(crate) fn mark(&self, addr: Address) {
        let heap = self.rt.heap();
        if !heap.contains(addr) {
            return;
        }
        if heap.immune().lock().contains(addr) {
            return;
        }
        let Some(bitmap) = self.bitmap.bitmap_for(addr) else {
            return;
        };
        if bitmap.mark(addr) {
            self.marked.fetch_add(1, Ordering::AcqRel);
            if let Some(obj) = heap.object_at(addr) {
                self.stack.push(obj);
            }
        }
    }

    /// Blacken one object: mark everything it points at. Reference-type
    /// objects with a still-white referent are parked on the reference
    /// processor instead of having their referent marked.
    pub(crate) fn scan(&self, obj: ObjectRef) {
        let heap = self.rt.heap();
        self.mark(Address::new(heap.load_word(obj.addr())));

        let kind = heap.class_kind(obj);
        let first_field = if kind.is_reference() {
            let referent = heap.load_field(obj, REFERENT_FIELD);
            if referent.is_null() || self.is_marked(referent) {
                self.mark(referent);
            } else {
                self.rt.reference_processor().delay_reference(heap, kind, obj);
            }
            // The pending-next link is queue bookkeeping, not a strong edge.
            PENDING_NEXT_FIELD + 1
        } else {
            0
        };
        for i in first_field..heap.num_fields(obj) {
            self.mark(heap.load_field(obj, i));
        }
    }

    /// Drain the gray worklist on the calling thread.
    pub(crate) fn drain(&self) {
        while let Some(obj) = self.stack.pop() {
            self.scan(obj);
        }
    }

    /// Drain with `workers` threads. Workers grab chunks; an idle worker
    /// only quits once the stack is empty and nobody is mid-scan, since a
    /// busy peer may still publish more gray objects.
    pub(crate) fn drain_parallel(&self, workers: usize) {
        if workers <= 1 {
            self.drain();
            return;
        }
        let busy = AtomicUsize::new(0);
        let start = SenseBarrier::new();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    // Start together so no worker drains the whole stack
                    // before its peers are ready to steal chunks.
                    start.wait(workers);
                    loop {
                        busy.fetch_add(1, Ordering::AcqRel);
                        let chunk = self.stack.pop_chunk(16);
                        for obj in &chunk {
                            self.scan(*obj);
                        }
                        busy.fetch_sub(1, Ordering::AcqRel);
                        if chunk.is_empty() {
                            // Busy first, then the stack: once busy reads
                            // zero, every peer's pushes are visible, so an
                            // empty stack really is drained.
                            if busy.load(Ordering::Acquire) == 0 && self.stack.is_empty() {
                                return;
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });
    }
}

/// Sweep the main space against its mark bitmap: scrub the gaps between
/// survivors, rebuild the free list from them, then toggle the bitmaps.
/// Returns `(words_reclaimed, live_words)`.
pub(crate) fn sweep_main_space(heap: &Heap) -> (usize, usize) {
    let main = heap.main_space();
    let memory = heap.memory_region();

    let mut free = Vec::new();
    let mut live_words = 0usize;
    let mut cursor = main.begin();

    let mut survivors = Vec::new();
    main.live.walk_marked(|addr| {
        if main.mark.is_marked(addr) {
            survivors.push(addr);
        }
    });

    for addr in survivors {
        if addr > cursor {
            let gap = addr.raw() - cursor.raw();
            memory.scrub(cursor, gap);
            free.push(FreeBlock {
                begin: cursor,
                words: gap,
            });
        }
        let size = heap
            .object_at(addr)
            .map(|obj| heap.size_of(obj))
            .expect("marked address is not an object");
        live_words += size;
        cursor = addr.offset(size);
    }
    if cursor < main.end() {
        let gap = main.end().raw() - cursor.raw();
        memory.scrub(cursor, gap);
        free.push(FreeBlock {
            begin: cursor,
            words: gap,
        });
    }

    let reclaimed = main.size() - live_words;
    main.set_free_list(free);
    main.live.assign_from(&main.mark);
    main.mark.clear_all();
    heap.set_words_allocated(live_words);
    (reclaimed, live_words)
}
