use parking_lot::Mutex;

use crate::{Address, Heap, ObjectRef, PENDING_NEXT_FIELD};

/// Unbounded queue of reference objects, threaded through each object's
/// pending-next field as a circular singly linked list. The tail is the
/// only stored pointer; the head is the tail's pending-next. A reference
/// with a zero pending-next is not on any queue, so enqueueing is
/// naturally idempotent.
#[derive(Debug, Default)]
pub struct ReferenceQueue {
    tail: Mutex<Address>,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unless the reference is already on some queue. Returns
    /// whether this call enqueued it.
    pub fn enqueue_if_not_enqueued(&self, heap: &Heap, reference: ObjectRef) -> bool {
        let mut tail = self.tail.lock();
        if !heap.load_field(reference, PENDING_NEXT_FIELD).is_null() {
            return false;
        }
        if tail.is_null() {
            // Single element: points at itself.
            heap.store_field(reference, PENDING_NEXT_FIELD, reference.addr());
        } else {
            let old_tail = ObjectRef::new(*tail).unwrap();
            let head = heap.load_field(old_tail, PENDING_NEXT_FIELD);
            heap.store_field(reference, PENDING_NEXT_FIELD, head);
            heap.store_field(old_tail, PENDING_NEXT_FIELD, reference.addr());
        }
        *tail = reference.addr();
        true
    }

    /// Pop the head, clearing its pending-next so it can be re-enqueued.
    pub fn dequeue(&self, heap: &Heap) -> Option<ObjectRef> {
        let mut tail = self.tail.lock();
        let tail_ref = ObjectRef::new(*tail)?;
        let head = ObjectRef::new(heap.load_field(tail_ref, PENDING_NEXT_FIELD))
            .expect("corrupt reference queue link");
        if head == tail_ref {
            *tail = Address::NULL;
        } else {
            let next = heap.load_field(head, PENDING_NEXT_FIELD);
            heap.store_field(tail_ref, PENDING_NEXT_FIELD, next);
        }
        heap.store_field(head, PENDING_NEXT_FIELD, Address::NULL);
        Some(head)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.lock().is_null()
    }

    pub fn len(&self, heap: &Heap) -> usize {
        let tail = self.tail.lock();
        let Some(tail_ref) = ObjectRef::new(*tail) else {
            return 0;
        };
        let mut count = 1;
        let mut cursor = heap.load_field(tail_ref, PENDING_NEXT_FIELD);
        while cursor != tail_ref.addr() {
            count += 1;
            let obj = ObjectRef::new(cursor).expect("corrupt reference queue link");
            cursor = heap.load_field(obj, PENDING_NEXT_FIELD);
        }
        count
    }
}
