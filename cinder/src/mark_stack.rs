use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::ObjectRef;

/// The gray worklist. Shared across the collecting thread and any parallel
/// mark workers, so pushes and pops go through a dedicated lock rather
/// than the mutator lock.
///
/// Overflowing the hard cap is fatal: marking soundness cannot be
/// guaranteed with a truncated stack.
#[derive(Debug)]
pub struct MarkStack {
    inner: Mutex<Vec<ObjectRef>>,
    capacity: usize,
    pushes: AtomicUsize,
}

impl MarkStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            capacity,
            pushes: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, obj: ObjectRef) {
        let mut stack = self.inner.lock();
        if stack.len() == self.capacity {
            panic!("mark stack overflow (capacity {})", self.capacity);
        }
        stack.push(obj);
        self.pushes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pop(&self) -> Option<ObjectRef> {
        self.inner.lock().pop()
    }

    /// Pop up to `n` entries at once; parallel workers use this to cut
    /// down on lock traffic.
    pub fn pop_chunk(&self, n: usize) -> Vec<ObjectRef> {
        let mut stack = self.inner.lock();
        let at = stack.len().saturating_sub(n);
        stack.split_off(at)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Total pushes since construction. Instrumentation for the
    /// immune-space short-circuit guarantee: an immune object must never
    /// contribute to this counter.
    pub fn total_pushes(&self) -> usize {
        self.pushes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    fn obj(raw: usize) -> ObjectRef {
        ObjectRef::new(Address::new(raw)).expect("non-null test address")
    }

    #[test]
    fn push_pop_and_counter() {
        let stack = MarkStack::new(8);
        stack.push(obj(16));
        stack.push(obj(32));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(obj(32)));
        assert_eq!(stack.pop(), Some(obj(16)));
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.total_pushes(), 2);
    }

    #[test]
    fn pop_chunk_takes_from_the_top() {
        let stack = MarkStack::new(16);
        for i in 1..=5 {
            stack.push(obj(i * 8));
        }
        let chunk = stack.pop_chunk(3);
        assert_eq!(chunk, vec![obj(24), obj(32), obj(40)]);
        assert_eq!(stack.len(), 2);
        let rest = stack.pop_chunk(10);
        assert_eq!(rest.len(), 2);
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "mark stack overflow")]
    fn overflow_is_fatal() {
        let stack = MarkStack::new(2);
        stack.push(obj(8));
        stack.push(obj(16));
        stack.push(obj(24));
    }
}
