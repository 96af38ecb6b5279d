use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Address;

/// A root slot: one location outside normal field storage whose referent
/// must be treated as reachable. The collector only visits the slot and
/// may rewrite it during relocation; the owner (thread stack, handle
/// table, intern table) controls its lifetime.
#[derive(Debug, Default)]
pub struct GcRoot {
    slot: AtomicUsize,
}

impl GcRoot {
    pub fn new(addr: Address) -> Self {
        Self {
            slot: AtomicUsize::new(addr.raw()),
        }
    }

    pub fn null() -> Self {
        Self::new(Address::NULL)
    }

    #[inline]
    pub fn load(&self) -> Address {
        Address::new(self.slot.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, addr: Address) {
        self.slot.store(addr.raw(), Ordering::Release);
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.load().is_null()
    }
}

impl Clone for GcRoot {
    fn clone(&self) -> Self {
        GcRoot::new(self.load())
    }
}

/// Where a root came from; diagnostics and per-source policy hang off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    ThreadStack,
    JniLocal,
    JniGlobal,
    JniWeakGlobal,
    InternTable,
    ClassTable,
    ReferenceTable,
}

#[derive(Debug, Clone, Copy)]
pub struct RootInfo {
    pub kind: RootKind,
    /// Owning thread for per-thread sources, None for process-wide tables.
    pub thread_id: Option<u64>,
}

impl RootInfo {
    pub fn global(kind: RootKind) -> Self {
        Self {
            kind,
            thread_id: None,
        }
    }

    pub fn thread(kind: RootKind, thread_id: u64) -> Self {
        Self {
            kind,
            thread_id: Some(thread_id),
        }
    }
}

/// Root enumeration callback. Implementors may rewrite the slot through
/// `GcRoot::store` (relocating collectors do exactly that).
pub trait RootVisitor {
    fn visit_root(&mut self, root: &GcRoot, info: RootInfo);
}

impl<F: FnMut(&GcRoot, RootInfo)> RootVisitor for F {
    fn visit_root(&mut self, root: &GcRoot, info: RootInfo) {
        self(root, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_store_and_load() {
        let root = GcRoot::null();
        assert!(root.is_null());
        root.store(Address::new(0x40));
        assert_eq!(root.load(), Address::new(0x40));
        let copy = root.clone();
        assert_eq!(copy.load(), Address::new(0x40));
    }

    #[test]
    fn closures_are_visitors() {
        let root = GcRoot::new(Address::new(8));
        let mut seen = Vec::new();
        let mut visitor = |r: &GcRoot, info: RootInfo| {
            seen.push((r.load(), info.kind));
        };
        visitor.visit_root(&root, RootInfo::global(RootKind::ClassTable));
        assert_eq!(seen, vec![(Address::new(8), RootKind::ClassTable)]);
    }

    #[test]
    fn visitor_may_rewrite_roots_in_place() {
        let root = GcRoot::new(Address::new(8));
        let mut fixup = |r: &GcRoot, _info: RootInfo| {
            if r.load() == Address::new(8) {
                r.store(Address::new(24));
            }
        };
        fixup.visit_root(&root, RootInfo::global(RootKind::ThreadStack));
        assert_eq!(root.load(), Address::new(24));
    }
}
