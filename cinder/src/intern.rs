use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{Address, GcRoot, RootInfo, RootKind, RootVisitor};

/// Caller-supplied 64-bit symbol hash identifying an interned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternId(pub u64);

#[derive(Debug, Default)]
struct InternSets {
    strong: HashMap<InternId, GcRoot, ahash::RandomState>,
    weak: HashMap<InternId, GcRoot, ahash::RandomState>,
}

/// Registry of interned objects. Strong interns are roots; weak interns
/// survive only while something else keeps the object alive, and the
/// collector purges dead ones via `sweep_weaks` after marking settles.
#[derive(Debug, Default)]
pub struct InternTable {
    inner: Mutex<InternSets>,
}

impl InternTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern strongly; promotes an existing weak intern in place.
    pub fn intern_strong(&self, id: InternId, obj: Address) -> Address {
        debug_assert!(!obj.is_null());
        let mut sets = self.inner.lock();
        if let Some(existing) = sets.strong.get(&id) {
            return existing.load();
        }
        if let Some(weak) = sets.weak.remove(&id) {
            let addr = weak.load();
            sets.strong.insert(id, weak);
            return addr;
        }
        sets.strong.insert(id, GcRoot::new(obj));
        obj
    }

    pub fn intern_weak(&self, id: InternId, obj: Address) -> Address {
        debug_assert!(!obj.is_null());
        let mut sets = self.inner.lock();
        if let Some(existing) = sets.strong.get(&id) {
            return existing.load();
        }
        if let Some(existing) = sets.weak.get(&id) {
            return existing.load();
        }
        sets.weak.insert(id, GcRoot::new(obj));
        obj
    }

    pub fn lookup(&self, id: InternId) -> Option<Address> {
        let sets = self.inner.lock();
        sets.strong
            .get(&id)
            .or_else(|| sets.weak.get(&id))
            .map(GcRoot::load)
    }

    /// Strong interns are roots; weak interns deliberately are not.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let sets = self.inner.lock();
        for root in sets.strong.values() {
            visitor.visit_root(root, RootInfo::global(RootKind::InternTable));
        }
    }

    /// Purge weak interns whose referent died this cycle; update the ones
    /// whose referent moved.
    pub fn sweep_weaks(&self, is_marked: &mut dyn FnMut(Address) -> Option<Address>) {
        let mut sets = self.inner.lock();
        sets.weak.retain(|_, root| {
            let addr = root.load();
            match is_marked(addr) {
                Some(new_addr) => {
                    root.store(new_addr);
                    true
                }
                None => false,
            }
        });
    }

    pub fn strong_count(&self) -> usize {
        self.inner.lock().strong.len()
    }

    pub fn weak_count(&self) -> usize {
        self.inner.lock().weak.len()
    }
}
