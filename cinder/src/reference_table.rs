use parking_lot::Mutex;

use crate::{Address, GcRoot, Heap, RootInfo, RootKind, RootVisitor};

/// Bounded registry of strong references with a name for diagnostics.
/// The runtime uses one for monitor-style bookkeeping; overflowing the
/// cap indicates a reference leak and is fatal.
#[derive(Debug)]
pub struct ReferenceTable {
    name: &'static str,
    max_size: usize,
    entries: Mutex<Vec<GcRoot>>,
}

impl ReferenceTable {
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            max_size,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, obj: Address) {
        assert!(!obj.is_null(), "null reference added to {}", self.name);
        let mut entries = self.entries.lock();
        if entries.len() == self.max_size {
            panic!(
                "{} reference table overflow (max {})",
                self.name, self.max_size
            );
        }
        entries.push(GcRoot::new(obj));
    }

    /// Remove the most recent matching entry; false if absent.
    pub fn remove(&self, obj: Address) -> bool {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().rposition(|r| r.load() == obj) {
            entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let entries = self.entries.lock();
        for root in entries.iter() {
            visitor.visit_root(root, RootInfo::global(RootKind::ReferenceTable));
        }
    }

    pub fn dump(&self, heap: &Heap) -> String {
        let entries = self.entries.lock();
        let mut out = format!("{} reference table ({} entries):\n", self.name, entries.len());
        for root in entries.iter() {
            let addr = root.load();
            let fields = heap
                .object_at(addr)
                .map(|obj| heap.num_fields(obj))
                .unwrap_or(0);
            out.push_str(&format!("  {addr:?} ({fields} fields)\n"));
        }
        out
    }
}
