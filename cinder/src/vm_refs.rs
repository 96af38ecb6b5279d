use parking_lot::{Condvar, Mutex};

use crate::{
    Address, FIRST_SEGMENT, GcError, GcOptions, Heap, IndirectRef, IndirectRefKind,
    IndirectReferenceTable, RootInfo, RootKind, RootVisitor,
};

/// Process-wide JNI-style global and weak-global reference tables.
///
/// Both tables live behind their own locks, never the mutator lock, so
/// creating or deleting a global reference never contends with the
/// GC-suspension machinery. Weak-global decoding additionally gates on a
/// condvar: a concurrent collector disables weak access while it decides
/// which referents die, and mutators block here instead of observing a
/// half-cleared referent.
#[derive(Debug)]
pub struct VmRefs {
    globals: Mutex<IndirectReferenceTable>,
    weak_globals: Mutex<IndirectReferenceTable>,
    weak_access_enabled: Mutex<bool>,
    weak_access_cond: Condvar,
}

impl VmRefs {
    pub fn new(options: &GcOptions) -> Self {
        let capacity = options.global_ref_capacity;
        Self {
            globals: Mutex::new(IndirectReferenceTable::new(
                IndirectRefKind::Global,
                capacity,
                true,
                options.strict_jni,
            )),
            weak_globals: Mutex::new(IndirectReferenceTable::new(
                IndirectRefKind::WeakGlobal,
                capacity,
                true,
                options.strict_jni,
            )),
            weak_access_enabled: Mutex::new(true),
            weak_access_cond: Condvar::new(),
        }
    }

    pub fn add_global(&self, obj: Address) -> Result<IndirectRef, GcError> {
        self.globals.lock().add(FIRST_SEGMENT, obj)
    }

    pub fn del_global(&self, iref: IndirectRef) -> bool {
        self.globals.lock().remove(FIRST_SEGMENT, iref)
    }

    pub fn decode_global(&self, heap: &Heap, iref: IndirectRef) -> Address {
        self.globals.lock().get(heap, iref)
    }

    pub fn add_weak_global(&self, obj: Address) -> Result<IndirectRef, GcError> {
        self.weak_globals.lock().add(FIRST_SEGMENT, obj)
    }

    pub fn del_weak_global(&self, iref: IndirectRef) -> bool {
        self.weak_globals.lock().remove(FIRST_SEGMENT, iref)
    }

    /// Blocks while weak access is disabled by an in-flight collection.
    pub fn decode_weak_global(&self, heap: &Heap, iref: IndirectRef) -> Address {
        {
            let mut enabled = self.weak_access_enabled.lock();
            while !*enabled {
                self.weak_access_cond.wait(&mut enabled);
            }
        }
        self.weak_globals.lock().get(heap, iref)
    }

    pub fn disable_weak_access(&self) {
        *self.weak_access_enabled.lock() = false;
    }

    pub fn enable_weak_access(&self) {
        let mut enabled = self.weak_access_enabled.lock();
        *enabled = true;
        self.weak_access_cond.notify_all();
    }

    /// Collector hook: purge dead weak globals, update moved ones.
    pub fn sweep_jni_weak_globals(&self, is_marked: &mut dyn FnMut(Address) -> Option<Address>) {
        self.weak_globals.lock().sweep(is_marked);
    }

    /// Only the strong globals are roots; weak globals are swept instead.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        self.globals
            .lock()
            .visit_roots(visitor, RootInfo::global(RootKind::JniGlobal));
    }

    pub fn global_count(&self) -> usize {
        self.globals.lock().n_entries()
    }

    pub fn weak_global_count(&self) -> usize {
        self.weak_globals.lock().n_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use std::time::{Duration, Instant};

    fn small_heap() -> Heap {
        Heap::new(&GcOptions {
            heap_words: 4096,
            boot_words: 256,
            main_words: 2048,
            region_words: 256,
            ..Default::default()
        })
    }

    fn addr(raw: usize) -> Address {
        Address::new(raw)
    }

    #[test]
    fn global_round_trip_and_delete() {
        let heap = small_heap();
        let refs = VmRefs::new(&GcOptions::default());
        let h = refs.add_global(addr(0x100)).unwrap();
        assert_eq!(refs.decode_global(&heap, h), addr(0x100));
        assert_eq!(refs.global_count(), 1);
        assert!(refs.del_global(h));
        assert_eq!(refs.global_count(), 0);
        assert_eq!(refs.decode_global(&heap, h), Address::INVALID);
    }

    #[test]
    fn weak_global_sweep_clears_dead() {
        let heap = small_heap();
        let refs = VmRefs::new(&GcOptions::default());
        let dead = refs.add_weak_global(addr(0x100)).unwrap();
        let live = refs.add_weak_global(addr(0x200)).unwrap();

        refs.sweep_jni_weak_globals(&mut |a| (a == addr(0x200)).then_some(addr(0x200)));

        assert_eq!(refs.decode_weak_global(&heap, dead), Address::NULL);
        assert_eq!(refs.decode_weak_global(&heap, live), addr(0x200));
    }

    #[test]
    fn weak_decode_blocks_while_access_is_disabled() {
        let heap = Arc::new(small_heap());
        let refs = Arc::new(VmRefs::new(&GcOptions::default()));
        let h = refs.add_weak_global(addr(0x100)).unwrap();

        refs.disable_weak_access();

        let decoded = Arc::new(AtomicBool::new(false));
        let decoded2 = decoded.clone();
        let refs2 = refs.clone();
        let heap2 = heap.clone();
        let t = std::thread::spawn(move || {
            let got = refs2.decode_weak_global(&heap2, h);
            decoded2.store(true, Ordering::SeqCst);
            assert_eq!(got, addr(0x100));
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(
            !decoded.load(Ordering::SeqCst),
            "decode must block while weak access is disabled"
        );

        refs.enable_weak_access();

        let start = Instant::now();
        while !decoded.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(decoded.load(Ordering::SeqCst), "decode did not resume");
        t.join().unwrap();
    }
}
