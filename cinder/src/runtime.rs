use parking_lot::Mutex;

use crate::{
    Address, ClassKind, CollectorType, FIELDS_OFFSET, GcError, GcOptions, GcRoot, Heap,
    InternTable, MutatorLock, ObjectRef, REFERENT_FIELD, ReferenceProcessor, ReferenceTable,
    RootInfo, RootKind, RootVisitor, ThreadList, VmRefs,
    collector::{ConcurrentCopying, GcCause, GcStats, MarkCompact, MarkSweep},
    object_words,
};

/// The well-known class objects, bootstrapped into the boot space before
/// any mutator runs. Classes never move and are immune every cycle.
#[derive(Debug)]
struct WellKnownClasses {
    class: Address,
    ordinary: Address,
    weak: Address,
    soft: Address,
    finalizer: Address,
    phantom: Address,
}

/// Top-level runtime: owns the heap, the thread registry and every root
/// source, and drives collections. The allocation path escalates through
/// progressively more desperate cycles before reporting out-of-memory.
#[derive(Debug)]
pub struct Runtime {
    options: GcOptions,
    heap: Heap,
    threads: ThreadList,
    intern: InternTable,
    vm_refs: VmRefs,
    monitors: ReferenceTable,
    refproc: ReferenceProcessor,
    classes: Mutex<Vec<GcRoot>>,
    cleared: Mutex<Vec<GcRoot>>,
    well_known: WellKnownClasses,
    mutator_lock: MutatorLock,
    gc_lock: Mutex<()>,
}

impl Runtime {
    pub fn new(options: GcOptions) -> Self {
        let heap = Heap::new(&options);
        let well_known = Self::bootstrap_classes(&heap);
        let classes = vec![
            GcRoot::new(well_known.class),
            GcRoot::new(well_known.ordinary),
            GcRoot::new(well_known.weak),
            GcRoot::new(well_known.soft),
            GcRoot::new(well_known.finalizer),
            GcRoot::new(well_known.phantom),
        ];
        Self {
            threads: ThreadList::new(&options),
            intern: InternTable::new(),
            vm_refs: VmRefs::new(&options),
            monitors: ReferenceTable::new("monitor", 4096),
            refproc: ReferenceProcessor::new(),
            classes: Mutex::new(classes),
            cleared: Mutex::new(Vec::new()),
            well_known,
            mutator_lock: MutatorLock::new(),
            gc_lock: Mutex::new(()),
            heap,
            options,
        }
    }

    /// Classes are objects too; the class of a class is the class class,
    /// which is its own class. Each carries its kind discriminant in its
    /// single field.
    fn bootstrap_classes(heap: &Heap) -> WellKnownClasses {
        let alloc_class = |class_of: Address, kind: ClassKind| {
            let addr = heap
                .allocate_boot_raw(object_words(1))
                .unwrap_or_else(|| panic!("VM out of memory: boot space too small"));
            heap.init_object(addr, class_of, 1);
            heap.store_word(addr.offset(FIELDS_OFFSET), kind.as_word());
            addr
        };

        let class = heap
            .allocate_boot_raw(object_words(1))
            .unwrap_or_else(|| panic!("VM out of memory: boot space too small"));
        heap.init_object(class, class, 1);
        heap.store_word(class.offset(FIELDS_OFFSET), ClassKind::Class.as_word());

        WellKnownClasses {
            class,
            ordinary: alloc_class(class, ClassKind::Ordinary),
            weak: alloc_class(class, ClassKind::WeakReference),
            soft: alloc_class(class, ClassKind::SoftReference),
            finalizer: alloc_class(class, ClassKind::FinalizerReference),
            phantom: alloc_class(class, ClassKind::PhantomReference),
        }
    }

    pub fn options(&self) -> &GcOptions {
        &self.options
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    pub fn intern_table(&self) -> &InternTable {
        &self.intern
    }

    pub fn vm_refs(&self) -> &VmRefs {
        &self.vm_refs
    }

    pub fn monitor_table(&self) -> &ReferenceTable {
        &self.monitors
    }

    pub fn reference_processor(&self) -> &ReferenceProcessor {
        &self.refproc
    }

    pub fn class_for(&self, kind: ClassKind) -> Address {
        match kind {
            ClassKind::Class => self.well_known.class,
            ClassKind::Ordinary => self.well_known.ordinary,
            ClassKind::WeakReference => self.well_known.weak,
            ClassKind::SoftReference => self.well_known.soft,
            ClassKind::FinalizerReference => self.well_known.finalizer,
            ClassKind::PhantomReference => self.well_known.phantom,
        }
    }

    // ---- allocation -----------------------------------------------------

    pub fn allocate_ordinary(&self, num_fields: usize) -> Result<ObjectRef, GcError> {
        self.allocate_with_class(self.well_known.ordinary, num_fields)
    }

    /// Allocate a reference-family object with its referent installed.
    pub fn allocate_reference(
        &self,
        kind: ClassKind,
        referent: Address,
    ) -> Result<ObjectRef, GcError> {
        assert!(kind.is_reference(), "{kind:?} is not a reference class");
        let obj = self.allocate_with_class(self.class_for(kind), 2)?;
        if !referent.is_null() {
            self.heap.store_field(obj, REFERENT_FIELD, referent);
        }
        Ok(obj)
    }

    /// One allocation attempt under shared mutator access.
    fn try_allocate(&self, class: Address, num_fields: usize) -> Option<ObjectRef> {
        let _shared = self.mutator_lock.shared();
        let addr = self.heap.allocate_raw(object_words(num_fields))?;
        self.heap.init_object(addr, class, num_fields);
        Some(self.heap.object_at(addr).expect("fresh allocation unreadable"))
    }

    /// Allocation with the standard escalation ladder: plain attempt, then
    /// a collection, then a soft-clearing collection, then (for the
    /// free-list collectors) a compacting cycle, then out-of-memory.
    pub fn allocate_with_class(
        &self,
        class: Address,
        num_fields: usize,
    ) -> Result<ObjectRef, GcError> {
        let words = object_words(num_fields);

        if let Some(obj) = self.try_allocate(class, num_fields) {
            return Ok(obj);
        }

        log::debug!("allocation of {words} words failed, collecting");
        self.collect_garbage(GcCause::ForAlloc, false);
        if let Some(obj) = self.try_allocate(class, num_fields) {
            return Ok(obj);
        }

        log::debug!("allocation still failing, collecting with soft references cleared");
        self.collect_garbage(GcCause::ForAlloc, true);
        if let Some(obj) = self.try_allocate(class, num_fields) {
            return Ok(obj);
        }

        if self.options.collector == CollectorType::MarkSweep {
            log::warn!("escalating to a compacting cycle for {words} words");
            {
                let _guard = self.gc_lock.lock();
                MarkCompact::new(self).run(GcCause::Escalation, true);
            }
            if let Some(obj) = self.try_allocate(class, num_fields) {
                return Ok(obj);
            }
        }

        log::error!("out of memory allocating {words} words");
        Err(GcError::OutOfMemory {
            requested_words: words,
        })
    }

    // ---- collection -----------------------------------------------------

    pub fn collect(&self) -> GcStats {
        self.collect_garbage(GcCause::Explicit, false)
    }

    pub fn collect_garbage(&self, cause: GcCause, clear_soft: bool) -> GcStats {
        let _guard = self.gc_lock.lock();
        let stats = match self.options.collector {
            CollectorType::MarkSweep => MarkSweep::new(self).run(cause, clear_soft),
            CollectorType::MarkCompact => MarkCompact::new(self).run(cause, clear_soft),
            CollectorType::ConcurrentCopying => {
                ConcurrentCopying::new(self).run(cause, clear_soft)
            }
        };
        self.heap.update_target_footprint();
        stats
    }

    /// Stop the world for `f`: attached mutators park at their next
    /// checkpoint and unattached embedder threads are excluded by the
    /// mutator lock. Acquired in that order; allocation takes the shared
    /// side only while no collection can start.
    pub fn run_paused<R>(&self, f: impl FnOnce() -> R) -> R {
        let _exclusive = self.mutator_lock.exclusive();
        self.threads.run_suspended(f)
    }

    // ---- roots ----------------------------------------------------------

    /// Visit every strong root, in a fixed order: thread stacks and JNI
    /// locals, JNI globals, strong interns, classes, monitors, then the
    /// cleared references awaiting delivery.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        self.threads.visit_thread_roots(visitor);
        self.vm_refs.visit_roots(visitor);
        self.intern.visit_roots(visitor);
        for root in self.classes.lock().iter() {
            visitor.visit_root(root, RootInfo::global(RootKind::ClassTable));
        }
        self.monitors.visit_roots(visitor);
        for root in self.cleared.lock().iter() {
            visitor.visit_root(root, RootInfo::global(RootKind::ReferenceTable));
        }
    }

    // ---- cleared-reference delivery -------------------------------------

    /// Collector hook: park cleared references for delivery after the
    /// cycle. They stay roots until the embedder takes them.
    pub fn stash_cleared_references(&self, refs: Vec<ObjectRef>) {
        let mut cleared = self.cleared.lock();
        cleared.extend(refs.into_iter().map(|obj| GcRoot::new(obj.addr())));
    }

    pub fn take_cleared_references(&self) -> Vec<ObjectRef> {
        let cleared = std::mem::take(&mut *self.cleared.lock());
        cleared
            .iter()
            .filter_map(|root| ObjectRef::new(root.load()))
            .collect()
    }

    pub fn get_referent(&self, reference: ObjectRef) -> Address {
        self.refproc.get_referent(&self.heap, reference)
    }
}
