use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    Address, BarrierState, BootSpace, CLASS_OFFSET, ClassKind, CollectorType, DirtyLineTable,
    FIELDS_OFFSET, GcOptions, HeapMemory, ImmuneSpaces, LEN_OFFSET, MARK_OFFSET, MONITOR_OFFSET,
    MainSpace, MarkWord, MemoryRegion, ObjectRef, RegionSpace, object_words,
};

/// The heap: one word arena carved into a boot space (classes, immune),
/// a free-list main space and a region space for the copying collector.
/// Every object access funnels through here so the barriers see every
/// reference load and store.
///
/// Layout: word 0 is reserved (null), then boot, main, regions.
#[derive(Debug)]
pub struct Heap {
    memory: Arc<HeapMemory>,
    whole: MemoryRegion,
    collector: CollectorType,
    boot: BootSpace,
    main: MainSpace,
    regions: RegionSpace,
    barrier: BarrierState,
    dirty: DirtyLineTable,
    immune: Mutex<ImmuneSpaces>,
    words_allocated: AtomicUsize,
    target_footprint: AtomicUsize,
    hash_seed: AtomicUsize,
}

impl Heap {
    pub fn new(options: &GcOptions) -> Self {
        let total = options.heap_words;
        assert!(
            1 + options.boot_words + options.main_words < total,
            "heap of {total} words cannot fit boot {} + main {}",
            options.boot_words,
            options.main_words
        );
        let memory = Arc::new(HeapMemory::new(total));
        let whole = MemoryRegion::new(memory.clone(), 0, total);

        let boot_begin = Address::new(1);
        let main_begin = boot_begin.offset(options.boot_words);
        let region_begin = main_begin.offset(options.main_words);
        let region_size = total - region_begin.raw();

        let boot = BootSpace::new(whole.subregion(boot_begin, options.boot_words));
        let main = MainSpace::new(whole.subregion(main_begin, options.main_words));
        let regions = RegionSpace::new(
            whole.subregion(region_begin, region_size),
            options.region_words,
        );

        Self {
            memory,
            whole,
            collector: options.collector,
            boot,
            main,
            regions,
            barrier: BarrierState::new(),
            dirty: DirtyLineTable::new(total, options.dirty_line_words),
            immune: Mutex::new(ImmuneSpaces::new()),
            words_allocated: AtomicUsize::new(0),
            target_footprint: AtomicUsize::new(options.main_words / 2),
            hash_seed: AtomicUsize::new(1),
        }
    }

    pub fn collector_type(&self) -> CollectorType {
        self.collector
    }

    pub fn boot(&self) -> &BootSpace {
        &self.boot
    }

    pub fn main_space(&self) -> &MainSpace {
        &self.main
    }

    pub fn region_space(&self) -> &RegionSpace {
        &self.regions
    }

    pub fn barrier(&self) -> &BarrierState {
        &self.barrier
    }

    pub fn dirty_lines(&self) -> &DirtyLineTable {
        &self.dirty
    }

    pub fn immune(&self) -> &Mutex<ImmuneSpaces> {
        &self.immune
    }

    /// The whole arena as one region; collectors use it for scrubbing and
    /// raw word copies.
    pub fn memory_region(&self) -> &MemoryRegion {
        &self.whole
    }

    pub fn total_words(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        !addr.is_null() && !addr.is_invalid() && addr.raw() < self.memory.len()
    }

    // ---- allocation -----------------------------------------------------

    /// Raw allocation in the mutator space for the configured collector.
    /// Objects too large for a copying region spill to the main space.
    pub fn allocate_raw(&self, words: usize) -> Option<Address> {
        let addr = match self.collector {
            CollectorType::MarkSweep | CollectorType::MarkCompact => self.main.alloc(words),
            CollectorType::ConcurrentCopying => {
                if words > self.regions.region_words() {
                    self.main.alloc(words)
                } else {
                    self.regions.alloc(words, false)
                }
            }
        }?;
        self.words_allocated.fetch_add(words, Ordering::AcqRel);
        Some(addr)
    }

    /// Boot-space allocation for class objects; these never move and are
    /// immune every cycle.
    pub fn allocate_boot_raw(&self, words: usize) -> Option<Address> {
        self.boot.alloc(words)
    }

    /// Stamp a fresh object header. The mark word starts white and the
    /// monitor word zero (no identity hash yet).
    pub fn init_object(&self, addr: Address, class: Address, num_fields: usize) {
        self.whole.store(addr.offset(CLASS_OFFSET), class.raw());
        self.whole.store(addr.offset(MONITOR_OFFSET), 0);
        self.whole
            .store(addr.offset(MARK_OFFSET), MarkWord::white().raw());
        self.whole.store(addr.offset(LEN_OFFSET), num_fields);
        for i in 0..num_fields {
            self.whole.store(addr.offset(FIELDS_OFFSET + i), 0);
        }
    }

    // ---- object access --------------------------------------------------

    /// A live object lives in some space and has a non-null class word.
    /// Scrubbed or never-allocated memory fails the class check.
    pub fn object_at(&self, addr: Address) -> Option<ObjectRef> {
        let obj = ObjectRef::new(addr)?;
        if !self.contains(addr) || addr.offset(LEN_OFFSET).raw() >= self.memory.len() {
            return None;
        }
        if self.whole.load(addr.offset(CLASS_OFFSET)) == 0 {
            return None;
        }
        Some(obj)
    }

    pub fn class_of(&self, obj: ObjectRef) -> Address {
        let raw = Address::new(self.whole.load(obj.addr().offset(CLASS_OFFSET)));
        self.read_barrier_address(raw)
    }

    pub fn set_class(&self, obj: ObjectRef, class: Address) {
        self.whole.store(obj.addr().offset(CLASS_OFFSET), class.raw());
    }

    /// The kind discriminant lives in the class object's first field as a
    /// raw word.
    pub fn class_kind(&self, obj: ObjectRef) -> ClassKind {
        let class = self.class_of(obj);
        debug_assert!(!class.is_null(), "object {:?} has no class", obj.addr());
        ClassKind::from_word(self.whole.load(class.offset(FIELDS_OFFSET)))
    }

    pub fn num_fields(&self, obj: ObjectRef) -> usize {
        self.whole.load(obj.addr().offset(LEN_OFFSET))
    }

    /// Total size of the object in words.
    pub fn size_of(&self, obj: ObjectRef) -> usize {
        object_words(self.num_fields(obj))
    }

    /// Reference field load. Both the object address and the loaded value
    /// heal through the read barrier, so a reference taken before an
    /// evacuation keeps reading the authoritative copy.
    pub fn load_field(&self, obj: ObjectRef, field: usize) -> Address {
        debug_assert!(field < self.num_fields(obj));
        let base = self.read_barrier_address(obj.addr());
        let raw = Address::new(self.whole.load(base.offset(FIELDS_OFFSET + field)));
        self.read_barrier_address(raw)
    }

    /// Reference field store, against the healed object address. During a
    /// concurrent mark the write dirties the object's line so the re-mark
    /// pause rescans it.
    pub fn store_field(&self, obj: ObjectRef, field: usize, value: Address) {
        debug_assert!(field < self.num_fields(obj));
        let base = self.read_barrier_address(obj.addr());
        self.whole
            .store(base.offset(FIELDS_OFFSET + field), value.raw());
        if self.barrier.marking_active() {
            self.dirty.record_write(base);
        }
    }

    /// Raw word access for non-reference payloads (class kind words) and
    /// collector copies.
    pub fn load_word(&self, addr: Address) -> usize {
        self.whole.load(addr)
    }

    pub fn store_word(&self, addr: Address, value: usize) {
        self.whole.store(addr, value);
    }

    pub fn copy_words(&self, from: Address, to: Address, words: usize) {
        for i in 0..words {
            self.whole.store(to.offset(i), self.whole.load(from.offset(i)));
        }
    }

    // ---- mark word ------------------------------------------------------

    pub fn mark_word(&self, obj: ObjectRef) -> MarkWord {
        MarkWord::from_raw(self.whole.load(obj.addr().offset(MARK_OFFSET)))
    }

    pub fn set_mark_word(&self, obj: ObjectRef, mark: MarkWord) {
        self.whole.store(obj.addr().offset(MARK_OFFSET), mark.raw());
    }

    /// Single-winner mark-word CAS; the forwarding-pointer race in the
    /// copying collector hinges on this.
    pub fn cas_mark_word(&self, obj: ObjectRef, old: MarkWord, new: MarkWord) -> bool {
        self.whole
            .cas(obj.addr().offset(MARK_OFFSET), old.raw(), new.raw())
            .is_ok()
    }

    // ---- read barrier ---------------------------------------------------

    /// Heal a reference during a copying cycle: a from-space address whose
    /// mark word carries a forwarding pointer resolves to the to-space
    /// copy. Outside a copying cycle this is the identity function.
    pub fn read_barrier_address(&self, addr: Address) -> Address {
        if !self.barrier.read_active() || !self.contains(addr) {
            return addr;
        }
        if addr.offset(MARK_OFFSET).raw() >= self.memory.len() {
            return addr;
        }
        let mark = MarkWord::from_raw(self.whole.load(addr.offset(MARK_OFFSET)));
        if mark.is_forwarded() {
            mark.forwarding()
        } else {
            addr
        }
    }

    // ---- identity hash --------------------------------------------------

    /// Lazily assigned, stable across moves (it travels in the monitor
    /// word when the object is copied).
    pub fn identity_hash(&self, obj: ObjectRef) -> usize {
        let slot = obj.addr().offset(MONITOR_OFFSET);
        let current = self.whole.load(slot);
        if current != 0 {
            return current;
        }
        let candidate = self
            .hash_seed
            .fetch_add(0x9E37_79B9, Ordering::AcqRel)
            .wrapping_mul(0x85EB_CA6B)
            | 1;
        match self.whole.cas(slot, 0, candidate) {
            Ok(_) => candidate,
            Err(winner) => winner,
        }
    }

    // ---- accounting -----------------------------------------------------

    pub fn words_allocated(&self) -> usize {
        self.words_allocated.load(Ordering::Acquire)
    }

    pub fn set_words_allocated(&self, words: usize) {
        self.words_allocated.store(words, Ordering::Release);
    }

    /// Grow the collection trigger to twice the survivors, capped at the
    /// mutator spaces' capacity. Called after every cycle.
    pub fn update_target_footprint(&self) {
        let cap = self.main.size() + self.regions.regions().len() * self.regions.region_words();
        let target = (self.words_allocated().saturating_mul(2)).clamp(self.main.size() / 2, cap);
        self.target_footprint.store(target, Ordering::Release);
    }

    pub fn target_footprint(&self) -> usize {
        self.target_footprint.load(Ordering::Acquire)
    }

    /// Allocation-rate hint for the embedder: a cycle is due once the
    /// footprint passes the target.
    pub fn should_collect(&self) -> bool {
        self.words_allocated() >= self.target_footprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::REFERENT_FIELD;

    fn heap() -> Heap {
        Heap::new(&GcOptions {
            heap_words: 8192,
            boot_words: 256,
            main_words: 4096,
            region_words: 256,
            ..Default::default()
        })
    }

    fn alloc_plain(heap: &Heap, num_fields: usize) -> ObjectRef {
        let class = heap.allocate_boot_raw(object_words(1)).unwrap();
        heap.init_object(class, class, 1);
        heap.store_word(class.offset(FIELDS_OFFSET), ClassKind::Ordinary.as_word());

        let addr = heap.allocate_raw(object_words(num_fields)).unwrap();
        heap.init_object(addr, class, num_fields);
        heap.object_at(addr).unwrap()
    }

    #[test]
    fn spaces_partition_the_arena() {
        let h = heap();
        assert_eq!(h.boot().begin(), Address::new(1));
        assert_eq!(h.boot().end(), h.main_space().begin());
        // Regions take whole multiples of the region size after main.
        let region_begin = h.main_space().end().raw();
        assert_eq!(h.region_space().regions().len(), (8192 - region_begin) / 256);
        assert!(h.region_space().contains(Address::new(region_begin)));
        assert!(!h.contains(Address::NULL));
        assert!(!h.contains(Address::INVALID));
    }

    #[test]
    fn init_and_field_round_trip() {
        let h = heap();
        let obj = alloc_plain(&h, 2);
        let other = alloc_plain(&h, 0);

        assert_eq!(h.num_fields(obj), 2);
        assert_eq!(h.size_of(obj), object_words(2));
        assert_eq!(h.load_field(obj, 0), Address::NULL);
        h.store_field(obj, 0, other.addr());
        assert_eq!(h.load_field(obj, 0), other.addr());
        assert_eq!(h.class_kind(obj), ClassKind::Ordinary);
    }

    #[test]
    fn stores_dirty_lines_only_while_marking() {
        let h = heap();
        let obj = alloc_plain(&h, 1);

        h.store_field(obj, 0, Address::NULL);
        assert_eq!(h.dirty_lines().dirty_count(), 0);

        h.barrier().set_marking_active(true);
        h.store_field(obj, 0, Address::NULL);
        assert!(h.dirty_lines().is_dirty(obj.addr()));
    }

    #[test]
    fn read_barrier_heals_forwarded_references() {
        let h = heap();
        let obj = alloc_plain(&h, 1);
        let copy = alloc_plain(&h, 1);

        // Inactive barrier: raw address comes back, forwarded or not.
        h.set_mark_word(obj, MarkWord::forwarded(copy.addr()));
        assert_eq!(h.read_barrier_address(obj.addr()), obj.addr());

        h.barrier().set_read_active(true);
        assert_eq!(h.read_barrier_address(obj.addr()), copy.addr());
        assert_eq!(h.read_barrier_address(copy.addr()), copy.addr());
        assert_eq!(h.read_barrier_address(Address::NULL), Address::NULL);
    }

    #[test]
    fn object_at_rejects_scrubbed_memory() {
        let h = heap();
        let obj = alloc_plain(&h, 1);
        assert!(h.object_at(obj.addr()).is_some());
        h.memory_region().scrub(obj.addr(), h.size_of(obj));
        assert!(h.object_at(obj.addr()).is_none());
    }

    #[test]
    fn identity_hash_is_stable_and_nonzero() {
        let h = heap();
        let a = alloc_plain(&h, 0);
        let b = alloc_plain(&h, 0);
        let ha = h.identity_hash(a);
        assert_ne!(ha, 0);
        assert_eq!(h.identity_hash(a), ha);
        assert_ne!(h.identity_hash(b), ha);
    }

    #[test]
    fn referent_field_constant_matches_layout() {
        let h = heap();
        let obj = alloc_plain(&h, 2);
        let target = alloc_plain(&h, 0);
        h.store_field(obj, REFERENT_FIELD, target.addr());
        assert_eq!(
            h.load_word(obj.addr().offset(FIELDS_OFFSET + REFERENT_FIELD)),
            target.addr().raw()
        );
    }
}
