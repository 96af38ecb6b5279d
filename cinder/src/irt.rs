use crate::{Address, GcError, GcRoot, Heap, RootInfo, RootVisitor};

const KIND_BITS: usize = 2;
const KIND_MASK: usize = (1 << KIND_BITS) - 1;
const SERIAL_BITS: usize = 3;
const SERIAL_MASK: usize = (1 << SERIAL_BITS) - 1;

/// Handle kind, stored in the low two bits of an `IndirectRef` (matches
/// JNI's jobjectRefType numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectRefKind {
    HandleScopeOrInvalid = 0,
    Local = 1,
    Global = 2,
    WeakGlobal = 3,
}

impl IndirectRefKind {
    fn from_bits(bits: usize) -> IndirectRefKind {
        match bits & KIND_MASK {
            1 => IndirectRefKind::Local,
            2 => IndirectRefKind::Global,
            3 => IndirectRefKind::WeakGlobal,
            _ => IndirectRefKind::HandleScopeOrInvalid,
        }
    }
}

/// Opaque handle encoding `{index, serial, kind}`. A handle is valid only
/// while its serial matches the slot's current occupant, which detects
/// use-after-free in O(1): create h1 for obj, delete h1, create h2 into
/// the same slot, look up h1 -- the serial mismatch catches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndirectRef(usize);

impl IndirectRef {
    fn encode(index: usize, serial: usize, kind: IndirectRefKind) -> Self {
        IndirectRef((index << (KIND_BITS + SERIAL_BITS)) | (serial << KIND_BITS) | kind as usize)
    }

    #[inline]
    pub fn kind(self) -> IndirectRefKind {
        IndirectRefKind::from_bits(self.0)
    }

    #[inline]
    fn serial(self) -> usize {
        (self.0 >> KIND_BITS) & SERIAL_MASK
    }

    #[inline]
    fn index(self) -> usize {
        self.0 >> (KIND_BITS + SERIAL_BITS)
    }
}

/// Segment cookie: the table's top at the time of the matching push. The
/// caller keeps it (JNI transitions stash it in the frame) and passes it
/// back to add/remove/pop so the table knows the current segment's bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    pub top_index: usize,
}

pub const FIRST_SEGMENT: SegmentState = SegmentState { top_index: 0 };

#[derive(Debug)]
struct IrtEntry {
    serial: usize,
    occupied: bool,
    root: GcRoot,
}

impl IrtEntry {
    fn empty() -> Self {
        Self {
            serial: 0,
            occupied: false,
            root: GcRoot::null(),
        }
    }
}

/// Segmented handle table mapping opaque references to GC root slots.
///
/// Entries are added within the current segment (delimited by
/// push_frame/pop_frame); popping a segment bulk-invalidates everything
/// added after the push. Interior removals leave holes that later adds
/// refill; removing the topmost entry also strips the holes directly
/// below it, so `top_index` can drop by more than one.
#[derive(Debug)]
pub struct IndirectReferenceTable {
    kind: IndirectRefKind,
    entries: Vec<IrtEntry>,
    top_index: usize,
    capacity: usize,
    resizable: bool,
    strict: bool,
}

impl IndirectReferenceTable {
    pub fn new(kind: IndirectRefKind, capacity: usize, resizable: bool, strict: bool) -> Self {
        assert!(kind != IndirectRefKind::HandleScopeOrInvalid);
        assert!(capacity > 0);
        Self {
            kind,
            entries: Vec::new(),
            top_index: 0,
            capacity,
            resizable,
            strict,
        }
    }

    pub fn segment_state(&self) -> SegmentState {
        SegmentState {
            top_index: self.top_index,
        }
    }

    /// Begin a new segment; the returned cookie is the new segment's
    /// bottom and must be handed to the matching `pop_frame`.
    pub fn push_frame(&self) -> SegmentState {
        self.segment_state()
    }

    /// Discard every entry added since the matching push, including slots
    /// that were individually removed in between.
    pub fn pop_frame(&mut self, cookie: SegmentState) {
        assert!(
            cookie.top_index <= self.top_index,
            "segment cookie above table top ({} > {})",
            cookie.top_index,
            self.top_index
        );
        for i in cookie.top_index..self.top_index {
            self.entries[i].occupied = false;
            self.entries[i].root.store(Address::NULL);
        }
        self.top_index = cookie.top_index;
    }

    /// Append (or refill a hole in) the current segment. Bumps the slot
    /// serial so stale handles to a reused slot are detectable.
    pub fn add(&mut self, prev_state: SegmentState, obj: Address) -> Result<IndirectRef, GcError> {
        if obj.is_null() || obj.is_invalid() {
            return Err(GcError::NullReference);
        }
        let bottom = prev_state.top_index;
        debug_assert!(bottom <= self.top_index);

        if let Some(i) = (bottom..self.top_index).find(|&i| !self.entries[i].occupied) {
            return Ok(self.fill(i, obj));
        }

        if self.top_index == self.capacity {
            if self.resizable {
                self.capacity *= 2;
                log::debug!(
                    "growing {:?} reference table to {} entries",
                    self.kind,
                    self.capacity
                );
            } else {
                panic!(
                    "indirect reference table overflow (kind {:?}, capacity {})",
                    self.kind, self.capacity
                );
            }
        }
        while self.entries.len() <= self.top_index {
            self.entries.push(IrtEntry::empty());
        }
        let i = self.top_index;
        self.top_index += 1;
        Ok(self.fill(i, obj))
    }

    fn fill(&mut self, index: usize, obj: Address) -> IndirectRef {
        let entry = &mut self.entries[index];
        entry.serial = (entry.serial + 1) & SERIAL_MASK;
        entry.occupied = true;
        entry.root.store(obj);
        IndirectRef::encode(index, entry.serial, self.kind)
    }

    fn check(&self, iref: IndirectRef) -> Result<usize, &'static str> {
        if iref.kind() != self.kind {
            return Err("handle kind does not match table");
        }
        let index = iref.index();
        if index >= self.top_index {
            return Err("stale handle: index outside live segment");
        }
        let entry = &self.entries[index];
        if !entry.occupied {
            return Err("stale handle: slot was removed");
        }
        if entry.serial != iref.serial() {
            return Err("stale handle: serial mismatch (slot was reused)");
        }
        Ok(index)
    }

    /// Decode a handle to the current object address. Reads go through the
    /// read barrier so a to-space address comes back during a copying
    /// cycle, and the slot is healed in place. A cleared weak slot decodes
    /// to null. Stale handles panic under strict (CheckJNI) mode and are
    /// an `InvalidReference` error otherwise.
    pub fn try_get(&self, heap: &Heap, iref: IndirectRef) -> Result<Address, GcError> {
        match self.check(iref) {
            Ok(index) => {
                let entry = &self.entries[index];
                let addr = entry.root.load();
                if addr.is_null() {
                    return Ok(Address::NULL);
                }
                let healed = heap.read_barrier_address(addr);
                if healed != addr {
                    entry.root.store(healed);
                }
                Ok(healed)
            }
            Err(why) => {
                if self.strict {
                    panic!("JNI error: {why} ({:?} table, {iref:?})", self.kind);
                }
                log::warn!("{why} ({:?} table, {iref:?})", self.kind);
                Err(GcError::InvalidReference)
            }
        }
    }

    /// Infallible decode for callers that treat staleness as a sentinel
    /// (JNI lookup semantics).
    pub fn get(&self, heap: &Heap, iref: IndirectRef) -> Address {
        self.try_get(heap, iref).unwrap_or(Address::INVALID)
    }

    /// Delete an entry. A handle whose index falls outside the current
    /// segment, or that is already stale, is a silent no-op returning
    /// false (JNI DeleteLocalRef semantics).
    pub fn remove(&mut self, prev_state: SegmentState, iref: IndirectRef) -> bool {
        if iref.kind() != self.kind {
            return false;
        }
        let bottom = prev_state.top_index;
        let index = iref.index();
        if index < bottom || index >= self.top_index {
            return false;
        }

        let entry = &mut self.entries[index];
        if !entry.occupied || entry.serial != iref.serial() {
            return false;
        }
        entry.occupied = false;
        entry.root.store(Address::NULL);

        if index == self.top_index - 1 {
            self.top_index -= 1;
            while self.top_index > bottom && !self.entries[self.top_index - 1].occupied {
                self.top_index -= 1;
            }
        }
        true
    }

    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor, info: RootInfo) {
        for entry in self.entries.iter().take(self.top_index) {
            if entry.occupied && !entry.root.is_null() {
                visitor.visit_root(&entry.root, info);
            }
        }
    }

    /// Weak-table sweep: drop dead referents (slot decodes to null from
    /// now on), update moved ones.
    pub fn sweep(&mut self, is_marked: &mut dyn FnMut(Address) -> Option<Address>) {
        for entry in self.entries.iter_mut().take(self.top_index) {
            if !entry.occupied {
                continue;
            }
            let addr = entry.root.load();
            if addr.is_null() {
                continue;
            }
            match is_marked(addr) {
                Some(new_addr) => entry.root.store(new_addr),
                None => entry.root.store(Address::NULL),
            }
        }
    }

    pub fn n_entries(&self) -> usize {
        self.entries
            .iter()
            .take(self.top_index)
            .filter(|e| e.occupied)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dump(&self) -> String {
        format!(
            "{:?} table: {} live of {} slots (top {})",
            self.kind,
            self.n_entries(),
            self.capacity,
            self.top_index
        )
    }
}
