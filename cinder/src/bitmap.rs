use crate::{Address, BitVector, MemoryRegion};

/// One mark bit per word of a space, addressed by heap address. Marking is
/// a CAS with a single winner, so a mutator and the collector racing to
/// mark the same object never double-count it.
#[derive(Debug)]
pub struct SpaceBitmap {
    base: Address,
    bits: BitVector,
}

impl SpaceBitmap {
    pub fn for_region(region: &MemoryRegion) -> Self {
        Self {
            base: region.begin(),
            bits: BitVector::new(region.size()),
        }
    }

    #[inline]
    fn index(&self, addr: Address) -> usize {
        debug_assert!(addr.raw() >= self.base.raw(), "{addr:?} below bitmap base");
        addr.raw() - self.base.raw()
    }

    /// Returns true only for the call that actually set the bit.
    #[inline]
    pub fn mark(&self, addr: Address) -> bool {
        self.bits.set(self.index(addr))
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.bits.test(self.index(addr))
    }

    #[inline]
    pub fn unmark(&self, addr: Address) {
        self.bits.clear(self.index(addr));
    }

    pub fn clear_all(&self) {
        self.bits.clear_all();
    }

    pub fn assign_from(&self, other: &SpaceBitmap) {
        assert_eq!(self.base, other.base, "bitmap base mismatch");
        self.bits.assign_from(&other.bits);
    }

    /// Visit every marked address in ascending order.
    pub fn walk_marked(&self, mut f: impl FnMut(Address)) {
        for i in 0..self.bits.len() {
            if self.bits.test(i) {
                f(Address::new(self.base.raw() + i));
            }
        }
    }

    /// Visit marked addresses within `[begin, end)`, clamped to the space.
    pub fn walk_marked_range(&self, begin: Address, end: Address, mut f: impl FnMut(Address)) {
        if end.raw() <= self.base.raw() {
            return;
        }
        let lo = begin.raw().max(self.base.raw()) - self.base.raw();
        let hi = end.raw().min(self.base.raw() + self.bits.len()) - self.base.raw();
        for i in lo..hi {
            if self.bits.test(i) {
                f(Address::new(self.base.raw() + i));
            }
        }
    }
}

/// Aggregate view over per-space bitmaps; answers "is this address marked"
/// for any space that registered a bitmap.
#[derive(Debug)]
pub struct HeapBitmap<'a> {
    entries: Vec<(Address, Address, &'a SpaceBitmap)>,
}

impl<'a> HeapBitmap<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, begin: Address, end: Address, bitmap: &'a SpaceBitmap) {
        self.entries.push((begin, end, bitmap));
    }

    pub fn bitmap_for(&self, addr: Address) -> Option<&'a SpaceBitmap> {
        self.entries
            .iter()
            .find(|(begin, end, _)| addr >= *begin && addr < *end)
            .map(|(_, _, bm)| *bm)
    }

    pub fn is_marked(&self, addr: Address) -> bool {
        self.bitmap_for(addr).is_some_and(|bm| bm.is_marked(addr))
    }
}

impl<'a> Default for HeapBitmap<'a> {
    fn default() -> Self {
        Self::new()
    }
}
