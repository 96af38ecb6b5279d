use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{Address, MemoryRegion, SpaceBitmap};

/// Address ranges whose contents are axiomatically live for the current
/// cycle (the boot image). Containment answers `is_marked` without
/// touching bitmaps or the mark stack.
#[derive(Debug, Default)]
pub struct ImmuneSpaces {
    ranges: Vec<(Address, Address)>,
}

impl ImmuneSpaces {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.ranges.clear();
    }

    pub fn add_range(&mut self, begin: Address, end: Address) {
        debug_assert!(begin < end);
        self.ranges.push((begin, end));
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.ranges
            .iter()
            .any(|&(begin, end)| addr >= begin && addr < end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Bump space for boot-time objects (classes). Immune candidate every
/// cycle, never swept or moved.
#[derive(Debug)]
pub struct BootSpace {
    region: MemoryRegion,
    top: AtomicUsize,
}

impl BootSpace {
    pub fn new(region: MemoryRegion) -> Self {
        let top = AtomicUsize::new(region.begin().raw());
        Self { region, top }
    }

    pub fn alloc(&self, words: usize) -> Option<Address> {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top + words > self.region.end().raw() {
                return None;
            }
            match self.top.compare_exchange(
                top,
                top + words,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Address::new(top)),
                Err(cur) => top = cur,
            }
        }
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    pub fn begin(&self) -> Address {
        self.region.begin()
    }

    pub fn end(&self) -> Address {
        self.region.end()
    }

    /// One past the last allocated word.
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub begin: Address,
    pub words: usize,
}

/// Free-list space collected by mark-sweep and compacted by mark-compact.
/// The live bitmap records allocated objects; the mark bitmap records the
/// current cycle's survivors; sweep toggles them.
#[derive(Debug)]
pub struct MainSpace {
    region: MemoryRegion,
    pub live: SpaceBitmap,
    pub mark: SpaceBitmap,
    free: Mutex<Vec<FreeBlock>>,
}

impl MainSpace {
    pub fn new(region: MemoryRegion) -> Self {
        let live = SpaceBitmap::for_region(&region);
        let mark = SpaceBitmap::for_region(&region);
        let free = Mutex::new(vec![FreeBlock {
            begin: region.begin(),
            words: region.size(),
        }]);
        Self {
            region,
            live,
            mark,
            free,
        }
    }

    /// First-fit allocation. Marks the live bitmap at the object start.
    pub fn alloc(&self, words: usize) -> Option<Address> {
        let mut free = self.free.lock();
        for i in 0..free.len() {
            if free[i].words >= words {
                let addr = free[i].begin;
                free[i].begin = free[i].begin.offset(words);
                free[i].words -= words;
                if free[i].words == 0 {
                    free.remove(i);
                }
                self.live.mark(addr);
                return Some(addr);
            }
        }
        None
    }

    /// Replace the free list wholesale; the sweep phase rebuilds it from
    /// the surviving objects' gaps.
    pub fn set_free_list(&self, blocks: Vec<FreeBlock>) {
        *self.free.lock() = blocks;
    }

    pub fn free_words(&self) -> usize {
        self.free.lock().iter().map(|b| b.words).sum()
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    pub fn begin(&self) -> Address {
        self.region.begin()
    }

    pub fn end(&self) -> Address {
        self.region.end()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// Holds data and accepts bump allocation.
        const Active = 1 << 0;
        /// Condemned by the current copying cycle.
        const FromSpace = 1 << 1;
        /// Allocated during the current cycle (to-space); exempt from the
        /// next flip within the same cycle.
        const Newly = 1 << 2;
    }
}

#[derive(Debug)]
pub struct Region {
    begin: Address,
    flags: AtomicU8,
    top: AtomicUsize,
}

impl Region {
    fn new(begin: Address) -> Self {
        Self {
            begin,
            flags: AtomicU8::new(RegionFlags::empty().bits()),
            top: AtomicUsize::new(begin.raw()),
        }
    }

    #[inline]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: RegionFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    pub fn is_free(&self) -> bool {
        self.flags().is_empty()
    }
}

/// Fixed-size-region space for the concurrent-copying collector.
#[derive(Debug)]
pub struct RegionSpace {
    region: MemoryRegion,
    region_words: usize,
    regions: Vec<Region>,
    /// Index of the region currently taking bump allocations.
    cursor: Mutex<Option<usize>>,
}

impl RegionSpace {
    pub fn new(region: MemoryRegion, region_words: usize) -> Self {
        assert!(region_words > 0, "region size must be non-zero");
        let count = region.size() / region_words;
        let regions = (0..count)
            .map(|i| Region::new(region.begin().offset(i * region_words)))
            .collect();
        Self {
            region,
            region_words,
            regions,
            cursor: Mutex::new(None),
        }
    }

    pub fn region_words(&self) -> usize {
        self.region_words
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        // The tail remainder after whole regions is never handed out.
        let limit = self.region.begin().raw() + self.regions.len() * self.region_words;
        addr.raw() >= self.region.begin().raw() && addr.raw() < limit
    }

    pub fn region_of(&self, addr: Address) -> &Region {
        debug_assert!(self.contains(addr));
        let index = (addr.raw() - self.region.begin().raw()) / self.region_words;
        &self.regions[index]
    }

    #[inline]
    pub fn is_from_space(&self, addr: Address) -> bool {
        self.contains(addr) && self.region_of(addr).flags().contains(RegionFlags::FromSpace)
    }

    /// Bump allocation within the cursor region; grabs a free region when
    /// the current one cannot fit the request. `newly` tags regions
    /// claimed by the collector's copy phase.
    pub fn alloc(&self, words: usize, newly: bool) -> Option<Address> {
        if words > self.region_words {
            return None;
        }
        let mut cursor = self.cursor.lock();
        if let Some(i) = *cursor {
            if let Some(addr) = self.bump(&self.regions[i], words) {
                return Some(addr);
            }
        }
        // Current region exhausted (or none yet); claim a free one.
        for (i, region) in self.regions.iter().enumerate() {
            if region.is_free() {
                let mut flags = RegionFlags::Active;
                if newly {
                    flags.insert(RegionFlags::Newly);
                }
                region.set_flags(flags);
                *cursor = Some(i);
                return self.bump(region, words);
            }
        }
        None
    }

    fn bump(&self, region: &Region, words: usize) -> Option<Address> {
        let limit = region.begin().raw() + self.region_words;
        let mut top = region.top.load(Ordering::Acquire);
        loop {
            if top + words > limit {
                return None;
            }
            match region.top.compare_exchange(
                top,
                top + words,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Address::new(top)),
                Err(cur) => top = cur,
            }
        }
    }

    /// Condemn every populated region: Active becomes FromSpace, empty
    /// Active regions are released. Returns the number of condemned
    /// regions. The allocation cursor resets so mutator allocation lands
    /// in fresh to-space regions.
    pub fn flip(&self) -> usize {
        let mut cursor = self.cursor.lock();
        *cursor = None;
        let mut condemned = 0;
        for region in &self.regions {
            let flags = region.flags();
            if flags.contains(RegionFlags::Active) {
                if region.top() == region.begin() {
                    region.set_flags(RegionFlags::empty());
                } else {
                    region.set_flags(RegionFlags::FromSpace);
                    condemned += 1;
                }
            }
        }
        condemned
    }

    /// Release and scrub every from-space region. Scrubbing zeroes the
    /// words so a stale from-space dereference trips the null-class check
    /// instead of silently reading dead data. Returns reclaimed words.
    pub fn reclaim_from_spaces(&self, memory: &MemoryRegion) -> usize {
        let mut reclaimed = 0;
        for region in &self.regions {
            if region.flags().contains(RegionFlags::FromSpace) {
                let used = region.top().raw() - region.begin().raw();
                memory.scrub(region.begin(), used);
                region.top.store(region.begin().raw(), Ordering::Release);
                region.set_flags(RegionFlags::empty());
                reclaimed += used;
            }
        }
        reclaimed
    }

    /// Drop the Newly tag after a cycle finishes; survivors become plain
    /// Active regions eligible for the next flip.
    pub fn clear_newly(&self) {
        for region in &self.regions {
            let flags = region.flags();
            if flags.contains(RegionFlags::Newly) {
                region.set_flags(flags - RegionFlags::Newly);
            }
        }
    }

    pub fn free_regions(&self) -> usize {
        self.regions.iter().filter(|r| r.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapMemory;
    use std::sync::Arc;

    fn region(begin: usize, size: usize) -> MemoryRegion {
        let mem = Arc::new(HeapMemory::new(begin + size));
        MemoryRegion::new(mem, begin, size)
    }

    #[test]
    fn immune_containment() {
        let mut immune = ImmuneSpaces::new();
        assert!(!immune.contains(Address::new(5)));
        immune.add_range(Address::new(4), Address::new(8));
        assert!(immune.contains(Address::new(4)));
        assert!(immune.contains(Address::new(7)));
        assert!(!immune.contains(Address::new(8)));
        immune.reset();
        assert!(immune.is_empty());
    }

    #[test]
    fn boot_space_bumps_until_full() {
        let space = BootSpace::new(region(1, 16));
        let a = space.alloc(8).unwrap();
        let b = space.alloc(8).unwrap();
        assert_eq!(a, Address::new(1));
        assert_eq!(b, Address::new(9));
        assert!(space.alloc(1).is_none());
        assert_eq!(space.top(), Address::new(17));
    }

    #[test]
    fn main_space_first_fit_and_free_words() {
        let space = MainSpace::new(region(0, 64));
        assert_eq!(space.free_words(), 64);
        let a = space.alloc(16).unwrap();
        assert_eq!(a, Address::new(0));
        assert!(space.live.is_marked(a));
        assert_eq!(space.free_words(), 48);
        assert!(space.alloc(64).is_none());

        space.set_free_list(vec![
            FreeBlock {
                begin: Address::new(0),
                words: 8,
            },
            FreeBlock {
                begin: Address::new(32),
                words: 32,
            },
        ]);
        // 16 words do not fit the first block; first-fit skips to the second.
        let b = space.alloc(16).unwrap();
        assert_eq!(b, Address::new(32));
    }

    #[test]
    fn region_space_flip_and_reclaim() {
        let mem = region(0, 64);
        let space = RegionSpace::new(mem.clone(), 16);
        assert_eq!(space.regions().len(), 4);

        let a = space.alloc(10, false).unwrap();
        let b = space.alloc(10, false).unwrap();
        // 10 + 10 exceeds one 16-word region, so b starts a second region.
        assert_eq!(a, Address::new(0));
        assert_eq!(b, Address::new(16));

        mem.store(a, 0xAA);
        let condemned = space.flip();
        assert_eq!(condemned, 2);
        assert!(space.is_from_space(a));
        assert!(space.is_from_space(b));

        // Post-flip allocation goes to a fresh region.
        let c = space.alloc(4, true).unwrap();
        assert!(!space.is_from_space(c));
        assert!(space.region_of(c).flags().contains(RegionFlags::Newly));

        let reclaimed = space.reclaim_from_spaces(&mem);
        assert_eq!(reclaimed, 20);
        assert_eq!(mem.load(a), 0, "from-space words must be scrubbed");
        assert!(!space.is_from_space(a));

        space.clear_newly();
        assert_eq!(space.region_of(c).flags(), RegionFlags::Active);
    }

    #[test]
    fn oversized_region_alloc_fails() {
        let space = RegionSpace::new(region(0, 64), 16);
        assert!(space.alloc(17, false).is_none());
    }
}
