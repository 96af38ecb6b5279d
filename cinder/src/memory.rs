use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// A word index into the heap arena. Word 0 is reserved, so a zero address
/// doubles as null. `usize::MAX` is the invalid-object sentinel returned by
/// permissive handle lookups.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);
    pub const INVALID: Address = Address(usize::MAX);

    #[inline]
    pub const fn new(raw: usize) -> Self {
        Address(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == usize::MAX
    }

    #[inline]
    pub const fn offset(self, words: usize) -> Address {
        Address(self.0 + words)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Address(null)")
        } else if self.is_invalid() {
            write!(f, "Address(invalid)")
        } else {
            write!(f, "Address({:#x})", self.0)
        }
    }
}

/// Backing store of the whole heap: one slab of atomic words. Every object
/// word is atomic so mutators and a concurrent collector may race on loads
/// and stores without undefined behavior; ordering is the accessors'
/// responsibility.
#[derive(Debug)]
pub struct HeapMemory {
    words: Box<[AtomicUsize]>,
}

impl HeapMemory {
    pub fn new(len: usize) -> Self {
        let words = (0..len).map(|_| AtomicUsize::new(0)).collect();
        Self { words }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// A bounds-checked `{begin, size}` window over the heap arena. Access
/// outside the window is a fatal error, not UB.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    memory: Arc<HeapMemory>,
    begin: usize,
    size: usize,
}

impl MemoryRegion {
    pub fn new(memory: Arc<HeapMemory>, begin: usize, size: usize) -> Self {
        assert!(
            begin + size <= memory.len(),
            "region [{begin}, {}) exceeds heap of {} words",
            begin + size,
            memory.len()
        );
        Self { memory, begin, size }
    }

    pub fn subregion(&self, begin: Address, size: usize) -> MemoryRegion {
        assert!(
            begin.raw() >= self.begin && begin.raw() + size <= self.begin + self.size,
            "subregion [{:?}, +{size}) escapes parent [{:#x}, {:#x})",
            begin,
            self.begin,
            self.begin + self.size
        );
        MemoryRegion::new(self.memory.clone(), begin.raw(), size)
    }

    #[inline]
    pub fn begin(&self) -> Address {
        Address::new(self.begin)
    }

    /// One past the last word.
    #[inline]
    pub fn end(&self) -> Address {
        Address::new(self.begin + self.size)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr.raw() >= self.begin && addr.raw() < self.begin + self.size
    }

    #[inline]
    fn slot(&self, addr: Address) -> &AtomicUsize {
        assert!(
            self.contains(addr),
            "{addr:?} outside region [{:#x}, {:#x})",
            self.begin,
            self.begin + self.size
        );
        &self.memory.words[addr.raw()]
    }

    #[inline]
    pub fn load(&self, addr: Address) -> usize {
        self.slot(addr).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, addr: Address, value: usize) {
        self.slot(addr).store(value, Ordering::Release);
    }

    /// Single-winner compare-and-swap on one heap word.
    #[inline]
    pub fn cas(&self, addr: Address, old: usize, new: usize) -> Result<usize, usize> {
        self.slot(addr)
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Zero a word range. Used when scrubbing freed memory so any stale
    /// access trips the null-class check instead of reading garbage.
    pub fn scrub(&self, begin: Address, words: usize) {
        for i in 0..words {
            self.store(begin.offset(i), 0);
        }
    }
}

/// Atomic bitmap, one bit per slot.
#[derive(Debug)]
pub struct BitVector {
    bits: Box<[AtomicUsize]>,
    len: usize,
}

const WORD_BITS: usize = usize::BITS as usize;

impl BitVector {
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(WORD_BITS);
        let bits = (0..words).map(|_| AtomicUsize::new(0)).collect();
        Self { bits, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn split(&self, index: usize) -> (usize, usize) {
        assert!(index < self.len, "bit {index} out of range (len {})", self.len);
        (index / WORD_BITS, 1usize << (index % WORD_BITS))
    }

    /// Set a bit; returns true only for the caller that actually flipped it
    /// (two racing setters agree on a single winner).
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        let (word, mask) = self.split(index);
        let prev = self.bits[word].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    #[inline]
    pub fn clear(&self, index: usize) {
        let (word, mask) = self.split(index);
        self.bits[word].fetch_and(!mask, Ordering::AcqRel);
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        let (word, mask) = self.split(index);
        self.bits[word].load(Ordering::Acquire) & mask != 0
    }

    pub fn clear_all(&self) {
        for word in self.bits.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Word-wise copy of `other` into `self`. Both sides must be the same
    /// length; callers use this for the stop-the-world bitmap toggle.
    pub fn assign_from(&self, other: &BitVector) {
        assert_eq!(self.len, other.len, "bitmap length mismatch");
        for (dst, src) in self.bits.iter().zip(other.bits.iter()) {
            dst.store(src.load(Ordering::Acquire), Ordering::Release);
        }
    }
}
