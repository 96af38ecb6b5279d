use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Address, BitVector};

/// Global barrier state the heap accessors consult on every reference
/// load and store. Both flags flip only inside a pause, so a relaxed-ish
/// acquire load per access is the whole cost when no collection runs.
#[derive(Debug, Default)]
pub struct BarrierState {
    /// Read barrier active: loads of from-space references must be healed
    /// to the to-space copy.
    read_active: AtomicBool,
    /// Concurrent marking active: reference stores must be recorded so the
    /// re-mark pause can rescan them.
    marking_active: AtomicBool,
}

impl BarrierState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn read_active(&self) -> bool {
        self.read_active.load(Ordering::Acquire)
    }

    pub fn set_read_active(&self, active: bool) {
        self.read_active.store(active, Ordering::Release);
    }

    #[inline]
    pub fn marking_active(&self) -> bool {
        self.marking_active.load(Ordering::Acquire)
    }

    pub fn set_marking_active(&self, active: bool) {
        self.marking_active.store(active, Ordering::Release);
    }
}

/// Card-table analogue at word-line granularity. Mutator stores during a
/// concurrent mark dirty the line containing the written slot; the final
/// pause drains the table and rescans only those lines.
#[derive(Debug)]
pub struct DirtyLineTable {
    lines: BitVector,
    line_words: usize,
}

impl DirtyLineTable {
    pub fn new(heap_words: usize, line_words: usize) -> Self {
        assert!(line_words > 0, "zero dirty-line granularity");
        Self {
            lines: BitVector::new(heap_words.div_ceil(line_words)),
            line_words,
        }
    }

    #[inline]
    pub fn record_write(&self, addr: Address) {
        self.lines.set(addr.raw() / self.line_words);
    }

    pub fn is_dirty(&self, addr: Address) -> bool {
        self.lines.test(addr.raw() / self.line_words)
    }

    /// Visit each dirty line as `(begin, words)` and clean it. New writes
    /// racing with the drain land on lines a later drain will see.
    pub fn drain(&self, visit: &mut dyn FnMut(Address, usize)) {
        for line in 0..self.lines.len() {
            if self.lines.test(line) {
                self.lines.clear(line);
                visit(Address::new(line * self.line_words), self.line_words);
            }
        }
    }

    pub fn clear_all(&self) {
        self.lines.clear_all();
    }

    pub fn dirty_count(&self) -> usize {
        (0..self.lines.len()).filter(|&l| self.lines.test(l)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_dirty_exactly_their_line() {
        let table = DirtyLineTable::new(1024, 64);
        table.record_write(Address::new(70));
        table.record_write(Address::new(100));
        assert_eq!(table.dirty_count(), 1, "same line dirtied once");
        assert!(table.is_dirty(Address::new(64)));
        assert!(!table.is_dirty(Address::new(0)));

        table.record_write(Address::new(640));
        let mut drained = Vec::new();
        table.drain(&mut |begin, words| drained.push((begin, words)));
        assert_eq!(
            drained,
            vec![(Address::new(64), 64), (Address::new(640), 64)]
        );
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn barrier_flags_toggle() {
        let state = BarrierState::new();
        assert!(!state.read_active());
        assert!(!state.marking_active());
        state.set_marking_active(true);
        state.set_read_active(true);
        assert!(state.read_active());
        assert!(state.marking_active());
        state.set_marking_active(false);
        assert!(!state.marking_active());
    }
}
