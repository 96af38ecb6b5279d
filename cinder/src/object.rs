use crate::Address;

/// Object layout, in word offsets from the object address:
///
/// ```text
/// 0  class    address of the class object (never null once constructed)
/// 1  monitor  identity hash / monitor word
/// 2  mark     tri-color tag | forwarded bit | forwarding address
/// 3  len      number of reference fields
/// 4+ fields   one address per field (0 = null)
/// ```
///
/// Classes are heap objects themselves; a class object's single field
/// holds its `ClassKind` discriminant as a raw word, not a reference.
pub const CLASS_OFFSET: usize = 0;
pub const MONITOR_OFFSET: usize = 1;
pub const MARK_OFFSET: usize = 2;
pub const LEN_OFFSET: usize = 3;
pub const FIELDS_OFFSET: usize = 4;

/// Field index of a reference object's referent.
pub const REFERENT_FIELD: usize = 0;
/// Field index of the intrusive pending-next link used by ReferenceQueue.
pub const PENDING_NEXT_FIELD: usize = 1;

#[inline]
pub const fn object_words(num_fields: usize) -> usize {
    FIELDS_OFFSET + num_fields
}

/// A non-null, non-sentinel heap address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(Address);

impl ObjectRef {
    #[inline]
    pub fn new(addr: Address) -> Option<ObjectRef> {
        if addr.is_null() || addr.is_invalid() {
            None
        } else {
            Some(ObjectRef(addr))
        }
    }

    #[inline]
    pub fn addr(self) -> Address {
        self.0
    }
}

impl From<ObjectRef> for Address {
    fn from(obj: ObjectRef) -> Address {
        obj.0
    }
}

/// Tri-color marking state, encoded in the low two bits of the mark word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

const COLOR_MASK: usize = 0b11;
const FORWARDED_BIT: usize = 0b100;
const FORWARD_SHIFT: usize = 3;

/// Mark-word encoding. When an object has been relocated the word carries
/// the forwarding address; the color bits then read black, since a copied
/// object's contents are the to-space copy's problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkWord(usize);

impl MarkWord {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        MarkWord(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn white() -> Self {
        MarkWord(0)
    }

    #[inline]
    pub fn color(self) -> Color {
        if self.is_forwarded() {
            return Color::Black;
        }
        match self.0 & COLOR_MASK {
            0 => Color::White,
            1 => Color::Gray,
            _ => Color::Black,
        }
    }

    #[inline]
    pub fn with_color(self, color: Color) -> Self {
        debug_assert!(!self.is_forwarded(), "recoloring a forwarded object");
        let tag = match color {
            Color::White => 0,
            Color::Gray => 1,
            Color::Black => 2,
        };
        MarkWord((self.0 & !COLOR_MASK) | tag)
    }

    #[inline]
    pub fn is_forwarded(self) -> bool {
        self.0 & FORWARDED_BIT != 0
    }

    #[inline]
    pub fn forwarding(self) -> Address {
        debug_assert!(self.is_forwarded());
        Address::new(self.0 >> FORWARD_SHIFT)
    }

    #[inline]
    pub fn forwarded(to: Address) -> Self {
        MarkWord((to.raw() << FORWARD_SHIFT) | FORWARDED_BIT)
    }
}

/// Discriminant stored in a class object's first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Ordinary,
    Class,
    WeakReference,
    SoftReference,
    FinalizerReference,
    PhantomReference,
}

impl ClassKind {
    pub fn as_word(self) -> usize {
        match self {
            ClassKind::Ordinary => 0,
            ClassKind::Class => 1,
            ClassKind::WeakReference => 2,
            ClassKind::SoftReference => 3,
            ClassKind::FinalizerReference => 4,
            ClassKind::PhantomReference => 5,
        }
    }

    pub fn from_word(word: usize) -> ClassKind {
        match word {
            0 => ClassKind::Ordinary,
            1 => ClassKind::Class,
            2 => ClassKind::WeakReference,
            3 => ClassKind::SoftReference,
            4 => ClassKind::FinalizerReference,
            5 => ClassKind::PhantomReference,
            other => panic!("corrupt class kind word {other}"),
        }
    }

    /// True for the java.lang.ref.Reference family, whose referent field
    /// gets the delayed treatment during marking.
    #[inline]
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            ClassKind::WeakReference
                | ClassKind::SoftReference
                | ClassKind::FinalizerReference
                | ClassKind::PhantomReference
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_round_trip() {
        let w = MarkWord::white();
        assert_eq!(w.color(), Color::White);
        let g = w.with_color(Color::Gray);
        assert_eq!(g.color(), Color::Gray);
        let b = g.with_color(Color::Black);
        assert_eq!(b.color(), Color::Black);
        assert!(!b.is_forwarded());
    }

    #[test]
    fn forwarding_encodes_address_and_reads_black() {
        let fwd = MarkWord::forwarded(Address::new(0x1234));
        assert!(fwd.is_forwarded());
        assert_eq!(fwd.forwarding(), Address::new(0x1234));
        assert_eq!(fwd.color(), Color::Black);
    }

    #[test]
    fn class_kind_words_round_trip() {
        for kind in [
            ClassKind::Ordinary,
            ClassKind::Class,
            ClassKind::WeakReference,
            ClassKind::SoftReference,
            ClassKind::FinalizerReference,
            ClassKind::PhantomReference,
        ] {
            assert_eq!(ClassKind::from_word(kind.as_word()), kind);
        }
        assert!(ClassKind::WeakReference.is_reference());
        assert!(!ClassKind::Class.is_reference());
    }

    #[test]
    fn object_ref_rejects_sentinels() {
        assert!(ObjectRef::new(Address::NULL).is_none());
        assert!(ObjectRef::new(Address::INVALID).is_none());
        assert!(ObjectRef::new(Address::new(16)).is_some());
    }
}
