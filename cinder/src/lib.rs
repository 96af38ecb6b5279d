mod barrier;
mod bitmap;
pub mod collector;
mod error;
mod heap;
mod intern;
mod irt;
mod mark_stack;
mod memory;
mod object;
mod options;
mod refproc;
mod refqueue;
mod reference_table;
mod root;
mod runtime;
mod space;
mod threads;
mod vm_refs;

pub use barrier::{BarrierState, DirtyLineTable};
pub use bitmap::{HeapBitmap, SpaceBitmap};
pub use collector::{CollectorKind, ConcurrentCopying, GcCause, GcStats, MarkCompact, MarkSweep};
pub use error::GcError;
pub use heap::Heap;
pub use intern::{InternId, InternTable};
pub use irt::{
    FIRST_SEGMENT, IndirectRef, IndirectRefKind, IndirectReferenceTable, SegmentState,
};
pub use mark_stack::MarkStack;
pub use memory::{Address, BitVector, HeapMemory, MemoryRegion};
pub use object::{
    CLASS_OFFSET, ClassKind, Color, FIELDS_OFFSET, LEN_OFFSET, MARK_OFFSET, MONITOR_OFFSET,
    MarkWord, ObjectRef, PENDING_NEXT_FIELD, REFERENT_FIELD, object_words,
};
pub use options::{CollectorType, GcOptions};
pub use refproc::ReferenceProcessor;
pub use refqueue::ReferenceQueue;
pub use reference_table::ReferenceTable;
pub use root::{GcRoot, RootInfo, RootKind, RootVisitor};
pub use runtime::Runtime;
pub use space::{
    BootSpace, FreeBlock, ImmuneSpaces, MainSpace, Region, RegionFlags, RegionSpace,
};
pub use threads::{MutatorLock, MutatorThread, SenseBarrier, ThreadList};
pub use vm_refs::VmRefs;
