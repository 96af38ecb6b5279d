use std::time::Duration;

/// Which collector the heap drives for full cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorType {
    MarkSweep,
    MarkCompact,
    ConcurrentCopying,
}

/// Flat, parse-free option block. The embedder (or the demo binary's clap
/// layer) fills this once at startup; the core only reads it.
#[derive(Debug, Clone)]
pub struct GcOptions {
    pub collector: CollectorType,
    /// Total heap size in words. Word 0 is reserved so null stays null.
    pub heap_words: usize,
    /// Words carved out for the boot space (classes, immune each cycle).
    pub boot_words: usize,
    /// Words carved out for the free-list main space.
    pub main_words: usize,
    /// Size of a single copying region in words. The region space takes
    /// whatever is left of the heap after boot and main.
    pub region_words: usize,
    /// Dirty-line granularity in words for the concurrent re-mark pass.
    pub dirty_line_words: usize,
    /// Run the marking phase concurrently with mutators (CMS-style) when
    /// the collector supports it.
    pub concurrent_mark: bool,
    /// Worker threads for parallel mark-stack draining. 1 = drain on the
    /// collecting thread only.
    pub gc_threads: usize,
    /// Hard cap on the gray worklist. Exceeding it is fatal.
    pub mark_stack_capacity: usize,
    /// Abort if a mutator has not reached a safepoint within this window.
    pub suspend_timeout: Duration,
    /// CheckJNI-style strictness: stale handles panic instead of returning
    /// the invalid sentinel.
    pub strict_jni: bool,
    /// Capacity of each thread-local local reference table.
    pub local_ref_capacity: usize,
    /// Whether local tables may grow past their initial capacity.
    pub resizable_local_tables: bool,
    /// Capacity of the process-wide global / weak-global tables.
    pub global_ref_capacity: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            collector: CollectorType::MarkSweep,
            heap_words: 1 << 16,
            boot_words: 1 << 10,
            main_words: 1 << 14,
            region_words: 1 << 10,
            dirty_line_words: 64,
            concurrent_mark: false,
            gc_threads: 1,
            mark_stack_capacity: 1 << 14,
            suspend_timeout: Duration::from_secs(10),
            strict_jni: false,
            local_ref_capacity: 64,
            resizable_local_tables: true,
            global_ref_capacity: 512,
        }
    }
}
