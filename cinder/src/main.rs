use clap::{Parser, ValueEnum};

use cinder::{ClassKind, CollectorType, GcOptions, ObjectRef, Runtime};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CollectorArg {
    MarkSweep,
    MarkCompact,
    ConcurrentCopying,
}

impl From<CollectorArg> for CollectorType {
    fn from(arg: CollectorArg) -> Self {
        match arg {
            CollectorArg::MarkSweep => CollectorType::MarkSweep,
            CollectorArg::MarkCompact => CollectorType::MarkCompact,
            CollectorArg::ConcurrentCopying => CollectorType::ConcurrentCopying,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "cinder", about = "Exercise the cinder garbage collectors")]
struct Args {
    #[arg(long, value_enum, default_value = "mark-sweep")]
    collector: CollectorArg,
    /// Total heap size in words.
    #[arg(long, default_value_t = 1 << 16)]
    heap_words: usize,
    /// Trace concurrently with a re-mark pause (mark-sweep only).
    #[arg(long)]
    concurrent: bool,
    /// Parallel mark workers.
    #[arg(long, default_value_t = 2)]
    gc_threads: usize,
    /// Number of allocate-and-collect rounds.
    #[arg(long, default_value_t = 4)]
    rounds: usize,
}

/// Build a linked list of `len` two-field nodes and return its head.
fn build_list(rt: &Runtime, len: usize) -> ObjectRef {
    let mut head = rt.allocate_ordinary(2).expect("allocation failed");
    for _ in 1..len {
        let node = rt.allocate_ordinary(2).expect("allocation failed");
        rt.heap().store_field(node, 0, head.addr());
        head = node;
    }
    head
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let rt = Runtime::new(GcOptions {
        collector: args.collector.into(),
        heap_words: args.heap_words,
        concurrent_mark: args.concurrent,
        gc_threads: args.gc_threads,
        ..Default::default()
    });

    for round in 0..args.rounds {
        // A kept list behind a global handle, a weak reference to garbage,
        // and a pile of unreachable nodes for the collector to find.
        let kept = build_list(&rt, 64);
        let kept_handle = rt
            .vm_refs()
            .add_global(kept.addr())
            .expect("global table full");

        let doomed = build_list(&rt, 64);
        let weak = rt
            .allocate_reference(ClassKind::WeakReference, doomed.addr())
            .expect("allocation failed");
        let weak_handle = rt
            .vm_refs()
            .add_global(weak.addr())
            .expect("global table full");
        build_list(&rt, 256);

        let stats = rt.collect();
        println!(
            "round {round}: {:?} in {:?} | marked {} | moved {} | reclaimed {} words | cleared {}",
            stats.kind,
            stats.duration,
            stats.objects_marked,
            stats.objects_moved,
            stats.words_reclaimed,
            stats.references_cleared
        );

        let cleared = rt.take_cleared_references();
        println!(
            "round {round}: weak referent {} ({} reference(s) delivered)",
            if rt
                .heap()
                .object_at(rt.vm_refs().decode_global(rt.heap(), weak_handle))
                .map(|w| rt.get_referent(w).is_null())
                .unwrap_or(true)
            {
                "cleared"
            } else {
                "alive"
            },
            cleared.len()
        );

        rt.vm_refs().del_global(weak_handle);
        rt.vm_refs().del_global(kept_handle);
    }

    println!(
        "footprint {} / target {} words",
        rt.heap().words_allocated(),
        rt.heap().target_footprint()
    );
}
