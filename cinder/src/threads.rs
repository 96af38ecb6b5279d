use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    GcOptions, GcRoot, IndirectRefKind, IndirectReferenceTable, RootInfo, RootKind, RootVisitor,
};

/// Per-mutator state: a handful of raw stack roots plus the thread's local
/// indirect reference table (its handle scopes).
#[derive(Debug)]
pub struct MutatorThread {
    id: u64,
    roots: Mutex<Vec<GcRoot>>,
    locals: Mutex<IndirectReferenceTable>,
}

impl MutatorThread {
    fn new(id: u64, options: &GcOptions) -> Self {
        Self {
            id,
            roots: Mutex::new(Vec::new()),
            locals: Mutex::new(IndirectReferenceTable::new(
                IndirectRefKind::Local,
                options.local_ref_capacity,
                options.resizable_local_tables,
                options.strict_jni,
            )),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn push_root(&self, root: GcRoot) {
        self.roots.lock().push(root);
    }

    pub fn pop_root(&self) {
        self.roots.lock().pop();
    }

    pub fn locals(&self) -> &Mutex<IndirectReferenceTable> {
        &self.locals
    }

    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        for root in self.roots.lock().iter() {
            visitor.visit_root(root, RootInfo::thread(RootKind::ThreadStack, self.id));
        }
        self.locals
            .lock()
            .visit_roots(visitor, RootInfo::thread(RootKind::JniLocal, self.id));
    }
}

#[derive(Debug)]
struct SuspendState {
    suspend_requested: bool,
    suspended: usize,
}

/// Registry of attached mutators with cooperative suspend-all.
///
/// The collector raises a suspension request; each mutator parks at its
/// next `checkpoint` call and stays parked until `resume_all`. A mutator
/// that fails to reach a checkpoint within the configured timeout is a
/// runtime bug, and the suspension aborts the process rather than let the
/// collector scan a running thread's roots.
#[derive(Debug)]
pub struct ThreadList {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicUsize,
    state: Mutex<SuspendState>,
    all_suspended: Condvar,
    resume: Condvar,
    suspend_timeout: Duration,
    local_options: GcOptions,
}

impl ThreadList {
    pub fn new(options: &GcOptions) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            state: Mutex::new(SuspendState {
                suspend_requested: false,
                suspended: 0,
            }),
            all_suspended: Condvar::new(),
            resume: Condvar::new(),
            suspend_timeout: options.suspend_timeout,
            local_options: options.clone(),
        }
    }

    pub fn attach(&self) -> Arc<MutatorThread> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) as u64;
        let thread = Arc::new(MutatorThread::new(id, &self.local_options));
        self.threads.lock().push(thread.clone());
        thread
    }

    pub fn detach(&self, thread: &Arc<MutatorThread>) {
        let mut threads = self.threads.lock();
        threads.retain(|t| t.id != thread.id);
        drop(threads);
        // A pending suspend-all may now be satisfiable with one fewer
        // mutator; wake it so it re-counts.
        self.all_suspended.notify_all();
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Safepoint poll. Cheap when no suspension is requested; otherwise
    /// parks until `resume_all`.
    pub fn checkpoint(&self, _thread: &MutatorThread) {
        let mut state = self.state.lock();
        if !state.suspend_requested {
            return;
        }
        state.suspended += 1;
        self.all_suspended.notify_all();
        while state.suspend_requested {
            self.resume.wait(&mut state);
        }
        state.suspended -= 1;
    }

    /// Stop the world: returns once every attached mutator is parked at a
    /// checkpoint. The caller must not itself be an attached mutator.
    pub fn suspend_all(&self) {
        let deadline = Instant::now() + self.suspend_timeout;
        let mut state = self.state.lock();
        assert!(!state.suspend_requested, "nested suspend_all");
        state.suspend_requested = true;
        loop {
            let expected = self.threads.lock().len();
            if state.suspended >= expected {
                return;
            }
            if self
                .all_suspended
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                panic!(
                    "thread suspension timed out after {:?} ({}/{} suspended)",
                    self.suspend_timeout,
                    state.suspended,
                    self.threads.lock().len()
                );
            }
        }
    }

    pub fn resume_all(&self) {
        let mut state = self.state.lock();
        state.suspend_requested = false;
        self.resume.notify_all();
    }

    /// Run the world stopped. Suspends, runs `f`, resumes even if `f`
    /// panics so the process can report the failure.
    pub fn run_suspended<R>(&self, f: impl FnOnce() -> R) -> R {
        self.suspend_all();
        struct ResumeGuard<'a>(&'a ThreadList);
        impl Drop for ResumeGuard<'_> {
            fn drop(&mut self) {
                self.0.resume_all();
            }
        }
        let guard = ResumeGuard(self);
        let result = f();
        drop(guard);
        result
    }

    /// Visit stack roots and JNI locals of every attached thread.
    pub fn visit_thread_roots(&self, visitor: &mut dyn RootVisitor) {
        let threads = self.threads.lock();
        for thread in threads.iter() {
            thread.visit_roots(visitor);
        }
    }
}

/// Reusable rendezvous for the parallel mark workers. Each cycle of
/// `wait(n)` flips the sense, so the barrier can be reused back to back
/// without reinitialization.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `until` threads have arrived.
    pub fn wait(&self, until: usize) {
        let mut state = self.state.lock();
        let my_sense = state.1;
        state.0 += 1;
        if state.0 == until {
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
        } else {
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
        }
    }
}

/// Shared/exclusive lock ranking mutators against stop-the-world phases.
/// Mutators hold it shared across heap accesses; a collector pause takes
/// it exclusively.
///
/// Lock order (outermost first): gc lock > mutator lock > thread-list
/// suspension > per-table locks. A shared section must never span a
/// safepoint poll, or the exclusive acquisition and the suspension wait
/// each other out.
#[derive(Debug, Default)]
pub struct MutatorLock {
    lock: RwLock<()>,
}

impl MutatorLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }
}
