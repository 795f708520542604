//! Shared core state and the reclaimer loop.
//!
//! One `start` invocation owns one [`Core`]: the submission queue, batch
//! pool, and generation counter behind a single mutex, plus the condition
//! variable that wakes the reclaimer. The reclaimer runs on the thread that
//! called [`start`], drains submissions in order, applies each batch outside
//! the mutex, and deletes objects whose count provably resolved to zero.
//!
//! ## Ordering
//!
//! The submission queue carries an *open* event when a batch is claimed and a
//! *close* event when it is submitted; a rotation queues the close of the old
//! batch and the open of its replacement under one critical section. On each
//! wakeup the reclaimer first drains the whole queue, inserting a pending
//! marker into the nomination order for every open, and only then applies the
//! drained batches. Together these two rules guarantee that when an object is
//! nominated, every batch that could still hold a retain of it (any batch
//! open at nomination time) already has its marker ahead of the nomination,
//! so the object cannot be freed until each of those batches has been
//! applied.

use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::batch::Batch;
use crate::config::ReclaimConfig;
use crate::counter::{
    is_nominated, tag_word, Generation, Word, GEN_STRIDE, RELEASE_STEP, RETAIN_STEP, TAG_MASK,
};
use crate::handle::Erased;
use crate::station::{self, ThreadGuard};

// ============================================================================
// Shared state
// ============================================================================

/// An event in the submission queue.
enum Submission {
    /// A batch with this start generation was claimed by a mutator.
    Open(Generation),
    /// A completed batch, ready to apply.
    Close(Box<Batch>),
    /// The root mutator returned; drain everything and exit.
    Shutdown,
}

/// State behind the single shared mutex.
struct Shared {
    queue: VecDeque<Submission>,
    pool: Vec<Box<Batch>>,
    generator: Generation,
}

impl Shared {
    fn next_generation(&mut self) -> Generation {
        self.generator += GEN_STRIDE;
        self.generator
    }

    fn take_batch(&mut self, capacity: usize) -> Box<Batch> {
        self.pool
            .pop()
            .unwrap_or_else(|| Box::new(Batch::new(capacity)))
    }
}

/// Counters maintained by the core.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) batches_submitted: AtomicU64,
    pub(crate) batches_applied: AtomicU64,
    pub(crate) rotations: AtomicU64,
    pub(crate) nominations: AtomicU64,
    pub(crate) resurrections: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
    /// Gauge: objects allocated and not yet reclaimed.
    pub(crate) live: AtomicU64,
}

/// Snapshot of the core's counters, taken by [`Runtime::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReclaimStats {
    /// Batches pushed onto the submission queue (rotations + guard exits).
    pub batches_submitted: u64,
    /// Batches the reclaimer has applied.
    pub batches_applied: u64,
    /// Full-batch rotations performed by mutators.
    pub rotations: u64,
    /// Objects nominated for deletion.
    pub nominations: u64,
    /// Nominations cancelled by a later retain.
    pub resurrections: u64,
    /// Objects destroyed and freed.
    pub reclaimed: u64,
    /// Objects currently allocated and not reclaimed.
    pub live_objects: u64,
}

/// Per-`start` context: everything the original kept in process globals.
pub(crate) struct Core {
    shared: Mutex<Shared>,
    ready: Condvar,
    batch_capacity: usize,
    pub(crate) stats: StatCounters,
}

impl Core {
    pub(crate) fn new(config: &ReclaimConfig) -> Self {
        let pool = (0..config.pool_reserve)
            .map(|_| Box::new(Batch::new(config.batch_capacity)))
            .collect();
        Self {
            shared: Mutex::new(Shared {
                queue: VecDeque::new(),
                pool,
                generator: 0,
            }),
            ready: Condvar::new(),
            batch_capacity: config.batch_capacity,
            stats: StatCounters::default(),
        }
    }

    /// Claim a fresh batch for a thread entering a guard scope.
    pub(crate) fn claim(&self) -> Box<Batch> {
        let mut shared = self.shared.lock();
        let generation = shared.next_generation();
        let mut batch = shared.take_batch(self.batch_capacity);
        batch.reset(generation);
        shared.queue.push_back(Submission::Open(generation));
        drop(shared);
        self.ready.notify_one();
        batch
    }

    /// Submit the full batch in `slot` and replace it with a fresh one, all
    /// under one critical section.
    pub(crate) fn rotate(&self, slot: &mut Box<Batch>) {
        let mut shared = self.shared.lock();
        let generation = shared.next_generation();
        let mut fresh = shared.take_batch(self.batch_capacity);
        fresh.reset(generation);
        let closed = std::mem::replace(slot, fresh);
        trace!(
            closed = closed.start_gen(),
            opened = generation,
            "rotating batch"
        );
        shared.queue.push_back(Submission::Close(closed));
        shared.queue.push_back(Submission::Open(generation));
        drop(shared);
        self.stats.rotations.fetch_add(1, Ordering::Relaxed);
        self.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
    }

    /// Submit a departing thread's final batch, partial or not.
    pub(crate) fn submit(&self, batch: Box<Batch>) {
        let mut shared = self.shared.lock();
        shared.queue.push_back(Submission::Close(batch));
        drop(shared);
        self.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
    }

    fn post_shutdown(&self) {
        let mut shared = self.shared.lock();
        shared.queue.push_back(Submission::Shutdown);
        drop(shared);
        self.ready.notify_one();
    }

    fn snapshot(&self) -> ReclaimStats {
        ReclaimStats {
            batches_submitted: self.stats.batches_submitted.load(Ordering::Relaxed),
            batches_applied: self.stats.batches_applied.load(Ordering::Relaxed),
            rotations: self.stats.rotations.load(Ordering::Relaxed),
            nominations: self.stats.nominations.load(Ordering::Relaxed),
            resurrections: self.stats.resurrections.load(Ordering::Relaxed),
            reclaimed: self.stats.reclaimed.load(Ordering::Relaxed),
            live_objects: self.stats.live.load(Ordering::Relaxed),
        }
    }
}

/// Clonable handle on a running core.
///
/// Passed to the root mutator by [`start`]; clone it into any additional
/// mutator threads and bracket each with [`Runtime::guard`].
#[derive(Clone)]
pub struct Runtime {
    core: Arc<Core>,
}

impl Runtime {
    /// Enter a thread guard scope on the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already has an active guard.
    pub fn guard(&self) -> ThreadGuard {
        ThreadGuard::enter(Arc::clone(&self.core))
    }

    /// Submit the current thread's open batch now instead of waiting for it
    /// to fill or for the guard to exit.
    ///
    /// # Panics
    ///
    /// Panics if the current thread has no active guard, or if its guard
    /// belongs to a different runtime.
    pub fn flush(&self) {
        station::flush(&self.core);
    }

    /// Snapshot the core's counters.
    pub fn stats(&self) -> ReclaimStats {
        self.core.snapshot()
    }

    /// Objects currently allocated and not reclaimed.
    pub fn live_objects(&self) -> u64 {
        self.core.stats.live.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Reclaimer
// ============================================================================

/// An entry in the nomination queue: a single totally-ordered sequence of
/// batch markers, deletion-generation tags, and nominated objects.
#[derive(Clone, Copy)]
enum NomEntry {
    /// A batch with this start generation is open or awaiting apply. Draining
    /// stops here: that batch may still carry retains.
    Pending(Generation),
    /// The batch with this start generation has been applied.
    Applied(Generation),
    /// Objects that follow were nominated under this tagged generation word.
    Tag(Word),
    /// A nominated object.
    Object(Erased),
}

/// The single consumer: applies batches, drains nominations, deletes.
struct Reclaimer {
    core: Arc<Core>,
    nom: VecDeque<NomEntry>,
    doomed: Vec<Erased>,
    /// Tag lazily allocated for the current batch apply or delete pass;
    /// zero when none has been needed yet.
    tag: Word,
}

impl Reclaimer {
    fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            nom: VecDeque::new(),
            doomed: Vec::new(),
            tag: 0,
        }
    }

    /// Run until the shutdown sentinel arrives and everything has drained.
    fn run(mut self, mutator: JoinHandle<()>) {
        let core = Arc::clone(&self.core);
        let mut shared = core.shared.lock();
        loop {
            while shared.queue.is_empty() {
                core.ready.wait(&mut shared);
            }
            // First pass the whole queue, inserting the pending marker of
            // every batch opened so far. Only then is it safe to apply: a
            // rotation queues its open event atomically with the close it
            // replaces, so every batch that can hold a retain of an object
            // nominated below already has its marker ahead in the nomination
            // order.
            let mut closed: Vec<Box<Batch>> = Vec::new();
            let mut shutdown = false;
            while let Some(event) = shared.queue.pop_front() {
                match event {
                    Submission::Open(generation) => {
                        self.nom.push_back(NomEntry::Pending(generation));
                    }
                    Submission::Close(batch) => closed.push(batch),
                    Submission::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
            }
            for batch in closed {
                MutexGuard::unlocked(&mut shared, || self.apply(&batch));
                shared.pool.push(batch);
            }
            while !self.doomed.is_empty() {
                MutexGuard::unlocked(&mut shared, || self.delete_pass());
            }
            if shutdown {
                drop(shared);
                let outcome = mutator.join();
                assert!(
                    core.shared.lock().queue.is_empty(),
                    "submission queue not empty at shutdown"
                );
                assert!(self.nom.is_empty(), "nomination queue not empty at shutdown");
                assert!(self.doomed.is_empty(), "to-delete list not empty at shutdown");
                let stats = core.snapshot();
                if stats.live_objects > 0 {
                    warn!(
                        live = stats.live_objects,
                        "objects remain live at shutdown; reference cycles are not collected"
                    );
                }
                info!(
                    applied = stats.batches_applied,
                    reclaimed = stats.reclaimed,
                    resurrections = stats.resurrections,
                    "reclaimer shut down"
                );
                if let Err(payload) = outcome {
                    resume_unwind(payload);
                }
                return;
            }
        }
    }

    /// Apply one batch: increments, then decrements, then flip this batch's
    /// pending marker and drain.
    fn apply(&mut self, batch: &Batch) {
        trace!(
            generation = batch.start_gen(),
            increments = batch.increment_len(),
            decrements = batch.decrement_len(),
            "applying batch"
        );
        self.tag = 0;
        let generation = batch.start_gen();
        for obj in batch.increments() {
            self.apply_delta(obj, RETAIN_STEP, generation);
        }
        for obj in batch.decrements() {
            self.apply_delta(obj, RELEASE_STEP, generation);
        }
        self.mark_applied(generation);
        self.core.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.drain();
    }

    fn apply_delta(&mut self, obj: Erased, delta: Word, generation: Generation) {
        let header = unsafe { obj.as_ref() }.header();
        let word = header.load();
        debug_assert!(
            word & TAG_MASK == 0 || is_nominated(word),
            "queue-marker bits on a counter word"
        );
        if is_nominated(word) {
            // A retain or release landed on a nominated object: the pending
            // nomination is void, and the object restarts at a count of one
            // reference in either direction.
            header.store(delta);
            self.core.stats.resurrections.fetch_add(1, Ordering::Relaxed);
        } else {
            let word = word.wrapping_add(delta);
            header.store(word);
            if word == 0 {
                self.nominate(obj, generation);
            }
        }
    }

    /// Write the current tag into `obj`'s counter and queue it behind the
    /// tag entry, pushing the tag entry itself lazily on first use.
    fn nominate(&mut self, obj: Erased, generation: Generation) {
        if self.tag == 0 {
            self.tag = tag_word(generation);
            self.nom.push_back(NomEntry::Tag(self.tag));
        }
        unsafe { obj.as_ref() }.header().store(self.tag);
        self.nom.push_back(NomEntry::Object(obj));
        self.core.stats.nominations.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_applied(&mut self, generation: Generation) {
        for entry in self.nom.iter_mut() {
            if let NomEntry::Pending(pending) = *entry {
                if pending == generation {
                    *entry = NomEntry::Applied(generation);
                    return;
                }
            }
        }
        unreachable!("no pending marker for generation {generation}");
    }

    /// Walk the nomination queue from the head, moving still-condemned
    /// objects to the to-delete list. Stops at the first pending batch
    /// marker: beyond it, earlier batches may still add retains.
    fn drain(&mut self) {
        let mut tag: Word = 0;
        while let Some(&entry) = self.nom.front() {
            match entry {
                NomEntry::Pending(_) => return,
                NomEntry::Applied(_) => {}
                NomEntry::Tag(word) => tag = word,
                NomEntry::Object(obj) => {
                    let header = unsafe { obj.as_ref() }.header();
                    if header.load() == tag {
                        // Still carrying the same death sentence.
                        header.store(0);
                        self.doomed.push(obj);
                    }
                    // Otherwise the object was resurrected, or re-nominated
                    // under a later tag that will make its own decision.
                }
            }
            self.nom.pop_front();
        }
    }

    /// Destroy one round of condemned objects, then re-drain: destructors
    /// release embedded fields, which may nominate more objects.
    fn delete_pass(&mut self) {
        let victims = std::mem::take(&mut self.doomed);
        self.tag = 0;
        let count = victims.len() as u64;
        {
            let _scope = DestructorScope::enter(&mut *self);
            for victim in victims {
                // Safety: the object was allocated by `Local::alloc` and its
                // count resolved to zero at a fully-applied generation; no
                // handle or queued event references it anymore.
                drop(unsafe { Box::from_raw(victim.as_ptr()) });
            }
        }
        self.core.stats.reclaimed.fetch_add(count, Ordering::Relaxed);
        self.core.stats.live.fetch_sub(count, Ordering::Relaxed);
        debug!(count, "delete pass finished");
        self.drain();
    }

    /// The destructor-side release: applied directly to the counter word,
    /// nominating under a generation allocated fresh for this pass.
    fn direct_release(&mut self, obj: Erased) {
        let header = unsafe { obj.as_ref() }.header();
        let word = header.load();
        if is_nominated(word) {
            header.store(RELEASE_STEP);
            self.core.stats.resurrections.fetch_add(1, Ordering::Relaxed);
        } else {
            let word = word.wrapping_add(RELEASE_STEP);
            header.store(word);
            if word == 0 {
                if self.tag == 0 {
                    let generation = self.core.shared.lock().next_generation();
                    self.tag = tag_word(generation);
                    self.nom.push_back(NomEntry::Tag(self.tag));
                }
                header.store(self.tag);
                self.nom.push_back(NomEntry::Object(obj));
                self.core.stats.nominations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ============================================================================
// Destructor context
// ============================================================================

thread_local! {
    static DESTRUCTOR_CTX: std::cell::Cell<*mut Reclaimer> =
        const { std::cell::Cell::new(std::ptr::null_mut()) };
}

/// Publishes the reclaimer's pass state to field-handle drops for the
/// duration of one delete round.
struct DestructorScope<'a> {
    _reclaimer: std::marker::PhantomData<&'a mut Reclaimer>,
}

impl<'a> DestructorScope<'a> {
    fn enter(reclaimer: &'a mut Reclaimer) -> Self {
        DESTRUCTOR_CTX.with(|ctx| {
            debug_assert!(ctx.get().is_null());
            ctx.set(reclaimer as *mut Reclaimer);
        });
        Self {
            _reclaimer: std::marker::PhantomData,
        }
    }
}

impl Drop for DestructorScope<'_> {
    fn drop(&mut self) {
        DESTRUCTOR_CTX.with(|ctx| ctx.set(std::ptr::null_mut()));
    }
}

/// Release produced by a [`Field`](crate::Field) drop. Legal only while the
/// reclaimer is running an object destructor.
pub(crate) fn reclaimer_release(obj: Erased) {
    let ctx = DESTRUCTOR_CTX.with(|ctx| ctx.get());
    assert!(
        !ctx.is_null(),
        "field release outside the reclaimer's destructor context"
    );
    // Safety: the pointer was published by `DestructorScope::enter` on this
    // thread and is cleared before the borrow it came from ends.
    let reclaimer = unsafe { &mut *ctx };
    reclaimer.direct_release(obj);
}

// ============================================================================
// Entry point
// ============================================================================

/// Run `root` as the root mutator with default configuration.
///
/// See [`start_with_config`].
pub fn start<F>(root: F)
where
    F: FnOnce(Runtime) + Send + 'static,
{
    start_with_config(ReclaimConfig::default(), root);
}

/// Spawn `root` on a fresh mutator thread inside a thread guard, and run the
/// reclaimer loop on the calling thread until the mutator returns and every
/// queue drains.
///
/// All objects allocated during `root` and not kept alive by a reference
/// cycle are destroyed before this returns. A panic in `root` is re-raised
/// here after reclamation completes.
///
/// # Panics
///
/// Panics if `config` fails validation, or re-raises the root mutator's
/// panic.
pub fn start_with_config<F>(config: ReclaimConfig, root: F)
where
    F: FnOnce(Runtime) + Send + 'static,
{
    if let Err(err) = config.validate() {
        panic!("invalid reclaim configuration: {err}");
    }
    let core = Arc::new(Core::new(&config));
    let runtime = Runtime {
        core: Arc::clone(&core),
    };
    let mutator = thread::Builder::new()
        .name("lethe-mutator".into())
        .spawn({
            let runtime = runtime.clone();
            move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let _guard = runtime.guard();
                    root(runtime.clone());
                }));
                // The guard has submitted its batch by now, panic or not.
                runtime.core.post_shutdown();
                if let Err(payload) = outcome {
                    resume_unwind(payload);
                }
            }
        })
        .expect("failed to spawn the root mutator thread");
    Reclaimer::new(core).run(mutator);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Header;
    use crate::handle::{erase, Managed};
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicUsize;

    struct Obj {
        header: Header,
        drops: Arc<AtomicUsize>,
    }

    impl Managed for Obj {
        fn header(&self) -> &Header {
            &self.header
        }
    }

    impl Drop for Obj {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_core() -> Arc<Core> {
        Arc::new(Core::new(&ReclaimConfig {
            batch_capacity: 8,
            pool_reserve: 0,
        }))
    }

    fn alloc_obj(core: &Core, drops: &Arc<AtomicUsize>) -> NonNull<Obj> {
        core.stats.live.fetch_add(1, Ordering::Relaxed);
        NonNull::from(Box::leak(Box::new(Obj {
            header: Header::new(),
            drops: Arc::clone(drops),
        })))
    }

    #[test]
    fn test_generations_increase_by_stride() {
        let core = test_core();
        let mut batch = core.claim();
        assert_eq!(batch.start_gen(), GEN_STRIDE);
        core.rotate(&mut batch);
        assert_eq!(batch.start_gen(), 2 * GEN_STRIDE);
        core.rotate(&mut batch);
        assert_eq!(batch.start_gen(), 3 * GEN_STRIDE);
        assert_eq!(core.snapshot().rotations, 2);
    }

    #[test]
    fn test_apply_nominates_and_reclaims() {
        let core = test_core();
        let mut reclaimer = Reclaimer::new(Arc::clone(&core));
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = alloc_obj(&core, &drops);

        let mut first = core.claim();
        reclaimer.nom.push_back(NomEntry::Pending(first.start_gen()));
        first.push_inc(erase(ptr));
        reclaimer.apply(&first);
        assert_eq!(unsafe { ptr.as_ref() }.header.load(), RETAIN_STEP);
        assert!(reclaimer.doomed.is_empty());

        let mut second = core.claim();
        reclaimer.nom.push_back(NomEntry::Pending(second.start_gen()));
        second.push_dec(erase(ptr));
        reclaimer.apply(&second);
        // Nominated, drained, and cleared back to zero pending deletion.
        assert_eq!(reclaimer.doomed.len(), 1);
        assert_eq!(unsafe { ptr.as_ref() }.header.load(), 0);

        reclaimer.delete_pass();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(reclaimer.nom.is_empty());
        assert!(reclaimer.doomed.is_empty());
        assert_eq!(core.snapshot().reclaimed, 1);
        assert_eq!(core.snapshot().live_objects, 0);
    }

    #[test]
    fn test_pending_batch_blocks_deletion_and_retain_resurrects() {
        let core = test_core();
        let mut reclaimer = Reclaimer::new(Arc::clone(&core));
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = alloc_obj(&core, &drops);

        // Two batches open at once; the second holds a retain of the object
        // the first drives to zero.
        let mut first = core.claim();
        let mut second = core.claim();
        reclaimer.nom.push_back(NomEntry::Pending(first.start_gen()));
        reclaimer.nom.push_back(NomEntry::Pending(second.start_gen()));

        first.push_inc(erase(ptr));
        first.push_dec(erase(ptr));
        reclaimer.apply(&first);
        // Nominated, but blocked behind the second batch's pending marker.
        assert!(reclaimer.doomed.is_empty());
        assert!(is_nominated(unsafe { ptr.as_ref() }.header.load()));

        second.push_inc(erase(ptr));
        reclaimer.apply(&second);
        assert_eq!(unsafe { ptr.as_ref() }.header.load(), RETAIN_STEP);
        assert!(reclaimer.doomed.is_empty());
        assert!(reclaimer.nom.is_empty());
        assert_eq!(core.snapshot().resurrections, 1);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }

    #[test]
    fn test_stale_nomination_is_discarded() {
        let core = test_core();
        let mut reclaimer = Reclaimer::new(Arc::clone(&core));
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = alloc_obj(&core, &drops);

        let mut first = core.claim();
        let mut second = core.claim();
        let third = core.claim();
        reclaimer.nom.push_back(NomEntry::Pending(first.start_gen()));
        reclaimer.nom.push_back(NomEntry::Pending(second.start_gen()));
        reclaimer.nom.push_back(NomEntry::Pending(third.start_gen()));

        // First batch nominates; second resurrects and drives back to zero,
        // re-nominating under its own tag; third just applies empty.
        first.push_inc(erase(ptr));
        first.push_dec(erase(ptr));
        reclaimer.apply(&first);
        second.push_inc(erase(ptr));
        second.push_dec(erase(ptr));
        reclaimer.apply(&second);
        assert!(is_nominated(unsafe { ptr.as_ref() }.header.load()));
        reclaimer.apply(&third);

        // The stale entry from the first nomination was discarded; only the
        // second nomination condemned the object.
        assert_eq!(reclaimer.doomed.len(), 1);
        reclaimer.delete_pass();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(core.snapshot().nominations, 2);
    }
}
