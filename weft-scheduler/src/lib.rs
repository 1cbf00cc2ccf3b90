//! Per-worker scheduler: run queues partitioned by priority, a staged
//! queue for newly created fibers, a terminated queue awaiting reclamation,
//! strict-priority selection, work stealing with a rotating victim cursor,
//! and idle backoff.
//!
//! One [`Scheduler`] is owned by each worker in `weft-pool`. Schedulers
//! never talk to each other directly; the pool wires up peer [`Stealer`]
//! handles once, after every worker's queues exist, via
//! [`Scheduler::install_peers`].
//!
//! `crossbeam_deque::Worker<T>` is `Send` but not `Sync` — it is a
//! single-owner handle and the crate forbids calling its methods from any
//! thread but the one that created it. `Scheduler` is shared across threads
//! behind `Arc` (every `schedule`/`Rescheduler::reschedule` call can come
//! from a different worker, a sender continuation, or the timer thread), so
//! no `Worker` ever lives inside it. The split is:
//!
//! - [`Scheduler`] (the `Arc`-shared, `Send + Sync` half) holds one
//!   [`crossbeam_deque::Injector`] per priority plus one for staged fibers —
//!   the cross-thread mailbox any caller can push into — and a [`Stealer`]
//!   for each of this worker's own local queues, so `is_quiescent` and peer
//!   stealing can observe queue occupancy from any thread.
//! - [`WorkerQueues`] (the thread-local, `Send`-but-not-`Sync` half) holds
//!   the actual `Worker<Fiber>` per priority plus staged. It is created
//!   alongside its `Scheduler` by [`Scheduler::new`] and must then live only
//!   on the one OS thread that drives [`Scheduler::wait_or_add_new`] for
//!   that scheduler — moved into the worker's thread closure in
//!   `weft-pool`, never stored behind a shared `Arc`.

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_error::WeftError;
use weft_fiber::stack::{StackPool, StackSizeClass};
use weft_fiber::{Fiber, FiberState, Priority, SpawnOptions, StackRecycler};
use weft_sync::Rescheduler;

/// Priority classes in array-index order, matching [`Priority`]'s own
/// declaration order — `Low, Normal, Boost, High, Bound`.
const PRIORITY_COUNT: usize = 5;

fn priority_index(p: Priority) -> usize {
    match p {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::Boost => 2,
        Priority::High => 3,
        Priority::Bound => 4,
    }
}

/// Strict-priority selection order for a worker's own queues. `Bound` is
/// checked first: those fibers are pinned (never stolen by a peer), so
/// nothing else will ever pick them up if their own worker defers them.
const SELECTION_ORDER: [Priority; PRIORITY_COUNT] = [
    Priority::Bound,
    Priority::High,
    Priority::Boost,
    Priority::Normal,
    Priority::Low,
];

/// Where a freshly created fiber should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialState {
    /// Promoted to a run queue on the next staging pass.
    Pending,
    /// Parked on the suspended list; only an explicit [`Scheduler::resume_suspended`]
    /// moves it to a run queue.
    Suspended,
}

/// Tracing-only annotation for why a fiber was handed to [`Scheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleHint {
    New,
    Requeued,
    Resumed,
    Stolen,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// LIFO (default) vs FIFO ordering within a priority class.
    pub fifo: bool,
    pub add_new_min: usize,
    pub add_new_max: usize,
    pub min_tasks_to_steal_pending: usize,
    pub min_tasks_to_steal_staged: usize,
    pub max_terminated: usize,
    pub max_delete_count: usize,
    pub idle_loop_max: u32,
    pub idle_backoff_ms_max: u64,
    pub page_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            fifo: false,
            add_new_min: 1,
            add_new_max: 32,
            min_tasks_to_steal_pending: 2,
            min_tasks_to_steal_staged: 2,
            max_terminated: 256,
            max_delete_count: 64,
            idle_loop_max: 64,
            idle_backoff_ms_max: 10,
            page_size: 4096,
        }
    }
}

/// What a stealer needs to reach into a peer's queues. Cloning is cheap —
/// `Stealer<T>` is a thin handle over the deque's shared buffer.
#[derive(Clone)]
pub struct PeerHandle {
    id: usize,
    pending: Vec<Stealer<Fiber>>,
    staged: Stealer<Fiber>,
}

/// The thread-local half of a [`Scheduler`]: the actual `Worker<Fiber>`
/// deques. `Send` (it can be handed to the worker thread once, at spawn
/// time) but not `Sync` — never put this behind `Arc` or reach it from more
/// than one thread. Every [`Scheduler`] method that touches these queues
/// (`wait_or_add_new` and the private helpers it calls) takes `&WorkerQueues`
/// explicitly so the borrow checker enforces single-thread access.
pub struct WorkerQueues {
    pending: Vec<Deque<Fiber>>,
    staged: Deque<Fiber>,
}

impl WorkerQueues {
    fn new(fifo: bool) -> (WorkerQueues, Vec<Stealer<Fiber>>, Stealer<Fiber>) {
        let make_deque = || if fifo { Deque::new_fifo() } else { Deque::new_lifo() };
        let pending: Vec<Deque<Fiber>> = (0..PRIORITY_COUNT).map(|_| make_deque()).collect();
        let staged = make_deque();
        let pending_stealers = pending.iter().map(|d| d.stealer()).collect();
        let staged_stealer = staged.stealer();
        (WorkerQueues { pending, staged }, pending_stealers, staged_stealer)
    }
}

impl PeerHandle {
    pub fn id(&self) -> usize {
        self.id
    }
}

/// One step of [`Scheduler::wait_or_add_new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Ran,
    Stolen,
    Idle,
    Parked,
}

struct Recycler {
    pool: Arc<StackPool>,
}

impl StackRecycler for Recycler {
    fn recycle(&self, class: StackSizeClass, stack: weft_fiber::stack::Stack) {
        self.pool.release(class, stack);
    }
}

pub struct Scheduler {
    id: usize,
    config: SchedulerConfig,
    stack_pool: Arc<StackPool>,
    recycler: Arc<dyn StackRecycler>,
    /// Cross-thread mailbox: anything calling `schedule`/`reschedule`/
    /// `create_thread` from a thread other than this scheduler's own worker
    /// lands here. Drained into the owning thread's local `WorkerQueues` by
    /// `promote_staged`/`next_own`. `Injector<T>` is `Send + Sync`.
    injectors: Vec<Injector<Fiber>>,
    staged_injector: Injector<Fiber>,
    /// `Stealer` handles onto this worker's own local queues (the
    /// `WorkerQueues` handed back from `new`). `Stealer<T>` is `Send + Sync`
    /// unlike `Worker<T>`, so these are safe to hold here and to hand to
    /// peers via [`PeerHandle`] and [`peer_handle`](Scheduler::peer_handle).
    pending_stealers: Vec<Stealer<Fiber>>,
    staged_stealer: Stealer<Fiber>,
    suspended: parking_lot::Mutex<Vec<Fiber>>,
    terminated: parking_lot::Mutex<VecDeque<Fiber>>,
    peers: parking_lot::Mutex<Vec<PeerHandle>>,
    victim_cursor: AtomicUsize,
    idle_iters: AtomicU32,
    /// Parks the worker's own OS thread — distinct from `weft-sync`'s
    /// `CondVar`, which suspends a *fiber* and requires one to be running.
    /// An idle worker is between fibers, so it blocks here directly.
    park_mutex: parking_lot::Mutex<()>,
    park_cv: parking_lot::Condvar,
    steals: AtomicU64,
}

impl Scheduler {
    /// Builds the scheduler together with the `WorkerQueues` half that must
    /// stay on whichever single thread calls `wait_or_add_new` for it — the
    /// pool moves it into that worker's thread closure; a test driving the
    /// scheduler directly just keeps it in a local variable.
    pub fn new(id: usize, config: SchedulerConfig) -> (Arc<Scheduler>, WorkerQueues) {
        let stack_pool = Arc::new(StackPool::new());
        let recycler: Arc<dyn StackRecycler> = Arc::new(Recycler {
            pool: Arc::clone(&stack_pool),
        });
        let (queues, pending_stealers, staged_stealer) = WorkerQueues::new(config.fifo);
        let injectors = (0..PRIORITY_COUNT).map(|_| Injector::new()).collect();
        let scheduler = Arc::new(Scheduler {
            id,
            config,
            stack_pool,
            recycler,
            injectors,
            staged_injector: Injector::new(),
            pending_stealers,
            staged_stealer,
            suspended: parking_lot::Mutex::new(Vec::new()),
            terminated: parking_lot::Mutex::new(VecDeque::new()),
            peers: parking_lot::Mutex::new(Vec::new()),
            victim_cursor: AtomicUsize::new(0),
            idle_iters: AtomicU32::new(0),
            park_mutex: parking_lot::Mutex::new(()),
            park_cv: parking_lot::Condvar::new(),
            steals: AtomicU64::new(0),
        });
        (scheduler, queues)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stack_pool_len(&self, class: StackSizeClass) -> usize {
        self.stack_pool.len(class)
    }

    pub fn steal_count(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    /// Publish every other worker's stealers to this one. Called once by the
    /// pool after all schedulers in a run exist.
    pub fn install_peers(&self, peers: Vec<PeerHandle>) {
        *self.peers.lock() = peers;
    }

    pub fn peer_handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id,
            pending: self.pending_stealers.clone(),
            staged: self.staged_stealer.clone(),
        }
    }

    /// Allocate or recycle a fiber and place it per `initial`. Returns its
    /// handle; `out_of_memory` propagates from stack allocation.
    pub fn create_thread(
        &self,
        entry: impl FnOnce() + Send + 'static,
        priority: Priority,
        stack_class: StackSizeClass,
        initial: InitialState,
    ) -> Result<Fiber, WeftError> {
        let opts = SpawnOptions {
            priority,
            stack_class,
            page_size: self.config.page_size,
        };
        let fiber = Fiber::spawn(entry, opts, &self.stack_pool)?;
        fiber.set_recycler(Arc::clone(&self.recycler));
        match initial {
            // Callers of `create_thread` are routinely on a different
            // thread than the one driving this scheduler's `WorkerQueues`
            // (e.g. a test or a sender submitting onto `pool.scheduler(i)`
            // from the main thread) — go through the shared injector rather
            // than touching a `Worker` we don't own.
            InitialState::Pending => self.staged_injector.push(fiber.clone()),
            InitialState::Suspended => self.suspended.lock().push(fiber.clone()),
        }
        Ok(fiber)
    }

    /// Move a suspended-at-creation fiber onto its priority run queue.
    pub fn resume_suspended(&self, fiber: &Fiber) {
        let mut s = self.suspended.lock();
        if let Some(pos) = s.iter().position(|f| f.id() == fiber.id()) {
            let fiber = s.remove(pos);
            drop(s);
            self.schedule(fiber, fiber.priority(), ScheduleHint::Resumed);
        }
    }

    /// Insert `fiber` into the run queue for `priority` and wake this worker
    /// if it was parked idle. Callable from any thread — this is the
    /// `Rescheduler` seam other workers, sender continuations, and the timer
    /// facility use to hand a fiber back to its owning scheduler, so it only
    /// ever touches the shared injector, never the thread-local `Worker`.
    pub fn schedule(&self, fiber: Fiber, priority: Priority, hint: ScheduleHint) {
        tracing::trace!(worker = self.id, fiber = fiber.id(), ?hint, "schedule");
        self.injectors[priority_index(priority)].push(fiber);
        self.idle_iters.store(0, Ordering::SeqCst);
        self.wake_if_parked();
    }

    fn wake_if_parked(&self) {
        let _guard = self.park_mutex.lock();
        self.park_cv.notify_one();
    }

    /// Drop our reference to an exited fiber, recycling its stack if we held
    /// the last strong handle.
    pub fn destroy_thread(&self, fiber: Fiber) {
        debug_assert_eq!(fiber.state(), FiberState::Exited);
        drop(fiber);
    }

    /// Drain up to `add_new_max` newly created fibers out of the shared
    /// staged injector and onto this worker's own local priority queues.
    fn promote_staged(&self, queues: &WorkerQueues) {
        let mut promoted = 0;
        while promoted < self.config.add_new_max {
            match self.staged_injector.steal() {
                Steal::Success(fiber) => {
                    let priority = fiber.priority();
                    queues.pending[priority_index(priority)].push(fiber);
                    promoted += 1;
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    /// This worker's own local queue first (the fast, single-owner path),
    /// then the shared injector other threads may have pushed into since the
    /// last `promote_staged`/`next_own` pass.
    fn next_own(&self, queues: &WorkerQueues) -> Option<Fiber> {
        for priority in SELECTION_ORDER {
            let idx = priority_index(priority);
            if let Some(fiber) = queues.pending[idx].pop() {
                return Some(fiber);
            }
            loop {
                match self.injectors[idx].steal() {
                    Steal::Success(fiber) => return Some(fiber),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    fn next_victim_index(&self, peer_count: usize) -> usize {
        self.victim_cursor.fetch_add(1, Ordering::Relaxed) % peer_count
    }

    /// Try every peer once, starting from the rotating cursor, skipping
    /// `Bound`-priority queues (never stolen).
    fn steal_once(&self) -> Option<Fiber> {
        let peers = self.peers.lock();
        if peers.is_empty() {
            return None;
        }
        let start = self.next_victim_index(peers.len());
        for offset in 0..peers.len() {
            let peer = &peers[(start + offset) % peers.len()];
            for priority in SELECTION_ORDER {
                if priority == Priority::Bound {
                    continue;
                }
                let idx = priority_index(priority);
                let stealer = &peer.pending[idx];
                if stealer.len() < self.config.min_tasks_to_steal_pending {
                    continue;
                }
                if let crossbeam_deque::Steal::Success(fiber) = stealer.steal() {
                    return Some(fiber);
                }
            }
            if peer.staged.len() >= self.config.min_tasks_to_steal_staged {
                if let crossbeam_deque::Steal::Success(fiber) = peer.staged.steal() {
                    return Some(fiber);
                }
            }
        }
        None
    }

    fn sweep_terminated(&self) {
        let mut terminated = self.terminated.lock();
        if terminated.len() <= self.config.max_terminated {
            return;
        }
        let mut deleted = 0;
        while deleted < self.config.max_delete_count {
            match terminated.pop_front() {
                Some(fiber) => {
                    self.destroy_thread(fiber);
                    deleted += 1;
                }
                None => break,
            }
        }
    }

    /// Run `fiber` until its next yield or exit and file it accordingly:
    /// `Ready` goes back on its priority queue, `Exited` to the terminated
    /// queue, `Suspended` is left alone — whatever suspended it (a condvar,
    /// a timer) owns the only remaining reference until it reschedules.
    fn run_fiber(&self, fiber: Fiber) {
        fiber.invoke();
        match fiber.state() {
            FiberState::Ready => self.schedule(fiber, fiber.priority(), ScheduleHint::Requeued),
            FiberState::Exited => self.terminated.lock().push_back(fiber),
            FiberState::Suspended => {}
            FiberState::Running => unreachable!("fiber still Running after invoke() returned"),
        }
    }

    fn park(&self) {
        let mut guard = self.park_mutex.lock();
        let backoff_ms = self.idle_backoff_ms();
        let _ = self
            .park_cv
            .wait_for(&mut guard, Duration::from_millis(backoff_ms));
    }

    fn idle_backoff_ms(&self) -> u64 {
        let iters = self.idle_iters.load(Ordering::Relaxed);
        let over = iters.saturating_sub(self.config.idle_loop_max);
        let doubled = 1u64.saturating_shl(over.min(16));
        doubled.min(self.config.idle_backoff_ms_max).max(1)
    }

    /// One scheduling step, meant to be called in a tight loop by the
    /// worker's own OS thread. Promotes staged fibers, runs the next
    /// runnable one, falls back to stealing, and parks with exponential
    /// backoff once `idle_loop_max` consecutive empty steps have passed.
    ///
    /// `queues` must be the `WorkerQueues` this scheduler was created with
    /// (see [`Scheduler::new`]) and must never be shared with another
    /// thread — only the one thread driving this scheduler's loop may call
    /// this method.
    pub fn wait_or_add_new(&self, queues: &WorkerQueues) -> StepOutcome {
        self.promote_staged(queues);
        if let Some(fiber) = self.next_own(queues) {
            self.idle_iters.store(0, Ordering::SeqCst);
            self.run_fiber(fiber);
            self.sweep_terminated();
            return StepOutcome::Ran;
        }
        if let Some(fiber) = self.steal_once() {
            self.steals.fetch_add(1, Ordering::Relaxed);
            self.idle_iters.store(0, Ordering::SeqCst);
            self.run_fiber(fiber);
            self.sweep_terminated();
            return StepOutcome::Stolen;
        }
        let iters = self.idle_iters.fetch_add(1, Ordering::SeqCst) + 1;
        if iters >= self.config.idle_loop_max {
            self.park();
            return StepOutcome::Parked;
        }
        StepOutcome::Idle
    }

    /// True once no worker-owned queue (pending, staged, or either's shared
    /// injector mailbox) holds runnable work — used by `weft-pool`'s
    /// `wait()`. Callable from any thread: it only reads through `Stealer`/
    /// `Injector`, never the thread-local `Worker` half.
    pub fn is_quiescent(&self) -> bool {
        self.staged_stealer.is_empty()
            && self.staged_injector.is_empty()
            && SELECTION_ORDER
                .iter()
                .all(|p| self.pending_stealers[priority_index(*p)].is_empty() && self.injectors[priority_index(*p)].is_empty())
    }
}

impl Rescheduler for Scheduler {
    fn reschedule(&self, fiber: Fiber) {
        let priority = fiber.priority();
        self.schedule(fiber, priority, ScheduleHint::Resumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Test helper: each scheduler's `WorkerQueues` stays local to this one
    /// test thread (which plays the role of both schedulers' "owning
    /// worker"), matching the single-thread-driver contract `wait_or_add_new`
    /// requires in production.
    fn two_schedulers() -> (Arc<Scheduler>, WorkerQueues, Arc<Scheduler>, WorkerQueues) {
        let cfg = SchedulerConfig {
            min_tasks_to_steal_pending: 1,
            min_tasks_to_steal_staged: 1,
            idle_loop_max: 2,
            ..SchedulerConfig::default()
        };
        let (a, aq) = Scheduler::new(0, cfg);
        let (b, bq) = Scheduler::new(1, cfg);
        a.install_peers(vec![b.peer_handle()]);
        b.install_peers(vec![a.peer_handle()]);
        (a, aq, b, bq)
    }

    #[test]
    fn schedule_and_run_exits_to_terminated() {
        let (a, aq, _b, _bq) = two_schedulers();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let fiber = a
            .create_thread(
                move || {
                    ran2.fetch_add(1, Ordering::SeqCst);
                },
                Priority::Normal,
                StackSizeClass::Small,
                InitialState::Pending,
            )
            .unwrap();
        assert_eq!(a.wait_or_add_new(&aq), StepOutcome::Ran);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Exited);
        assert!(a.is_quiescent());
    }

    #[test]
    fn quiescent_after_all_fibers_exit() {
        let (a, aq, _b, _bq) = two_schedulers();
        for _ in 0..10 {
            a.create_thread(|| {}, Priority::Low, StackSizeClass::Small, InitialState::Pending)
                .unwrap();
        }
        for _ in 0..20 {
            a.wait_or_add_new(&aq);
        }
        assert!(a.is_quiescent());
    }

    #[test]
    fn strict_priority_runs_high_before_low() {
        let (a, aq, _b, _bq) = two_schedulers();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        a.create_thread(
            move || o1.lock().push("low"),
            Priority::Low,
            StackSizeClass::Small,
            InitialState::Pending,
        )
        .unwrap();
        let o2 = Arc::clone(&order);
        a.create_thread(
            move || o2.lock().push("high"),
            Priority::High,
            StackSizeClass::Small,
            InitialState::Pending,
        )
        .unwrap();
        a.wait_or_add_new(&aq);
        a.wait_or_add_new(&aq);
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[test]
    fn bound_priority_fiber_is_never_stolen() {
        let (a, aq, b, bq) = two_schedulers();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        a.create_thread(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            Priority::Bound,
            StackSizeClass::Small,
            InitialState::Pending,
        )
        .unwrap();
        a.promote_staged(&aq);
        // b has nothing of its own; repeated steps should never find a's
        // bound-priority fiber to steal.
        for _ in 0..5 {
            b.wait_or_add_new(&bq);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(a.wait_or_add_new(&aq), StepOutcome::Ran);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn work_stealing_runs_fiber_on_peer() {
        let (a, aq, b, bq) = two_schedulers();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        a.create_thread(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            Priority::Normal,
            StackSizeClass::Small,
            InitialState::Pending,
        )
        .unwrap();
        a.promote_staged(&aq);
        assert_eq!(b.wait_or_add_new(&bq), StepOutcome::Stolen);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(b.steal_count(), 1);
    }

    use proptest::prelude::*;

    proptest::proptest! {
        /// After enough steps to drain any number of freshly staged fibers,
        /// the pending + staged queues are empty.
        #[test]
        fn quiescent_after_any_fiber_count(n in 0usize..64) {
            let (a, aq, _b, _bq) = two_schedulers();
            for _ in 0..n {
                a.create_thread(|| {}, Priority::Normal, StackSizeClass::Small, InitialState::Pending)
                    .unwrap();
            }
            for _ in 0..(n * 2 + 4) {
                a.wait_or_add_new(&aq);
            }
            prop_assert!(a.is_quiescent());
        }
    }
}
