//! Thread pool: owns a fixed vector of workers, each a (OS thread,
//! scheduler, PU mask) triple, and drives the pool's logical state machine
//! through `run`/`suspend`/`resume`/`stop`/`wait`/`finalize`.
//!
//! Signal handling and startup/shutdown hooks live one layer up, in
//! `weft-runtime` — this crate only knows how to spawn, bind, park, and
//! join workers.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use weft_error::{weft_error, ErrorKind, WeftError};
use weft_mask::PuMask;
use weft_scheduler::{Scheduler, SchedulerConfig, WorkerQueues};
use weft_topology::Topology;

/// The pool's logical state. The final `stopped` reached after a `stop()`
/// call is just `Stopped` reached a second time — there is no distinct
/// variant for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Initialized,
    Starting,
    Running,
    Suspending,
    Suspended,
    Resuming,
    Stopping,
}

impl PoolState {
    fn name(self) -> &'static str {
        match self {
            PoolState::Stopped => "stopped",
            PoolState::Initialized => "initialized",
            PoolState::Starting => "starting",
            PoolState::Running => "running",
            PoolState::Suspending => "suspending",
            PoolState::Suspended => "suspended",
            PoolState::Resuming => "resuming",
            PoolState::Stopping => "stopping",
        }
    }
}

struct SharedState {
    state: Mutex<PoolState>,
    cv: Condvar,
    arrived: AtomicUsize,
    stop_requested: AtomicBool,
    finalize_requested: AtomicBool,
}

/// A fixed-size pool of worker OS threads, each running a `weft-scheduler`
/// `Scheduler` pinned to a PU mask.
pub struct Pool {
    shared: Arc<SharedState>,
    schedulers: Vec<Arc<Scheduler>>,
    /// Each worker's `WorkerQueues` — the thread-local half of its
    /// `Scheduler` that must never be shared across threads (see
    /// `weft-scheduler`'s module docs). Built alongside the schedulers in
    /// `new`, taken out one by one and moved into the owning worker's
    /// thread closure by `run`.
    worker_queues: Mutex<Vec<Option<WorkerQueues>>>,
    masks: Vec<PuMask>,
    topology: Arc<Topology>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// `masks[i]` is worker `i`'s affinity mask (from `weft-affinity`); an
    /// empty mask means "no affinity" (affinity plan `"none"`).
    pub fn new(topology: Arc<Topology>, masks: Vec<PuMask>, config: SchedulerConfig) -> Self {
        let built: Vec<(Arc<Scheduler>, WorkerQueues)> =
            masks.iter().enumerate().map(|(i, _)| Scheduler::new(i, config)).collect();
        let schedulers: Vec<Arc<Scheduler>> = built.iter().map(|(s, _)| Arc::clone(s)).collect();
        let worker_queues: Vec<Option<WorkerQueues>> =
            built.into_iter().map(|(_, q)| Some(q)).collect();
        for (i, scheduler) in schedulers.iter().enumerate() {
            let peers = schedulers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.peer_handle())
                .collect();
            scheduler.install_peers(peers);
        }
        Pool {
            shared: Arc::new(SharedState {
                state: Mutex::new(PoolState::Initialized),
                cv: Condvar::new(),
                arrived: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                finalize_requested: AtomicBool::new(false),
            }),
            schedulers,
            worker_queues: Mutex::new(worker_queues),
            masks,
            topology,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.schedulers.len()
    }

    pub fn scheduler(&self, worker: usize) -> &Arc<Scheduler> {
        &self.schedulers[worker]
    }

    pub fn state(&self) -> PoolState {
        *self.shared.state.lock()
    }

    /// `stopped → starting → running`: spawn one OS thread per worker, bind
    /// it to its PU mask, and enter the scheduling loop.
    pub fn run(&self) -> Result<(), WeftError> {
        {
            let mut state = self.shared.state.lock();
            if *state != PoolState::Initialized && *state != PoolState::Stopped {
                return Err(weft_error!(
                    ErrorKind::InvalidStatus,
                    "Pool::run called in state {}",
                    state.name()
                ));
            }
            *state = PoolState::Starting;
        }
        let mut workers = self.workers.lock();
        let mut worker_queues = self.worker_queues.lock();
        for (i, scheduler) in self.schedulers.iter().enumerate() {
            let scheduler = Arc::clone(scheduler);
            let queues = worker_queues[i]
                .take()
                .expect("Pool::run called twice without an intervening stop()");
            let topology = Arc::clone(&self.topology);
            let mask = self.masks[i].clone();
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .spawn(move || worker_loop(i, topology, mask, scheduler, queues, shared))
                .expect("failed to spawn weft worker thread");
            workers.push(handle);
        }
        *self.shared.state.lock() = PoolState::Running;
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Flip a latch every worker checks at the top of its loop; blocks the
    /// caller until every worker has reached it and the state advances to
    /// `Suspended`.
    pub fn suspend(&self) -> Result<(), WeftError> {
        let mut state = self.shared.state.lock();
        if *state != PoolState::Running {
            return Err(weft_error!(
                ErrorKind::InvalidStatus,
                "Pool::suspend called in state {}",
                state.name()
            ));
        }
        *state = PoolState::Suspending;
        self.shared.arrived.store(0, Ordering::SeqCst);
        self.shared.cv.notify_all();
        let worker_count = self.schedulers.len();
        while self.shared.arrived.load(Ordering::SeqCst) < worker_count {
            self.shared.cv.wait(&mut state);
        }
        *state = PoolState::Suspended;
        self.shared.cv.notify_all();
        Ok(())
    }

    /// The inverse of [`Pool::suspend`].
    pub fn resume(&self) -> Result<(), WeftError> {
        let mut state = self.shared.state.lock();
        if *state != PoolState::Suspended {
            return Err(weft_error!(
                ErrorKind::InvalidStatus,
                "Pool::resume called in state {}",
                state.name()
            ));
        }
        *state = PoolState::Resuming;
        self.shared.cv.notify_all();
        *state = PoolState::Running;
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Blocks until no worker has runnable work (pending + staged queues
    /// empty everywhere).
    pub fn wait(&self) {
        loop {
            if self.schedulers.iter().all(|s| s.is_quiescent()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Callable from anywhere; the next time each worker finds itself idle
    /// with nothing left to run, it exits its loop instead of continuing.
    pub fn finalize(&self) {
        self.shared.finalize_requested.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
    }

    /// Permitted only from outside the pool. Forces every worker to exit
    /// immediately (regardless of pending work) and joins them.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock();
            *state = PoolState::Stopping;
            self.shared.cv.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        *self.shared.state.lock() = PoolState::Stopped;
    }
}

fn worker_loop(
    id: usize,
    topology: Arc<Topology>,
    mask: PuMask,
    scheduler: Arc<Scheduler>,
    queues: WorkerQueues,
    shared: Arc<SharedState>,
) {
    if mask.any() {
        if let Err(e) = topology.bind(&mask) {
            tracing::warn!(worker = id, error = %e.render(0), "failed to bind worker affinity");
        }
    }
    loop {
        if !top_of_loop(&shared) {
            return;
        }
        if shared.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        if shared.finalize_requested.load(Ordering::SeqCst) && scheduler.is_quiescent() {
            return;
        }
        scheduler.wait_or_add_new(&queues);
    }
}

/// Handles the suspend/resume rendezvous; returns `false` if the pool is
/// stopping and this worker should exit.
fn top_of_loop(shared: &Arc<SharedState>) -> bool {
    let mut state = shared.state.lock();
    match *state {
        PoolState::Stopping => false,
        PoolState::Suspending => {
            shared.arrived.fetch_add(1, Ordering::SeqCst);
            shared.cv.notify_all();
            while matches!(*state, PoolState::Suspending | PoolState::Suspended) {
                shared.cv.wait(&mut state);
            }
            !matches!(*state, PoolState::Stopping)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use weft_fiber::stack::StackSizeClass;
    use weft_fiber::Priority;
    use weft_scheduler::InitialState;

    fn test_pool(workers: usize) -> Pool {
        let topology = Arc::new(Topology::discover());
        let masks = (0..workers).map(|_| PuMask::empty()).collect();
        Pool::new(topology, masks, SchedulerConfig::default())
    }

    #[test]
    fn run_executes_submitted_work_then_stop_joins_cleanly() {
        let pool = test_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.run().unwrap();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.scheduler(0)
                .create_thread(
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    Priority::Normal,
                    StackSizeClass::Small,
                    InitialState::Pending,
                )
                .unwrap();
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.stop();
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn suspend_then_resume_round_trips() {
        let pool = test_pool(2);
        pool.run().unwrap();
        pool.suspend().unwrap();
        assert_eq!(pool.state(), PoolState::Suspended);
        pool.resume().unwrap();
        assert_eq!(pool.state(), PoolState::Running);
        pool.stop();
    }

    #[test]
    fn finalize_drains_then_workers_exit_on_their_own() {
        let pool = test_pool(1);
        pool.run().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        pool.scheduler(0)
            .create_thread(
                move || {
                    ran2.fetch_add(1, Ordering::SeqCst);
                },
                Priority::Normal,
                StackSizeClass::Small,
                InitialState::Pending,
            )
            .unwrap();
        pool.wait();
        pool.finalize();
        pool.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    use proptest::prelude::*;

    proptest::proptest! {
        /// For any worker count and any number of fibers submitted across
        /// them, `wait()` returning means every
        /// scheduler's pending + staged queues are empty.
        #[test]
        fn wait_drains_every_worker_for_any_fan_out(
            workers in 1usize..4,
            fibers_per_worker in 0usize..20,
        ) {
            let pool = test_pool(workers);
            let counter = Arc::new(AtomicUsize::new(0));
            pool.run().unwrap();
            for w in 0..workers {
                for _ in 0..fibers_per_worker {
                    let counter = Arc::clone(&counter);
                    pool.scheduler(w)
                        .create_thread(
                            move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            },
                            Priority::Normal,
                            StackSizeClass::Small,
                            InitialState::Pending,
                        )
                        .unwrap();
                }
            }
            pool.wait();
            prop_assert!(pool.schedulers.iter().all(|s| s.is_quiescent()));
            prop_assert_eq!(
                counter.load(Ordering::SeqCst),
                workers * fibers_per_worker
            );
            pool.stop();
        }
    }
}
