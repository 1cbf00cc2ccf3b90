//! Cooperative synchronization primitives: a spinlock with optional
//! "no lock held while suspended" tracking, a condition variable whose
//! waiters suspend the calling fiber rather than the OS thread, and
//! binary/counting semaphores built on top of it.
//!
//! Nothing here knows how to put a fiber back on a run queue — that's the
//! scheduler's job. Callers hand in an [`Rescheduler`] (the scheduler
//! implements it) so this crate stays below `weft-scheduler` in the
//! dependency graph.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_error::{weft_error, ErrorKind, WeftError};
use weft_fiber::{self as fiber, Fiber, FiberState};

/// Something that can put a woken fiber back on a scheduler's run queue.
/// Implemented by `weft-scheduler`'s worker handle.
pub trait Rescheduler: Send + Sync {
    fn reschedule(&self, fiber: Fiber);
}

static GLOBAL_LOCK_TRACKING: AtomicBool = AtomicBool::new(true);

/// Flip lock tracking off process-wide — the `--weft:no-lock-detection`
/// flag wires into this.
pub fn set_global_lock_tracking(enabled: bool) {
    GLOBAL_LOCK_TRACKING.store(enabled, Ordering::SeqCst);
}

pub fn global_lock_tracking_enabled() -> bool {
    GLOBAL_LOCK_TRACKING.load(Ordering::SeqCst)
}

thread_local! {
    static HELD_LOCKS: std::cell::RefCell<Vec<u64>> = std::cell::RefCell::new(Vec::new());
}

/// Depth used when a `deadlock-on-suspend` backtrace is captured; set from
/// `--weft:trace-depth` at bootstrap.
static TRACE_DEPTH: AtomicU64 = AtomicU64::new(16);

pub fn set_trace_depth(depth: u64) {
    TRACE_DEPTH.store(depth, Ordering::SeqCst);
}

/// Fail if the calling fiber currently holds any tracked spinlock. Called by
/// every suspension point in this crate and by `weft-executor`'s
/// `suspend`/`sleep_until`.
pub fn verify_no_locks() -> Result<(), WeftError> {
    if !global_lock_tracking_enabled() {
        return Ok(());
    }
    let held = HELD_LOCKS.with(|h| h.borrow().len());
    if held == 0 {
        return Ok(());
    }
    let bt = format!("{:?}", backtrace::Backtrace::new());
    let depth = TRACE_DEPTH.load(Ordering::SeqCst) as usize;
    let truncated: String = bt.lines().take(depth.max(1)).collect::<Vec<_>>().join("\n");
    Err(weft_error!(
        ErrorKind::DeadlockOnSuspend,
        "{held} tracked spinlock(s) held across a suspension point"
    )
    .with_aux("backtrace", truncated))
}

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_WARN_ITERS: u32 = 10_000;
const DEFAULT_DETECT_ITERS: u32 = 1_000_000;

/// Test-and-set spinlock with exponential backoff and optional per-lock
/// registration for [`verify_no_locks`].
pub struct Spinlock {
    id: u64,
    locked: AtomicBool,
    tracked: AtomicBool,
    warn_iters: u32,
    detect_iters: u32,
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinlock {
    pub fn new() -> Self {
        Spinlock {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            locked: AtomicBool::new(false),
            tracked: AtomicBool::new(true),
            warn_iters: DEFAULT_WARN_ITERS,
            detect_iters: DEFAULT_DETECT_ITERS,
        }
    }

    /// A lock excluded from `verify_no_locks()` tracking — the "mark
    /// ignore" knob, applied at construction.
    pub fn untracked() -> Self {
        let lock = Self::new();
        lock.tracked.store(false, Ordering::SeqCst);
        lock
    }

    pub fn set_tracked(&self, tracked: bool) {
        self.tracked.store(tracked, Ordering::SeqCst);
    }

    fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::SeqCst) && global_lock_tracking_enabled()
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            self.on_acquired();
            Some(SpinlockGuard { lock: self })
        }
    }

    /// Spin until acquired, backing off exponentially. Returns
    /// `ErrorKind::Deadlock` if the same location is spun on past
    /// `detect_iters` iterations.
    pub fn lock(&self) -> Result<SpinlockGuard<'_>, WeftError> {
        let mut spins: u32 = 0;
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                self.on_acquired();
                return Ok(SpinlockGuard { lock: self });
            }
            spins = spins.saturating_add(1);
            if spins == self.warn_iters {
                tracing::warn!(lock_id = self.id, spins, "spinlock held unusually long");
            }
            if spins >= self.detect_iters {
                return Err(weft_error!(
                    ErrorKind::Deadlock,
                    "spinlock {} not acquired after {spins} spins",
                    self.id
                ));
            }
            backoff(spins);
        }
    }

    fn on_acquired(&self) {
        if self.is_tracked() {
            HELD_LOCKS.with(|h| h.borrow_mut().push(self.id));
        }
    }

    fn raw_unlock(&self) {
        if self.is_tracked() {
            HELD_LOCKS.with(|h| {
                let pos = h.borrow().iter().rposition(|&id| id == self.id);
                if let Some(pos) = pos {
                    h.borrow_mut().remove(pos);
                }
            });
        }
        self.locked.store(false, Ordering::Release);
    }
}

/// Exponential backoff: CPU-relax hints for small spin counts, a bare OS
/// thread yield for the middle range, a short sleep once it's clearly not
/// going to resolve immediately.
fn backoff(spins: u32) {
    if spins < 32 {
        for _ in 0..spins.max(1) {
            std::hint::spin_loop();
        }
    } else if spins < 256 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(1));
    }
}

pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.raw_unlock();
    }
}

/// Reason a condition-variable (or semaphore) wait resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeReason {
    Notified = 0,
    TimedOut = 1,
    Aborted = 2,
}

impl WakeReason {
    fn from_u8(v: u8) -> WakeReason {
        match v {
            1 => WakeReason::TimedOut,
            2 => WakeReason::Aborted,
            _ => WakeReason::Notified,
        }
    }
}

struct WaitEntry {
    fiber: Fiber,
    reason: Arc<AtomicU8>,
}

type Slot = Arc<parking_lot::Mutex<Option<WaitEntry>>>;

/// A `VecDeque` of claim slots backing [`CondVar`] — functionally the same
/// "remove on wake or timeout, whoever gets there first wins" contract as
/// an intrusive linked list, without hand-rolling intrusive links.
/// A slot is claimed by whichever of {notify, timeout, abort} gets there
/// first; the loser finds it empty and no-ops.
pub struct CondVar {
    waiters: parking_lot::Mutex<VecDeque<Slot>>,
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    pub fn new() -> Self {
        CondVar {
            waiters: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    fn drain_claimed(&self) -> Vec<WaitEntry> {
        let mut q = self.waiters.lock();
        let mut out = Vec::new();
        while let Some(slot) = q.pop_front() {
            if let Some(entry) = slot.lock().take() {
                out.push(entry);
            }
        }
        out
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Remove this waiter's own slot from the queue by identity. Called by
    /// the waiter itself once its wait resolves (by notify, timeout, or
    /// interruption) so a timed-out wait — which nobody else's `pop_front`
    /// is guaranteed to ever reach — doesn't leave an emptied slot sitting
    /// in the queue forever.
    fn remove_slot(&self, slot: &Slot) {
        let mut q = self.waiters.lock();
        if let Some(pos) = q.iter().position(|s| Arc::ptr_eq(s, slot)) {
            q.remove(pos);
        }
    }

    /// Wake one waiter, if any are still present (unclaimed) in the queue.
    pub fn notify_one(&self, sched: &Arc<dyn Rescheduler>) {
        let mut q = self.waiters.lock();
        while let Some(slot) = q.pop_front() {
            if let Some(entry) = slot.lock().take() {
                drop(q);
                entry.reason.store(WakeReason::Notified as u8, Ordering::SeqCst);
                sched.reschedule(entry.fiber);
                return;
            }
        }
    }

    pub fn notify_all(&self, sched: &Arc<dyn Rescheduler>) {
        for entry in self.drain_claimed() {
            entry.reason.store(WakeReason::Notified as u8, Ordering::SeqCst);
            sched.reschedule(entry.fiber);
        }
    }

    /// Drain every waiter and resume it with the `Aborted` reason —
    /// `wait()` on the woken fiber returns `Err(YieldAborted)`.
    pub fn abort_all(&self, sched: &Arc<dyn Rescheduler>) {
        for entry in self.drain_claimed() {
            entry.reason.store(WakeReason::Aborted as u8, Ordering::SeqCst);
            sched.reschedule(entry.fiber);
        }
    }

    /// Release `guard`, suspend the calling fiber, and block until
    /// `notify_one`/`notify_all`/`abort_all`. Reacquires the lock before
    /// returning, mirroring `pthread_cond_wait` — the fresh guard comes back
    /// as the `Ok` payload.
    pub fn wait<'a>(
        &self,
        guard: SpinlockGuard<'a>,
        sched: &Arc<dyn Rescheduler>,
    ) -> Result<SpinlockGuard<'a>, WeftError> {
        let (reason, guard) = self.wait_inner(guard, None, sched)?;
        match reason {
            WakeReason::Aborted => Err(weft_error!(ErrorKind::YieldAborted, "condition wait aborted")),
            _ => Ok(guard),
        }
    }

    /// As [`CondVar::wait`] but with a deadline; the `bool` is `false` on
    /// timeout.
    pub fn wait_until<'a>(
        &self,
        guard: SpinlockGuard<'a>,
        deadline: Instant,
        sched: &Arc<dyn Rescheduler>,
    ) -> Result<(bool, SpinlockGuard<'a>), WeftError> {
        let dur = deadline.saturating_duration_since(Instant::now());
        let (reason, guard) = self.wait_inner(guard, Some(dur), sched)?;
        match reason {
            WakeReason::TimedOut => Ok((false, guard)),
            WakeReason::Aborted => Err(weft_error!(ErrorKind::YieldAborted, "condition wait aborted")),
            WakeReason::Notified => Ok((true, guard)),
        }
    }

    pub fn wait_for<'a>(
        &self,
        guard: SpinlockGuard<'a>,
        dur: Duration,
        sched: &Arc<dyn Rescheduler>,
    ) -> Result<(bool, SpinlockGuard<'a>), WeftError> {
        self.wait_until(guard, Instant::now() + dur, sched)
    }

    fn wait_inner<'a>(
        &self,
        guard: SpinlockGuard<'a>,
        timeout: Option<Duration>,
        sched: &Arc<dyn Rescheduler>,
    ) -> Result<(WakeReason, SpinlockGuard<'a>), WeftError> {
        let lock = guard.lock;
        let this_fiber = fiber::current().expect("CondVar::wait called outside a running fiber");
        verify_no_locks()?;
        if this_fiber.interruption_requested() && this_fiber.interruption_enabled() {
            return Err(weft_error!(
                ErrorKind::ThreadInterrupted,
                "fiber interrupted before condition wait registered"
            ));
        }

        let reason = Arc::new(AtomicU8::new(u8::MAX));
        let slot: Slot = Arc::new(parking_lot::Mutex::new(Some(WaitEntry {
            fiber: this_fiber.clone(),
            reason: Arc::clone(&reason),
        })));
        self.waiters.lock().push_back(Arc::clone(&slot));

        // Release the external lock only after we're registered, so a
        // notifier running between registration and release just finds us
        // already in the queue — no lost wakeup.
        drop(guard);

        if let Some(dur) = timeout {
            let slot2 = Arc::clone(&slot);
            let sched2 = Arc::clone(sched);
            std::thread::spawn(move || {
                std::thread::sleep(dur);
                if let Some(entry) = slot2.lock().take() {
                    entry.reason.store(WakeReason::TimedOut as u8, Ordering::SeqCst);
                    sched2.reschedule(entry.fiber);
                }
            });
        }

        let outcome = fiber::yield_now(FiberState::Suspended);
        if let Err(e) = outcome {
            // Interrupted before ever being woken; remove our own (still
            // possibly registered) entry so nobody double-resumes it, and
            // scrub the now-empty slot out of the queue. The external lock
            // stays released in this path.
            slot.lock().take();
            self.remove_slot(&slot);
            return Err(e);
        }

        // Whichever of {notify, timeout} got here first already emptied the
        // slot's content; this scrubs the leftover shell out of the queue so
        // a timed-out wait doesn't leave a permanent stale entry behind.
        self.remove_slot(&slot);

        let new_guard = lock.lock()?;
        let r = reason.load(Ordering::SeqCst);
        let reason = if r == u8::MAX {
            // Not reachable in practice — every wake path stores a reason
            // before rescheduling — but treated as Notified defensively.
            WakeReason::Notified
        } else {
            WakeReason::from_u8(r)
        };
        Ok((reason, new_guard))
    }
}

/// Binary or counting semaphore built on [`CondVar`] + [`Spinlock`].
pub struct Semaphore {
    lock: Spinlock,
    cv: CondVar,
    permits: parking_lot::Mutex<u64>,
    max: Option<u64>,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Semaphore {
            lock: Spinlock::new(),
            cv: CondVar::new(),
            permits: parking_lot::Mutex::new(initial),
            max: None,
        }
    }

    /// A binary semaphore: acquire/release between 0 and 1 permits.
    pub fn binary(initial_available: bool) -> Self {
        Semaphore {
            lock: Spinlock::new(),
            cv: CondVar::new(),
            permits: parking_lot::Mutex::new(initial_available as u64),
            max: Some(1),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let _guard = match self.lock.try_lock() {
            Some(g) => g,
            None => return false,
        };
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    pub fn acquire(&self, sched: &Arc<dyn Rescheduler>) -> Result<(), WeftError> {
        let mut guard = self.lock.lock()?;
        loop {
            {
                let mut permits = self.permits.lock();
                if *permits > 0 {
                    *permits -= 1;
                    return Ok(());
                }
            }
            guard = self.cv.wait(guard, sched)?;
        }
    }

    pub fn release(&self, sched: &Arc<dyn Rescheduler>) {
        let guard = match self.lock.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        {
            let mut permits = self.permits.lock();
            if let Some(max) = self.max {
                *permits = (*permits + 1).min(max);
            } else {
                *permits += 1;
            }
        }
        drop(guard);
        self.cv.notify_one(sched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spinlock_excludes_concurrent_holders() {
        let lock = Spinlock::new();
        let g1 = lock.try_lock();
        assert!(g1.is_some());
        assert!(lock.try_lock().is_none());
        drop(g1);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn untracked_lock_does_not_trip_verify() {
        set_global_lock_tracking(true);
        let lock = Spinlock::untracked();
        let _g = lock.lock().unwrap();
        assert!(verify_no_locks().is_ok());
    }

    #[test]
    fn tracked_lock_trips_verify_when_enabled() {
        set_global_lock_tracking(true);
        let lock = Spinlock::new();
        let g = lock.lock().unwrap();
        assert!(verify_no_locks().is_err());
        drop(g);
        assert!(verify_no_locks().is_ok());
    }

    #[test]
    fn tracked_lock_does_not_trip_verify_when_tracking_disabled() {
        let lock = Spinlock::new();
        let g = lock.lock().unwrap();
        set_global_lock_tracking(false);
        assert!(verify_no_locks().is_ok());
        set_global_lock_tracking(true);
        drop(g);
    }

    struct ImmediateReschedule {
        invoked: Arc<AtomicUsize>,
    }

    impl Rescheduler for ImmediateReschedule {
        fn reschedule(&self, fiber: Fiber) {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            fiber.invoke();
        }
    }

    #[test]
    fn semaphore_orders_acquire_release_acquire() {
        use weft_fiber::stack::{StackPool, StackSizeClass};
        use weft_fiber::{Fiber as F, Priority, SpawnOptions};

        let sem = Arc::new(Semaphore::binary(true));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let invoked = Arc::new(AtomicUsize::new(0));
        let sched: Arc<dyn Rescheduler> = Arc::new(ImmediateReschedule {
            invoked: Arc::clone(&invoked),
        });

        let pool = StackPool::new();
        let opts = SpawnOptions {
            priority: Priority::Normal,
            stack_class: StackSizeClass::Small,
            page_size: 4096,
        };

        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        order.lock().push("a_acquire");
        sem.release(&sched);
        order.lock().push("a_release");

        let sem2 = Arc::clone(&sem);
        let order2 = Arc::clone(&order);
        let sched2 = Arc::clone(&sched);
        let fiber = F::spawn(
            move || {
                sem2.acquire(&sched2).unwrap();
                order2.lock().push("b_acquire");
            },
            opts,
            &pool,
        )
        .unwrap();
        fiber.invoke();
        assert_eq!(*order.lock(), vec!["a_acquire", "a_release", "b_acquire"]);
    }

    #[test]
    fn timed_out_wait_does_not_leave_a_dangling_queue_entry() {
        use weft_fiber::stack::{StackPool, StackSizeClass};
        use weft_fiber::{Fiber as F, Priority, SpawnOptions};

        let cv = Arc::new(CondVar::new());
        let lock = Arc::new(Spinlock::new());
        let invoked = Arc::new(AtomicUsize::new(0));
        let sched: Arc<dyn Rescheduler> = Arc::new(ImmediateReschedule {
            invoked: Arc::clone(&invoked),
        });

        let pool = StackPool::new();
        let opts = SpawnOptions {
            priority: Priority::Normal,
            stack_class: StackSizeClass::Small,
            page_size: 4096,
        };

        let cv2 = Arc::clone(&cv);
        let lock2 = Arc::clone(&lock);
        let sched2 = Arc::clone(&sched);
        let woke_normally = Arc::new(AtomicUsize::new(2));
        let woke_normally2 = Arc::clone(&woke_normally);

        let fiber = F::spawn(
            move || {
                let guard = lock2.lock().unwrap();
                let (woke, _guard) = cv2
                    .wait_for(guard, Duration::from_millis(20), &sched2)
                    .unwrap();
                woke_normally2.store(woke as usize, Ordering::SeqCst);
            },
            opts,
            &pool,
        )
        .unwrap();

        fiber.invoke();
        assert_eq!(cv.waiter_count(), 1, "wait should register a queue entry");

        // The timeout fires on its own OS thread inside `wait_inner`, which
        // reschedules (invokes, via `ImmediateReschedule`) the fiber — give
        // it time to run and scrub its own slot back out of the queue.
        let mut drained = false;
        for _ in 0..50 {
            if cv.waiter_count() == 0 {
                drained = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(drained, "timed-out wait left a dangling entry in the queue");
        assert_eq!(woke_normally.load(Ordering::SeqCst), 0, "expected a timeout, not a notify");
    }

    use proptest::prelude::*;

    proptest::proptest! {
        /// Generalized over timeout length: whatever the
        /// deadline, the queue always returns to size 0 once the fiber has
        /// had a chance to run again.
        #[test]
        fn queue_drains_for_any_short_timeout(timeout_ms in 1u64..40) {
            use weft_fiber::stack::{StackPool, StackSizeClass};
            use weft_fiber::{Fiber as F, Priority, SpawnOptions};

            let cv = Arc::new(CondVar::new());
            let lock = Arc::new(Spinlock::new());
            let invoked = Arc::new(AtomicUsize::new(0));
            let sched: Arc<dyn Rescheduler> = Arc::new(ImmediateReschedule {
                invoked: Arc::clone(&invoked),
            });
            let pool = StackPool::new();
            let opts = SpawnOptions {
                priority: Priority::Normal,
                stack_class: StackSizeClass::Small,
                page_size: 4096,
            };

            let cv2 = Arc::clone(&cv);
            let lock2 = Arc::clone(&lock);
            let sched2 = Arc::clone(&sched);
            let fiber = F::spawn(
                move || {
                    let guard = lock2.lock().unwrap();
                    let _ = cv2.wait_for(guard, Duration::from_millis(timeout_ms), &sched2);
                },
                opts,
                &pool,
            )
            .unwrap();
            fiber.invoke();
            prop_assert_eq!(cv.waiter_count(), 1);

            let mut drained = false;
            for _ in 0..200 {
                if cv.waiter_count() == 0 {
                    drained = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            prop_assert!(drained);
        }
    }
}
