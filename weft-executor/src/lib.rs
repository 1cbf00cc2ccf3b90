//! `this_thread` facade: the current-fiber handle's suspension
//! primitives, built on `weft-fiber`'s bare `yield_now` and the
//! `Rescheduler` seam `weft-sync` already defines.
//!
//! `yield`/`yield_k`/`spin_k` never need a rescheduler — a `Ready` fiber is
//! picked back up by whatever scheduler owns it on its very next pass.
//! `suspend`/`sleep_until`/`sleep_for` park the fiber in `Suspended` state,
//! which the scheduler leaves alone until something reschedules it — so
//! those take an explicit `&Arc<dyn Rescheduler>`, same as
//! `weft_sync::CondVar`.
//!
//! `suspend`/`resume` can't reuse `CondVar`'s intrusive wait queue, because a
//! caller of `resume(id, ..)` usually has nothing but the fiber id — no
//! handle to whatever queue it's parked on. So this module keeps its own
//! process-wide table keyed by fiber id instead.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_error::{weft_error, ErrorKind, WeftError};
use weft_fiber::{current, yield_now as fiber_yield, Fiber, FiberState};
use weft_sync::Rescheduler;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum ResumeReason {
    Normal = 0,
    Abort = 1,
}

impl ResumeReason {
    fn from_u8(v: u8) -> ResumeReason {
        if v == ResumeReason::Abort as u8 {
            ResumeReason::Abort
        } else {
            ResumeReason::Normal
        }
    }
}

struct Entry {
    fiber: Fiber,
    rescheduler: Arc<dyn Rescheduler>,
    reason: Arc<AtomicU8>,
}

static TABLE: Lazy<Mutex<HashMap<u64, Entry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Suspend with reason `pending`, handing control back to the worker. The
/// fiber is left `Ready`, so whichever scheduler runs it requeues it on its
/// own next pass — no external resume needed.
pub fn yield_now(desc: &'static str) -> Result<(), WeftError> {
    tracing::trace!(desc, "this_thread::yield");
    fiber_yield(FiberState::Ready)
}

/// Spin hint for small `k`, a bare yield for intermediate `k`, a 1 microsecond
/// sleep for large `k` — the same cooperative backoff ladder `weft-sync`'s
/// spinlock uses internally.
pub fn yield_k(k: u32, desc: &'static str) -> Result<(), WeftError> {
    if k < 4 {
        spin_k(k, desc);
        Ok(())
    } else if k < 16 {
        yield_now(desc)
    } else {
        std::thread::sleep(Duration::from_micros(1));
        Ok(())
    }
}

/// Issue `k` CPU relax hints without suspending the fiber at all.
pub fn spin_k(k: u32, desc: &'static str) {
    tracing::trace!(k, desc, "this_thread::spin_k");
    for _ in 0..k {
        std::hint::spin_loop();
    }
}

/// Suspend until an explicit [`resume`] targeting this fiber's id. `sched`
/// is where the fiber gets requeued once woken.
pub fn suspend(desc: &'static str, sched: &Arc<dyn Rescheduler>) -> Result<(), WeftError> {
    let fiber = current().expect("this_thread::suspend called outside a running fiber");
    let id = fiber.id();
    let reason = Arc::new(AtomicU8::new(ResumeReason::Normal as u8));
    TABLE.lock().insert(
        id,
        Entry {
            fiber: fiber.clone(),
            rescheduler: Arc::clone(sched),
            reason: Arc::clone(&reason),
        },
    );
    tracing::trace!(fiber = id, desc, "this_thread::suspend");
    fiber_yield(FiberState::Suspended)?;
    TABLE.lock().remove(&id);
    match ResumeReason::from_u8(reason.load(Ordering::SeqCst)) {
        ResumeReason::Abort => Err(weft_error!(
            ErrorKind::YieldAborted,
            "fiber {} resumed with abort",
            id
        )),
        ResumeReason::Normal => Ok(()),
    }
}

/// Wake the fiber parked under `id` via [`suspend`] or sleeping in
/// [`sleep_until`]/[`sleep_for`]. Returns `false` if nothing was waiting —
/// already woken, already timed out, or never suspended.
///
/// `abort` delivers `yield-aborted` at the suspension's resume point instead
/// of a clean return. A `resume` racing an in-flight sleep timeout always
/// wins if it claims the table entry first; the loser is a no-op.
pub fn resume(id: u64, abort: bool) -> bool {
    match TABLE.lock().remove(&id) {
        Some(entry) => {
            let reason = if abort {
                ResumeReason::Abort
            } else {
                ResumeReason::Normal
            };
            entry.reason.store(reason as u8, Ordering::SeqCst);
            entry.rescheduler.reschedule(entry.fiber);
            true
        }
        None => false,
    }
}

// Every sleeping fiber in the process shares this one timer facility rather
// than parking its own OS thread: a min-heap of deadlines guarded by a
// condvar, drained by a single background thread that calls back into
// `resume` (and so, transitively, into the `Injector`-backed
// `Rescheduler::reschedule` — safe to call from any thread).
struct TimerHeap {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

static TIMER_HEAP: Lazy<Mutex<TimerHeap>> = Lazy::new(|| {
    Mutex::new(TimerHeap {
        deadlines: BinaryHeap::new(),
    })
});
static TIMER_WAKE: Condvar = Condvar::new();
static TIMER_THREAD: Lazy<()> = Lazy::new(|| {
    std::thread::Builder::new()
        .name("weft-timer".into())
        .spawn(timer_loop)
        .expect("failed to spawn weft timer thread");
});

fn timer_loop() -> ! {
    loop {
        let mut heap = TIMER_HEAP.lock();
        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = heap.deadlines.peek() {
            if deadline > now {
                break;
            }
            heap.deadlines.pop();
            drop(heap);
            resume(id, false);
            heap = TIMER_HEAP.lock();
        }
        match heap.deadlines.peek() {
            Some(&Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                TIMER_WAKE.wait_for(&mut heap, wait);
            }
            None => {
                // No pending timers: park until one is registered.
                TIMER_WAKE.wait(&mut heap);
            }
        }
    }
}

fn schedule_timer(id: u64, deadline: Instant) {
    Lazy::force(&TIMER_THREAD);
    let mut heap = TIMER_HEAP.lock();
    heap.deadlines.push(Reverse((deadline, id)));
    TIMER_WAKE.notify_one();
}

fn sleep_inner(deadline: Instant, sched: &Arc<dyn Rescheduler>) -> Result<(), WeftError> {
    let fiber = current().expect("this_thread::sleep called outside a running fiber");
    let id = fiber.id();
    schedule_timer(id, deadline);
    suspend("sleep", sched)
}

/// Suspend until `deadline`. A `resume(id, true)` delivered before the
/// deadline throws `yield-aborted` instead of returning normally.
pub fn sleep_until(deadline: Instant, sched: &Arc<dyn Rescheduler>) -> Result<(), WeftError> {
    sleep_inner(deadline, sched)
}

/// `sleep_until(Instant::now() + duration, sched)`.
pub fn sleep_for(duration: Duration, sched: &Arc<dyn Rescheduler>) -> Result<(), WeftError> {
    sleep_inner(Instant::now() + duration, sched)
}

/// Yield once per iteration while `pred` holds.
pub fn yield_while(mut pred: impl FnMut() -> bool, desc: &'static str) -> Result<(), WeftError> {
    let mut k = 0u32;
    while pred() {
        yield_k(k, desc)?;
        k = k.saturating_add(1);
    }
    Ok(())
}

/// As [`yield_while`], but gives up and returns `Ok(false)` once `deadline`
/// passes with `pred` still true.
pub fn yield_while_timeout(
    mut pred: impl FnMut() -> bool,
    deadline: Instant,
    desc: &'static str,
) -> Result<bool, WeftError> {
    let mut k = 0u32;
    while pred() {
        if Instant::now() >= deadline {
            return Ok(false);
        }
        yield_k(k, desc)?;
        k = k.saturating_add(1);
    }
    Ok(true)
}
