//! Stackful-coroutine fiber representation and lifecycle.
//!
//! A [`Fiber`] pairs an owned [`Stack`] with a machine-specific [`Context`]
//! and the bookkeeping the scheduler needs: state, exit status, a phase
//! counter, a TLS slot, interruption flags, and an exit-callback list.
//! Fibers are reference-counted; the last drop returns the stack to whatever
//! [`StackRecycler`] the owning scheduler registered.
//!
//! This crate only knows how to *switch into* and *yield out of* a fiber —
//! it has no notion of run queues, priorities beyond the tag a fiber
//! carries, or stealing. That's `weft-scheduler`.

pub mod context;
pub mod stack;

use context::Context;
use rustc_hash::FxHashMap;
use stack::{Stack, StackPool, StackSizeClass};
use std::any::{Any, TypeId};
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use weft_error::{weft_error, ErrorKind, WeftError};

/// Scheduling priority a fiber is tagged with at creation. Ordering and
/// queueing live in `weft-scheduler`; this crate just carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    Normal,
    Boost,
    High,
    /// Never stolen by another worker.
    Bound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    Ready = 0,
    Running = 1,
    Suspended = 2,
    Exited = 3,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Suspended,
            _ => FiberState::Exited,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    NotExited = 0,
    Returned = 1,
    Aborted = 2,
}

impl ExitStatus {
    fn from_u8(v: u8) -> ExitStatus {
        match v {
            0 => ExitStatus::NotExited,
            1 => ExitStatus::Returned,
            _ => ExitStatus::Aborted,
        }
    }
}

/// Returned to a scheduler so it can put a just-exited fiber's stack back
/// into the right size-class pool.
pub trait StackRecycler: Send + Sync {
    fn recycle(&self, class: StackSizeClass, stack: Stack);
}

type FiberEntry = Box<dyn FnOnce() + Send + 'static>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

struct FiberInner {
    id: u64,
    priority: Priority,
    stack_class: StackSizeClass,
    state: AtomicU8,
    exit_status: AtomicU8,
    phase: AtomicU64,
    interruption_requested: AtomicBool,
    interruption_enabled: AtomicBool,
    // SAFETY (struct-wide): `context` and `caller_context` are only ever
    // touched from inside `Fiber::invoke`/`yield_now`, and the "at most one
    // worker runs a fiber at a time" invariant guarantees those calls
    // never race. The `unsafe impl Sync` below relies on this.
    context: UnsafeCell<Context>,
    caller_context: UnsafeCell<Context>,
    stack: parking_lot::Mutex<Option<Stack>>,
    entry: parking_lot::Mutex<Option<FiberEntry>>,
    panic_payload: parking_lot::Mutex<Option<Box<dyn Any + Send>>>,
    exit_callbacks: parking_lot::Mutex<Vec<Box<dyn FnMut() + Send>>>,
    tls: parking_lot::Mutex<FxHashMap<TypeId, Box<dyn Any + Send>>>,
    recycler: parking_lot::Mutex<Option<Arc<dyn StackRecycler>>>,
}

// SAFETY: see the field comment on `context`/`caller_context` above.
unsafe impl Sync for FiberInner {}

/// A strong, reference-counted handle to a fiber — the "thread-id-ref" of
/// Cloning bumps the refcount; the last drop recycles the stack.
pub struct Fiber(Arc<FiberInner>);

impl Clone for Fiber {
    fn clone(&self) -> Self {
        Fiber(Arc::clone(&self.0))
    }
}

/// Parameters for [`Fiber::spawn`].
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub priority: Priority,
    pub stack_class: StackSizeClass,
    pub page_size: usize,
}

impl Fiber {
    /// Allocate a stack from `pool` and build a fiber ready to run `entry`
    /// on its first [`Fiber::invoke`].
    pub fn spawn(
        entry: impl FnOnce() + Send + 'static,
        opts: SpawnOptions,
        pool: &StackPool,
    ) -> Result<Fiber, WeftError> {
        let stack = pool.acquire(opts.stack_class, opts.page_size)?;
        let top = stack.top();
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(FiberInner {
            id,
            priority: opts.priority,
            stack_class: opts.stack_class,
            state: AtomicU8::new(FiberState::Ready as u8),
            exit_status: AtomicU8::new(ExitStatus::NotExited as u8),
            phase: AtomicU64::new(0),
            interruption_requested: AtomicBool::new(false),
            interruption_enabled: AtomicBool::new(true),
            context: UnsafeCell::new(Context::empty()),
            caller_context: UnsafeCell::new(Context::empty()),
            stack: parking_lot::Mutex::new(Some(stack)),
            entry: parking_lot::Mutex::new(Some(Box::new(entry))),
            panic_payload: parking_lot::Mutex::new(None),
            exit_callbacks: parking_lot::Mutex::new(Vec::new()),
            tls: parking_lot::Mutex::new(FxHashMap::default()),
            recycler: parking_lot::Mutex::new(None),
        });
        let arg = Arc::as_ptr(&inner) as usize;
        // SAFETY: `top` is the top of the stack we just acquired from `pool`,
        // sized for at least one size class and outliving `inner` (it's
        // moved into `inner.stack` above, dropped only after this context is
        // gone). `trampoline` never returns normally.
        unsafe {
            *inner.context.get() = Context::new(top, trampoline, arg);
        }
        Ok(Fiber(inner))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn priority(&self) -> Priority {
        self.0.priority
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn exit_status(&self) -> ExitStatus {
        ExitStatus::from_u8(self.0.exit_status.load(Ordering::Acquire))
    }

    pub fn phase(&self) -> u64 {
        self.0.phase.load(Ordering::Acquire)
    }

    pub fn request_interrupt(&self) {
        self.0.interruption_requested.store(true, Ordering::SeqCst);
    }

    pub fn interruption_requested(&self) -> bool {
        self.0.interruption_requested.load(Ordering::SeqCst)
    }

    pub fn set_interruption_enabled(&self, enabled: bool) {
        self.0.interruption_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn interruption_enabled(&self) -> bool {
        self.0.interruption_enabled.load(Ordering::SeqCst)
    }

    /// Push a callback at the front of the exit list (LIFO); drained in
    /// order on first transition to `Exited`. Must not panic.
    pub fn push_exit_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.0.exit_callbacks.lock().insert(0, Box::new(cb));
    }

    pub fn tls_set<T: Send + 'static>(&self, value: T) {
        self.0
            .tls
            .lock()
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn tls_get<T: Clone + Send + 'static>(&self) -> Option<T> {
        self.0
            .tls
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn tls_remove<T: Send + 'static>(&self) {
        self.0.tls.lock().remove(&TypeId::of::<T>());
    }

    pub fn set_recycler(&self, recycler: Arc<dyn StackRecycler>) {
        *self.0.recycler.lock() = Some(recycler);
    }

    /// Take the panic payload stashed by a fiber that exited via unwind, if
    /// any — used by whoever joins the fiber to rethrow.
    pub fn take_panic_payload(&self) -> Option<Box<dyn Any + Send>> {
        self.0.panic_payload.lock().take()
    }

    /// Run this fiber until it next yields or exits. Must be called by the
    /// fiber's owning worker only; invoking a fiber that's `Running`
    /// elsewhere is undefined behavior per the at-most-one-worker
    /// invariant.
    pub fn invoke(&self) {
        debug_assert_ne!(self.state(), FiberState::Running, "fiber already running");
        debug_assert_ne!(self.state(), FiberState::Exited, "invoking an exited fiber");
        self.0.state.store(FiberState::Running as u8, Ordering::SeqCst);
        CURRENT.with(|c| c.borrow_mut().push(self.clone()));
        // SAFETY: this worker owns exclusive access to `context`/
        // `caller_context` for the duration of this call (invariant above).
        unsafe {
            let ctx = &mut *self.0.context.get();
            let caller = &mut *self.0.caller_context.get();
            ctx.swap(caller);
        }
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });
        self.0.phase.fetch_add(1, Ordering::SeqCst);
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<Fiber>> = RefCell::new(Vec::new());
}

/// The fiber currently running on this OS thread, if any. `None` when
/// called from plain worker code between fibers.
pub fn current() -> Option<Fiber> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

/// Suspend the calling fiber, transitioning it to `new_state`, and hand
/// control back to the worker that invoked it. Checks interruption first:
/// if a cancel was requested and interruption is enabled, returns
/// `ThreadInterrupted` instead of suspending.
///
/// # Panics
/// Panics if called outside a running fiber — this is always a programming
/// error in the caller, not a runtime condition.
pub fn yield_now(new_state: FiberState) -> Result<(), WeftError> {
    let fiber = current().expect("yield_now called outside a running fiber");
    if fiber.interruption_requested() && fiber.interruption_enabled() {
        fiber.0.interruption_requested.store(false, Ordering::SeqCst);
        return Err(weft_error!(
            ErrorKind::ThreadInterrupted,
            "fiber {} interrupted at yield point",
            fiber.id()
        ));
    }
    fiber.0.state.store(new_state as u8, Ordering::SeqCst);
    // SAFETY: see Fiber::invoke.
    unsafe {
        let ctx = &mut *fiber.0.context.get();
        let caller = &mut *fiber.0.caller_context.get();
        caller.swap(ctx);
    }
    Ok(())
}

fn drain_exit_callbacks(inner: &FiberInner) {
    let callbacks = std::mem::take(&mut *inner.exit_callbacks.lock());
    for mut cb in callbacks {
        cb();
    }
}

extern "C" fn trampoline(arg: usize) -> ! {
    // SAFETY: `arg` is `Arc::as_ptr` of the `Fiber` that built this context
    // in `Fiber::spawn`; that `Fiber` (or a clone) is held alive by whoever
    // called `invoke` on this stack, which is exactly the call that brought
    // us here.
    let fiber: &FiberInner = unsafe { &*(arg as *const FiberInner) };
    let entry = fiber.entry.lock().take();
    if let Some(entry) = entry {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
        match outcome {
            Ok(()) => fiber
                .exit_status
                .store(ExitStatus::Returned as u8, Ordering::SeqCst),
            Err(payload) => {
                *fiber.panic_payload.lock() = Some(payload);
                fiber
                    .exit_status
                    .store(ExitStatus::Aborted as u8, Ordering::SeqCst);
            }
        }
    }
    fiber.state.store(FiberState::Exited as u8, Ordering::SeqCst);
    drain_exit_callbacks(fiber);
    loop {
        // SAFETY: see Fiber::invoke. After the first iteration this fiber
        // is Exited and must never be invoked again; the loop only exists
        // so this function satisfies `-> !` if that invariant is ever
        // violated by a caller bug.
        unsafe {
            let ctx = &mut *fiber.context.get();
            let caller = &mut *fiber.caller_context.get();
            caller.swap(ctx);
        }
    }
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.lock().take() {
            if let Some(recycler) = self.recycler.lock().clone() {
                recycler.recycle(self.stack_class, stack);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn opts() -> SpawnOptions {
        SpawnOptions {
            priority: Priority::Normal,
            stack_class: StackSizeClass::Small,
            page_size: 4096,
        }
    }

    #[test]
    fn fiber_runs_to_completion() {
        let pool = StackPool::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let fiber = Fiber::spawn(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }, opts(), &pool)
        .unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.invoke();
        assert_eq!(fiber.state(), FiberState::Exited);
        assert_eq!(fiber.exit_status(), ExitStatus::Returned);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn phase_increments_per_round_trip() {
        let pool = StackPool::new();
        let fiber = Fiber::spawn(
            || {
                yield_now(FiberState::Ready).unwrap();
            },
            opts(),
            &pool,
        )
        .unwrap();
        assert_eq!(fiber.phase(), 0);
        fiber.invoke();
        assert_eq!(fiber.phase(), 1);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.invoke();
        assert_eq!(fiber.phase(), 2);
        assert_eq!(fiber.state(), FiberState::Exited);
    }

    #[test]
    fn exit_callbacks_drain_lifo_exactly_once() {
        let pool = StackPool::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let fiber = Fiber::spawn(|| {}, opts(), &pool).unwrap();
        let o1 = Arc::clone(&order);
        fiber.push_exit_callback(move || o1.lock().push(1));
        let o2 = Arc::clone(&order);
        fiber.push_exit_callback(move || o2.lock().push(2));
        fiber.invoke();
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[test]
    fn panic_inside_fiber_is_captured_as_aborted() {
        let pool = StackPool::new();
        let fiber = Fiber::spawn(
            || {
                panic!("boom");
            },
            opts(),
            &pool,
        )
        .unwrap();
        fiber.invoke();
        assert_eq!(fiber.exit_status(), ExitStatus::Aborted);
        assert!(fiber.take_panic_payload().is_some());
    }

    #[test]
    fn interruption_short_circuits_yield() {
        let pool = StackPool::new();
        let interrupted = Arc::new(AtomicUsize::new(0));
        let interrupted2 = Arc::clone(&interrupted);
        let fiber = Fiber::spawn(
            move || {
                if yield_now(FiberState::Ready).is_err() {
                    interrupted2.fetch_add(1, Ordering::SeqCst);
                }
            },
            opts(),
            &pool,
        )
        .unwrap();
        fiber.request_interrupt();
        fiber.invoke();
        assert_eq!(interrupted.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Exited);
    }

    #[test]
    fn tls_roundtrip() {
        let pool = StackPool::new();
        let fiber = Fiber::spawn(|| {}, opts(), &pool).unwrap();
        fiber.tls_set::<u32>(42);
        assert_eq!(fiber.tls_get::<u32>(), Some(42));
        fiber.tls_remove::<u32>();
        assert_eq!(fiber.tls_get::<u32>(), None);
    }

    use proptest::prelude::*;

    proptest::proptest! {
        /// For every yield point, `phase_after == phase_before + 1`,
        /// no matter how many round trips the fiber makes before exiting.
        #[test]
        fn phase_increments_by_one_per_round_trip_for_any_count(rounds in 0usize..64) {
            let pool = StackPool::new();
            let remaining = Arc::new(AtomicUsize::new(rounds));
            let remaining2 = Arc::clone(&remaining);
            let fiber = Fiber::spawn(
                move || {
                    while remaining2.load(Ordering::SeqCst) > 0 {
                        remaining2.fetch_sub(1, Ordering::SeqCst);
                        yield_now(FiberState::Ready).unwrap();
                    }
                },
                opts(),
                &pool,
            )
            .unwrap();

            let mut before = fiber.phase();
            prop_assert_eq!(before, 0);
            for _ in 0..=rounds {
                fiber.invoke();
                let after = fiber.phase();
                prop_assert_eq!(after, before + 1);
                before = after;
            }
            prop_assert_eq!(fiber.state(), FiberState::Exited);
        }
    }
}
