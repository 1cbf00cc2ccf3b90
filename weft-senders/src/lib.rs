//! Composable sender/receiver execution model.
//!
//! A [`Sender`] describes a unit of asynchronous work without running it; a
//! [`Receiver`] is the three-channel sink (`set_value`/`set_error`/
//! `set_stopped`) a sender's completion is delivered to; [`connect`][Sender::connect]
//! joins the two into an [`OperationState`], and [`OperationState::start`]
//! actually kicks the work off. Connecting never runs anything — building the
//! whole pipeline is just nesting closures — so a sender graph can be
//! constructed ahead of when (or whether) it actually executes.
//!
//! Every value-producing combinator here wraps its user closure in
//! `catch_unwind` and turns a caught panic into `set_error`, mirroring how a
//! C++ sender implementation would route a thrown exception into the error
//! channel instead of letting it escape across a scheduler boundary.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use weft_error::{weft_error, ErrorKind, WeftError};
use weft_fiber::{stack::StackSizeClass, Priority};
use weft_scheduler::{InitialState, Scheduler};

/// The sink a sender's completion is delivered to. Exactly one of the three
/// methods is ever called, exactly once, per connected operation-state.
pub trait Receiver: Send + 'static {
    type Value: Send + 'static;

    fn set_value(self, value: Self::Value);
    fn set_error(self, error: WeftError);
    fn set_stopped(self);
}

/// A connected, not-yet-started pipeline. Boxing the closure here is what
/// lets `connect` return a uniform type regardless of how deep the sender
/// chain is.
pub struct OperationState {
    start_fn: Box<dyn FnOnce() + Send>,
}

impl OperationState {
    pub fn start(self) {
        (self.start_fn)()
    }
}

/// A description of asynchronous work. Senders are consumed by `connect`;
/// composing two senders produces a new sender, never mutates either input.
pub trait Sender: Send + 'static {
    type Value: Send + 'static;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = Self::Value>,
        Self: Sized;
}

fn panic_to_error(payload: Box<dyn Any + Send>) -> WeftError {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "sender stage panicked with a non-string payload".to_string()
    };
    weft_error!(ErrorKind::BadLogic, "{msg}")
}

/// `just(v)`: a sender whose operation-state immediately calls
/// `receiver.set_value(v)` once started. Mostly useful as a `let_error`
/// recovery target or in tests.
pub struct Just<T> {
    value: T,
}

pub fn just<T: Send + 'static>(value: T) -> Just<T> {
    Just { value }
}

impl<T: Send + 'static> Sender for Just<T> {
    type Value = T;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = T>,
    {
        let value = self.value;
        OperationState {
            start_fn: Box::new(move || receiver.set_value(value)),
        }
    }
}

/// `schedule(scheduler)`: `set_value(())` on a worker of `scheduler`.
pub struct Schedule {
    scheduler: Arc<Scheduler>,
    priority: Priority,
    stack_class: StackSizeClass,
}

pub fn schedule(scheduler: Arc<Scheduler>) -> Schedule {
    Schedule {
        scheduler,
        priority: Priority::Normal,
        stack_class: StackSizeClass::Small,
    }
}

impl Schedule {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl Sender for Schedule {
    type Value = ();

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = ()>,
    {
        OperationState {
            start_fn: Box::new(move || {
                let slot = Arc::new(parking_lot::Mutex::new(Some(receiver)));
                let slot2 = Arc::clone(&slot);
                let result = self.scheduler.create_thread(
                    move || {
                        if let Some(r) = slot2.lock().take() {
                            r.set_value(());
                        }
                    },
                    self.priority,
                    self.stack_class,
                    InitialState::Pending,
                );
                if let Err(e) = result {
                    if let Some(r) = slot.lock().take() {
                        r.set_error(e);
                    }
                }
            }),
        }
    }
}

/// `then(sender, f)`: apply `f` to the predecessor's value.
pub struct Then<S, F> {
    inner: S,
    f: F,
}

pub fn then<S, F, Out>(inner: S, f: F) -> Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Value) -> Out + Send + 'static,
    Out: Send + 'static,
{
    Then { inner, f }
}

impl<S, F, Out> Sender for Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Value) -> Out + Send + 'static,
    Out: Send + 'static,
{
    type Value = Out;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = Out>,
    {
        self.inner.connect(ThenReceiver {
            f: self.f,
            next: receiver,
        })
    }
}

struct ThenReceiver<F, R> {
    f: F,
    next: R,
}

impl<In, F, Out, R> Receiver for ThenReceiver<F, R>
where
    In: Send + 'static,
    F: FnOnce(In) -> Out + Send + 'static,
    Out: Send + 'static,
    R: Receiver<Value = Out>,
{
    type Value = In;

    fn set_value(self, value: In) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| (self.f)(value))) {
            Ok(out) => self.next.set_value(out),
            Err(payload) => self.next.set_error(panic_to_error(payload)),
        }
    }

    fn set_error(self, error: WeftError) {
        self.next.set_error(error);
    }

    fn set_stopped(self) {
        self.next.set_stopped();
    }
}

/// `bulk(sender, shape, f)`: invoke `f(i, &value)` for each `i` in `shape`,
/// then forward `value` unchanged downstream. `shape` is any
/// `IntoIterator<Item = usize>` — an integer range for the common `[0, n)`
/// case, or a user iterable.
pub struct Bulk<S, Sh, F> {
    inner: S,
    shape: Sh,
    f: F,
}

pub fn bulk<S, Sh, F>(inner: S, shape: Sh, f: F) -> Bulk<S, Sh, F>
where
    S: Sender,
    S::Value: Send + 'static,
    Sh: IntoIterator<Item = usize> + Clone + Send + 'static,
    F: Fn(usize, &S::Value) + Send + Sync + 'static,
{
    Bulk { inner, shape, f }
}

impl<S, Sh, F> Sender for Bulk<S, Sh, F>
where
    S: Sender,
    S::Value: Send + 'static,
    Sh: IntoIterator<Item = usize> + Clone + Send + 'static,
    F: Fn(usize, &S::Value) + Send + Sync + 'static,
{
    type Value = S::Value;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = S::Value>,
    {
        self.inner.connect(BulkReceiver {
            shape: self.shape,
            f: self.f,
            next: receiver,
        })
    }
}

struct BulkReceiver<Sh, F, R> {
    shape: Sh,
    f: F,
    next: R,
}

impl<Sh, F, R> Receiver for BulkReceiver<Sh, F, R>
where
    Sh: IntoIterator<Item = usize> + Clone + Send + 'static,
    F: Fn(usize, &R::Value) + Send + Sync + 'static,
    R: Receiver,
{
    type Value = R::Value;

    fn set_value(self, value: R::Value) {
        for i in self.shape.clone() {
            let f = &self.f;
            let value = &value;
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| f(i, value))) {
                return self.next.set_error(panic_to_error(payload));
            }
        }
        self.next.set_value(value);
    }

    fn set_error(self, error: WeftError) {
        self.next.set_error(error);
    }

    fn set_stopped(self) {
        self.next.set_stopped();
    }
}

/// `let_error(sender, f)`: on predecessor error `e`, calls `f(e)` to obtain a
/// successor sender and connects/starts it against the same downstream
/// receiver. `set_stopped` is forwarded unchanged — this combinator only
/// traps the error channel.
pub struct LetError<S, F> {
    inner: S,
    f: F,
}

pub fn let_error<S, F, S2>(inner: S, f: F) -> LetError<S, F>
where
    S: Sender,
    F: FnOnce(WeftError) -> S2 + Send + 'static,
    S2: Sender<Value = S::Value>,
{
    LetError { inner, f }
}

impl<S, F, S2> Sender for LetError<S, F>
where
    S: Sender,
    F: FnOnce(WeftError) -> S2 + Send + 'static,
    S2: Sender<Value = S::Value>,
{
    type Value = S::Value;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = S::Value>,
    {
        self.inner.connect(LetErrorReceiver {
            f: self.f,
            next: receiver,
        })
    }
}

struct LetErrorReceiver<F, R> {
    f: F,
    next: R,
}

impl<F, S2, R> Receiver for LetErrorReceiver<F, R>
where
    F: FnOnce(WeftError) -> S2 + Send + 'static,
    S2: Sender<Value = R::Value>,
    R: Receiver,
{
    type Value = R::Value;

    fn set_value(self, value: R::Value) {
        // `f` is not constructed on the value path.
        self.next.set_value(value);
    }

    fn set_error(self, error: WeftError) {
        let successor = (self.f)(error);
        successor.connect(self.next).start();
    }

    fn set_stopped(self) {
        self.next.set_stopped();
    }
}

/// `schedule_from(scheduler, sender)`: run the predecessor, then transfer
/// whichever of value/error/stopped it completes with onto a worker of
/// `scheduler`.
pub struct ScheduleFrom<S> {
    scheduler: Arc<Scheduler>,
    inner: S,
}

pub fn schedule_from<S: Sender>(scheduler: Arc<Scheduler>, inner: S) -> ScheduleFrom<S> {
    ScheduleFrom { scheduler, inner }
}

impl<S: Sender> Sender for ScheduleFrom<S> {
    type Value = S::Value;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = S::Value>,
    {
        self.inner.connect(ScheduleFromReceiver {
            scheduler: self.scheduler,
            next: receiver,
        })
    }
}

struct ScheduleFromReceiver<R> {
    scheduler: Arc<Scheduler>,
    next: R,
}

enum Completion<T> {
    Value(T),
    Error(WeftError),
    Stopped,
}

impl<R: Receiver> ScheduleFromReceiver<R> {
    fn transfer(self, completion: Completion<R::Value>) {
        let slot = Arc::new(parking_lot::Mutex::new(Some((self.next, completion))));
        let slot2 = Arc::clone(&slot);
        let result = self.scheduler.create_thread(
            move || {
                if let Some((next, completion)) = slot2.lock().take() {
                    match completion {
                        Completion::Value(v) => next.set_value(v),
                        Completion::Error(e) => next.set_error(e),
                        Completion::Stopped => next.set_stopped(),
                    }
                }
            },
            Priority::Normal,
            StackSizeClass::Small,
            InitialState::Pending,
        );
        if let Err(e) = result {
            if let Some((next, _)) = slot.lock().take() {
                next.set_error(e);
            }
        }
    }
}

impl<R: Receiver> Receiver for ScheduleFromReceiver<R> {
    type Value = R::Value;

    fn set_value(self, value: R::Value) {
        self.transfer(Completion::Value(value));
    }

    fn set_error(self, error: WeftError) {
        self.transfer(Completion::Error(error));
    }

    fn set_stopped(self) {
        self.transfer(Completion::Stopped);
    }
}

/// `drop_operation_state(sender)`: the predecessor produces `(value, guard)`;
/// `guard` is dropped — releasing whatever resource it owns, e.g. a spinlock
/// guard or a connection handle — before the downstream continuation sees
/// `value`, rather than at the end of the whole chain.
pub struct DropOpState<S> {
    inner: S,
}

pub fn drop_operation_state<S>(inner: S) -> DropOpState<S> {
    DropOpState { inner }
}

impl<S, V, D> Sender for DropOpState<S>
where
    S: Sender<Value = (V, D)>,
    V: Send + 'static,
    D: Send + 'static,
{
    type Value = V;

    fn connect<R>(self, receiver: R) -> OperationState
    where
        R: Receiver<Value = V>,
    {
        self.inner.connect(DropOpStateReceiver {
            next: receiver,
            _marker: std::marker::PhantomData,
        })
    }
}

struct DropOpStateReceiver<R, D> {
    next: R,
    _marker: std::marker::PhantomData<D>,
}

impl<R, D> Receiver for DropOpStateReceiver<R, D>
where
    R: Receiver,
    D: Send + 'static,
{
    type Value = (R::Value, D);

    fn set_value(self, (value, guard): (R::Value, D)) {
        drop(guard);
        self.next.set_value(value);
    }

    fn set_error(self, error: WeftError) {
        self.next.set_error(error);
    }

    fn set_stopped(self) {
        self.next.set_stopped();
    }
}

/// `unpack(sender)`: wraps a sender whose value is a 2-tuple so that
/// [`Unpack::then`] takes a two-argument closure instead of one taking the
/// packed tuple.
pub struct Unpack<S> {
    inner: S,
}

pub fn unpack<S>(inner: S) -> Unpack<S> {
    Unpack { inner }
}

impl<S, A, B> Unpack<S>
where
    S: Sender<Value = (A, B)>,
    A: Send + 'static,
    B: Send + 'static,
{
    pub fn then<F, Out>(self, f: F) -> Then<S, impl FnOnce((A, B)) -> Out + Send + 'static>
    where
        F: FnOnce(A, B) -> Out + Send + 'static,
        Out: Send + 'static,
    {
        then(self.inner, move |(a, b)| f(a, b))
    }
}

/// `sync_wait(sender)`: block the calling (non-fiber) OS thread until the
/// connected pipeline completes; returns the value or propagates the error.
/// A `set_stopped` completion is reported as `BadLogic` — there is no value
/// to return and no error to propagate, so this is the one place cancellation
/// does not pass through unchanged.
pub fn sync_wait<S: Sender>(sender: S) -> Result<S::Value, WeftError> {
    struct Shared<T> {
        outcome: parking_lot::Mutex<Option<Completion<T>>>,
        cv: parking_lot::Condvar,
    }
    struct SyncReceiver<T: Send + 'static> {
        shared: Arc<Shared<T>>,
    }
    impl<T: Send + 'static> Receiver for SyncReceiver<T> {
        type Value = T;
        fn set_value(self, value: T) {
            *self.shared.outcome.lock() = Some(Completion::Value(value));
            self.shared.cv.notify_one();
        }
        fn set_error(self, error: WeftError) {
            *self.shared.outcome.lock() = Some(Completion::Error(error));
            self.shared.cv.notify_one();
        }
        fn set_stopped(self) {
            *self.shared.outcome.lock() = Some(Completion::Stopped);
            self.shared.cv.notify_one();
        }
    }

    let shared = Arc::new(Shared {
        outcome: parking_lot::Mutex::new(None),
        cv: parking_lot::Condvar::new(),
    });
    let op = sender.connect(SyncReceiver {
        shared: Arc::clone(&shared),
    });
    op.start();

    let mut guard = shared.outcome.lock();
    while guard.is_none() {
        shared.cv.wait(&mut guard);
    }
    match guard.take().expect("checked Some above") {
        Completion::Value(v) => Ok(v),
        Completion::Error(e) => Err(e),
        Completion::Stopped => Err(weft_error!(
            ErrorKind::BadLogic,
            "sync_wait: sender completed with set_stopped"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_scheduler::{SchedulerConfig, WorkerQueues};

    fn scheduler() -> (Arc<Scheduler>, WorkerQueues) {
        Scheduler::new(0, SchedulerConfig::default())
    }

    /// Drives a worker's step loop on the calling thread until `sync_wait`'s
    /// receiver fires — these tests don't spin up a real `weft-pool`, so the
    /// scheduler needs a hand to actually run what gets scheduled onto it.
    /// `queues` must stay on this same thread for the scheduler's whole
    /// lifetime, same contract `wait_or_add_new` documents.
    fn drain(scheduler: &Arc<Scheduler>, queues: &WorkerQueues, rounds: usize) {
        for _ in 0..rounds {
            scheduler.wait_or_add_new(queues);
        }
    }

    #[test]
    fn just_sync_wait_returns_value() {
        let result = sync_wait(just(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn then_transforms_value() {
        let result = sync_wait(then(just(2), |x: i32| x * 21));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn then_panic_routes_to_error() {
        let result = sync_wait(then(just(1), |_: i32| -> i32 { panic!("boom") }));
        assert!(result.is_err());
    }

    #[test]
    fn bulk_1000_increments() {
        let (sched, queues) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let pipeline = bulk(schedule(sched.clone()), 0..1000usize, move |_i, ()| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        std::thread::spawn(move || {
            while !done2.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_micros(100));
            }
        });
        let sched2 = Arc::clone(&sched);
        let handle = std::thread::spawn(move || {
            let r = sync_wait(pipeline);
            r
        });
        // Drive the scheduler concurrently until the pipeline completes.
        // `queues` stays on this thread for the scheduler's whole lifetime.
        while !handle.is_finished() {
            drain(&sched2, &queues, 16);
        }
        handle.join().unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn let_error_recovers_to_42() {
        let pipeline = let_error(
            then(just(()), |_: ()| -> () { panic!("boom") }),
            |_e: WeftError| just(42),
        );
        let result = sync_wait(pipeline);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn let_error_does_not_construct_successor_on_value() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let constructed2 = Arc::clone(&constructed);
        let pipeline = let_error(just(7), move |e: WeftError| {
            constructed2.fetch_add(1, Ordering::SeqCst);
            drop(e);
            just(0)
        });
        let result = sync_wait(pipeline);
        assert_eq!(result.unwrap(), 7);
        assert_eq!(constructed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unpack_then_destructures_tuple() {
        let pipeline = unpack(just((3, 4))).then(|a: i32, b: i32| a + b);
        assert_eq!(sync_wait(pipeline).unwrap(), 7);
    }

    #[test]
    fn drop_op_state_drops_guard_before_continuation() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped2 = Arc::clone(&dropped);
        let pipeline = then(
            drop_operation_state(just((1, Guard(dropped2.clone())))),
            move |v: i32| {
                // The guard must already be gone by the time this runs.
                assert_eq!(dropped2.load(Ordering::SeqCst), 1);
                v
            },
        );
        assert_eq!(sync_wait(pipeline).unwrap(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
