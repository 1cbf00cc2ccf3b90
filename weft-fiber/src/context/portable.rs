//! Portable fallback context switch for architectures without a hand-rolled
//! register save/restore routine (anything but x86_64). Correctness-only:
//! each fiber actually runs on its own OS thread, parked on a condition
//! variable, handed control via a token rather than a real stack swap. This
//! is a documented degraded mode, not a silent behavior change — the
//! scheduler still gets cooperative semantics, just without the zero-syscall
//! switch cost stackful contexts normally buy.

use std::sync::{Arc, Condvar, Mutex};

struct Shared {
    running: Mutex<bool>,
    cv: Condvar,
}

pub struct ArchContext {
    shared: Arc<Shared>,
    pending_entry: Option<(extern "C" fn(usize) -> !, usize)>,
    started: bool,
}

impl ArchContext {
    pub fn empty() -> Self {
        ArchContext {
            shared: Arc::new(Shared {
                running: Mutex::new(false),
                cv: Condvar::new(),
            }),
            pending_entry: None,
            started: false,
        }
    }

    /// # Safety
    /// `stack_top` is unused on this fallback (the OS thread owns its own
    /// stack); kept in the signature for parity with the x86_64 backend.
    pub unsafe fn new(_stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Self {
        let mut ctx = Self::empty();
        ctx.pending_entry = Some((entry, arg));
        ctx
    }
}

pub(crate) unsafe fn swap(from: &mut ArchContext, to: &mut ArchContext) {
    if !to.started {
        to.started = true;
        let (entry, arg) = to.pending_entry.take().expect("context never initialized");
        let shared = Arc::clone(&to.shared);
        std::thread::Builder::new()
            .name("weft-fiber-fallback".into())
            .spawn(move || {
                {
                    let mut running = shared.running.lock().unwrap();
                    while !*running {
                        running = shared.cv.wait(running).unwrap();
                    }
                }
                entry(arg);
            })
            .expect("failed to spawn fallback fiber thread");
    }
    // Signal `to` to run, then block the calling side until it yields back.
    {
        let mut running = to.shared.running.lock().unwrap();
        *running = true;
        to.shared.cv.notify_all();
    }
    {
        let mut running = from.shared.running.lock().unwrap();
        *running = false;
        while !*running {
            running = from.shared.cv.wait(running).unwrap();
        }
    }
}
