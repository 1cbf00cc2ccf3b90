//! `weft`: a user-space M:N task runtime for numerical/tensor workloads.
//!
//! This crate is the thin umbrella over the `weft-*` workspace members —
//! topology, affinity planning, CPU masks, fiber contexts, the per-worker
//! scheduler, the thread pool, the `this_thread` execution agent,
//! cooperative sync primitives, sender/receiver pipelines, and runtime
//! bootstrap. Each concern lives in its own crate; this one just re-exports
//! them under one name and a [`prelude`] for applications that want the
//! whole surface in one `use`.
//!
//! A minimal program:
//!
//! ```no_run
//! use weft::prelude::*;
//!
//! fn main() {
//!     let argv: Vec<String> = std::env::args().collect();
//!     let code = RuntimeBuilder::new().initialize(&argv, |rt| {
//!         let result = sync_wait(bulk(schedule(rt.pool.scheduler(0).clone()), 0..8, |_i, ()| {}));
//!         if result.is_ok() { 0 } else { 1 }
//!     });
//!     std::process::exit(code);
//! }
//! ```

pub use weft_affinity as affinity;
pub use weft_config as config;
pub use weft_error as error;
pub use weft_executor as this_thread;
pub use weft_fiber as fiber;
pub use weft_mask as mask;
pub use weft_pool as pool;
pub use weft_runtime as runtime;
pub use weft_scheduler as scheduler;
pub use weft_senders as senders;
pub use weft_sync as sync;
pub use weft_topology as topology;

/// Everything most callers need in scope: mask/topology/affinity types, the
/// fiber and scheduler primitives, sync primitives, senders, and the runtime
/// bootstrap entry points.
pub mod prelude {
    pub use weft_affinity::{AffinityPlan, AffinityRequest, Domain, PuOffset};
    pub use weft_config::Config;
    pub use weft_error::{weft_error, ErrorKind, WeftError};
    pub use weft_executor::{
        resume, sleep_for, sleep_until, spin_k, suspend, yield_k, yield_now, yield_while,
        yield_while_timeout,
    };
    pub use weft_fiber::stack::StackSizeClass;
    pub use weft_fiber::{current, Fiber, FiberState, Priority};
    pub use weft_mask::PuMask;
    pub use weft_pool::{Pool, PoolState};
    pub use weft_runtime::{BootstrapArgs, Runtime, RuntimeBuilder};
    pub use weft_scheduler::{InitialState, Scheduler, SchedulerConfig, StepOutcome};
    pub use weft_senders::{
        bulk, drop_operation_state, just, let_error, schedule, schedule_from, sync_wait, then,
        unpack, OperationState, Receiver, Sender,
    };
    pub use weft_sync::{CondVar, Rescheduler, Semaphore, Spinlock, SpinlockGuard};
    pub use weft_topology::Topology;
}
