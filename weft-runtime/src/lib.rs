//! Runtime bootstrap, logging, and CLI options.
//!
//! [`RuntimeBuilder`] collects startup/shutdown hooks, then
//! [`RuntimeBuilder::initialize`] runs the full bootstrap sequence: parse
//! `--weft:*` options, build the topology and affinity plan, build the
//! thread pool, run startup hooks, spawn `user_main` on a fresh fiber, wait
//! for it, run shutdown hooks in reverse, and stop the pool. `start`/`stop`
//! is the non-blocking split of the same sequence for embedding weft inside
//! a host process that owns its own main loop.

use clap::Parser;
use once_cell::sync::Lazy;
use parking_lot::Mutex as PLMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use weft_affinity::{AffinityRequest, Domain, PuOffset};
use weft_config::Config;
use weft_error::{weft_error, ErrorKind, WeftError};
use weft_fiber::{stack::StackSizeClass, Priority};
use weft_pool::Pool;
use weft_scheduler::{InitialState, SchedulerConfig};
use weft_topology::Topology;

/// A hard-coded exit code reported when bootstrap itself fails, before
/// `user_main` ever gets a chance to run.
pub const BOOTSTRAP_FAILURE_EXIT_CODE: i32 = 70;

/// Typed form of the `--weft:*` CLI surface. Long names carry the
/// `weft:` prefix literally so a pre-split of argv (see [`split_argv`]) can
/// hand this parser only the tokens meant for it.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "weft", no_binary_name = true)]
pub struct BootstrapArgs {
    /// Requested worker count: a positive integer, or `cores` for one worker
    /// per hardware thread.
    #[arg(long = "weft:threads")]
    pub threads: Option<String>,

    /// Textual affinity plan; `none` disables affinity, empty falls through
    /// to offset/step derivation.
    #[arg(long = "weft:bind")]
    pub bind: Option<String>,

    #[arg(long = "weft:pu-offset")]
    pub pu_offset: Option<usize>,

    #[arg(long = "weft:pu-step")]
    pub pu_step: Option<usize>,

    /// One of `pu`, `core`, `socket`, `machine` (prefix-matched).
    #[arg(long = "weft:affinity")]
    pub affinity: Option<String>,

    #[arg(long = "weft:no-lock-detection")]
    pub no_lock_detection: bool,

    #[arg(long = "weft:trace-depth")]
    pub trace_depth: Option<u64>,

    #[arg(long = "weft:dump-config")]
    pub dump_config: bool,

    #[arg(long = "weft:dump-config-initial")]
    pub dump_config_initial: bool,

    /// Path to an additional INI/TOML-hybrid file merged under `[application]`.
    #[arg(long = "weft:app-config")]
    pub app_config: Option<String>,
}

/// Split `argv` into the subsequence prefixed with `--weft:` (fed to
/// [`BootstrapArgs`]) and everything else, forwarded verbatim to
/// `user_main`.
pub fn split_argv(argv: &[String]) -> (Vec<String>, Vec<String>) {
    let mut weft_args = Vec::new();
    let mut rest = Vec::new();
    for a in argv {
        if a.starts_with("--weft:") {
            weft_args.push(a.clone());
        } else {
            rest.push(a.clone());
        }
    }
    (weft_args, rest)
}

/// Parse the `--weft:*` subset of `argv`. An unrecognized `--weft:` flag
/// aborts with clap's own usage error, matching the "unrecognized flags
/// abort" rule — anything not prefixed `--weft:` never reaches this
/// parser at all, so it can't collide with `user_main`'s own flags.
pub fn parse_bootstrap_args(argv: &[String]) -> Result<(BootstrapArgs, Vec<String>), WeftError> {
    let (weft_args, rest) = split_argv(argv);
    let parsed = BootstrapArgs::try_parse_from(weft_args.iter()).map_err(|e| {
        weft_error!(ErrorKind::BadParameter, "failed to parse --weft: options: {e}")
    })?;
    Ok((parsed, rest))
}

static LOGGING_INIT: std::sync::Once = std::sync::Once::new();

/// Wire up a `tracing` subscriber from `WEFT_LOG_LEVEL` / `WEFT_LOG_FORMAT` /
/// `WEFT_LOG_DESTINATION`. Safe to call more than once —
/// only the first call takes effect, so tests that each build their own
/// runtime don't panic on a double `set_global_default`.
pub fn init_logging() {
    LOGGING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("WEFT_LOG_LEVEL")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let destination =
            std::env::var("WEFT_LOG_DESTINATION").unwrap_or_else(|_| "stderr".to_string());
        let format = std::env::var("WEFT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = match (destination.as_str(), format.as_str()) {
            (_, "json") => builder.json().try_init(),
            (_, "pretty") => builder.pretty().try_init(),
            _ => builder.compact().try_init(),
        };
        if let Err(e) = result {
            eprintln!("weft: logging already initialized, ignoring: {e}");
        }
    });
}

/// Read the `WEFT_*` environment variables and set the
/// corresponding config keys, same as a CLI flag would.
fn apply_env_config(config: &Config) {
    for key in [
        "WEFT_LOG_LEVEL",
        "WEFT_LOG_DESTINATION",
        "WEFT_LOG_FORMAT",
        "WEFT_EXCEPTION_VERBOSITY",
    ] {
        if let Ok(val) = std::env::var(key) {
            config.strings.set(key, val);
        }
    }
    for key in [
        "WEFT_INSTALL_SIGNAL_HANDLERS",
        "WEFT_DIAGNOSTICS_ON_TERMINATE",
        "WEFT_ATTACH_DEBUGGER",
    ] {
        if let Ok(val) = std::env::var(key) {
            let b = matches!(val.trim(), "1" | "true" | "TRUE" | "yes");
            config.bools.set(key, b);
        }
    }
}

fn apply_bootstrap_args_config(config: &Config, args: &BootstrapArgs) {
    if let Some(t) = &args.threads {
        config.strings.set("weft.threads", t.clone());
    }
    if let Some(b) = &args.bind {
        config.strings.set("weft.bind", b.clone());
    }
    if let Some(v) = args.pu_offset {
        config.ints.set("weft.pu_offset", v as i64);
    }
    if let Some(v) = args.pu_step {
        config.ints.set("weft.pu_step", v as i64);
    }
    if let Some(a) = &args.affinity {
        config.strings.set("weft.affinity", a.clone());
    }
    config
        .bools
        .set("weft.no_lock_detection", args.no_lock_detection);
    if let Some(v) = args.trace_depth {
        config.ints.set("weft.trace_depth", v as i64);
    }
    config.bools.set("weft.dump_config", args.dump_config);
    config
        .bools
        .set("weft.dump_config_initial", args.dump_config_initial);
    if let Some(p) = &args.app_config {
        config.strings.set("weft.app_config", p.clone());
    }
}

fn worker_count(args: &BootstrapArgs, topo: &Topology) -> usize {
    match args.threads.as_deref() {
        Some("cores") => topo.num_pus().max(1),
        Some(n) => n.parse::<usize>().unwrap_or_else(|_| num_cpus::get()).max(1),
        None => num_cpus::get().max(1),
    }
}

fn affinity_request(args: &BootstrapArgs, workers: usize) -> AffinityRequest {
    let mut req = AffinityRequest {
        worker_count: workers,
        ..AffinityRequest::default()
    };
    if let Some(b) = &args.bind {
        req.textual_plan = b.clone();
    }
    if let Some(v) = args.pu_offset {
        req.pu_offset = PuOffset::Explicit(v);
    }
    if let Some(v) = args.pu_step {
        req.pu_step = v;
    }
    if let Some(a) = &args.affinity {
        if let Some(d) = Domain::parse(a) {
            req.domain = d;
        }
    }
    req
}

type Hook = Box<dyn FnOnce() + Send>;

/// Collects startup/shutdown hooks ahead of [`RuntimeBuilder::initialize`] or
/// [`RuntimeBuilder::start`]. Hooks run in registration order at startup,
/// reverse registration order at shutdown.
#[derive(Default)]
pub struct RuntimeBuilder {
    startup_hooks: Vec<Hook>,
    shutdown_hooks: Vec<Hook>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_startup(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.startup_hooks.push(Box::new(f));
        self
    }

    pub fn on_shutdown(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.shutdown_hooks.push(Box::new(f));
        self
    }

    /// Parse options, build topology/affinity/pool, and run startup hooks,
    /// but don't block waiting on a `user_main` — the non-blocking half of
    /// the `start`/`stop` pair. The returned [`Runtime`] owns the
    /// running pool; call [`Runtime::stop`] to drain and tear it down.
    pub fn start(self, argv: &[String]) -> Result<Arc<Runtime>, WeftError> {
        init_logging();
        let (args, forwarded) = parse_bootstrap_args(argv)?;

        let config = Arc::new(Config::new());
        apply_env_config(&config);
        apply_bootstrap_args_config(&config, &args);

        if let Some(path) = &args.app_config {
            let text = std::fs::read_to_string(path).map_err(|e| {
                weft_error!(ErrorKind::BadParameter, "failed to read --weft:app-config {path}: {e}")
            })?;
            config.merge_ini_like(&text, "application")?;
        }

        weft_sync::set_global_lock_tracking(!args.no_lock_detection);
        if let Some(depth) = args.trace_depth {
            weft_sync::set_trace_depth(depth);
        }

        if args.dump_config_initial {
            dump_config(&config);
        }

        let topology = Arc::new(Topology::discover());
        let workers = worker_count(&args, &topology);
        let plan = weft_affinity::resolve(&topology, &affinity_request(&args, workers))?;
        let masks = plan.masks().to_vec();

        let pool = Arc::new(Pool::new(
            Arc::clone(&topology),
            masks,
            SchedulerConfig::default(),
        ));

        for hook in self.startup_hooks {
            hook();
        }

        pool.run()?;
        install_signal_handlers_if_requested(&config);
        register_atexit_pool(&pool);

        if args.dump_config {
            dump_config(&config);
        }

        Ok(Arc::new(Runtime {
            config,
            topology,
            pool,
            forwarded_args: forwarded,
            shutdown_hooks: PLMutex::new(self.shutdown_hooks),
        }))
    }

    /// The blocking variant of the bootstrap sequence: `start`, run `user_main` on
    /// a fresh fiber on worker 0, wait for it, then tear everything down.
    /// Returns `user_main`'s own return code, or
    /// [`BOOTSTRAP_FAILURE_EXIT_CODE`] if bootstrap itself failed.
    pub fn initialize<F>(self, argv: &[String], user_main: F) -> i32
    where
        F: FnOnce(&Runtime) -> i32 + Send + 'static,
    {
        let runtime = match self.start(argv) {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e.render(2), "weft bootstrap failed");
                return BOOTSTRAP_FAILURE_EXIT_CODE;
            }
        };

        let (tx, rx) = std::sync::mpsc::channel::<i32>();
        let runtime_for_fiber = Arc::clone(&runtime);
        let spawn_result = runtime.pool.scheduler(0).create_thread(
            move || {
                let code = user_main(&runtime_for_fiber);
                let _ = tx.send(code);
            },
            Priority::Normal,
            StackSizeClass::Large,
            InitialState::Pending,
        );
        if let Err(e) = spawn_result {
            tracing::error!(error = %e.render(2), "failed to spawn user_main fiber");
            runtime.stop();
            return BOOTSTRAP_FAILURE_EXIT_CODE;
        }

        let code = rx.recv().unwrap_or(BOOTSTRAP_FAILURE_EXIT_CODE);
        runtime.stop();
        code
    }
}

fn dump_config(config: &Config) {
    for (k, v) in config.snapshot_as_strings() {
        tracing::info!(key = %k, value = %v, "weft config");
    }
}

static INSTALL_SIGNAL_HANDLERS_ONCE: std::sync::Once = std::sync::Once::new();

const HANDLED_SIGNALS: [libc::c_int; 7] = [
    libc::SIGINT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGPIPE,
    libc::SIGSEGV,
    libc::SIGSYS,
];

extern "C" fn signal_trampoline(sig: libc::c_int) {
    // Signal-safety rules forbid allocating or taking locks here; write a
    // fixed message with the raw `write` syscall instead of going through
    // `tracing`.
    let msg = b"weft: fatal signal received, terminating\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Install handlers for the signals documented for bootstrap, unless
/// `WEFT_INSTALL_SIGNAL_HANDLERS` is explicitly set to a falsy value.
fn install_signal_handlers_if_requested(config: &Config) {
    let enabled = config
        .bools
        .get("WEFT_INSTALL_SIGNAL_HANDLERS")
        .unwrap_or(true);
    if !enabled {
        return;
    }
    INSTALL_SIGNAL_HANDLERS_ONCE.call_once(|| {
        for sig in HANDLED_SIGNALS {
            unsafe {
                libc::signal(sig, signal_trampoline as libc::sighandler_t);
            }
        }
    });
}

static GLOBAL_POOL_FOR_ATEXIT: Lazy<PLMutex<Option<Weak<Pool>>>> =
    Lazy::new(|| PLMutex::new(None));
static ATEXIT_REGISTERED: AtomicBool = AtomicBool::new(false);

extern "C" fn atexit_stop_pool() {
    if let Some(pool) = GLOBAL_POOL_FOR_ATEXIT.lock().as_ref().and_then(Weak::upgrade) {
        if !matches!(pool.state(), weft_pool::PoolState::Stopped) {
            pool.stop();
        }
    }
}

/// Hook `atexit` so a late, user-triggered `std::process::exit` still drains
/// the pool instead of leaking worker threads.
fn register_atexit_pool(pool: &Arc<Pool>) {
    *GLOBAL_POOL_FOR_ATEXIT.lock() = Some(Arc::downgrade(pool));
    if !ATEXIT_REGISTERED.swap(true, Ordering::SeqCst) {
        unsafe {
            libc::atexit(atexit_stop_pool);
        }
    }
}

/// The live runtime: config, topology, and pool, plus whatever `argv` tail
/// wasn't claimed by `--weft:*` options.
pub struct Runtime {
    pub config: Arc<Config>,
    pub topology: Arc<Topology>,
    pub pool: Arc<Pool>,
    pub forwarded_args: Vec<String>,
    shutdown_hooks: PLMutex<Vec<Hook>>,
}

impl Runtime {
    /// The non-blocking half of teardown: finalize, wait for
    /// quiescence, run shutdown hooks in reverse registration order, stop
    /// the pool.
    pub fn stop(&self) {
        self.pool.finalize();
        self.pool.wait();
        let hooks: Vec<Hook> = std::mem::take(&mut *self.shutdown_hooks.lock());
        for hook in hooks.into_iter().rev() {
            hook();
        }
        self.pool.stop();
    }
}
