//! Error kinds and the diagnostic payload carried by a [`WeftError`].
//!
//! Inside a fiber, errors propagate as ordinary Rust `Result`/`?` unwinding;
//! at the top of a fiber an uncaught error is stored on the fiber descriptor
//! and rethrown by whoever joins it (a sender's `set_error`, `sync_wait`, or
//! an explicit `join`). This crate only defines the vocabulary; `weft-fiber`
//! and `weft-senders` are the propagation points.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Stable error categories. Each maps to a fixed integer code via
/// [`ErrorKind::code`]; platform errors that don't fit any of these tunnel
/// through [`ErrorKind::SystemError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("bad parameter")]
    BadParameter,
    #[error("bad logic")]
    BadLogic,
    #[error("invalid status")]
    InvalidStatus,
    #[error("null thread id")]
    NullThreadId,
    #[error("out of memory")]
    OutOfMemory,
    #[error("dynamic link failure")]
    DynamicLinkFailure,
    #[error("thread interrupted")]
    ThreadInterrupted,
    #[error("yield aborted")]
    YieldAborted,
    #[error("deadlock")]
    Deadlock,
    #[error("deadlock on suspend")]
    DeadlockOnSuspend,
    #[error("invalid config syntax")]
    InvalidConfigSyntax,
    #[error("system error (errno {0})")]
    SystemError(i32),
}

impl ErrorKind {
    /// Stable integer code, independent of enum discriminant ordering so the
    /// numbering can't drift if variants are reordered.
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::BadParameter => 1,
            ErrorKind::BadLogic => 2,
            ErrorKind::InvalidStatus => 3,
            ErrorKind::NullThreadId => 4,
            ErrorKind::OutOfMemory => 5,
            ErrorKind::DynamicLinkFailure => 6,
            ErrorKind::ThreadInterrupted => 7,
            ErrorKind::YieldAborted => 8,
            ErrorKind::Deadlock => 9,
            ErrorKind::DeadlockOnSuspend => 10,
            ErrorKind::InvalidConfigSyntax => 11,
            ErrorKind::SystemError(errno) => 1000 + errno,
        }
    }
}

/// Source location captured at the throw site, analogous to `#[track_caller]`
/// but stored rather than just reported, since it rides along with the error
/// across a fiber suspension.
#[derive(Debug, Clone)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.function)
    }
}

/// The full diagnostic payload. Verbosity of what gets printed is controlled
/// separately (`exception_verbosity`); this struct always carries
/// everything so a handler can decide how much to show.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message} ({location})")]
pub struct WeftError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Location,
    pub host: String,
    pub pid: u32,
    pub thread_id: u64,
    pub backtrace: Option<String>,
    /// Snapshot of `WEFT_*` environment variables only, never the full
    /// environment — diagnostics must not leak unrelated secrets.
    pub env_snapshot: BTreeMap<String, String>,
    /// Config snapshot (string keys only; numeric/bool maps are rendered to
    /// strings) taken at throw time, when a config handle was reachable.
    pub config_snapshot: BTreeMap<String, String>,
    /// The thread pool's C4.7 state name, when the error happened inside a
    /// running pool.
    pub state_name: Option<String>,
    pub aux: Vec<(String, String)>,
}

impl WeftError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: Location) -> Self {
        let env_snapshot = std::env::vars()
            .filter(|(k, _)| k.starts_with("WEFT_"))
            .collect();
        WeftError {
            kind,
            message: message.into(),
            location,
            host: hostname(),
            pid: std::process::id(),
            thread_id: thread_id_u64(),
            backtrace: None,
            env_snapshot,
            config_snapshot: BTreeMap::new(),
            state_name: None,
            aux: Vec::new(),
        }
    }

    /// Attach a captured backtrace. Separate from construction since capture
    /// is comparatively expensive and callers may suppress it via
    /// `exception_verbosity`.
    pub fn with_backtrace(mut self) -> Self {
        self.backtrace = Some(format!("{:?}", backtrace::Backtrace::new()));
        self
    }

    pub fn with_config_snapshot(mut self, snapshot: BTreeMap<String, String>) -> Self {
        self.config_snapshot = snapshot;
        self
    }

    pub fn with_state_name(mut self, state: impl Into<String>) -> Self {
        self.state_name = Some(state.into());
        self
    }

    pub fn with_aux(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.aux.push((key.into(), value.into()));
        self
    }

    /// Render at the requested verbosity: 0 = kind + message only, 1 adds
    /// location/host/pid/thread, 2 adds backtrace/env/config/aux.
    pub fn render(&self, verbosity: u8) -> String {
        let mut s = format!("{}: {}", self.kind, self.message);
        if verbosity >= 1 {
            s.push_str(&format!(
                "\n  at {} (host={} pid={} thread={})",
                self.location, self.host, self.pid, self.thread_id
            ));
        }
        if verbosity >= 2 {
            if let Some(bt) = &self.backtrace {
                s.push_str(&format!("\nbacktrace:\n{bt}"));
            }
            if !self.env_snapshot.is_empty() {
                s.push_str(&format!("\nenv: {:?}", self.env_snapshot));
            }
            if !self.config_snapshot.is_empty() {
                s.push_str(&format!("\nconfig: {:?}", self.config_snapshot));
            }
            if let Some(state) = &self.state_name {
                s.push_str(&format!("\npool state: {state}"));
            }
            for (k, v) in &self.aux {
                s.push_str(&format!("\n{k}: {v}"));
            }
        }
        s
    }
}

fn hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        return h;
    }
    // SAFETY: buf is a valid, sufficiently large stack buffer; gethostname
    // writes at most buf.len() bytes and null-terminates on success.
    let mut buf = vec![0u8; 256];
    unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            return String::from_utf8_lossy(&buf[..len]).into_owned();
        }
    }
    "unknown-host".to_string()
}

fn thread_id_u64() -> u64 {
    // std::thread::ThreadId has no stable numeric accessor; hash it instead
    // of depending on its Debug format.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

/// Shorthand for constructing a [`WeftError`] with the call site's location,
/// capturing the call site automatically rather than requiring it spelled
/// out at every call.
#[macro_export]
macro_rules! weft_error {
    ($kind:expr, $($arg:tt)*) => {
        $crate::WeftError::new(
            $kind,
            format!($($arg)*),
            $crate::Location { file: file!(), line: line!(), function: module_path!() },
        )
    };
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_stable() {
        assert_eq!(ErrorKind::BadParameter.code(), 1);
        assert_eq!(ErrorKind::SystemError(2).code(), 1002);
    }

    #[test]
    fn macro_captures_location() {
        let e = weft_error!(ErrorKind::BadLogic, "oops {}", 42);
        assert_eq!(e.message, "oops 42");
        assert!(e.location.file.ends_with("lib.rs"));
    }

    #[test]
    fn render_verbosity_levels() {
        let e = weft_error!(ErrorKind::Deadlock, "stuck");
        assert!(!e.render(0).contains("host="));
        assert!(e.render(1).contains("host="));
    }
}
