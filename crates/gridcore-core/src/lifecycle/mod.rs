//! Process-wide cooperative cancellation.
//!
//! One boolean answers "should this worker wind down?". It is the
//! disjunction of three sources, all folded into the same predicate:
//!
//! - SIGINT / SIGTERM, whose handlers only set an atomic flag;
//! - an optional lifeline PID whose death (zero-signal probe) means the
//!   parent supervisor is gone;
//! - an optional wall-clock deadline (`--duration`).
//!
//! The flag is read-mostly, polled at loop-top granularity, and never
//! cleared within a process. Tests use [`ExitSignal::manual`] to get an
//! isolated flag that cannot leak across tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::WorkerError;

static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);
static LIFELINE_PID: AtomicI64 = AtomicI64::new(0);
static DEADLINE_EPOCH_SECS: AtomicU64 = AtomicU64::new(0);

extern "C" fn handle_exit_signal(_signum: libc::c_int) {
    // Async-signal-safe: a single atomic store.
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT and SIGTERM handlers.
///
/// # Errors
///
/// Returns [`WorkerError::Lifecycle`] if a handler cannot be installed.
pub fn init() -> Result<(), WorkerError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_exit_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        unsafe {
            signal::sigaction(sig, &action)
                .map_err(|e| WorkerError::Lifecycle(format!("installing {sig} handler: {e}")))?;
        }
    }
    Ok(())
}

/// Registers the parent process whose death triggers shutdown.
pub fn set_lifeline(pid: i32) {
    LIFELINE_PID.store(i64::from(pid), Ordering::SeqCst);
}

/// Arms the duration limit: the worker winds down once `seconds` of wall
/// clock have elapsed from now.
pub fn set_duration_limit(seconds: u64) {
    DEADLINE_EPOCH_SECS.store(now_epoch_secs() + seconds, Ordering::SeqCst);
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[allow(clippy::cast_possible_truncation)]
fn lifeline_dead() -> bool {
    let pid = LIFELINE_PID.load(Ordering::Relaxed);
    if pid == 0 {
        return false;
    }
    let probe = signal::kill(Pid::from_raw(pid as i32), None);
    // EPERM means the process exists but belongs to someone else.
    matches!(probe, Err(nix::errno::Errno::ESRCH))
}

fn deadline_passed() -> bool {
    let deadline = DEADLINE_EPOCH_SECS.load(Ordering::Relaxed);
    deadline != 0 && now_epoch_secs() >= deadline
}

/// A handle on the exit predicate.
///
/// [`ExitSignal::global`] reads the process-wide sources; cloning is
/// cheap and every clone observes the same state.
#[derive(Debug, Clone)]
pub enum ExitSignal {
    /// The process-wide predicate: signal flag, lifeline, deadline.
    Global,
    /// An isolated flag, for tests and embedding.
    Manual(Arc<AtomicBool>),
}

impl ExitSignal {
    /// The process-wide exit predicate.
    #[must_use]
    pub const fn global() -> Self {
        Self::Global
    }

    /// An isolated flag sharing no state with the process-wide predicate.
    #[must_use]
    pub fn manual() -> Self {
        Self::Manual(Arc::new(AtomicBool::new(false)))
    }

    /// Returns true once any exit source has fired.
    #[must_use]
    pub fn should_exit(&self) -> bool {
        match self {
            Self::Global => {
                if SHOULD_EXIT.load(Ordering::Relaxed) {
                    return true;
                }
                if lifeline_dead() || deadline_passed() {
                    // Fold the probe into the flag so later polls are a
                    // single load.
                    SHOULD_EXIT.store(true, Ordering::SeqCst);
                    return true;
                }
                false
            },
            Self::Manual(flag) => flag.load(Ordering::Relaxed),
        }
    }

    /// Requests exit through this handle.
    pub fn request_exit(&self) {
        match self {
            Self::Global => SHOULD_EXIT.store(true, Ordering::SeqCst),
            Self::Manual(flag) => flag.store(true, Ordering::SeqCst),
        }
    }
}
