//! Worker error taxonomy.
//!
//! Every failure the worker can encounter is a variant of [`WorkerError`],
//! so the supervisor's retry policy can match exhaustively. The policy:
//!
//! - [`WorkerError::CoreOutdated`] is process-fatal (exit code `0x110`,
//!   consumed by host supervisors to trigger an update).
//! - Everything else is fatal for the current stream only; the supervisor
//!   logs it, applies backoff, and re-attempts a fresh assignment.
//!
//! Errors propagate out of the driver unchanged; no retry happens inside
//! the driver loop, so every retry starts from a clean assignment.

use thiserror::Error;

use crate::codec::CodecError;
use crate::engine::EngineError;
use crate::verify::VerificationError;

/// Exit code reported when the command center declares the core outdated.
pub const CORE_OUTDATED_EXIT_CODE: i32 = 0x110;

/// The closed error sum at the supervisor boundary.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Base64 / gzip / JSON payload could not be decoded.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    /// A `Content-MD5` digest did not match the bytes it covered.
    #[error("content digest mismatch: {0}")]
    Integrity(String),

    /// The command center rejected the assignment request (HTTP 400).
    #[error("command center rejected assignment: {0}")]
    BadRequest(String),

    /// The command center declared this core version outdated (HTTP 401).
    #[error("core is outdated and must be updated")]
    CoreOutdated,

    /// The stream server handed out a stream from a different target than
    /// the one the worker was constrained to.
    #[error("target mismatch: requested {requested}, assigned {assigned}")]
    TargetMismatch {
        /// Target id the worker was constrained to.
        requested: String,
        /// Target id the stream server returned.
        assigned: String,
    },

    /// The stream could not be started (non-200 on `/core/start`).
    #[error("could not start stream: {0}")]
    StartFailed(String),

    /// A frame, checkpoint, heartbeat, or stop submission was rejected.
    #[error("submission rejected: {0}")]
    SubmitFailed(String),

    /// The emitted state failed verification against the reference engine.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Connection-level failure: TLS handshake, reset, DNS, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Simulation engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Signal handler installation failed.
    #[error("lifecycle setup failed: {0}")]
    Lifecycle(String),
}

impl WorkerError {
    /// Maps this error to the worker's process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::CoreOutdated => CORE_OUTDATED_EXIT_CODE,
            _ => 1,
        }
    }

    /// Returns true if the process must terminate rather than retry.
    #[must_use]
    pub const fn is_process_fatal(&self) -> bool {
        matches!(self, Self::CoreOutdated)
    }
}

impl From<CodecError> for WorkerError {
    fn from(err: CodecError) -> Self {
        Self::MalformedEncoding(err.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedEncoding(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
