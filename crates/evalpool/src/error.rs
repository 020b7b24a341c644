//! Error kinds for pool and RPC operations.
//!
//! Failures are classified by kind, not by underlying exception: RPC-level
//! failures carry a synthetic [`ErrorCode`] and always cost the handle its
//! worker, while worker-reported script failures preserve the error-code and
//! error-info blobs from the wire and leave the worker alive.

use std::fmt;

use thiserror::Error;

/// Synthetic error codes for failures below the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The caller already holds handles from the pool it is reserving from.
    Deadlock,
    /// The reservation could not be satisfied.
    NoHandle,
    /// Spawning a worker process failed.
    Exec,
    /// An RPC was attempted on a handle with no attached worker.
    Dead,
    /// The request could not be written within the send timeout.
    SendFail,
    /// The evaluation deadline elapsed before the reply arrived.
    Timeout,
    /// The reply could not be read: error, EOF, or read timeout.
    RecvFail,
    /// The reply arrived but was not a valid response frame.
    Invalid,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Deadlock => "DEADLOCK",
            ErrorCode::NoHandle => "NOHANDLE",
            ErrorCode::Exec => "EXEC",
            ErrorCode::Dead => "DEAD",
            ErrorCode::SendFail => "SENDFAIL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RecvFail => "RECVFAIL",
            ErrorCode::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to callers of the pool API.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Reservation failure; `reason` is one of the fixed phrases
    /// "queue timeout", "pool disabled", "insufficient handles" or
    /// "proxy timeout".
    #[error("could not allocate from pool \"{pool}\": {reason}")]
    NoHandle { pool: String, reason: &'static str },

    /// The calling session already holds handles from this pool.
    #[error("session already owns handles from pool \"{0}\"")]
    Deadlock(String),

    /// The handle id is not held by the calling session.
    #[error("no such handle: {0}")]
    UnknownHandle(String),

    /// An RPC-level failure; the worker has been handed to the reaper.
    #[error("proxy call failed: {message}")]
    Rpc { code: ErrorCode, message: String },

    /// A failure reported by the evaluator inside the worker, with the
    /// error-code and error-info blobs preserved from the wire.
    #[error("{message}")]
    Script {
        code: Option<String>,
        info: Option<String>,
        message: String,
    },
}

impl PoolError {
    /// The error code string a command binding would install, e.g. "TIMEOUT".
    pub fn code_str(&self) -> String {
        match self {
            PoolError::NoHandle { .. } | PoolError::UnknownHandle(_) => {
                ErrorCode::NoHandle.as_str().to_string()
            }
            PoolError::Deadlock(_) => ErrorCode::Deadlock.as_str().to_string(),
            PoolError::Rpc { code, .. } => code.as_str().to_string(),
            PoolError::Script { code, .. } => {
                code.clone().unwrap_or_else(|| "ERROR".to_string())
            }
        }
    }
}
