// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Typed failure taxonomy for the analyzer core.
//!
//! Transient, per-request failures ([`Error::Timeout`], a single
//! [`Error::Communication`] hiccup) stay local to the affected request.
//! Structural failures (dead process, broken channel, tripped breaker)
//! surface through the controller's state stream instead. The core never
//! renders anything user-facing; callers get structured values.

use std::time::Duration;

use thiserror::Error;

use crate::analyzer::state::ServerState;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between a consumer and the analysis server.
///
/// `Clone` because cancellation fans one error out to every pending request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The server could not be launched or failed its handshake.
    #[error("startup failed: {0}")]
    Startup(String),

    /// A write, framing, or transport-level failure.
    #[error("communication failed: {0}")]
    Communication(String),

    /// No matching response arrived within the request's deadline.
    #[error("request '{command}' timed out after {timeout:?}")]
    Timeout {
        /// The command of the request that timed out.
        command: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The request was cancelled before a response arrived (shutdown or
    /// explicit cancellation).
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// The circuit breaker is open; the request was rejected without I/O.
    #[error("circuit open: request rejected without touching the server")]
    CircuitOpen,

    /// The server process exited while requests were in flight.
    #[error("analysis server exited unexpectedly (exit code {code:?})")]
    Crash {
        /// Exit code reported by the OS, if any.
        code: Option<i32>,
    },

    /// A response body did not match the shape the call site expected.
    #[error("failed to decode response body: {0}")]
    Decode(String),

    /// A lifecycle operation was attempted in a state that forbids it.
    #[error("cannot {operation} while server is {state}")]
    InvalidState {
        /// The operation that was rejected.
        operation: &'static str,
        /// The state the server was in.
        state: ServerState,
    },
}

impl Error {
    /// Whether a retry policy may re-attempt after this failure.
    ///
    /// Only transient transport failures qualify. An open breaker and an
    /// explicit cancellation must never be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures_are_retryable() {
        assert!(Error::Communication("pipe closed".into()).is_retryable());
        assert!(
            Error::Timeout {
                command: "ping".into(),
                timeout: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_terminal_failures_are_not_retryable() {
        assert!(!Error::CircuitOpen.is_retryable());
        assert!(!Error::Cancelled("shutdown".into()).is_retryable());
        assert!(!Error::Startup("no such file".into()).is_retryable());
        assert!(!Error::Crash { code: Some(1) }.is_retryable());
        assert!(!Error::Decode("expected object".into()).is_retryable());
    }
}
