//! Error taxonomy for the acquisition core.
//!
//! Device wrappers return typed failures rather than retrying internally;
//! every retry/backoff decision lives in the scan orchestrator so the policy
//! is inspectable and testable without hardware. The split that matters to
//! the orchestrator is captured by [`ScanError::is_retryable`]:
//!
//! - `Configuration` — pre-scan validation failure, never retried.
//! - `CaptureTimeout` / `MotionTimeout` — transient, retried up to the
//!   plan's retry limit before the point is declared failed.
//! - `ShapeMismatch` — fatal to the current accumulation; indicates a
//!   device or configuration change mid-scan.
//! - `Bridge(_)` — fatal to the bridge session; acquisitions that require
//!   the bridged device cannot continue, though homing and shutdown can.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results in the acquisition core.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Failures of the out-of-process instrument bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The worker process could not be spawned, or did not acknowledge
    /// readiness within the configured timeout.
    #[error("bridge worker failed to start: {0}")]
    Start(String),

    /// No response arrived for an outstanding request before the deadline.
    #[error("bridge call timed out after {0:?}")]
    Timeout(Duration),

    /// The worker sent a response that could not be decoded, or one whose
    /// id does not match the outstanding request.
    #[error("bridge protocol violation: {0}")]
    Protocol(String),

    /// The worker reported a command-level failure.
    #[error("bridge command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// The underlying channel failed (broken pipe, worker exited).
    #[error("bridge channel error: {0}")]
    Channel(#[from] std::io::Error),
}

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Semantic configuration error caught before a scan starts.
    /// Fatal, never retried; requires a config change.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The scope armed but no trigger crossed the threshold before the
    /// deadline. Usually a mis-wired trigger cable or a disabled pulser.
    #[error("capture timed out after {waited:?}")]
    CaptureTimeout { waited: Duration },

    /// The gantry did not acknowledge motion-complete before the deadline.
    #[error("motion timed out after {waited:?}")]
    MotionTimeout { waited: Duration },

    /// A waveform offered to the averaging buffer does not match the shape
    /// of the accumulation in progress.
    #[error("waveform shape mismatch: expected {expected} samples, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Failure of the out-of-process bridge session.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A device reported a fault: an error status code, a malformed
    /// acknowledgment, or a refused command.
    #[error("device error: {0}")]
    Device(String),

    /// Underlying I/O failure on a device link or the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Whether the orchestrator may retry the failed operation.
    ///
    /// Only bounded-wait timeouts are retryable; everything else either
    /// needs operator intervention or indicates corrupted session state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::CaptureTimeout { .. } | ScanError::MotionTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable() {
        let waited = Duration::from_secs(1);
        assert!(ScanError::CaptureTimeout { waited }.is_retryable());
        assert!(ScanError::MotionTimeout { waited }.is_retryable());
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!ScanError::Configuration("bad step".into()).is_retryable());
        assert!(!ScanError::ShapeMismatch {
            expected: 500,
            actual: 512
        }
        .is_retryable());
        assert!(!ScanError::Bridge(BridgeError::Start("spawn failed".into())).is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = ScanError::ShapeMismatch {
            expected: 500,
            actual: 512,
        };
        assert_eq!(
            err.to_string(),
            "waveform shape mismatch: expected 500 samples, got 512"
        );
    }
}
