//! Custom error types for the orchestration core.
//!
//! This module defines the primary error type, `DeviceError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failure modes of device orchestration, from malformed device names to hardware
//! operations that keep failing after their retry budget is spent.
//!
//! ## Error Taxonomy
//!
//! The variants split into three groups that the retry policy (see [`crate::retry`])
//! treats differently:
//!
//! - **Non-retryable**: `InvalidName`, `NotFound`, `NotInitialized`, `AlreadyInitialized`,
//!   `Initialization`, `Configuration`, `InvalidArgument`. These describe conditions that
//!   repeating the operation cannot fix; they propagate on first occurrence.
//! - **Retryable**: `Capture`, `Connection`, `Timeout`. Transient hardware or bus
//!   failures; each class retries with its own backoff base before being re-raised
//!   with the attempt count embedded in the message.
//! - **Unclassified**: `Internal`. Anything a driver reports that the core cannot
//!   classify. Retried under a conservative default policy and, on exhaustion,
//!   re-raised as `OperationFailed`.
//!
//! Every variant carries enough context (device name, operation, attempt count where
//! applicable) that the rendered message is support-actionable without a stack trace.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors produced by the device orchestration core.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device name does not have the `Backend:device-id` shape.
    #[error("invalid device name '{0}': expected 'Backend:device-id'")]
    InvalidName(String),

    /// The backend or device is unknown to the driver table.
    #[error("not found: {0}")]
    NotFound(String),

    /// The device name is not currently active in the registry.
    #[error("device '{0}' is not initialized")]
    NotInitialized(String),

    /// The device name is already active; a second proxy would race the same
    /// hardware handle.
    #[error("device '{0}' is already initialized")]
    AlreadyInitialized(String),

    /// The backend capability failed to initialize.
    #[error("initialization failed for '{device}': {message}")]
    Initialization {
        /// Full device name.
        device: String,
        /// Driver-reported failure detail.
        message: String,
    },

    /// Connectivity to the device could not be established or verified.
    #[error("connection failed for '{device}': {message}")]
    Connection {
        /// Full device name.
        device: String,
        /// Driver-reported failure detail.
        message: String,
    },

    /// A capture/read operation failed.
    #[error("capture failed for '{device}': {message}")]
    Capture {
        /// Full device name.
        device: String,
        /// Driver-reported failure detail.
        message: String,
    },

    /// A configuration operation failed or a parameter was rejected.
    #[error("configuration failed for '{device}': {message}")]
    Configuration {
        /// Full device name.
        device: String,
        /// Driver-reported failure detail.
        message: String,
    },

    /// An operation exceeded its per-attempt deadline.
    #[error("timeout on '{device}': {message}")]
    Timeout {
        /// Full device name (or calling surface for façade-level timeouts).
        device: String,
        /// What timed out and after how long.
        message: String,
    },

    /// A caller-supplied argument is out of range (e.g. a concurrency limit below 1).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation kept failing with unclassified errors until its retry budget
    /// was exhausted.
    #[error("operation '{operation}' failed on '{device}' after {attempts} attempts: {message}")]
    OperationFailed {
        /// Full device name.
        device: String,
        /// Operation label (e.g. `capture`).
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last observed failure detail.
        message: String,
    },

    /// An unclassified failure from a driver or from crate internals.
    #[error("{0}")]
    Internal(String),
}

impl DeviceError {
    /// Embed the attempt count into a retryable error's message.
    ///
    /// Used when a retryable error exhausts its budget: the last error is re-raised
    /// with the number of attempts appended so the failure is reproducible from the
    /// message alone. Non-retryable variants pass through unchanged.
    pub fn with_attempts(self, attempts: u32) -> Self {
        if attempts <= 1 {
            return self;
        }
        match self {
            DeviceError::Capture { device, message } => DeviceError::Capture {
                device,
                message: format!("{message} (after {attempts} attempts)"),
            },
            DeviceError::Connection { device, message } => DeviceError::Connection {
                device,
                message: format!("{message} (after {attempts} attempts)"),
            },
            DeviceError::Timeout { device, message } => DeviceError::Timeout {
                device,
                message: format!("{message} (after {attempts} attempts)"),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_embed_attempt_count() {
        let err = DeviceError::Capture {
            device: "Mock:A".into(),
            message: "sensor readout failed".into(),
        };
        let annotated = err.with_attempts(3);
        assert_eq!(
            annotated.to_string(),
            "capture failed for 'Mock:A': sensor readout failed (after 3 attempts)"
        );
    }

    #[test]
    fn single_attempt_is_not_annotated() {
        let err = DeviceError::Connection {
            device: "Mock:A".into(),
            message: "no route".into(),
        };
        assert!(!err.with_attempts(1).to_string().contains("attempts"));
    }

    #[test]
    fn fatal_errors_pass_through_unchanged() {
        let err = DeviceError::AlreadyInitialized("Mock:A".into());
        let annotated = err.with_attempts(5);
        assert_eq!(
            annotated.to_string(),
            "device 'Mock:A' is already initialized"
        );
    }
}
