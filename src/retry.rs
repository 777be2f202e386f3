//! Retry policy for device operations.
//!
//! The policy is a pure function from `(error class, attempt index)` to a decision:
//! retry after an exponential backoff delay, or propagate. Keeping it free of I/O
//! makes the whole retry behavior testable without touching hardware, and keeps the
//! proxy's retry loop (see [`crate::device`]) a thin driver around table lookups.
//!
//! Delays follow `base * 2^attempt`, where each retryable class has its own base:
//! capture failures back off differently from connection drops, which back off
//! differently from timeouts. Unclassified errors use a conservative default base.

use std::time::Duration;

use crate::error::DeviceError;

/// Classification of an error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient capture/read failure.
    Capture,
    /// Transient connectivity failure.
    Connection,
    /// Per-attempt deadline expired.
    Timeout,
    /// Not worth repeating; propagate on first occurrence.
    Fatal,
    /// Unclassified; retried under the conservative default policy.
    Unknown,
}

impl RetryClass {
    /// Whether this class participates in retries at all.
    pub fn is_retryable(self) -> bool {
        !matches!(self, RetryClass::Fatal)
    }
}

/// Classify an error into its retry class.
pub fn classify(err: &DeviceError) -> RetryClass {
    match err {
        DeviceError::Capture { .. } => RetryClass::Capture,
        DeviceError::Connection { .. } => RetryClass::Connection,
        DeviceError::Timeout { .. } => RetryClass::Timeout,
        DeviceError::Internal(_) => RetryClass::Unknown,
        DeviceError::InvalidName(_)
        | DeviceError::NotFound(_)
        | DeviceError::NotInitialized(_)
        | DeviceError::AlreadyInitialized(_)
        | DeviceError::Initialization { .. }
        | DeviceError::Configuration { .. }
        | DeviceError::InvalidArgument(_)
        | DeviceError::OperationFailed { .. } => RetryClass::Fatal,
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    RetryAfter(Duration),
    /// Give up and surface the error to the caller.
    Propagate,
}

/// Per-device retry policy: total attempt budget plus class-specific backoff bases.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts for retryable errors (including the first).
    pub budget: u32,
    /// Backoff base for capture failures.
    pub capture_base: Duration,
    /// Backoff base for connection failures.
    pub connection_base: Duration,
    /// Backoff base for timeouts.
    pub timeout_base: Duration,
    /// Backoff base for unclassified errors.
    pub default_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 3,
            capture_base: Duration::from_millis(250),
            connection_base: Duration::from_millis(1000),
            timeout_base: Duration::from_millis(500),
            default_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after a failed attempt.
    ///
    /// `attempt` is the zero-based index of the attempt that just failed. Fatal
    /// classes always propagate; retryable classes propagate once the budget is
    /// spent, otherwise back off with `base * 2^attempt`.
    pub fn decide(&self, class: RetryClass, attempt: u32) -> RetryDecision {
        let base = match class {
            RetryClass::Fatal => return RetryDecision::Propagate,
            RetryClass::Capture => self.capture_base,
            RetryClass::Connection => self.connection_base,
            RetryClass::Timeout => self.timeout_base,
            RetryClass::Unknown => self.default_base,
        };
        if attempt + 1 >= self.budget {
            return RetryDecision::Propagate;
        }
        // Cap the shift so a misconfigured budget cannot overflow the multiplier.
        let factor = 1u32 << attempt.min(20);
        RetryDecision::RetryAfter(base.saturating_mul(factor))
    }

    /// Shape the error surfaced after the policy decided to propagate.
    ///
    /// Retryable classes re-raise the last error with the attempt count embedded;
    /// unclassified errors become a generic [`DeviceError::OperationFailed`]; fatal
    /// errors pass through untouched.
    pub fn exhausted(
        &self,
        err: DeviceError,
        class: RetryClass,
        attempts: u32,
        device: &str,
        operation: &str,
    ) -> DeviceError {
        match class {
            RetryClass::Fatal => err,
            RetryClass::Capture | RetryClass::Connection | RetryClass::Timeout => {
                err.with_attempts(attempts)
            }
            RetryClass::Unknown => DeviceError::OperationFailed {
                device: device.to_string(),
                operation: operation.to_string(),
                attempts,
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            budget: 3,
            capture_base: Duration::from_millis(100),
            connection_base: Duration::from_millis(400),
            timeout_base: Duration::from_millis(200),
            default_base: Duration::from_millis(300),
        }
    }

    #[test]
    fn classifies_retryable_and_fatal_errors() {
        let capture = DeviceError::Capture {
            device: "Mock:A".into(),
            message: "x".into(),
        };
        assert_eq!(classify(&capture), RetryClass::Capture);
        assert_eq!(
            classify(&DeviceError::InvalidName("x".into())),
            RetryClass::Fatal
        );
        assert_eq!(
            classify(&DeviceError::Internal("weird".into())),
            RetryClass::Unknown
        );
        assert!(RetryClass::Timeout.is_retryable());
        assert!(!RetryClass::Fatal.is_retryable());
    }

    #[test]
    fn fatal_always_propagates() {
        assert_eq!(
            policy().decide(RetryClass::Fatal, 0),
            RetryDecision::Propagate
        );
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy();
        assert_eq!(
            p.decide(RetryClass::Capture, 0),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(RetryClass::Capture, 1),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        // Third attempt is the last one in the budget.
        assert_eq!(p.decide(RetryClass::Capture, 2), RetryDecision::Propagate);
    }

    #[test]
    fn classes_use_distinct_bases() {
        let p = policy();
        assert_eq!(
            p.decide(RetryClass::Connection, 0),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
        assert_eq!(
            p.decide(RetryClass::Timeout, 0),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(RetryClass::Unknown, 0),
            RetryDecision::RetryAfter(Duration::from_millis(300))
        );
    }

    #[test]
    fn budget_of_one_never_retries() {
        let p = RetryPolicy {
            budget: 1,
            ..policy()
        };
        assert_eq!(p.decide(RetryClass::Capture, 0), RetryDecision::Propagate);
    }

    #[test]
    fn unknown_exhaustion_becomes_operation_failed() {
        let p = policy();
        let err = p.exhausted(
            DeviceError::Internal("glitch".into()),
            RetryClass::Unknown,
            3,
            "Mock:A",
            "capture",
        );
        match err {
            DeviceError::OperationFailed {
                device,
                operation,
                attempts,
                ..
            } => {
                assert_eq!(device, "Mock:A");
                assert_eq!(operation, "capture");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn retryable_exhaustion_keeps_variant() {
        let p = policy();
        let err = p.exhausted(
            DeviceError::Capture {
                device: "Mock:A".into(),
                message: "readout".into(),
            },
            RetryClass::Capture,
            3,
            "Mock:A",
            "capture",
        );
        assert!(matches!(err, DeviceError::Capture { .. }));
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
