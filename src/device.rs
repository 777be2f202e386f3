//! Device names and the per-device proxy.
//!
//! A [`DeviceName`] is the `"Backend:device-id"` key into the registry. A
//! [`DeviceProxy`] wraps exactly one backend capability instance for that name and
//! presents a serialized, retrying operation surface:
//!
//! - Every hardware-touching operation acquires the proxy's mutex for its entire
//!   duration (retries included), so at most one operation is in flight per device
//!   regardless of caller concurrency. Name accessors bypass the lock.
//! - Capture-class operations run under the retry policy from [`crate::retry`]:
//!   each attempt has its own deadline; a timeout counts as a retryable failure;
//!   non-retryable errors propagate on the first occurrence.
//!
//! The proxy owns its capability for its whole lifetime. It is created by the
//! registry on successful initialization and destroyed on close; no two proxies
//! ever share a capability instance.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::backend::{Applied, BackendCapability};
use crate::error::{DeviceError, Result};
use crate::retry::{classify, RetryDecision, RetryPolicy};

// =============================================================================
// Device names
// =============================================================================

/// A validated `"Backend:device-id"` device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceName {
    full: String,
    separator: usize,
}

impl DeviceName {
    /// Parse a full device name. Requires exactly one `:` with non-empty parts.
    pub fn parse(name: &str) -> Result<Self> {
        let mut colons = name.match_indices(':');
        let separator = match (colons.next(), colons.next()) {
            (Some((idx, _)), None) => idx,
            _ => return Err(DeviceError::InvalidName(name.to_string())),
        };
        if separator == 0 || separator + 1 == name.len() {
            return Err(DeviceError::InvalidName(name.to_string()));
        }
        Ok(Self {
            full: name.to_string(),
            separator,
        })
    }

    /// The full `Backend:device-id` string.
    pub fn full(&self) -> &str {
        &self.full
    }

    /// The backend part.
    pub fn backend(&self) -> &str {
        &self.full[..self.separator]
    }

    /// The device-id part.
    pub fn device_id(&self) -> &str {
        &self.full[self.separator + 1..]
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for DeviceName {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Device proxy
// =============================================================================

/// Serialized, retrying operation surface for one active device.
pub struct DeviceProxy {
    name: DeviceName,
    capability: Mutex<Box<dyn BackendCapability>>,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl DeviceProxy {
    /// Wrap a capability instance. Called by the registry after a successful
    /// backend initialization.
    pub fn new(
        name: DeviceName,
        capability: Box<dyn BackendCapability>,
        retry: RetryPolicy,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            name,
            capability: Mutex::new(capability),
            retry,
            operation_timeout,
        }
    }

    /// Full `Backend:device-id` name. Does not touch hardware.
    pub fn full_name(&self) -> &str {
        self.name.full()
    }

    /// Backend part of the name. Does not touch hardware.
    pub fn backend_name(&self) -> &str {
        self.name.backend()
    }

    /// Device-id part of the name. Does not touch hardware.
    pub fn device_id(&self) -> &str {
        self.name.device_id()
    }

    /// Capture one artifact, retrying transient failures per the retry policy.
    pub async fn capture(&self) -> Result<Artifact> {
        let mut capability = self.capability.lock().await;
        self.retrying("capture", |cap| cap.capture(), &mut capability)
            .await
    }

    /// Apply a settings map, field by field.
    ///
    /// Only keys present in the map are touched; keys the device does not know
    /// are skipped. Returns the AND of the per-field outcomes — partial
    /// application can occur, callers must not assume all-or-nothing semantics.
    pub async fn configure(&self, settings: &serde_json::Map<String, Value>) -> Result<bool> {
        let mut capability = self.capability.lock().await;
        let mut all_applied = true;
        for (param, value) in settings {
            let outcome = self
                .attempt_once(
                    "configure",
                    timeout(self.operation_timeout, capability.configure(param, value)),
                )
                .await?;
            match outcome {
                Applied::Applied => {}
                Applied::Rejected => {
                    warn!(device = self.full_name(), param, "configuration value rejected");
                    all_applied = false;
                }
                Applied::Unsupported => {
                    debug!(device = self.full_name(), param, "ignoring unknown setting");
                }
            }
        }
        Ok(all_applied)
    }

    /// Set a single parameter, failing if the device rejects or lacks it.
    pub async fn set_parameter(&self, param: &str, value: &Value) -> Result<()> {
        let mut capability = self.capability.lock().await;
        let outcome = self
            .attempt_once(
                "set_parameter",
                timeout(self.operation_timeout, capability.configure(param, value)),
            )
            .await?;
        match outcome {
            Applied::Applied => Ok(()),
            Applied::Rejected => Err(DeviceError::Configuration {
                device: self.full_name().to_string(),
                message: format!("value {value} rejected for parameter '{param}'"),
            }),
            Applied::Unsupported => Err(DeviceError::Configuration {
                device: self.full_name().to_string(),
                message: format!("parameter '{param}' is not supported"),
            }),
        }
    }

    /// Read back a parameter value.
    pub async fn get_parameter(&self, param: &str) -> Result<Value> {
        let capability = self.capability.lock().await;
        self.attempt_once(
            "get_parameter",
            timeout(self.operation_timeout, capability.get(param)),
        )
        .await
    }

    /// Legal range of a numeric parameter, when the device reports one.
    pub async fn parameter_range(&self, param: &str) -> Result<Option<(f64, f64)>> {
        let capability = self.capability.lock().await;
        self.attempt_once(
            "parameter_range",
            timeout(self.operation_timeout, capability.parameter_range(param)),
        )
        .await
    }

    /// Verify connectivity, retrying transient failures.
    pub async fn check_connection(&self) -> Result<bool> {
        let mut capability = self.capability.lock().await;
        self.retrying("check_connection", |cap| cap.check_connection(), &mut capability)
            .await
    }

    /// Close the underlying capability. The registry removes the proxy before
    /// calling this.
    pub async fn close(&self) -> Result<()> {
        let mut capability = self.capability.lock().await;
        timeout(self.operation_timeout, capability.close())
            .await
            .map_err(|_| self.timeout_error("close"))?
    }

    /// Run one attempt with the per-attempt deadline, without retrying.
    async fn attempt_once<T>(
        &self,
        operation: &str,
        fut: tokio::time::Timeout<impl std::future::Future<Output = Result<T>>>,
    ) -> Result<T> {
        match fut.await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(operation)),
        }
    }

    /// Retry loop for capture-class operations.
    ///
    /// Holds the capability borrow across attempts; the caller holds the proxy
    /// lock, so retries of one operation are never interleaved with another.
    async fn retrying<T, F>(
        &self,
        operation: &str,
        mut op: F,
        capability: &mut Box<dyn BackendCapability>,
    ) -> Result<T>
    where
        F: for<'a> FnMut(&'a mut (dyn BackendCapability + 'static)) -> BoxFuture<'a, Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match timeout(self.operation_timeout, op(capability.as_mut())).await {
                Ok(result) => result,
                Err(_) => Err(self.timeout_error(operation)),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            device = self.full_name(),
                            operation,
                            attempt = attempt + 1,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classify(&err);
            match self.retry.decide(class, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        device = self.full_name(),
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::Propagate => {
                    return Err(self.retry.exhausted(
                        err,
                        class,
                        attempt + 1,
                        self.full_name(),
                        operation,
                    ));
                }
            }
        }
    }

    fn timeout_error(&self, operation: &str) -> DeviceError {
        DeviceError::Timeout {
            device: self.full_name().to_string(),
            message: format!(
                "{operation} exceeded {} ms",
                self.operation_timeout.as_millis()
            ),
        }
    }
}

impl fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("name", &self.name.full())
            .field("retry_budget", &self.retry.budget)
            .finish_non_exhaustive()
    }
}
