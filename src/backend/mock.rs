//! Mock backend for testing without physical hardware.
//!
//! `MockBackend` fronts a configurable set of simulated camera-like devices. Each
//! opened `MockDevice` has an exposure and gain parameter with legal ranges, frame
//! capture with simulated sensor noise, and scriptable failure injection (fail the
//! first N captures, fail connectivity checks, fail at a specific exposure value)
//! so retry, batch and sequenced-capture behavior can be exercised deterministically.
//!
//! A shared [`MockStats`] counts capture attempts and tracks the maximum number of
//! captures in flight at once, which is how tests observe the concurrency governor's
//! bound from the outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::artifact::{Artifact, ArtifactData};
use crate::backend::{Applied, BackendCapability, BackendDriver, DeviceDescriptor};
use crate::error::{DeviceError, Result};

/// Legal exposure range of a mock device, in milliseconds.
pub const EXPOSURE_RANGE: (f64, f64) = (1.0, 1000.0);
/// Legal gain range of a mock device.
pub const GAIN_RANGE: (f64, f64) = (0.0, 10.0);

const FRAME_WIDTH: u32 = 8;
const FRAME_HEIGHT: u32 = 8;

// =============================================================================
// Shared observation counters
// =============================================================================

/// Counters shared by all devices of one `MockBackend`.
#[derive(Debug, Default)]
pub struct MockStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    capture_calls: AtomicU32,
    close_calls: AtomicU32,
}

impl MockStats {
    fn enter(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of captures observed in flight simultaneously.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total capture attempts across all devices, including injected failures.
    pub fn capture_calls(&self) -> u32 {
        self.capture_calls.load(Ordering::SeqCst)
    }

    /// Total close attempts across all devices, including injected failures.
    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Failure injection
// =============================================================================

/// Which error class an injected capture failure should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureKind {
    /// `DeviceError::Capture` (retryable, capture backoff).
    #[default]
    Capture,
    /// `DeviceError::Connection` (retryable, connection backoff).
    Connection,
    /// `DeviceError::Internal` (unclassified, conservative default policy).
    Unclassified,
}

/// Scripted behavior of a mock device.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Fail `initialize` with an initialization error.
    pub fail_initialize: bool,
    /// Report `Ok(false)` from every connectivity check.
    pub fail_connection: bool,
    /// Fail `close` with an unclassified error.
    pub fail_close: bool,
    /// Number of leading capture attempts that fail before captures succeed.
    pub capture_failures: u32,
    /// Error class of injected capture failures.
    pub capture_failure_kind: FailureKind,
    /// Fail any capture taken while the exposure equals this value.
    pub fail_capture_at_exposure: Option<f64>,
    /// Simulated readout time per capture.
    pub capture_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_initialize: false,
            fail_connection: false,
            fail_close: false,
            capture_failures: 0,
            capture_failure_kind: FailureKind::default(),
            fail_capture_at_exposure: None,
            capture_delay: Duration::from_millis(5),
        }
    }
}

// =============================================================================
// MockBackend - driver / factory
// =============================================================================

/// Mock backend driver with a fixed device list and scriptable behavior.
pub struct MockBackend {
    name: String,
    devices: Vec<String>,
    default_behavior: MockBehavior,
    overrides: HashMap<String, MockBehavior>,
    stats: Arc<MockStats>,
}

impl MockBackend {
    /// Backend named `Mock` with devices `A` and `B`.
    pub fn new() -> Self {
        Self::with_devices(["A", "B"])
    }

    /// Backend named `Mock` with the given device ids.
    pub fn with_devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "Mock".to_string(),
            devices: ids.into_iter().map(Into::into).collect(),
            default_behavior: MockBehavior::default(),
            overrides: HashMap::new(),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Set the behavior applied to every device without an override.
    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Override behavior for one device id.
    pub fn with_device_behavior(mut self, id: impl Into<String>, behavior: MockBehavior) -> Self {
        self.overrides.insert(id.into(), behavior);
        self
    }

    /// Shared observation counters for this backend's devices.
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self, include_details: bool) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .devices
            .iter()
            .map(|id| DeviceDescriptor {
                id: id.clone(),
                metadata: include_details.then(|| {
                    json!({
                        "model": "mock-cam",
                        "serial": format!("MOCK-{id}"),
                        "resolution": [FRAME_WIDTH, FRAME_HEIGHT],
                    })
                }),
            })
            .collect())
    }

    fn open(&self, device_id: &str) -> Result<Box<dyn BackendCapability>> {
        if !self.devices.iter().any(|d| d == device_id) {
            return Err(DeviceError::NotFound(format!(
                "device '{device_id}' in backend '{}'",
                self.name
            )));
        }
        let behavior = self
            .overrides
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());
        Ok(Box::new(MockDevice::new(
            format!("{}:{device_id}", self.name),
            behavior,
            Arc::clone(&self.stats),
        )))
    }
}

// =============================================================================
// MockDevice - capability instance
// =============================================================================

/// One opened mock device. The owning proxy serializes access, so plain fields
/// suffice for state.
pub struct MockDevice {
    full_name: String,
    behavior: MockBehavior,
    stats: Arc<MockStats>,
    remaining_capture_failures: u32,
    initialized: bool,
    closed: bool,
    exposure: f64,
    gain: f64,
    frame_counter: u64,
}

impl MockDevice {
    fn new(full_name: String, behavior: MockBehavior, stats: Arc<MockStats>) -> Self {
        let remaining = behavior.capture_failures;
        Self {
            full_name,
            behavior,
            stats,
            remaining_capture_failures: remaining,
            initialized: false,
            closed: false,
            exposure: 10.0,
            gain: 1.0,
            frame_counter: 0,
        }
    }

    fn injected_failure(&self, message: String) -> DeviceError {
        match self.behavior.capture_failure_kind {
            FailureKind::Capture => DeviceError::Capture {
                device: self.full_name.clone(),
                message,
            },
            FailureKind::Connection => DeviceError::Connection {
                device: self.full_name.clone(),
                message,
            },
            FailureKind::Unclassified => DeviceError::Internal(format!(
                "unclassified fault on '{}': {message}",
                self.full_name
            )),
        }
    }
}

#[async_trait]
impl BackendCapability for MockDevice {
    async fn initialize(&mut self) -> Result<()> {
        if self.behavior.fail_initialize {
            return Err(DeviceError::Initialization {
                device: self.full_name.clone(),
                message: "injected initialize failure".into(),
            });
        }
        self.initialized = true;
        self.closed = false;
        Ok(())
    }

    async fn capture(&mut self) -> Result<Artifact> {
        self.stats.capture_calls.fetch_add(1, Ordering::SeqCst);

        if !self.initialized || self.closed {
            return Err(DeviceError::Initialization {
                device: self.full_name.clone(),
                message: "capture on a device that is not operational".into(),
            });
        }
        if self.remaining_capture_failures > 0 {
            self.remaining_capture_failures -= 1;
            return Err(self.injected_failure("injected capture failure".into()));
        }
        if let Some(bad) = self.behavior.fail_capture_at_exposure {
            if (self.exposure - bad).abs() < 1e-9 {
                return Err(DeviceError::Capture {
                    device: self.full_name.clone(),
                    message: format!("sensor saturated at exposure {bad}"),
                });
            }
        }

        self.stats.enter();
        sleep(self.behavior.capture_delay).await;
        self.frame_counter += 1;

        let mut rng = rand::thread_rng();
        let base = (self.exposure * self.gain * 10.0).min(f64::from(u16::MAX - 64)) as u16;
        let pixels = (0..FRAME_WIDTH * FRAME_HEIGHT)
            .map(|_| base + rng.gen_range(0..64u16))
            .collect();
        self.stats.exit();

        Ok(Artifact::now(
            self.full_name.clone(),
            ArtifactData::Frame {
                width: FRAME_WIDTH,
                height: FRAME_HEIGHT,
                pixels,
            },
        ))
    }

    async fn configure(&mut self, param: &str, value: &Value) -> Result<Applied> {
        let numeric = value.as_f64();
        match param {
            "exposure" => match numeric {
                Some(v) if (EXPOSURE_RANGE.0..=EXPOSURE_RANGE.1).contains(&v) => {
                    self.exposure = v;
                    Ok(Applied::Applied)
                }
                _ => Ok(Applied::Rejected),
            },
            "gain" => match numeric {
                Some(v) if (GAIN_RANGE.0..=GAIN_RANGE.1).contains(&v) => {
                    self.gain = v;
                    Ok(Applied::Applied)
                }
                _ => Ok(Applied::Rejected),
            },
            _ => Ok(Applied::Unsupported),
        }
    }

    async fn get(&self, param: &str) -> Result<Value> {
        match param {
            "exposure" => Ok(json!(self.exposure)),
            "gain" => Ok(json!(self.gain)),
            "frame_count" => Ok(json!(self.frame_counter)),
            _ => Err(DeviceError::Configuration {
                device: self.full_name.clone(),
                message: format!("unknown parameter '{param}'"),
            }),
        }
    }

    async fn parameter_range(&self, param: &str) -> Result<Option<(f64, f64)>> {
        Ok(match param {
            "exposure" => Some(EXPOSURE_RANGE),
            "gain" => Some(GAIN_RANGE),
            _ => None,
        })
    }

    async fn check_connection(&mut self) -> Result<bool> {
        Ok(!self.behavior.fail_connection)
    }

    async fn close(&mut self) -> Result<()> {
        self.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_close {
            return Err(DeviceError::Internal(format!(
                "injected close failure on '{}'",
                self.full_name
            )));
        }
        self.closed = true;
        self.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(backend: &MockBackend, id: &str) -> Box<dyn BackendCapability> {
        backend.open(id).unwrap()
    }

    #[tokio::test]
    async fn discover_lists_configured_devices() {
        let backend = MockBackend::new();
        let found = backend.discover(false).await.unwrap();
        let ids: Vec<_> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert!(found.iter().all(|d| d.metadata.is_none()));

        let detailed = backend.discover(true).await.unwrap();
        assert!(detailed.iter().all(|d| d.metadata.is_some()));
    }

    #[tokio::test]
    async fn open_unknown_device_is_not_found() {
        let backend = MockBackend::new();
        assert!(matches!(
            backend.open("Z").err(),
            Some(DeviceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn capture_produces_frame_after_initialize() {
        let backend = MockBackend::new();
        let mut device = open(&backend, "A");
        device.initialize().await.unwrap();

        let artifact = device.capture().await.unwrap();
        match artifact.data {
            ArtifactData::Frame { width, height, ref pixels } => {
                assert_eq!((width, height), (FRAME_WIDTH, FRAME_HEIGHT));
                assert_eq!(pixels.len(), (FRAME_WIDTH * FRAME_HEIGHT) as usize);
            }
            ref other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(backend.stats().capture_calls(), 1);
    }

    #[tokio::test]
    async fn capture_before_initialize_fails_fatally() {
        let backend = MockBackend::new();
        let mut device = open(&backend, "A");
        assert!(matches!(
            device.capture().await,
            Err(DeviceError::Initialization { .. })
        ));
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let backend = MockBackend::new().with_behavior(MockBehavior {
            capture_failures: 2,
            ..MockBehavior::default()
        });
        let mut device = open(&backend, "A");
        device.initialize().await.unwrap();

        assert!(device.capture().await.is_err());
        assert!(device.capture().await.is_err());
        assert!(device.capture().await.is_ok());
    }

    #[tokio::test]
    async fn configure_distinguishes_reject_and_unsupported() {
        let backend = MockBackend::new();
        let mut device = open(&backend, "A");
        device.initialize().await.unwrap();

        assert_eq!(
            device.configure("exposure", &json!(20.0)).await.unwrap(),
            Applied::Applied
        );
        assert_eq!(device.get("exposure").await.unwrap(), json!(20.0));

        // Out of range.
        assert_eq!(
            device.configure("exposure", &json!(1e9)).await.unwrap(),
            Applied::Rejected
        );
        // Unknown key.
        assert_eq!(
            device.configure("white_balance", &json!(1)).await.unwrap(),
            Applied::Unsupported
        );
    }

    #[tokio::test]
    async fn connection_failure_is_reported_cleanly() {
        let backend = MockBackend::new().with_behavior(MockBehavior {
            fail_connection: true,
            ..MockBehavior::default()
        });
        let mut device = open(&backend, "A");
        device.initialize().await.unwrap();
        assert!(!device.check_connection().await.unwrap());
    }
}
