//! Backend capability contract.
//!
//! Every vendor driver fronts its SDK behind two small traits:
//!
//! - [`BackendDriver`]: one per backend, knows how to enumerate devices
//!   (`discover`) and construct a capability instance for one of them (`open`).
//!   The Rust rendition of a driver class's static discovery plus constructor,
//!   registered in the registry's driver table by name.
//! - [`BackendCapability`]: one per opened device, the uniform operation surface
//!   the proxy serializes and retries against (`initialize`, `capture`,
//!   `configure`, `get`, `check_connection`, `close`).
//!
//! Both are async trait objects so the core never knows which vendor SDK sits
//! underneath. A capability instance is exclusively owned by one device proxy for
//! its entire lifetime; drivers must hand out a fresh instance per `open`.
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses the crate's `DeviceError` so failures stay classifiable for retry
//! - Treats parameter values as `serde_json::Value` to stay backend-agnostic

pub mod mock;

use async_trait::async_trait;
use serde_json::Value;

use crate::artifact::Artifact;
use crate::error::Result;

/// One device reported by backend discovery.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Backend-local device id (the part after the `:` in a full name).
    pub id: String,
    /// Vendor metadata (model, serial, firmware), present when discovery ran
    /// with `include_details`.
    pub metadata: Option<Value>,
}

impl DeviceDescriptor {
    /// Descriptor with an id only.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: None,
        }
    }
}

/// Outcome of applying a single configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The parameter exists and the value was applied.
    Applied,
    /// The parameter exists but the value was refused (out of range, wrong type).
    Rejected,
    /// The parameter is unknown to this device; callers skip it.
    Unsupported,
}

/// Uniform operation surface of one opened device.
///
/// Mutating operations take `&mut self`; the owning proxy guarantees exclusive
/// access, so implementations need no internal locking.
#[async_trait]
pub trait BackendCapability: Send + Sync {
    /// Bring the device to an operational state (connect, allocate SDK handles).
    async fn initialize(&mut self) -> Result<()>;

    /// Acquire one unit of data (frame, scan, reading).
    async fn capture(&mut self) -> Result<Artifact>;

    /// Apply a single configuration field.
    async fn configure(&mut self, param: &str, value: &Value) -> Result<Applied>;

    /// Read back a parameter value.
    async fn get(&self, param: &str) -> Result<Value>;

    /// Legal range of a numeric parameter, when the device can report one.
    async fn parameter_range(&self, param: &str) -> Result<Option<(f64, f64)>>;

    /// Verify the device is reachable. `Ok(false)` means cleanly unreachable.
    async fn check_connection(&mut self) -> Result<bool>;

    /// Release the device and its SDK handles. Must be safe to call once.
    async fn close(&mut self) -> Result<()>;
}

/// Factory and discovery surface of one backend.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Backend name as used in `Backend:device-id` device names.
    fn name(&self) -> &str;

    /// Enumerate devices this backend can currently see.
    async fn discover(&self, include_details: bool) -> Result<Vec<DeviceDescriptor>>;

    /// Construct a capability instance for one device. Fails with `NotFound`
    /// for ids the backend does not know.
    fn open(&self, device_id: &str) -> Result<Box<dyn BackendCapability>>;
}
