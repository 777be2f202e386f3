//! # Device Hub Core Library
//!
//! This crate is the orchestration core for heterogeneous lab hardware. It gives
//! higher layers (CLIs, services, language bindings) one uniform, concurrency-safe
//! surface over many vendor device backends: cameras, scanners, sensors — anything
//! that can discover devices, capture data, and expose named parameters.
//!
//! ## Crate Structure
//!
//! - **`artifact`**: The unit of captured data (`Artifact`) and its payload
//!   variants (frames, point clouds, scalar readings, opaque blobs).
//! - **`backend`**: The `BackendDriver`/`BackendCapability` traits every vendor
//!   backend implements, plus the scriptable `mock` backend used by the tests.
//! - **`batch`**: Fan-out of one operation across many devices with a complete
//!   per-device outcome report (`BatchReport`).
//! - **`device`**: `Backend:device-id` name parsing and the per-device
//!   `DeviceProxy` that serializes and retries hardware operations.
//! - **`error`**: The crate-wide `DeviceError` taxonomy; its variants drive the
//!   retry classifier.
//! - **`governor`**: The adjustable counting semaphore bounding how many device
//!   operations run at once.
//! - **`hdr`**: Sequenced capture — sweep a parameter (typically exposure) over
//!   a geometric ladder, capturing at each step.
//! - **`registry`**: The `DeviceRegistry`, owner of all active device proxies
//!   and the single entry point for lifecycle operations.
//! - **`retry`**: Failure classification and backoff policy for transient
//!   hardware faults.
//! - **`settings`**: TOML-backed runtime configuration (`Settings`).
//! - **`sync_facade`**: A blocking `SyncHub` front door for synchronous callers,
//!   running the registry on a dedicated runtime thread.
//! - **`telemetry`**: `tracing` subscriber setup.

pub mod artifact;
pub mod backend;
pub mod batch;
pub mod device;
pub mod error;
pub mod governor;
pub mod hdr;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod sync_facade;
pub mod telemetry;

pub use artifact::{Artifact, ArtifactData};
pub use backend::{Applied, BackendCapability, BackendDriver, DeviceDescriptor};
pub use batch::BatchReport;
pub use device::{DeviceName, DeviceProxy};
pub use error::{DeviceError, Result};
pub use governor::{Governor, GovernorPermit};
pub use hdr::{plan_ladder, SweepPhase, SweepReport};
pub use registry::DeviceRegistry;
pub use retry::{RetryClass, RetryPolicy};
pub use settings::Settings;
pub use sync_facade::SyncHub;
