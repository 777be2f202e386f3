//! Captured data carrier types.
//!
//! A capture produces an [`Artifact`]: the device it came from, a timestamp, and a
//! payload variant matching the device family (frames for cameras, point clouds for
//! 3D scanners, scalars for sensors, raw blobs for everything else). Processing of
//! these payloads is out of scope for the orchestration core; this is only the
//! carrier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured result from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Full device name (`Backend:device-id`) that produced the capture.
    pub device: String,
    /// Capture completion time.
    pub timestamp: DateTime<Utc>,
    /// The captured payload.
    pub data: ArtifactData,
}

/// Payload of a capture, by device family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArtifactData {
    /// A 2D image frame (cameras).
    Frame {
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
        /// Row-major pixel data.
        pixels: Vec<u16>,
    },
    /// A 3D point cloud (scanners).
    PointCloud {
        /// XYZ points in device units.
        points: Vec<[f32; 3]>,
    },
    /// A single scalar reading (sensors, PLC registers).
    Scalar {
        /// Measured value.
        value: f64,
        /// Measurement unit (e.g. `"W"`, `"degC"`).
        unit: String,
    },
    /// Opaque vendor payload.
    Blob(Vec<u8>),
}

impl Artifact {
    /// Build an artifact stamped with the current time.
    pub fn now(device: impl Into<String>, data: ArtifactData) -> Self {
        Self {
            device: device.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Short human-readable description, for logs and the CLI.
    pub fn summary(&self) -> String {
        match &self.data {
            ArtifactData::Frame { width, height, .. } => {
                format!("{}: frame {width}x{height}", self.device)
            }
            ArtifactData::PointCloud { points } => {
                format!("{}: point cloud ({} points)", self.device, points.len())
            }
            ArtifactData::Scalar { value, unit } => {
                format!("{}: {value} {unit}", self.device)
            }
            ArtifactData::Blob(bytes) => format!("{}: blob ({} bytes)", self.device, bytes.len()),
        }
    }
}
