//! Sequenced capture: sweep a parameter over a ladder of values, capturing at
//! each step.
//!
//! The canonical use is an HDR exposure bracket: plan a geometric ladder of
//! exposures around the device's current value, walk it step by step (set,
//! settle, capture), and restore the original value afterwards. The sweep is
//! best-effort per step — a failed set or capture skips that step and the sweep
//! continues — and the restore happens exactly once no matter how the steps
//! went. Only a sweep with zero successful captures is an error.

use std::sync::Arc;

use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::error::{DeviceError, Result};
use crate::registry::DeviceRegistry;

/// Phase of a sweep, attached to log events so a sweep's lifecycle can be
/// followed in the trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    /// Reading the current value and range, planning the ladder.
    Planning,
    /// Walking the ladder: set, settle, capture.
    Stepping,
    /// Restoring the original parameter value.
    Restoring,
    /// Sweep finished with at least one capture.
    Done,
    /// Sweep produced no captures at all.
    Failed,
}

/// One successful sweep step.
#[derive(Debug)]
pub struct SweepCapture {
    /// Parameter value the step ran at.
    pub value: f64,
    /// The captured artifact.
    pub artifact: Artifact,
}

/// One failed sweep step.
#[derive(Debug)]
pub struct SweepFailure {
    /// Parameter value the step ran at (or tried to).
    pub value: f64,
    /// What went wrong at this step.
    pub error: DeviceError,
}

/// Outcome of one parameter sweep.
#[derive(Debug)]
pub struct SweepReport {
    /// Device the sweep ran on.
    pub device: String,
    /// Parameter that was swept.
    pub parameter: String,
    /// Value the parameter had before the sweep.
    pub original_value: f64,
    /// The planned ladder, ascending, after clamping and deduplication.
    pub planned: Vec<f64>,
    /// Successful steps, in ladder order.
    pub captures: Vec<SweepCapture>,
    /// Failed steps, in ladder order.
    pub failures: Vec<SweepFailure>,
    /// Whether the original value was restored afterwards.
    pub restored: bool,
}

impl SweepReport {
    /// Number of steps that produced an artifact.
    pub fn successful_captures(&self) -> usize {
        self.captures.len()
    }

    /// True when some, but not all, steps succeeded.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() && !self.captures.is_empty()
    }
}

/// Plan a geometric ladder of `steps` values centered on `current`.
///
/// Step `i` is `current * multiplier^(i - steps/2)`, clamped into `range` when
/// one is given. The result is ascending with duplicates (from clamping)
/// removed, so it may be shorter than `steps`.
pub fn plan_ladder(
    current: f64,
    range: Option<(f64, f64)>,
    steps: u32,
    multiplier: f64,
) -> Result<Vec<f64>> {
    if steps < 1 {
        return Err(DeviceError::InvalidArgument(
            "sweep requires at least one step".into(),
        ));
    }
    if multiplier <= 0.0 || !multiplier.is_finite() {
        return Err(DeviceError::InvalidArgument(format!(
            "sweep multiplier must be positive and finite, got {multiplier}"
        )));
    }

    let center = (steps / 2) as i32;
    let mut ladder: Vec<f64> = (0..steps as i32)
        .map(|i| {
            let value = current * multiplier.powi(i - center);
            match range {
                Some((lo, hi)) => value.clamp(lo, hi),
                None => value,
            }
        })
        .collect();

    // Total order is fine here: the values are products of finite positives.
    ladder.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    ladder.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON * a.abs().max(1.0));
    Ok(ladder)
}

impl DeviceRegistry {
    /// Sweep a device's exposure over an HDR ladder, capturing at each step.
    pub async fn sequenced_capture(
        self: &Arc<Self>,
        name: &str,
        steps: u32,
        multiplier: f64,
    ) -> Result<SweepReport> {
        self.sweep_parameter(name, "exposure", steps, multiplier).await
    }

    /// Sweep an arbitrary numeric parameter. See [`Self::sequenced_capture`].
    pub async fn sweep_parameter(
        self: &Arc<Self>,
        name: &str,
        parameter: &str,
        steps: u32,
        multiplier: f64,
    ) -> Result<SweepReport> {
        let proxy = self.get(name).await?;

        let original = proxy.get_parameter(parameter).await?;
        let original_value = original.as_f64().ok_or_else(|| DeviceError::Configuration {
            device: name.to_string(),
            message: format!("parameter '{parameter}' is not numeric: {original}"),
        })?;
        let range = proxy.parameter_range(parameter).await?;

        let planned = plan_ladder(original_value, range, steps, multiplier)?;
        info!(
            device = %name,
            parameter,
            phase = ?SweepPhase::Planning,
            steps = planned.len(),
            ?range,
            "sweep planned"
        );

        let settle = self.settings().settle_delay;
        let mut captures = Vec::new();
        let mut failures = Vec::new();

        for &value in &planned {
            if let Err(err) = proxy.set_parameter(parameter, &json!(value)).await {
                warn!(device = %name, parameter, value, phase = ?SweepPhase::Stepping, error = %err, "sweep step skipped, set failed");
                failures.push(SweepFailure { value, error: err });
                continue;
            }
            sleep(settle).await;

            let _permit = self.governor().acquire().await;
            match proxy.capture().await {
                Ok(artifact) => {
                    debug!(device = %name, parameter, value, phase = ?SweepPhase::Stepping, "sweep step captured");
                    captures.push(SweepCapture { value, artifact });
                }
                Err(err) => {
                    warn!(device = %name, parameter, value, phase = ?SweepPhase::Stepping, error = %err, "sweep step skipped, capture failed");
                    failures.push(SweepFailure { value, error: err });
                }
            }
        }

        // Restore exactly once, regardless of how the steps went. A failed
        // restore is logged but does not change the sweep's outcome.
        let restored = match proxy.set_parameter(parameter, &json!(original_value)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(device = %name, parameter, original_value, phase = ?SweepPhase::Restoring, error = %err, "failed to restore parameter");
                false
            }
        };

        if captures.is_empty() {
            warn!(device = %name, parameter, phase = ?SweepPhase::Failed, restored, "sweep produced no captures");
            return Err(DeviceError::Capture {
                device: name.to_string(),
                message: format!(
                    "sweep of '{parameter}' produced 0 of {} captures",
                    planned.len()
                ),
            });
        }

        info!(
            device = %name,
            parameter,
            phase = ?SweepPhase::Done,
            captured = captures.len(),
            failed = failures.len(),
            restored,
            "sweep complete"
        );
        Ok(SweepReport {
            device: name.to_string(),
            parameter: parameter.to_string(),
            original_value,
            planned,
            captures,
            failures,
            restored,
        })
    }
}
