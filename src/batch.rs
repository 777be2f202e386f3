//! Batch orchestration: fan one operation out to many devices.
//!
//! A batch spawns one unit of work per device, each bounded by the registry's
//! governor, collects every unit's outcome, and returns a [`BatchReport`] keyed
//! by device name. A batch never aborts on the first failure: every named device
//! gets exactly one entry in the report, success or failure, so callers can see
//! at a glance which devices delivered and which did not.
//!
//! Input validation is the one exception: an empty device set or a malformed
//! name is a caller bug and fails the whole call before any device is touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::device::{DeviceName, DeviceProxy};
use crate::error::{DeviceError, Result};
use crate::registry::DeviceRegistry;

/// Per-device outcomes of one batch operation, keyed by full device name.
///
/// The key set always equals the requested device set, including names that
/// were never initialized.
#[derive(Debug)]
pub struct BatchReport<T> {
    outcomes: HashMap<String, Result<T>>,
}

impl<T> BatchReport<T> {
    fn new(outcomes: HashMap<String, Result<T>>) -> Self {
        Self { outcomes }
    }

    /// Outcome for one device, if it was part of the batch.
    pub fn get(&self, name: &str) -> Option<&Result<T>> {
        self.outcomes.get(name)
    }

    /// Number of devices in the batch.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True when the batch named no devices. Cannot occur for reports produced
    /// by the registry, which rejects empty batches.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of devices whose unit succeeded.
    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_ok()).count()
    }

    /// Number of devices whose unit failed.
    pub fn fail_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    /// True when every unit succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.fail_count() == 0
    }

    /// Names of the devices whose unit failed, sorted.
    pub fn failed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.is_err())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Iterate over `(name, outcome)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Result<T>)> {
        self.outcomes.iter()
    }

    /// Consume the report into its outcome map.
    pub fn into_outcomes(self) -> HashMap<String, Result<T>> {
        self.outcomes
    }
}

impl DeviceRegistry {
    /// Structural validation shared by all batch entry points: the set must be
    /// non-empty, every name well-formed, and names unique. A duplicate name
    /// would collapse to one report entry and break the one-entry-per-input
    /// guarantee, so it is a caller bug, not a per-device failure.
    fn validate_batch_names(names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Err(DeviceError::InvalidArgument(
                "batch operation requires at least one device name".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in names {
            DeviceName::parse(name)?;
            if !seen.insert(name.as_str()) {
                return Err(DeviceError::InvalidArgument(format!(
                    "duplicate device name '{name}' in batch"
                )));
            }
        }
        Ok(())
    }

    /// Validate batch input and resolve each name to its proxy.
    ///
    /// Names without an active proxy become per-device `NotInitialized`
    /// entries so the report stays complete.
    async fn resolve_batch(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, Result<Arc<DeviceProxy>>)>> {
        Self::validate_batch_names(names)?;
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            resolved.push((name.clone(), self.get(name).await));
        }
        Ok(resolved)
    }

    /// Run one unit per device concurrently under the governor and collect the
    /// outcomes into a report.
    async fn run_batch<T, F, Fut>(
        self: &Arc<Self>,
        operation: &str,
        names: &[String],
        unit: F,
    ) -> Result<BatchReport<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<DeviceProxy>) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let resolved = self.resolve_batch(names).await?;

        let mut tasks = Vec::with_capacity(resolved.len());
        for (name, lookup) in resolved {
            let handle = match lookup {
                Ok(proxy) => {
                    let governor = Arc::clone(self.governor());
                    let fut = unit(proxy);
                    Some(tokio::spawn(async move {
                        let _permit = governor.acquire().await;
                        fut.await
                    }))
                }
                Err(_) => None,
            };
            tasks.push((name, handle));
        }

        let mut outcomes = HashMap::with_capacity(tasks.len());
        for (name, task) in tasks {
            let outcome = match task {
                Some(handle) => match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => Err(DeviceError::Internal(format!(
                        "batch task failed: {join_err}"
                    ))),
                },
                None => Err(DeviceError::NotInitialized(name.clone())),
            };
            if let Err(err) = &outcome {
                warn!(device = %name, operation, error = %err, "batch unit failed");
            }
            outcomes.insert(name, outcome);
        }

        let report = BatchReport::new(outcomes);
        info!(
            operation,
            total = report.len(),
            failed = report.fail_count(),
            "batch complete"
        );
        Ok(report)
    }

    /// Capture one artifact from every named device.
    pub async fn batch_capture(
        self: &Arc<Self>,
        names: &[String],
    ) -> Result<BatchReport<Artifact>> {
        self.run_batch("batch_capture", names, |proxy| async move {
            proxy.capture().await
        })
        .await
    }

    /// Apply the same settings map to every named device. Each entry reports
    /// whether all fields applied on that device (see [`DeviceProxy::configure`]).
    pub async fn batch_configure(
        self: &Arc<Self>,
        names: &[String],
        settings: &serde_json::Map<String, Value>,
    ) -> Result<BatchReport<bool>> {
        let settings = Arc::new(settings.clone());
        self.run_batch("batch_configure", names, move |proxy| {
            let settings = Arc::clone(&settings);
            async move { proxy.configure(&settings).await }
        })
        .await
    }

    /// Close every named device, one unit per device under the governor.
    /// Names that are not active succeed (close is idempotent), but malformed
    /// or duplicate names still abort the call.
    pub async fn batch_close(self: &Arc<Self>, names: &[String]) -> Result<BatchReport<()>> {
        Self::validate_batch_names(names)?;

        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            let registry = Arc::clone(self);
            let governor = Arc::clone(self.governor());
            let name = name.clone();
            tasks.push((
                name.clone(),
                tokio::spawn(async move {
                    let _permit = governor.acquire().await;
                    registry.close(&name).await
                }),
            ));
        }

        let mut outcomes = HashMap::with_capacity(tasks.len());
        for (name, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(DeviceError::Internal(format!(
                    "batch task failed: {join_err}"
                ))),
            };
            if let Err(err) = &outcome {
                warn!(device = %name, error = %err, "batch close failed");
            }
            outcomes.insert(name, outcome);
        }
        Ok(BatchReport::new(outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockBehavior, MockStats};
    use crate::settings::Settings;
    use serde_json::json;

    async fn registry_of(backend: MockBackend, names: &[&str]) -> Arc<DeviceRegistry> {
        let registry = Arc::new(
            DeviceRegistry::new(Settings::default())
                .unwrap()
                .with_driver(Arc::new(backend)),
        );
        for name in names {
            registry.initialize(name, true).await.unwrap();
        }
        registry
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn batch_capture_reports_every_device() {
        let backend = MockBackend::with_devices(["A", "B", "C"]).with_device_behavior(
            "B",
            MockBehavior {
                capture_failures: 10,
                ..MockBehavior::default()
            },
        );
        let registry = registry_of(backend, &["Mock:A", "Mock:B", "Mock:C"]).await;

        let requested = names(&["Mock:A", "Mock:B", "Mock:C", "Mock:ghost"]);
        let report = registry.batch_capture(&requested).await.unwrap();

        // Every requested name has exactly one entry.
        assert_eq!(report.len(), 4);
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.failed_names(), vec!["Mock:B", "Mock:ghost"]);
        assert!(report.get("Mock:A").unwrap().is_ok());
        assert!(matches!(
            report.get("Mock:ghost").unwrap(),
            Err(DeviceError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn batch_capture_rejects_empty_and_malformed_input() {
        let registry = registry_of(MockBackend::new(), &["Mock:A"]).await;

        assert!(matches!(
            registry.batch_capture(&[]).await,
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.batch_capture(&names(&["Mock:A", "bogus"])).await,
            Err(DeviceError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn batch_capture_respects_the_governor() {
        let backend = MockBackend::with_devices(["A", "B", "C"]).with_behavior(MockBehavior {
            capture_delay: std::time::Duration::from_millis(30),
            ..MockBehavior::default()
        });
        let stats: Arc<MockStats> = backend.stats();
        let registry = registry_of(backend, &["Mock:A", "Mock:B", "Mock:C"]).await;
        registry.set_concurrency_limit(1).unwrap();

        let report = registry
            .batch_capture(&names(&["Mock:A", "Mock:B", "Mock:C"]))
            .await
            .unwrap();
        assert!(report.all_succeeded());
        assert!(stats.max_in_flight() <= 1, "governor bound was exceeded");
    }

    #[tokio::test]
    async fn batch_configure_reports_partial_application() {
        let registry = registry_of(MockBackend::new(), &["Mock:A", "Mock:B"]).await;

        let mut settings = serde_json::Map::new();
        settings.insert("exposure".into(), json!(42.0));
        settings.insert("white_balance".into(), json!("auto")); // unknown, skipped

        let report = registry
            .batch_configure(&names(&["Mock:A", "Mock:B"]), &settings)
            .await
            .unwrap();
        assert!(report.all_succeeded());
        assert_eq!(report.get("Mock:A").unwrap().as_ref().unwrap(), &true);

        let proxy = registry.get("Mock:A").await.unwrap();
        assert_eq!(proxy.get_parameter("exposure").await.unwrap(), json!(42.0));
    }

    #[tokio::test]
    async fn batch_rejects_duplicate_names() {
        let registry = registry_of(MockBackend::new(), &["Mock:A", "Mock:B"]).await;

        let duplicated = names(&["Mock:A", "Mock:B", "Mock:A"]);
        assert!(matches!(
            registry.batch_capture(&duplicated).await,
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.batch_close(&duplicated).await,
            Err(DeviceError::InvalidArgument(_))
        ));

        // Without the duplicate, the report covers each name exactly once.
        let unique = names(&["Mock:A", "Mock:B"]);
        let report = registry.batch_capture(&unique).await.unwrap();
        assert_eq!(report.len(), unique.len());
        assert_eq!(report.success_count() + report.fail_count(), unique.len());
    }

    #[tokio::test]
    async fn batch_close_runs_units_under_the_governor() {
        let backend = MockBackend::with_devices(["A", "B", "C"]).with_device_behavior(
            "B",
            MockBehavior {
                fail_close: true,
                ..MockBehavior::default()
            },
        );
        let stats = backend.stats();
        let registry = registry_of(backend, &["Mock:A", "Mock:B", "Mock:C"]).await;
        registry.set_concurrency_limit(1).unwrap();

        let report = registry
            .batch_close(&names(&["Mock:A", "Mock:B", "Mock:C"]))
            .await
            .unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(report.failed_names(), vec!["Mock:B"]);
        // Every device saw exactly one close attempt and all permits drained.
        assert_eq!(stats.close_calls(), 3);
        assert_eq!(registry.governor().held(), 0);
        assert!(registry.active_devices().await.is_empty());
    }

    #[tokio::test]
    async fn batch_close_tolerates_inactive_names() {
        let registry = registry_of(MockBackend::new(), &["Mock:A", "Mock:B"]).await;

        let report = registry
            .batch_close(&names(&["Mock:A", "Mock:B", "Mock:never-opened"]))
            .await
            .unwrap();
        assert!(report.all_succeeded());
        assert!(registry.active_devices().await.is_empty());
    }
}
