//! Device registry: lifecycle orchestration for all active devices.
//!
//! The registry owns the map of active [`DeviceProxy`]s keyed by full device name,
//! the driver table used to discover and open devices, and the shared concurrency
//! [`Governor`]. It is the single place that creates and destroys proxies:
//!
//! - `initialize` opens a backend capability, verifies it, and publishes exactly
//!   one proxy per name. Double-initialize is a hard error — two proxies racing
//!   one hardware handle is how vendor SDKs corrupt state.
//! - `close` is idempotent; `close_all` sweeps everything, logging (not raising)
//!   per-device close failures.
//! - `initialize_batch` opens many devices concurrently, bounded by the governor,
//!   and reports the failed subset instead of aborting on the first failure.
//!
//! The active map and the governor's counters are the only shared mutable state
//! in the crate; map structural changes serialize on a mutex, and every insert
//! re-checks for a racing initialization before publishing.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::backend::BackendDriver;
use crate::device::{DeviceName, DeviceProxy};
use crate::error::{DeviceError, Result};
use crate::governor::Governor;
use crate::settings::Settings;

/// Registry of active devices, their drivers, and the shared governor.
pub struct DeviceRegistry {
    drivers: HashMap<String, Arc<dyn BackendDriver>>,
    active: Mutex<HashMap<String, Arc<DeviceProxy>>>,
    governor: Arc<Governor>,
    settings: Settings,
}

impl DeviceRegistry {
    /// Create an empty registry. Fails if the settings are invalid (e.g. a
    /// concurrency limit below 1).
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let governor = Governor::new(settings.concurrency_limit)?;
        Ok(Self {
            drivers: HashMap::new(),
            active: Mutex::new(HashMap::new()),
            governor,
            settings,
        })
    }

    /// Register a backend driver under its own name. Drivers are fixed after
    /// construction; replacing one while its devices are active is not supported.
    pub fn register_driver(&mut self, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Builder-style variant of [`Self::register_driver`].
    pub fn with_driver(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.register_driver(driver);
        self
    }

    /// The shared concurrency governor.
    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    /// The settings this registry was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Enumerate devices visible to the registered backends, as full
    /// `Backend:device-id` names.
    ///
    /// With a filter, only the matching backend is queried; an unknown backend
    /// name yields an empty result, not an error. A backend whose discovery
    /// fails is logged and skipped so one flaky vendor SDK cannot hide the rest.
    pub async fn discover(&self, backend_filter: Option<&str>) -> Vec<String> {
        let mut names = Vec::new();
        for (backend, driver) in &self.drivers {
            if let Some(filter) = backend_filter {
                if filter != backend {
                    continue;
                }
            }
            match driver.discover(false).await {
                Ok(descriptors) => {
                    names.extend(descriptors.iter().map(|d| format!("{backend}:{}", d.id)));
                }
                Err(err) => {
                    warn!(backend = %backend, error = %err, "discovery failed, skipping backend");
                }
            }
        }
        names.sort();
        names
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a device and publish its proxy.
    ///
    /// With `test_connection`, connectivity is verified after the backend
    /// initializes; on failure the capability is rolled back (closed) and a
    /// connection error is raised, leaving the registry unchanged.
    pub async fn initialize(&self, name: &str, test_connection: bool) -> Result<()> {
        let parsed = DeviceName::parse(name)?;
        let driver = self
            .drivers
            .get(parsed.backend())
            .ok_or_else(|| DeviceError::NotFound(format!("backend '{}'", parsed.backend())))?;

        // Fast-fail duplicates before touching hardware. The insert below
        // re-checks under the lock, so a racing initialize cannot slip through.
        if self.active.lock().await.contains_key(parsed.full()) {
            return Err(DeviceError::AlreadyInitialized(parsed.full().to_string()));
        }

        let mut capability = driver.open(parsed.device_id())?;
        if let Err(err) = capability.initialize().await {
            // `open` may already hold SDK handles; release them before bailing.
            if let Err(close_err) = capability.close().await {
                warn!(
                    device = parsed.full(),
                    error = %close_err,
                    "rollback close failed after initialization failure"
                );
            }
            return Err(match err {
                DeviceError::Initialization { .. } => err,
                other => DeviceError::Initialization {
                    device: parsed.full().to_string(),
                    message: other.to_string(),
                },
            });
        }

        if test_connection {
            let deadline = self.settings.connection_timeout(parsed.backend());
            let verdict = timeout(deadline, capability.check_connection()).await;
            let failure = match verdict {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some("device reported unreachable".to_string()),
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!(
                    "connection check exceeded {} ms",
                    deadline.as_millis()
                )),
            };
            if let Some(message) = failure {
                if let Err(close_err) = capability.close().await {
                    warn!(
                        device = parsed.full(),
                        error = %close_err,
                        "rollback close failed after connection check"
                    );
                }
                return Err(DeviceError::Connection {
                    device: parsed.full().to_string(),
                    message,
                });
            }
        }

        let proxy = Arc::new(DeviceProxy::new(
            parsed.clone(),
            capability,
            self.settings.retry.policy(),
            self.settings.operation_timeout,
        ));

        let mut active = self.active.lock().await;
        if active.contains_key(parsed.full()) {
            drop(active);
            // Lost an initialization race; roll back our capability.
            if let Err(close_err) = proxy.close().await {
                warn!(device = parsed.full(), error = %close_err, "rollback close failed");
            }
            return Err(DeviceError::AlreadyInitialized(parsed.full().to_string()));
        }
        active.insert(parsed.full().to_string(), proxy);
        info!(device = parsed.full(), "device initialized");
        Ok(())
    }

    /// Initialize many devices concurrently, bounded by the governor.
    ///
    /// Returns the subset of names that failed, in input order. Per-device
    /// failures (including names that are already active — a batch-local
    /// failure, deliberately unlike single `initialize`'s hard error) never
    /// disturb the other devices. Malformed names abort the whole batch before
    /// any device is touched.
    pub async fn initialize_batch(
        self: &Arc<Self>,
        names: &[String],
        test_connection: bool,
    ) -> Result<Vec<String>> {
        if names.is_empty() {
            return Err(DeviceError::InvalidArgument(
                "initialize_batch requires at least one device name".into(),
            ));
        }
        for name in names {
            DeviceName::parse(name)?;
        }

        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            let registry = Arc::clone(self);
            let governor = Arc::clone(&self.governor);
            let name = name.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = governor.acquire().await;
                registry.initialize(&name, test_connection).await
            }));
        }

        let mut failed = Vec::new();
        for (name, task) in names.iter().zip(tasks) {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(DeviceError::Internal(format!(
                    "initialization task failed: {join_err}"
                ))),
            };
            if let Err(err) = outcome {
                warn!(device = %name, error = %err, "batch initialization failure");
                failed.push(name.clone());
            }
        }
        Ok(failed)
    }

    /// Look up the proxy for an active device.
    pub async fn get(&self, name: &str) -> Result<Arc<DeviceProxy>> {
        self.active
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::NotInitialized(name.to_string()))
    }

    /// Names of all active devices, sorted.
    pub async fn active_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close a device and remove its proxy. Closing a name that is not active
    /// is a no-op success, unlike initialize.
    pub async fn close(&self, name: &str) -> Result<()> {
        let removed = self.active.lock().await.remove(name);
        match removed {
            Some(proxy) => {
                proxy.close().await?;
                info!(device = %name, "device closed");
                Ok(())
            }
            None => {
                debug!(device = %name, "close on inactive device, nothing to do");
                Ok(())
            }
        }
    }

    /// Close every active device. Individual close failures are logged and do
    /// not stop the sweep; the registry ends empty regardless.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<DeviceProxy>)> =
            self.active.lock().await.drain().collect();
        for (name, proxy) in drained {
            if let Err(err) = proxy.close().await {
                warn!(device = %name, error = %err, "close failed during sweep");
            } else {
                debug!(device = %name, "device closed");
            }
        }
    }

    // =========================================================================
    // Governor delegation
    // =========================================================================

    /// Change how many device operations may run concurrently.
    pub fn set_concurrency_limit(&self, limit: usize) -> Result<()> {
        self.governor.set_capacity(limit)
    }

    /// Current concurrency limit.
    pub fn concurrency_limit(&self) -> usize {
        self.governor.capacity()
    }

    // =========================================================================
    // Single-device convenience operations
    // =========================================================================

    /// Capture from one device under a governor permit.
    pub async fn capture(&self, name: &str) -> Result<Artifact> {
        let proxy = self.get(name).await?;
        let _permit = self.governor.acquire().await;
        proxy.capture().await
    }

    /// Apply a settings map to one device.
    pub async fn configure(
        &self,
        name: &str,
        settings: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        let proxy = self.get(name).await?;
        proxy.configure(settings).await
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("backends", &self.drivers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
