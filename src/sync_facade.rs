//! Blocking façade over the async registry for synchronous callers.
//!
//! [`SyncHub`] owns a dedicated thread running a current-thread tokio runtime
//! with the registry inside it. Callers never touch the runtime: each blocking
//! method packages its operation as a job, sends it to the hub's dispatcher,
//! and blocks on a reply channel with a deadline. On deadline expiry the caller
//! gets a timeout error and the in-flight job is aborted best-effort; the hub
//! itself stays healthy either way.
//!
//! Jobs are spawned as independent tasks, so a slow operation on one device
//! does not stall jobs for other devices beyond what the governor and the
//! per-device proxy locks already impose.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::runtime::Builder;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::artifact::Artifact;
use crate::backend::BackendDriver;
use crate::batch::BatchReport;
use crate::error::{DeviceError, Result};
use crate::hdr::SweepReport;
use crate::registry::DeviceRegistry;
use crate::settings::Settings;

type Job = Box<dyn FnOnce(Arc<DeviceRegistry>) -> BoxFuture<'static, ()> + Send>;

enum HubCommand {
    Run {
        job: Job,
        abort_tx: mpsc::Sender<AbortHandle>,
    },
    Shutdown {
        done_tx: mpsc::Sender<()>,
    },
}

/// Blocking front door to the registry for synchronous code.
pub struct SyncHub {
    commands: UnboundedSender<HubCommand>,
    thread: Option<thread::JoinHandle<()>>,
    call_timeout: Duration,
    shutdown_timeout: Duration,
}

impl SyncHub {
    /// Start the hub thread, build the registry inside it, and register the
    /// given drivers.
    pub fn start(settings: Settings, drivers: Vec<Arc<dyn BackendDriver>>) -> Result<Self> {
        settings.validate()?;
        let call_timeout = settings.facade_call_timeout;
        let shutdown_timeout = settings.shutdown_timeout;

        let (command_tx, mut command_rx) = tokio::sync::mpsc::unbounded_channel::<HubCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name("devicehub-sync".into())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(DeviceError::Internal(format!(
                            "failed to build hub runtime: {err}"
                        ))));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let registry = match DeviceRegistry::new(settings) {
                        Ok(registry) => {
                            let mut registry = registry;
                            for driver in drivers {
                                registry.register_driver(driver);
                            }
                            Arc::new(registry)
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    info!("sync hub started");

                    while let Some(command) = command_rx.recv().await {
                        match command {
                            HubCommand::Run { job, abort_tx } => {
                                let task = tokio::spawn(job(Arc::clone(&registry)));
                                // The caller may already have timed out; it just
                                // won't observe this job's result.
                                let _ = abort_tx.send(task.abort_handle());
                            }
                            HubCommand::Shutdown { done_tx } => {
                                if timeout(shutdown_timeout, registry.close_all())
                                    .await
                                    .is_err()
                                {
                                    warn!("device sweep exceeded shutdown deadline");
                                }
                                let _ = done_tx.send(());
                                break;
                            }
                        }
                    }
                    debug!("sync hub dispatcher stopped");
                });
            })
            .map_err(|err| DeviceError::Internal(format!("failed to spawn hub thread: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: command_tx,
                thread: Some(thread),
                call_timeout,
                shutdown_timeout,
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Internal(
                    "hub thread exited before becoming ready".into(),
                ))
            }
        }
    }

    /// Run one registry operation on the hub thread and block for its result.
    ///
    /// On deadline expiry the job is aborted; a capture already holding the
    /// device lock may still complete on the hardware side, but its result is
    /// discarded.
    fn call<R, F>(&self, operation: &str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(Arc<DeviceRegistry>) -> BoxFuture<'static, Result<R>> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel::<Result<R>>();
        let (abort_tx, abort_rx) = mpsc::channel::<AbortHandle>();

        let job: Job = Box::new(move |registry| {
            Box::pin(async move {
                let outcome = f(registry).await;
                // A disconnected receiver means the caller gave up; drop the result.
                let _ = result_tx.send(outcome);
            })
        });
        self.commands
            .send(HubCommand::Run { job, abort_tx })
            .map_err(|_| DeviceError::Internal("hub thread is no longer running".into()))?;
        let abort = abort_rx
            .recv()
            .map_err(|_| DeviceError::Internal("hub thread dropped the job".into()))?;

        match result_rx.recv_timeout(self.call_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                abort.abort();
                Err(DeviceError::Timeout {
                    device: "sync-hub".into(),
                    message: format!(
                        "{operation} exceeded the {} ms façade deadline",
                        self.call_timeout.as_millis()
                    ),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Internal(format!(
                "{operation} job vanished without a result"
            ))),
        }
    }

    // =========================================================================
    // Blocking operation surface
    // =========================================================================

    /// Enumerate devices; see [`DeviceRegistry::discover`].
    pub fn discover(&self, backend_filter: Option<&str>) -> Result<Vec<String>> {
        let filter = backend_filter.map(str::to_string);
        self.call("discover", move |registry| {
            Box::pin(async move { Ok(registry.discover(filter.as_deref()).await) })
        })
    }

    /// Initialize one device; see [`DeviceRegistry::initialize`].
    pub fn initialize(&self, name: &str, test_connection: bool) -> Result<()> {
        let name = name.to_string();
        self.call("initialize", move |registry| {
            Box::pin(async move { registry.initialize(&name, test_connection).await })
        })
    }

    /// Initialize many devices; see [`DeviceRegistry::initialize_batch`].
    pub fn initialize_batch(
        &self,
        names: &[String],
        test_connection: bool,
    ) -> Result<Vec<String>> {
        let names = names.to_vec();
        self.call("initialize_batch", move |registry| {
            Box::pin(async move { registry.initialize_batch(&names, test_connection).await })
        })
    }

    /// Capture from one device; see [`DeviceRegistry::capture`].
    pub fn capture(&self, name: &str) -> Result<Artifact> {
        let name = name.to_string();
        self.call("capture", move |registry| {
            Box::pin(async move { registry.capture(&name).await })
        })
    }

    /// Configure one device; see [`DeviceRegistry::configure`].
    pub fn configure(
        &self,
        name: &str,
        settings: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        let name = name.to_string();
        let settings = settings.clone();
        self.call("configure", move |registry| {
            Box::pin(async move { registry.configure(&name, &settings).await })
        })
    }

    /// Read one parameter back from a device.
    pub fn get_parameter(&self, name: &str, param: &str) -> Result<Value> {
        let name = name.to_string();
        let param = param.to_string();
        self.call("get_parameter", move |registry| {
            Box::pin(async move { registry.get(&name).await?.get_parameter(&param).await })
        })
    }

    /// Set one parameter on a device.
    pub fn set_parameter(&self, name: &str, param: &str, value: &Value) -> Result<()> {
        let name = name.to_string();
        let param = param.to_string();
        let value = value.clone();
        self.call("set_parameter", move |registry| {
            Box::pin(async move {
                registry
                    .get(&name)
                    .await?
                    .set_parameter(&param, &value)
                    .await
            })
        })
    }

    /// Run an HDR exposure sweep; see [`DeviceRegistry::sequenced_capture`].
    pub fn sequenced_capture(
        &self,
        name: &str,
        steps: u32,
        multiplier: f64,
    ) -> Result<SweepReport> {
        let name = name.to_string();
        self.call("sequenced_capture", move |registry| {
            Box::pin(async move { registry.sequenced_capture(&name, steps, multiplier).await })
        })
    }

    /// Capture from many devices; see [`DeviceRegistry::batch_capture`].
    pub fn batch_capture(&self, names: &[String]) -> Result<BatchReport<Artifact>> {
        let names = names.to_vec();
        self.call("batch_capture", move |registry| {
            Box::pin(async move { registry.batch_capture(&names).await })
        })
    }

    /// Configure many devices; see [`DeviceRegistry::batch_configure`].
    pub fn batch_configure(
        &self,
        names: &[String],
        settings: &serde_json::Map<String, Value>,
    ) -> Result<BatchReport<bool>> {
        let names = names.to_vec();
        let settings = settings.clone();
        self.call("batch_configure", move |registry| {
            Box::pin(async move { registry.batch_configure(&names, &settings).await })
        })
    }

    /// Close many devices; see [`DeviceRegistry::batch_close`].
    pub fn batch_close(&self, names: &[String]) -> Result<BatchReport<()>> {
        let names = names.to_vec();
        self.call("batch_close", move |registry| {
            Box::pin(async move { registry.batch_close(&names).await })
        })
    }

    /// Close one device; see [`DeviceRegistry::close`].
    pub fn close(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call("close", move |registry| {
            Box::pin(async move { registry.close(&name).await })
        })
    }

    /// Close every active device.
    pub fn close_all(&self) -> Result<()> {
        self.call("close_all", move |registry| {
            Box::pin(async move {
                registry.close_all().await;
                Ok(())
            })
        })
    }

    /// Names of all active devices, sorted.
    pub fn active_devices(&self) -> Result<Vec<String>> {
        self.call("active_devices", move |registry| {
            Box::pin(async move { Ok(registry.active_devices().await) })
        })
    }

    /// Change the shared concurrency limit.
    pub fn set_concurrency_limit(&self, limit: usize) -> Result<()> {
        self.call("set_concurrency_limit", move |registry| {
            Box::pin(async move { registry.set_concurrency_limit(limit) })
        })
    }

    /// Current concurrency limit.
    pub fn concurrency_limit(&self) -> Result<usize> {
        self.call("concurrency_limit", move |registry| {
            Box::pin(async move { Ok(registry.concurrency_limit()) })
        })
    }

    /// Stop the hub: sweep-close all devices (bounded by the shutdown deadline)
    /// and join the hub thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = mpsc::channel();
        if self.commands.send(HubCommand::Shutdown { done_tx }).is_ok() {
            // Allow the dispatcher its full close deadline plus a margin.
            let deadline = self.shutdown_timeout + Duration::from_secs(1);
            if done_rx.recv_timeout(deadline).is_err() {
                error!("hub did not confirm shutdown within the deadline");
            }
        }
        thread
            .join()
            .map_err(|_| DeviceError::Internal("hub thread panicked".into()))
    }
}

impl Drop for SyncHub {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(err) = self.shutdown_inner() {
                error!(error = %err, "hub shutdown on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("call_timeout", &self.call_timeout)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockBehavior};
    use serde_json::json;

    fn hub_with(backend: MockBackend) -> SyncHub {
        SyncHub::start(Settings::default(), vec![Arc::new(backend)]).unwrap()
    }

    #[test]
    fn blocking_round_trip_without_a_caller_runtime() {
        let hub = hub_with(MockBackend::new());

        assert_eq!(hub.discover(None).unwrap(), vec!["Mock:A", "Mock:B"]);
        hub.initialize("Mock:A", true).unwrap();
        assert_eq!(hub.active_devices().unwrap(), vec!["Mock:A"]);

        let artifact = hub.capture("Mock:A").unwrap();
        assert_eq!(artifact.device, "Mock:A");

        hub.set_parameter("Mock:A", "exposure", &json!(30.0)).unwrap();
        assert_eq!(hub.get_parameter("Mock:A", "exposure").unwrap(), json!(30.0));

        hub.close("Mock:A").unwrap();
        assert!(hub.active_devices().unwrap().is_empty());
        hub.shutdown().unwrap();
    }

    #[test]
    fn errors_cross_the_thread_boundary_intact() {
        let hub = hub_with(MockBackend::new());

        assert!(matches!(
            hub.capture("Mock:A"),
            Err(DeviceError::NotInitialized(_))
        ));
        hub.initialize("Mock:A", true).unwrap();
        assert!(matches!(
            hub.initialize("Mock:A", true),
            Err(DeviceError::AlreadyInitialized(_))
        ));
        hub.shutdown().unwrap();
    }

    #[test]
    fn slow_calls_time_out_without_killing_the_hub() {
        let settings = Settings {
            facade_call_timeout: Duration::from_millis(50),
            ..Settings::default()
        };
        let backend = MockBackend::new().with_device_behavior(
            "A",
            MockBehavior {
                capture_delay: Duration::from_millis(500),
                ..MockBehavior::default()
            },
        );
        let hub = SyncHub::start(settings, vec![Arc::new(backend)]).unwrap();

        hub.initialize("Mock:A", true).unwrap();
        hub.initialize("Mock:B", true).unwrap();

        assert!(matches!(
            hub.capture("Mock:A"),
            Err(DeviceError::Timeout { .. })
        ));
        // The hub still serves other devices afterwards.
        hub.capture("Mock:B").unwrap();
        hub.shutdown().unwrap();
    }

    #[test]
    fn batch_and_sweep_work_through_the_facade() {
        let hub = hub_with(MockBackend::new());
        let names: Vec<String> = vec!["Mock:A".into(), "Mock:B".into()];

        assert!(hub.initialize_batch(&names, true).unwrap().is_empty());

        let report = hub.batch_capture(&names).unwrap();
        assert!(report.all_succeeded());

        let sweep = hub.sequenced_capture("Mock:A", 3, 2.0).unwrap();
        assert_eq!(sweep.successful_captures(), 3);
        assert!(sweep.restored);

        hub.close_all().unwrap();
        hub.shutdown().unwrap();
    }

    #[test]
    fn concurrency_limit_is_adjustable_through_the_facade() {
        let hub = hub_with(MockBackend::new());
        assert_eq!(hub.concurrency_limit().unwrap(), 4);
        hub.set_concurrency_limit(2).unwrap();
        assert_eq!(hub.concurrency_limit().unwrap(), 2);
        assert!(hub.set_concurrency_limit(0).is_err());
        hub.shutdown().unwrap();
    }
}
