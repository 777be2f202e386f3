//! End-to-end orchestration scenarios against the mock backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use devicehub::backend::mock::{MockBackend, MockBehavior};
use devicehub::error::DeviceError;
use devicehub::registry::DeviceRegistry;
use devicehub::settings::Settings;
use devicehub::sync_facade::SyncHub;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.retry.capture_backoff_ms = 1;
    settings.retry.connection_backoff_ms = 1;
    settings.retry.timeout_backoff_ms = 1;
    settings.retry.default_backoff_ms = 1;
    settings.settle_delay = Duration::from_millis(1);
    settings
}

fn registry_with(backend: MockBackend) -> Arc<DeviceRegistry> {
    Arc::new(
        DeviceRegistry::new(fast_settings())
            .unwrap()
            .with_driver(Arc::new(backend)),
    )
}

#[tokio::test]
async fn discover_then_batch_initialize_then_operate() {
    let registry = registry_with(MockBackend::new());

    let found = registry.discover(None).await;
    assert_eq!(found, vec!["Mock:A", "Mock:B"]);

    let failed = registry.initialize_batch(&found, true).await.unwrap();
    assert!(failed.is_empty());

    for name in &found {
        let proxy = registry.get(name).await.unwrap();
        proxy.capture().await.unwrap();
    }
    registry.close_all().await;
    assert!(registry.active_devices().await.is_empty());
}

#[tokio::test]
async fn duplicate_initialize_leaves_first_proxy_untouched() {
    let registry = registry_with(MockBackend::new());
    registry.initialize("Mock:A", true).await.unwrap();
    let first = registry.get("Mock:A").await.unwrap();

    assert!(matches!(
        registry.initialize("Mock:A", true).await,
        Err(DeviceError::AlreadyInitialized(_))
    ));

    // Still the same live proxy, still working.
    let again = registry.get("Mock:A").await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    first.capture().await.unwrap();
}

#[tokio::test]
async fn governor_caps_concurrent_captures_without_losing_work() {
    let backend = MockBackend::with_devices(["A", "B", "C"]).with_behavior(MockBehavior {
        capture_delay: Duration::from_millis(30),
        ..MockBehavior::default()
    });
    let stats = backend.stats();
    let registry = registry_with(backend);
    registry.set_concurrency_limit(1).unwrap();

    let all = names(&["Mock:A", "Mock:B", "Mock:C"]);
    registry.initialize_batch(&all, true).await.unwrap();

    let report = registry.batch_capture(&all).await.unwrap();
    assert_eq!(report.success_count(), 3);
    assert!(
        stats.max_in_flight() <= 1,
        "captures overlapped despite a limit of 1"
    );
}

#[tokio::test]
async fn transient_capture_failures_are_retried_to_success() {
    let backend = MockBackend::new().with_device_behavior(
        "A",
        MockBehavior {
            capture_failures: 2,
            ..MockBehavior::default()
        },
    );
    let stats = backend.stats();
    let registry = registry_with(backend);

    registry.initialize("Mock:A", true).await.unwrap();
    registry.capture("Mock:A").await.unwrap();
    // Two injected failures plus the succeeding attempt.
    assert_eq!(stats.capture_calls(), 3);
}

#[tokio::test]
async fn hdr_sweep_skips_failed_steps_and_restores_exposure() {
    // Exposure starts at 10.0; a 3-step doubling ladder is [5, 10, 20].
    // The middle rung is poisoned.
    let backend = MockBackend::new().with_device_behavior(
        "A",
        MockBehavior {
            fail_capture_at_exposure: Some(10.0),
            ..MockBehavior::default()
        },
    );
    let registry = registry_with(backend);
    registry.initialize("Mock:A", true).await.unwrap();

    let sweep = registry.sequenced_capture("Mock:A", 3, 2.0).await.unwrap();
    assert_eq!(sweep.planned.len(), 3);
    assert_eq!(sweep.successful_captures(), 2);
    assert_eq!(sweep.failures.len(), 1);
    assert!(sweep.is_partial());
    assert!(sweep.restored);

    let proxy = registry.get("Mock:A").await.unwrap();
    assert_eq!(proxy.get_parameter("exposure").await.unwrap(), json!(10.0));
}

#[tokio::test]
async fn hdr_sweep_with_no_successful_steps_is_an_error() {
    let backend = MockBackend::new().with_device_behavior(
        "A",
        MockBehavior {
            capture_failures: u32::MAX,
            ..MockBehavior::default()
        },
    );
    let registry = registry_with(backend);
    registry.initialize("Mock:A", true).await.unwrap();

    let err = registry
        .sequenced_capture("Mock:A", 3, 2.0)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Capture { .. }));

    // The exposure was still restored.
    let proxy = registry.get("Mock:A").await.unwrap();
    assert_eq!(proxy.get_parameter("exposure").await.unwrap(), json!(10.0));
}

#[tokio::test]
async fn batch_reports_cover_exactly_the_requested_devices() {
    let registry = registry_with(MockBackend::new());
    registry.initialize("Mock:A", true).await.unwrap();

    let requested = names(&["Mock:A", "Mock:B"]);
    let report = registry.batch_capture(&requested).await.unwrap();

    let mut keys: Vec<&String> = report.iter().map(|(name, _)| name).collect();
    keys.sort();
    assert_eq!(keys, vec!["Mock:A", "Mock:B"]);
    assert!(report.get("Mock:A").unwrap().is_ok());
    assert!(matches!(
        report.get("Mock:B").unwrap(),
        Err(DeviceError::NotInitialized(_))
    ));
}

#[tokio::test]
async fn concurrency_limit_of_zero_is_rejected() {
    let registry = registry_with(MockBackend::new());
    assert!(matches!(
        registry.set_concurrency_limit(0),
        Err(DeviceError::InvalidArgument(_))
    ));
    // The previous limit survives the rejected update.
    assert_eq!(registry.concurrency_limit(), 4);
}

#[test]
fn full_scenario_through_the_sync_facade() {
    let hub = SyncHub::start(fast_settings(), vec![Arc::new(MockBackend::new())]).unwrap();

    let found = hub.discover(None).unwrap();
    assert_eq!(found, vec!["Mock:A", "Mock:B"]);

    assert!(hub.initialize_batch(&found, true).unwrap().is_empty());
    hub.set_concurrency_limit(1).unwrap();

    let report = hub.batch_capture(&found).unwrap();
    assert!(report.all_succeeded());

    let sweep = hub.sequenced_capture("Mock:A", 3, 2.0).unwrap();
    assert_eq!(sweep.successful_captures(), 3);

    hub.close_all().unwrap();
    assert!(hub.active_devices().unwrap().is_empty());
    hub.shutdown().unwrap();
}
