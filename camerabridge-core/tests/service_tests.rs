//! Integration tests for the bridge service

mod mocks;

use camerabridge_core::error::{BridgeError, EXIT_FACILITY_UNAVAILABLE, EXIT_INVALID_CONFIG};
use camerabridge_core::service::BridgeService;
use camerabridge_core::types::{PipelineState, VirtualDeviceSpec};
use mocks::{
    Behavior, BrokerCall, MockBroker, MockFacility, MockLauncher, fast_policy, test_config,
    wait_for_state,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(120);
const FIREFOX: &str = "org.mozilla.firefox";

struct Fixture {
    service: BridgeService,
    facility: MockFacility,
    launcher: Arc<MockLauncher>,
    broker: Arc<MockBroker>,
}

fn fixture_with(facility: MockFacility, script: Vec<Behavior>, broker: Arc<MockBroker>) -> Fixture {
    let launcher = MockLauncher::new(script);
    let service = BridgeService::new(
        test_config(),
        facility.boxed(),
        launcher.clone(),
        broker.clone(),
    )
    .expect("Should create service");
    Fixture {
        service,
        facility,
        launcher,
        broker,
    }
}

fn fixture(script: Vec<Behavior>) -> Fixture {
    fixture_with(MockFacility::new(), script, MockBroker::new())
}

#[tokio::test(start_paused = true)]
async fn test_enable_disable_cycle() {
    let f = fixture(vec![Behavior::Healthy]);

    let status = assert_ok!(f.service.enable().await);
    assert_eq!(status.state, PipelineState::Starting);
    assert_eq!(status.node.as_deref().and_then(|p| p.to_str()), Some("/dev/video99"));
    assert!(f.facility.exists(99));

    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;

    let status = assert_ok!(f.service.disable().await);
    assert_eq!(status.state, PipelineState::Stopped);
    assert!(status.node.is_none());
    assert!(!f.facility.exists(99));

    // Index is free again
    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    assert_eq!(f.facility.created().len(), 2);

    f.service.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_enable_and_disable_are_idempotent() {
    let f = fixture(vec![Behavior::Healthy]);

    let status = assert_ok!(f.service.disable().await);
    assert_eq!(status.state, PipelineState::Stopped);
    assert!(f.facility.removed().is_empty());

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    let status = assert_ok!(f.service.enable().await);
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!(f.facility.created().len(), 1);
    assert_eq!(f.launcher.attempts(), 1);

    assert_ok!(f.service.disable().await);
    assert_ok!(f.service.disable().await);
    assert_eq!(f.facility.removed(), vec![99]);
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_published_and_firefox_granted() {
    let f = fixture(vec![Behavior::Healthy]);

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    sleep(Duration::from_millis(100)).await;

    let grants = f.service.session().grants(99);
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].subject_app, FIREFOX);
    assert!(f.service.status().published);
    assert!(f.broker.calls().contains(&BrokerCall::Grant(FIREFOX.to_string())));

    f.service.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_broker_outage_does_not_affect_pipeline() {
    let f = fixture_with(
        MockFacility::new(),
        vec![Behavior::Healthy],
        MockBroker::offline(),
    );

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    sleep(Duration::from_secs(5)).await;

    let status = f.service.status();
    assert_eq!(status.state, PipelineState::Running);
    assert!(!status.published);
    assert_eq!(status.failures, 0);
    assert!(f.broker.attempts() >= 3);
    assert!(f.service.session().grants(99).is_empty());

    // Shutdown still completes
    f.service.shutdown().await.expect("Should shut down");
    assert_eq!(f.service.status().state, PipelineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_set_resolution_restarts_pipeline_on_same_device() {
    let f = fixture(vec![Behavior::Healthy]);

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;

    let status = assert_ok!(f.service.set_resolution(1920, 1080).await);
    assert_eq!((status.width, status.height), (1920, 1080));
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;

    let widths: Vec<u32> = f.launcher.launched().iter().map(|s| s.output.width).collect();
    assert_eq!(widths, vec![1280, 1920]);
    assert_eq!(f.facility.created().len(), 1);
    assert!(f.facility.removed().is_empty());
    assert_eq!(f.service.config().pipeline.input.width, 1920);

    f.service.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_set_resolution_while_disabled_only_updates_config() {
    let f = fixture(vec![Behavior::Healthy]);

    let status = assert_ok!(f.service.set_resolution(640, 480).await);
    assert_eq!(status.state, PipelineState::Stopped);
    assert_eq!((status.width, status.height), (640, 480));
    assert_eq!(f.launcher.attempts(), 0);
    assert!(f.facility.created().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_resolution_is_rejected() {
    let f = fixture(vec![Behavior::Healthy]);

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;

    let err = assert_err!(f.service.set_resolution(800, 600).await);
    assert!(matches!(err, BridgeError::Configuration(_)));
    assert_eq!(err.exit_code(), EXIT_INVALID_CONFIG);

    let status = f.service.status();
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!((status.width, status.height), (1280, 720));
    assert_eq!(status.launches, 1);

    f.service.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reconfigure_applies_latest() {
    let f = fixture(vec![Behavior::Healthy]);

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;

    let (a, b, c) = tokio::join!(
        f.service.set_resolution(640, 360),
        f.service.set_resolution(640, 480),
        f.service.set_resolution(1920, 1080),
    );
    assert_ok!(a);
    assert_ok!(b);
    assert_ok!(c);

    let status = wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    assert_eq!(status.state, PipelineState::Running);

    let config = f.service.config();
    assert_eq!(
        (config.pipeline.output.width, config.pipeline.output.height),
        (1920, 1080)
    );

    // The superseded request never reaches the pipeline
    let launched = f.launcher.launched();
    assert!(!launched.iter().any(|s| s.output.height == 480));
    assert_eq!(launched.last().map(|s| s.output.width), Some(1920));
    assert_eq!(f.facility.created().len(), 1);

    f.service.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_disable_while_starting_kills_hung_pipeline() {
    let f = fixture(vec![Behavior::Hung]);

    assert_ok!(f.service.enable().await);
    let mut status = f.service.subscribe();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.launches == 1))
        .await
        .expect("Should launch")
        .expect("status channel open");
    assert_eq!(f.service.status().state, PipelineState::Starting);

    let status = assert_ok!(f.service.disable().await);
    assert_eq!(status.state, PipelineState::Stopped);
    assert_eq!(f.launcher.kills(), 1);
    assert!(!f.facility.exists(99));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_then_explicit_enable() {
    let f = fixture(vec![
        Behavior::FailToLaunch,
        Behavior::FailToLaunch,
        Behavior::FailToLaunch,
        Behavior::Healthy,
    ]);

    assert_ok!(f.service.enable().await);
    wait_for_state(
        f.service.subscribe(),
        PipelineState::FailedPermanently,
        WAIT,
    )
    .await;

    let status = f.service.status();
    assert_eq!(status.failures, fast_policy().max_failures);
    assert_eq!(status.launches, 0);
    assert_eq!(status.exit_code(), 3);

    let status = assert_ok!(f.service.enable().await);
    assert_eq!(status.state, PipelineState::Starting);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    assert_eq!(f.facility.created().len(), 1);

    f.service.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_after_permanent_failure_releases_device() {
    let f = fixture(vec![Behavior::FailToLaunch]);

    assert_ok!(f.service.enable().await);
    wait_for_state(
        f.service.subscribe(),
        PipelineState::FailedPermanently,
        WAIT,
    )
    .await;
    assert!(f.facility.exists(99));

    let status = assert_ok!(f.service.set_resolution(640, 480).await);
    assert_eq!(status.state, PipelineState::Stopped);
    assert!(status.node.is_none());
    assert_eq!((status.width, status.height), (640, 480));
    assert!(!f.facility.exists(99));
    assert_eq!(f.facility.removed(), vec![99]);

    // Nothing left to tear down
    assert_ok!(f.service.disable().await);
    assert_eq!(f.facility.removed(), vec![99]);
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_moves_running_bridge_to_new_device() {
    let f = fixture(vec![Behavior::Healthy]);

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;

    let mut config = f.service.config();
    config.device = VirtualDeviceSpec::new(98, "Front Camera", true);
    let status = assert_ok!(f.service.reconfigure(config).await);
    assert_eq!(status.device_index, 98);
    assert_eq!(status.device_label, "Front Camera");
    assert_eq!(status.node.as_deref().and_then(|p| p.to_str()), Some("/dev/video98"));

    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    assert_eq!(f.facility.removed(), vec![99]);
    assert!(!f.facility.exists(99));
    assert!(f.facility.exists(98));
    assert_eq!(f.facility.created().last().map(|spec| spec.index), Some(98));
    assert!(f.service.devices().is_attached(98));
    assert!(!f.service.devices().is_attached(99));
    assert_eq!(f.launcher.launched().len(), 2);

    f.service.shutdown().await.expect("Should shut down");
    assert!(!f.facility.exists(98));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_revokes_and_unpublishes() {
    let f = fixture(vec![Behavior::Healthy]);

    assert_ok!(f.service.enable().await);
    wait_for_state(f.service.subscribe(), PipelineState::Running, WAIT).await;
    sleep(Duration::from_millis(100)).await;
    assert!(f.service.status().published);

    f.service.shutdown().await.expect("Should shut down");
    sleep(Duration::from_millis(100)).await;

    let calls = f.broker.calls();
    assert!(calls.contains(&BrokerCall::Revoke(FIREFOX.to_string())));
    assert!(calls.contains(&BrokerCall::Unpublish(99)));
    assert!(f.service.session().grants(99).is_empty());
    assert!(!f.service.status().published);
    assert!(!f.facility.exists(99));
}

#[tokio::test(start_paused = true)]
async fn test_missing_loopback_module() {
    let f = fixture_with(
        MockFacility::unloaded(),
        vec![Behavior::Healthy],
        MockBroker::new(),
    );

    let err = assert_err!(f.service.enable().await);
    assert!(matches!(err, BridgeError::DeviceCreateFailed(_)));
    assert_eq!(err.exit_code(), EXIT_FACILITY_UNAVAILABLE);
    assert_eq!(f.launcher.attempts(), 0);
    assert_eq!(f.service.status().state, PipelineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_physical_device_index_is_a_config_error() {
    let f = fixture_with(
        MockFacility::new().with_physical(99, "ipu6"),
        vec![Behavior::Healthy],
        MockBroker::new(),
    );

    let err = assert_err!(f.service.enable().await);
    assert_eq!(err.exit_code(), EXIT_INVALID_CONFIG);
    assert_eq!(f.launcher.attempts(), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_construction() {
    let mut config = test_config();
    config.device.label = String::new();

    let result = BridgeService::new(
        config,
        MockFacility::new().boxed(),
        MockLauncher::healthy(),
        MockBroker::new(),
    );
    assert!(matches!(result, Err(BridgeError::Configuration(_))));
}

#[tokio::test(start_paused = true)]
async fn test_session_publishing_can_be_disabled() {
    let mut session = test_config().session;
    session.enabled = false;
    let config = test_config().with_session(session);
    let broker = MockBroker::new();

    let service = BridgeService::new(
        config,
        MockFacility::new().boxed(),
        MockLauncher::healthy(),
        broker.clone(),
    )
    .expect("Should create service");

    assert_ok!(service.enable().await);
    wait_for_state(service.subscribe(), PipelineState::Running, WAIT).await;
    sleep(Duration::from_millis(100)).await;

    assert!(!service.status().published);
    assert_eq!(broker.attempts(), 0);
    service.shutdown().await.expect("Should shut down");
}
