//! End-to-end pipeline scenarios: a real listener on localhost serves the
//! install side while the pipeline drives per-app operation graphs against
//! mock collaborators.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use airlift::collaborators::{AppSigner, DeviceManager, PackageSource};
use airlift::pipeline::{
    InstallOptions, OperationContext, OperationGroup, OperationPipeline, PipelineCollaborators,
};
use airlift::{ErrorKind, ServerContext};

use support::{
    local_peer, start_server, RecordingReminders, RecordingStore, ScriptedDeviceManager,
    StubAnisette, StubPackages, StubSigner,
};

struct Fixture {
    signer: Arc<StubSigner>,
    packages: Arc<StubPackages>,
    store: Arc<RecordingStore>,
    reminders: Arc<RecordingReminders>,
}

impl Fixture {
    fn new(signer: StubSigner, packages: StubPackages) -> Self {
        Self {
            signer: Arc::new(signer),
            packages: Arc::new(packages),
            store: Arc::new(RecordingStore::default()),
            reminders: Arc::new(RecordingReminders::default()),
        }
    }

    fn collaborators(&self) -> PipelineCollaborators {
        PipelineCollaborators {
            signer: Arc::clone(&self.signer) as Arc<dyn AppSigner>,
            packages: Arc::clone(&self.packages) as Arc<dyn PackageSource>,
            store: Arc::clone(&self.store) as _,
            reminders: Arc::clone(&self.reminders) as _,
        }
    }
}

fn server_ctx(devices: ScriptedDeviceManager) -> Arc<ServerContext> {
    Arc::new(ServerContext::new(
        Arc::new(StubAnisette {
            payload: Ok(Vec::new()),
        }),
        Arc::new(devices) as Arc<dyn DeviceManager>,
        64 * 1024 * 1024,
    ))
}

#[tokio::test]
async fn single_app_with_local_copy_installs_successfully() {
    let (listener, addr) = start_server(server_ctx(ScriptedDeviceManager::new(&["DEV1"]))).await;

    let fixture = Fixture::new(StubSigner::new(), StubPackages::with_local_copies(&["com.example.one"]));
    let observed: Arc<std::sync::Mutex<Vec<f64>>> = Arc::default();
    let sink = Arc::clone(&observed);
    let pipeline = OperationPipeline::new(fixture.collaborators()).with_progress_observer(
        Arc::new(move |_, fraction| {
            sink.lock().expect("progress sink").push(fraction);
        }),
    );

    let mut opts = InstallOptions::for_device("DEV1");
    opts.peer = Some(local_peer(addr, None));
    let results = pipeline
        .install_apps(vec!["com.example.one".into()], opts)
        .await;

    assert_eq!(results.len(), 1);
    let record = results["com.example.one"].as_ref().expect("success");
    assert_eq!(record.bundle_id, "com.example.one");
    assert_eq!(record.device_id, "DEV1");

    // Result persisted once, reminder scheduled once.
    assert_eq!(fixture.store.saved.lock().await.len(), 1);
    assert_eq!(fixture.reminders.scheduled.lock().await.len(), 1);
    // Valid local copy: no download.
    assert_eq!(fixture.packages.download_count(), 0);

    // Without a download step the total is 60 units, so the completed resign
    // step alone reports 20/60.
    let observed = observed.lock().expect("progress sink");
    assert!((observed[0] - 20.0 / 60.0).abs() < 1e-9);
    assert!((observed.last().expect("final update") - 1.0).abs() < 1e-9);

    listener.stop().await;
}

#[tokio::test]
async fn missing_local_copy_adds_download_step_and_weight() {
    let (listener, addr) = start_server(server_ctx(ScriptedDeviceManager::new(&["DEV1"]))).await;

    let fixture = Fixture::new(StubSigner::new(), StubPackages::empty());
    let observed: Arc<std::sync::Mutex<Vec<f64>>> = Arc::default();
    let sink = Arc::clone(&observed);
    let pipeline = OperationPipeline::new(fixture.collaborators()).with_progress_observer(
        Arc::new(move |_, fraction| {
            sink.lock().expect("progress sink").push(fraction);
        }),
    );

    let mut opts = InstallOptions::for_device("DEV1");
    opts.peer = Some(local_peer(addr, None));
    let results = pipeline
        .install_apps(vec!["com.example.one".into()], opts)
        .await;

    assert!(results["com.example.one"].is_ok());
    assert_eq!(fixture.packages.download_count(), 1);

    // With the download step the total is 100 units: resign reports 20/100.
    let observed = observed.lock().expect("progress sink");
    assert!((observed[0] - 20.0 / 100.0).abs() < 1e-9);

    listener.stop().await;
}

#[tokio::test]
async fn force_download_overrides_valid_local_copy() {
    let (listener, addr) = start_server(server_ctx(ScriptedDeviceManager::new(&["DEV1"]))).await;

    let fixture = Fixture::new(StubSigner::new(), StubPackages::with_local_copies(&["com.example.one"]));
    let pipeline = OperationPipeline::new(fixture.collaborators());

    let mut opts = InstallOptions::for_device("DEV1");
    opts.peer = Some(local_peer(addr, None));
    opts.force_download = true;
    let results = pipeline
        .install_apps(vec!["com.example.one".into()], opts)
        .await;

    assert!(results["com.example.one"].is_ok());
    assert_eq!(fixture.packages.download_count(), 1);

    listener.stop().await;
}

/// Scenario E: a failing step finalizes only that app; independent pipelines
/// in the same group still complete.
#[tokio::test]
async fn failing_app_does_not_affect_its_group_siblings() {
    let (listener, addr) = start_server(server_ctx(ScriptedDeviceManager::new(&["DEV1"]))).await;

    let fixture = Fixture::new(
        StubSigner::failing_for(&["com.example.bad"]),
        StubPackages::with_local_copies(&["com.example.bad", "com.example.good"]),
    );
    let pipeline = OperationPipeline::new(fixture.collaborators());

    let mut opts = InstallOptions::for_device("DEV1");
    opts.peer = Some(local_peer(addr, None));
    let results = pipeline
        .install_apps(
            vec!["com.example.bad".into(), "com.example.good".into()],
            opts,
        )
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results["com.example.bad"], Err(ErrorKind::Unknown));
    assert!(results["com.example.good"].is_ok());

    // Only the successful app was persisted.
    let saved = fixture.store.saved.lock().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].bundle_id, "com.example.good");

    listener.stop().await;
}

#[tokio::test]
async fn retryable_failure_from_non_preferred_peer_becomes_server_not_found() {
    // Server has no devices, so the flow fails with deviceNotFound.
    let (listener, addr) = start_server(server_ctx(ScriptedDeviceManager::new(&[]))).await;

    let fixture = Fixture::new(StubSigner::new(), StubPackages::with_local_copies(&["com.example.one"]));
    let pipeline = OperationPipeline::new(fixture.collaborators());

    let mut opts = InstallOptions::for_device("DEV1");
    opts.preferred_server_id = Some("primary".into());
    opts.peer = Some(local_peer(addr, Some("someone-else")));
    let results = pipeline
        .install_apps(vec!["com.example.one".into()], opts)
        .await;

    assert_eq!(results["com.example.one"], Err(ErrorKind::ServerNotFound));

    listener.stop().await;
}

#[tokio::test]
async fn retryable_failure_from_preferred_peer_is_reported_verbatim() {
    let addr = "127.0.0.1:9000".parse().expect("addr");
    let (tx, rx) = oneshot::channel();
    let group = OperationGroup::new(
        Some(local_peer(addr, Some("primary"))),
        Some("primary"),
        "DEV1".into(),
        1,
        Arc::new(RecordingStore::default()),
        Arc::new(RecordingReminders::default()),
        None,
        tx,
    );

    let mut ctx = OperationContext::failed("com.example.one", ErrorKind::DeviceNotFound);
    group.finalize(&mut ctx).await;

    let results = rx.await.expect("completion fires");
    assert_eq!(results["com.example.one"], Err(ErrorKind::DeviceNotFound));
}

#[tokio::test]
async fn no_designated_peer_means_no_remapping() {
    let addr = "127.0.0.1:9000".parse().expect("addr");
    let (tx, rx) = oneshot::channel();
    let group = OperationGroup::new(
        Some(local_peer(addr, None)),
        None,
        "DEV1".into(),
        1,
        Arc::new(RecordingStore::default()),
        Arc::new(RecordingReminders::default()),
        None,
        tx,
    );

    let mut ctx = OperationContext::failed("com.example.one", ErrorKind::LostConnection);
    group.finalize(&mut ctx).await;

    let results = rx.await.expect("completion fires");
    assert_eq!(results["com.example.one"], Err(ErrorKind::LostConnection));
}

#[tokio::test]
async fn empty_app_list_completes_immediately() {
    let fixture = Fixture::new(StubSigner::new(), StubPackages::empty());
    let pipeline = OperationPipeline::new(fixture.collaborators());

    // No peer is supplied: an empty invocation must return before discovery
    // or authentication would run.
    let results = timeout(
        Duration::from_secs(5),
        pipeline.install_apps(Vec::new(), InstallOptions::for_device("DEV1")),
    )
    .await
    .expect("empty invocation completes");

    assert!(results.is_empty());
    assert_eq!(fixture.signer.auth_count(), 0);
}

#[tokio::test]
async fn duplicate_bundle_ids_are_collapsed() {
    let devices = Arc::new(ScriptedDeviceManager::new(&["DEV1"]));
    let ctx = Arc::new(ServerContext::new(
        Arc::new(StubAnisette {
            payload: Ok(Vec::new()),
        }),
        Arc::clone(&devices) as Arc<dyn DeviceManager>,
        64 * 1024 * 1024,
    ));
    let (listener, addr) = start_server(ctx).await;

    let fixture = Fixture::new(StubSigner::new(), StubPackages::with_local_copies(&["com.example.one"]));
    let pipeline = OperationPipeline::new(fixture.collaborators());

    let mut opts = InstallOptions::for_device("DEV1");
    opts.peer = Some(local_peer(addr, None));
    let results = timeout(
        Duration::from_secs(5),
        pipeline.install_apps(
            vec!["com.example.one".into(), "com.example.one".into()],
            opts,
        ),
    )
    .await
    .expect("group with duplicates completes");

    assert_eq!(results.len(), 1);
    assert!(results["com.example.one"].is_ok());
    assert_eq!(devices.install_count(), 1);

    listener.stop().await;
}

#[tokio::test]
async fn cached_session_skips_reauthentication() {
    let (listener, addr) = start_server(server_ctx(ScriptedDeviceManager::new(&["DEV1"]))).await;

    let fixture = Fixture::new(StubSigner::new(), StubPackages::with_local_copies(&["com.example.one"]));
    let pipeline = OperationPipeline::new(fixture.collaborators());

    for _ in 0..2 {
        let mut opts = InstallOptions::for_device("DEV1");
        opts.peer = Some(local_peer(addr, None));
        let results = pipeline
            .install_apps(vec!["com.example.one".into()], opts)
            .await;
        assert!(results["com.example.one"].is_ok());
    }

    assert_eq!(fixture.signer.auth_count(), 1);

    listener.stop().await;
}

// ---------------------------------------------------------------------------
// Group-level invariants, driven directly
// ---------------------------------------------------------------------------

fn bare_group(
    expected: usize,
) -> (
    Arc<OperationGroup>,
    oneshot::Receiver<HashMap<String, airlift::AppResult>>,
    Arc<RecordingStore>,
) {
    let store = Arc::new(RecordingStore::default());
    let (tx, rx) = oneshot::channel();
    let group = OperationGroup::new(
        None,
        None,
        "DEV1".into(),
        expected,
        Arc::clone(&store) as _,
        Arc::new(RecordingReminders::default()),
        None,
        tx,
    );
    (group, rx, store)
}

#[tokio::test]
async fn empty_group_fires_completion_at_creation() {
    let (_group, rx, _store) = bare_group(0);
    let results = timeout(Duration::from_secs(5), rx)
        .await
        .expect("completion before timeout")
        .expect("completion fires");
    assert!(results.is_empty());
}

#[tokio::test]
async fn finalizing_the_same_context_twice_is_a_no_op() {
    let (group, rx, _store) = bare_group(1);

    let mut ctx = OperationContext::failed("com.example.one", ErrorKind::Unknown);
    group.finalize(&mut ctx).await;
    group.finalize(&mut ctx).await;

    let results = rx.await.expect("completion fires");
    assert_eq!(results.len(), 1);
    assert_eq!(results["com.example.one"], Err(ErrorKind::Unknown));
}

#[tokio::test]
async fn completion_fires_only_when_every_result_is_recorded() {
    let (group, mut rx, _store) = bare_group(2);

    let mut first = OperationContext::failed("com.example.one", ErrorKind::Cancelled);
    group.finalize(&mut first).await;
    assert!(rx.try_recv().is_err(), "completion must wait for all apps");

    let mut second = OperationContext::new("com.example.two");
    group.finalize(&mut second).await;

    let results = rx.await.expect("completion fires");
    assert_eq!(results.len(), 2);
    assert_eq!(results["com.example.one"], Err(ErrorKind::Cancelled));
    assert!(results["com.example.two"].is_ok());
}

#[tokio::test]
async fn cancelled_is_never_remapped() {
    let store = Arc::new(RecordingStore::default());
    let (tx, rx) = oneshot::channel();
    // Peer is absent and a preference is set, so retryable errors would be
    // remapped; cancelled must pass through regardless.
    let group = OperationGroup::new(
        None,
        Some("primary"),
        "DEV1".into(),
        1,
        Arc::clone(&store) as _,
        Arc::new(RecordingReminders::default()),
        None,
        tx,
    );

    let mut ctx = OperationContext::failed("com.example.one", ErrorKind::Cancelled);
    group.finalize(&mut ctx).await;

    let results = rx.await.expect("completion fires");
    assert_eq!(results["com.example.one"], Err(ErrorKind::Cancelled));
}
