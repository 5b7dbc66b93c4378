//! Shared mock collaborators and server bootstrap for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use tokio::sync::Mutex;

use airlift::collaborators::{
    AnisetteProvider, AppSigner, DeviceManager, InstalledAppRecord, NotificationScheduler,
    PackageSource, PersistenceStore, ProgressFn, SignerSession,
};
use airlift::{DiscoveredPeer, ErrorKind, ListenerState, ServerContext, ServiceListener, Settings};

// ---------------------------------------------------------------------------
// Server-side mocks
// ---------------------------------------------------------------------------

pub struct StubAnisette {
    pub payload: Result<Vec<u8>, ErrorKind>,
}

#[async_trait]
impl AnisetteProvider for StubAnisette {
    async fn fetch(&self) -> Result<Vec<u8>, ErrorKind> {
        self.payload.clone()
    }
}

/// Device manager that replays a scripted progress sequence on install.
pub struct ScriptedDeviceManager {
    pub devices: HashSet<String>,
    pub script: Vec<f64>,
    /// Delay between script entries; `None` emits the whole script without
    /// yielding, which exercises the drop-if-busy path.
    pub step_delay: Option<Duration>,
    pub result: Result<(), ErrorKind>,
    pub installs: AtomicUsize,
}

impl ScriptedDeviceManager {
    pub fn new(devices: &[&str]) -> Self {
        Self {
            devices: devices.iter().map(|id| id.to_string()).collect(),
            script: vec![0.25, 0.5, 0.75],
            step_delay: Some(Duration::from_millis(5)),
            result: Ok(()),
            installs: AtomicUsize::new(0),
        }
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceManager for ScriptedDeviceManager {
    async fn available_devices(&self) -> HashSet<String> {
        self.devices.clone()
    }

    async fn install_app(
        &self,
        _package: &Path,
        _device_id: &str,
        on_progress: ProgressFn,
    ) -> Result<(), ErrorKind> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        for fraction in &self.script {
            on_progress(*fraction);
            if let Some(delay) = self.step_delay {
                tokio::time::sleep(delay).await;
            }
        }
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// Client-side mocks
// ---------------------------------------------------------------------------

pub struct StubSigner {
    pub dir: TempDir,
    pub fail_resign: HashSet<String>,
    pub auth_calls: AtomicUsize,
}

impl StubSigner {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("signer temp dir"),
            fail_resign: HashSet::new(),
            auth_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_for(bundle_ids: &[&str]) -> Self {
        let mut signer = Self::new();
        signer.fail_resign = bundle_ids.iter().map(|id| id.to_string()).collect();
        signer
    }

    pub fn auth_count(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppSigner for StubSigner {
    async fn authenticate(&self) -> Result<SignerSession, ErrorKind> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SignerSession {
            team_id: "TEAM0001".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }

    async fn resign(
        &self,
        bundle_id: &str,
        _session: &SignerSession,
    ) -> Result<PathBuf, ErrorKind> {
        if self.fail_resign.contains(bundle_id) {
            return Err(ErrorKind::Unknown);
        }
        let path = self.dir.path().join(format!("{bundle_id}.resigned.ipa"));
        tokio::fs::write(&path, vec![0x42u8; 2048])
            .await
            .map_err(|_| ErrorKind::Unknown)?;
        Ok(path)
    }
}

pub struct StubPackages {
    pub dir: TempDir,
    pub local: HashSet<String>,
    pub downloads: AtomicUsize,
}

impl StubPackages {
    pub fn with_local_copies(bundle_ids: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("packages temp dir");
        let local: HashSet<String> = bundle_ids.iter().map(|id| id.to_string()).collect();
        for bundle_id in &local {
            std::fs::write(dir.path().join(format!("{bundle_id}.ipa")), b"cached")
                .expect("seed local copy");
        }
        Self {
            dir,
            local,
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::with_local_copies(&[])
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageSource for StubPackages {
    async fn local_copy(&self, bundle_id: &str) -> Option<PathBuf> {
        self.local
            .contains(bundle_id)
            .then(|| self.dir.path().join(format!("{bundle_id}.ipa")))
    }

    async fn download(&self, bundle_id: &str) -> Result<PathBuf, ErrorKind> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("{bundle_id}.fresh.ipa"));
        tokio::fs::write(&path, b"downloaded")
            .await
            .map_err(|_| ErrorKind::Unknown)?;
        Ok(path)
    }
}

#[derive(Default)]
pub struct RecordingStore {
    pub saved: Mutex<Vec<InstalledAppRecord>>,
}

#[async_trait]
impl PersistenceStore for RecordingStore {
    async fn fetch_installed(
        &self,
        bundle_id: &str,
    ) -> Result<Option<InstalledAppRecord>, ErrorKind> {
        let saved = self.saved.lock().await;
        Ok(saved.iter().rev().find(|r| r.bundle_id == bundle_id).cloned())
    }

    async fn save_installed(&self, record: &InstalledAppRecord) -> Result<(), ErrorKind> {
        self.saved.lock().await.push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReminders {
    pub scheduled: Mutex<Vec<(String, DateTime<Utc>)>>,
}

#[async_trait]
impl NotificationScheduler for RecordingReminders {
    async fn schedule_refresh_reminder(
        &self,
        identifier: &str,
        fire_date: DateTime<Utc>,
    ) -> Result<(), ErrorKind> {
        self.scheduled
            .lock()
            .await
            .push((identifier.to_string(), fire_date));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

/// Start a listener without mDNS advertisement on an ephemeral port.
pub async fn start_server(ctx: Arc<ServerContext>) -> (Arc<ServiceListener>, SocketAddr) {
    let settings = Settings {
        advertise: false,
        ..Settings::default()
    };
    let listener = ServiceListener::new(settings, ctx, Arc::new(|_: &ListenerState| {}));
    listener.start().await;
    let addr = match listener.state().await {
        ListenerState::Running(descriptor) => descriptor.local_addr,
        other => panic!("listener failed to start: {other:?}"),
    };
    let connect_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    (listener, connect_addr)
}

/// Peer descriptor pointing at a locally started server.
pub fn local_peer(addr: SocketAddr, server_id: Option<&str>) -> DiscoveredPeer {
    DiscoveredPeer {
        service_name: "airlift._airlift._tcp.local.".into(),
        addr: addr.ip(),
        port: addr.port(),
        server_id: server_id.map(str::to_string),
    }
}
