//! Per-app installation pipelines and their shared operation group.
//!
//! One invocation builds a dependency graph per requested app. The peer
//! lookup and authentication are computed once and shared by every app;
//! after that each app's chain (resign, optional download, send, install)
//! runs as its own task, so independent apps proceed concurrently while the
//! steps inside one app serialize on their dependencies. Failures finalize
//! that app only; the group's completion fires exactly once, when every
//! app has a recorded result.

pub mod progress;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use crate::collaborators::{
    AppSigner, InstalledAppRecord, NotificationScheduler, PackageSource, PersistenceStore,
    SignerSession,
};
use crate::error::ErrorKind;
use crate::mdns::{DiscoveredPeer, MdnsService};
use crate::protocol::{read_response, write_frame, ServerRequest, ServerResponse};

use progress::{AppProgress, ProgressObserver, StepKind};

/// Days before a freshly installed app needs re-signing.
const RECORD_VALIDITY_DAYS: i64 = 7;
/// Refresh reminders fire one day before the record expires.
const REMINDER_LEAD_DAYS: i64 = 1;

pub type AppResult = Result<InstalledAppRecord, ErrorKind>;

/// Callback invoked when an app's device install actually begins.
pub type BeginInstallationHandler = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Options and collaborator bundle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InstallOptions {
    /// Device the server should install onto.
    pub target_device_id: String,
    /// Identifier of the caller's primary server, if any. Affects error
    /// remapping: retryable failures from any other peer become
    /// `serverNotFound`.
    pub preferred_server_id: Option<String>,
    /// Download a fresh package even when a valid local copy exists.
    pub force_download: bool,
    pub discovery_timeout: Duration,
    /// Skip discovery and use this peer directly.
    pub peer: Option<DiscoveredPeer>,
}

impl InstallOptions {
    pub fn for_device(target_device_id: impl Into<String>) -> Self {
        Self {
            target_device_id: target_device_id.into(),
            preferred_server_id: None,
            force_download: false,
            discovery_timeout: Duration::from_secs(10),
            peer: None,
        }
    }
}

#[derive(Clone)]
pub struct PipelineCollaborators {
    pub signer: Arc<dyn AppSigner>,
    pub packages: Arc<dyn PackageSource>,
    pub store: Arc<dyn PersistenceStore>,
    pub reminders: Arc<dyn NotificationScheduler>,
}

// ---------------------------------------------------------------------------
// Operation context
// ---------------------------------------------------------------------------

/// Mutable per-app record threaded through one pipeline run. Owned by that
/// app's task; never shared across apps.
pub struct OperationContext {
    pub bundle_id: String,
    pub resigned_package: Option<PathBuf>,
    pub local_package: Option<PathBuf>,
    pub connection: Option<TcpStream>,
    pub installed_record: Option<InstalledAppRecord>,
    pub error: Option<ErrorKind>,
    /// Flips false to true at most once; all finalize logic is guarded by it.
    pub finished: bool,
}

impl OperationContext {
    pub fn new(bundle_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            resigned_package: None,
            local_package: None,
            connection: None,
            installed_record: None,
            error: None,
            finished: false,
        }
    }

    pub fn failed(bundle_id: impl Into<String>, code: ErrorKind) -> Self {
        let mut ctx = Self::new(bundle_id);
        ctx.error = Some(code);
        ctx
    }
}

// ---------------------------------------------------------------------------
// Operation group
// ---------------------------------------------------------------------------

struct GroupShared {
    results: HashMap<String, AppResult>,
    completion: Option<oneshot::Sender<HashMap<String, AppResult>>>,
    progress_by_app: HashMap<String, Arc<AppProgress>>,
}

/// Shared state across every per-app pipeline of one invocation.
pub struct OperationGroup {
    peer: Option<DiscoveredPeer>,
    peer_is_preferred: bool,
    target_device_id: String,
    expected: usize,
    store: Arc<dyn PersistenceStore>,
    reminders: Arc<dyn NotificationScheduler>,
    on_begin_installation: Option<BeginInstallationHandler>,
    shared: Mutex<GroupShared>,
}

impl OperationGroup {
    pub fn new(
        peer: Option<DiscoveredPeer>,
        preferred_server_id: Option<&str>,
        target_device_id: String,
        expected: usize,
        store: Arc<dyn PersistenceStore>,
        reminders: Arc<dyn NotificationScheduler>,
        on_begin_installation: Option<BeginInstallationHandler>,
        completion: oneshot::Sender<HashMap<String, AppResult>>,
    ) -> Arc<Self> {
        // With no designated primary server, the located peer is as good as
        // any; remapping to serverNotFound would just send the caller on a
        // retry loop with nothing better to find.
        let peer_is_preferred = match (preferred_server_id, &peer) {
            (None, _) => true,
            (Some(id), Some(peer)) => peer.matches_server_id(id),
            (Some(_), None) => false,
        };
        // An empty group has no result to wait for; completion fires at
        // creation so waiters never block on it.
        let completion = if expected == 0 {
            let _ = completion.send(HashMap::new());
            None
        } else {
            Some(completion)
        };
        Arc::new(Self {
            peer,
            peer_is_preferred,
            target_device_id,
            expected,
            store,
            reminders,
            on_begin_installation,
            shared: Mutex::new(GroupShared {
                results: HashMap::new(),
                completion,
                progress_by_app: HashMap::new(),
            }),
        })
    }

    pub fn peer(&self) -> Option<&DiscoveredPeer> {
        self.peer.as_ref()
    }

    pub async fn progress_for(&self, bundle_id: &str) -> Option<Arc<AppProgress>> {
        self.shared.lock().await.progress_by_app.get(bundle_id).cloned()
    }

    /// Overall fraction across every registered app.
    pub async fn overall_fraction(&self) -> f64 {
        let progress: Vec<Arc<AppProgress>> = {
            let guard = self.shared.lock().await;
            guard.progress_by_app.values().cloned().collect()
        };
        if progress.is_empty() {
            return 0.0;
        }
        let mut total = 0u64;
        let mut done = 0.0;
        for app in progress {
            total += app.total_units();
            done += app.fraction().await * app.total_units() as f64;
        }
        done / total as f64
    }

    async fn register_progress(&self, progress: Arc<AppProgress>) {
        let mut guard = self.shared.lock().await;
        guard
            .progress_by_app
            .insert(progress.bundle_id().to_string(), progress);
    }

    fn notify_begin_installation(&self, bundle_id: &str) {
        if let Some(handler) = &self.on_begin_installation {
            handler(bundle_id);
        }
    }

    /// Finalize one app's context and record its result.
    ///
    /// A no-op when the context is already finished; each app's context is
    /// owned by exactly one task, and the flag makes repeated calls safe.
    /// Result recording itself funnels through the group's lock so the maps
    /// stay consistent across concurrently finishing apps.
    pub async fn finalize(&self, ctx: &mut OperationContext) {
        if ctx.finished {
            return;
        }
        ctx.finished = true;

        let result = match ctx.error {
            Some(code) => Err(self.classify(code)),
            None => self.persist_success(ctx).await,
        };

        if let Err(code) = &result {
            warn!("operation for {} failed: {code}", ctx.bundle_id);
        }
        self.record_result(ctx.bundle_id.clone(), result).await;
    }

    /// Remap retryable failures from a non-preferred peer to
    /// `serverNotFound`; everything else propagates verbatim. `cancelled`
    /// is never remapped.
    fn classify(&self, code: ErrorKind) -> ErrorKind {
        if code.is_retryable_on_other_peer() && !self.peer_is_preferred {
            ErrorKind::ServerNotFound
        } else {
            code
        }
    }

    async fn persist_success(&self, ctx: &mut OperationContext) -> AppResult {
        if let Ok(Some(existing)) = self.store.fetch_installed(&ctx.bundle_id).await {
            debug!(
                "replacing installed record for {} from {}",
                ctx.bundle_id, existing.installed_at
            );
        }

        let installed_at = Utc::now();
        let record = InstalledAppRecord {
            bundle_id: ctx.bundle_id.clone(),
            device_id: self.target_device_id.clone(),
            installed_at,
            expires_at: installed_at + ChronoDuration::days(RECORD_VALIDITY_DAYS),
        };
        self.store.save_installed(&record).await?;

        // Best effort; a failed reminder never affects the result.
        let fire_date = record.expires_at - ChronoDuration::days(REMINDER_LEAD_DAYS);
        if let Err(code) = self
            .reminders
            .schedule_refresh_reminder(&record.bundle_id, fire_date)
            .await
        {
            warn!("failed to schedule refresh reminder for {}: {code}", record.bundle_id);
        }

        ctx.installed_record = Some(record.clone());
        Ok(record)
    }

    async fn record_result(&self, bundle_id: String, result: AppResult) {
        let mut shared = self.shared.lock().await;
        if shared.results.contains_key(&bundle_id) {
            warn!("duplicate result for {bundle_id} discarded");
            return;
        }
        shared.results.insert(bundle_id, result);
        if shared.results.len() == self.expected {
            if let Some(completion) = shared.completion.take() {
                let _ = completion.send(shared.results.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct OperationPipeline {
    collab: PipelineCollaborators,
    progress_observer: Option<ProgressObserver>,
    on_begin_installation: Option<BeginInstallationHandler>,
    // Brought up on the first install that actually needs discovery.
    mdns: Mutex<Option<Arc<MdnsService>>>,
    cached_session: Mutex<Option<SignerSession>>,
}

impl OperationPipeline {
    pub fn new(collab: PipelineCollaborators) -> Self {
        Self {
            collab,
            progress_observer: None,
            on_begin_installation: None,
            mdns: Mutex::new(None),
            cached_session: Mutex::new(None),
        }
    }

    async fn mdns(&self) -> anyhow::Result<Arc<MdnsService>> {
        let mut guard = self.mdns.lock().await;
        if let Some(mdns) = guard.as_ref() {
            return Ok(Arc::clone(mdns));
        }
        let mdns = Arc::new(MdnsService::new()?);
        *guard = Some(Arc::clone(&mdns));
        Ok(mdns)
    }

    /// Register the per-app progress callback. Must happen before
    /// [`Self::install_apps`]; updates are delivered from the app tasks.
    pub fn with_progress_observer(mut self, observer: ProgressObserver) -> Self {
        self.progress_observer = Some(observer);
        self
    }

    pub fn with_begin_installation_handler(mut self, handler: BeginInstallationHandler) -> Self {
        self.on_begin_installation = Some(handler);
        self
    }

    /// Install every listed app onto the target device, returning the
    /// per-app result map once all pipelines have finished.
    pub async fn install_apps(
        &self,
        bundle_ids: Vec<String>,
        opts: InstallOptions,
    ) -> HashMap<String, AppResult> {
        // A duplicate id would record one result for several expected slots
        // and stall the group; collapse them up front.
        let mut bundle_ids = bundle_ids;
        let mut seen = HashSet::with_capacity(bundle_ids.len());
        bundle_ids.retain(|id| seen.insert(id.clone()));
        if bundle_ids.is_empty() {
            return HashMap::new();
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let expected = bundle_ids.len();

        // Locate-peer: one lookup shared by every app in the group.
        let located = match opts.peer.clone() {
            Some(peer) => Ok(peer),
            None => self.locate_peer(&opts).await,
        };

        let (peer, locate_error) = match located {
            Ok(peer) => (Some(peer), None),
            Err(code) => (None, Some(code)),
        };

        let group = OperationGroup::new(
            peer.clone(),
            opts.preferred_server_id.as_deref(),
            opts.target_device_id.clone(),
            expected,
            Arc::clone(&self.collab.store),
            Arc::clone(&self.collab.reminders),
            self.on_begin_installation.clone(),
            completion_tx,
        );

        if let Some(code) = locate_error {
            return self.fail_all(&group, bundle_ids, code, completion_rx).await;
        }

        // Authenticate once per group, skipped while the cached session is
        // still valid.
        let session = match self.authenticate().await {
            Ok(session) => session,
            Err(code) => {
                return self.fail_all(&group, bundle_ids, code, completion_rx).await;
            }
        };

        let peer = match peer {
            Some(peer) => peer,
            None => {
                return self
                    .fail_all(&group, bundle_ids, ErrorKind::ServerNotFound, completion_rx)
                    .await;
            }
        };

        let mut tasks = Vec::with_capacity(expected);
        for bundle_id in bundle_ids {
            let group = Arc::clone(&group);
            let collab = self.collab.clone();
            let peer = peer.clone();
            let session = session.clone();
            let device_id = opts.target_device_id.clone();
            let observer = self.progress_observer.clone();
            let force_download = opts.force_download;
            tasks.push(tokio::spawn(async move {
                run_app_pipeline(
                    group,
                    collab,
                    peer,
                    session,
                    bundle_id,
                    device_id,
                    force_download,
                    observer,
                )
                .await;
            }));
        }
        for joined in futures::future::join_all(tasks).await {
            if let Err(err) = joined {
                warn!("app pipeline task failed: {err}");
            }
        }

        completion_rx.await.unwrap_or_else(|_| {
            warn!("completion channel closed before all results were recorded");
            HashMap::new()
        })
    }

    async fn locate_peer(&self, opts: &InstallOptions) -> Result<DiscoveredPeer, ErrorKind> {
        let mdns = self.mdns().await.map_err(|err| {
            warn!("failed to start discovery: {err:#}");
            ErrorKind::ServerNotFound
        })?;
        mdns.discover(opts.discovery_timeout, opts.preferred_server_id.as_deref())
            .await
            .map_err(|err| {
                warn!("peer discovery failed: {err:#}");
                ErrorKind::ServerNotFound
            })
    }

    async fn authenticate(&self) -> Result<SignerSession, ErrorKind> {
        {
            let cached = self.cached_session.lock().await;
            if let Some(session) = cached.as_ref().filter(|session| session.is_valid()) {
                debug!("reusing cached signer session for team {}", session.team_id);
                return Ok(session.clone());
            }
        }
        let session = self.collab.signer.authenticate().await?;
        *self.cached_session.lock().await = Some(session.clone());
        Ok(session)
    }

    /// Group-level failure: every app finalizes with the same error.
    async fn fail_all(
        &self,
        group: &Arc<OperationGroup>,
        bundle_ids: Vec<String>,
        code: ErrorKind,
        completion_rx: oneshot::Receiver<HashMap<String, AppResult>>,
    ) -> HashMap<String, AppResult> {
        for bundle_id in bundle_ids {
            let mut ctx = OperationContext::failed(bundle_id, code);
            group.finalize(&mut ctx).await;
        }
        completion_rx.await.unwrap_or_else(|_| {
            warn!("completion channel closed before all results were recorded");
            HashMap::new()
        })
    }
}

// ---------------------------------------------------------------------------
// Per-app DAG execution
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_app_pipeline(
    group: Arc<OperationGroup>,
    collab: PipelineCollaborators,
    peer: DiscoveredPeer,
    session: SignerSession,
    bundle_id: String,
    device_id: String,
    force_download: bool,
    observer: Option<ProgressObserver>,
) {
    let mut ctx = OperationContext::new(&bundle_id);

    ctx.local_package = collab.packages.local_copy(&bundle_id).await;
    let needs_download = force_download || ctx.local_package.is_none();

    let progress = AppProgress::new(&bundle_id, needs_download, observer);
    group.register_progress(Arc::clone(&progress)).await;

    // resign
    let resigned = match collab.signer.resign(&bundle_id, &session).await {
        Ok(path) => {
            ctx.resigned_package = Some(path.clone());
            progress.complete(StepKind::Resign).await;
            path
        }
        Err(code) => {
            ctx.error = Some(code);
            group.finalize(&mut ctx).await;
            return;
        }
    };

    // download (only when no valid local copy exists, or one was forced)
    if needs_download {
        match collab.packages.download(&bundle_id).await {
            Ok(path) => {
                ctx.local_package = Some(path);
                progress.complete(StepKind::Download).await;
            }
            Err(code) => {
                ctx.error = Some(code);
                group.finalize(&mut ctx).await;
                return;
            }
        }
    }

    // send
    match send_package(&peer, &device_id, &resigned).await {
        Ok(stream) => {
            ctx.connection = Some(stream);
            progress.complete(StepKind::Send).await;
        }
        Err(code) => {
            ctx.error = Some(code);
            group.finalize(&mut ctx).await;
            return;
        }
    }

    // install
    group.notify_begin_installation(&bundle_id);
    let Some(mut stream) = ctx.connection.take() else {
        // send just stored it; reaching here without a connection is a bug
        ctx.error = Some(ErrorKind::Unknown);
        group.finalize(&mut ctx).await;
        return;
    };
    match drive_install(&mut stream, &progress).await {
        Ok(()) => {
            progress.complete(StepKind::Install).await;
            group.finalize(&mut ctx).await;
        }
        Err(code) => {
            ctx.error = Some(code);
            group.finalize(&mut ctx).await;
        }
    }
}

/// Open the client connection and transmit the resigned package: one
/// `prepareApp` frame, then the raw bytes.
async fn send_package(
    peer: &DiscoveredPeer,
    device_id: &str,
    package: &Path,
) -> Result<TcpStream, ErrorKind> {
    let content_size = tokio::fs::metadata(package)
        .await
        .map_err(|err| {
            warn!("failed to stat {}: {err}", package.display());
            ErrorKind::Unknown
        })?
        .len();

    let mut stream = TcpStream::connect((peer.addr, peer.port))
        .await
        .map_err(|_| ErrorKind::LostConnection)?;

    write_frame(
        &mut stream,
        &ServerRequest::PrepareApp {
            device_id: device_id.to_string(),
            content_size,
        },
    )
    .await?;

    let mut file = tokio::fs::File::open(package).await.map_err(|err| {
        warn!("failed to open {}: {err}", package.display());
        ErrorKind::Unknown
    })?;
    let sent = tokio::io::copy(&mut file, &mut stream)
        .await
        .map_err(|_| ErrorKind::LostConnection)?;
    if sent != content_size {
        return Err(ErrorKind::LostConnection);
    }
    stream.flush().await.map_err(|_| ErrorKind::LostConnection)?;
    Ok(stream)
}

/// Ask the server to install and consume its progress stream until the
/// terminal message.
async fn drive_install(stream: &mut TcpStream, progress: &AppProgress) -> Result<(), ErrorKind> {
    write_frame(stream, &ServerRequest::BeginInstallation).await?;
    loop {
        match read_response(stream).await? {
            ServerResponse::InstallationProgress { progress: fraction } => {
                progress.update_install(fraction).await;
                if fraction >= 1.0 {
                    return Ok(());
                }
            }
            ServerResponse::Error { code } => return Err(code),
            ServerResponse::AnisetteData { .. } => return Err(ErrorKind::InvalidResponse),
        }
    }
}
