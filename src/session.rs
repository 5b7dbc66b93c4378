//! Per-connection request handling.
//!
//! A [`ConnectionSession`] owns one accepted transport connection from
//! registration in the listener's connection set until disconnect. The first
//! decoded request selects the handler: an anisette fetch is answered and the
//! connection closed, while `prepareApp` enters the three-phase installation
//! flow (receive package, await `beginInstallation`, drive the device install
//! while streaming progress responses).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::collaborators::{AnisetteProvider, DeviceManager, ProgressFn};
use crate::error::ErrorKind;
use crate::listener::ConnectionSet;
use crate::protocol::{read_request, write_frame, ServerRequest, ServerResponse};

const RECEIVE_CHUNK: usize = 64 * 1024;

/// Collaborators and limits shared by every session of one listener.
pub struct ServerContext {
    pub anisette: Arc<dyn AnisetteProvider>,
    pub devices: Arc<dyn DeviceManager>,
    pub max_payload_bytes: u64,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerContext {
    pub fn new(
        anisette: Arc<dyn AnisetteProvider>,
        devices: Arc<dyn DeviceManager>,
        max_payload_bytes: u64,
    ) -> Self {
        Self {
            anisette,
            devices,
            max_payload_bytes,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Installs targeting one device are mutually exclusive; concurrent
    /// `prepareApp` flows for the same device id queue behind this lock.
    async fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut guard = self.device_locks.lock().await;
        guard
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// State machine for one accepted connection.
pub(crate) struct ConnectionSession {
    id: Uuid,
    peer_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    connections: Arc<ConnectionSet>,
}

impl ConnectionSession {
    pub(crate) fn spawn(
        stream: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<ServerContext>,
        connections: Arc<ConnectionSet>,
    ) -> tokio::task::JoinHandle<()> {
        let session = Self {
            id: Uuid::new_v4(),
            peer_addr,
            ctx,
            connections,
        };
        tokio::spawn(async move { session.run(stream).await })
    }

    async fn run(&self, mut stream: TcpStream) {
        if !self.connections.insert(self.id, self.peer_addr).await {
            // Cannot happen for freshly generated ids, but registration is
            // guarded all the same.
            warn!("duplicate connection registration for {}", self.id);
            return;
        }
        debug!("connection {} accepted from {}", self.id, self.peer_addr);

        if let Err(code) = self.route(&mut stream).await {
            // Failures are normalized before they reach the wire; a lost
            // connection has nothing left to write to, but attempting the
            // send is harmless.
            debug!("connection {} finished with {code:?}", self.id);
            let _ = write_frame(&mut stream, &ServerResponse::Error { code }).await;
        }

        self.disconnect(&mut stream).await;
    }

    /// Dispatch on the first decoded request.
    async fn route(&self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        match read_request(stream).await? {
            ServerRequest::AnisetteData => {
                let payload = self.ctx.anisette.fetch().await?;
                write_frame(stream, &ServerResponse::AnisetteData { payload }).await
            }
            ServerRequest::PrepareApp {
                device_id,
                content_size,
            } => self.installation_flow(stream, &device_id, content_size).await,
            ServerRequest::BeginInstallation => Err(ErrorKind::UnknownRequest),
        }
    }

    async fn installation_flow(
        &self,
        stream: &mut TcpStream,
        device_id: &str,
        content_size: u64,
    ) -> Result<(), ErrorKind> {
        if content_size == 0 || content_size > self.ctx.max_payload_bytes {
            return Err(ErrorKind::InvalidRequest);
        }
        if !self.ctx.devices.available_devices().await.contains(device_id) {
            return Err(ErrorKind::DeviceNotFound);
        }

        // The staging directory is scoped to this flow; dropping it removes
        // the received package on every exit path.
        let staging = tempfile::tempdir().map_err(|err| {
            warn!("failed to create staging directory: {err}");
            ErrorKind::Unknown
        })?;
        let package_path = staging.path().join("package.ipa");
        receive_package(stream, &package_path, content_size).await?;
        debug!(
            "connection {} staged {content_size} bytes for device {device_id}",
            self.id
        );

        match read_request(stream).await? {
            ServerRequest::BeginInstallation => {}
            _ => return Err(ErrorKind::UnknownRequest),
        }

        let device_lock = self.ctx.device_lock(device_id).await;
        let _exclusive = device_lock.lock().await;

        self.drive_install(stream, &package_path, device_id).await
    }

    /// Run the device install, forwarding progress over the connection.
    ///
    /// Only one outbound message may be in flight at a time, so progress
    /// notifications use a single-slot buffer: `try_send` into a bounded(1)
    /// channel drops whatever arrives while the slot is occupied. The
    /// terminal message (`1.0` or an error) is always delivered.
    async fn drive_install(
        &self,
        stream: &mut TcpStream,
        package: &Path,
        device_id: &str,
    ) -> Result<(), ErrorKind> {
        let (tx, mut rx) = mpsc::channel::<f64>(1);
        let on_progress: ProgressFn = Box::new(move |fraction| {
            // Drop-if-busy: a full slot means a send is pending.
            let _ = tx.try_send(fraction);
        });

        let mut install = Box::pin(self.ctx.devices.install_app(package, device_id, on_progress));
        let result = loop {
            tokio::select! {
                result = &mut install => break result,
                Some(fraction) = rx.recv() => {
                    // Intermediate updates only; the terminal 1.0 is sent
                    // exactly once below.
                    if (0.0..1.0).contains(&fraction) {
                        write_frame(
                            stream,
                            &ServerResponse::InstallationProgress { progress: fraction },
                        )
                        .await?;
                    }
                }
            }
        };

        result?;
        write_frame(stream, &ServerResponse::InstallationProgress { progress: 1.0 }).await
    }

    /// Idempotent teardown: the connection leaves the active set exactly
    /// once, and the transport is only shut down by whoever removed it.
    async fn disconnect(&self, stream: &mut TcpStream) {
        if !self.connections.remove(self.id).await {
            return;
        }
        let _ = stream.shutdown().await;
        debug!("connection {} closed", self.id);
    }
}

/// Receive exactly `content_size` raw (unframed) bytes into `path`.
async fn receive_package(
    stream: &mut TcpStream,
    path: &Path,
    content_size: u64,
) -> Result<(), ErrorKind> {
    let mut file = tokio::fs::File::create(path).await.map_err(|err| {
        warn!("failed to create package file: {err}");
        ErrorKind::Unknown
    })?;

    let mut buf = vec![0u8; RECEIVE_CHUNK];
    let mut remaining = content_size;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let got = stream
            .read(&mut buf[..want])
            .await
            .map_err(|_| ErrorKind::LostConnection)?;
        if got == 0 {
            return Err(ErrorKind::LostConnection);
        }
        file.write_all(&buf[..got]).await.map_err(|err| {
            warn!("failed to write package file: {err}");
            ErrorKind::Unknown
        })?;
        remaining -= got as u64;
    }
    file.flush().await.map_err(|_| ErrorKind::Unknown)?;
    Ok(())
}
