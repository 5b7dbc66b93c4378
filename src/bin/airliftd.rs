//! Installation service daemon.
//!
//! Binds the listener, advertises it over mDNS and serves install requests
//! until interrupted. Device access and anisette data come from small
//! environment-driven collaborators: `AIRLIFT_DEVICES` lists the device ids
//! this host will accept installs for, `AIRLIFT_INSTALL_DIR` is where
//! "installed" packages land, and `AIRLIFT_ANISETTE_FILE` points at the
//! payload served for anisette requests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;

use airlift::collaborators::{AnisetteProvider, DeviceManager, ProgressFn};
use airlift::{ErrorKind, ListenerState, ServerContext, ServiceListener, Settings};

const INSTALL_CHUNK: usize = 1024 * 1024;

struct FileAnisetteProvider {
    path: Option<PathBuf>,
}

#[async_trait]
impl AnisetteProvider for FileAnisetteProvider {
    async fn fetch(&self) -> Result<Vec<u8>, ErrorKind> {
        let Some(path) = &self.path else {
            warn!("anisette requested but AIRLIFT_ANISETTE_FILE is not set");
            return Err(ErrorKind::Unknown);
        };
        tokio::fs::read(path).await.map_err(|err| {
            warn!("failed to read anisette payload: {err}");
            ErrorKind::Unknown
        })
    }
}

/// Installs by copying the package into a per-device directory, reporting
/// progress per copied chunk. Stands in for real device tooling.
struct DirectoryDeviceManager {
    devices: HashSet<String>,
    install_dir: PathBuf,
}

#[async_trait]
impl DeviceManager for DirectoryDeviceManager {
    async fn available_devices(&self) -> HashSet<String> {
        self.devices.clone()
    }

    async fn install_app(
        &self,
        package: &Path,
        device_id: &str,
        on_progress: ProgressFn,
    ) -> Result<(), ErrorKind> {
        let total = tokio::fs::metadata(package)
            .await
            .map_err(|_| ErrorKind::Unknown)?
            .len();
        let target_dir = self.install_dir.join(device_id);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|_| ErrorKind::Unknown)?;
        let target = target_dir.join("installed.ipa");

        let mut src = tokio::fs::File::open(package)
            .await
            .map_err(|_| ErrorKind::Unknown)?;
        let mut dst = tokio::fs::File::create(&target)
            .await
            .map_err(|_| ErrorKind::Unknown)?;

        let mut buf = vec![0u8; INSTALL_CHUNK];
        let mut copied = 0u64;
        loop {
            let got = tokio::io::AsyncReadExt::read(&mut src, &mut buf)
                .await
                .map_err(|_| ErrorKind::Unknown)?;
            if got == 0 {
                break;
            }
            dst.write_all(&buf[..got])
                .await
                .map_err(|_| ErrorKind::Unknown)?;
            copied += got as u64;
            if total > 0 {
                on_progress(copied as f64 / total as f64);
            }
        }
        dst.flush().await.map_err(|_| ErrorKind::Unknown)?;
        info!("installed {} bytes onto {device_id}", copied);
        Ok(())
    }
}

fn settings_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("airlift.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load(&settings_path()).context("failed to load settings")?;

    let devices: HashSet<String> = std::env::var("AIRLIFT_DEVICES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if devices.is_empty() {
        warn!("AIRLIFT_DEVICES is empty; every prepareApp request will fail");
    }
    let install_dir = std::env::var("AIRLIFT_INSTALL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("airlift-installs"));
    let anisette_path = std::env::var("AIRLIFT_ANISETTE_FILE").ok().map(PathBuf::from);

    let ctx = Arc::new(ServerContext::new(
        Arc::new(FileAnisetteProvider { path: anisette_path }),
        Arc::new(DirectoryDeviceManager {
            devices,
            install_dir,
        }),
        settings.max_payload_bytes,
    ));

    let listener = ServiceListener::new(
        settings,
        ctx,
        Arc::new(|state: &ListenerState| match state {
            ListenerState::Running(descriptor) => {
                info!("service running at {}", descriptor.local_addr);
            }
            ListenerState::Failed(code) => {
                error!("listener failed: {code}");
            }
            other => info!("listener state: {other:?}"),
        }),
    );

    listener.start().await;

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!("shutting down");
    listener.stop().await;
    Ok(())
}
