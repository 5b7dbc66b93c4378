//! Contracts for the external collaborators the core drives.
//!
//! Everything behind these traits is out of scope for the core: credential
//! handling, package re-signing, the actual bytes-on-device install call,
//! durable storage and reminder delivery. The core only depends on the
//! narrow shapes below and normalizes every failure into [`ErrorKind`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Progress callback handed to [`DeviceManager::install_app`]. Fractions are
/// in `[0, 1]` and may arrive on any task.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Source of the opaque anisette payload served to peers on request.
#[async_trait]
pub trait AnisetteProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, ErrorKind>;
}

/// Access to locally attached devices and the device-level install call.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Identifiers of the devices currently available for installation.
    async fn available_devices(&self) -> HashSet<String>;

    /// Install the package at `package` onto `device_id`, reporting
    /// fractional progress through `on_progress` until completion.
    async fn install_app(
        &self,
        package: &Path,
        device_id: &str,
        on_progress: ProgressFn,
    ) -> Result<(), ErrorKind>;
}

/// Credentials produced by a successful authentication, cached across the
/// apps of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerSession {
    pub team_id: String,
    pub expires_at: DateTime<Utc>,
}

impl SignerSession {
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// Authentication and package re-signing, opaque beyond success/failure.
#[async_trait]
pub trait AppSigner: Send + Sync {
    /// May require external confirmation; single-shot per group unless the
    /// cached session has expired.
    async fn authenticate(&self) -> Result<SignerSession, ErrorKind>;

    /// Produce an installable package variant tied to the session's
    /// credentials. Returns the path of the resigned package.
    async fn resign(&self, bundle_id: &str, session: &SignerSession)
        -> Result<PathBuf, ErrorKind>;
}

/// Where application packages come from when the signer needs a copy.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// A valid local copy, if one exists. `None` forces a download.
    async fn local_copy(&self, bundle_id: &str) -> Option<PathBuf>;

    /// Fetch a fresh copy of the package.
    async fn download(&self, bundle_id: &str) -> Result<PathBuf, ErrorKind>;
}

/// Record persisted once per successful per-app result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAppRecord {
    pub bundle_id: String,
    pub device_id: String,
    pub installed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable storage of installed-application records.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn fetch_installed(&self, bundle_id: &str)
        -> Result<Option<InstalledAppRecord>, ErrorKind>;

    async fn save_installed(&self, record: &InstalledAppRecord) -> Result<(), ErrorKind>;
}

/// One-shot local reminder scheduling. Called opportunistically after a
/// successful install; failures are logged and never affect the result.
#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    async fn schedule_refresh_reminder(
        &self,
        identifier: &str,
        fire_date: DateTime<Utc>,
    ) -> Result<(), ErrorKind>;
}
