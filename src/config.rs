//! Runtime settings for the daemon and the pipeline.
//!
//! Stored as a JSON file; missing fields fall back to validated defaults and
//! out-of-range values are clamped on load, so a hand-edited file can never
//! put the service into an unusable state.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const MIN_PAYLOAD_BYTES: u64 = 1024;
const MAX_PAYLOAD_BYTES: u64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;
const MIN_DISCOVERY_SECS: u64 = 1;
const MAX_DISCOVERY_SECS: u64 = 120;
const DEFAULT_DISCOVERY_SECS: u64 = 10;

fn default_service_name() -> String {
    "airlift".to_string()
}

fn default_discovery_secs() -> u64 {
    DEFAULT_DISCOVERY_SECS
}

fn default_max_payload() -> u64 {
    DEFAULT_PAYLOAD_BYTES
}

fn default_advertise() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// mDNS instance name to advertise under.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// TCP listen port; 0 binds an ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Opaque identifier published in the service metadata; callers use it
    /// to mark a preferred peer.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Whether to publish the mDNS advertisement at all.
    #[serde(default = "default_advertise")]
    pub advertise: bool,
    #[serde(default = "default_discovery_secs")]
    pub discovery_timeout_secs: u64,
    /// Largest package payload a `prepareApp` request may announce.
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            listen_port: 0,
            server_id: None,
            advertise: true,
            discovery_timeout_secs: DEFAULT_DISCOVERY_SECS,
            max_payload_bytes: DEFAULT_PAYLOAD_BYTES,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let mut settings: Settings =
            serde_json::from_str(&raw).context("failed to parse settings")?;
        settings.clamp();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create settings directory")?;
        }
        let raw = serde_json::to_string_pretty(self).context("failed to encode settings")?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write settings to {}", path.display()))?;
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    fn clamp(&mut self) {
        if self.service_name.trim().is_empty() {
            self.service_name = default_service_name();
        }
        self.discovery_timeout_secs = self
            .discovery_timeout_secs
            .clamp(MIN_DISCOVERY_SECS, MAX_DISCOVERY_SECS);
        self.max_payload_bytes = self
            .max_payload_bytes
            .clamp(MIN_PAYLOAD_BYTES, MAX_PAYLOAD_BYTES);
    }
}
