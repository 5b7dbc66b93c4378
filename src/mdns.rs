//! Service advertisement and peer discovery over mDNS.
//!
//! The listener registers `_airlift._tcp.local.` once its socket is bound;
//! clients browse the same type to locate an installation peer. The service
//! entry optionally carries a single opaque `serverID` text attribute that
//! callers use to recognise their preferred peer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use tokio::time;

pub const SERVICE_TYPE: &str = "_airlift._tcp.local.";
const SERVER_ID_KEY: &str = "serverID";

/// A resolved installation peer on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub service_name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub server_id: Option<String>,
}

impl DiscoveredPeer {
    pub fn matches_server_id(&self, server_id: &str) -> bool {
        self.server_id.as_deref() == Some(server_id)
    }
}

/// Owner of the mDNS daemon handle; registers outbound advertisements and
/// resolves inbound browse events.
pub struct MdnsService {
    daemon: ServiceDaemon,
    registered: tokio::sync::Mutex<HashMap<String, ServiceInfo>>,
}

impl MdnsService {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
        Ok(Self {
            daemon,
            registered: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Advertise the installation service on `port`. Returns the registered
    /// fullname, which [`Self::unregister`] accepts later.
    pub async fn register(
        &self,
        instance_name: &str,
        port: u16,
        server_id: Option<&str>,
    ) -> Result<String> {
        let mut props = HashMap::new();
        if let Some(id) = server_id {
            props.insert(SERVER_ID_KEY.to_string(), id.to_string());
        }

        let host_label = format!("{instance_name}.local.");
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &host_label,
            &[] as &[IpAddr],
            port,
            props,
        )
        .map_err(|err| anyhow!("failed to build mDNS service info: {err}"))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info.clone())
            .map_err(|err| anyhow!("mDNS register failed: {err}"))?;
        info!("advertising {fullname} on port {port}");

        let mut guard = self.registered.lock().await;
        guard.insert(fullname.clone(), info);
        Ok(fullname)
    }

    pub async fn unregister(&self, fullname: &str) -> Result<()> {
        let mut guard = self.registered.lock().await;
        if let Some(info) = guard.remove(fullname) {
            self.daemon
                .unregister(info.get_fullname())
                .map_err(|err| anyhow!("mDNS unregister failed: {err}"))?;
            info!("withdrew advertisement {fullname}");
        }
        Ok(())
    }

    /// Browse for an installation peer, resolving the first usable service.
    ///
    /// When `preferred_server_id` is set, a matching peer is returned as soon
    /// as it resolves; otherwise the first resolved peer wins. With a
    /// preference set, non-matching peers are still accepted once the timeout
    /// window closes with no better candidate.
    pub async fn discover(
        &self,
        timeout: Duration,
        preferred_server_id: Option<&str>,
    ) -> Result<DiscoveredPeer> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|err| anyhow!("mDNS browse failed: {err}"))?;

        let timer = time::sleep(timeout);
        tokio::pin!(timer);
        let mut fallback: Option<DiscoveredPeer> = None;

        loop {
            tokio::select! {
                _ = &mut timer => {
                    return fallback
                        .ok_or_else(|| anyhow!("no installation peer found within {timeout:?}"));
                }
                event = receiver.recv_async() => {
                    match event {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let Some(peer) = peer_from(&info) else {
                                debug!("resolved service without usable address: {}", info.get_fullname());
                                continue;
                            };
                            match preferred_server_id {
                                Some(id) if peer.matches_server_id(id) => return Ok(peer),
                                Some(_) => {
                                    debug!("holding non-preferred peer {}", peer.service_name);
                                    fallback.get_or_insert(peer);
                                }
                                None => return Ok(peer),
                            }
                        }
                        Ok(other) => {
                            debug!("mDNS event: {other:?}");
                        }
                        Err(err) => {
                            warn!("mDNS receive failed: {err}");
                            return Err(anyhow!("mDNS receive failed: {err}"));
                        }
                    }
                }
            }
        }
    }
}

fn peer_from(info: &ServiceInfo) -> Option<DiscoveredPeer> {
    let addr = pick_addr(info)?;
    Some(DiscoveredPeer {
        service_name: info.get_fullname().to_string(),
        addr,
        port: info.get_port(),
        server_id: info
            .get_property_val_str(SERVER_ID_KEY)
            .map(|value| value.to_string()),
    })
}

fn pick_addr(info: &ServiceInfo) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = info.get_addresses().iter().cloned().collect();

    let is_private_v4 = |addr: &IpAddr| match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    };

    // Prefer routable LAN addresses over link-local/virtual ones.
    if let Some(addr) = addrs.iter().find(|a| is_private_v4(a) && !a.is_loopback()) {
        return Some(*addr);
    }
    if let Some(addr) = addrs.iter().find(|a| !a.is_loopback()) {
        return Some(*addr);
    }
    addrs.first().copied()
}
