//! Listening socket lifecycle and service advertisement.
//!
//! [`ServiceListener`] owns the bound TCP socket, the mDNS advertisement and
//! the set of live connections. Its state machine is
//! `notRunning → connecting → running`, with `running → notRunning` on
//! [`ServiceListener::stop`] and any state `→ failed` on a transport error.
//! A failure is reported to the observer and the listener immediately
//! re-attempts `start()`; failures are never silent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::ErrorKind;
use crate::mdns::MdnsService;
use crate::session::{ConnectionSession, ServerContext};

/// What a running listener looks like from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub local_addr: SocketAddr,
    /// mDNS fullname of the advertisement, absent when advertising is off.
    pub service_fullname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    NotRunning,
    Connecting,
    Running(ServiceDescriptor),
    Failed(ErrorKind),
}

/// Callback invoked on every state transition. There is no way to mutate the
/// state from outside; observation is the whole contract.
pub type ListenerObserver = Arc<dyn Fn(&ListenerState) + Send + Sync>;

// ---------------------------------------------------------------------------
// Connection set
// ---------------------------------------------------------------------------

/// Owner of the live-connection identities.
///
/// A connection appears at most once between accept and its terminal
/// transport state; `remove` reports whether this call performed the removal
/// so that teardown stays idempotent under re-entry.
#[derive(Default)]
pub struct ConnectionSet {
    inner: Mutex<HashMap<Uuid, SocketAddr>>,
}

impl ConnectionSet {
    pub(crate) async fn insert(&self, id: Uuid, addr: SocketAddr) -> bool {
        let mut guard = self.inner.lock().await;
        guard.insert(id, addr).is_none()
    }

    pub(crate) async fn remove(&self, id: Uuid) -> bool {
        let mut guard = self.inner.lock().await;
        guard.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub struct ServiceListener {
    settings: Settings,
    ctx: Arc<ServerContext>,
    observer: ListenerObserver,
    connections: Arc<ConnectionSet>,
    state: Mutex<ListenerState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    // The mDNS daemon is only brought up when advertising is enabled.
    mdns: Mutex<Option<Arc<MdnsService>>>,
    registration: Mutex<Option<String>>,
}

impl ServiceListener {
    pub fn new(settings: Settings, ctx: Arc<ServerContext>, observer: ListenerObserver) -> Arc<Self> {
        Arc::new(Self {
            settings,
            ctx,
            observer,
            connections: Arc::new(ConnectionSet::default()),
            state: Mutex::new(ListenerState::NotRunning),
            accept_task: Mutex::new(None),
            mdns: Mutex::new(None),
            registration: Mutex::new(None),
        })
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

    pub async fn state(&self) -> ListenerState {
        self.state.lock().await.clone()
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    /// Begin listening and advertising. Idempotent: only acts from
    /// `NotRunning` or `Failed`.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            match *state {
                ListenerState::NotRunning | ListenerState::Failed(_) => {}
                _ => return,
            }
            *state = ListenerState::Connecting;
        }
        self.notify().await;

        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.settings.listen_port).into();
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("failed to bind {bind_addr}: {err}");
                self.fail_and_restart(ErrorKind::Unknown).await;
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("failed to resolve local address: {err}");
                self.fail_and_restart(ErrorKind::Unknown).await;
                return;
            }
        };

        let fullname = if self.settings.advertise {
            let registered = match self.mdns().await {
                Ok(mdns) => {
                    mdns.register(
                        &self.settings.service_name,
                        local_addr.port(),
                        self.settings.server_id.as_deref(),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match registered {
                Ok(fullname) => Some(fullname),
                Err(err) => {
                    warn!("service advertisement failed: {err:#}");
                    self.fail_and_restart(ErrorKind::Unknown).await;
                    return;
                }
            }
        } else {
            None
        };
        *self.registration.lock().await = fullname.clone();

        info!("listening on {local_addr}");
        {
            let mut state = self.state.lock().await;
            *state = ListenerState::Running(ServiceDescriptor {
                local_addr,
                service_fullname: fullname,
            });
        }
        self.notify().await;

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.accept_loop(listener).await });
        *self.accept_task.lock().await = Some(task);
    }

    /// Stop listening. Idempotent: only acts while `Running`.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if !matches!(*state, ListenerState::Running(_)) {
                return;
            }
            *state = ListenerState::NotRunning;
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        self.withdraw_advertisement().await;
        info!("listener stopped");
        self.notify().await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    ConnectionSession::spawn(
                        stream,
                        peer_addr,
                        Arc::clone(&self.ctx),
                        Arc::clone(&self.connections),
                    );
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    self.fail_and_restart(ErrorKind::Unknown).await;
                    return;
                }
            }
        }
    }

    /// Transition to `Failed`, report it, then re-attempt `start()`.
    /// There is no backoff; the observer hears about every failure.
    async fn fail_and_restart(self: &Arc<Self>, code: ErrorKind) {
        self.withdraw_advertisement().await;
        {
            let mut state = self.state.lock().await;
            *state = ListenerState::Failed(code);
        }
        self.notify().await;
        debug!("restarting listener after failure");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            this.restart().await;
        });
    }

    // `start` and `fail_and_restart` call each other; boxing this edge keeps
    // the future types finite.
    fn restart(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.start().await })
    }

    async fn withdraw_advertisement(&self) {
        let fullname = self.registration.lock().await.take();
        let mdns = self.mdns.lock().await.clone();
        if let (Some(fullname), Some(mdns)) = (fullname, mdns) {
            if let Err(err) = mdns.unregister(&fullname).await {
                warn!("failed to withdraw advertisement: {err:#}");
            }
        }
    }

    async fn notify(&self) {
        let state = self.state.lock().await.clone();
        (self.observer)(&state);
    }
}
