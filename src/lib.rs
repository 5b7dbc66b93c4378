//! Local-network app installation service.
//!
//! One side advertises an installation service over mDNS and accepts
//! length-prefixed requests ([`listener`], [`session`]); the other discovers
//! that peer, transmits a package and drives the multi-step install pipeline
//! to completion while reporting weighted progress ([`pipeline`]). Everything
//! the core does not own (signing, device installs, storage, reminders)
//! sits behind the [`collaborators`] traits.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod listener;
pub mod mdns;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use config::Settings;
pub use error::ErrorKind;
pub use listener::{ConnectionSet, ListenerObserver, ListenerState, ServiceDescriptor, ServiceListener};
pub use mdns::{DiscoveredPeer, MdnsService};
pub use pipeline::{AppResult, InstallOptions, OperationPipeline, PipelineCollaborators};
pub use session::ServerContext;
