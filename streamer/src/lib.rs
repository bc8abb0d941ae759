//! Live stream fan-out engine.
//!
//! Each channel has at most one upstream connection, shared by every client
//! watching it. The [`SessionRegistry`] maps channels to sessions, admits
//! clients and hands out [`ClientAttachment`]s that yield the channel's bytes.

pub mod admission;
pub mod attachment;
pub mod config;
pub mod connector;
pub mod failover;
mod hls;
pub mod metrics_defs;
pub mod registry;
pub mod session;
pub mod types;

#[cfg(test)]
mod testutils;

pub use admission::{AdmissionController, AdmissionError, AdmissionPermit};
pub use attachment::{AttachmentEvent, ClientAttachment, EndReason};
pub use config::StreamerConfig;
pub use connector::{ConnectError, HttpConnector, SourceConnector};
pub use failover::FailoverError;
pub use registry::{AttachError, SessionRegistry};
pub use types::{
    AttachmentId, ChannelId, ChannelStatus, Protocol, SourceCandidate, SourceSpec, UpstreamState,
};
