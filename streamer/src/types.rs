use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

pub type ChannelId = String;

/// How bytes are pulled from a source.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// A continuous HTTP body, usually MPEG-TS.
    #[default]
    Ts,
    /// An HLS media (or master) playlist whose segments are concatenated.
    Hls,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceCandidate {
    pub url: Url,
    pub protocol: Protocol,
    /// Extra request headers sent to this source, e.g. authorization.
    pub headers: HeaderMap,
}

impl SourceCandidate {
    pub fn new(url: Url) -> Self {
        SourceCandidate {
            url,
            protocol: Protocol::default(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Ordered candidate sources for one channel, first = preferred.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceSpec {
    pub candidates: Vec<SourceCandidate>,
}

impl SourceSpec {
    pub fn new(candidates: Vec<SourceCandidate>) -> Self {
        SourceSpec { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AttachmentId(pub u64);

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    Empty,
    Connecting,
    Streaming,
    Reconnecting,
    /// Zero attachments, upstream kept open until the idle grace period ends.
    Draining,
}

/// Read-only snapshot of one channel session, served by the status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub attachment_count: usize,
    pub upstream_state: UpstreamState,
    pub active_source: Option<String>,
    pub connects: u64,
    pub idle_secs: u64,
}
