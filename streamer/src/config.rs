use crate::failover::FailoverSettings;
use crate::session::SessionSettings;
use serde::Deserialize;
use std::time::Duration;

/// Tuning of the stream engine. Every field has a default so the whole
/// section may be omitted from the configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamerConfig {
    /// Upper bound for establishing one upstream connection
    pub connect_timeout_secs: u64,
    /// Upper bound for waiting on the next chunk of a connected upstream
    pub read_timeout_secs: u64,
    /// How long an upstream stays open after its last client left
    pub idle_grace_secs: u64,
    /// Full passes over the candidate list before giving up
    pub max_passes: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Chunks buffered per client before it is dropped as too slow
    pub client_buffer_chunks: usize,
    /// Global concurrent client limit, 0 means unlimited
    pub max_connections: u32,
    pub user_agent: String,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
            idle_grace_secs: 30,
            max_passes: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            client_buffer_chunks: 256,
            max_connections: 0,
            user_agent: "iptv-relay".into(),
        }
    }
}

impl StreamerConfig {
    pub fn failover_settings(&self) -> FailoverSettings {
        FailoverSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_passes: self.max_passes.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_grace: Duration::from_secs(self.idle_grace_secs),
            client_buffer_chunks: self.client_buffer_chunks.max(1),
        }
    }
}
