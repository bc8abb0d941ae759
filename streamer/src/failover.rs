use crate::connector::{ConnectError, SourceConnector, UpstreamHandle};
use crate::metrics_defs::{FAILOVER_PASSES, UPSTREAM_CONNECT_FAILURES, UPSTREAM_CONNECTS};
use crate::types::SourceSpec;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct FailoverSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_passes: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FailoverError {
    #[error("channel has no sources")]
    NoSources,
    #[error("all {candidates} sources failed after {passes} passes, last error: {last_error}")]
    SourcesExhausted {
        candidates: usize,
        passes: u32,
        last_error: String,
    },
    #[error("stream pump aborted: {0}")]
    Aborted(String),
}

pub struct Acquired {
    /// Index of the candidate that connected
    pub index: usize,
    pub handle: UpstreamHandle,
}

/// Progress of one acquisition. Lives only as long as the `acquire` call.
struct FailoverCursor {
    start: usize,
    pass: u32,
    last_error: Option<ConnectError>,
}

impl FailoverCursor {
    /// Candidate indexes of one pass, beginning at `start` and wrapping once.
    fn order(&self, len: usize) -> Vec<usize> {
        (0..len).map(|i| (self.start + i) % len).collect()
    }
}

pub struct FailoverPolicy {
    connector: Arc<dyn SourceConnector>,
    settings: FailoverSettings,
}

impl FailoverPolicy {
    pub fn new(connector: Arc<dyn SourceConnector>, settings: FailoverSettings) -> Self {
        FailoverPolicy {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.settings
    }

    /// Connects to the first candidate that accepts, trying candidates in
    /// order starting at `start`. A failed pass is followed by a backoff and
    /// another pass, up to `max_passes`.
    pub async fn acquire(
        &self,
        channel_id: &str,
        spec: &SourceSpec,
        start: usize,
    ) -> Result<Acquired, FailoverError> {
        if spec.is_empty() {
            return Err(FailoverError::NoSources);
        }

        let mut cursor = FailoverCursor {
            start: start % spec.len(),
            pass: 0,
            last_error: None,
        };

        loop {
            for index in cursor.order(spec.len()) {
                let candidate = &spec.candidates[index];
                let result = tokio::time::timeout(
                    self.settings.connect_timeout,
                    self.connector.connect(candidate),
                )
                .await
                .unwrap_or(Err(ConnectError::ConnectTimeout));

                match result {
                    Ok(source) => {
                        counter!(UPSTREAM_CONNECTS).increment(1);
                        tracing::info!(
                            channel = channel_id,
                            source = %candidate.url,
                            index,
                            "upstream connected"
                        );
                        return Ok(Acquired {
                            index,
                            handle: UpstreamHandle::new(source, self.settings.read_timeout),
                        });
                    }
                    Err(e) => {
                        counter!(UPSTREAM_CONNECT_FAILURES).increment(1);
                        tracing::warn!(
                            channel = channel_id,
                            source = %candidate.url,
                            index,
                            error = %e,
                            "upstream connect failed"
                        );
                        cursor.last_error = Some(e);
                    }
                }
            }

            cursor.pass += 1;
            counter!(FAILOVER_PASSES).increment(1);

            if cursor.pass >= self.settings.max_passes {
                return Err(FailoverError::SourcesExhausted {
                    candidates: spec.len(),
                    passes: cursor.pass,
                    last_error: cursor
                        .last_error
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                });
            }

            let delay = self.backoff_delay(cursor.pass);
            tracing::debug!(
                channel = channel_id,
                pass = cursor.pass,
                delay_ms = delay.as_millis() as u64,
                "all sources failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Doubling delay after the given number of failed attempts, capped.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failures.saturating_sub(1));
        self.settings
            .backoff_base
            .saturating_mul(factor)
            .min(self.settings.backoff_max)
    }
}
