use crate::admission::{AdmissionController, AdmissionError};
use crate::attachment::ClientAttachment;
use crate::config::StreamerConfig;
use crate::connector::SourceConnector;
use crate::failover::{FailoverError, FailoverPolicy, FailoverSettings};
use crate::metrics_defs::SESSIONS_ACTIVE;
use crate::session::{ChannelSession, IdleListener, SessionAttachError, SessionSettings};
use crate::types::{ChannelId, ChannelStatus, SourceSpec};
use parking_lot::Mutex;
use shared::gauge;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    #[error("admission denied: {0}")]
    AdmissionDenied(#[from] AdmissionError),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(FailoverError),
}

struct RegistryInner {
    sessions: Mutex<HashMap<ChannelId, ChannelSession>>,
    policy: Arc<FailoverPolicy>,
    settings: SessionSettings,
    admission: AdmissionController,
}

impl IdleListener for RegistryInner {
    fn notify_empty(&self, session: &ChannelSession) {
        let mut sessions = self.sessions.lock();
        let Some(current) = sessions.get(session.channel_id()) else {
            return;
        };

        // A client may have attached after the idle timer fired.
        if !current.same_as(session) || !session.try_retire() {
            return;
        }

        sessions.remove(session.channel_id());
        gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
        tracing::info!(channel = session.channel_id(), "session removed");
    }
}

/// Process-wide map from channel to its live session.
///
/// There is at most one session per channel. Sessions are created on the
/// first attach and removed once idle, so a busy channel shares a single
/// upstream between all of its clients.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn SourceConnector>, config: &StreamerConfig) -> Self {
        Self::with_settings(
            connector,
            config.failover_settings(),
            config.session_settings(),
            AdmissionController::new(config.max_connections, HashMap::new()),
        )
    }

    pub fn with_settings(
        connector: Arc<dyn SourceConnector>,
        failover: FailoverSettings,
        settings: SessionSettings,
        admission: AdmissionController,
    ) -> Self {
        SessionRegistry {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                policy: Arc::new(FailoverPolicy::new(connector, failover)),
                settings,
                admission,
            }),
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Returns the channel's session, creating it if needed. An existing
    /// session picks up a changed source list on its next reconnect.
    pub fn get_or_create(&self, channel_id: &str, spec: Arc<SourceSpec>) -> ChannelSession {
        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get(channel_id) {
            session.update_spec(spec);
            return session.clone();
        }

        let listener: Weak<dyn IdleListener> = Arc::downgrade(&self.inner) as Weak<RegistryInner>;
        let session = ChannelSession::new(
            channel_id.to_string(),
            spec,
            self.inner.policy.clone(),
            self.inner.settings.clone(),
            listener,
        );
        sessions.insert(channel_id.to_string(), session.clone());
        gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
        tracing::debug!(channel = channel_id, "session created");

        session
    }

    /// Admits a client and attaches it to the channel's session.
    pub async fn attach(
        &self,
        channel_id: &str,
        spec: Arc<SourceSpec>,
    ) -> Result<ClientAttachment, AttachError> {
        let mut permit = self.inner.admission.try_admit(channel_id)?;

        loop {
            let session = self.get_or_create(channel_id, spec.clone());
            match session.attach(permit).await {
                Ok(attachment) => return Ok(attachment),
                // Lost the race against idle removal; the next lookup
                // creates a fresh session.
                Err(SessionAttachError::Retired(returned)) => permit = returned,
                Err(SessionAttachError::Unavailable(e)) => {
                    return Err(AttachError::UpstreamUnavailable(e));
                }
            }
        }
    }

    /// Hands a new source list to a running session, if there is one.
    pub fn update_spec(&self, channel_id: &str, spec: Arc<SourceSpec>) {
        if let Some(session) = self.inner.sessions.lock().get(channel_id) {
            session.update_spec(spec);
        }
    }

    /// Closes a channel's session, ending its clients with
    /// [`crate::EndReason::SessionClosed`].
    pub fn close_channel(&self, channel_id: &str) -> bool {
        let session = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions.remove(channel_id);
            gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
            session
        };

        match session {
            Some(session) => {
                tracing::info!(channel = channel_id, "closing session");
                session.close();
                true
            }
            None => false,
        }
    }

    /// Status of every channel with a session, ordered by channel id.
    pub fn active_channels(&self) -> Vec<ChannelStatus> {
        let sessions: Vec<_> = self.inner.sessions.lock().values().cloned().collect();
        let mut status: Vec<_> = sessions.iter().map(ChannelSession::status).collect();
        status.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        status
    }

    /// Closes every session.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut sessions = self.inner.sessions.lock();
            gauge!(SESSIONS_ACTIVE).set(0.0);
            sessions.drain().map(|(_, s)| s).collect()
        };

        tracing::info!(sessions = sessions.len(), "shutting down sessions");
        for session in sessions {
            session.close();
        }
    }
}
