//! One channel's upstream and the clients listening to it.
//!
//! A session runs at most one pump task at a time. The pump acquires an
//! upstream through the failover policy, reads chunks and offers each one to
//! every attachment's bounded queue without waiting. A full queue evicts that
//! client only. Read failures re-enter failover while clients stay attached;
//! exhaustion ends every attachment with [`EndReason::UpstreamLost`].
//!
//! When the last client leaves, an idle timer keeps the upstream open for the
//! grace period. If nobody attaches in between, the timer stops the pump and
//! asks the registry to drop the session.

use crate::admission::AdmissionPermit;
use crate::attachment::{ClientAttachment, EndReason, Subscriber, attachment_pair};
use crate::connector::Closer;
use crate::failover::{Acquired, FailoverError, FailoverPolicy};
use crate::metrics_defs::{
    ATTACHMENTS_ACTIVE, BYTES_RELAYED, SLOW_CLIENTS_DROPPED, SOURCES_EXHAUSTED,
    UPSTREAM_READ_FAILURES,
};
use crate::types::{AttachmentId, ChannelId, ChannelStatus, SourceSpec, UpstreamState};
use bytes::Bytes;
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    pub idle_grace: Duration,
    pub client_buffer_chunks: usize,
}

/// Receives sessions that finished their idle period.
pub(crate) trait IdleListener: Send + Sync {
    fn notify_empty(&self, session: &ChannelSession);
}

#[derive(thiserror::Error, Debug)]
pub enum SessionAttachError {
    /// The session was removed from the registry; the permit is handed back
    /// so the caller can retry on a fresh session.
    #[error("session retired")]
    Retired(AdmissionPermit),
    #[error("upstream unavailable: {0}")]
    Unavailable(FailoverError),
}

/// Outcome of bringing up the upstream, awaited by attaching clients.
#[derive(Clone, Debug, PartialEq)]
enum Readiness {
    Pending,
    /// The first chunk arrived.
    Ready,
    Failed(FailoverError),
}

struct PumpControl {
    id: u64,
    shutdown: Closer,
    ready: watch::Receiver<Readiness>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Empty,
    Connecting,
    Streaming,
    Reconnecting,
}

struct SessionState {
    spec: Arc<SourceSpec>,
    // applied on the next (re)connect
    pending_spec: Option<Arc<SourceSpec>>,
    phase: Phase,
    attachments: HashMap<AttachmentId, Subscriber>,
    pump: Option<PumpControl>,
    idle_timer: Option<JoinHandle<()>>,
    idle_epoch: u64,
    last_good: Option<usize>,
    active_source: Option<String>,
    content_type: Option<String>,
    connects: u64,
    last_activity: Instant,
    retired: bool,
}

impl SessionState {
    fn cancel_idle_timer(&mut self) {
        self.idle_epoch += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn owns_pump(&self, pump_id: u64) -> bool {
        self.pump.as_ref().is_some_and(|p| p.id == pump_id)
    }
}

struct SessionInner {
    channel_id: ChannelId,
    policy: Arc<FailoverPolicy>,
    settings: SessionSettings,
    listener: Weak<dyn IdleListener>,
    state: Mutex<SessionState>,
    next_attachment_id: AtomicU64,
    next_pump_id: AtomicU64,
    // Held by a pump for its whole life, so pumps never overlap.
    upstream_slot: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    pub(crate) fn new(
        channel_id: ChannelId,
        spec: Arc<SourceSpec>,
        policy: Arc<FailoverPolicy>,
        settings: SessionSettings,
        listener: Weak<dyn IdleListener>,
    ) -> Self {
        ChannelSession {
            inner: Arc::new(SessionInner {
                channel_id,
                policy,
                settings,
                listener,
                state: Mutex::new(SessionState {
                    spec,
                    pending_spec: None,
                    phase: Phase::Empty,
                    attachments: HashMap::new(),
                    pump: None,
                    idle_timer: None,
                    idle_epoch: 0,
                    last_good: None,
                    active_source: None,
                    content_type: None,
                    connects: 0,
                    last_activity: Instant::now(),
                    retired: false,
                }),
                next_attachment_id: AtomicU64::new(1),
                next_pump_id: AtomicU64::new(1),
                upstream_slot: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    pub(crate) fn same_as(&self, other: &ChannelSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Joins the channel. The first client brings the upstream up and waits
    /// for its first chunk; later clients join the running stream at once.
    pub async fn attach(
        &self,
        permit: AdmissionPermit,
    ) -> Result<ClientAttachment, SessionAttachError> {
        let id = AttachmentId(self.inner.next_attachment_id.fetch_add(1, Ordering::Relaxed));

        let (mut attachment, mut ready) = {
            let mut state = self.inner.state.lock();
            if state.retired {
                return Err(SessionAttachError::Retired(permit));
            }

            let (subscriber, attachment) = attachment_pair(
                id,
                self.clone(),
                permit,
                self.inner.settings.client_buffer_chunks,
            );

            state.cancel_idle_timer();
            state.attachments.insert(id, subscriber);
            state.last_activity = Instant::now();
            gauge!(ATTACHMENTS_ACTIVE).increment(1.0);

            let ready = match &state.pump {
                Some(pump) => pump.ready.clone(),
                None => self.start_pump(&mut state),
            };
            (attachment, ready)
        };

        tracing::debug!(channel = %self.inner.channel_id, attachment = %id, "client attaching");

        let readiness = ready
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map(|r| (*r).clone())
            .unwrap_or_else(|_| {
                Readiness::Failed(FailoverError::Aborted("pump stopped unexpectedly".into()))
            });

        match readiness {
            Readiness::Failed(e) => {
                attachment.detach();
                Err(SessionAttachError::Unavailable(e))
            }
            _ => {
                let content_type = self.inner.state.lock().content_type.clone();
                attachment.set_content_type(content_type);
                tracing::info!(
                    channel = %self.inner.channel_id,
                    attachment = %id,
                    "client attached"
                );
                Ok(attachment)
            }
        }
    }

    /// Removes an attachment. Idempotent. Leaving the session without
    /// clients starts the idle timer.
    pub fn detach(&self, id: AttachmentId) {
        let mut state = self.inner.state.lock();
        if state.attachments.remove(&id).is_none() {
            return;
        }

        gauge!(ATTACHMENTS_ACTIVE).decrement(1.0);
        state.last_activity = Instant::now();
        tracing::info!(channel = %self.inner.channel_id, attachment = %id, "client detached");

        if state.attachments.is_empty() {
            self.start_idle_timer(&mut state);
        }
    }

    /// Replaces the source list. The running upstream is kept; the new list
    /// is used from the next reconnect or attach on.
    pub fn update_spec(&self, spec: Arc<SourceSpec>) {
        let mut state = self.inner.state.lock();
        if *state.spec == *spec {
            state.pending_spec = None;
            return;
        }
        tracing::info!(channel = %self.inner.channel_id, "source list updated");
        state.pending_spec = Some(spec);
    }

    pub fn attachment_count(&self) -> usize {
        self.inner.state.lock().attachments.len()
    }

    pub fn status(&self) -> ChannelStatus {
        let state = self.inner.state.lock();
        let upstream_state = if state.idle_timer.is_some() && state.pump.is_some() {
            UpstreamState::Draining
        } else {
            match state.phase {
                Phase::Empty => UpstreamState::Empty,
                Phase::Connecting => UpstreamState::Connecting,
                Phase::Streaming => UpstreamState::Streaming,
                Phase::Reconnecting => UpstreamState::Reconnecting,
            }
        };

        ChannelStatus {
            channel_id: self.inner.channel_id.clone(),
            attachment_count: state.attachments.len(),
            upstream_state,
            active_source: state.active_source.clone(),
            connects: state.connects,
            idle_secs: state.last_activity.elapsed().as_secs(),
        }
    }

    /// Marks the session retired if it has neither clients nor an upstream.
    /// A retired session refuses new attachments.
    pub(crate) fn try_retire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.attachments.is_empty() && state.pump.is_none() {
            state.retired = true;
            true
        } else {
            false
        }
    }

    /// Stops the upstream and ends every attachment with
    /// [`EndReason::SessionClosed`].
    pub(crate) fn close(&self) {
        let mut state = self.inner.state.lock();
        state.retired = true;
        state.cancel_idle_timer();
        if let Some(pump) = state.pump.take() {
            pump.shutdown.close();
        }
        state.phase = Phase::Empty;
        state.active_source = None;
        self.end_all(&mut state, EndReason::SessionClosed);
    }

    fn start_pump(&self, state: &mut SessionState) -> watch::Receiver<Readiness> {
        let pump_id = self.inner.next_pump_id.fetch_add(1, Ordering::Relaxed);
        let shutdown = Closer::new();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);

        state.phase = Phase::Connecting;
        state.pump = Some(PumpControl {
            id: pump_id,
            shutdown: shutdown.clone(),
            ready: ready_rx.clone(),
        });

        let session = self.clone();
        let slot = self.inner.upstream_slot.clone();
        let pump = tokio::spawn(async move {
            let _slot = slot.lock_owned().await;
            session.run_pump(pump_id, shutdown, ready_tx).await;
        });

        // A panicking pump must not take anything else down with it.
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pump.await {
                if e.is_panic() {
                    tracing::error!(channel = %session.inner.channel_id, "stream pump panicked");
                    let error = FailoverError::Aborted("pump panicked".into());
                    session.exhausted(pump_id, None, error);
                }
            }
        });

        ready_rx
    }

    async fn run_pump(&self, pump_id: u64, shutdown: Closer, ready: watch::Sender<Readiness>) {
        let channel = self.inner.channel_id.as_str();
        // Connections that failed before delivering a single chunk.
        let mut barren = 0;

        loop {
            let Some((spec, start)) = self.prepare_acquire(pump_id) else {
                return;
            };

            let acquired = tokio::select! {
                _ = shutdown.closed() => return,
                res = self.inner.policy.acquire(channel, &spec, start) => res,
            };

            let Acquired { index, mut handle } = match acquired {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.exhausted(pump_id, Some(&ready), e);
                    return;
                }
            };

            let source = spec.candidates[index].url.to_string();
            if !self.connected(pump_id, index, &source, handle.content_type()) {
                handle.close();
                return;
            }

            let mut delivered = false;
            let error = loop {
                let res = tokio::select! {
                    biased;
                    _ = shutdown.closed() => {
                        handle.close();
                        tracing::debug!(channel, source, "upstream closed");
                        return;
                    }
                    res = handle.read_chunk() => res,
                };

                match res {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        if !delivered {
                            delivered = true;
                            barren = 0;
                            ready.send_if_modified(|r| {
                                let changed = *r == Readiness::Pending;
                                *r = Readiness::Ready;
                                changed
                            });
                        }
                        self.fan_out(chunk);
                    }
                    Err(e) => break e,
                }
            };

            handle.close();
            counter!(UPSTREAM_READ_FAILURES).increment(1);
            tracing::warn!(channel, source, error = %error, "upstream read failed, failing over");

            if !delivered {
                barren += 1;
                let max_passes = self.inner.policy.settings().max_passes;
                if barren >= max_passes {
                    self.exhausted(
                        pump_id,
                        Some(&ready),
                        FailoverError::SourcesExhausted {
                            candidates: spec.len(),
                            passes: barren,
                            last_error: error.to_string(),
                        },
                    );
                    return;
                }

                let delay = self.inner.policy.backoff_delay(barren);
                tokio::select! {
                    _ = shutdown.closed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Picks the source list and start index for the next acquisition.
    /// `None` if this pump was replaced or stopped meanwhile.
    fn prepare_acquire(&self, pump_id: u64) -> Option<(Arc<SourceSpec>, usize)> {
        let mut state = self.inner.state.lock();
        if !state.owns_pump(pump_id) {
            return None;
        }

        if let Some(spec) = state.pending_spec.take() {
            state.spec = spec;
            // indexes of the old list mean nothing for the new one
            state.last_good = None;
        }

        if state.phase == Phase::Streaming {
            state.phase = Phase::Reconnecting;
        }

        Some((state.spec.clone(), state.last_good.unwrap_or(0)))
    }

    fn connected(
        &self,
        pump_id: u64,
        index: usize,
        source: &str,
        content_type: Option<&str>,
    ) -> bool {
        let mut state = self.inner.state.lock();
        if !state.owns_pump(pump_id) {
            return false;
        }

        state.phase = Phase::Streaming;
        state.last_good = Some(index);
        state.active_source = Some(source.to_string());
        state.connects += 1;
        if content_type.is_some() {
            state.content_type = content_type.map(String::from);
        }
        true
    }

    fn fan_out(&self, chunk: Bytes) {
        let mut state = self.inner.state.lock();
        state.last_activity = Instant::now();

        let mut evicted = Vec::new();
        for (id, subscriber) in state.attachments.iter() {
            match subscriber.try_send(chunk.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => evicted.push((*id, true)),
                // client side already gone, its detach is on the way
                Err(TrySendError::Closed(_)) => evicted.push((*id, false)),
            }
        }

        counter!(BYTES_RELAYED).increment(chunk.len() as u64);

        if evicted.is_empty() {
            return;
        }

        for (id, slow) in evicted {
            if let Some(subscriber) = state.attachments.remove(&id) {
                gauge!(ATTACHMENTS_ACTIVE).decrement(1.0);
                if slow {
                    counter!(SLOW_CLIENTS_DROPPED).increment(1);
                    tracing::warn!(
                        channel = %self.inner.channel_id,
                        attachment = %id,
                        buffer = self.inner.settings.client_buffer_chunks,
                        "client too slow, dropping"
                    );
                    subscriber.end(EndReason::SlowClientDropped);
                }
            }
        }

        if state.attachments.is_empty() {
            self.start_idle_timer(&mut state);
        }
    }

    /// The upstream is gone for good: every client is told so and the
    /// session becomes empty.
    fn exhausted(
        &self,
        pump_id: u64,
        ready: Option<&watch::Sender<Readiness>>,
        error: FailoverError,
    ) {
        let mut state = self.inner.state.lock();
        if !state.owns_pump(pump_id) {
            return;
        }

        state.pump = None;
        state.phase = Phase::Empty;
        state.active_source = None;

        counter!(SOURCES_EXHAUSTED).increment(1);
        tracing::error!(
            channel = %self.inner.channel_id,
            clients = state.attachments.len(),
            error = %error,
            "upstream unavailable, disconnecting clients"
        );

        self.end_all(&mut state, EndReason::UpstreamLost);
        if let Some(ready) = ready {
            ready.send_replace(Readiness::Failed(error));
        }
        self.start_idle_timer(&mut state);
    }

    fn end_all(&self, state: &mut SessionState, reason: EndReason) {
        for (_, subscriber) in state.attachments.drain() {
            gauge!(ATTACHMENTS_ACTIVE).decrement(1.0);
            subscriber.end(reason);
        }
    }

    fn start_idle_timer(&self, state: &mut SessionState) {
        if state.retired {
            return;
        }
        state.cancel_idle_timer();
        let epoch = state.idle_epoch;

        // Without an upstream there is nothing to keep warm.
        let grace = if state.pump.is_some() {
            self.inner.settings.idle_grace
        } else {
            Duration::ZERO
        };

        tracing::debug!(
            channel = %self.inner.channel_id,
            grace_secs = grace.as_secs(),
            "no clients left, idle timer started"
        );

        let session = self.clone();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            session.idle_expired(epoch).await;
        }));
    }

    async fn idle_expired(&self, epoch: u64) {
        let pump = {
            let mut state = self.inner.state.lock();
            if state.idle_epoch != epoch || !state.attachments.is_empty() {
                return;
            }
            state.idle_timer = None;
            state.phase = Phase::Empty;
            state.active_source = None;
            state.pump.take()
        };

        if let Some(pump) = pump {
            tracing::info!(
                channel = %self.inner.channel_id,
                "idle grace period over, closing upstream"
            );
            pump.shutdown.close();
            // Wait until the pump let go of the upstream.
            let _slot = self.inner.upstream_slot.lock().await;
        }

        if let Some(listener) = self.inner.listener.upgrade() {
            listener.notify_empty(self);
        }
    }
}
