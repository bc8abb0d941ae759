use crate::admission::AdmissionPermit;
use crate::session::ChannelSession;
use crate::types::{AttachmentId, ChannelId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Why an attachment stopped receiving bytes.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    #[error("upstream lost, all sources exhausted")]
    UpstreamLost,
    #[error("client could not keep up and was dropped")]
    SlowClientDropped,
    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AttachmentEvent {
    Chunk(Bytes),
    /// Terminal, delivered once. Nothing follows it.
    Ended(EndReason),
}

/// State shared between the session side and the client side of one
/// attachment.
#[derive(Default)]
pub(crate) struct AttachmentShared {
    end: Mutex<Option<EndReason>>,
}

impl AttachmentShared {
    fn end_reason(&self) -> Option<EndReason> {
        *self.end.lock()
    }
}

/// Session side of an attachment: the producing half of the client's
/// bounded queue plus the admission slot the client occupies.
pub(crate) struct Subscriber {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<AttachmentShared>,
    _permit: AdmissionPermit,
}

impl Subscriber {
    pub(crate) fn try_send(&self, chunk: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        self.tx.try_send(chunk)
    }

    /// Ends the attachment. Dropping `self` closes the queue, which wakes the
    /// client after it drained what is still buffered.
    pub(crate) fn end(self, reason: EndReason) {
        *self.shared.end.lock() = Some(reason);
    }
}

/// Creates both halves of an attachment around a queue of `capacity` chunks.
pub(crate) fn attachment_pair(
    id: AttachmentId,
    session: ChannelSession,
    permit: AdmissionPermit,
    capacity: usize,
) -> (Subscriber, ClientAttachment) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(AttachmentShared::default());

    let subscriber = Subscriber {
        tx,
        shared: shared.clone(),
        _permit: permit,
    };
    let attachment = ClientAttachment {
        id,
        channel_id: session.channel_id().to_string(),
        rx,
        shared,
        session,
        content_type: None,
        finished: false,
        detached: false,
    };

    (subscriber, attachment)
}

/// A client's subscription to a channel, handed to the HTTP layer.
///
/// Chunks arrive in upstream order starting at the live position of the
/// moment of attaching. Dropping the attachment detaches it.
pub struct ClientAttachment {
    id: AttachmentId,
    channel_id: ChannelId,
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<AttachmentShared>,
    session: ChannelSession,
    content_type: Option<String>,
    finished: bool,
    detached: bool,
}

impl ClientAttachment {
    pub fn id(&self) -> AttachmentId {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Content type reported by the upstream, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub(crate) fn set_content_type(&mut self, content_type: Option<String>) {
        self.content_type = content_type;
    }

    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<AttachmentEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }

        // A dropped client is cut off right away, its backlog is discarded.
        if self.shared.end_reason() == Some(EndReason::SlowClientDropped) {
            self.finished = true;
            return Poll::Ready(Some(AttachmentEvent::Ended(EndReason::SlowClientDropped)));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(AttachmentEvent::Chunk(chunk))),
            Poll::Ready(None) => {
                self.finished = true;
                let reason = self
                    .shared
                    .end_reason()
                    .unwrap_or(EndReason::SessionClosed);
                Poll::Ready(Some(AttachmentEvent::Ended(reason)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Next chunk or the terminal event; `None` after the terminal event or
    /// once detached.
    pub async fn next_event(&mut self) -> Option<AttachmentEvent> {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Leaves the channel. Idempotent.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.finished = true;
        self.session.detach(self.id);
    }
}

impl Drop for ClientAttachment {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ClientAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAttachment")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::failover::FailoverPolicy;
    use crate::session::{IdleListener, SessionSettings};
    use crate::testutils::{MockConnector, candidate_spec, test_failover_settings};
    use std::sync::Weak;
    use std::time::Duration;

    struct NoListener;

    impl IdleListener for NoListener {
        fn notify_empty(&self, _session: &ChannelSession) {}
    }

    fn pair(capacity: usize) -> (Subscriber, ClientAttachment) {
        let listener: Weak<dyn IdleListener> = Weak::<NoListener>::new();
        let session = ChannelSession::new(
            "news".into(),
            Arc::new(candidate_spec(&["http://a/news.ts"])),
            Arc::new(FailoverPolicy::new(MockConnector::new(), test_failover_settings())),
            SessionSettings {
                idle_grace: Duration::from_millis(100),
                client_buffer_chunks: capacity,
            },
            listener,
        );
        let permit = AdmissionController::default().try_admit("news").unwrap();
        attachment_pair(AttachmentId(1), session, permit, capacity)
    }

    #[tokio::test]
    async fn test_backlog_drained_before_end() {
        let (subscriber, mut attachment) = pair(4);
        subscriber.try_send(Bytes::from_static(b"a")).unwrap();
        subscriber.try_send(Bytes::from_static(b"b")).unwrap();
        subscriber.end(EndReason::UpstreamLost);

        assert_eq!(
            attachment.next_event().await,
            Some(AttachmentEvent::Chunk(Bytes::from_static(b"a")))
        );
        assert_eq!(
            attachment.next_event().await,
            Some(AttachmentEvent::Chunk(Bytes::from_static(b"b")))
        );
        assert_eq!(
            attachment.next_event().await,
            Some(AttachmentEvent::Ended(EndReason::UpstreamLost))
        );
        assert_eq!(attachment.next_event().await, None);
    }

    #[tokio::test]
    async fn test_slow_client_backlog_discarded() {
        let (subscriber, mut attachment) = pair(1);
        subscriber.try_send(Bytes::from_static(b"a")).unwrap();
        assert!(subscriber.try_send(Bytes::from_static(b"b")).is_err());
        subscriber.end(EndReason::SlowClientDropped);

        assert_eq!(
            attachment.next_event().await,
            Some(AttachmentEvent::Ended(EndReason::SlowClientDropped))
        );
        assert_eq!(attachment.next_event().await, None);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_reads_as_closed() {
        let (subscriber, mut attachment) = pair(2);
        drop(subscriber);

        assert_eq!(
            attachment.next_event().await,
            Some(AttachmentEvent::Ended(EndReason::SessionClosed))
        );
    }

    #[tokio::test]
    async fn test_detach_stops_events() {
        let (subscriber, mut attachment) = pair(2);
        subscriber.try_send(Bytes::from_static(b"a")).unwrap();

        attachment.detach();
        attachment.detach();
        assert_eq!(attachment.next_event().await, None);
    }
}
