use crate::Relay;
use crate::errors::{ProxyError, StreamRequestError};
use crate::metrics_defs::{REQUESTS, STREAM_DURATION};
use crate::playlist;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::service::Service as HyperService;
use hyper::{Request, Response, StatusCode};
use shared::http::{add_via_header, make_error_response};
use shared::{counter, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Instant;
use streamer::{AttachError, AttachmentEvent, ClientAttachment, EndReason};

/// Set by a downstream relay to pass on the name of its own user.
const RELAY_USER_HEADER: &str = "x-relay-user";
const DEFAULT_CONTENT_TYPE: &str = "video/mp2t";

type ProxyResponse = Response<BoxBody<Bytes, ProxyError>>;

#[derive(Debug, PartialEq)]
enum Route<'a> {
    Playlist { user: Option<&'a str> },
    Stream { channel_id: &'a str },
}

impl Route<'_> {
    fn parse(path: &str) -> Option<Route<'_>> {
        if let Some(rest) = path.strip_prefix("/playlist.m3u") {
            return match rest {
                "" | "/" => Some(Route::Playlist { user: None }),
                _ => {
                    let user = rest.strip_prefix('/')?;
                    (!user.contains('/')).then_some(Route::Playlist { user: Some(user) })
                }
            };
        }

        let rest = path.strip_prefix("/channel/")?;
        match rest.split_once('/') {
            Some((channel_id, "stream")) if !channel_id.is_empty() => {
                Some(Route::Stream { channel_id })
            }
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Route::Playlist { .. } => "playlist",
            Route::Stream { .. } => "stream",
        }
    }
}

pub struct ProxyService {
    relay: Arc<Relay>,
}

impl ProxyService {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = ProxyResponse;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let relay = self.relay.clone();
        Box::pin(async move { Ok(handle(&relay, req).await) })
    }
}

async fn handle(relay: &Relay, req: Request<Incoming>) -> ProxyResponse {
    let path = req.uri().path().to_string();

    let (route_name, response) = match Route::parse(&path) {
        None => ("unknown", make_error_response(StatusCode::NOT_FOUND)),
        Some(_) if req.method() != Method::GET => {
            ("unknown", make_error_response(StatusCode::METHOD_NOT_ALLOWED))
        }
        Some(route) => {
            let name = route.name();
            let response = match route {
                Route::Playlist { user } => handle_playlist(relay, user, req.headers()),
                Route::Stream { channel_id } => handle_stream(relay, channel_id, &req).await,
            };
            (name, response)
        }
    };

    counter!(REQUESTS, "route" => route_name, "status" => response.status().as_u16().to_string())
        .increment(1);
    response
}

fn handle_playlist(relay: &Relay, user: Option<&str>, headers: &HeaderMap) -> ProxyResponse {
    let catalog = relay.catalog.snapshot();

    let user = match user.filter(|u| catalog.is_known_user(u)) {
        Some(user) => user.to_string(),
        None if catalog.allow_anonymous() => {
            format!("anon{}", relay.next_anonymous.fetch_add(1, Ordering::Relaxed))
        }
        None => {
            tracing::debug!(user, "playlist denied for unknown user");
            return make_error_response(StatusCode::NOT_FOUND);
        }
    };

    let Some(base_url) = playlist::base_url(&catalog, headers) else {
        return make_error_response(StatusCode::BAD_REQUEST);
    };

    let token = catalog.signer().issue(&user);
    let body = playlist::render(&catalog, &base_url, &token);
    tracing::info!(user = %user, "playlist served");

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("audio/mpegurl"));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=playlist.m3u"),
    );
    response
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<std::borrow::Cow<'a, str>> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

async fn handle_stream(relay: &Relay, channel_id: &str, req: &Request<Incoming>) -> ProxyResponse {
    let catalog = relay.catalog.snapshot();

    let Some(channel) = catalog.channel(channel_id) else {
        return make_error_response(StatusCode::NOT_FOUND);
    };

    let token = req.uri().query().and_then(|q| query_param(q, "t"));
    let user = match token.as_deref().map(|t| catalog.signer().verify(t)) {
        Some(Ok(user)) => user.to_string(),
        Some(Err(e)) => {
            tracing::debug!(channel = channel_id, error = %e, "stream request with bad token");
            return make_error_response(StatusCode::NOT_FOUND);
        }
        None => return make_error_response(StatusCode::NOT_FOUND),
    };

    let user = match req
        .headers()
        .get(RELAY_USER_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(relayed) => format!("{user}:{relayed}"),
        None => user,
    };

    let attachment = match relay.attach(channel_id, channel.spec.clone()).await {
        Ok(attachment) => attachment,
        Err(StreamRequestError::ChannelRemoved(_)) => {
            tracing::debug!(channel = channel_id, user = %user, "channel removed by reload");
            return make_error_response(StatusCode::NOT_FOUND);
        }
        Err(StreamRequestError::Attach(AttachError::AdmissionDenied(e))) => {
            tracing::info!(
                channel = channel_id,
                user = %user,
                reason = %e,
                "stream request rejected"
            );
            return make_error_response(StatusCode::SERVICE_UNAVAILABLE);
        }
        Err(StreamRequestError::Attach(AttachError::UpstreamUnavailable(e))) => {
            tracing::warn!(
                channel = channel_id,
                user = %user,
                error = %e,
                "no upstream for stream request"
            );
            return make_error_response(StatusCode::BAD_GATEWAY);
        }
    };

    tracing::info!(
        channel = channel_id,
        user = %user,
        attachment = %attachment.id(),
        "stream started"
    );

    let content_type = attachment
        .content_type()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    let body = AttachmentBody {
        attachment,
        user,
        started: Instant::now(),
        end: None,
    };
    let mut response = Response::new(body.boxed());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    add_via_header(headers, req.version());
    response
}

/// Response body fed by a channel attachment. Dropping it, which hyper does
/// when the client goes away, detaches the client.
struct AttachmentBody {
    attachment: ClientAttachment,
    user: String,
    started: Instant,
    end: Option<EndReason>,
}

impl Body for AttachmentBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.attachment.poll_event(cx) {
            Poll::Ready(Some(AttachmentEvent::Chunk(bytes))) => {
                Poll::Ready(Some(Ok(Frame::data(bytes))))
            }
            Poll::Ready(Some(AttachmentEvent::Ended(reason))) => {
                this.end = Some(reason);
                match reason {
                    EndReason::SessionClosed => Poll::Ready(None),
                    // Failing the body aborts the response, so the client
                    // sees a broken stream rather than a regular end.
                    _ => Poll::Ready(Some(Err(ProxyError::StreamEnded(reason)))),
                }
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AttachmentBody {
    fn drop(&mut self) {
        let reason = match self.end {
            None => "client_gone",
            Some(EndReason::UpstreamLost) => "upstream_lost",
            Some(EndReason::SlowClientDropped) => "slow_client",
            Some(EndReason::SessionClosed) => "session_closed",
        };
        let elapsed = self.started.elapsed();

        histogram!(STREAM_DURATION, "reason" => reason).record(elapsed.as_secs_f64());
        tracing::info!(
            channel = self.attachment.channel_id(),
            user = %self.user,
            attachment = %self.attachment.id(),
            reason,
            secs = elapsed.as_secs(),
            "stream finished"
        );
    }
}
