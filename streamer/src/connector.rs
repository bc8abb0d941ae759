//! Upstream connections.
//!
//! A [`SourceConnector`] turns one [`SourceCandidate`] into a [`ChunkSource`],
//! which the session wraps in an [`UpstreamHandle`]. The handle bounds every
//! read with a timeout and races it against its [`Closer`], so closing from
//! another task makes an outstanding read fail immediately instead of hanging.

use crate::hls::HlsSource;
use crate::types::{Protocol, SourceCandidate};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode, Version};
use shared::http::{add_via_header, filter_hop_by_hop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection refused or name resolution failed: {0}")]
    RefusedOrDnsFailure(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("source rejected credentials with status {0}")]
    AuthRejected(u16),
}

impl From<reqwest::Error> for ConnectError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConnectError::ConnectTimeout
        } else if e.is_connect() {
            ConnectError::RefusedOrDnsFailure(e.to_string())
        } else {
            ConnectError::Protocol(e.to_string())
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("upstream disconnected")]
    Disconnected,
    #[error("upstream read timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("upstream closed locally")]
    Closed,
}

impl From<reqwest::Error> for ReadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ReadError::Timeout
        } else if e.is_decode() {
            ReadError::Protocol(e.to_string())
        } else {
            tracing::debug!(error = %e, "upstream body error");
            ReadError::Disconnected
        }
    }
}

/// A connected upstream producing the channel's bytes in order.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk of the stream, `None` once the source ended.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ReadError>;

    fn content_type(&self) -> Option<&str> {
        None
    }

    /// Extra time a single read may legitimately take on top of the read
    /// timeout, e.g. while a playlist based source waits for a new segment.
    fn read_allowance(&self) -> Duration {
        Duration::ZERO
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, candidate: &SourceCandidate)
    -> Result<Box<dyn ChunkSource>, ConnectError>;
}

/// Idempotent close signal shared between an upstream reader and whoever
/// wants to stop it.
#[derive(Clone, Debug)]
pub struct Closer(Arc<watch::Sender<bool>>);

impl Closer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Closer(Arc::new(tx))
    }

    pub fn close(&self) {
        self.0.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once [`Closer::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UpstreamHandle {
    source: Box<dyn ChunkSource>,
    closer: Closer,
    read_timeout: Duration,
}

impl UpstreamHandle {
    pub fn new(source: Box<dyn ChunkSource>, read_timeout: Duration) -> Self {
        let read_timeout = read_timeout.saturating_add(source.read_allowance());
        UpstreamHandle {
            source,
            closer: Closer::new(),
            read_timeout,
        }
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.source.content_type()
    }

    /// Reads the next chunk. A live stream never ends on its own, so an
    /// orderly end of the source is reported as [`ReadError::Disconnected`].
    pub async fn read_chunk(&mut self) -> Result<Bytes, ReadError> {
        if self.closer.is_closed() {
            return Err(ReadError::Closed);
        }

        let closer = self.closer.clone();
        tokio::select! {
            biased;
            _ = closer.closed() => Err(ReadError::Closed),
            res = tokio::time::timeout(self.read_timeout, self.source.next_chunk()) => match res {
                Err(_) => Err(ReadError::Timeout),
                Ok(Ok(Some(bytes))) => Ok(bytes),
                Ok(Ok(None)) => Err(ReadError::Disconnected),
                Ok(Err(e)) => Err(e),
            },
        }
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

/// Connector for `http(s)` sources, plain byte streams and HLS playlists.
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration, user_agent: &str) -> Result<Self, ConnectError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(HttpConnector { client })
    }
}

#[async_trait]
impl SourceConnector for HttpConnector {
    async fn connect(
        &self,
        candidate: &SourceCandidate,
    ) -> Result<Box<dyn ChunkSource>, ConnectError> {
        match candidate.protocol {
            Protocol::Ts => {
                let response = open(&self.client, &candidate.url, &candidate.headers).await?;
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);

                Ok(Box::new(HttpChunkSource {
                    response,
                    content_type,
                }))
            }
            Protocol::Hls => {
                let source = HlsSource::open(
                    self.client.clone(),
                    candidate.url.clone(),
                    candidate.headers.clone(),
                )
                .await?;
                Ok(Box::new(source))
            }
        }
    }
}

/// Issues a GET for `url` with the source's configured headers and checks
/// the response status.
pub(crate) async fn open(
    client: &reqwest::Client,
    url: &Url,
    headers: &HeaderMap,
) -> Result<reqwest::Response, ConnectError> {
    let mut headers = headers.clone();
    filter_hop_by_hop(&mut headers, Version::HTTP_11);
    add_via_header(&mut headers, Version::HTTP_11);

    let response = client.get(url.clone()).headers(headers).send().await?;

    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ConnectError::AuthRejected(response.status().as_u16()))
        }
        status => Err(ConnectError::Protocol(format!("unexpected status {status}"))),
    }
}

struct HttpChunkSource {
    response: reqwest::Response,
    content_type: Option<String>,
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ReadError> {
        Ok(self.response.chunk().await?)
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}
