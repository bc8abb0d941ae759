use crate::attachment::{AttachmentEvent, ClientAttachment};
use crate::connector::{ChunkSource, ConnectError, ReadError, SourceConnector};
use crate::failover::FailoverSettings;
use crate::types::{SourceCandidate, SourceSpec};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use shared::http::{make_error_response, serve_listener};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

pub fn test_failover_settings() -> FailoverSettings {
    FailoverSettings {
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(2),
        max_passes: 3,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
    }
}

pub fn candidate_spec(urls: &[&str]) -> SourceSpec {
    SourceSpec::new(
        urls.iter()
            .map(|url| SourceCandidate::new(Url::parse(url).unwrap()))
            .collect(),
    )
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Next event of the attachment, which must be a chunk.
pub async fn next_chunk(attachment: &mut ClientAttachment) -> Vec<u8> {
    let event = tokio::time::timeout(Duration::from_secs(5), attachment.next_event())
        .await
        .expect("no event in time");
    match event {
        Some(AttachmentEvent::Chunk(bytes)) => bytes.to_vec(),
        other => panic!("expected a chunk, got {other:?}"),
    }
}

#[derive(Default)]
struct MockState {
    refused: HashSet<String>,
    connects: HashMap<String, usize>,
    streams: HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
    open: usize,
    peak_open: usize,
    connect_delay: Duration,
}

/// In-memory upstreams. Every accepted connect gets its own stream that the
/// test feeds with [`MockConnector::push`].
#[derive(Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, url: &str) {
        self.state.lock().refused.insert(url.to_string());
    }

    pub fn accept(&self, url: &str) {
        self.state.lock().refused.remove(url);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Connect attempts for `url`, refused ones included.
    pub fn connects(&self, url: &str) -> usize {
        self.state.lock().connects.get(url).copied().unwrap_or(0)
    }

    /// Streams of `url` that are still being read.
    pub fn live(&self, url: &str) -> usize {
        let mut state = self.state.lock();
        let Some(streams) = state.streams.get_mut(url) else {
            return 0;
        };
        streams.retain(|tx| !tx.is_closed());
        streams.len()
    }

    /// Sends `bytes` on every live stream of `url`.
    pub fn push(&self, url: &str, bytes: &[u8]) -> usize {
        let mut state = self.state.lock();
        let Some(streams) = state.streams.get_mut(url) else {
            return 0;
        };
        let chunk = Bytes::copy_from_slice(bytes);
        streams.retain(|tx| tx.send(chunk.clone()).is_ok());
        streams.len()
    }

    /// Ends every stream of `url` once its readers drained what was pushed.
    pub fn break_streams(&self, url: &str) {
        self.state.lock().streams.remove(url);
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    pub fn peak_open(&self) -> usize {
        self.state.lock().peak_open
    }
}

#[async_trait]
impl SourceConnector for MockConnector {
    async fn connect(
        &self,
        candidate: &SourceCandidate,
    ) -> Result<Box<dyn ChunkSource>, ConnectError> {
        let url = candidate.url.to_string();
        let delay = {
            let mut state = self.state.lock();
            *state.connects.entry(url.clone()).or_default() += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.refused.contains(&url) {
            return Err(ConnectError::RefusedOrDnsFailure(url));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.entry(url).or_default().push(tx);
        state.open += 1;
        state.peak_open = state.peak_open.max(state.open);

        Ok(Box::new(MockSource {
            rx,
            state: self.state.clone(),
        }))
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ChunkSource for MockSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ReadError> {
        Ok(self.rx.recv().await)
    }

    fn content_type(&self) -> Option<&str> {
        Some("video/mp2t")
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        self.state.lock().open -= 1;
    }
}

/// Hands out a source that panics on its first read for one URL and defers
/// to the mock for everything else.
pub struct PanickingConnector {
    mock: Arc<MockConnector>,
    panic_url: &'static str,
}

impl PanickingConnector {
    pub fn new(mock: Arc<MockConnector>, panic_url: &'static str) -> Arc<Self> {
        Arc::new(PanickingConnector { mock, panic_url })
    }
}

struct PanickingSource;

#[async_trait]
impl ChunkSource for PanickingSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ReadError> {
        panic!("corrupt upstream");
    }
}

#[async_trait]
impl SourceConnector for PanickingConnector {
    async fn connect(
        &self,
        candidate: &SourceCandidate,
    ) -> Result<Box<dyn ChunkSource>, ConnectError> {
        if candidate.url.as_str() == self.panic_url {
            return Ok(Box::new(PanickingSource));
        }
        self.mock.connect(candidate).await
    }
}

pub enum TestRoute {
    /// `video/mp2t` body made of these chunks
    Chunks(Vec<Vec<u8>>),
    Status(u16),
    /// Playlist text
    Text(String),
}

/// Plain HTTP upstream on a random local port.
pub struct TestUpstreamServer {
    base: Url,
    routes: Arc<Mutex<HashMap<String, TestRoute>>>,
    requests: Arc<Mutex<Vec<(String, HeaderMap)>>>,
}

struct TestService {
    routes: Arc<Mutex<HashMap<String, TestRoute>>>,
    requests: Arc<Mutex<Vec<(String, HeaderMap)>>>,
}

impl TestService {
    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, std::io::Error>> {
        let full = |bytes: Vec<u8>| Full::new(Bytes::from(bytes)).map_err(|e| match e {}).boxed();

        match self.routes.lock().get(path) {
            Some(TestRoute::Chunks(chunks)) => {
                let mut response = Response::new(full(chunks.concat()));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, "video/mp2t".parse().unwrap());
                response
            }
            Some(TestRoute::Text(text)) => {
                let mut response = Response::new(full(text.clone().into_bytes()));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    "application/vnd.apple.mpegurl".parse().unwrap(),
                );
                response
            }
            Some(TestRoute::Status(code)) => {
                make_error_response(StatusCode::from_u16(*code).unwrap())
            }
            None => make_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl Service<Request<Incoming>> for TestService {
    type Response = Response<BoxBody<Bytes, std::io::Error>>;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let path = req.uri().path().to_string();
        self.requests
            .lock()
            .push((path.clone(), req.headers().clone()));
        let res = self.respond(&path);
        Box::pin(async move { Ok(res) })
    }
}

impl TestUpstreamServer {
    pub async fn spawn(routes: Vec<(&str, TestRoute)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(Mutex::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_string(), route))
                .collect(),
        ));

        let service = TestService {
            routes: routes.clone(),
            requests: requests.clone(),
        };
        tokio::spawn(serve_listener(listener, service));

        TestUpstreamServer {
            base: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            routes,
            requests,
        }
    }

    /// Replaces what `path` serves from the next request on.
    pub fn set_route(&self, path: &str, route: TestRoute) {
        self.routes.lock().insert(path.to_string(), route);
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|(p, _)| p == path).count()
    }

    pub fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }

    pub fn was_requested(&self, path: &str) -> bool {
        self.requests.lock().iter().any(|(p, _)| p == path)
    }

    pub fn saw_header(&self, path: &str, header: &str) -> bool {
        self.requests
            .lock()
            .iter()
            .any(|(p, headers)| p == path && headers.contains_key(header))
    }
}
