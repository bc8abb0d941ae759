use crate::Relay;
use crate::config::Config;
use crate::proxy_service::ProxyService;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Frame, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::{make_error_response, serve_listener};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

pub fn test_config() -> Config {
    serde_yaml::from_str(
        r#"
listener: {host: "127.0.0.1", port: 8080}
admin_listener: {host: "127.0.0.1", port: 8081}
access: {token_salt: "pepper", users: [alice]}
channels:
    - id: sports
      name: Sports
      sources: [{url: "http://a.example.com/sports.ts"}]
    - id: news
      name: News
      max_connections: 2
      sources: [{url: "http://a.example.com/news.ts"}]
"#,
    )
    .unwrap()
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

/// Never ending `video/mp2t` body sending `tick` every few milliseconds.
struct TickBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for TickBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

struct LiveUpstream;

impl Service<Request<Incoming>> for LiveUpstream {
    type Response = Response<BoxBody<Bytes, std::io::Error>>;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        if req.uri().path() != "/live.ts" {
            return Box::pin(async { Ok(make_error_response(StatusCode::NOT_FOUND)) });
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while tx.send(Bytes::from_static(b"tick")).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let mut response = Response::new(TickBody { rx }.boxed());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, "video/mp2t".parse().unwrap());
        Box::pin(async move { Ok(response) })
    }
}

/// Starts an upstream serving a live stream on `/live.ts` and returns its
/// base URL.
pub async fn spawn_upstream() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_listener(listener, LiveUpstream));
    Url::parse(&format!("http://127.0.0.1:{port}")).unwrap()
}

/// Serves the relay's stream API on a random local port.
pub async fn spawn_relay(config: Config) -> (String, Arc<Relay>) {
    let relay = Relay::new(&config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_listener(listener, ProxyService::new(relay.clone())));
    (format!("http://127.0.0.1:{port}"), relay)
}
