use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Name announced in `Via` headers added by this relay.
pub const VIA_NAME: &str = "iptv-relay";

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

pub async fn run_http_service<S, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "listening");
    serve_listener(listener, service).await
}

/// Accept loop over an already bound listener. Tests bind `127.0.0.1:0` and
/// hand the listener over so they know the port up front.
pub async fn serve_listener<S, E>(listener: TcpListener, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let service_arc = Arc::new(service);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }
}

pub fn make_error_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(
        Full::new(Bytes::from(format!("{message}\n")))
            .map_err(|e| match e {})
            .boxed(),
    );
    *response.status_mut() = status_code;
    response
}

pub fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Adds a Via header to indicate the request/response passed through this proxy.
/// Appends to existing if Via is already present.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::warn!(?version, "unknown HTTP version, skipping Via header");
            return;
        }
    };

    let via_value = format!("{version_str} {VIA_NAME}");

    if let Some(existing) = headers.get(VIA) {
        if let Ok(existing_str) = existing.to_str() {
            let combined = format!("{existing_str}, {via_value}");
            if let Ok(new_value) = HeaderValue::from_str(&combined) {
                headers.insert(VIA, new_value);
            }
        }
    } else if let Ok(new_value) = HeaderValue::from_str(&via_value) {
        headers.insert(VIA, new_value);
    }
}

// For HTTP/1.x, hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers
// - any extra headers listed in the Connection header value
// - keep-alive header for HTTP/0.9 and HTTP/1.0 only
//
// HTTP/2 and HTTP/3 don't use hop-by-hop headers, so no filtering is performed.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    let mut extra_drops = Vec::new();
    if let Some(connection) = headers.get(CONNECTION)
        && let Ok(s) = connection.to_str()
    {
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                extra_drops.push(name);
            }
        }
    }

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }

    for name in extra_drops {
        headers.remove(&name);
    }

    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use std::convert::Infallible;

    #[test]
    fn test_filter_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, custom"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        headers.insert("cusTOM", HeaderValue::from_static("some-value"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));

        let filtered = filter_hop_by_hop(&mut headers, Version::HTTP_11);

        assert_eq!(filtered.len(), 1);
        assert_eq!(
            filtered.get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("video/mp2t"))
        );
        assert!(filtered.get(CONNECTION).is_none());
        assert!(filtered.get("keep-alive").is_none());
        assert!(filtered.get("custom").is_none());
    }

    #[test]
    fn test_http2_headers_untouched() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        assert_eq!(filter_hop_by_hop(&mut headers, Version::HTTP_2).len(), 1);
    }

    #[test]
    fn test_via_header_appends() {
        let mut headers = HeaderMap::new();
        add_via_header(&mut headers, Version::HTTP_11);
        assert_eq!(headers.get(VIA).unwrap(), "1.1 iptv-relay");

        add_via_header(&mut headers, Version::HTTP_2);
        assert_eq!(headers.get(VIA).unwrap(), "1.1 iptv-relay, 2 iptv-relay");
    }

    #[test]
    fn test_error_response() {
        let response = make_error_response::<Infallible>(StatusCode::BAD_GATEWAY);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
