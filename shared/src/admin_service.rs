use crate::http::make_error_response;
use http::header::CONTENT_TYPE;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Health, readiness and status endpoints served on the admin listener.
///
/// `is_ready` backs `/ready`; `status` renders the JSON document served on
/// `/status`.
pub struct AdminService<F, S, E> {
    is_ready: F,
    status: S,
    _error: PhantomData<E>,
}

impl<F, S, E> AdminService<F, S, E>
where
    F: Fn() -> bool,
    S: Fn() -> String,
{
    pub fn new(is_ready: F, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }

    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, E>> {
        let ok_body = || Full::new(Bytes::from("ok\n")).map_err(|e| match e {}).boxed();

        match path {
            "/health" => Response::new(ok_body()),
            "/ready" => match (self.is_ready)() {
                true => Response::new(ok_body()),
                false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/status" => {
                let body = Full::new(Bytes::from((self.status)()))
                    .map_err(|e| match e {})
                    .boxed();
                let mut response = Response::new(body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                response
            }
            _ => make_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<F, S, E> Service<Request<Incoming>> for AdminService<F, S, E>
where
    F: Fn() -> bool,
    S: Fn() -> String,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
