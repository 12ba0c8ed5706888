use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::request::Request;
use super::response::Response;
use crate::dispatcher::{Dispatcher, INTERNAL_ERROR_BODY};

/// Bridges hyper connections to the [`Dispatcher`].
#[derive(Clone)]
pub struct AppService {
    dispatcher: Arc<Dispatcher>,
    remote_addr: Option<SocketAddr>,
}

fn plain(status: StatusCode, body: &'static str) -> http::Response<Full<Bytes>> {
    let mut response = http::Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

impl AppService {
    pub fn new(dispatcher: Arc<Dispatcher>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            dispatcher,
            remote_addr,
        }
    }

    /// Read the body, run the pipeline and wait for the finished response.
    ///
    /// The pipeline runs in its own task so that a client hanging up does
    /// not cancel handlers halfway.
    pub async fn call<B>(&self, req: http::Request<B>) -> Result<http::Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let limit = self.dispatcher.config().max_body_bytes;
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                warn!(path = %parts.uri.path(), limit, "Request body too large");
                return Ok(plain(StatusCode::PAYLOAD_TOO_LARGE, "413 Payload Too Large"));
            }
            Err(err) => {
                debug!(error = %err, "Request body could not be read");
                return Ok(plain(StatusCode::BAD_REQUEST, "400 Bad Request"));
            }
        };

        let request = Request::new(http::Request::from_parts(parts, body), self.remote_addr);
        let (response, finished) = Response::channel();
        let exchange = self.dispatcher.exchange(request, response);

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            if !dispatcher.dispatch(&exchange).await {
                Dispatcher::not_found(&exchange);
            }
        });

        match finished.await {
            Ok(response) => Ok(response),
            Err(_) => {
                warn!("Response dropped without being finished");
                Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY))
            }
        }
    }
}
