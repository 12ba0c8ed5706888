//! Shared response handle.
//!
//! A [`Response`] is written by middleware, routes, timers and the error hook,
//! possibly from different tasks. Status, headers and body are buffered until
//! [`Response::end`] hands the finished response to the connection, which
//! happens at most once. If every handle is dropped without `end`, the
//! connection answers 500.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::Full;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Receives the finished response.
pub type ResponseReceiver = oneshot::Receiver<http::Response<Full<Bytes>>>;

#[derive(Clone)]
pub struct Response {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    finished: CancellationToken,
}

struct State {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    sender: Option<oneshot::Sender<http::Response<Full<Bytes>>>>,
}

impl Response {
    /// A fresh 200 response and the receiver its finished form is sent to.
    pub fn channel() -> (Response, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        let response = Response {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: BytesMut::new(),
                    sender: Some(tx),
                }),
                finished: CancellationToken::new(),
            }),
        };
        (response, rx)
    }

    pub fn status(&self) -> StatusCode {
        self.inner.state.lock().status
    }

    /// Returns false once the response is finished.
    pub fn set_status(&self, status: StatusCode) -> bool {
        let mut state = self.inner.state.lock();
        if state.sender.is_none() {
            return false;
        }
        state.status = status;
        true
    }

    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.inner.state.lock().headers.get(name).cloned()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.inner.state.lock().headers.contains_key(name)
    }

    /// Set (replace) a header. Ignored once the response is finished.
    pub fn set_header(&self, name: &str, value: &str) -> anyhow::Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.insert_header(name, value);
        Ok(())
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut state = self.inner.state.lock();
        if state.sender.is_none() {
            return false;
        }
        state.headers.insert(name, value);
        true
    }

    /// Append to the buffered body. Returns false once finished.
    pub fn write(&self, chunk: impl AsRef<[u8]>) -> bool {
        let mut state = self.inner.state.lock();
        if state.sender.is_none() {
            return false;
        }
        state.body.extend_from_slice(chunk.as_ref());
        true
    }

    /// Finish the response. Only the first call has any effect; it returns
    /// true.
    pub fn end(&self) -> bool {
        let (sender, response) = {
            let mut state = self.inner.state.lock();
            let Some(sender) = state.sender.take() else {
                return false;
            };
            let mut response =
                http::Response::new(Full::new(std::mem::take(&mut state.body).freeze()));
            *response.status_mut() = state.status;
            *response.headers_mut() = std::mem::take(&mut state.headers);
            (sender, response)
        };
        self.inner.finished.cancel();
        if sender.send(response).is_err() {
            tracing::debug!("response finished after the connection went away");
        }
        true
    }

    /// Drop whatever body has been buffered so far. Returns false once
    /// finished.
    pub fn clear_body(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.sender.is_none() {
            return false;
        }
        state.body.clear();
        true
    }

    /// Write a complete response in one go and end it. Any body buffered
    /// before is replaced; headers already set are kept.
    pub fn send(
        &self,
        status: StatusCode,
        content_type: &'static str,
        body: impl AsRef<[u8]>,
    ) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.sender.is_none() {
                return false;
            }
            state.status = status;
            state
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            state.body.clear();
            state.body.extend_from_slice(body.as_ref());
        }
        self.end()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// Resolves once the response is finished.
    pub fn finished(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.finished.clone();
        async move { token.cancelled().await }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Response")
            .field("status", &state.status)
            .field("finished", &state.sender.is_none())
            .finish()
    }
}
