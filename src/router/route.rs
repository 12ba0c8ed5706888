use http::{Method, StatusCode};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::pattern::{PatternError, RoutePattern};
use crate::dispatcher::Exchange;
use crate::handler::Handler;
use crate::lifecycle::{ExitReason, Lifecycle};

/// Handler type for routes and middleware.
pub type RouteHandler = Handler<Exchange>;

pub const DEFAULT_TIMEOUT_MS: i64 = 120_000;
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "504 Gateway Timeout";

/// A registered rule, its handler and its execution timeout.
pub struct Route {
    method: Option<Method>,
    pattern: RoutePattern,
    handler: RouteHandler,
    timeout_ms: AtomicI64,
    timeout_message: RwLock<Arc<str>>,
}

impl Route {
    pub fn new(
        method: Option<Method>,
        rule: &str,
        handler: RouteHandler,
    ) -> Result<Self, PatternError> {
        Ok(Self {
            method,
            pattern: RoutePattern::parse(rule)?,
            handler,
            timeout_ms: AtomicI64::new(DEFAULT_TIMEOUT_MS),
            timeout_message: RwLock::new(Arc::from(DEFAULT_TIMEOUT_MESSAGE)),
        })
    }

    pub fn rule(&self) -> &str {
        self.pattern.rule()
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn handler(&self) -> &RouteHandler {
        &self.handler
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Zero or negative disables the timeout.
    pub fn set_timeout_ms(&self, timeout_ms: i64) -> &Self {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        self
    }

    pub fn timeout_message(&self) -> Arc<str> {
        Arc::clone(&self.timeout_message.read())
    }

    pub fn set_timeout_message(&self, message: &str) -> &Self {
        *self.timeout_message.write() = Arc::from(message);
        self
    }

    /// Test the method filter and the pattern against the context's path.
    /// On a match the parameters are merged into the context and the
    /// pipeline is told not to fall through to a 404.
    pub fn matches(&self, exchange: &Exchange) -> bool {
        if let Some(method) = &self.method {
            if exchange.request.method() != method {
                return false;
            }
        }
        let path = exchange.context.url_path();
        let Some(params) = self.pattern.captures(&path) else {
            return false;
        };
        debug!(
            rule = %self.rule(),
            path = %path,
            path_params = ?params,
            "Route matched"
        );
        exchange.context.extend_params(&params);
        exchange.context.set_skip_404(true);
        true
    }

    /// Start the timeout guard for one execution. If the response is not
    /// finished in time a 504 is written and the process is told to stop.
    pub fn arm_timeout(&self, exchange: &Exchange, lifecycle: &Arc<Lifecycle>) {
        let timeout_ms = self.timeout_ms();
        if timeout_ms <= 0 {
            return;
        }
        let response = exchange.response.clone();
        let finished = response.finished();
        let lifecycle = Arc::clone(lifecycle);
        let rule = self.rule().to_string();
        let message = self.timeout_message();
        let duration = Duration::from_millis(timeout_ms.unsigned_abs());

        tokio::spawn(async move {
            tokio::select! {
                _ = finished => {}
                _ = tokio::time::sleep(duration) => {
                    if !response.send(StatusCode::GATEWAY_TIMEOUT, "text/plain; charset=utf-8", message.as_bytes()) {
                        return;
                    }
                    error!(rule = %rule, timeout_ms, "Execution timeout");
                    lifecycle.escalate(ExitReason::RouteTimeout { rule, timeout_ms });
                }
            }
        });
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("rule", &self.rule())
            .field("handler", &self.handler.shape())
            .field("timeout_ms", &self.timeout_ms())
            .finish()
    }
}
