use arc_swap::ArcSwap;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::form;
use crate::cluster::{ClusterHandle, DelegateError};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::handler::{HandlerError, Reply};
use crate::lifecycle::{ExitReason, Lifecycle};
use crate::middleware::Middleware;
use crate::router::Route;
use crate::server::{Request, Response};

pub const NOT_FOUND_BODY: &str = "404 File not found.";
pub const INTERNAL_ERROR_BODY: &str = "500 Internal Server Error\n";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Everything a middleware or route handler gets for one request.
///
/// All fields are shared handles; cloning an exchange is cheap and every
/// clone sees the same request, response and context.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: Request,
    pub response: Response,
    pub context: Context,
    cluster: ClusterHandle,
}

impl Exchange {
    pub fn new(request: Request, response: Response, context: Context, cluster: ClusterHandle) -> Self {
        Self {
            request,
            response,
            context,
            cluster,
        }
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    /// Shorthand for [`ClusterHandle::request_action_on_master`].
    pub async fn request_action_on_master(
        &self,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, DelegateError> {
        self.cluster.request_action_on_master(payload, timeout).await
    }
}

/// Called with every handler error; must leave a response behind.
pub type ErrorHook = Arc<dyn Fn(&Exchange, &HandlerError) + Send + Sync>;

/// Writes `500 Internal Server Error`, plus the error chain and backtrace
/// when `debug` is set.
pub fn default_error_hook(debug: bool) -> ErrorHook {
    Arc::new(move |exchange: &Exchange, err: &HandlerError| {
        let mut body = String::from(INTERNAL_ERROR_BODY);
        if debug {
            body.push_str(&format!("{err:?}"));
        }
        exchange
            .response
            .send(StatusCode::INTERNAL_SERVER_ERROR, TEXT_PLAIN, body);
    })
}

/// Write a handler's reply. Returns whether the response was finished by it.
pub fn write_reply(response: &Response, reply: Reply) -> bool {
    let (content_type, body) = match reply {
        Reply::Empty => return false,
        Reply::Text(text) => (TEXT_PLAIN, text.into_bytes()),
        Reply::Json(value) => match serde_json::to_vec(&value) {
            Ok(body) => ("application/json", body),
            Err(err) => {
                error!(error = %err, "Reply could not be serialized");
                return false;
            }
        },
    };
    if !response.has_header(CONTENT_TYPE.as_str()) {
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response.write(body);
    response.end()
}

/// Ordered middleware and routes for one process.
///
/// Lists are copy-on-write: a request iterates the snapshot it started
/// with while registrations swap in new lists.
pub struct Dispatcher {
    middlewares: ArcSwap<Vec<Arc<Middleware>>>,
    routes: ArcSwap<Vec<Arc<Route>>>,
    error_hook: RwLock<ErrorHook>,
    config: ServerConfig,
    lifecycle: Arc<Lifecycle>,
    cluster: RwLock<ClusterHandle>,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, lifecycle: Arc<Lifecycle>, cluster: ClusterHandle) -> Self {
        Self {
            middlewares: ArcSwap::from_pointee(Vec::new()),
            routes: ArcSwap::from_pointee(Vec::new()),
            error_hook: RwLock::new(default_error_hook(config.debug)),
            config,
            lifecycle,
            cluster: RwLock::new(cluster),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn cluster(&self) -> ClusterHandle {
        self.cluster.read().clone()
    }

    pub fn set_cluster(&self, cluster: ClusterHandle) {
        *self.cluster.write() = cluster;
    }

    pub fn set_error_hook(&self, hook: ErrorHook) {
        *self.error_hook.write() = hook;
    }

    /// Register a middleware. Returns false if this exact middleware is
    /// already registered.
    pub fn add_middleware(&self, middleware: Arc<Middleware>) -> bool {
        let mut added = false;
        self.middlewares.rcu(|current| {
            added = !current.iter().any(|m| Arc::ptr_eq(m, &middleware));
            let mut next = Vec::clone(current);
            if added {
                next.push(Arc::clone(&middleware));
            }
            next
        });
        if added {
            info!(
                method = ?middleware.method(),
                shape = %middleware.handler().shape(),
                "Middleware registered"
            );
        }
        added
    }

    /// Remove every registration of `middleware`; returns how many.
    pub fn remove_middleware(&self, middleware: &Arc<Middleware>) -> usize {
        let mut removed = 0;
        self.middlewares.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|m| !Arc::ptr_eq(m, middleware))
                .cloned()
                .collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    pub fn middlewares(&self) -> Arc<Vec<Arc<Middleware>>> {
        self.middlewares.load_full()
    }

    pub fn add_route(&self, route: Arc<Route>) {
        info!(
            method = ?route.method(),
            rule = %route.rule(),
            shape = %route.handler().shape(),
            "Route registered"
        );
        self.routes.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&route));
            next
        });
    }

    /// Remove this exact route; returns how many registrations went away.
    pub fn remove_route(&self, route: &Arc<Route>) -> usize {
        self.retain_routes(|r| !Arc::ptr_eq(r, route))
    }

    /// Remove every route registered with `rule`.
    pub fn remove_routes_by_rule(&self, rule: &str) -> usize {
        self.retain_routes(|r| r.rule() != rule)
    }

    fn retain_routes(&self, keep: impl Fn(&Arc<Route>) -> bool) -> usize {
        let mut removed = 0;
        self.routes.rcu(|current| {
            let next: Vec<_> = current.iter().filter(|r| keep(r)).cloned().collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    pub fn routes(&self) -> Arc<Vec<Arc<Route>>> {
        self.routes.load_full()
    }

    /// Build the exchange for a request: a fresh context seeded from it and
    /// this process's cluster handle.
    pub fn exchange(&self, request: Request, response: Response) -> Exchange {
        let context = Context::for_request(&request);
        Exchange::new(request, response, context, self.cluster())
    }

    fn report(&self, exchange: &Exchange, err: &HandlerError) {
        error!(
            method = %exchange.request.method(),
            path = %exchange.request.path(),
            error = %format!("{err:#}"),
            "Handler failed"
        );
        // Partial handler output never leaks into the error response.
        exchange.response.clear_body();
        let hook = Arc::clone(&*self.error_hook.read());
        hook(exchange, err);
        if !exchange.response.is_finished() {
            exchange.response.send(
                StatusCode::INTERNAL_SERVER_ERROR,
                TEXT_PLAIN,
                INTERNAL_ERROR_BODY,
            );
        }
    }

    fn done(exchange: &Exchange) -> bool {
        exchange.response.is_finished() || exchange.context.skip_404()
    }

    fn record_served(&self) {
        let limit = self.config.worker_serve_times_to_restart;
        if limit == 0 {
            return;
        }
        let served = self.lifecycle.record_served();
        if served >= limit && self.lifecycle.role().is_worker() {
            self.lifecycle
                .escalate(ExitReason::ServeLimitReached { served });
        }
    }

    /// Run the pipeline for one request: body decoding, then middleware,
    /// then routes, each stopping once the response is finished or a route
    /// has claimed the request.
    ///
    /// Returns false when nothing handled the request; the caller answers
    /// 404.
    pub async fn dispatch(&self, exchange: &Exchange) -> bool {
        let method = exchange.request.method().clone();
        let start = Instant::now();

        // P1: body decoding
        if self.config.enable_form_parsing {
            match form::decode(&exchange.request).await {
                Ok(Some(fields)) => exchange.context.extend(fields),
                Ok(None) => {}
                Err(err) => {
                    self.report(exchange, &HandlerError::from(err));
                    return true;
                }
            }
        }

        // P2: middleware
        let middlewares = self.middlewares.load_full();
        for (idx, middleware) in middlewares.iter().enumerate() {
            if Self::done(exchange) {
                break;
            }
            if !middleware.applies_to(&method) {
                continue;
            }
            match middleware.handler().run(exchange.clone()).await {
                Ok(reply) => {
                    if write_reply(&exchange.response, reply) {
                        debug!(middleware_idx = idx, "Middleware finished the response");
                    }
                }
                Err(err) => {
                    self.report(exchange, &err);
                    return true;
                }
            }
        }

        // P3: routes
        let routes = self.routes.load_full();
        for route in routes.iter() {
            if Self::done(exchange) {
                break;
            }
            if !route.matches(exchange) {
                continue;
            }
            route.arm_timeout(exchange, &self.lifecycle);
            match route.handler().run(exchange.clone()).await {
                Ok(reply) => {
                    write_reply(&exchange.response, reply);
                    if exchange.response.is_finished() {
                        self.record_served();
                    }
                }
                Err(err) => {
                    self.report(exchange, &err);
                    return true;
                }
            }
            info!(
                method = %method,
                path = %exchange.request.path(),
                rule = %route.rule(),
                status = exchange.response.status().as_u16(),
                duration_us = start.elapsed().as_micros() as u64,
                "Request handled"
            );
        }

        let handled = Self::done(exchange);
        if !handled {
            debug!(method = %method, path = %exchange.request.path(), "No route matched");
        }
        handled
    }

    /// Answer an unhandled request.
    pub fn not_found(exchange: &Exchange) -> bool {
        exchange
            .response
            .send(StatusCode::NOT_FOUND, TEXT_PLAIN, NOT_FOUND_BODY)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("middlewares", &self.middlewares.load().len())
            .field("routes", &self.routes.load().len())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
