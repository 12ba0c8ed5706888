use http::Method;
use std::sync::Arc;

use crate::router::RouteHandler;

/// A registered middleware: a handler and an optional method filter.
///
/// Identity is the `Arc` returned at registration; removing that `Arc` (or a
/// clone of it) removes the middleware.
pub struct Middleware {
    method: Option<Method>,
    handler: RouteHandler,
}

impl Middleware {
    pub fn new(method: Option<Method>, handler: RouteHandler) -> Arc<Self> {
        Arc::new(Self { method, handler })
    }

    /// A middleware that runs for every method.
    pub fn any(handler: RouteHandler) -> Arc<Self> {
        Self::new(None, handler)
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn handler(&self) -> &RouteHandler {
        &self.handler
    }

    pub fn applies_to(&self, method: &Method) -> bool {
        self.method.as_ref().map_or(true, |m| m == method)
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("method", &self.method)
            .field("handler", &self.handler.shape())
            .finish()
    }
}
