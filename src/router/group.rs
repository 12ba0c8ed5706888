use http::Method;
use std::sync::Arc;

use super::pattern::PatternError;
use super::route::{Route, RouteHandler};

/// Route registration, shared by the application and route groups.
///
/// Every verb helper registers with a method filter; [`add_route`] matches
/// any method. All return the registered [`Route`] so its timeout can be
/// tuned or it can be removed later.
///
/// [`add_route`]: DefineRoutes::add_route
pub trait DefineRoutes {
    fn define(
        &self,
        method: Option<Method>,
        rule: &str,
        handler: RouteHandler,
    ) -> Result<Arc<Route>, PatternError>;

    fn route(
        &self,
        method: Method,
        rule: &str,
        handler: RouteHandler,
    ) -> Result<Arc<Route>, PatternError> {
        self.define(Some(method), rule, handler)
    }

    fn add_route(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.define(None, rule, handler)
    }

    fn get(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::GET, rule, handler)
    }

    fn head(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::HEAD, rule, handler)
    }

    fn post(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::POST, rule, handler)
    }

    fn put(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::PUT, rule, handler)
    }

    fn delete(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::DELETE, rule, handler)
    }

    fn connect(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::CONNECT, rule, handler)
    }

    fn options(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::OPTIONS, rule, handler)
    }

    fn trace(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::TRACE, rule, handler)
    }

    fn patch(&self, rule: &str, handler: RouteHandler) -> Result<Arc<Route>, PatternError> {
        self.route(Method::PATCH, rule, handler)
    }

    /// Register routes under `prefix`.
    ///
    /// ```
    /// use wsgilite::{App, DefineRoutes, Reply, RouteHandler, ServerConfig};
    ///
    /// let app = App::new(ServerConfig::default());
    /// app.group("/api", |api| {
    ///     api.get("/users/:id", RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))))?;
    ///     Ok(())
    /// })
    /// .unwrap();
    /// assert_eq!(app.dispatcher().routes()[0].rule(), "/api/users/:id");
    /// ```
    fn group<F>(&self, prefix: &str, define: F) -> Result<(), PatternError>
    where
        Self: Sized,
        F: FnOnce(&RouteGroup<'_>) -> Result<(), PatternError>,
    {
        define(&RouteGroup::new(self, prefix))
    }
}

/// Routes registered through a group get its prefix.
pub struct RouteGroup<'a> {
    parent: &'a dyn DefineRoutes,
    prefix: String,
}

impl<'a> RouteGroup<'a> {
    /// `prefix` is normalized to start with `/` and not end with one.
    pub fn new(parent: &'a dyn DefineRoutes, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        Self { parent, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn join(&self, rule: &str) -> String {
        let rule = rule.trim_start_matches('/');
        match (self.prefix.is_empty(), rule.is_empty()) {
            (true, true) => "/".to_string(),
            (true, false) => format!("/{rule}"),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, rule),
        }
    }
}

impl DefineRoutes for RouteGroup<'_> {
    fn define(
        &self,
        method: Option<Method>,
        rule: &str,
        handler: RouteHandler,
    ) -> Result<Arc<Route>, PatternError> {
        self.parent.define(method, &self.join(rule), handler)
    }
}
