//! # Router Module
//!
//! Route rules, compiled patterns and route registration.
//!
//! ## Overview
//!
//! - [`RoutePattern`] compiles a rule such as `/user/:id` or `/file/*path`
//!   into an anchored regex and extracts its parameters
//! - [`Route`] pairs a pattern with a handler, an optional method filter and
//!   an execution timeout
//! - [`DefineRoutes`] is the registration surface (`get`, `post`, ...,
//!   `group`) shared by the application and [`RouteGroup`]
//!
//! Routes are tried in registration order; the first match ends the search
//! for that request.
//!
//! ## Example
//!
//! ```
//! use wsgilite::router::RoutePattern;
//!
//! let pattern = RoutePattern::parse("/file/*path").unwrap();
//! let params = pattern.captures("/file/a/b%20c.txt").unwrap();
//! assert_eq!(params[0].1, "a/b c.txt");
//! ```

mod group;
mod pattern;
mod route;

pub use group::{DefineRoutes, RouteGroup};
pub use pattern::{ParamVec, PatternError, RoutePattern, MAX_INLINE_PARAMS};
pub use route::{Route, RouteHandler, DEFAULT_TIMEOUT_MESSAGE, DEFAULT_TIMEOUT_MS};
