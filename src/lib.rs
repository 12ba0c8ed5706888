//! # wsgilite
//!
//! A small HTTP application server: an ordered middleware pipeline in front of
//! pattern-matched routes, served by one process or by a master and a pool of
//! worker processes that share one listening address.
//!
//! ## Overview
//!
//! Handlers come in three shapes (see [`Handler`]): plain functions, async
//! functions, and step-wise handlers that yield a sequence of futures. All
//! three produce the same [`Reply`], so a handler can change shape without
//! changing what the client sees.
//!
//! ## Architecture
//!
//! - **[`router`]** - Route patterns (`/user/:id`, `/files/*path`, `(optional)`),
//!   per-route timeouts and route groups
//! - **[`middleware`]** - Method-filtered handlers run before routes
//! - **[`dispatcher`]** - The request pipeline: body decoding, middleware,
//!   routes, 404 and 500 handling
//! - **[`server`]** - hyper-based HTTP frontend and the request/response
//!   handles given to handlers
//! - **[`cluster`]** - Master/worker supervision and delegating work from a
//!   worker to the master
//! - **[`config`]** - Server configuration and lifecycle hooks
//! - **[`logging`]** - `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```no_run
//! use wsgilite::{App, DefineRoutes, Reply, RouteHandler, ServerConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut config = ServerConfig::default();
//!     config.process_num = 0;
//!     let app = App::new(config);
//!     app.get("/user/:id", RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))))?;
//!     app.listen("127.0.0.1:8080")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Processes
//!
//! With `process_num > 0`, [`App::listen`] makes the calling process a master
//! that starts `process_num` copies of the same executable as workers and
//! restarts any that exit. A worker stops serving when a route times out (504),
//! when it reaches `worker_serve_times_to_restart`, or when the master goes
//! away; the master then replaces it.

pub mod app;
pub mod cluster;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod ids;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod router;
pub mod server;

pub use app::App;
pub use cluster::{ClusterHandle, DelegateCall, DelegateError, DelegateHandler, Role};
pub use config::{Hooks, ServerConfig, ServerInfo};
pub use context::Context;
pub use dispatcher::{Dispatcher, Exchange};
pub use error::ServeError;
pub use handler::{step, Handler, HandlerError, HandlerResult, Reply, Steps};
pub use lifecycle::ExitReason;
pub use router::{DefineRoutes, Route, RouteHandler};
pub use server::{Request, Response};
