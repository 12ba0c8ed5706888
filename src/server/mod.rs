//! # Server Module
//!
//! The HTTP frontend: hyper connections on a (shareable) listener feeding
//! the [`Dispatcher`](crate::Dispatcher), plus the request and response
//! handles handlers work with.

pub mod http_server;
pub mod listener;
pub mod request;
pub mod response;
pub mod service;

pub use http_server::{serve, ServerHandle};
pub use listener::{bind_exclusive, bind_reuseport, reserve_port};
pub use request::{parse_cookies, parse_query, Request};
pub use response::{Response, ResponseReceiver};
pub use service::AppService;
