//! # Dispatcher Module
//!
//! The request pipeline of one process.
//!
//! ## Request Flow
//!
//! 1. The request body is decoded into the context (urlencoded, JSON or
//!    multipart), unless disabled in [`ServerConfig`](crate::ServerConfig)
//! 2. Middleware run in registration order
//! 3. Routes are tried in registration order; a match arms the route's
//!    timeout and runs its handler
//! 4. The reply (if any) is written: text verbatim, anything else as JSON
//!
//! Steps 2 and 3 stop as soon as the response is finished or a route has
//! claimed the request. A request nobody claimed gets a 404.
//!
//! ## Error Handling
//!
//! - Handler errors and panics go to the error hook, which writes a 500
//! - A body that fails to decode is reported the same way
//! - A route that misses its timeout gets a 504 and the process stops
//!   serving (see [`Lifecycle`](crate::lifecycle::Lifecycle))

mod core;
pub mod form;

pub use core::{
    default_error_hook, write_reply, Dispatcher, ErrorHook, Exchange, INTERNAL_ERROR_BODY,
    NOT_FOUND_BODY,
};
