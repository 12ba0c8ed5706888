//! # Middleware Module
//!
//! Middleware run before routes, in registration order, for every request
//! whose method passes the optional filter. They use the same handler shapes
//! as routes. A middleware ends the pipeline by finishing the response or by
//! returning a non-empty [`Reply`](crate::Reply), which is written out.

mod core;

pub use core::Middleware;
