//! Handler shapes shared by middleware, routes and delegation handlers.
//!
//! A handler is chosen to be one of three shapes when it is built and is
//! always executed through [`Handler::run`]:
//!
//! - **sync**: a plain function returning a [`HandlerResult`]
//! - **async**: a function returning a future of a [`HandlerResult`]
//! - **step-wise**: a function returning [`Steps`], a sequence of futures
//!   driven one after another with a yield between each; the value of the
//!   last step is the handler's value
//!
//! Panics in any shape are caught and reported as handler errors.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Error type returned by handlers.
pub type HandlerError = anyhow::Error;

pub type HandlerResult = Result<Reply, HandlerError>;

/// One suspend point of a step-wise handler.
pub type Step = BoxFuture<'static, HandlerResult>;

/// What a handler produced.
///
/// An empty reply leaves the response alone; text is written verbatim; JSON
/// is serialized with `Content-Type: application/json`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Reply {
    #[default]
    Empty,
    Text(String),
    Json(Value),
}

impl Reply {
    /// Serialize any value into a JSON reply.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Reply::from)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Reply::Empty)
    }

    /// Convert into a JSON value: empty → `null`, text → string.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Empty => Value::Null,
            Reply::Text(text) => Value::String(text),
            Reply::Json(value) => value,
        }
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Empty
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Reply::Empty,
            Value::String(text) => Reply::Text(text),
            other => Reply::Json(other),
        }
    }
}

impl<T: Into<Reply>> From<Option<T>> for Reply {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// The futures of a step-wise handler, in execution order.
pub struct Steps(Box<dyn Iterator<Item = Step> + Send>);

impl Steps {
    pub fn new<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = Step>,
        I::IntoIter: Send + 'static,
    {
        Steps(Box::new(steps.into_iter()))
    }
}

impl fmt::Debug for Steps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Steps")
    }
}

/// Box a future as one [`Step`].
pub fn step<F>(future: F) -> Step
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    Box::pin(future)
}

/// Which shape a handler was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerShape {
    Sync,
    Async,
    Stepwise,
}

impl fmt::Display for HandlerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandlerShape::Sync => "sync",
            HandlerShape::Async => "async",
            HandlerShape::Stepwise => "stepwise",
        })
    }
}

type SyncFn<A> = dyn Fn(A) -> HandlerResult + Send + Sync;
type AsyncFn<A> = dyn Fn(A) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type StepsFn<A> = dyn Fn(A) -> Steps + Send + Sync;

/// A handler taking `A` by value.
pub enum Handler<A> {
    Sync(Arc<SyncFn<A>>),
    Async(Arc<AsyncFn<A>>),
    Stepwise(Arc<StepsFn<A>>),
}

impl<A> Clone for Handler<A> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(Arc::clone(f)),
            Handler::Async(f) => Handler::Async(Arc::clone(f)),
            Handler::Stepwise(f) => Handler::Stepwise(Arc::clone(f)),
        }
    }
}

impl<A> fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.shape())
    }
}

impl<A> Handler<A> {
    pub fn shape(&self) -> HandlerShape {
        match self {
            Handler::Sync(_) => HandlerShape::Sync,
            Handler::Async(_) => HandlerShape::Async,
            Handler::Stepwise(_) => HandlerShape::Stepwise,
        }
    }

    /// True when both values are the same registered handler.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Handler::Sync(a), Handler::Sync(b)) => Arc::ptr_eq(a, b),
            (Handler::Async(a), Handler::Async(b)) => Arc::ptr_eq(a, b),
            (Handler::Stepwise(a), Handler::Stepwise(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<A: Send + 'static> Handler<A> {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(A) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Async(Arc::new(move |arg| f(arg).boxed()))
    }

    pub fn from_steps<F>(f: F) -> Self
    where
        F: Fn(A) -> Steps + Send + Sync + 'static,
    {
        Handler::Stepwise(Arc::new(f))
    }

    /// Execute the handler to its final value.
    pub async fn run(&self, arg: A) -> HandlerResult {
        match self {
            Handler::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(arg)))
                .unwrap_or_else(|panic| Err(panic_error(panic))),
            Handler::Async(f) => {
                let future = match catch_unwind(AssertUnwindSafe(|| f(arg))) {
                    Ok(future) => future,
                    Err(panic) => return Err(panic_error(panic)),
                };
                AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(panic)))
            }
            Handler::Stepwise(f) => {
                let Steps(mut steps) = match catch_unwind(AssertUnwindSafe(|| f(arg))) {
                    Ok(steps) => steps,
                    Err(panic) => return Err(panic_error(panic)),
                };
                let mut last = Reply::Empty;
                let mut first = true;
                loop {
                    let next = catch_unwind(AssertUnwindSafe(|| steps.next()))
                        .map_err(panic_error)?;
                    let Some(step) = next else { break };
                    if !first {
                        tokio::task::yield_now().await;
                    }
                    first = false;
                    last = AssertUnwindSafe(step)
                        .catch_unwind()
                        .await
                        .map_err(panic_error)??;
                }
                Ok(last)
            }
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("handler panicked: {message}")
}
