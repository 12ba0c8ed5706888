//! Request-scoped context.
//!
//! The context is the bag of values middleware and routes pass to each
//! other: query parameters, decoded form fields, route parameters and
//! anything a middleware wants to add. It also carries two values kept
//! apart from the bag: the resolved URL path and the flag that ends the
//! pipeline without a 404. Extending the bag never touches either; keys
//! with their names are ignored.

use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::handler::Reply;
use crate::router::ParamVec;
use crate::server::Request;

/// Reserved key for the resolved URL path in serialized form.
pub const URL_PATH_KEY: &str = "_url_path";
/// Reserved key for the terminate-without-404 flag in serialized form.
pub const SKIP_404_KEY: &str = "_skip404";

#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Mutex<ContextInner>>,
}

#[derive(Default)]
struct ContextInner {
    url_path: String,
    skip_404: bool,
    values: Map<String, Value>,
}

fn is_reserved(key: &str) -> bool {
    key == URL_PATH_KEY || key == SKIP_404_KEY
}

impl Context {
    pub fn new(url_path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                url_path: url_path.into(),
                ..ContextInner::default()
            })),
        }
    }

    /// Context seeded from a request: its path and query parameters.
    /// Repeated query keys collect into an array.
    pub fn for_request(request: &Request) -> Self {
        let ctx = Context::new(request.path());
        {
            let mut inner = ctx.inner.lock();
            for (key, value) in request.query_pairs() {
                if is_reserved(&key) {
                    continue;
                }
                match inner.values.get_mut(&key) {
                    Some(Value::Array(items)) => items.push(Value::String(value)),
                    Some(existing) => {
                        let first = existing.take();
                        *existing = Value::Array(vec![first, Value::String(value)]);
                    }
                    None => {
                        inner.values.insert(key, Value::String(value));
                    }
                }
            }
        }
        ctx
    }

    pub fn url_path(&self) -> String {
        self.inner.lock().url_path.clone()
    }

    pub fn skip_404(&self) -> bool {
        self.inner.lock().skip_404
    }

    pub fn set_skip_404(&self, skip: bool) {
        self.inner.lock().skip_404 = skip;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().values.contains_key(key)
    }

    /// Insert a value, returning the previous one. Reserved keys are ignored.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if is_reserved(&key) {
            return None;
        }
        self.inner.lock().values.insert(key, value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.remove(key)
    }

    /// Merge entries, later ones winning. Reserved keys are ignored.
    pub fn extend<K, I>(&self, entries: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut inner = self.inner.lock();
        for (key, value) in entries {
            let key = key.into();
            if !is_reserved(&key) {
                inner.values.insert(key, value);
            }
        }
    }

    /// Merge route parameters as strings.
    pub fn extend_params(&self, params: &ParamVec) {
        self.extend(
            params
                .iter()
                .map(|(name, value)| (name.to_string(), Value::String(value.clone()))),
        );
    }

    /// Snapshot including the reserved keys.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let inner = self.inner.lock();
        let mut map = serializer.serialize_map(Some(inner.values.len() + 2))?;
        for (key, value) in &inner.values {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry(URL_PATH_KEY, &inner.url_path)?;
        map.serialize_entry(SKIP_404_KEY, &inner.skip_404)?;
        map.end()
    }
}

impl From<&Context> for Reply {
    fn from(ctx: &Context) -> Self {
        Reply::Json(ctx.to_json())
    }
}

impl From<Context> for Reply {
    fn from(ctx: Context) -> Self {
        Reply::from(&ctx)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context({})", self.to_json())
    }
}
