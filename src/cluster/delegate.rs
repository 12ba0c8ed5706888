//! Delegating work to the master process.
//!
//! The master owns a [`DelegateChain`]: handlers run one after another on a
//! payload and their results are collected in order. Workers reach it
//! through a [`DelegateClient`], which tags every call with a fresh
//! [`DelegateId`] so many concurrent calls can share one channel. The master
//! side of the channel is a [`DelegateHost`].
//!
//! Timeouts are enforced on both ends. The caller gives up, forgets the
//! pending entry (so a late answer is dropped) and asks the master to cancel;
//! the master cancels the call's token and stops the chain.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::Outbound;
use super::protocol::{ErrorDescriptor, Message};
use crate::handler::Handler;
use crate::ids::DelegateId;

/// Handler type for delegation handlers.
pub type DelegateHandler = Handler<DelegateCall>;

/// What a delegation handler receives.
#[derive(Debug, Clone)]
pub struct DelegateCall {
    pub request_id: DelegateId,
    pub payload: Value,
    /// Results of the handlers that ran before this one.
    pub previous: Vec<Value>,
    /// Cancelled when the caller gave up.
    pub cancel: CancellationToken,
    /// Worker that asked; `None` for in-process calls.
    pub origin: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateError {
    /// No answer within the timeout.
    Timeout { request_id: DelegateId, timeout_ms: u64 },
    /// A handler in the chain failed.
    Handler { message: String },
    /// The call was cancelled before the chain finished.
    Cancelled,
    /// The master channel is gone.
    Disconnected,
    /// A failure kind this version does not know.
    Remote(ErrorDescriptor),
}

impl fmt::Display for DelegateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegateError::Timeout { request_id, timeout_ms } => {
                write!(f, "delegation {request_id} timed out after {timeout_ms}ms")
            }
            DelegateError::Handler { message } => write!(f, "delegation handler failed: {message}"),
            DelegateError::Cancelled => f.write_str("delegation cancelled"),
            DelegateError::Disconnected => f.write_str("master process is not reachable"),
            DelegateError::Remote(desc) => write!(f, "{}: {}", desc.kind, desc.message),
        }
    }
}

impl std::error::Error for DelegateError {}

impl DelegateError {
    fn descriptor(&self) -> ErrorDescriptor {
        let kind = match self {
            DelegateError::Timeout { .. } => "timeout",
            DelegateError::Handler { .. } => "handler",
            DelegateError::Cancelled => "cancelled",
            DelegateError::Disconnected => "disconnected",
            DelegateError::Remote(desc) => return desc.clone(),
        };
        ErrorDescriptor::new(kind, self.to_string())
    }

    fn is_cancel(&self) -> bool {
        matches!(self, DelegateError::Timeout { .. } | DelegateError::Cancelled)
    }

    fn from_wire(request_id: DelegateId, error: ErrorDescriptor, timeout: Option<u64>) -> Self {
        match error.kind.as_str() {
            "timeout" => DelegateError::Timeout {
                request_id,
                timeout_ms: timeout.unwrap_or_default(),
            },
            "handler" => DelegateError::Handler {
                message: error.message,
            },
            "cancelled" => DelegateError::Cancelled,
            "disconnected" => DelegateError::Disconnected,
            _ => DelegateError::Remote(error),
        }
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Ordered delegation handlers.
#[derive(Default)]
pub struct DelegateChain {
    handlers: ArcSwap<Vec<DelegateHandler>>,
}

impl DelegateChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a handler. Adding the same handler twice is a no-op.
    pub fn add(&self, handler: DelegateHandler) {
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            if !next.iter().any(|h| h.ptr_eq(&handler)) {
                next.push(handler.clone());
            }
            next
        });
    }

    /// Remove every registration of `handler`; returns how many were removed.
    pub fn remove(&self, handler: &DelegateHandler) -> usize {
        let mut removed = 0;
        self.handlers.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|h| !h.ptr_eq(handler))
                .cloned()
                .collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.load().is_empty()
    }

    /// Run every handler in order, stopping at the first failure or when
    /// `cancel` fires between handlers.
    pub async fn run(
        &self,
        request_id: DelegateId,
        payload: Value,
        origin: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<Vec<Value>, DelegateError> {
        let handlers = self.handlers.load_full();
        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers.iter() {
            if cancel.is_cancelled() {
                return Err(DelegateError::Cancelled);
            }
            let call = DelegateCall {
                request_id,
                payload: payload.clone(),
                previous: results.clone(),
                cancel: cancel.clone(),
                origin,
            };
            match handler.run(call).await {
                Ok(reply) => results.push(reply.into_value()),
                Err(err) => {
                    warn!(request_id = %request_id, error = %err, "Delegation handler failed");
                    return Err(DelegateError::Handler {
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(DelegateError::Cancelled);
        }
        Ok(results)
    }

    /// [`run`](Self::run) under an optional timeout. On expiry the token is
    /// cancelled and the chain is dropped.
    pub async fn execute(
        &self,
        request_id: DelegateId,
        payload: Value,
        origin: Option<usize>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, DelegateError> {
        let run = self.run(request_id, payload, origin, cancel.clone());
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(DelegateError::Timeout {
                        request_id,
                        timeout_ms: timeout_ms(limit),
                    })
                }
            },
            None => run.await,
        }
    }

    /// In-process call, used on the master and in single-process mode.
    pub async fn call_local(
        &self,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, DelegateError> {
        self.execute(DelegateId::new(), payload, None, CancellationToken::new(), timeout)
            .await
    }
}

impl fmt::Debug for DelegateChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateChain").field("handlers", &self.len()).finish()
    }
}

type Pending = oneshot::Sender<Result<Vec<Value>, DelegateError>>;

/// Worker side: sends requests and routes answers back to their callers.
pub struct DelegateClient {
    outbound: Outbound,
    pending: DashMap<DelegateId, (Pending, Option<u64>)>,
}

/// Removes a pending entry when the waiting call goes away.
struct PendingGuard<'a> {
    client: &'a DelegateClient,
    id: DelegateId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.pending.remove(&self.id);
    }
}

impl DelegateClient {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            outbound,
            pending: DashMap::new(),
        }
    }

    /// Calls still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn request(
        &self,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, DelegateError> {
        let request_id = DelegateId::new();
        let limit_ms = timeout.map(timeout_ms);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, (tx, limit_ms));
        let _guard = PendingGuard {
            client: self,
            id: request_id,
        };

        if self
            .outbound
            .send(Message::delegate_request(request_id, payload, limit_ms))
            .is_err()
        {
            return Err(DelegateError::Disconnected);
        }
        debug!(request_id = %request_id, timeout_ms = ?limit_ms, "Delegation sent to master");

        let answer = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    self.pending.remove(&request_id);
                    if self.outbound.send(Message::cancel_request(request_id)).is_err() {
                        debug!(request_id = %request_id, "Master gone before cancel");
                    }
                    return Err(DelegateError::Timeout {
                        request_id,
                        timeout_ms: timeout_ms(limit),
                    });
                }
            },
            None => rx.await,
        };
        answer.unwrap_or(Err(DelegateError::Disconnected))
    }

    /// Deliver a `DELEGATE_SUCCESS` / `DELEGATE_FAILURE`. Returns false when
    /// no call is waiting for it (late or unknown answers).
    pub fn resolve(&self, message: Message) -> bool {
        let (request_id, outcome) = match message {
            Message::DelegateSuccess { request_id, result } => (request_id, Ok(result)),
            Message::DelegateFailure {
                request_id, error, ..
            } => (request_id, Err(error)),
            _ => return false,
        };
        let Some((_, (tx, limit_ms))) = self.pending.remove(&request_id) else {
            debug!(request_id = %request_id, "Ignoring answer for unknown delegation");
            return false;
        };
        let outcome =
            outcome.map_err(|error| DelegateError::from_wire(request_id, error, limit_ms));
        tx.send(outcome).is_ok()
    }

    /// Fail every waiting call; used when the master goes away.
    pub fn fail_all(&self) {
        let ids: Vec<DelegateId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, (tx, _))) = self.pending.remove(&id) {
                // The receiver may already be gone; nothing to report then.
                drop(tx.send(Err(DelegateError::Disconnected)));
            }
        }
    }
}

/// Master side: runs worker requests through the chain and answers them.
pub struct DelegateHost {
    chain: Arc<DelegateChain>,
    in_flight: DashMap<DelegateId, CancellationToken>,
}

impl DelegateHost {
    pub fn new(chain: Arc<DelegateChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            in_flight: DashMap::new(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Handle one `DELEGATE_REQUEST` from `worker_id`, answering on `reply`.
    pub fn handle(self: &Arc<Self>, worker_id: usize, message: Message, reply: Outbound) {
        let Message::DelegateRequest {
            request_id,
            timeout_ms,
            payload,
            cancel,
        } = message
        else {
            return;
        };

        if cancel {
            if let Some((_, token)) = self.in_flight.remove(&request_id) {
                debug!(request_id = %request_id, worker_id, "Delegation cancelled by worker");
                token.cancel();
            }
            return;
        }

        let token = CancellationToken::new();
        self.in_flight.insert(request_id, token.clone());
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = timeout_ms.map(Duration::from_millis);
            let outcome = tokio::select! {
                outcome = host.chain.execute(request_id, payload, Some(worker_id), token.clone(), timeout) => outcome,
                _ = token.cancelled() => Err(DelegateError::Cancelled),
            };
            host.in_flight.remove(&request_id);
            let answer = match outcome {
                Ok(result) => Message::DelegateSuccess { request_id, result },
                Err(err) => Message::DelegateFailure {
                    request_id,
                    cancel: err.is_cancel(),
                    error: err.descriptor(),
                },
            };
            if reply.send(answer).is_err() {
                debug!(request_id = %request_id, worker_id, "Worker gone before delegation answer");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Reply;
    use serde_json::json;

    #[tokio::test]
    async fn test_chain_collects_in_order() {
        let chain = DelegateChain::new();
        chain.add(DelegateHandler::from_fn(|call| Ok(Reply::from(call.payload))));
        chain.add(DelegateHandler::from_async(|call| async move {
            Ok(Reply::from(json!(call.previous.len())))
        }));
        let result = chain.call_local(json!({"x": 1}), None).await.unwrap();
        assert_eq!(result, vec![json!({"x": 1}), json!(1)]);
    }

    #[tokio::test]
    async fn test_first_error_aborts_chain() {
        let chain = DelegateChain::new();
        chain.add(DelegateHandler::from_fn(|_| Err(anyhow::anyhow!("nope"))));
        chain.add(DelegateHandler::from_fn(|_| Ok(Reply::from("unreachable"))));
        let err = chain.call_local(Value::Null, None).await.unwrap_err();
        assert_eq!(err, DelegateError::Handler { message: "nope".into() });
    }

    #[test]
    fn test_add_is_idempotent_and_remove_counts() {
        let chain = DelegateChain::new();
        let handler = DelegateHandler::from_fn(|_| Ok(Reply::Empty));
        chain.add(handler.clone());
        chain.add(handler.clone());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.remove(&handler), 1);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_remove_counts_only_its_own_handler() {
        let chain = DelegateChain::new();
        let target = DelegateHandler::from_fn(|_| Ok(Reply::Empty));
        chain.add(target.clone());

        // Other registrations racing with the removal must not skew its count.
        let others: Vec<_> = (0..8)
            .map(|_| DelegateHandler::from_fn(|_| Ok(Reply::Empty)))
            .collect();
        let removed = std::thread::scope(|scope| {
            for other in &others {
                let chain = &chain;
                scope.spawn(move || chain.add(other.clone()));
            }
            chain.remove(&target)
        });

        assert_eq!(removed, 1);
        assert_eq!(chain.len(), others.len());
        assert_eq!(chain.remove(&target), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_cancels_token() {
        let chain = DelegateChain::new();
        let seen = Arc::new(parking_lot::Mutex::new(None::<CancellationToken>));
        let slot = Arc::clone(&seen);
        chain.add(DelegateHandler::from_async(move |call| {
            *slot.lock() = Some(call.cancel.clone());
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Reply::Empty)
            }
        }));
        let err = chain
            .call_local(Value::Null, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegateError::Timeout { timeout_ms: 50, .. }));
        assert!(seen.lock().as_ref().is_some_and(|t| t.is_cancelled()));
    }

    #[test]
    fn test_unknown_answers_are_ignored() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let client = DelegateClient::new(tx);
        assert!(!client.resolve(Message::DelegateSuccess {
            request_id: DelegateId::new(),
            result: vec![],
        }));
        assert!(!client.resolve(Message::TerminateWorker));
    }

    #[test]
    fn test_wire_error_kinds() {
        let id = DelegateId::new();
        let err = DelegateError::from_wire(id, ErrorDescriptor::new("timeout", "x"), Some(10));
        assert_eq!(err, DelegateError::Timeout { request_id: id, timeout_ms: 10 });
        let err = DelegateError::from_wire(id, ErrorDescriptor::new("weird", "x"), None);
        assert!(matches!(err, DelegateError::Remote(_)));
        assert!(DelegateError::Cancelled.is_cancel());
        assert_eq!(DelegateError::Cancelled.descriptor().kind, "cancelled");
    }
}
