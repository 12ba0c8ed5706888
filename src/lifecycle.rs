//! Per-process serving state: why the process is stopping, how many
//! requests it has served, and which role it plays.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cluster::Role;

/// Why a serving loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Explicit terminate (signal, API call, or master request).
    Terminated,
    /// A route did not finish in time.
    RouteTimeout { rule: String, timeout_ms: i64 },
    /// The worker served its configured number of requests.
    ServeLimitReached { served: u64 },
    /// The master's control channel closed.
    MasterGone,
}

/// How open connections are treated when a server stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Finish in-flight responses, bounded by the grace period.
    Graceful,
    /// Drop every connection immediately.
    Destroy,
}

impl ExitReason {
    pub fn drain_mode(&self) -> DrainMode {
        match self {
            ExitReason::Terminated => DrainMode::Destroy,
            _ => DrainMode::Graceful,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Terminated => f.write_str("terminated"),
            ExitReason::RouteTimeout { rule, timeout_ms } => {
                write!(f, "execution timeout: '{rule}' -> {timeout_ms}ms")
            }
            ExitReason::ServeLimitReached { served } => {
                write!(f, "served {served} requests")
            }
            ExitReason::MasterGone => f.write_str("master channel closed"),
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    stop: CancellationToken,
    reason: Mutex<Option<ExitReason>>,
    served: AtomicU64,
    role: Mutex<Role>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            stop: CancellationToken::new(),
            reason: Mutex::new(None),
            served: AtomicU64::new(0),
            role: Mutex::new(Role::Single),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask the serving loop to stop. The first reason wins; returns whether
    /// this call was the first.
    pub fn escalate(&self, reason: ExitReason) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        tracing::info!(reason = %reason, role = ?*self.role.lock(), "Server stopping");
        *slot = Some(reason);
        drop(slot);
        self.stop.cancel();
        true
    }

    pub fn terminate(&self) -> bool {
        self.escalate(ExitReason::Terminated)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn reason(&self) -> Option<ExitReason> {
        self.reason.lock().clone()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Count one served request and return the new total.
    pub fn record_served(&self) -> u64 {
        self.served.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub fn set_role(&self, role: Role) {
        *self.role.lock() = role;
    }
}
