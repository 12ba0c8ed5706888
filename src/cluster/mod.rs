//! # Cluster Module
//!
//! Multi-process serving: a master process forks workers that all listen on
//! the same address, and any worker can hand work back to the master.
//!
//! ## Topology
//!
//! ```text
//!            ┌──────────── master ────────────┐
//!            │ Supervisor   DelegateHost      │
//!            └──┬──────────────┬──────────┬───┘
//!   stdin/stdout│ (JSON lines) │          │
//!          ┌────▼───┐     ┌────▼───┐ ┌────▼───┐
//!          │worker 1│     │worker 2│ │worker N│   SO_REUSEPORT on one address
//!          └────────┘     └────────┘ └────────┘
//! ```
//!
//! Workers are the same executable started again with
//! [`WORKER_ID_ENV`] and [`LISTEN_ADDR_ENV`] set; [`Role::detect`] tells the
//! two apart. Workers log to stderr, which they share with the master.
//!
//! ## Messages
//!
//! See [`Message`]: `TERMINATE_MASTER`, `TERMINATE_WORKER`,
//! `DELEGATE_REQUEST`, `DELEGATE_SUCCESS`, `DELEGATE_FAILURE` and `CUSTOM`.

mod channel;
mod delegate;
mod protocol;
pub mod signals;
mod supervisor;
mod worker;

pub use channel::{spawn_writer, Frame, MessageReader, Outbound};
pub use delegate::{
    DelegateCall, DelegateChain, DelegateClient, DelegateError, DelegateHandler, DelegateHost,
};
pub use protocol::{ErrorDescriptor, Message};
pub use supervisor::{Supervisor, SupervisorCommand};
pub use worker::{block_on_worker, run_worker};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Hooks;
use crate::lifecycle::Lifecycle;

/// Set in a worker's environment: its id.
pub const WORKER_ID_ENV: &str = "WSGILITE_WORKER_ID";
/// Set in a worker's environment: the address to bind.
pub const LISTEN_ADDR_ENV: &str = "WSGILITE_LISTEN_ADDR";

/// Part a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No master, no workers: this process serves.
    Single,
    Master,
    Worker { id: usize },
}

impl Role {
    /// `Worker` when started by a master, `Single` otherwise.
    pub fn detect() -> Role {
        std::env::var(WORKER_ID_ENV)
            .ok()
            .and_then(|id| id.parse().ok())
            .map_or(Role::Single, |id| Role::Worker { id })
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Role::Worker { .. })
    }
}

/// A process's view of the cluster, handed to every request.
#[derive(Clone)]
pub enum ClusterHandle {
    /// Single-process mode: this process is both master and worker.
    Standalone {
        chain: Arc<DelegateChain>,
        lifecycle: Arc<Lifecycle>,
        hooks: Hooks,
    },
    Master {
        chain: Arc<DelegateChain>,
        control: mpsc::UnboundedSender<SupervisorCommand>,
    },
    Worker {
        id: usize,
        client: Arc<DelegateClient>,
        outbound: Outbound,
    },
}

impl ClusterHandle {
    pub fn role(&self) -> Role {
        match self {
            ClusterHandle::Standalone { .. } => Role::Single,
            ClusterHandle::Master { .. } => Role::Master,
            ClusterHandle::Worker { id, .. } => Role::Worker { id: *id },
        }
    }

    /// Run `payload` through the master's delegation chain and return each
    /// handler's result in order. On the master itself (or without one) the
    /// chain runs in this process.
    pub async fn request_action_on_master(
        &self,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, DelegateError> {
        match self {
            ClusterHandle::Standalone { chain, .. } | ClusterHandle::Master { chain, .. } => {
                chain.call_local(payload, timeout).await
            }
            ClusterHandle::Worker { client, .. } => client.request(payload, timeout).await,
        }
    }

    /// Stop serving. From a worker this stops the whole pool.
    pub fn terminate(&self) {
        let sent = match self {
            ClusterHandle::Standalone { lifecycle, .. } => {
                lifecycle.terminate();
                true
            }
            ClusterHandle::Master { control, .. } => {
                control.send(SupervisorCommand::Terminate).is_ok()
            }
            ClusterHandle::Worker { outbound, .. } => {
                outbound.send(Message::TerminateMaster).is_ok()
            }
        };
        if !sent {
            debug!("Terminate requested but the supervisor is gone");
        }
    }

    /// Send an application message to the master.
    pub fn notify_master(&self, payload: Value) -> bool {
        match self {
            ClusterHandle::Standalone { hooks, .. } => {
                hooks.master_message(0, &payload);
                true
            }
            ClusterHandle::Master { .. } => false,
            ClusterHandle::Worker { outbound, .. } => {
                outbound.send(Message::custom(payload)).is_ok()
            }
        }
    }

    /// Send an application message to every worker.
    pub fn broadcast(&self, payload: Value) -> bool {
        match self {
            ClusterHandle::Standalone { hooks, .. } => {
                hooks.worker_message(&payload);
                true
            }
            ClusterHandle::Master { control, .. } => {
                control.send(SupervisorCommand::Broadcast(payload)).is_ok()
            }
            ClusterHandle::Worker { .. } => false,
        }
    }

    /// Send an application message to one worker. In single-process mode
    /// this process is the only worker and any id reaches it.
    pub fn send_to_worker(&self, worker_id: usize, payload: Value) -> bool {
        match self {
            ClusterHandle::Standalone { hooks, .. } => {
                hooks.worker_message(&payload);
                true
            }
            ClusterHandle::Master { control, .. } => control
                .send(SupervisorCommand::Send { worker_id, payload })
                .is_ok(),
            ClusterHandle::Worker { .. } => false,
        }
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClusterHandle({:?})", self.role())
    }
}
