//! Master side of the process pool.
//!
//! The supervisor forks `process_num` workers, replaces any that exit while
//! it is running, and on terminate asks (or forces) every worker to exit and
//! returns once all of them are gone.

use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{spawn_writer, Frame, MessageReader, Outbound};
use super::delegate::{DelegateChain, DelegateHost};
use super::protocol::Message;
use super::signals::{self, TerminationReason};
use super::{ClusterHandle, LISTEN_ADDR_ENV, WORKER_ID_ENV};
use crate::config::{Hooks, ServerConfig};
use crate::error::ServeError;

const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Requests to a running supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    Terminate,
    Broadcast(Value),
    Send { worker_id: usize, payload: Value },
}

#[derive(Debug)]
enum SupervisorEvent {
    Message { worker_id: usize, message: Message },
    Exited { worker_id: usize, status: std::io::Result<ExitStatus> },
    Respawn,
    GraceExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Dying,
}

struct WorkerHandle {
    pid: Option<u32>,
    /// Dropped on terminate, which also closes the worker's stdin.
    outbound: Option<Outbound>,
    kill: CancellationToken,
}

pub struct Supervisor {
    config: ServerConfig,
    hooks: Hooks,
    addr: SocketAddr,
    program: PathBuf,
    args: Vec<OsString>,
    host: Arc<DelegateHost>,
    chain: Arc<DelegateChain>,
    workers: HashMap<usize, WorkerHandle>,
    next_id: usize,
    state: State,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    control_tx: mpsc::UnboundedSender<SupervisorCommand>,
    control_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
}

impl Supervisor {
    /// A supervisor that re-runs the current executable, with the current
    /// arguments, as its workers.
    pub fn new(
        config: ServerConfig,
        hooks: Hooks,
        chain: Arc<DelegateChain>,
        addr: SocketAddr,
    ) -> Result<Self, ServeError> {
        let program = std::env::current_exe()?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self::with_command(config, hooks, chain, addr, program, args))
    }

    /// A supervisor running `program args...` as its workers.
    pub fn with_command(
        config: ServerConfig,
        hooks: Hooks,
        chain: Arc<DelegateChain>,
        addr: SocketAddr,
        program: PathBuf,
        args: Vec<OsString>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            hooks,
            addr,
            program,
            args,
            host: DelegateHost::new(Arc::clone(&chain)),
            chain,
            workers: HashMap::new(),
            next_id: 1,
            state: State::Running,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
        }
    }

    /// Handle for code running in the master process.
    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle::Master {
            chain: Arc::clone(&self.chain),
            control: self.control_tx.clone(),
        }
    }

    pub fn control(&self) -> mpsc::UnboundedSender<SupervisorCommand> {
        self.control_tx.clone()
    }

    /// Spawn the pool and supervise it until it has been terminated and
    /// every worker has exited. SIGINT and SIGTERM terminate the pool.
    pub async fn run(mut self) -> Result<(), ServeError> {
        let control = self.control_tx.clone();
        if let Err(err) = signals::on_termination(move |_| control.send(SupervisorCommand::Terminate).is_ok()) {
            warn!(error = %err, "Could not install signal handlers");
        }

        let count = usize::try_from(self.config.process_num).unwrap_or(0).max(1);
        info!(
            pid = std::process::id(),
            workers = count,
            addr = %self.addr,
            "Master started"
        );
        for _ in 0..count {
            self.spawn_worker()?;
        }

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Some(command) = self.control_rx.recv() => self.on_command(command),
            }
            if self.state == State::Dying && self.workers.is_empty() {
                break;
            }
        }
        info!(pid = std::process::id(), "Master stopped");
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), ServeError> {
        let worker_id = self.next_id;
        self.next_id += 1;

        let mut child: Child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, worker_id.to_string())
            .env(LISTEN_ADDR_ENV, self.addr.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServeError::Spawn { worker_id, source })?;

        let pid = child.id();
        let peer = format!("worker-{worker_id}");
        let outbound = child.stdin.take().map(|stdin| spawn_writer(stdin, peer).0);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_worker(
                worker_id,
                MessageReader::new(stdout),
                self.events_tx.clone(),
            ));
        }

        let kill = CancellationToken::new();
        tokio::spawn(wait_worker(worker_id, child, kill.clone(), self.events_tx.clone()));

        info!(worker_id, pid = ?pid, "Worker spawned");
        self.workers.insert(
            worker_id,
            WorkerHandle {
                pid,
                outbound,
                kill,
            },
        );
        Ok(())
    }

    fn on_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Message { worker_id, message } => self.on_message(worker_id, message),
            SupervisorEvent::Exited { worker_id, status } => {
                let handle = self.workers.remove(&worker_id);
                let reason = match &status {
                    Ok(status) => TerminationReason::from_status(status).to_string(),
                    Err(err) => err.to_string(),
                };
                info!(
                    worker_id,
                    pid = ?handle.as_ref().and_then(|h| h.pid),
                    reason = %reason,
                    "Worker exited"
                );
                if self.state == State::Running {
                    if let Err(err) = self.spawn_worker() {
                        error!(error = %err, "Could not replace worker, retrying");
                        self.schedule(SupervisorEvent::Respawn, RESPAWN_BACKOFF);
                    }
                }
            }
            SupervisorEvent::Respawn => {
                if self.state == State::Running {
                    if let Err(err) = self.spawn_worker() {
                        error!(error = %err, "Could not replace worker, retrying");
                        self.schedule(SupervisorEvent::Respawn, RESPAWN_BACKOFF);
                    }
                }
            }
            SupervisorEvent::GraceExpired => {
                for (worker_id, handle) in &self.workers {
                    warn!(worker_id, "Worker did not exit in time, killing");
                    handle.kill.cancel();
                }
            }
        }
    }

    fn on_message(&mut self, worker_id: usize, message: Message) {
        if self.config.logs_process_messages() {
            info!(worker_id, message = ?message, "Message from worker");
        }
        match message {
            Message::TerminateMaster => self.terminate(),
            request @ Message::DelegateRequest { .. } => {
                let reply = self
                    .workers
                    .get(&worker_id)
                    .and_then(|handle| handle.outbound.clone());
                match reply {
                    Some(reply) => self.host.handle(worker_id, request, reply),
                    None => debug!(worker_id, "Dropping delegation from departing worker"),
                }
            }
            Message::Custom { payload } => self.hooks.master_message(worker_id, &payload),
            other => warn!(worker_id, kind = other.kind(), "Unexpected message from worker"),
        }
    }

    fn on_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Terminate => self.terminate(),
            SupervisorCommand::Broadcast(payload) => {
                for handle in self.workers.values() {
                    if let Some(outbound) = &handle.outbound {
                        // A worker on its way out may have closed its channel.
                        drop(outbound.send(Message::custom(payload.clone())));
                    }
                }
            }
            SupervisorCommand::Send { worker_id, payload } => {
                let sent = self
                    .workers
                    .get(&worker_id)
                    .and_then(|handle| handle.outbound.as_ref())
                    .is_some_and(|outbound| outbound.send(Message::custom(payload)).is_ok());
                if !sent {
                    debug!(worker_id, "No such worker for message");
                }
            }
        }
    }

    /// Stop replacing workers and tell each one to exit.
    fn terminate(&mut self) {
        if self.state == State::Dying {
            return;
        }
        self.state = State::Dying;
        info!(
            workers = self.workers.len(),
            soft = self.config.soft_exit_worker,
            "Terminating workers"
        );
        for (worker_id, handle) in self.workers.iter_mut() {
            let outbound = handle.outbound.take();
            let asked = self.config.soft_exit_worker
                && outbound
                    .as_ref()
                    .is_some_and(|o| o.send(Message::TerminateWorker).is_ok());
            if !asked {
                debug!(worker_id = *worker_id, "Killing worker");
                handle.kill.cancel();
            }
        }
        self.schedule(SupervisorEvent::GraceExpired, self.config.shutdown_grace() * 2);
    }

    fn schedule(&self, event: SupervisorEvent, after: Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The supervisor may already be gone.
            drop(events.send(event));
        });
    }
}

async fn read_worker(
    worker_id: usize,
    mut reader: MessageReader<tokio::process::ChildStdout>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Message(message))) => {
                if events.send(SupervisorEvent::Message { worker_id, message }).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Text(line))) => info!(worker_id, output = %line, "Worker output"),
            Ok(None) => break,
            Err(err) => {
                debug!(worker_id, error = %err, "Worker channel read failed");
                break;
            }
        }
    }
}

async fn wait_worker(
    worker_id: usize,
    mut child: Child,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                debug!(worker_id, error = %err, "Kill failed");
            }
            child.wait().await
        }
    };
    drop(events.send(SupervisorEvent::Exited { worker_id, status }));
}
