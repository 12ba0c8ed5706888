use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::channel::{spawn_writer, Frame, MessageReader};
use super::delegate::DelegateClient;
use super::protocol::Message;
use super::{ClusterHandle, Role};
use crate::config::{Hooks, ServerInfo};
use crate::dispatcher::Dispatcher;
use crate::error::ServeError;
use crate::lifecycle::{ExitReason, Lifecycle};
use crate::server::{bind_reuseport, serve};

/// Serve as worker `id`, talking to the master over `input`/`output`
/// (the process's stdin/stdout in a real pool).
///
/// Returns when serving stops, whether or not the master's channel is
/// still open; the caller is expected to exit the process. A
/// `TERMINATE_WORKER` from the master exits immediately.
pub async fn run_worker<R, W>(
    dispatcher: Arc<Dispatcher>,
    hooks: Hooks,
    id: usize,
    addr: SocketAddr,
    input: R,
    output: W,
) -> Result<ExitReason, ServeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let lifecycle = Arc::clone(dispatcher.lifecycle());
    let role = Role::Worker { id };
    lifecycle.set_role(role);

    let (outbound, _writer) = spawn_writer(output, "master".to_string());
    let client = Arc::new(DelegateClient::new(outbound.clone()));
    dispatcher.set_cluster(ClusterHandle::Worker {
        id,
        client: Arc::clone(&client),
        outbound,
    });

    let log_messages = dispatcher.config().logs_process_messages();
    tokio::spawn(read_master(
        id,
        MessageReader::new(input),
        client,
        hooks.clone(),
        Arc::clone(&lifecycle),
        log_messages,
    ));

    let listener = bind_reuseport(addr)?;
    let info = ServerInfo {
        addr: listener.local_addr()?,
        scheme: dispatcher.config().scheme(),
        role,
        pid: std::process::id(),
    };
    info!(worker_id = id, pid = info.pid, url = %info.url(), "Worker listening");
    hooks.server_created(&info);

    Ok(serve(listener, dispatcher).await)
}

/// Run a worker to completion on `runtime`, then discard the runtime
/// without joining its blocking threads. Reading stdin parks one of those
/// threads until the master writes or closes the pipe, which may be never.
pub fn block_on_worker<F: Future>(runtime: Runtime, worker: F) -> F::Output {
    let outcome = runtime.block_on(worker);
    runtime.shutdown_background();
    outcome
}

async fn read_master<R: AsyncRead + Unpin>(
    id: usize,
    mut reader: MessageReader<R>,
    client: Arc<DelegateClient>,
    hooks: Hooks,
    lifecycle: Arc<Lifecycle>,
    log_messages: bool,
) {
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(worker_id = id, error = %err, "Master channel read failed");
                break;
            }
        };
        let message = match frame {
            Frame::Message(message) => message,
            Frame::Text(line) => {
                debug!(worker_id = id, line = %line, "Ignoring non-protocol input");
                continue;
            }
        };
        if log_messages {
            info!(worker_id = id, message = ?message, "Message from master");
        }
        match message {
            Message::TerminateWorker => {
                info!(worker_id = id, "Terminated by master");
                std::process::exit(0);
            }
            answer @ (Message::DelegateSuccess { .. } | Message::DelegateFailure { .. }) => {
                client.resolve(answer);
            }
            Message::Custom { payload } => hooks.worker_message(&payload),
            other => warn!(worker_id = id, kind = other.kind(), "Unexpected message from master"),
        }
    }
    client.fail_all();
    lifecycle.escalate(ExitReason::MasterGone);
}
