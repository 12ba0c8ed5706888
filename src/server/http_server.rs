use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::service::AppService;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::{DrainMode, ExitReason, Lifecycle};

/// Accept and serve connections until the dispatcher's lifecycle is told to
/// stop, then close the listener, drain open connections according to the
/// stop reason, and return that reason.
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> ExitReason {
    let lifecycle = Arc::clone(dispatcher.lifecycle());
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = lifecycle.stopped() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(serve_connection(stream, remote, Arc::clone(&dispatcher)));
                }
                Err(err) => {
                    warn!(error = %err, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    drop(listener);
    let reason = lifecycle.reason().unwrap_or(ExitReason::Terminated);
    drain(
        &mut connections,
        reason.drain_mode(),
        dispatcher.config().shutdown_grace(),
    )
    .await;
    info!(reason = %reason, served = lifecycle.served(), "Server stopped");
    reason
}

async fn serve_connection(stream: TcpStream, remote: SocketAddr, dispatcher: Arc<Dispatcher>) {
    let lifecycle = Arc::clone(dispatcher.lifecycle());
    let service = AppService::new(dispatcher, Some(remote));
    let conn = http1::Builder::new().serve_connection(
        TokioIo::new(stream),
        service_fn(move |req| {
            let service = service.clone();
            async move { service.call(req).await }
        }),
    );
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = lifecycle.stopped() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(err) = result {
        debug!(remote = %remote, error = %err, "Connection ended with error");
    }
}

/// Close open connections: at once, or after in-flight responses are
/// flushed (bounded by `grace`).
async fn drain(connections: &mut JoinSet<()>, mode: DrainMode, grace: Duration) {
    let open = connections.len();
    if open > 0 {
        debug!(open, mode = ?mode, "Draining connections");
    }
    match mode {
        DrainMode::Destroy => connections.abort_all(),
        DrainMode::Graceful => {
            let flushed = tokio::time::timeout(grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if flushed.is_err() {
                warn!(remaining = connections.len(), "Grace period over, dropping connections");
                connections.abort_all();
            }
        }
    }
    while connections.join_next().await.is_some() {}
}

/// Handle to a server running as a task.
pub struct ServerHandle {
    addr: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    handle: JoinHandle<ExitReason>,
}

impl ServerHandle {
    pub fn spawn(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let lifecycle = Arc::clone(dispatcher.lifecycle());
        let handle = tokio::spawn(serve(listener, dispatcher));
        Ok(Self {
            addr,
            lifecycle,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait until the server accepts connections (~250ms at most).
    pub async fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if TcpStream::connect(self.addr).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Terminate and wait for the serving loop to finish.
    pub async fn stop(self) -> ExitReason {
        self.lifecycle.terminate();
        self.join().await
    }

    /// Wait for the serving loop to finish on its own.
    pub async fn join(self) -> ExitReason {
        self.handle.await.unwrap_or(ExitReason::Terminated)
    }
}
