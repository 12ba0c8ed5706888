//! The application object: registration plus the `listen` entry point that
//! decides whether this process is a single server, a master or a worker.

use http::Method;
use serde_json::Value;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cluster::{
    block_on_worker, run_worker, signals, ClusterHandle, DelegateChain, DelegateHandler, Role,
    Supervisor, LISTEN_ADDR_ENV,
};
use crate::config::{Hooks, ServerConfig, ServerInfo};
use crate::dispatcher::{Dispatcher, ErrorHook, Exchange};
use crate::handler::HandlerError;
use crate::lifecycle::{ExitReason, Lifecycle};
use crate::middleware::Middleware;
use crate::router::{DefineRoutes, PatternError, Route, RouteHandler};
use crate::server::{bind_exclusive, reserve_port, serve};
use crate::ServeError;

pub struct App {
    dispatcher: Arc<Dispatcher>,
    chain: Arc<DelegateChain>,
    hooks: Hooks,
}

impl App {
    pub fn new(config: ServerConfig) -> Self {
        let lifecycle = Lifecycle::new();
        let chain = DelegateChain::new();
        let hooks = Hooks::default();
        let cluster = ClusterHandle::Standalone {
            chain: Arc::clone(&chain),
            lifecycle: Arc::clone(&lifecycle),
            hooks: hooks.clone(),
        };
        Self {
            dispatcher: Arc::new(Dispatcher::new(config, lifecycle, cluster)),
            chain,
            hooks,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        self.dispatcher.config()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        self.dispatcher.lifecycle()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
        self.refresh_standalone();
    }

    pub fn on_server_created<F>(&mut self, hook: F)
    where
        F: Fn(&ServerInfo) + Send + Sync + 'static,
    {
        self.hooks.on_server_created = Some(Arc::new(hook));
    }

    pub fn on_master_message<F>(&mut self, hook: F)
    where
        F: Fn(usize, &Value) + Send + Sync + 'static,
    {
        self.hooks.on_master_message = Some(Arc::new(hook));
        self.refresh_standalone();
    }

    pub fn on_worker_message<F>(&mut self, hook: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.hooks.on_worker_message = Some(Arc::new(hook));
        self.refresh_standalone();
    }

    fn standalone(&self) -> ClusterHandle {
        ClusterHandle::Standalone {
            chain: Arc::clone(&self.chain),
            lifecycle: Arc::clone(self.dispatcher.lifecycle()),
            hooks: self.hooks.clone(),
        }
    }

    fn refresh_standalone(&self) {
        if matches!(self.dispatcher.cluster(), ClusterHandle::Standalone { .. }) {
            self.dispatcher.set_cluster(self.standalone());
        }
    }

    /// Add a middleware for `method` (or every method). Returns it so it can
    /// be removed again.
    pub fn add_middleware(&self, method: Option<Method>, handler: RouteHandler) -> Arc<Middleware> {
        let middleware = Middleware::new(method, handler);
        self.dispatcher.add_middleware(Arc::clone(&middleware));
        middleware
    }

    /// Register an existing middleware; a no-op if it is already registered.
    pub fn use_middleware(&self, middleware: &Arc<Middleware>) -> bool {
        self.dispatcher.add_middleware(Arc::clone(middleware))
    }

    pub fn remove_middleware(&self, middleware: &Arc<Middleware>) -> usize {
        self.dispatcher.remove_middleware(middleware)
    }

    pub fn remove_route(&self, route: &Arc<Route>) -> usize {
        self.dispatcher.remove_route(route)
    }

    pub fn remove_routes_by_rule(&self, rule: &str) -> usize {
        self.dispatcher.remove_routes_by_rule(rule)
    }

    /// Append a handler to the master's delegation chain.
    pub fn add_delegate_handler(&self, handler: DelegateHandler) {
        self.chain.add(handler);
    }

    pub fn remove_delegate_handler(&self, handler: &DelegateHandler) -> usize {
        self.chain.remove(handler)
    }

    pub fn delegate_chain(&self) -> &Arc<DelegateChain> {
        &self.chain
    }

    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&Exchange, &HandlerError) + Send + Sync + 'static,
    {
        let hook: ErrorHook = Arc::new(hook);
        self.dispatcher.set_error_hook(hook);
    }

    /// Stop serving (or, from a worker, stop the pool).
    pub fn terminate(&self) {
        self.dispatcher.cluster().terminate();
    }

    /// Serve on an already bound listener in this process until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<ExitReason, ServeError> {
        self.dispatcher.set_cluster(self.standalone());
        let info = ServerInfo {
            addr: listener.local_addr()?,
            scheme: self.config().scheme(),
            role: Role::Single,
            pid: std::process::id(),
        };
        info!(url = %info.url(), pid = info.pid, "Server listening");
        self.hooks.server_created(&info);
        Ok(serve(listener, Arc::clone(&self.dispatcher)).await)
    }

    /// Bind `addr` and serve, blocking the calling thread.
    ///
    /// With `process_num <= 0` this process serves alone and returns when it
    /// stops. Otherwise it becomes the master of `process_num` workers (this
    /// same executable started again) and returns once they are all gone. In
    /// a worker this never returns: the process exits when serving stops.
    pub fn listen(&self, addr: &str) -> Result<ExitReason, ServeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        if let Role::Worker { id } = Role::detect() {
            let addr = match std::env::var(LISTEN_ADDR_ENV) {
                Ok(assigned) => resolve(&assigned)?,
                Err(_) => resolve(addr)?,
            };
            if let Err(err) = signals::ignore_interrupt() {
                warn!(worker_id = id, error = %err, "Could not ignore SIGINT");
            }
            let outcome = block_on_worker(
                runtime,
                run_worker(
                    Arc::clone(&self.dispatcher),
                    self.hooks.clone(),
                    id,
                    addr,
                    tokio::io::stdin(),
                    tokio::io::stdout(),
                ),
            );
            match outcome {
                Ok(reason) => {
                    info!(worker_id = id, reason = %reason, "Worker exiting");
                    std::process::exit(0);
                }
                Err(err) => {
                    error!(worker_id = id, error = %err, "Worker failed");
                    std::process::exit(1);
                }
            }
        }

        let addr = resolve(addr)?;
        if self.config().process_num <= 0 {
            runtime.block_on(self.listen_single(addr))
        } else {
            runtime.block_on(self.listen_master(addr))
        }
    }

    async fn listen_single(&self, addr: SocketAddr) -> Result<ExitReason, ServeError> {
        let lifecycle = Arc::clone(self.lifecycle());
        lifecycle.set_role(Role::Single);
        if let Err(err) = signals::on_termination(move |_| {
            lifecycle.terminate();
            false
        }) {
            warn!(error = %err, "Could not install signal handlers");
        }
        let listener = bind_exclusive(addr)?;
        self.serve(listener).await
    }

    async fn listen_master(&self, addr: SocketAddr) -> Result<ExitReason, ServeError> {
        // Held for the lifetime of the pool so an ephemeral port stays ours.
        let (_reserved, bound) = reserve_port(addr)?;
        self.lifecycle().set_role(Role::Master);

        let supervisor = Supervisor::new(
            self.config().clone(),
            self.hooks.clone(),
            Arc::clone(&self.chain),
            bound,
        )?;
        self.dispatcher.set_cluster(supervisor.handle());
        supervisor.run().await?;
        Ok(ExitReason::Terminated)
    }
}

impl DefineRoutes for App {
    fn define(
        &self,
        method: Option<Method>,
        rule: &str,
        handler: RouteHandler,
    ) -> Result<Arc<Route>, PatternError> {
        let route = Arc::new(Route::new(method, rule, handler)?);
        self.dispatcher.add_route(Arc::clone(&route));
        Ok(route)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("dispatcher", &self.dispatcher)
            .field("chain", &self.chain)
            .field("hooks", &self.hooks)
            .finish()
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, ServeError> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .map_err(|err| ServeError::Address(format!("{addr}: {err}")))?
        .next()
        .ok_or_else(|| ServeError::Address(addr.to_string()))
}
