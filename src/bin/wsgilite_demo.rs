//! Demo server exercising routes, middleware, the three handler shapes,
//! route timeouts and delegation to the master.

use anyhow::Context as _;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use wsgilite::logging::{init_logging, LogConfig};
use wsgilite::{
    step, App, DefineRoutes, DelegateHandler, Reply, RouteHandler, ServerConfig, Steps,
};

#[derive(Parser, Debug)]
#[command(name = "wsgilite-demo")]
#[command(about = "wsgilite demo server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "WSGILITE_DEMO_ADDR")]
    addr: String,

    /// Worker processes; 0 serves from this process alone
    #[arg(long)]
    processes: Option<i32>,

    /// Requests a worker serves before it is replaced (0 = never)
    #[arg(long)]
    serve_limit: Option<u64>,

    /// TOML or YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Kill workers on terminate instead of asking them to exit
    #[arg(long, default_value_t = false)]
    hard_exit: bool,

    /// Include error details in 500 responses
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Timeout of the /slow route
    #[arg(long, default_value_t = 1_000)]
    timeout_ms: i64,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::from_env(),
        };
        if let Some(processes) = self.processes {
            config.process_num = processes;
        }
        if let Some(limit) = self.serve_limit {
            config.worker_serve_times_to_restart = limit;
        }
        if self.hard_exit {
            config.soft_exit_worker = false;
        }
        config.debug |= self.debug;
        Ok(config)
    }
}

fn build_app(args: &Args, config: ServerConfig) -> anyhow::Result<App> {
    let mut app = App::new(config);

    app.on_server_created(|info| {
        info!(url = %info.url(), role = ?info.role, pid = info.pid, "Demo server ready");
    });
    app.on_master_message(|worker_id, payload| {
        info!(worker_id, payload = %payload, "Demo master got a message");
    });

    app.add_middleware(
        None,
        RouteHandler::from_fn(|ex| {
            ex.response.set_header("x-served-by", &std::process::id().to_string())?;
            Ok(Reply::Empty)
        }),
    );

    app.get(
        "/",
        RouteHandler::from_fn(|_| Ok(Reply::from("hello from wsgilite"))),
    )?;
    app.get(
        "/user/:id(/:tab)",
        RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))),
    )?;
    app.get(
        "/async",
        RouteHandler::from_async(|ex| async move {
            tokio::task::yield_now().await;
            Ok(Reply::json(&json!({ "path": ex.context.url_path() }))?)
        }),
    )?;
    app.get(
        "/steps",
        RouteHandler::from_steps(|ex| {
            let path = ex.context.url_path();
            Steps::new(vec![
                step(async { Ok(Reply::Empty) }),
                step(async move { Ok(Reply::Json(json!({ "path": path }))) }),
            ])
        }),
    )?;
    app.get(
        "/slow",
        RouteHandler::from_async(|ex| async move {
            let ms = ex
                .context
                .get_str("ms")
                .and_then(|ms| ms.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Reply::from(format!("slept {ms}ms")))
        }),
    )?
    .set_timeout_ms(args.timeout_ms)
    .set_timeout_message("too slow");
    app.post(
        "/form",
        RouteHandler::from_fn(|ex| Ok(Reply::from(&ex.context))),
    )?;
    app.get(
        "/fail",
        RouteHandler::from_fn(|_| Err(anyhow::anyhow!("demo failure"))),
    )?;
    app.get(
        "/delegate",
        RouteHandler::from_async(|ex| async move {
            let results = ex
                .request_action_on_master(json!({ "op": "whoami" }), Some(Duration::from_secs(5)))
                .await?;
            Ok(Reply::Json(json!({
                "worker_pid": std::process::id(),
                "results": results,
            })))
        }),
    )?;
    app.get(
        "/notify",
        RouteHandler::from_fn(|ex| {
            let sent = ex.cluster().notify_master(json!({ "from": std::process::id() }));
            Ok(Reply::Json(json!({ "sent": sent })))
        }),
    )?;
    app.get(
        "/terminate",
        RouteHandler::from_fn(|ex| {
            ex.response.send(
                http::StatusCode::OK,
                "text/plain; charset=utf-8",
                "terminating",
            );
            ex.cluster().terminate();
            Ok(Reply::Empty)
        }),
    )?;

    app.add_delegate_handler(DelegateHandler::from_fn(|call| {
        Ok(Reply::Json(json!({
            "master_pid": std::process::id(),
            "origin": call.origin,
            "op": call.payload.get("op").cloned(),
        })))
    }));

    Ok(app)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&LogConfig::from_env())?;
    let config = args.server_config()?;
    let app = build_app(&args, config)?;
    let reason = app.listen(&args.addr)?;
    info!(reason = %reason, "Demo server stopped");
    Ok(())
}
