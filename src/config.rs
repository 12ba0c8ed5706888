//! # Server Configuration
//!
//! [`ServerConfig`] is built once and is immutable afterwards. Values are
//! layered, later sources win:
//!
//! 1. defaults ([`ServerConfig::default`])
//! 2. an optional TOML or YAML file ([`ServerConfig::from_file`])
//! 3. environment variables ([`ServerConfig::with_env_overrides`])
//!
//! ## Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `WSGILITE_PROCESS_NUM` | `process_num` |
//! | `WSGILITE_HTTPS` | `https` |
//! | `WSGILITE_SERVE_TIMES_TO_RESTART` | `worker_serve_times_to_restart` |
//! | `WSGILITE_SOFT_EXIT_WORKER` | `soft_exit_worker` |
//! | `WSGILITE_DEBUG` | `debug` |
//! | `WSGILITE_LOG_PROCESS_MESSAGE` | `log_process_message` |
//! | `WSGILITE_ENABLE_FORM_PARSING` | `enable_form_parsing` |
//! | `WSGILITE_MAX_BODY_BYTES` | `max_body_bytes` |
//! | `WSGILITE_SHUTDOWN_GRACE_MS` | `shutdown_grace_ms` |
//!
//! ## Example
//!
//! ```toml
//! process_num = 4
//! worker_serve_times_to_restart = 10000
//! soft_exit_worker = true
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker processes to fork. Zero or negative serves from the calling
    /// process without a master.
    pub process_num: i32,
    /// Report `https` as the scheme. TLS itself is terminated upstream.
    pub https: bool,
    /// Requests a worker finishes before it exits and gets replaced.
    /// Zero disables the limit.
    pub worker_serve_times_to_restart: u64,
    /// Ask workers to exit over the control channel instead of killing them.
    pub soft_exit_worker: bool,
    /// Append error details to 500 responses.
    pub debug: bool,
    /// Log every message crossing the master/worker channel.
    pub log_process_message: bool,
    /// Decode urlencoded, JSON and multipart bodies into the context.
    pub enable_form_parsing: bool,
    /// Requests with larger bodies get a 413.
    pub max_body_bytes: usize,
    /// How long a draining server waits for open connections.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            process_num: i32::try_from(num_cpus::get()).unwrap_or(1),
            https: false,
            worker_serve_times_to_restart: 0,
            soft_exit_worker: true,
            debug: false,
            log_process_message: false,
            enable_form_parsing: true,
            max_body_bytes: 10 * 1024 * 1024,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Failure loading a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Toml(toml::de::Error),
    Yaml(serde_yaml::Error),
    UnknownFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(err) => write!(f, "cannot read config file: {err}"),
            ConfigError::Toml(err) => write!(f, "invalid TOML config: {err}"),
            ConfigError::Yaml(err) => write!(f, "invalid YAML config: {err}"),
            ConfigError::UnknownFormat(ext) => {
                write!(f, "unsupported config file extension '{ext}' (expected toml, yaml or yml)")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    /// Defaults overlaid with `WSGILITE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load a TOML or YAML file (by extension), then apply environment
    /// overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let config: ServerConfig = match ext.as_str() {
            "toml" => toml::from_str(&text).map_err(ConfigError::Toml)?,
            "yaml" | "yml" => serde_yaml::from_str(&text).map_err(ConfigError::Yaml)?,
            other => return Err(ConfigError::UnknownFormat(other.to_string())),
        };
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|v| v.trim().parse().ok())
        }
        fn flag(raw: Option<String>) -> Option<bool> {
            raw.and_then(|v| match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
        }

        if let Some(v) = parse(lookup("WSGILITE_PROCESS_NUM")) {
            self.process_num = v;
        }
        if let Some(v) = flag(lookup("WSGILITE_HTTPS")) {
            self.https = v;
        }
        if let Some(v) = parse(lookup("WSGILITE_SERVE_TIMES_TO_RESTART")) {
            self.worker_serve_times_to_restart = v;
        }
        if let Some(v) = flag(lookup("WSGILITE_SOFT_EXIT_WORKER")) {
            self.soft_exit_worker = v;
        }
        if let Some(v) = flag(lookup("WSGILITE_DEBUG")) {
            self.debug = v;
        }
        if let Some(v) = flag(lookup("WSGILITE_LOG_PROCESS_MESSAGE")) {
            self.log_process_message = v;
        }
        if let Some(v) = flag(lookup("WSGILITE_ENABLE_FORM_PARSING")) {
            self.enable_form_parsing = v;
        }
        if let Some(v) = parse(lookup("WSGILITE_MAX_BODY_BYTES")) {
            self.max_body_bytes = v;
        }
        if let Some(v) = parse(lookup("WSGILITE_SHUTDOWN_GRACE_MS")) {
            self.shutdown_grace_ms = v;
        }
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Whether channel traffic between master and workers is logged.
    pub fn logs_process_messages(&self) -> bool {
        self.log_process_message || self.debug
    }

    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}

/// What a server reports once it is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub addr: SocketAddr,
    pub scheme: &'static str,
    pub role: Role,
    pub pid: u32,
}

impl ServerInfo {
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.addr)
    }
}

type ServerCreatedHook = Arc<dyn Fn(&ServerInfo) + Send + Sync>;
type MasterMessageHook = Arc<dyn Fn(usize, &Value) + Send + Sync>;
type WorkerMessageHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callbacks into application code at lifecycle points.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Called in every serving process once its listener is bound.
    pub on_server_created: Option<ServerCreatedHook>,
    /// Called in the master for each `CUSTOM` message a worker sends.
    pub on_master_message: Option<MasterMessageHook>,
    /// Called in a worker for each `CUSTOM` message the master sends.
    pub on_worker_message: Option<WorkerMessageHook>,
}

impl Hooks {
    pub fn server_created(&self, info: &ServerInfo) {
        if let Some(hook) = &self.on_server_created {
            hook(info);
        }
    }

    pub fn master_message(&self, worker_id: usize, payload: &Value) {
        if let Some(hook) = &self.on_master_message {
            hook(worker_id, payload);
        }
    }

    pub fn worker_message(&self, payload: &Value) {
        if let Some(hook) = &self.on_worker_message {
            hook(payload);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_server_created", &self.on_server_created.is_some())
            .field("on_master_message", &self.on_master_message.is_some())
            .field("on_worker_message", &self.on_worker_message.is_some())
            .finish()
    }
}
