use std::fmt;

/// Failures that stop a server from starting or running.
#[derive(Debug)]
pub enum ServeError {
    /// Binding, accepting or runtime construction failed.
    Io(std::io::Error),
    /// Configuration could not be loaded.
    Config(crate::config::ConfigError),
    /// A worker process could not be spawned.
    Spawn { worker_id: usize, source: std::io::Error },
    /// The listen address could not be resolved.
    Address(String),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::Io(err) => write!(f, "I/O error: {err}"),
            ServeError::Config(err) => write!(f, "configuration error: {err}"),
            ServeError::Spawn { worker_id, source } => {
                write!(f, "failed to spawn worker {worker_id}: {source}")
            }
            ServeError::Address(addr) => write!(f, "cannot resolve listen address '{addr}'"),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServeError::Io(err) => Some(err),
            ServeError::Config(err) => Some(err),
            ServeError::Spawn { source, .. } => Some(source),
            ServeError::Address(_) => None,
        }
    }
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::Io(err)
    }
}

impl From<crate::config::ConfigError> for ServeError {
    fn from(err: crate::config::ConfigError) -> Self {
        ServeError::Config(err)
    }
}
