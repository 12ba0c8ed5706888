//! OS signals and worker exit analysis.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use tracing::{debug, info};

#[cfg(unix)]
pub use signal_hook::consts::{SIGINT, SIGTERM};

/// Run `on_signal` on a background thread for each SIGINT/SIGTERM until it
/// returns false. Registering replaces the default "terminate the process"
/// action for those signals.
#[cfg(unix)]
pub fn on_termination<F>(mut on_signal: F) -> io::Result<()>
where
    F: FnMut(i32) -> bool + Send + 'static,
{
    let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("wsgilite-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                info!(signal, "Termination signal received");
                if !on_signal(signal) {
                    break;
                }
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
pub fn on_termination<F>(_on_signal: F) -> io::Result<()>
where
    F: FnMut(i32) -> bool + Send + 'static,
{
    Ok(())
}

/// Keep SIGINT (Ctrl-C on the terminal's process group) from killing a
/// worker; the master coordinates shutdown instead.
#[cfg(unix)]
pub fn ignore_interrupt() -> io::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([SIGINT])?;
    std::thread::Builder::new()
        .name("wsgilite-sigint".into())
        .spawn(move || {
            for signal in signals.forever() {
                debug!(signal, "Ignoring interrupt in worker");
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
pub fn ignore_interrupt() -> io::Result<()> {
    Ok(())
}

/// Why a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(i32),
    Unknown,
}

impl TerminationReason {
    pub fn from_status(status: &ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return TerminationReason::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return TerminationReason::Signaled(signal);
            }
        }
        TerminationReason::Unknown
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminationReason::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Exited(code) => write!(f, "exited with code {code}"),
            TerminationReason::Signaled(signal) => write!(f, "killed by signal {signal}"),
            TerminationReason::Unknown => f.write_str("unknown reason"),
        }
    }
}
