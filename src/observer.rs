//! Observer sink
//!
//! Human-readable status reporting for auth attempts, lifecycle notices,
//! bridge failures and command-runner output. Implementations are shared
//! across every connection task, so they must be `Send + Sync` and must
//! not block.

use std::fmt;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Output stream of the command-runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Something worth telling the user about
#[derive(Debug, Clone)]
pub enum Event {
    /// Listener bound
    Listening { port: u16 },
    /// A bind attempt failed and the next port will be probed
    BindFailed { port: u16, error: String },
    /// Authentication attempt, accepted or not
    AuthAttempt {
        method: &'static str,
        remote: SocketAddr,
        local: SocketAddr,
        user: String,
        accepted: bool,
    },
    /// Handshake or transport failure on one connection
    ConnectionFailed { remote: SocketAddr, error: String },
    /// Exec request finished with a status from the backend
    ExecFinished { command: String, status: u32 },
    /// Exec request failed on the backend side
    ExecFailed { command: String, error: String },
    /// SFTP operation failed on the backend side
    SftpFailed {
        operation: &'static str,
        path: String,
        error: String,
    },
    /// SFTP helper process failed to start or exited badly
    HelperFailed { command: String, error: String },
    /// Shutdown signal fired
    ShuttingDown,
    /// One line of command-runner output
    RunnerOutput { stream: OutputStream, line: String },
    /// Free-form notice
    Message(String),
}

impl Event {
    /// Whether the event describes a failure
    pub fn is_failure(&self) -> bool {
        match self {
            Event::BindFailed { .. }
            | Event::ConnectionFailed { .. }
            | Event::ExecFailed { .. }
            | Event::SftpFailed { .. }
            | Event::HelperFailed { .. } => true,
            Event::AuthAttempt { accepted, .. } => !accepted,
            Event::RunnerOutput { stream, .. } => *stream == OutputStream::Stderr,
            _ => false,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Listening { port } => write!(f, "SSH proxy listening on 127.0.0.1:{}", port),
            Event::BindFailed { port, error } => {
                write!(f, "unable to bind 127.0.0.1:{}: {}", port, error)
            }
            Event::AuthAttempt {
                method,
                remote,
                local,
                user,
                accepted,
            } => write!(
                f,
                "authentication attempt from {} to {} as {} using {}: {}",
                remote,
                local,
                user,
                method,
                if *accepted { "accepted" } else { "rejected" }
            ),
            Event::ConnectionFailed { remote, error } => {
                write!(f, "connection from {} failed: {}", remote, error)
            }
            Event::ExecFinished { command, status } => {
                write!(f, "command '{}' exited with status {}", command, status)
            }
            Event::ExecFailed { command, error } => {
                write!(f, "command '{}' failed: {}", command, error)
            }
            Event::SftpFailed {
                operation,
                path,
                error,
            } => write!(f, "sftp {} {} failed: {}", operation, path, error),
            Event::HelperFailed { command, error } => {
                write!(f, "sftp helper '{}' failed: {}", command, error)
            }
            Event::ShuttingDown => write!(f, "shutting down the SSH proxy"),
            Event::RunnerOutput { line, .. } => write!(f, "{}", line),
            Event::Message(msg) => write!(f, "{}", msg),
        }
    }
}

/// Sink for [`Event`]s
pub trait Observer: Send + Sync {
    fn report(&self, event: &Event);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn report(&self, event: &Event) {
        if event.is_failure() {
            warn!("{}", event);
        } else {
            info!("{}", event);
        }
    }
}

/// Keeps every reported line in memory
#[derive(Debug, Default)]
pub struct MemoryObserver {
    lines: Mutex<Vec<String>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines reported so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any reported line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl Observer for MemoryObserver {
    fn report(&self, event: &Event) {
        self.lines.lock().push(event.to_string());
    }
}
