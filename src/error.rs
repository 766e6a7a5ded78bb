use thiserror::Error;

/// Result type alias for tunnelward operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Domain error kinds (§7). Each variant carries the affected domain where
/// one exists, so callers can log or report without re-deriving context.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Host unreachable, auth failed, or host-key mismatch/rejection.
    /// Recovered locally by the supervisor's reconnect logic.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// Server refused a port-forward, or the subsequent `tunnel` exec failed.
    /// The tunnel is abandoned for this reconciliation tick only.
    #[error("failed to establish forward for domain '{domain}': {reason}")]
    Forward { domain: String, reason: String },

    /// A single inbound connection failed to reach its local endpoint, or
    /// died mid-stream. Tears down that one pair only.
    #[error("connection for domain '{domain}' failed: {reason}")]
    Channel { domain: String, reason: String },

    /// Liveness probe failed, or EOF on the transport. Triggers Recovering.
    #[error("SSH transport lost: {0}")]
    Transport(String),

    /// Malformed control-IPC frame or unknown command.
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// Unparseable CLI argument, or a missing known-hosts file when strict
    /// host-key checking was requested. Exits before entering the loop.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Transport(err.to_string())
    }
}
