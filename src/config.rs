//! CLI surface and environment configuration (§6).
//!
//! The environment variable names and defaults are part of the external
//! contract and must match verbatim: `SSH_HOST`, `SSH_PORT`, `SSH_USER`,
//! `SSH_KEY_FILE`, `SSH_HOST_KEYS_FILE`, `LOG_LEVEL`. `clap`'s `env` feature
//! (already in the teacher's dependency table) binds each flag to the same
//! variable so `--ssh-host` and `SSH_HOST` are one knob, matching the
//! pattern the teacher uses throughout `cli.rs`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::Tunnel;

const DEFAULT_SSH_HOST: &str = "ssh.homeland-social.com";
const DEFAULT_SSH_PORT: &str = "2222";
const DEFAULT_SSH_USER: &str = "default";
const DEFAULT_LOG_LEVEL: &str = "DEBUG";
const DEFAULT_ADMIN_HTTP_ADDR: &str = "127.0.0.1:0";

#[derive(Parser, Debug)]
#[command(
    name = "tunnelward",
    version,
    about = "Reverse-tunnel agent: keeps a client-side SSH session to a rendezvous server and exposes local TCP endpoints as remote-forwarded domains."
)]
pub struct Cli {
    #[command(flatten)]
    pub ssh: SshArgs,

    /// Address the admin HTTP surface binds to (§4.6). Empty disables it.
    #[arg(long, env = "ADMIN_HTTP_ADDR", default_value = DEFAULT_ADMIN_HTTP_ADDR)]
    pub admin_http_addr: String,

    /// Disable the admin HTTP surface entirely, regardless of
    /// `--admin-http-addr`.
    #[arg(long)]
    pub no_admin_http: bool,

    /// Path to the control-IPC unix-domain socket (§4.5). Defaults to a
    /// fixed path under the OS temp directory (`ipc::default_socket_path`)
    /// so repeated driver invocations (`add`/`del`/`list`/`stop`) find the
    /// same running daemon rather than each expecting its own.
    #[arg(long, env = "TUNNELWARD_IPC_SOCKET")]
    pub ipc_socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Tunnels to declare at startup, as `domain:host:port`. Only valid in
    /// daemon mode (no subcommand).
    #[arg(value_name = "DOMAIN:HOST:PORT")]
    pub tunnels: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct SshArgs {
    #[arg(long, env = "SSH_HOST", default_value = DEFAULT_SSH_HOST)]
    pub host: String,

    #[arg(long, env = "SSH_PORT", default_value = DEFAULT_SSH_PORT)]
    pub port: u16,

    #[arg(long, env = "SSH_USER", default_value = DEFAULT_SSH_USER)]
    pub user: String,

    /// Path to the client private key. Generated on first use if missing.
    #[arg(long, env = "SSH_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Known-hosts file. Presence switches to strict host-key verification
    /// (§4.3); absence accepts any host key with a warning.
    #[arg(long, env = "SSH_HOST_KEYS_FILE")]
    pub host_keys_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

/// The control-IPC driver subcommands (§4.5). Each connects to — and, for
/// everything but `stop`, lazily spawns — a running `tunnelward` daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Declare (or replace) a tunnel.
    Add {
        /// `domain:host:port`
        spec: String,
    },
    /// Remove a tunnel by domain.
    Del { domain: String },
    /// List live tunnels.
    List,
    /// Stop the running daemon.
    Stop,
    /// Generate shell completions (ambient nicety, matching the teacher's
    /// own `Completions` subcommand).
    Completions { shell: Shell },
}

/// Parse a `domain:host:port` spec (§6). Invalid specs are a `ConfigError`
/// with a single-line message, matching "invalid specs exit nonzero with a
/// single-line message".
pub fn parse_tunnel_spec(spec: &str) -> TunnelResult<Tunnel> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    let [domain, host, port] = parts.as_slice() else {
        return Err(TunnelError::Config(format!(
            "invalid tunnel spec '{spec}': expected domain:host:port"
        )));
    };
    if domain.is_empty() {
        return Err(TunnelError::Config(format!(
            "invalid tunnel spec '{spec}': domain must not be empty"
        )));
    }
    if host.is_empty() {
        return Err(TunnelError::Config(format!(
            "invalid tunnel spec '{spec}': host must not be empty"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        TunnelError::Config(format!("invalid tunnel spec '{spec}': port must be 1-65535"))
    })?;
    if port == 0 {
        return Err(TunnelError::Config(format!(
            "invalid tunnel spec '{spec}': port must be 1-65535"
        )));
    }
    Ok(Tunnel::new(*domain, *host, port))
}
