//! The client SSH session to the rendezvous server (§4.3).
//!
//! Grounded on the teacher's `ssh/mod.rs::establish_tunnel_session` for the
//! `russh::client::Config` shape (long-lived `inactivity_timeout: None` plus
//! a keepalive) and `authenticate` for the publickey-auth loop, trimmed down
//! to what a non-interactive daemon needs: no password fallback, no
//! terminal prompt, a single configured key rather than a priority list of
//! well-known filenames.

pub mod handler;
pub mod known_hosts;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{AuthResult, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use tracing::{debug, info, warn};

use crate::error::{TunnelError, TunnelResult};
use crate::keys;
use self::handler::{ForwardRegistry, Handler};

/// Keepalive interval sent to keep NAT/firewall state alive on an otherwise
/// silent control connection (§4.3). Matches the teacher's tunnel-session
/// constant.
const KEEPALIVE_INTERVAL_SECS: u64 = 30;
/// Missed keepalives tolerated before russh declares the session dead.
const KEEPALIVE_MAX: usize = 3;
/// How long to wait for the initial TCP connect + SSH handshake.
const CONNECT_TIMEOUT_SECS: u64 = 15;
/// Bind address for remote forwards (§6): the literal `0.0.0.0`, letting the
/// server listen on all interfaces.
const REMOTE_FORWARD_BIND_ADDR: &str = "0.0.0.0";

/// A long-lived client SSH session to the rendezvous server, re-established
/// on demand by `ensure_connected` (§4.3, §4.4 step 1a).
pub struct SshSession {
    host: String,
    port: u16,
    user: String,
    key: PrivateKey,
    host_keys_file: Option<PathBuf>,
    handle: Option<Handle<Handler>>,
    registry: Option<ForwardRegistry>,
}

impl SshSession {
    pub fn new(host: String, port: u16, user: String, key: PrivateKey, host_keys_file: Option<PathBuf>) -> Self {
        Self {
            host,
            port,
            user,
            key,
            host_keys_file,
            handle: None,
            registry: None,
        }
    }

    /// Ensure a live, authenticated session exists, (re)connecting if the
    /// current one is absent or dead (§4.4 step 1a). Returns the registry
    /// the handler reads when routing inbound forwarded connections, so the
    /// supervisor can register/deregister forward targets against it.
    pub async fn ensure_connected(&mut self) -> TunnelResult<ForwardRegistry> {
        if self.connected().await {
            return Ok(self.registry.clone().expect("connected implies a registry"));
        }

        info!(host = %self.host, port = self.port, user = %self.user, "connecting SSH session");
        let (handler, registry) = Handler::new(self.host.clone(), self.port, self.host_keys_file.clone());

        let config = Arc::new(russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(KEEPALIVE_INTERVAL_SECS)),
            keepalive_max: KEEPALIVE_MAX,
            ..<_>::default()
        });

        let connect_future = russh::client::connect(config, (self.host.as_str(), self.port), handler);
        let mut handle = match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect_future).await {
            Ok(result) => result.map_err(|e| TunnelError::Connect {
                host: self.host.clone(),
                port: self.port,
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(TunnelError::Connect {
                    host: self.host.clone(),
                    port: self.port,
                    reason: format!("timed out after {CONNECT_TIMEOUT_SECS}s"),
                });
            }
        };

        // Disables the `rsa-sha2-512`/`rsa-sha2-256` public-key algorithms
        // (§6) by forcing the legacy `ssh-rsa` (SHA-1) signature scheme,
        // carried forward from the source for server compatibility.
        let key = PrivateKeyWithHashAlg::new(Arc::new(self.key.clone()), Some(HashAlg::Sha1));
        match handle.authenticate_publickey(&self.user, key).await {
            Ok(AuthResult::Success) => {}
            Ok(AuthResult::Failure { .. }) => {
                return Err(TunnelError::Connect {
                    host: self.host.clone(),
                    port: self.port,
                    reason: format!("publickey authentication rejected for user '{}'", self.user),
                });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(host = %self.host, port = self.port, fingerprint = %keys::fingerprint(&self.key), "session authenticated");
        self.handle = Some(handle);
        self.registry = Some(registry.clone());
        Ok(registry)
    }

    /// Liveness probe: a closed transport is unambiguous, but an idle one
    /// needs an active round trip since `is_closed` only reflects state
    /// already observed by the transport read loop (§4.3).
    pub async fn connected(&mut self) -> bool {
        let Some(handle) = &self.handle else {
            return false;
        };
        if handle.is_closed() {
            return false;
        }
        handle.send_keepalive(false).await.is_ok()
    }

    /// Current session handle, if connected — used by the supervisor to
    /// issue `tcpip_forward`/`cancel_tcpip_forward` calls and to run the
    /// post-forward `tunnel` exec command (§4.4 steps 5-7).
    pub fn handle(&self) -> Option<&Handle<Handler>> {
        self.handle.as_ref()
    }

    pub fn registry(&self) -> Option<ForwardRegistry> {
        self.registry.clone()
    }

    /// Drop the session so the next `ensure_connected` reconnects from
    /// scratch (§4.4's Recovering state).
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.disconnect(russh::Disconnect::ByApplication, "", "").await;
        }
        self.registry = None;
        warn!(host = %self.host, port = self.port, "SSH session disconnected");
    }

    /// Request a remote port-forward with `bind_addr=0.0.0.0, remote_port=0`
    /// (§4.4 step 6, §6) letting the server pick the port. Returns the
    /// server-assigned port.
    pub async fn request_forward(&self, domain: &str) -> TunnelResult<u16> {
        let handle = self.handle.as_ref().ok_or_else(|| TunnelError::Forward {
            domain: domain.to_string(),
            reason: "no active SSH session".to_string(),
        })?;
        let bound = handle
            .tcpip_forward(REMOTE_FORWARD_BIND_ADDR, 0)
            .await
            .map_err(|e| TunnelError::Forward {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
        u16::try_from(bound).map_err(|_| TunnelError::Forward {
            domain: domain.to_string(),
            reason: format!("server assigned out-of-range port {bound}"),
        })
    }

    /// Cancel a previously-established remote port-forward (§4.4 step 5).
    /// Errors are swallowed by the caller per §4.4's "swallow per-tunnel
    /// errors" — this just surfaces them.
    pub async fn cancel_forward(&self, remote_port: u16) -> TunnelResult<()> {
        let Some(handle) = &self.handle else {
            return Ok(());
        };
        handle
            .cancel_tcpip_forward(REMOTE_FORWARD_BIND_ADDR, remote_port as u32)
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Run the post-forward `tunnel <domain> <remote_port>` exec request
    /// (§4.4 step 6, §6 "Remote command"). The server's response is not
    /// interpreted beyond its exit status, which is informational only.
    pub async fn run_tunnel_command(&self, domain: &str, remote_port: u16) -> TunnelResult<()> {
        let handle = self.handle.as_ref().ok_or_else(|| TunnelError::Forward {
            domain: domain.to_string(),
            reason: "no active SSH session".to_string(),
        })?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::Forward {
                domain: domain.to_string(),
                reason: format!("failed to open exec channel: {e}"),
            })?;
        channel
            .exec(true, format!("tunnel {domain} {remote_port}"))
            .await
            .map_err(|e| TunnelError::Forward {
                domain: domain.to_string(),
                reason: format!("failed to exec tunnel command: {e}"),
            })?;

        let (mut rx, _tx) = channel.split();
        let mut exit_status = None;
        loop {
            match rx.wait().await {
                Some(russh::ChannelMsg::ExitStatus { exit_status: code }) => {
                    exit_status = Some(code);
                }
                Some(russh::ChannelMsg::Eof | russh::ChannelMsg::Close) | None => break,
                _ => {}
            }
        }
        debug!(domain = %domain, remote_port, ?exit_status, "ran remote tunnel command");
        Ok(())
    }
}
