//! The russh `client::Handler` implementation (§4.3, §4.4 step 7).
//!
//! Grounded on the teacher's `ssh/client.rs` (a `client::Handler` stub that
//! only implements `check_server_key`) and, for the forwarded-tcpip side the
//! teacher never finished, on two pack examples that implement the same
//! callback end to end: `other_examples/2b3a74d5_Xiechengqi-miao__src-
//! tcp_tunnel.rs.rs` and the testcontainers `host.rs` host-port-exposure
//! handler. Both dial the local target and hand the connection off to a
//! spawned task rather than awaiting the copy loop inline — the design note
//! in §9 ("the design avoids holding the supervisor's lock during
//! channel-open by making the callback allocate a Forwarder and hand it to
//! an independent runtime") is the same constraint Xiechengqi's comment
//! states directly: awaiting I/O inside this callback can stall the
//! session's packet processing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelId};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::forwarder;
use crate::ssh::known_hosts::{self, HostKeyStatus};

/// What a live remote-forwarded port maps back to locally.
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    pub domain: String,
    pub host: String,
    pub port: u16,
}

/// Shared registry from server-assigned remote port to forward target.
/// Populated by the supervisor when a forward is established (§4.4 step 6)
/// and removed when it is canceled (§4.4 step 5). Read only by the handler
/// callback below — the two sides never race because the supervisor is the
/// only writer and the handler only reads.
pub type ForwardRegistry = Arc<Mutex<HashMap<u32, ForwardTarget>>>;

/// The `russh::client::Handler` for a tunnelward session.
#[derive(Clone)]
pub struct Handler {
    host: String,
    port: u16,
    host_keys_file: Option<PathBuf>,
    registry: ForwardRegistry,
}

impl Handler {
    pub fn new(host: String, port: u16, host_keys_file: Option<PathBuf>) -> (Self, ForwardRegistry) {
        let registry: ForwardRegistry = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                host,
                port,
                host_keys_file,
                registry: registry.clone(),
            },
            registry,
        )
    }
}

impl client::Handler for Handler {
    type Error = TunnelError;

    /// Strict verification against `SSH_HOST_KEYS_FILE` when configured;
    /// otherwise accept with a warning (§4.3).
    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let Some(known_hosts_path) = &self.host_keys_file else {
            warn!(host = %self.host, port = self.port, "no known-hosts file configured, trusting host key");
            return Ok(true);
        };

        match known_hosts::check_host_key(known_hosts_path, &self.host, self.port, server_public_key) {
            Ok(HostKeyStatus::Known) => Ok(true),
            Ok(HostKeyStatus::Unknown { fingerprint, key_type }) => {
                warn!(host = %self.host, %fingerprint, %key_type, "host key not in known-hosts file, rejecting");
                Ok(false)
            }
            Ok(HostKeyStatus::Changed { fingerprint_new, known_hosts_line }) => {
                warn!(
                    host = %self.host, fingerprint = %fingerprint_new, line = known_hosts_line,
                    "host key CHANGED since last connection, rejecting (possible MITM)"
                );
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "failed to check known-hosts file, rejecting");
                Ok(false)
            }
        }
    }

    /// Inbound connection for one of our remote forwards (§4.4 step 7).
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let target = self.registry.lock().await.get(&connected_port).cloned();
        let Some(target) = target else {
            warn!(
                connected_port,
                originator = %format!("{originator_address}:{originator_port}"),
                "forwarded-tcpip for unknown remote port, dropping"
            );
            return Ok(());
        };

        tokio::spawn(async move {
            debug!(
                domain = %target.domain, local = %format!("{}:{}", target.host, target.port),
                "dialing local endpoint for forwarded connection"
            );
            match TcpStream::connect((target.host.as_str(), target.port)).await {
                Ok(socket) => forwarder::run(target.domain, channel, socket).await,
                Err(e) => {
                    let err = TunnelError::Channel {
                        domain: target.domain.clone(),
                        reason: e.to_string(),
                    };
                    warn!(domain = %target.domain, error = %err, "closing channel");
                }
            }
        });

        Ok(())
    }

    /// We never initiate channels of our own besides the keepalive probe's
    /// session channel, so close requests on server-initiated channels are
    /// logged at debug and otherwise ignored.
    async fn channel_close(&mut self, channel: ChannelId, _session: &mut client::Session) -> Result<(), Self::Error> {
        debug!(?channel, "channel closed");
        Ok(())
    }
}
