//! The tunnel supervisor (§4.4) — the single control loop that owns the SSH
//! session and the live-forward table, reconciling desired state against it.
//!
//! Grounded on `examples/original_source/client/conduit_client/ssh.py`'s
//! `SSHManager` (`_check_connection`/`_setup_tunnel`/`add_tunnel`/`del_tunnel`/
//! `poll`) for the reconcile-and-poll shape, and on the pack's
//! `other_examples/fa4eafc1_miiy-ssh-tunnel-manager__src-supervisor.rs.rs`
//! for the `tokio::sync::watch` shutdown-broadcast idiom used here instead
//! of the source's daemon-thread-plus-`os._exit` approach.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ipc::ListLiveRequest;
use crate::ssh::SshSession;
use crate::ssh::handler::{ForwardRegistry, ForwardTarget};
use crate::tunnel::{DesiredState, Tunnel};

/// Poll cadence while at least one forward is live (§4.4 "Poll cadence").
const POLL_ACTIVE: Duration = Duration::from_millis(100);
/// Poll cadence while idle (no live forwards).
const POLL_IDLE: Duration = Duration::from_secs(10);

/// The supervisor's state machine (§4.4), tracked only for observability —
/// transitions are a side effect of reconciliation, not a separate control
/// structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Serving,
    Recovering,
}

/// The tunnel supervisor: single control loop driving opens/closes of
/// remote forwards against a desired-state table (§4.4).
pub struct Supervisor {
    desired: std::sync::Arc<DesiredState>,
    session: SshSession,
    /// Live forwards: domain -> the `Tunnel` as currently established,
    /// `remote_port` stamped with the server-assigned value.
    live: HashMap<String, Tunnel>,
    state: State,
    /// `list` requests arriving over the control IPC (§4.5): answered
    /// directly from `live` since the desired-state table doesn't carry
    /// server-assigned `remote_port`s or reflect in-flight reconciliation.
    list_requests: mpsc::Receiver<ListLiveRequest>,
}

impl Supervisor {
    pub fn new(
        desired: std::sync::Arc<DesiredState>,
        session: SshSession,
        list_requests: mpsc::Receiver<ListLiveRequest>,
    ) -> Self {
        Self {
            desired,
            session,
            live: HashMap::new(),
            state: State::Idle,
            list_requests,
        }
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "supervisor state transition");
            self.state = next;
        }
    }

    /// Run the control loop until `shutdown` is signaled (§5 "Shutdown is
    /// cooperative").
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let poll_timeout = if self.live.is_empty() {
                POLL_IDLE
            } else {
                POLL_ACTIVE
            };

            tokio::select! {
                _ = self.desired.wait(poll_timeout) => {}
                _ = shutdown.changed() => {}
                request = self.list_requests.recv() => {
                    if let Some(ListLiveRequest(reply)) = request {
                        let _ = reply.send(self.live.values().cloned().collect());
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            if self.desired.has_changed().await {
                self.reconcile().await;
            } else if !self.live.is_empty() {
                self.poll_liveness().await;
            }
        }

        info!("supervisor shutting down: canceling all forwards");
        self.cancel_all().await;
        self.session.disconnect().await;
    }

    /// Reconciliation algorithm (§4.4, atomic per tick).
    async fn reconcile(&mut self) {
        let desired_snapshot = self.desired.snapshot().await;
        self.desired.take_changed().await;

        if desired_snapshot.is_empty() {
            self.cancel_all().await;
            self.session.disconnect().await;
            self.transition(State::Idle);
            return;
        }

        let registry = match self.session.ensure_connected().await {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "failed to connect SSH session, will retry next tick");
                return;
            }
        };

        let (remove, add) = diff(&desired_snapshot, &self.live);

        for domain in &remove {
            self.cancel_one(domain).await;
        }
        for tunnel in add {
            self.add_one(tunnel, &registry).await;
        }

        self.transition(if self.live.is_empty() {
            State::Idle
        } else {
            State::Serving
        });
    }

    /// Establish one forward end to end (§4.4 steps 6-7): request the
    /// remote port-forward, run the post-forward `tunnel` exec command,
    /// then register the domain in the handler's forward registry so
    /// inbound channels route to the right local endpoint.
    async fn add_one(&mut self, mut tunnel: Tunnel, registry: &ForwardRegistry) {
        let remote_port = match self.session.request_forward(&tunnel.domain).await {
            Ok(port) => port,
            Err(e) => {
                warn!(domain = %tunnel.domain, error = %e, "failed to request remote forward, abandoning for this tick");
                return;
            }
        };

        if let Err(e) = self.session.run_tunnel_command(&tunnel.domain, remote_port).await {
            warn!(domain = %tunnel.domain, error = %e, "tunnel exec command failed, canceling forward");
            let _ = self.session.cancel_forward(remote_port).await;
            return;
        }

        tunnel.remote_port = remote_port;
        registry.lock().await.insert(
            remote_port as u32,
            ForwardTarget {
                domain: tunnel.domain.clone(),
                host: tunnel.host.clone(),
                port: tunnel.port,
            },
        );
        info!(domain = %tunnel.domain, remote_port, local = %format!("{}:{}", tunnel.host, tunnel.port), "forward established");
        self.live.insert(tunnel.domain.clone(), tunnel);
    }

    /// Cancel one live forward (§4.4 step 5). Swallows per-tunnel errors.
    async fn cancel_one(&mut self, domain: &str) {
        let Some(tunnel) = self.live.remove(domain) else {
            return;
        };
        if let Err(e) = self.session.cancel_forward(tunnel.remote_port).await {
            warn!(domain, error = %e, "failed to cancel remote forward");
        }
        if let Some(registry) = self.session.registry() {
            registry.lock().await.remove(&(tunnel.remote_port as u32));
        }
        debug!(domain, "forward canceled");
    }

    async fn cancel_all(&mut self) {
        let domains: Vec<String> = self.live.keys().cloned().collect();
        for domain in domains {
            self.cancel_one(&domain).await;
        }
    }

    /// Liveness probe on the active poll path (§4.4 Serving -> Recovering).
    async fn poll_liveness(&mut self) {
        if self.session.connected().await {
            return;
        }
        warn!("transport lost while forwards are live, entering Recovering");
        self.transition(State::Recovering);
        self.recover().await;
    }

    /// Recovering: reconnect and re-register every previously live forward,
    /// which may receive new `remote_port` values (§4.4, "Connection
    /// liveness" property in §8).
    async fn recover(&mut self) {
        self.session.disconnect().await;
        let registry = match self.session.ensure_connected().await {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "reconnect failed, will retry next tick");
                return;
            }
        };

        let stale: Vec<Tunnel> = self.live.drain().map(|(_, t)| t).collect();
        for tunnel in stale {
            self.add_one(tunnel, &registry).await;
        }

        self.transition(if self.live.is_empty() {
            State::Idle
        } else {
            State::Serving
        });
    }
}

/// Pure diff step of reconciliation (§4.4 step 2): a tunnel present in both
/// but with a different `(host, port)` is placed in both `remove` and `add`
/// (remove first), since `Tunnel`'s `PartialEq` is structural over
/// `(domain, host, port)`.
fn diff(desired: &HashMap<String, Tunnel>, live: &HashMap<String, Tunnel>) -> (Vec<String>, Vec<Tunnel>) {
    let mut remove = Vec::new();
    for (domain, live_tunnel) in live {
        match desired.get(domain) {
            None => remove.push(domain.clone()),
            Some(desired_tunnel) if desired_tunnel != live_tunnel => remove.push(domain.clone()),
            Some(_) => {}
        }
    }

    let mut add = Vec::new();
    for (domain, desired_tunnel) in desired {
        match live.get(domain) {
            None => add.push(desired_tunnel.clone()),
            Some(live_tunnel) if live_tunnel != desired_tunnel => add.push(desired_tunnel.clone()),
            Some(_) => {}
        }
    }

    (remove, add)
}
