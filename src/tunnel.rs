//! The `Tunnel` value type and the desired-state table (§3, §4.2).
//!
//! Grounded on `examples/original_source/client/conduit_client/tunnel.py`:
//! `Tunnel` is the `(domain, host, port, remote_port)` record and `Tunnels`
//! is a dict subclass that sets a `threading.Event` on any mutation that
//! changes its observable contents. Here the dict becomes a `HashMap` behind
//! a `tokio::sync::Mutex`, and the `Event` becomes a `tokio::sync::Notify`
//! paired with a boolean flag so the signal stays level-triggered (a waiter
//! that arrives after the flag was set still observes it) rather than
//! edge-triggered the way a bare `Notify` is.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

/// A desired-state tunnel record (§3).
///
/// Equality is structural over `(domain, host, port)`: `remote_port` is
/// metadata stamped in once the forward is live and is excluded so that
/// re-declaring an identical tunnel is a no-op (§4.2, "Idempotent add").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub domain: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub remote_port: u16,
}

impl Tunnel {
    pub fn new(domain: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            host: host.into(),
            port,
            remote_port: 0,
        }
    }

    /// The `(host, port)` half of the key used when diffing desired vs.
    /// live forwards (§4.4 step 2).
    fn endpoint(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain && self.endpoint() == other.endpoint()
    }
}
impl Eq for Tunnel {}

impl std::fmt::Display for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}:{}", self.domain, self.host, self.port)
    }
}

struct Inner {
    tunnels: HashMap<String, Tunnel>,
    changed: bool,
}

/// The desired-state table: the authoritative mapping from domain to
/// `Tunnel` that the supervisor reconciles against (§4.2).
pub struct DesiredState {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self::new()
    }
}

impl DesiredState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tunnels: HashMap::new(),
                changed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Seed the table at startup (e.g. from CLI `domain:host:port` specs)
    /// without needing to await a reconciliation wake-up for the first tick.
    pub async fn seed(&self, tunnels: impl IntoIterator<Item = Tunnel>) {
        let mut inner = self.inner.lock().await;
        for t in tunnels {
            inner.tunnels.insert(t.domain.clone(), t);
        }
        if !inner.tunnels.is_empty() {
            inner.changed = true;
            self.notify.notify_one();
        }
    }

    pub async fn get(&self, domain: &str) -> Option<Tunnel> {
        self.inner.lock().await.tunnels.get(domain).cloned()
    }

    /// Insert or update. Raises `changed` iff the new value is not
    /// structurally equal to the prior value (absence counts as unequal).
    /// Returns whether this call itself was a change, so callers that need
    /// to know without disturbing the shared `changed` signal (e.g. the
    /// admin HTTP handlers' 201-vs-200 split) don't have to touch
    /// `take_changed`.
    pub async fn set(&self, tunnel: Tunnel) -> bool {
        let mut inner = self.inner.lock().await;
        let prior = inner.tunnels.get(&tunnel.domain);
        let is_change = prior != Some(&tunnel);
        inner.tunnels.insert(tunnel.domain.clone(), tunnel);
        if is_change {
            inner.changed = true;
            self.notify.notify_one();
        }
        is_change
    }

    /// Raises `changed` iff the key existed.
    pub async fn delete(&self, domain: &str) -> Option<Tunnel> {
        let mut inner = self.inner.lock().await;
        let removed = inner.tunnels.remove(domain);
        if removed.is_some() {
            inner.changed = true;
            self.notify.notify_one();
        }
        removed
    }

    /// Raises `changed` iff the table was non-empty.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let had_entries = !inner.tunnels.is_empty();
        inner.tunnels.clear();
        if had_entries {
            inner.changed = true;
            self.notify.notify_one();
        }
    }

    /// Atomically swap contents. Raises `changed` iff the new contents
    /// differ from the old as a set of `(domain, host, port)` triples —
    /// i.e. under the same structural equality `Tunnel::eq` uses, not a
    /// reference-identity compare. Returns whether this call was a change,
    /// same rationale as `set`.
    pub async fn replace(&self, tunnels: HashMap<String, Tunnel>) -> bool {
        let mut inner = self.inner.lock().await;
        let is_change = !same_contents(&inner.tunnels, &tunnels);
        inner.tunnels = tunnels;
        if is_change {
            inner.changed = true;
            self.notify.notify_one();
        }
        is_change
    }

    /// A stable copy under the mutation lock (§4.2 `snapshot()`).
    pub async fn snapshot(&self) -> HashMap<String, Tunnel> {
        self.inner.lock().await.tunnels.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.tunnels.is_empty()
    }

    /// Peek at the changed flag without clearing it.
    pub async fn has_changed(&self) -> bool {
        self.inner.lock().await.changed
    }

    /// Atomically read and clear the changed flag. Called by the supervisor
    /// at the start of reconciliation (§4.2, §4.4 step 1).
    pub async fn take_changed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        std::mem::replace(&mut inner.changed, false)
    }

    /// Block until `changed` is set or `timeout` elapses, whichever comes
    /// first. Returns whether the signal was observed set. Does not clear
    /// it — clearing happens via `take_changed` at the top of a
    /// reconciliation pass, keeping the two operations distinct so a waiter
    /// woken by the notify and a waiter that later calls `take_changed`
    /// agree on what "changed" means.
    pub async fn wait(&self, timeout: Duration) {
        if self.has_changed().await {
            return;
        }
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }
}

/// Set-equality over `(domain, host, port)` triples, per §4.2 `replace`.
fn same_contents(a: &HashMap<String, Tunnel>, b: &HashMap<String, Tunnel>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(domain, t)| b.get(domain) == Some(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idempotent_add() {
        let table = DesiredState::new();
        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        assert!(table.take_changed().await);

        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        assert!(!table.has_changed().await, "re-adding an equal tunnel must not raise changed");
    }

    #[tokio::test]
    async fn replace_semantics_flip_changed() {
        let table = DesiredState::new();
        let t1 = Tunnel::new("foo.com", "localhost", 1337);
        table.set(t1).await;
        table.take_changed().await;

        let t2 = Tunnel::new("foo.com", "localhost", 1024);
        table.set(t2.clone()).await;
        assert!(table.has_changed().await);
        assert_eq!(table.get("foo.com").await, Some(t2));
    }

    #[tokio::test]
    async fn delete_raises_changed_only_if_present() {
        let table = DesiredState::new();
        assert!(table.delete("missing").await.is_none());
        assert!(!table.has_changed().await);

        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        table.take_changed().await;
        assert!(table.delete("foo.com").await.is_some());
        assert!(table.has_changed().await);
    }

    #[tokio::test]
    async fn clear_raises_changed_only_if_nonempty() {
        let table = DesiredState::new();
        table.clear().await;
        assert!(!table.has_changed().await);

        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        table.take_changed().await;
        table.clear().await;
        assert!(table.has_changed().await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn replace_with_structurally_equal_mapping_leaves_changed_unset() {
        let table = DesiredState::new();
        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        table.take_changed().await;

        let mut same = HashMap::new();
        same.insert(
            "foo.com".to_string(),
            Tunnel::new("foo.com", "localhost", 1337),
        );
        table.replace(same).await;
        assert!(!table.has_changed().await);
    }

    #[tokio::test]
    async fn replace_changing_any_endpoint_sets_changed() {
        let table = DesiredState::new();
        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        table.take_changed().await;

        let mut different = HashMap::new();
        different.insert(
            "foo.com".to_string(),
            Tunnel::new("foo.com", "localhost", 9999),
        );
        table.replace(different).await;
        assert!(table.has_changed().await);
    }

    #[tokio::test]
    async fn round_trip_serialization_defaults_remote_port() {
        let json = r#"{"domain":"foo.com","host":"localhost","port":1337}"#;
        let t: Tunnel = serde_json::from_str(json).unwrap();
        assert_eq!(t.remote_port, 0);
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["remote_port"], 0);
    }

    #[tokio::test]
    async fn wait_returns_promptly_when_already_changed() {
        let table = DesiredState::new();
        table.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        let start = tokio::time::Instant::now();
        table.wait(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
