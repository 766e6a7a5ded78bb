//! Control IPC (§4.5, §6): a length-prefixed request/reply protocol over a
//! local Unix-domain stream socket between an out-of-process driver (here,
//! the CLI's `add`/`del`/`list`/`stop` subcommands) and the supervisor.
//!
//! Grounded on `examples/original_source/client/conduit_client/server.py`'s
//! `Command`/`TunnelCommand`/`ListCommand` tagged-dispatch and its
//! `SSHManagerClient._send_command` (driver-side mutex + one-ack-per-request
//! read loop), adapted per spec.md §4.5's explicit redesign: the supervisor
//! listens and the driver connects (the source has the client listen and the
//! daemon connect out to it, an inversion spec.md calls out as reproduced
//! the *other* way here), and frame payloads are `serde_json` rather than
//! `pickle` (§4.5 "MAY choose any self-describing encoding").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::{DesiredState, Tunnel};

/// Maximum frame payload size: the wire length prefix is 16 bits (§3, §6).
const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// The tagged command set normative per §4.5/§6. `Del` carries only the
/// domain, resolving the source's undefined-local-name bug (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Frame {
    Noop,
    Add(Tunnel),
    Del { domain: String },
    List,
    Stop,
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> TunnelResult<()> {
    let payload = serde_json::to_vec(frame).map_err(|e| TunnelError::Protocol(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TunnelError::Protocol(format!(
            "frame payload too large: {} bytes",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u16).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF before any bytes of a
/// new frame arrive (the normal end of a driver's connection); a partial
/// read is a `ProtocolError`.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> TunnelResult<Option<Frame>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| TunnelError::Protocol(format!("truncated frame: {e}")))?;
    let frame: Frame =
        serde_json::from_slice(&payload).map_err(|e| TunnelError::Protocol(e.to_string()))?;
    Ok(Some(frame))
}

/// Request sent from an IPC connection handler to the supervisor to read
/// its live-forward table (§4.5 `list`). The supervisor is the only writer
/// of live state, so the server task asks rather than reads it directly.
pub struct ListLiveRequest(pub oneshot::Sender<Vec<Tunnel>>);

/// Runs the control-IPC server: binds `socket_path`, then serves driver
/// connections until `shutdown` fires. Each connection is independent —
/// a clean EOF simply ends that connection and the accept loop continues,
/// so one daemon can serve many sequential short-lived CLI invocations
/// (see DESIGN.md for why this relaxes the single-connection-for-life
/// reading of §7's "fatal EOF" clause).
pub async fn run_server(
    socket_path: PathBuf,
    desired: std::sync::Arc<DesiredState>,
    list_tx: mpsc::Sender<ListLiveRequest>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> TunnelResult<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "control IPC listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control IPC connection");
                        continue;
                    }
                };
                let desired = desired.clone();
                let list_tx = list_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &desired, &list_tx, &shutdown_tx).await {
                        warn!(error = %e, "control IPC connection ended with an error");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    desired: &DesiredState,
    list_tx: &mpsc::Sender<ListLiveRequest>,
    shutdown_tx: &watch::Sender<bool>,
) -> TunnelResult<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "malformed control IPC frame, closing connection");
                return Err(e);
            }
        };
        debug!(?frame, "received control IPC command");

        match frame {
            Frame::Noop => {
                write_frame(&mut stream, &Frame::Noop).await?;
            }
            Frame::Add(tunnel) => {
                desired.set(tunnel).await;
                write_frame(&mut stream, &Frame::Noop).await?;
            }
            Frame::Del { domain } => {
                desired.delete(&domain).await;
                write_frame(&mut stream, &Frame::Noop).await?;
            }
            Frame::List => {
                let (reply_tx, reply_rx) = oneshot::channel();
                list_tx
                    .send(ListLiveRequest(reply_tx))
                    .await
                    .map_err(|_| TunnelError::Protocol("supervisor not listening for list requests".into()))?;
                let live = reply_rx
                    .await
                    .map_err(|_| TunnelError::Protocol("supervisor dropped list request".into()))?;
                for tunnel in live {
                    write_frame(&mut stream, &Frame::Add(tunnel)).await?;
                }
                write_frame(&mut stream, &Frame::Noop).await?;
            }
            Frame::Stop => {
                info!("received stop command over control IPC, shutting down");
                let _ = shutdown_tx.send(true);
                return Ok(());
            }
        }
    }
}

/// How long the driver waits for a reply frame to a single request (§5,
/// "IPC reply read timeout (suggested 1 s)").
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the driver waits for a freshly spawned daemon's socket to appear.
const SPAWN_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Out-of-process driver (§4.5): connects to a running daemon's control
/// socket, lazily spawning one if it is not there. A `tokio::sync::Mutex`
/// plays the role of the source's single driver-side lock, serializing
/// concurrent callers sharing one `Driver` so replies are never interleaved.
pub struct Driver {
    socket_path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl Driver {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            stream: Mutex::new(None),
        }
    }

    async fn ensure_connected(&self, guard: &mut Option<UnixStream>) -> TunnelResult<()> {
        if guard.is_some() {
            return Ok(());
        }
        if !self.socket_path.exists() {
            self.spawn_daemon().await?;
        }
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => {
                *guard = Some(stream);
                Ok(())
            }
            Err(_) => {
                // Socket file exists but nothing is listening: stale daemon.
                self.spawn_daemon().await?;
                let stream = UnixStream::connect(&self.socket_path).await?;
                *guard = Some(stream);
                Ok(())
            }
        }
    }

    async fn spawn_daemon(&self) -> TunnelResult<()> {
        let exe = std::env::current_exe()?;
        info!(exe = %exe.display(), "lazily spawning tunnelward daemon");
        std::process::Command::new(exe)
            .arg("--ipc-socket")
            .arg(&self.socket_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        let deadline = tokio::time::Instant::now() + SPAWN_WAIT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.socket_path.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(TunnelError::Connect {
            host: "localhost".into(),
            port: 0,
            reason: "timed out waiting for spawned daemon's control socket".into(),
        })
    }

    async fn send(&self, frame: Frame) -> TunnelResult<Vec<Frame>> {
        let mut guard = self.stream.lock().await;
        self.ensure_connected(&mut guard).await?;
        let stream = guard.as_mut().expect("just connected");

        write_frame(stream, &frame).await?;

        let mut replies = Vec::new();
        loop {
            let read = tokio::time::timeout(REPLY_TIMEOUT, read_frame(stream))
                .await
                .map_err(|_| TunnelError::Protocol("timed out waiting for reply".into()))??;
            match read {
                Some(Frame::Noop) => break,
                Some(other) => replies.push(other),
                None => {
                    *guard = None;
                    return Err(TunnelError::Protocol("daemon closed connection unexpectedly".into()));
                }
            }
        }
        Ok(replies)
    }

    pub async fn ping(&self) -> TunnelResult<()> {
        self.send(Frame::Noop).await.map(|_| ())
    }

    pub async fn add(&self, tunnel: Tunnel) -> TunnelResult<()> {
        self.send(Frame::Add(tunnel)).await.map(|_| ())
    }

    pub async fn del(&self, domain: impl Into<String>) -> TunnelResult<()> {
        self.send(Frame::Del { domain: domain.into() }).await.map(|_| ())
    }

    pub async fn list(&self) -> TunnelResult<Vec<Tunnel>> {
        let replies = self.send(Frame::List).await?;
        Ok(replies
            .into_iter()
            .filter_map(|f| match f {
                Frame::Add(tunnel) => Some(tunnel),
                _ => None,
            })
            .collect())
    }

    /// Sends `stop`, then closes the driver's own socket, removes the
    /// socket file, and waits (best-effort, bounded) for the daemon to
    /// exit — the driver has no direct handle to a PID it did not itself
    /// spawn this call, so "waits for the child" is approximated by
    /// polling for the socket file's removal, which the daemon does on
    /// exit (§4.5).
    pub async fn stop(&self) -> TunnelResult<()> {
        let mut guard = self.stream.lock().await;
        self.ensure_connected(&mut guard).await?;
        if let Some(stream) = guard.as_mut() {
            write_frame(stream, &Frame::Stop).await?;
        }
        *guard = None;

        let deadline = tokio::time::Instant::now() + SPAWN_WAIT_TIMEOUT;
        while self.socket_path.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

/// Default control-IPC socket path (§6): deterministic (not per-invocation
/// unique) so repeated CLI driver calls find the same running daemon.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("tunnelward.sock")
}
