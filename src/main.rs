mod admin_http;
mod config;
mod error;
mod forwarder;
mod ipc;
mod keys;
mod ssh;
mod supervisor;
mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{Cli, Command};
use tunnel::DesiredState;

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    if let Err(e) = try_main().await {
        // A plain `{e}` (not `{e:?}`) keeps this a single line, per §6
        // "invalid specs exit nonzero with a single-line message" — anyhow's
        // default `Debug` rendering would print the full causal chain.
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let ipc_socket = cli.ipc_socket.clone().unwrap_or_else(ipc::default_socket_path);

    match cli.command.clone() {
        Some(Command::Add { spec }) => {
            let tunnel = config::parse_tunnel_spec(&spec).context("invalid tunnel spec")?;
            ipc::Driver::new(ipc_socket).add(tunnel).await?;
        }
        Some(Command::Del { domain }) => {
            ipc::Driver::new(ipc_socket).del(domain).await?;
        }
        Some(Command::List) => {
            let tunnels = ipc::Driver::new(ipc_socket).list().await?;
            for t in tunnels {
                println!("{t}");
            }
        }
        Some(Command::Stop) => {
            ipc::Driver::new(ipc_socket).stop().await?;
        }
        Some(Command::Completions { shell }) => {
            print_completions(shell);
        }
        None => run_daemon(cli, ipc_socket).await?,
    }

    Ok(())
}

/// Daemon mode (§2, §5): seeds the desired-state table from positional
/// `domain:host:port` specs, brings up the SSH session, and runs the
/// supervisor, the control IPC listener, and (unless disabled) the admin
/// HTTP surface concurrently until Ctrl-C, an IPC `stop`, or the
/// supervisor exiting on its own (fatal IPC loss, per §7).
async fn run_daemon(cli: Cli, ipc_socket: std::path::PathBuf) -> Result<()> {
    init_logging(&cli.ssh.log_level);

    let initial: Vec<tunnel::Tunnel> = cli
        .tunnels
        .iter()
        .map(|spec| config::parse_tunnel_spec(spec))
        .collect::<Result<_, _>>()
        .context("invalid tunnel spec")?;

    let desired = Arc::new(DesiredState::new());
    desired.seed(initial).await;

    let key = match &cli.ssh.key_file {
        Some(path) => keys::load_or_generate(path)?,
        None => keys::generate()?,
    };
    let session = ssh::SshSession::new(
        cli.ssh.host.clone(),
        cli.ssh.port,
        cli.ssh.user.clone(),
        key,
        cli.ssh.host_keys_file.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (list_tx, list_rx) = mpsc::channel(8);

    let sup = supervisor::Supervisor::new(desired.clone(), session, list_rx);
    let mut supervisor_task = tokio::spawn(sup.run(shutdown_rx.clone()));

    let ipc_task = tokio::spawn(ipc::run_server(
        ipc_socket,
        desired.clone(),
        list_tx,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    let admin_http_task = if cli.no_admin_http || cli.admin_http_addr.is_empty() {
        None
    } else {
        let addr = cli.admin_http_addr.clone();
        let desired = desired.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                result = admin_http::serve(&addr, desired) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "admin HTTP server exited with an error");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }))
    };

    let supervisor_already_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, shutting down");
            false
        }
        result = &mut supervisor_task => {
            if let Err(e) = result {
                tracing::error!(error = %e, "supervisor task panicked");
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if !supervisor_already_done {
        let _ = supervisor_task.await;
    }
    let _ = ipc_task.await;
    if let Some(handle) = admin_http_task {
        let _ = handle.await;
    }

    Ok(())
}

/// Emit shell completions for the CLI (ambient nicety, matching the
/// teacher's own `Completions` subcommand).
fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}
