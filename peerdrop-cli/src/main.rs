mod event;
mod ui;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use peerdrop_engine::discovery::{DEFAULT_DISCOVERY_PORT, Discovery};
use peerdrop_engine::node::{Node, NodeCmd, NodeConfig, Role};
use peerdrop_engine::quic::QuicTransport;
use peerdrop_engine::registry::OfferRegistry;
use peerdrop_engine::selection::{SelectionOutcome, run_selection_loop};
use peerdrop_engine::transfer::SharedFile;

use crate::event::spawn_event_logger;
use crate::ui::{StatusLog, spawn_status_display};

/// peerdrop: share one file with peers on the local network.
///
/// `send` announces a file to every peer found on the LAN and serves it on
/// request. `recv` lists the files announced by others and downloads the
/// one whose number you type.
#[derive(Parser, Debug)]
#[command(name = "peerdrop", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Address the QUIC endpoint listens on.
    #[arg(long, global = true, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// UDP port used for discovery beacons.
    #[arg(long, global = true, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Peer to dial directly, in addition to the ones discovered.
    #[arg(long = "connect", global = true, value_name = "ADDR")]
    connect: Vec<SocketAddr>,

    /// Seconds a single stream or file operation may stall.
    #[arg(
        long,
        global = true,
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    io_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce and serve a file.
    Send {
        /// File to share.
        path: PathBuf,
    },
    /// Discover offers and download one.
    Recv {
        /// Directory where the downloaded file is written.
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the status display
    // on stdout.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerdrop_cli=info,warn")),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (name, hostname) = local_identity()?;
    let io_timeout = Duration::from_secs(args.io_timeout);

    let (role, receive_dir) = match &args.command {
        Command::Send { path } => {
            let shared = SharedFile::inspect(path).await?;
            (Role::Share(shared), PathBuf::from("."))
        }
        Command::Recv { output_dir } => {
            tokio::fs::create_dir_all(output_dir)
                .await
                .with_context(|| format!("failed to create {}", output_dir.display()))?;
            (Role::Receive, output_dir.clone())
        }
    };
    let title = match &role {
        Role::Share(file) => {
            format!("peerdrop: sharing {} as {name}@{hostname}", file.file_name)
        }
        Role::Receive => format!("peerdrop: receiving as {name}@{hostname}"),
    };

    let (transport, transport_events) = QuicTransport::bind(args.listen, io_timeout)?;
    Discovery::bind(Arc::clone(&transport), args.discovery_port)?.spawn();
    for addr in args.connect {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(e) = transport.dial(addr).await {
                warn!(addr = %addr, error = %e, "Could not connect to peer");
            }
        });
    }

    let config = NodeConfig {
        name,
        hostname,
        io_timeout,
        receive_dir,
    };
    let receiving = matches!(role, Role::Receive);
    let handle = Node::new(role, config).start(
        Arc::clone(&transport),
        transport_events,
        Arc::new(OfferRegistry::new()),
    );

    let log = Arc::new(StatusLog::default());
    spawn_event_logger(handle.subscribe(), Arc::clone(&log));
    let display = spawn_status_display(
        title,
        Arc::clone(&log),
        receiving.then(|| Arc::clone(&handle.registry)),
    );

    if receiving {
        let stdin = BufReader::new(tokio::io::stdin());
        let outcome = run_selection_loop(
            stdin,
            handle.registry.as_ref(),
            &handle.cmd_tx,
            &handle.events_tx,
        )
        .await;
        display.abort();
        match outcome? {
            SelectionOutcome::Transferred(report) => {
                println!("\nSuccess! Saved {}", report.path.display());
            }
            SelectionOutcome::InputClosed => info!("No file selected"),
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        display.abort();
        println!();
    }

    let _ = handle.cmd_tx.send(NodeCmd::ShutDown).await;
    transport.close();
    Ok(())
}

/// Display name and host label put into announcements.
fn local_identity() -> anyhow::Result<(String, String)> {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let hostname = hostname::get()
        .context("failed to read hostname")?
        .to_string_lossy()
        .into_owned();
    Ok((name, hostname))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn given_cli_definition_when_built_then_it_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn given_zero_io_timeout_when_parsing_then_it_is_rejected() {
        let result = Args::try_parse_from(["peerdrop", "--io-timeout", "0", "recv"]);
        assert!(result.is_err());
    }

    #[test]
    fn given_positive_or_default_io_timeout_when_parsing_then_it_is_kept() {
        let args = Args::try_parse_from(["peerdrop", "recv", "--io-timeout", "5"]).unwrap();
        assert_eq!(args.io_timeout, 5);
        let args = Args::try_parse_from(["peerdrop", "send", "report.pdf"]).unwrap();
        assert_eq!(args.io_timeout, 30);
    }
}
