#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod config;
mod shutdown;

use bytes::Bytes;
use clap::Parser;
use cnp_core::NodeId;
use cnp_network::TcpTransport;
use cnp_overlay::{NodeActor, OverlayEvent, OverlayHandle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Canopy - self-organizing meta-node overlay")]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    listen: SocketAddr,

    /// Address other nodes use to reach this one
    #[arg(long)]
    advertise: Option<SocketAddr>,

    #[arg(short, long, default_value = "0.0.0.0:9464")]
    metrics: SocketAddr,

    /// Join the overlay through this member instead of starting a new one
    #[arg(short, long)]
    join: Option<SocketAddr>,

    #[arg(short, long, default_value = "3")]
    reliability: usize,

    #[arg(short = 'k', long, default_value = "4")]
    fanout: usize,

    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {e}");
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match config::Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    target: "canopy",
                    error = %e,
                    path = %path.display(),
                    "Failed to load config file"
                );
                std::process::exit(1);
            },
        },
        None => config::Config::from_args(&args),
    };

    info!(
        target: "canopy",
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        advertise = %config.advertised(),
        metrics = %config.metrics_addr,
        reliability = config.overlay.reliability,
        fanout = config.overlay.fanout,
        "Starting canopy"
    );

    if let Err(e) = cnp_metrics::init_prometheus_exporter(config.metrics_addr) {
        error!(
            target: "canopy",
            error = %e,
            "Failed to initialize metrics exporter"
        );
        std::process::exit(1);
    }

    let (shutdown_tx, _) = broadcast::channel(4);
    let shutdown_signal = shutdown::install_signal_handlers(shutdown_tx.clone());

    let metrics_shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut shutdown_rx = metrics_shutdown_rx;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    cnp_metrics::export_to_prometheus();
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    });

    let (transport, transport_events) =
        match TcpTransport::bind(config.listen_addr, config.transport_config()).await {
            Ok(bound) => bound,
            Err(e) => {
                error!(target: "canopy", error = %e, "Failed to bind transport");
                std::process::exit(1);
            },
        };

    let me = NodeId::now(config.advertised());
    let handle = match NodeActor::spawn(
        me,
        config.overlay_config(),
        Arc::new(transport.clone()),
        transport_events,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            error!(target: "canopy", error = %e, "Invalid overlay configuration");
            std::process::exit(1);
        },
    };

    tokio::spawn(log_events(handle.subscribe(), shutdown_tx.clone()));

    let attached = match config.contact {
        Some(contact) => handle.join(contact, config.join_timeout()).await,
        None => handle.initialize().await,
    };
    match attached {
        Ok(()) => info!(target: "canopy", node = %me, "Attached to overlay"),
        Err(e) => {
            error!(target: "canopy", error = %e, "Failed to attach to overlay");
            transport.shutdown();
            std::process::exit(1);
        },
    }

    tokio::spawn(read_commands(handle.clone(), shutdown_tx.subscribe()));

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_signal => {}
        _ = shutdown_rx.recv() => {}
    }

    if let Err(e) = handle.shutdown().await {
        warn!(target: "canopy", error = %e, "Overlay actor already stopped");
    }
    transport.shutdown();
    info!(target: "canopy", "Canopy shutdown complete");
}

/// Surface overlay events in the log. A disconnection ends the process.
async fn log_events(mut events: broadcast::Receiver<OverlayEvent>, shutdown_tx: broadcast::Sender<()>) {
    loop {
        match events.recv().await {
            Ok(OverlayEvent::Topology(change)) => {
                let snap = &change.snapshot;
                info!(
                    target: "canopy",
                    change = %change,
                    cluster = %snap.own().id,
                    size = snap.own().table.len(),
                    leader = snap.is_leader(),
                    "Topology changed"
                );
            },
            Ok(OverlayEvent::Delivered(delivery)) => {
                info!(
                    target: "canopy",
                    id = %delivery.id,
                    kind = ?delivery.kind,
                    payload = %String::from_utf8_lossy(&delivery.payload),
                    "Message delivered"
                );
            },
            Ok(OverlayEvent::Disconnected) => {
                warn!(target: "canopy", "Disconnected from overlay, rejoin required");
                shutdown::request_shutdown(&shutdown_tx, "disconnected");
                return;
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "canopy", skipped, "Event log lagging");
            },
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Line commands on stdin: `b <text>` broadcasts, `r <text>` sends to the
/// root, `s` prints the current topology.
async fn read_commands(handle: OverlayHandle, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown_rx.recv() => return,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "canopy", error = %e, "Failed to read stdin");
                return;
            },
        };

        let (command, rest) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
        let payload = Bytes::from(rest.to_owned());
        let result = match command {
            "b" => handle.broadcast(payload).await.map(|id| info!(target: "canopy", id = %id, "Broadcast sent")),
            "r" => handle.send_to_root(payload).await.map(|id| info!(target: "canopy", id = %id, "Sent to root")),
            "s" => handle.snapshot().await.map(|snap| match snap {
                Some(snap) => print_snapshot(&snap),
                None => println!("not attached"),
            }),
            "" => Ok(()),
            other => {
                println!("unknown command {other:?}: use b <text>, r <text> or s");
                Ok(())
            },
        };
        if let Err(e) = result {
            warn!(target: "canopy", error = %e, "Command failed");
        }
    }
}

fn print_snapshot(snap: &cnp_overlay::TopologySnapshot) {
    let members = |table: &cnp_overlay::ClusterTable| {
        table.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    };
    println!("me:     {}", snap.me());
    println!("own:    {} [{}]", snap.own().id, members(&snap.own().table));
    if let Some(parent) = snap.parent() {
        println!("parent: {} [{}]", parent.id, members(&parent.table));
    }
    for child in snap.children().iter().flatten() {
        println!("child:  {} [{}]", child.id, members(&child.table));
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,canopy=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = config::Config::default();
    let overlay = &config.overlay;
    let transport = &config.transport;

    let content = format!(
        r#"# Canopy Configuration File
# Generated by: canopy --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# Address the overlay transport listens on
listen_addr = "{}"

# Address peers use to reach this node (defaults to listen_addr)
# advertise_addr = "10.0.0.5:7400"

# Address and port for Prometheus metrics endpoint
metrics_addr = "{}"

# Existing member to join through. Omit to start a new overlay.
# contact = "10.0.0.1:7400"

[overlay]
# Minimum cluster size before a cluster owns children (R)
reliability = {}

# Maximum child clusters per cluster (K). 0 keeps everything in the root.
fanout = {}

# Resend forwarded messages not acknowledged within this many milliseconds
ack_timeout_ms = {}
retry_tick_ms = {}

# Failure detector: probe period and consecutive misses before eviction
probe_interval_ms = {}
probe_failure_threshold = {}

mailbox_capacity = {}
event_capacity = {}
join_timeout_ms = {}

# Message ids remembered for duplicate suppression
delivery_window = {}

[transport]
connect_timeout_ms = {}
write_timeout_ms = {}
peer_queue_depth = {}
"#,
        path.display(),
        config.listen_addr,
        config.metrics_addr,
        overlay.reliability,
        overlay.fanout,
        overlay.ack_timeout_ms,
        overlay.retry_tick_ms,
        overlay.probe_interval_ms,
        overlay.probe_failure_threshold,
        overlay.mailbox_capacity,
        overlay.event_capacity,
        overlay.join_timeout_ms,
        overlay.delivery_window,
        transport.connect_timeout_ms,
        transport.write_timeout_ms,
        transport.peer_queue_depth,
    );

    std::fs::write(path, content)
}
