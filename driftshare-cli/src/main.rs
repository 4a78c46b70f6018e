mod command;
mod event;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use driftshare_engine::catalog::SharedCatalog;
use driftshare_engine::client::PeerClient;
use driftshare_engine::config::DiscoveryConfig;
use driftshare_engine::discovery::DiscoveryScanner;
use driftshare_engine::events::EventSink;
use driftshare_engine::mdns::{MdnsDiscovery, default_device_name};
use driftshare_engine::registry::PeerRegistry;
use driftshare_engine::server::TransportServer;
use driftshare_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::command::{Flow, Shell};
use crate::event::spawn_event_printer;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

/// driftshare: share files with nearby devices.
///
/// Advertises the files you share on the local network, discovers other
/// devices doing the same, and lets you browse and download their files
/// from an interactive prompt.
#[derive(Parser, Debug)]
#[command(name = "driftshare", version, about)]
struct Args {
    /// Address to listen on for incoming connections (port 0 picks one).
    #[arg(short, long, default_value = "0.0.0.0:0")]
    listen: String,

    /// Name shown to other devices. Defaults to the host name.
    #[arg(short, long)]
    name: Option<String>,

    /// JSON file holding the list of shared files.
    #[arg(short, long, default_value = "driftshare/shared_files.json")]
    catalog: PathBuf,

    /// Directory where downloaded files are stored.
    #[arg(short, long, default_value = "/tmp/driftshare")]
    download_dir: PathBuf,

    /// Seconds between two automatic scans.
    #[arg(long, default_value_t = 45)]
    scan_interval: u64,

    /// Seconds a single scan may run.
    #[arg(long, default_value_t = 8)]
    scan_duration: u64,

    /// Seconds between two eviction passes.
    #[arg(long, default_value_t = 20)]
    cleanup_interval: u64,

    /// Peers not seen for this many seconds are hidden.
    #[arg(long, default_value_t = 120)]
    visibility_window: u64,

    /// Peers not seen for this many seconds are forgotten.
    #[arg(long, default_value_t = 180)]
    eviction_timeout: u64,

    /// Maximum number of service probes in flight during a scan.
    #[arg(long, default_value_t = 4)]
    max_probes: usize,
}

impl Args {
    fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            scan_interval: Duration::from_secs(self.scan_interval),
            scan_duration: Duration::from_secs(self.scan_duration),
            cleanup_interval: Duration::from_secs(self.cleanup_interval),
            visibility_window: Duration::from_secs(self.visibility_window),
            eviction_timeout: Duration::from_secs(self.eviction_timeout),
            max_concurrent_probes: self.max_probes,
            ..DiscoveryConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("driftshare_cli=info,warn")),
        )
        .init();

    if let Err(e) = std::fs::create_dir_all(&args.download_dir) {
        eprintln!(
            "Failed to create download directory {}: {e}",
            args.download_dir.display()
        );
        std::process::exit(1);
    }

    let device_name = args.name.clone().unwrap_or_else(default_device_name);
    let discovery = match MdnsDiscovery::new(device_name.clone()) {
        Ok(discovery) => Arc::new(discovery),
        Err(e) => {
            eprintln!("Failed to start discovery: {e:#}");
            std::process::exit(1);
        }
    };

    let catalog = Arc::new(SharedCatalog::open(&args.catalog));
    match catalog.prune_missing() {
        Ok(pruned) if !pruned.is_empty() => {
            info!(count = pruned.len(), "Dropped shared files that no longer exist");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to prune shared catalog"),
    }

    let events = EventSink::default();
    spawn_event_printer(events.subscribe());

    let server = TransportServer::new(
        TcpListenerFactory,
        Arc::clone(&discovery),
        Arc::clone(&catalog),
        events.clone(),
    );
    let port = match server.start(&args.listen).await {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    let scanner = Arc::new(DiscoveryScanner::new(
        Arc::clone(&discovery),
        Arc::new(PeerRegistry::new()),
        events.clone(),
        args.discovery_config(),
    ));
    scanner.start();

    let client = Arc::new(PeerClient::new(TcpConnector, discovery, events));

    let shell = Shell {
        scanner: Arc::clone(&scanner),
        client,
        catalog,
        download_dir: args.download_dir.clone(),
    };

    // Small delay so startup events print before the banner.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ── Banner ──────────────────────────────────────────────────
    print_banner(&device_name, port, &args.catalog, &args.download_dir);
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => break,

            line = read_line(&mut stdin) => {
                let Some(line) = line else {
                    // EOF: shut down.
                    break;
                };

                if !line.is_empty() && shell.dispatch(&line).await == Flow::Quit {
                    break;
                }
                print_prompt();
            }
        }
    }

    println!("\n  Shutting down...");
    scanner.stop().await;
    server.stop().await;
    println!("  Bye! 👋");
}
