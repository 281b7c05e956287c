use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{thread, time::Duration};

use kadstore::Dht;

use clap::Parser;

use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,
    /// Bootstrapping nodes, as `host:port`. Starts a new network if empty.
    #[arg(short, long)]
    bootstrap: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let mut builder = Dht::builder();
    builder.bootstrap(&cli.bootstrap);

    if let Some(port) = cli.port {
        builder.port(port);
    }

    let mut dht = builder.build().expect("Failed to create Dht node");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .expect("Error setting Ctrl-C handler");

    info!("Waiting for bootstrap...");
    info!(bootstrapped = dht.bootstrapped(), "Bootstrap complete");
    info!("Dht node is running! Press Ctrl+C to stop.");

    let mut elapsed = Duration::ZERO;

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        elapsed += Duration::from_millis(200);

        if elapsed < Duration::from_secs(30) {
            continue;
        }
        elapsed = Duration::ZERO;

        match dht.info() {
            Ok(info) => info!(
                id = %info.id(),
                local_addr = %info.local_addr(),
                routing_table_size = info.routing_table_size(),
                stored_keys = info.stored_keys(),
                "Node status"
            ),
            Err(error) => {
                info!(%error, "Node stopped");
                return;
            }
        }
    }

    info!("Shutting down...");
    dht.shutdown();
}
