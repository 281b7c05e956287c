use std::time::Instant;

use kadstore::{Dht, Id};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Key to store the value under, hashed to an Id.
    key: String,
    /// Value to store on the DHT.
    value: String,
    /// Sign the value with this node's key.
    #[arg(long)]
    sign: bool,
    /// Bootstrapping nodes, as `host:port`.
    #[arg(short, long, required = true)]
    bootstrap: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let dht = Dht::builder()
        .bootstrap(&cli.bootstrap)
        .build()
        .expect("Failed to create Dht node");

    if !dht.bootstrapped() {
        println!("Failed to bootstrap");
        return;
    }

    let key = Id::hash(cli.key.as_bytes());

    println!("\nStoring \"{}\" under {} ...\n", cli.value, key);

    let start = Instant::now();

    match dht.store_value(key, cli.value.as_bytes(), cli.sign) {
        Ok(stored_at) => {
            println!(
                "Stored at {} nodes in {:?} seconds",
                stored_at.len(),
                start.elapsed().as_secs_f32()
            );

            for node in stored_at {
                println!("   {:?}", node);
            }
        }
        Err(error) => println!("Failed to store value: {error}"),
    }
}
