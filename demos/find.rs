use std::time::Instant;

use kadstore::{Dht, Id};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Key to look up, hashed to an Id.
    key: String,
    /// Skip the first values of each responder.
    #[arg(long, default_value_t = 0)]
    start: u32,
    /// Look up the closest nodes instead of values.
    #[arg(long)]
    nodes: bool,
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

    let start = Instant::now();

    if cli.nodes {
        println!("\nLooking up the closest nodes to {} ...\n", key);

        match dht.find_nodes(key) {
            Ok(nodes) => {
                println!(
                    "Found {} nodes in {:?} seconds",
                    nodes.len(),
                    start.elapsed().as_secs_f32()
                );

                for node in nodes {
                    println!("   {:?}", node);
                }
            }
            Err(error) => println!("Lookup failed: {error}"),
        }

        return;
    }

    println!("\nLooking up values under {} ...\n", key);

    match dht.find_values_from(key, cli.start) {
        Ok(values) => {
            println!(
                "Found {} values in {:?} seconds",
                values.len(),
                start.elapsed().as_secs_f32()
            );

            for (value, public_key) in values {
                let value = String::from_utf8_lossy(&value);

                match public_key {
                    Some(public_key) => println!("   {value:?} signed by {}", to_hex(&public_key)),
                    None => println!("   {value:?}"),
                }
            }
        }
        Err(error) => println!("Lookup failed: {error}"),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
