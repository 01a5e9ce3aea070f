//! Parley relay binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with a self-signed certificate (development)
//! parley-relay --bind 0.0.0.0:4433
//!
//! # Start with a TLS certificate (production)
//! parley-relay --bind 0.0.0.0:4433 --cert cert.pem --key key.pem
//! ```

use clap::Parser;
use parley_relay::{Relay, RelayConfig, RelayRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley rendezvous relay
#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "Parley rendezvous and message relay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Seconds a forwarded delivery may wait for the recipient's receipt
    #[arg(long, default_value = "5")]
    delivery_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("parley relay starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided - using a self-signed certificate");
    }

    let config = RelayRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        driver: RelayConfig {
            max_connections: args.max_connections,
            delivery_timeout: std::time::Duration::from_secs(args.delivery_timeout),
        },
    };

    let relay = Relay::bind(config)?;
    relay.run().await?;

    Ok(())
}
