use clap::Parser;
use log::{error, info};
use server::manager::ManagerConfig;
use server::network::{BoxError, Server, ServerConfig};
use server::store::MemoryStore;
use server::text::RandomTextPool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of concurrent connections
    #[arg(short, long, default_value = "256")]
    max_clients: usize,

    /// Seconds of silence before a client counts as disconnected
    #[arg(long, default_value = "10")]
    client_timeout_secs: u64,

    /// Seconds an idle race record is kept
    #[arg(long, default_value = "7200")]
    race_ttl_secs: u64,

    /// Upper bound for a single store call, in milliseconds
    #[arg(long, default_value = "500")]
    store_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        max_clients: args.max_clients,
        client_timeout: Duration::from_secs(args.client_timeout_secs),
        manager: ManagerConfig {
            race_ttl: Duration::from_secs(args.race_ttl_secs),
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            ..ManagerConfig::default()
        },
    };
    info!(
        "Races expire after {}s idle, clients after {}s",
        args.race_ttl_secs, args.client_timeout_secs
    );

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(
        &address,
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(RandomTextPool::default()),
    )
    .await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
