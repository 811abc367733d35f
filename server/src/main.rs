use clap::Parser;
use log::{error, info};
use server::auth::PasswordAuthenticator;
use server::config::ServerConfig;
use server::network::NetworkServer;
use server::server::Server;
use server::world::LedgerWorld;
use std::time::Duration;

/// Runs the session server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "3979")]
        port: u16,
        /// Tick rate (frames per second)
        #[clap(short, long, default_value = "33")]
        tick_rate: u32,
        /// Maximum number of connected clients
        #[clap(short, long, default_value = "25")]
        max_clients: usize,
        /// Name shown in game info replies
        #[clap(short = 'n', long, default_value = "Unnamed Server")]
        server_name: String,
        /// Password clients must present to join
        #[clap(long)]
        password: Option<String>,
        /// Password for remote console commands
        #[clap(long)]
        rcon_password: Option<String>,
        /// Frames between FRAME packets
        #[clap(long, default_value = "0")]
        frame_freq: u32,
        /// Frames between SYNC packets
        #[clap(long, default_value = "100")]
        sync_freq: u32,
        /// Bytes per map chunk
        #[clap(long)]
        map_chunk_size: Option<usize>,
    }

    let args = Args::parse();

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        server_name: args.server_name,
        max_clients: args.max_clients,
        server_password: args.password.clone(),
        rcon_password: args.rcon_password,
        tick_duration: Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64),
        frame_freq: args.frame_freq,
        sync_freq: args.sync_freq,
        map_chunk_size: args.map_chunk_size.unwrap_or(defaults.map_chunk_size),
        ..defaults
    }
    .sanitized();

    info!(
        "Starting \"{}\" for up to {} clients at {} ticks per second",
        config.server_name, config.max_clients, args.tick_rate
    );

    let authenticator = Box::new(PasswordAuthenticator::new(args.password));
    let server = Server::new(config, LedgerWorld::new(), authenticator);

    let address = format!("{}:{}", args.host, args.port);
    let mut network = NetworkServer::bind(&address, server).await?;
    let handle = network.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                handle.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    network.run().await?;

    // Give writer tasks a moment to flush the shutdown notice.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
