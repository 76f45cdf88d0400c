use clap::Parser;
use log::{debug, info};
use server::config::ServerConfig;
use server::network::Server;
use shared::SessionEvent;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Grid rows
    #[arg(long, default_value = "20")]
    rows: usize,

    /// Grid columns
    #[arg(long, default_value = "20")]
    cols: usize,

    /// ARQ window size per peer
    #[arg(short, long, default_value = "6")]
    window: u32,

    /// Match duration in seconds
    #[arg(short, long, default_value = "60")]
    duration: u64,

    /// Players needed to start a match
    #[arg(long, default_value = "2")]
    min_players: usize,

    /// Maximum admitted players (at most 15)
    #[arg(short, long, default_value = "4")]
    max_players: usize,

    /// Seconds of silence before a peer is dropped
    #[arg(long, default_value = "10")]
    idle_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        rows: args.rows,
        cols: args.cols,
        window_size: args.window,
        match_duration: Duration::from_secs(args.duration),
        min_players: args.min_players,
        max_players: args.max_players,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        ..ServerConfig::default()
    };

    info!("Starting server...");
    let server = Server::bind(config).await?;
    let (handle, mut events) = server.spawn();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::LeaderboardReady(entries)) => {
                    for entry in entries {
                        info!("#{} player {} with {} cells", entry.rank, entry.player_id, entry.score);
                    }
                }
                Some(SessionEvent::GridChanged(snapshot)) => debug!("Snapshot {}", snapshot.id),
                Some(event) => debug!("{:?}", event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    info!("Final statistics: {:?}", handle.stats());
    handle.shutdown().await;
    Ok(())
}
