use clap::Parser;
use client::input::AutoClaimer;
use client::network::{Client, ClientConfig};
use log::{debug, info, warn};
use shared::{Phase, SendOutcome, SessionEvent};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:5005")]
    server: String,

    /// Claims per second while a match is running
    #[arg(short = 'r', long, default_value = "5")]
    rate: u32,

    /// Matches to play before leaving
    #[arg(short = 'n', long, default_value = "1")]
    rounds: u32,

    /// Seed for reproducible claims
    #[arg(long)]
    seed: Option<u64>,

    /// Grid rows
    #[arg(long, default_value = "20")]
    rows: usize,

    /// Grid columns
    #[arg(long, default_value = "20")]
    cols: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        server_addr: args.server.clone(),
        rows: args.rows,
        cols: args.cols,
        ..ClientConfig::default()
    };

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut claimer = match args.seed {
        Some(seed) => AutoClaimer::with_seed(args.rows, args.cols, seed),
        None => AutoClaimer::new(args.rows, args.cols),
    };
    let (handle, mut events) = Client::connect(config).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(args.rate.max(1))));
    let mut grid = None;
    let mut rounds_left = args.rounds.max(1);
    let mut playing = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::GridChanged(snapshot)) => grid = Some(snapshot),
                Some(SessionEvent::PhaseChanged(Phase::Active)) => playing = true,
                Some(SessionEvent::LeaderboardReady(entries)) => {
                    for entry in &entries {
                        info!("#{} player {} with {} cells", entry.rank, entry.player_id, entry.score);
                    }
                    // Results of a match we only watched from the waiting room.
                    if !playing {
                        continue;
                    }
                    playing = false;
                    rounds_left -= 1;
                    if rounds_left == 0 {
                        break;
                    }
                    grid = None;
                    handle.rejoin().await;
                }
                Some(event) => debug!("{:?}", event),
                None => break,
            },
            _ = ticker.tick() => {
                let status = handle.status();
                if status.refused {
                    warn!("Server is full");
                    break;
                }
                let Some(player_id) = status.player_id else { continue };
                if status.phase != Phase::Active {
                    continue;
                }
                if let Some((row, col)) = claimer.pick(grid.as_ref(), player_id) {
                    match handle.submit_claim(row, col).await {
                        SendOutcome::Sent { seq } => debug!("Claim ({}, {}) sent as seq {}", row, col, seq),
                        SendOutcome::Closed => break,
                        outcome => debug!("Claim ({}, {}) not sent: {:?}", row, col, outcome),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving...");
                break;
            }
        }
    }

    if let Some(stats) = handle.link_stats().await {
        info!("Link statistics: {:?}", stats);
    }
    handle.leave().await;
    Ok(())
}
