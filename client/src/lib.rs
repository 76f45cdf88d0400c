//! # Grid Claim Client Library
//!
//! Client side of the grid game: one reliable link to the server, a local
//! mirror of the session and an automatic claim picker for headless players.
//!
//! ## Architecture Overview
//!
//! A single tokio task owns the UDP socket and the client's ARQ link. It
//! wakes up for incoming datagrams, the 10 ms retransmission tick, the
//! heartbeat tick and commands from the [`network::ClientHandle`]. Messages
//! the link delivers in order are applied to a [`game::ClientSession`],
//! which publishes the same [`shared::SessionEvent`]s the server does.
//!
//! ### Claims
//! Claims are only sent while the local player has an id and the match is
//! running. Each CLAIM_REQUEST carries the link's piggybacked ack.
//!
//! ### Snapshots
//! Board snapshots replace the local grid wholesale. A snapshot whose id is
//! not newer than the last one applied is dropped, across rejoins too.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! - Player id, match phase and the latest grid
//! - Waiting-room changes turned into join/leave events
//! - Leaderboard of the last match
//!
//! ### Input Module (`input`)
//! - Random choice among cells the player does not own yet
//!
//! ### Network Module (`network`)
//! - Socket and link ownership
//! - Retransmission and heartbeats
//! - Claim, leave and rejoin commands
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//! use shared::SessionEvent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (handle, mut events) = Client::connect(ClientConfig::default()).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::PhaseChanged(shared::Phase::Active) => {
//!                 handle.submit_claim(3, 4).await;
//!             }
//!             SessionEvent::LeaderboardReady(entries) => {
//!                 println!("{:?}", entries);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     handle.leave().await;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
