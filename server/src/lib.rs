//! # Grid Claim Server Library
//!
//! Authoritative server for the "claim the cell" grid game. It admits
//! players, runs matches, resolves conflicting claims into one shared grid
//! and keeps every client's view in sync over plain UDP.
//!
//! ## Core Responsibilities
//!
//! ### Reliable Delivery
//! UDP drops, reorders and corrupts datagrams. Every peer gets its own
//! Selective-Repeat ARQ link (from the `shared` crate) that acknowledges
//! each packet, retransmits on an adaptive timeout and hands the session
//! messages exactly once, in order.
//!
//! ### Match Lifecycle
//! Players wait in a waiting room until enough have joined, play a timed
//! match and see a leaderboard before the room resets for the next match.
//!
//! ### Conflict Resolution
//! Claims on the same cell are ordered by the sender's packet timestamp:
//! the most recent claim wins no matter which one arrives first.
//!
//! ## Architecture Design
//!
//! Three tokio tasks share one UDP socket:
//! - **Receive task**: validates datagrams, runs them through the peer's
//!   link, acks immediately and forwards deliveries to the session.
//! - **Retransmission task**: every 10 ms resends timed-out packets.
//! - **Session task**: the only writer of grid, session and peer state;
//!   handles deliveries, timers and snapshot broadcasts.
//!
//! Links sit behind per-peer locks; there is no lock around game state.
//!
//! ## Module Organization
//!
//! - [`config`]: server settings and their defaults
//! - [`peer_registry`]: admitted peers, player ids and link ownership
//! - [`session`]: the match state machine
//! - [`network`]: socket, task wiring, statistics and shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let (handle, mut events) = server.spawn();
//!
//!     // Session events until the first match is over.
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!         if matches!(event, shared::SessionEvent::LeaderboardReady(_)) {
//!             break;
//!         }
//!     }
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod peer_registry;
pub mod session;
