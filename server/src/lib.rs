//! # Typing Race Server Library
//!
//! This library provides the session lifecycle for multiplayer typing races.
//! A host creates a race and shares its six-digit pin, players join the lobby,
//! the host starts the race, players stream progress and finally report their
//! result. The server keeps the authoritative record of each race and tells
//! every participant about every change.
//!
//! ## Core Responsibilities
//!
//! ### Race Lifecycle
//! Every race moves `Lobby -> Running -> Finished` and never backwards. Only the
//! host may start a race, players may only join while it is in the lobby, and
//! a race finishes once every player has reported a result.
//!
//! ### Departure Handling
//! When a connection goes away (explicit disconnect or timeout) its race is
//! cleaned up: a departing host closes the race for everyone, a departing
//! player is removed and may complete a race that was only waiting on them.
//!
//! ### Event Fan-out
//! Each race has a broadcast channel. State changes are committed first and
//! only then announced, so no participant ever hears about a change that did
//! not happen.
//!
//! ## Module Organization
//!
//! ### Session Manager (`manager`)
//! The only component that mutates races. Serializes writes per pin with
//! compare-and-swap on the store's record version, and bounds every store
//! call with a timeout.
//!
//! ### Race Model (`race`)
//! The race record and its rules: membership, progress, finishing and the
//! leaderboard order.
//!
//! ### Session Store (`store`)
//! Keyed, expiring persistence for race records behind an async trait, with
//! an in-process implementation.
//!
//! ### Connection Registry (`registry`) and Broadcast Gateway (`broadcast`)
//! Which race a connection belongs to, and who listens on each race channel.
//!
//! ### Network Module (`network`) and Client Manager (`client_manager`)
//! UDP transport: connection handshake, heartbeats, timeouts and request
//! dispatch.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use server::store::MemoryStore;
//! use server::text::RandomTextPool;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         ServerConfig::default(),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(RandomTextPool::default()),
//!     )
//!     .await?;
//!
//!     // Listens for clients, dispatches their requests and cleans up
//!     // after connections that time out.
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod client_manager;
pub mod error;
pub mod manager;
pub mod network;
pub mod race;
pub mod registry;
pub mod store;
pub mod text;
pub mod utils;
