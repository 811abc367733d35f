//! # Lockstep Session Server Library
//!
//! This library provides the session server for a lockstep multiplayer
//! game. Every client runs the same deterministic simulation; the server
//! admits clients, hands them a snapshot of the world, and from then on
//! only distributes the commands everyone must execute and the frame up to
//! which everyone may advance.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Each connection walks a fixed ladder of states:
//! `INACTIVE → AUTH_GAME → IDENTIFY → NEWGRFS_CHECK → AUTHORIZED → MAP_WAIT →
//! MAP → DONE_MAP → PRE_ACTIVE → ACTIVE`. A state only accepts the packets
//! that make sense in it; anything else closes the session.
//!
//! ### Map Transfer
//! Joining clients download a snapshot of the world one at a time. Others
//! wait in a queue and are told their position until it is their turn.
//!
//! ### Command Distribution
//! Commands from all clients are collected into one queue, stamped with the
//! frame they run at and sent to every client in the same order.
//!
//! ### Liveness
//! Frame tokens and per-state deadlines, counted in simulation frames, make
//! sure a slow or silent client cannot hold the game back.
//!
//! ## Architecture Design
//!
//! ### Single Owner
//! [`server::Server`] owns all sessions and every piece of shared state. It
//! is driven by a single loop: bytes read, connections lost and ticks all go
//! through it in order, so handlers never race each other.
//!
//! ### TCP Transport
//! The protocol is ordered and reliable. Each connection gets a reader task
//! and a writer task; the writer drains an unbounded queue of outgoing
//! frames so the owner loop never waits on a slow peer.
//!
//! ## Module Organization
//!
//! - `config`: tunables, all deadlines expressed in frames
//! - `error`: why a session closes and what the peer is told
//! - `session`: per-client state, receive budget and outgoing queue
//! - `pool`: bounded slot storage with generation-checked keys
//! - `auth`: pluggable authentication and optional encryption
//! - `world`: the simulation seam and a small reference world
//! - `map_transfer`: single-flight snapshot download with a wait queue
//! - `broadcaster`: command collection and lockstep distribution
//! - `server`: the state machine tying it all together
//! - `network`: tokio TCP front end running the server at its tick rate
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::PasswordAuthenticator;
//! use server::config::ServerConfig;
//! use server::network::NetworkServer;
//! use server::server::Server;
//! use server::world::LedgerWorld;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let server = Server::new(
//!         config,
//!         LedgerWorld::new(),
//!         Box::new(PasswordAuthenticator::new(None)),
//!     );
//!
//!     // Accepts clients and ticks the server until shut down.
//!     let mut network = NetworkServer::bind("127.0.0.1:3979", server).await?;
//!     network.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod map_transfer;
pub mod network;
pub mod pool;
pub mod server;
pub mod session;
pub mod world;

pub use config::ServerConfig;
pub use error::CloseReason;
pub use pool::SessionKey;
pub use server::{Server, ServerEvent};
pub use session::{ClientStatus, Outgoing, Transport};
