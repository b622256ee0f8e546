//! # Armada Game Server Library
//!
//! The authoritative server core for a multiplayer space game. It owns the
//! canonical world, processes client commands and inputs, persists accounts,
//! and replicates entity state to every logged-in client.
//!
//! ## Thread Layout
//!
//! ### Transport Reactor
//! One thread per UDP endpoint runs a small reliable-UDP host (handshake,
//! reliable ordered channels with fragmentation, sequenced unreliable and
//! unordered delivery, keep-alives, timeouts). Game code queues commands
//! through a [`ReactorHandle`](transport::ReactorHandle) and sees results
//! only when it polls the reactor.
//!
//! ### Database Workers
//! A pool of threads, each owning one connection, executes prepared
//! statements and transactions. Results come back with their continuation
//! and run when the simulation polls the pipeline.
//!
//! ### Simulation
//! Exactly one thread owns the [`Game`]: sessions, the entity arena, the
//! broadcast scheduler. Each tick it polls the reactor, polls the database,
//! applies inputs in timestamp order, integrates bodies and replicates.
//!
//! ## Module Organization
//!
//! - [`transport`]: wire frames, the host state machine and the reactor thread
//! - [`database`]: worker pool, statement registry, transactions, SQLite backend
//! - [`store`]: the schema and the statements the game uses
//! - [`world`]: entity arena, prefabs and the integrator
//! - [`broadcast`]: creation/deletion tracking and bandwidth-bounded snapshots
//! - [`session`]: per-peer login state and input buffering
//! - [`game`]: command handlers and the tick helpers that tie it together
//! - [`capability`]: the action surface offered to ship modules
//! - [`config`]: defaults, TOML file and validation
//! - [`server`]: assembly and the fixed-rate loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ServerConfig::default();
//!     config.port = 8080;
//!     config.tick_rate = 30;
//!
//!     // Blocks until the database is ready and prefabs are loaded
//!     let mut server = Server::start(&config)?;
//!
//!     // Ticks until the flag is cleared:
//!     // - Drains transport events and database results
//!     // - Applies inputs in chronological order across all sessions
//!     // - Integrates bodies at the configured tick rate
//!     // - Sends creation/deletion batches and snapshots
//!     let running = AtomicBool::new(true);
//!     server.run(&running);
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod capability;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod game;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;
pub mod world;

pub use config::ServerConfig;
pub use error::{ConfigError, DbError, ServerError, TransportError};
pub use game::Game;
pub use server::Server;
