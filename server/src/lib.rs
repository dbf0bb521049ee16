//! # Co-op Coordination Server Library
//!
//! This library is the authoritative coordination core of a cooperative
//! extension for a single-player action RPG. It does not render or simulate
//! anything itself. Instead it ingests typed events from host-bridge adapters,
//! keeps narrative and conversation state consistent across a handful of
//! peers, and sends authoritative decisions back for the hosts to enact.
//!
//! ## Core Responsibilities
//!
//! ### Identity & Sessions
//! Every bridge authenticates before it may send anything:
//! - Session tokens with a fixed time-to-live
//! - Permission levels and named capabilities
//! - Account, IP and hardware bans
//! - A sliding-window limit on failed login attempts
//!
//! ### Dialog Coordination
//! Conversations with NPCs are shared sessions with one speaker, optional
//! listeners and participants, proximity gating, and voted or consensus
//! choices with deadlines.
//!
//! ### Quest Synchronization
//! One authoritative record per quest. Divergent player progress is detected,
//! voted on or resolved by policy, and broadcast as full-sync packets.
//!
//! ### Supervision
//! Each component runs as a subsystem of the lifecycle orchestrator, which
//! starts them in dependency order, health-checks them, restarts failures
//! within a budget, and shuts everything down when an essential one is lost.
//!
//! ## Architecture Design
//!
//! ### Explicit Composition
//! There are no globals. [`coop::CoopCore`] owns one of each component, and
//! tests build as many independent cores as they need.
//!
//! ### Plain Locks, Deferred Effects
//! Each component guards its tables with `std::sync` locks and never calls
//! another component while holding one. Events are collected inside a critical
//! section and published on the [`event_bus::EventBus`] after the guard drops;
//! authoritative packets go to a non-blocking [`bridge::Outbox`].
//!
//! ### Deadlines Instead of Suspension
//! Votes and dialogs carry absolute deadlines read from a [`clock::Clock`].
//! A periodic tick polls them, so tests drive time with a manual clock.
//!
//! ## Module Organization
//!
//! - `auth`: identity, sessions, permissions, bans, rate limiting, persistence hooks
//! - `dialog`: the dialog coordinator and its vote arithmetic
//! - `quest`: the quest engine, conflict records, dependency graph, validation
//! - `lifecycle`: subsystem contract, dependency ordering, supervision
//! - `event_bus`: typed synchronous publish/subscribe
//! - `bridge`: the host-bridge seam and the decision outbox
//! - `coop`: the composition root
//! - `config`, `error`, `clock`: ambient plumbing
//! - `network`, `client_manager`: the UDP transport and its peer table
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use coop_server::config::CoreConfig;
//! use coop_server::coop::CoopCore;
//! use coop_server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::default();
//!     let core = Arc::new(CoopCore::new(config.clone())?);
//!     core.initialize()?;
//!
//!     // Receives bridge packets, ticks the core at the configured rate,
//!     // and fans authoritative decisions out to the connected bridges
//!     let mut server = Server::new(core, &config.network).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bridge;
pub mod client_manager;
pub mod clock;
pub mod config;
pub mod coop;
pub mod dialog;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod network;
pub mod quest;
pub(crate) mod utils;
