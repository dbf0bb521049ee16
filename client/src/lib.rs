//! # Reference Host Bridge
//!
//! This library is a minimal host-bridge adapter for the co-op coordination
//! server. A real bridge lives inside the game process, turns engine hooks into
//! typed host events and enacts the authoritative decisions it gets back. This
//! one does the protocol half of that job and leaves the game half to a
//! terminal.
//!
//! ## Protocol Flow
//!
//! 1. Send `Authenticate` with credentials and the protocol version
//! 2. Receive `Authenticated` (player id, session token, permissions) or `AuthFailed`
//! 3. Send `Event` packets carrying the session token, plus periodic `Heartbeat`s
//! 4. Receive `Decision` packets to enact, or `Error` when an event was refused
//! 5. Send `Logout`, or get a `SessionRevoked` decision from the server
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! UDP socket handling, packet encoding and the session state of one bridge.
//!
//! ### Commands Module (`commands`)
//! Parses the one-line text commands the CLI accepts into host events.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use bridge_client::network::{BridgeClient, BridgeUpdate};
//! use shared::{AuthMethod, HostEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut bridge = BridgeClient::new("127.0.0.1:7777").await?;
//!     if let BridgeUpdate::Authenticated(session) = bridge
//!         .authenticate("Nova", "secret", AuthMethod::Custom, "hw-1")
//!         .await?
//!     {
//!         bridge
//!             .send_event(HostEvent::PlayerJoin {
//!                 player_id: session.player_id,
//!                 display_name: "Nova".to_string(),
//!             })
//!             .await?;
//!         while let Some(update) = bridge.next_update().await? {
//!             println!("{:?}", update);
//!         }
//!         bridge.logout().await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod network;
