//! # voxelnet
//!
//! Programmable client engine for a voxel multiplayer game's UDP protocol.
//!
//! The engine maintains connections to one or more game servers, performs a
//! verifier-based login handshake, exchanges versioned binary game packets
//! reliably over UDP, and surfaces decoded packets to a host (typically a
//! scripting layer) through a poll-style event loop.
//!
//! ## Layers
//! - [`codec`]: versioned mapping between wire bytes and generic
//!   [`LogicalPacket`](codec::value::LogicalPacket) values
//! - [`transport`]: reliability (sequencing, acks, retransmission, split
//!   reassembly), the peer state machine, and the poll scheduler
//! - [`protocol`]: the SRP-style authentication handshake
//! - [`config`]: policy constants with documented defaults
//!
//! ## Example
//! ```no_run
//! use std::time::Duration;
//! use voxelnet::{Credentials, Engine, PollOutcome};
//!
//! # async fn run() -> voxelnet::Result<()> {
//! let engine: Engine<String> = Engine::with_defaults()?;
//! let creds = Credentials {
//!     player_name: "alice".into(),
//!     password: "hunter2".into(),
//! };
//! engine
//!     .connect("203.0.113.7:30000".parse().unwrap(), &creds, "main".into())
//!     .await?;
//!
//! while !engine.is_cancelled() {
//!     match engine.poll(Duration::from_millis(100)).await? {
//!         PollOutcome::Event { handle, event, .. } => {
//!             println!("{handle}: {event:?}");
//!         }
//!         PollOutcome::TimedOut => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use codec::value::{FieldValue, LogicalPacket};
pub use config::EngineConfig;
pub use error::{ProtocolError, Result};
pub use transport::{
    Credentials, DisconnectReason, Engine, PeerEvent, PeerId, PeerState, PollOutcome,
};
