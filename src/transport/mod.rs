//! # Transport and Reliability
//!
//! Turns a lossy, unordered, size-limited datagram channel into ordered,
//! deduplicated, arbitrarily-sized delivery, and multiplexes many such
//! connections behind one poll loop.
//!
//! ## Components
//! - **Wire**: datagram framing (header, ack, split sub-header, control)
//! - **Channel**: per-lane sequencing, retransmission, reorder, reassembly
//! - **Peer**: the connection state machine
//! - **Scheduler**: the multi-peer poll loop the host drives

pub mod channel;
pub mod peer;
pub mod scheduler;
pub mod wire;

pub use peer::{Credentials, DisconnectReason, PeerEvent, PeerState};
pub use scheduler::{Engine, PeerId, PollOutcome};
