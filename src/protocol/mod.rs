//! # Protocol State Machines
//!
//! Connection-scoped protocol logic layered above the raw transport:
//! the verifier-based login handshake.
//!
//! ## Components
//! - **Auth**: SRP-style challenge/response establishing a per-peer session key

pub mod auth;

pub use auth::{AuthSession, AuthState};
