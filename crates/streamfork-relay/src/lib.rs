//! streamfork Relay Library
//!
//! Core functionality for the streamfork relay:
//! - Outbound forwarders for the storage and media destinations
//! - Per-connection sessions that buffer, flush and fan out inbound bytes
//! - The accept loop that spawns one session per client

pub mod error;
pub mod forwarder;
pub mod listener;
pub mod session;

pub use error::ForwarderError;
pub use forwarder::{Forwarder, Identifier, Role};
pub use listener::Relay;
pub use session::{Session, SessionState};
