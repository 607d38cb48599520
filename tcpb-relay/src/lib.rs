//! tcp-balance relay library
//!
//! This library provides the client-facing side of the balancer including:
//! - The listener and its accept loop
//! - Connection bridging between a client and its resolved upstream

pub mod error;
pub mod relay;

// Re-export commonly used types
pub use error::RelayError;
pub use relay::{BridgeStats, CloseReason, Connection, ConnectionSequence, ConnectionState, Listener};
