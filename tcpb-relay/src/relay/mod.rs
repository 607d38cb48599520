pub mod connection;
pub mod listener;

pub use connection::{
    BridgeStats, CloseReason, Connection, ConnectionSequence, ConnectionState, MAX_CONNECTION_ID,
};
pub use listener::Listener;
