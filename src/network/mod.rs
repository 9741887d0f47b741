//! Network module.
//!
//! Contains the Gateway (WebSocket listener) and the per-connection handler.

mod connection;
mod gateway;

pub use connection::Connection;
pub use gateway::Gateway;
