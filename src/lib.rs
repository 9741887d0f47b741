//! dialogd - Real-time chat backend daemon.
//!
//! A WebSocket relay with live fan-out to every connected device,
//! refresh-token-backed sessions, and an idempotent per-participant
//! read-cursor protocol, persisted in SQLite.

pub mod auth;
pub mod config;
pub mod db;
pub mod events;
pub mod http;
pub mod network;
pub mod push;
pub mod relay;
pub mod state;
