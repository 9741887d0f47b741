//! Shared server state.
//!
//! The roster is the live connection registry and the canonical source of
//! who is online.

mod roster;

pub use roster::{ConnId, Roster};
