//! Presence notifications.
//!
//! A user is online exactly while the roster holds at least one connection
//! for them. Transitions are announced to everyone who shares a chat with
//! the user; a second device connecting or one of several disconnecting is
//! not a transition and stays silent.

use crate::db::{Database, StoreError};
use crate::events::{ChatEvent, Outbound};
use crate::state::Roster;

/// Announce an online/offline transition to the user's chat peers.
pub async fn broadcast_status(
    db: &Database,
    roster: &Roster,
    user_id: i64,
    is_online: bool,
) -> Result<(), StoreError> {
    let last_seen_at = if is_online {
        0
    } else {
        chrono::Utc::now().timestamp()
    };

    let peers = db.chats().peers_of(user_id).await?;
    roster.broadcast(
        &peers,
        &Outbound::Event(ChatEvent::UserStatus {
            user_id,
            is_online,
            last_seen_at,
        }),
    );
    Ok(())
}
