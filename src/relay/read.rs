//! Read-cursor handler.

use super::{Context, RelayError};
use crate::db::MarkRead;
use crate::events::{ChatEvent, Outbound, ReadRequest};

/// Advance the caller's read cursor. Broadcast only when the cursor actually
/// moved; replays and stale cursors are silently absorbed.
///
/// The broadcast includes the reader's own devices so a phone catching up
/// also clears the unread badge on their laptop.
pub(super) async fn handle_read(ctx: &Context, req: ReadRequest) -> Result<(), RelayError> {
    let outcome = ctx
        .db
        .messages()
        .mark_read(req.chat_id, ctx.user_id, req.message_id)
        .await?;

    let MarkRead::Advanced { cursor, .. } = outcome else {
        return Ok(());
    };

    let participants = ctx.db.chats().participant_ids(req.chat_id).await?;
    ctx.roster.broadcast(
        &participants,
        &Outbound::Event(ChatEvent::MessageRead {
            chat_id: req.chat_id,
            reader_id: ctx.user_id,
            last_read_message_id: cursor,
        }),
    );
    Ok(())
}
