//! Message handlers: send, edit, delete, pin.

use super::{Context, RelayError};
use crate::events::{
    ChatEvent, DeleteRequest, EditRequest, MessageBody, Outbound, PinRequest, SendMessageRequest,
};
use tracing::warn;

/// Store a new message and fan it out to every participant's devices.
/// Offline participants get a push notification instead.
pub(super) async fn handle_send(ctx: &Context, req: SendMessageRequest) -> Result<(), RelayError> {
    let message = ctx
        .db
        .messages()
        .send(
            req.chat_id,
            ctx.user_id,
            req.content.as_bytes(),
            req.kind,
            req.reply_to_id,
        )
        .await?;

    let participants = ctx.db.chats().participant_ids(req.chat_id).await?;
    let frame = Outbound::Event(ChatEvent::NewMessage {
        message: MessageBody::from(&message),
    });

    let meta = serde_json::json!({
        "chat_id": message.chat_id,
        "message_id": message.id,
    });
    for &uid in &participants {
        let delivered = ctx.roster.send_to_user(uid, &frame);
        if !delivered && uid != ctx.user_id {
            if let Err(e) = ctx
                .push
                .deliver(uid, "New message", &req.content, &meta)
                .await
            {
                warn!(user_id = uid, error = %e, "push delivery failed");
            }
        }
    }
    Ok(())
}

/// Replace a message's content and announce the edit to the chat.
pub(super) async fn handle_edit(ctx: &Context, req: EditRequest) -> Result<(), RelayError> {
    let message = ctx
        .db
        .messages()
        .edit(req.message_id, ctx.user_id, req.content.as_bytes())
        .await?;

    let participants = ctx.db.chats().participant_ids(message.chat_id).await?;
    ctx.roster.broadcast(
        &participants,
        &Outbound::Event(ChatEvent::MessageEdited {
            message: MessageBody::from(&message),
        }),
    );
    Ok(())
}

/// Delete a message and announce the removal to the chat.
pub(super) async fn handle_delete(ctx: &Context, req: DeleteRequest) -> Result<(), RelayError> {
    let message = ctx.db.messages().delete(req.message_id, ctx.user_id).await?;

    let participants = ctx.db.chats().participant_ids(message.chat_id).await?;
    ctx.roster.broadcast(
        &participants,
        &Outbound::Event(ChatEvent::MessageDeleted {
            chat_id: message.chat_id,
            message_id: message.id,
        }),
    );
    Ok(())
}

/// Pin or unpin a message and announce the change to the chat.
pub(super) async fn handle_pin(ctx: &Context, req: PinRequest) -> Result<(), RelayError> {
    let message = ctx
        .db
        .messages()
        .set_pinned(req.message_id, ctx.user_id, req.is_pinned)
        .await?;

    let participants = ctx.db.chats().participant_ids(message.chat_id).await?;
    ctx.roster.broadcast(
        &participants,
        &Outbound::Event(ChatEvent::MessagePinned {
            chat_id: message.chat_id,
            message_id: message.id,
            is_pinned: message.is_pinned,
        }),
    );
    Ok(())
}
