//! Message repository: the message store, visibility, and the read-cursor
//! protocol.
//!
//! Read state is double-entry: `message_reads` is the authoritative ledger of
//! who read what, and `chat_participants.last_read_message_id` is the compact
//! per-participant cursor. [`MessageRepository::mark_read`] advances both in
//! one transaction and is idempotent under retries and racing devices.

use super::chats::ChatType;
use super::StoreError;
use sqlx::SqlitePool;

/// Message payload kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
}

/// Coarse delivery status, kept for clients that render a single check mark.
/// The receipt ledger is the authoritative record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// A stored message. Content is an opaque byte payload; the server never
/// interprets it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    /// None once the sender's account has been deleted.
    pub sender_id: Option<i64>,
    pub content: Vec<u8>,
    pub kind: MessageKind,
    pub sent_at: i64,
    pub status: MessageStatus,
    pub is_pinned: bool,
    pub is_edited: bool,
    pub reply_to_id: Option<i64>,
}

/// Outcome of a mark-read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRead {
    /// The cursor moved forward. `receipts` is the number of newly recorded
    /// reads; replays report zero new receipts but still count as advanced
    /// if the cursor moved.
    Advanced { receipts: u64, cursor: i64 },
    /// The cursor was already at or past the target. Nothing to broadcast.
    NoOp,
}

/// Repository for message operations.
pub struct MessageRepository<'a> {
    pool: &'a SqlitePool,
}

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, content, kind, sent_at, status, is_pinned, is_edited, reply_to_id";

impl<'a> MessageRepository<'a> {
    /// Create a new message repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new message.
    ///
    /// The sender must be a participant. In a private chat a block in either
    /// direction rejects the send. A reply target must be a message of the
    /// same chat.
    pub async fn send(
        &self,
        chat_id: i64,
        sender_id: i64,
        content: &[u8],
        kind: MessageKind,
        reply_to_id: Option<i64>,
    ) -> Result<Message, StoreError> {
        let chat = super::ChatRepository::new(self.pool)
            .get(chat_id)
            .await?
            .ok_or(StoreError::ChatNotFound(chat_id))?;

        let participants = super::ChatRepository::new(self.pool)
            .participant_ids(chat_id)
            .await?;
        if !participants.contains(&sender_id) {
            return Err(StoreError::NotParticipant);
        }

        if chat.chat_type == ChatType::Private {
            let peer = participants.iter().copied().find(|&id| id != sender_id);
            if let Some(peer) = peer {
                let blocked: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM user_blocks
                    WHERE (blocker_id = ? AND blocked_id = ?)
                       OR (blocker_id = ? AND blocked_id = ?)
                    "#,
                )
                .bind(peer)
                .bind(sender_id)
                .bind(sender_id)
                .bind(peer)
                .fetch_one(self.pool)
                .await?;
                if blocked > 0 {
                    return Err(StoreError::Blocked);
                }
            }
        }

        if let Some(reply_id) = reply_to_id {
            let in_chat: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE id = ? AND chat_id = ?")
                    .bind(reply_id)
                    .bind(chat_id)
                    .fetch_one(self.pool)
                    .await?;
            if in_chat == 0 {
                return Err(StoreError::MessageNotFound(reply_id));
            }
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO messages (chat_id, sender_id, content, kind, sent_at, reply_to_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(sender_id)
        .bind(content)
        .bind(kind)
        .bind(now)
        .bind(reply_to_id)
        .execute(self.pool)
        .await?;

        Ok(Message {
            id: result.last_insert_rowid(),
            chat_id,
            sender_id: Some(sender_id),
            content: content.to_vec(),
            kind,
            sent_at: now,
            status: MessageStatus::Sent,
            is_pinned: false,
            is_edited: false,
            reply_to_id,
        })
    }

    /// Get a message by id.
    pub async fn get(&self, message_id: i64) -> Result<Option<Message>, StoreError> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(message)
    }

    /// Page through a chat's history as seen by one participant, respecting
    /// their visibility floor. Newest first, plain limit/offset pagination.
    pub async fn history(
        &self,
        chat_id: i64,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let participant = super::ChatRepository::new(self.pool)
            .participant(chat_id, user_id)
            .await?
            .ok_or(StoreError::NotParticipant)?;

        let page = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE chat_id = ? AND sent_at > ?
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(chat_id)
        .bind(participant.last_cleared_at)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool)
        .await?;

        Ok(page)
    }

    /// Advance a participant's read cursor to `last_message_id`, recording a
    /// receipt for every newly covered message not sent by the reader.
    ///
    /// Idempotent and monotonic: a replay or an out-of-order call for an
    /// already-covered message is a [`MarkRead::NoOp`]. The cursor update is
    /// guarded in SQL, so concurrent calls from two devices settle on the
    /// higher cursor and each receipt is recorded exactly once.
    pub async fn mark_read(
        &self,
        chat_id: i64,
        user_id: i64,
        last_message_id: i64,
    ) -> Result<MarkRead, StoreError> {
        let mut tx = self.pool.begin().await?;

        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT last_read_message_id FROM chat_participants WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let cursor = cursor.ok_or(StoreError::NotParticipant)?;

        let target_exists: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE id = ? AND chat_id = ?")
                .bind(last_message_id)
                .bind(chat_id)
                .fetch_one(&mut *tx)
                .await?;
        if target_exists == 0 {
            return Err(StoreError::MessageNotFound(last_message_id));
        }

        if last_message_id <= cursor {
            return Ok(MarkRead::NoOp);
        }

        // Receipts for every message the cursor jump covers. INSERT OR
        // IGNORE makes replays and racing devices converge on one receipt
        // per (message, reader).
        let receipts = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
            SELECT id, ?, ? FROM messages
            WHERE chat_id = ? AND id > ? AND id <= ?
              AND sender_id IS NOT NULL AND sender_id != ?
            "#,
        )
        .bind(user_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(chat_id)
        .bind(cursor)
        .bind(last_message_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE messages SET status = 'read'
            WHERE chat_id = ? AND id <= ? AND status != 'read'
              AND sender_id IS NOT NULL AND sender_id != ?
            "#,
        )
        .bind(chat_id)
        .bind(last_message_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        // Guarded advance: a racer that already pushed the cursor further
        // wins, and this call degrades to a no-op.
        let advanced = sqlx::query(
            r#"
            UPDATE chat_participants SET last_read_message_id = ?
            WHERE chat_id = ? AND user_id = ? AND last_read_message_id < ?
            "#,
        )
        .bind(last_message_id)
        .bind(chat_id)
        .bind(user_id)
        .bind(last_message_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if advanced == 0 {
            return Ok(MarkRead::NoOp);
        }

        tx.commit().await?;
        Ok(MarkRead::Advanced {
            receipts,
            cursor: last_message_id,
        })
    }

    /// Number of messages past the participant's read cursor, excluding
    /// their own.
    pub async fn unread_count(&self, chat_id: i64, user_id: i64) -> Result<i64, StoreError> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT last_read_message_id FROM chat_participants WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        let cursor = cursor.ok_or(StoreError::NotParticipant)?;

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE chat_id = ? AND id > ? AND sender_id IS NOT NULL AND sender_id != ?
            "#,
        )
        .bind(chat_id)
        .bind(cursor)
        .bind(user_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }

    /// Replace a message's content. Only the sender may edit.
    pub async fn edit(
        &self,
        message_id: i64,
        actor_id: i64,
        content: &[u8],
    ) -> Result<Message, StoreError> {
        let message = self
            .get(message_id)
            .await?
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if message.sender_id != Some(actor_id) {
            return Err(StoreError::NotPermitted("only the sender can edit"));
        }

        let updated = sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET content = ?, is_edited = 1 WHERE id = ? RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(content)
        .bind(message_id)
        .fetch_one(self.pool)
        .await?;
        Ok(updated)
    }

    /// Delete a message. The sender may always delete their own; in a group
    /// chat the owner may delete any message.
    pub async fn delete(&self, message_id: i64, actor_id: i64) -> Result<Message, StoreError> {
        let message = self
            .get(message_id)
            .await?
            .ok_or(StoreError::MessageNotFound(message_id))?;

        if message.sender_id != Some(actor_id) {
            let chat = super::ChatRepository::new(self.pool)
                .get(message.chat_id)
                .await?
                .ok_or(StoreError::ChatNotFound(message.chat_id))?;
            if chat.owner_id != Some(actor_id) {
                return Err(StoreError::NotPermitted(
                    "only the sender or chat owner can delete",
                ));
            }
        }

        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(self.pool)
            .await?;
        Ok(message)
    }

    /// Pin or unpin a message. Any participant of the chat may do this.
    pub async fn set_pinned(
        &self,
        message_id: i64,
        actor_id: i64,
        pinned: bool,
    ) -> Result<Message, StoreError> {
        let message = self
            .get(message_id)
            .await?
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if !super::ChatRepository::new(self.pool)
            .is_participant(message.chat_id, actor_id)
            .await?
        {
            return Err(StoreError::NotParticipant);
        }

        let updated = sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET is_pinned = ? WHERE id = ? RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(pinned)
        .bind(message_id)
        .fetch_one(self.pool)
        .await?;
        Ok(updated)
    }

    /// Users who have a receipt for this message, oldest read first.
    pub async fn readers(&self, message_id: i64) -> Result<Vec<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM message_reads WHERE message_id = ? ORDER BY read_at",
        )
        .bind(message_id)
        .fetch_all(self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use super::*;

    async fn users(db: &Database, n: usize) -> Vec<i64> {
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let id = db
                .users()
                .create(&format!("+{i}"), None, "User", None, "pw")
                .await
                .expect("create user")
                .id;
            ids.push(id);
        }
        ids
    }

    async fn private_chat(db: &Database) -> (i64, Vec<i64>) {
        let u = users(db, 2).await;
        let chat = db.chats().create_private(u[0], u[1]).await.expect("chat");
        (chat.id, u)
    }

    #[tokio::test]
    async fn send_requires_participation() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 3).await;
        let chat = db.chats().create_private(u[0], u[1]).await.expect("chat");

        let msg = db
            .messages()
            .send(chat.id, u[0], b"hello", MessageKind::Text, None)
            .await
            .expect("send");
        assert_eq!(msg.status, MessageStatus::Sent);

        assert!(matches!(
            db.messages()
                .send(chat.id, u[2], b"intruder", MessageKind::Text, None)
                .await,
            Err(StoreError::NotParticipant)
        ));
        assert!(matches!(
            db.messages()
                .send(999, u[0], b"void", MessageKind::Text, None)
                .await,
            Err(StoreError::ChatNotFound(999))
        ));
    }

    #[tokio::test]
    async fn blocked_private_chat_rejects_send() {
        let db = Database::new(":memory:").await.expect("db");
        let (chat_id, u) = private_chat(&db).await;

        db.users().block(u[1], u[0]).await.expect("block");
        assert!(matches!(
            db.messages()
                .send(chat_id, u[0], b"hi", MessageKind::Text, None)
                .await,
            Err(StoreError::Blocked)
        ));
        // The block gags the blocker's side too.
        assert!(matches!(
            db.messages()
                .send(chat_id, u[1], b"hi", MessageKind::Text, None)
                .await,
            Err(StoreError::Blocked)
        ));

        db.users().unblock(u[1], u[0]).await.expect("unblock");
        db.messages()
            .send(chat_id, u[0], b"hi", MessageKind::Text, None)
            .await
            .expect("send after unblock");
    }

    #[tokio::test]
    async fn reply_must_target_same_chat() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 3).await;
        let chat_a = db.chats().create_private(u[0], u[1]).await.expect("a");
        let chat_b = db.chats().create_private(u[0], u[2]).await.expect("b");

        let original = db
            .messages()
            .send(chat_a.id, u[0], b"root", MessageKind::Text, None)
            .await
            .expect("send");

        let reply = db
            .messages()
            .send(chat_a.id, u[1], b"re", MessageKind::Text, Some(original.id))
            .await
            .expect("reply");
        assert_eq!(reply.reply_to_id, Some(original.id));

        assert!(matches!(
            db.messages()
                .send(chat_b.id, u[0], b"re", MessageKind::Text, Some(original.id))
                .await,
            Err(StoreError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn mark_read_advances_once_and_is_idempotent() {
        let db = Database::new(":memory:").await.expect("db");
        let (chat_id, u) = private_chat(&db).await;

        let m1 = db
            .messages()
            .send(chat_id, u[0], b"one", MessageKind::Text, None)
            .await
            .expect("m1");
        let m2 = db
            .messages()
            .send(chat_id, u[0], b"two", MessageKind::Text, None)
            .await
            .expect("m2");

        assert_eq!(db.messages().unread_count(chat_id, u[1]).await.expect("count"), 2);

        // First call covers both messages.
        let first = db
            .messages()
            .mark_read(chat_id, u[1], m2.id)
            .await
            .expect("mark");
        assert_eq!(
            first,
            MarkRead::Advanced {
                receipts: 2,
                cursor: m2.id
            }
        );
        assert_eq!(db.messages().unread_count(chat_id, u[1]).await.expect("count"), 0);

        // Replay is a no-op, as is an out-of-order call for an older message.
        assert_eq!(
            db.messages().mark_read(chat_id, u[1], m2.id).await.expect("replay"),
            MarkRead::NoOp
        );
        assert_eq!(
            db.messages().mark_read(chat_id, u[1], m1.id).await.expect("stale"),
            MarkRead::NoOp
        );

        assert_eq!(db.messages().readers(m1.id).await.expect("readers"), vec![u[1]]);
        let m1_after = db.messages().get(m1.id).await.expect("get").expect("some");
        assert_eq!(m1_after.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn mark_read_skips_own_messages_and_validates_target() {
        let db = Database::new(":memory:").await.expect("db");
        let (chat_id, u) = private_chat(&db).await;

        let theirs = db
            .messages()
            .send(chat_id, u[0], b"in", MessageKind::Text, None)
            .await
            .expect("theirs");
        let mine = db
            .messages()
            .send(chat_id, u[1], b"out", MessageKind::Text, None)
            .await
            .expect("mine");

        // Reading up to my own message records a receipt only for theirs.
        let result = db
            .messages()
            .mark_read(chat_id, u[1], mine.id)
            .await
            .expect("mark");
        assert_eq!(
            result,
            MarkRead::Advanced {
                receipts: 1,
                cursor: mine.id
            }
        );
        assert!(db.messages().readers(mine.id).await.expect("readers").is_empty());
        assert_eq!(db.messages().readers(theirs.id).await.expect("readers"), vec![u[1]]);

        assert!(matches!(
            db.messages().mark_read(chat_id, u[1], 9999).await,
            Err(StoreError::MessageNotFound(9999))
        ));
        assert!(matches!(
            db.messages().mark_read(chat_id, 9999, theirs.id).await,
            Err(StoreError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn mark_read_partial_then_rest() {
        let db = Database::new(":memory:").await.expect("db");
        let (chat_id, u) = private_chat(&db).await;

        let mut ids = Vec::new();
        for body in [b"a".as_slice(), b"b", b"c"] {
            let m = db
                .messages()
                .send(chat_id, u[0], body, MessageKind::Text, None)
                .await
                .expect("send");
            ids.push(m.id);
        }

        let first = db
            .messages()
            .mark_read(chat_id, u[1], ids[1])
            .await
            .expect("partial");
        assert_eq!(
            first,
            MarkRead::Advanced {
                receipts: 2,
                cursor: ids[1]
            }
        );

        // Only the gap gets fresh receipts on the second advance.
        let second = db
            .messages()
            .mark_read(chat_id, u[1], ids[2])
            .await
            .expect("rest");
        assert_eq!(
            second,
            MarkRead::Advanced {
                receipts: 1,
                cursor: ids[2]
            }
        );
    }

    #[tokio::test]
    async fn history_respects_visibility_floor_and_pagination() {
        let db = Database::new(":memory:").await.expect("db");
        let (chat_id, u) = private_chat(&db).await;

        let early = db
            .messages()
            .send(chat_id, u[0], b"early", MessageKind::Text, None)
            .await
            .expect("early");

        // Clear for one participant, then backdate the early message so it
        // falls below their floor.
        db.chats().clear_history(chat_id, u[1]).await.expect("clear");
        sqlx::query("UPDATE messages SET sent_at = sent_at - 10 WHERE id = ?")
            .bind(early.id)
            .execute(db.pool())
            .await
            .expect("backdate");
        sqlx::query("UPDATE chat_participants SET last_cleared_at = last_cleared_at - 5 WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(u[1])
            .execute(db.pool())
            .await
            .expect("floor between");

        let late = db
            .messages()
            .send(chat_id, u[0], b"late", MessageKind::Text, None)
            .await
            .expect("late");

        // The clearing participant sees only the late message.
        let for_cleared = db
            .messages()
            .history(chat_id, u[1], 50, 0)
            .await
            .expect("history");
        assert_eq!(
            for_cleared.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![late.id]
        );

        // The other participant still sees everything, newest first.
        let for_other = db
            .messages()
            .history(chat_id, u[0], 50, 0)
            .await
            .expect("history");
        assert_eq!(
            for_other.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![late.id, early.id]
        );

        // Offset pagination: skip the newest page.
        let page = db
            .messages()
            .history(chat_id, u[0], 1, 1)
            .await
            .expect("page");
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![early.id]);
    }

    #[tokio::test]
    async fn edit_only_by_sender() {
        let db = Database::new(":memory:").await.expect("db");
        let (chat_id, u) = private_chat(&db).await;
        let msg = db
            .messages()
            .send(chat_id, u[0], b"draft", MessageKind::Text, None)
            .await
            .expect("send");

        assert!(matches!(
            db.messages().edit(msg.id, u[1], b"hijack").await,
            Err(StoreError::NotPermitted(_))
        ));

        let edited = db
            .messages()
            .edit(msg.id, u[0], b"final")
            .await
            .expect("edit");
        assert_eq!(edited.content, b"final");
        assert!(edited.is_edited);
    }

    #[tokio::test]
    async fn delete_by_sender_or_group_owner() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 3).await;
        let group = db
            .chats()
            .create_group(u[0], "team", &[u[1], u[2]])
            .await
            .expect("group");

        let msg = db
            .messages()
            .send(group.id, u[1], b"oops", MessageKind::Text, None)
            .await
            .expect("send");

        // A bystander cannot delete.
        assert!(matches!(
            db.messages().delete(msg.id, u[2]).await,
            Err(StoreError::NotPermitted(_))
        ));
        // The owner can delete anyone's message.
        db.messages().delete(msg.id, u[0]).await.expect("owner delete");
        assert!(db.messages().get(msg.id).await.expect("get").is_none());
        assert!(matches!(
            db.messages().delete(msg.id, u[0]).await,
            Err(StoreError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn pin_by_any_participant() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 3).await;
        let group = db
            .chats()
            .create_group(u[0], "team", &[u[1]])
            .await
            .expect("group");
        let msg = db
            .messages()
            .send(group.id, u[0], b"notice", MessageKind::Text, None)
            .await
            .expect("send");

        let pinned = db
            .messages()
            .set_pinned(msg.id, u[1], true)
            .await
            .expect("pin");
        assert!(pinned.is_pinned);

        assert!(matches!(
            db.messages().set_pinned(msg.id, u[2], false).await,
            Err(StoreError::NotParticipant)
        ));

        let unpinned = db
            .messages()
            .set_pinned(msg.id, u[0], false)
            .await
            .expect("unpin");
        assert!(!unpinned.is_pinned);
    }
}
