//! Chat repository: private and group conversations and their membership.

use super::StoreError;
use sqlx::SqlitePool;

/// Maximum number of participants in a group chat, owner included.
pub const GROUP_CAPACITY: usize = 30;

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum ChatType {
    /// Exactly two participants, membership fixed at creation.
    Private,
    /// Up to [`GROUP_CAPACITY`] participants with a designated owner.
    Group,
}

/// A conversation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Chat {
    pub id: i64,
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub owner_id: Option<i64>,
    pub created_at: i64,
}

/// A user's membership row in a chat, carrying their per-chat state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatParticipant {
    pub chat_id: i64,
    pub user_id: i64,
    pub custom_nickname: Option<String>,
    pub joined_at: i64,
    /// Visibility floor: messages sent at or before this are hidden for
    /// this participant.
    pub last_cleared_at: i64,
    /// Monotonic read cursor: highest message id this participant has read.
    pub last_read_message_id: i64,
}

/// Repository for chat operations.
pub struct ChatRepository<'a> {
    pool: &'a SqlitePool,
}

const CHAT_COLUMNS: &str = "id, chat_type, name, owner_id, created_at";
const PARTICIPANT_COLUMNS: &str =
    "chat_id, user_id, custom_nickname, joined_at, last_cleared_at, last_read_message_id";

impl<'a> ChatRepository<'a> {
    /// Create a new chat repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get or create the private chat between two users.
    ///
    /// There is at most one private chat per user pair; a second request
    /// returns the existing chat rather than creating a duplicate.
    pub async fn create_private(&self, user_a: i64, user_b: i64) -> Result<Chat, StoreError> {
        if user_a == user_b {
            return Err(StoreError::InvalidParticipants(
                "private chat needs two distinct users",
            ));
        }
        for uid in [user_a, user_b] {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
                .bind(uid)
                .fetch_one(self.pool)
                .await?;
            if exists == 0 {
                return Err(StoreError::UserNotFound(uid));
            }
        }
        if self.either_blocks(user_a, user_b).await? {
            return Err(StoreError::Blocked);
        }

        let (lo, hi) = if user_a < user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        let pair_key = format!("{lo}:{hi}");

        if let Some(existing) = self.find_private(user_a, user_b).await? {
            return Ok(existing);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO chats (chat_type, name, owner_id, pair_key, created_at) VALUES ('private', NULL, NULL, ?, ?)",
        )
        .bind(&pair_key)
        .bind(now)
        .execute(&mut *tx)
        .await;
        let chat_id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // A racing creation claimed the pair first; theirs is the
                // chat. Release the transaction before the lookup so it can
                // see the committed winner.
                drop(tx);
                if let Some(existing) = self.find_private(user_a, user_b).await? {
                    return Ok(existing);
                }
                return Err(sqlx::Error::Database(db_err).into());
            }
            Err(e) => return Err(e.into()),
        };

        for uid in [user_a, user_b] {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
            )
            .bind(chat_id)
            .bind(uid)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Chat {
            id: chat_id,
            chat_type: ChatType::Private,
            name: None,
            owner_id: None,
            created_at: now,
        })
    }

    /// Create a group chat owned by `owner_id` with the given members.
    /// The owner is always a participant; duplicate member ids are collapsed.
    pub async fn create_group(
        &self,
        owner_id: i64,
        name: &str,
        member_ids: &[i64],
    ) -> Result<Chat, StoreError> {
        let mut members = vec![owner_id];
        for &uid in member_ids {
            if !members.contains(&uid) {
                members.push(uid);
            }
        }
        if members.len() > GROUP_CAPACITY {
            return Err(StoreError::ChatFull);
        }
        for &uid in &members {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
                .bind(uid)
                .fetch_one(self.pool)
                .await?;
            if exists == 0 {
                return Err(StoreError::UserNotFound(uid));
            }
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result =
            sqlx::query("INSERT INTO chats (chat_type, name, owner_id, created_at) VALUES ('group', ?, ?, ?)")
                .bind(name)
                .bind(owner_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        let chat_id = result.last_insert_rowid();

        for &uid in &members {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
            )
            .bind(chat_id)
            .bind(uid)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Chat {
            id: chat_id,
            chat_type: ChatType::Group,
            name: Some(name.to_string()),
            owner_id: Some(owner_id),
            created_at: now,
        })
    }

    /// Get a chat by id.
    pub async fn get(&self, chat_id: i64) -> Result<Option<Chat>, StoreError> {
        let chat = sqlx::query_as::<_, Chat>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"
        ))
        .bind(chat_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(chat)
    }

    /// List all chats the user participates in, newest first.
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Chat>, StoreError> {
        let chats = sqlx::query_as::<_, Chat>(&format!(
            r#"
            SELECT {CHAT_COLUMNS} FROM chats
            WHERE id IN (SELECT chat_id FROM chat_participants WHERE user_id = ?)
            ORDER BY id DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;
        Ok(chats)
    }

    /// Whether the user is a participant of the chat.
    pub async fn is_participant(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_participants WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Fetch one participant row.
    pub async fn participant(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<ChatParticipant>, StoreError> {
        let row = sqlx::query_as::<_, ChatParticipant>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants WHERE chat_id = ? AND user_id = ?"
        ))
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row)
    }

    /// All participant rows of a chat.
    pub async fn participants(&self, chat_id: i64) -> Result<Vec<ChatParticipant>, StoreError> {
        let rows = sqlx::query_as::<_, ChatParticipant>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants WHERE chat_id = ? ORDER BY joined_at"
        ))
        .bind(chat_id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows)
    }

    /// The user ids of a chat's participants. This is the fan-out set.
    pub async fn participant_ids(&self, chat_id: i64) -> Result<Vec<i64>, StoreError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM chat_participants WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_all(self.pool)
                .await?;
        Ok(ids)
    }

    /// Add a user to a group chat. The actor must already be a participant.
    /// Returns false if the user was already a member (silent no-op).
    pub async fn add_participant(
        &self,
        chat_id: i64,
        actor_id: i64,
        user_id: i64,
    ) -> Result<bool, StoreError> {
        let chat = self
            .get(chat_id)
            .await?
            .ok_or(StoreError::ChatNotFound(chat_id))?;
        if chat.chat_type == ChatType::Private {
            return Err(StoreError::PrivateChatImmutable);
        }
        if !self.is_participant(chat_id, actor_id).await? {
            return Err(StoreError::NotParticipant);
        }
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(self.pool)
            .await?;
        if exists == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }

        let mut tx = self.pool.begin().await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_participants WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_one(&mut *tx)
                .await?;
        if count as usize >= GROUP_CAPACITY {
            return Err(StoreError::ChatFull);
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a user from a group chat. The owner may remove anyone; other
    /// participants may only remove themselves (leave).
    pub async fn remove_participant(
        &self,
        chat_id: i64,
        actor_id: i64,
        user_id: i64,
    ) -> Result<(), StoreError> {
        let chat = self
            .get(chat_id)
            .await?
            .ok_or(StoreError::ChatNotFound(chat_id))?;
        if chat.chat_type == ChatType::Private {
            return Err(StoreError::PrivateChatImmutable);
        }
        if actor_id != user_id && chat.owner_id != Some(actor_id) {
            return Err(StoreError::NotPermitted(
                "only the owner can remove other participants",
            ));
        }

        let result =
            sqlx::query("DELETE FROM chat_participants WHERE chat_id = ? AND user_id = ?")
                .bind(chat_id)
                .bind(user_id)
                .execute(self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotParticipant);
        }
        Ok(())
    }

    /// Set (or clear) the actor's display nickname within a chat.
    pub async fn set_nickname(
        &self,
        chat_id: i64,
        user_id: i64,
        nickname: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE chat_participants SET custom_nickname = ? WHERE chat_id = ? AND user_id = ?",
        )
        .bind(nickname)
        .bind(chat_id)
        .bind(user_id)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotParticipant);
        }
        Ok(())
    }

    /// Clear the chat's history for one participant by raising their
    /// visibility floor to now. Other participants are unaffected.
    pub async fn clear_history(&self, chat_id: i64, user_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE chat_participants SET last_cleared_at = ? WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(chat_id)
        .bind(user_id)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotParticipant);
        }
        Ok(())
    }

    /// Distinct users who share at least one chat with `user_id`. This is
    /// the audience for presence changes.
    pub async fn peers_of(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT user_id FROM chat_participants
            WHERE chat_id IN (SELECT chat_id FROM chat_participants WHERE user_id = ?)
              AND user_id != ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_private(&self, user_a: i64, user_b: i64) -> Result<Option<Chat>, StoreError> {
        let (lo, hi) = if user_a < user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        let chat = sqlx::query_as::<_, Chat>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE pair_key = ?"
        ))
        .bind(format!("{lo}:{hi}"))
        .fetch_optional(self.pool)
        .await?;
        Ok(chat)
    }

    async fn either_blocks(&self, user_a: i64, user_b: i64) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM user_blocks
            WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?)
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
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

    #[tokio::test]
    async fn private_chat_is_deduplicated() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 2).await;

        let first = db.chats().create_private(u[0], u[1]).await.expect("create");
        // Same pair, either order, comes back as the same chat.
        let second = db.chats().create_private(u[1], u[0]).await.expect("again");
        assert_eq!(first.id, second.id);
        assert_eq!(first.chat_type, ChatType::Private);

        let ids = db.chats().participant_ids(first.id).await.expect("ids");
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn racing_private_chat_creations_converge() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 2).await;
        let (a, b) = (u[0], u[1]);

        let db1 = db.clone();
        let db2 = db.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { db1.chats().create_private(a, b).await }),
            tokio::spawn(async move { db2.chats().create_private(b, a).await }),
        );
        let first = first.expect("join").expect("create");
        let second = second.expect("join").expect("create");
        assert_eq!(first.id, second.id);

        // The pair key admits exactly one private chat per user pair.
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE chat_type = 'private'")
                .fetch_one(db.pool())
                .await
                .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn private_chat_rejects_self_and_blocked() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 2).await;

        assert!(matches!(
            db.chats().create_private(u[0], u[0]).await,
            Err(StoreError::InvalidParticipants(_))
        ));

        db.users().block(u[1], u[0]).await.expect("block");
        assert!(matches!(
            db.chats().create_private(u[0], u[1]).await,
            Err(StoreError::Blocked)
        ));
    }

    #[tokio::test]
    async fn private_chat_membership_is_fixed() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 3).await;
        let chat = db.chats().create_private(u[0], u[1]).await.expect("create");

        assert!(matches!(
            db.chats().add_participant(chat.id, u[0], u[2]).await,
            Err(StoreError::PrivateChatImmutable)
        ));
        assert!(matches!(
            db.chats().remove_participant(chat.id, u[0], u[1]).await,
            Err(StoreError::PrivateChatImmutable)
        ));
    }

    #[tokio::test]
    async fn group_membership_rules() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 4).await;
        let chat = db
            .chats()
            .create_group(u[0], "team", &[u[1]])
            .await
            .expect("create");
        assert_eq!(chat.owner_id, Some(u[0]));

        // Non-participant cannot add.
        assert!(matches!(
            db.chats().add_participant(chat.id, u[2], u[3]).await,
            Err(StoreError::NotParticipant)
        ));

        assert!(db
            .chats()
            .add_participant(chat.id, u[0], u[2])
            .await
            .expect("add"));
        // Adding an existing member is a silent no-op.
        assert!(!db
            .chats()
            .add_participant(chat.id, u[0], u[2])
            .await
            .expect("re-add"));

        // Only the owner removes others; anyone may leave.
        assert!(matches!(
            db.chats().remove_participant(chat.id, u[1], u[2]).await,
            Err(StoreError::NotPermitted(_))
        ));
        db.chats()
            .remove_participant(chat.id, u[1], u[1])
            .await
            .expect("leave");
        db.chats()
            .remove_participant(chat.id, u[0], u[2])
            .await
            .expect("owner removes");

        let ids = db.chats().participant_ids(chat.id).await.expect("ids");
        assert_eq!(ids, vec![u[0]]);
    }

    #[tokio::test]
    async fn group_capacity_enforced() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, GROUP_CAPACITY + 1).await;

        // Owner plus GROUP_CAPACITY members overflows by one.
        assert!(matches!(
            db.chats().create_group(u[0], "too-big", &u[1..]).await,
            Err(StoreError::ChatFull)
        ));

        let chat = db
            .chats()
            .create_group(u[0], "full", &u[1..GROUP_CAPACITY])
            .await
            .expect("create at capacity");
        assert!(matches!(
            db.chats()
                .add_participant(chat.id, u[0], u[GROUP_CAPACITY])
                .await,
            Err(StoreError::ChatFull)
        ));
    }

    #[tokio::test]
    async fn list_for_user_and_clear_history() {
        let db = Database::new(":memory:").await.expect("db");
        let u = users(&db, 3).await;
        let private = db.chats().create_private(u[0], u[1]).await.expect("p");
        let group = db
            .chats()
            .create_group(u[0], "team", &[u[2]])
            .await
            .expect("g");

        let chats = db.chats().list_for_user(u[0]).await.expect("list");
        assert_eq!(chats.len(), 2);
        assert_eq!(db.chats().list_for_user(u[1]).await.expect("list").len(), 1);

        db.chats()
            .clear_history(private.id, u[0])
            .await
            .expect("clear");
        let row = db
            .chats()
            .participant(private.id, u[0])
            .await
            .expect("query")
            .expect("row");
        assert!(row.last_cleared_at > 0);

        // Not a participant of the other's view.
        assert!(matches!(
            db.chats().clear_history(group.id, u[1]).await,
            Err(StoreError::NotParticipant)
        ));
    }
}
