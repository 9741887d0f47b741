//! User repository: identities, credentials, and block lists.

use super::StoreError;
use crate::auth;
use sqlx::SqlitePool;

/// A registered user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub phone: String,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub password_hash: String,
    /// Unix timestamp of last authenticated activity or disconnect.
    pub last_seen_at: i64,
    pub created_at: i64,
}

/// Repository for user operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

const USER_COLUMNS: &str =
    "id, phone, username, first_name, last_name, password_hash, last_seen_at, created_at";

impl<'a> UserRepository<'a> {
    /// Create a new user repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a new user, hashing the password.
    pub async fn create(
        &self,
        phone: &str,
        username: Option<&str>,
        first_name: &str,
        last_name: Option<&str>,
        password: &str,
    ) -> Result<User, StoreError> {
        let password_hash =
            auth::hash_password(password).map_err(|_| StoreError::InvalidCredentials)?;
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO users (phone, username, first_name, last_name, password_hash, last_seen_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(phone)
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .bind(&password_hash)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::AlreadyExists("phone or username already registered");
            }
            StoreError::from(e)
        })?;

        Ok(User {
            id: result.last_insert_rowid(),
            phone: phone.to_string(),
            username: username.map(String::from),
            first_name: first_name.to_string(),
            last_name: last_name.map(String::from),
            password_hash,
            last_seen_at: now,
            created_at: now,
        })
    }

    /// Find a user by id.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// Find a user by phone number.
    pub async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE phone = ?"
        ))
        .bind(phone)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// Find a user by username.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// Verify phone + password and return the user if valid.
    ///
    /// Fails closed: an unknown phone and a wrong password are
    /// indistinguishable to the caller, and the unknown-phone path performs
    /// a dummy hash verification so timing does not leak account existence.
    pub async fn verify_credentials(
        &self,
        phone: &str,
        password: &str,
    ) -> Result<User, StoreError> {
        let Some(user) = self.find_by_phone(phone).await? else {
            auth::dummy_password_verify(password);
            return Err(StoreError::InvalidCredentials);
        };

        auth::verify_password(password, &user.password_hash)
            .map_err(|_| StoreError::InvalidCredentials)?;

        Ok(user)
    }

    /// Stamp the user's last-seen timestamp as now.
    pub async fn touch_last_seen(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_seen_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(user_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Block another user. Re-blocking is a silent no-op.
    pub async fn block(&self, blocker_id: i64, blocked_id: i64) -> Result<(), StoreError> {
        if blocker_id == blocked_id {
            return Err(StoreError::NotPermitted("cannot block yourself"));
        }
        if self.find_by_id(blocked_id).await?.is_none() {
            return Err(StoreError::UserNotFound(blocked_id));
        }

        sqlx::query(
            "INSERT OR IGNORE INTO user_blocks (blocker_id, blocked_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(blocker_id)
        .bind(blocked_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Remove a block. Unblocking an unblocked user is a silent no-op.
    pub async fn unblock(&self, blocker_id: i64, blocked_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM user_blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id)
            .bind(blocked_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Whether `blocker_id` has blocked `target_id`.
    pub async fn is_blocked(&self, blocker_id: i64, target_id: i64) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_blocks WHERE blocker_id = ? AND blocked_id = ?",
        )
        .bind(blocker_id)
        .bind(target_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use super::*;

    async fn test_db() -> Database {
        Database::new(":memory:").await.expect("in-memory db")
    }

    #[tokio::test]
    async fn create_and_verify_credentials() {
        let db = test_db().await;
        let user = db
            .users()
            .create("+15550001", Some("alice"), "Alice", None, "hunter2")
            .await
            .expect("create user");
        assert_eq!(user.phone, "+15550001");

        let verified = db
            .users()
            .verify_credentials("+15550001", "hunter2")
            .await
            .expect("verify");
        assert_eq!(verified.id, user.id);

        assert!(matches!(
            db.users().verify_credentials("+15550001", "wrong").await,
            Err(StoreError::InvalidCredentials)
        ));
        assert!(matches!(
            db.users().verify_credentials("+19990000", "hunter2").await,
            Err(StoreError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn duplicate_phone_rejected() {
        let db = test_db().await;
        db.users()
            .create("+15550001", None, "Alice", None, "pw")
            .await
            .expect("first create");
        assert!(matches!(
            db.users().create("+15550001", None, "Bob", None, "pw").await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn block_unblock_round_trip() {
        let db = test_db().await;
        let a = db
            .users()
            .create("+1", None, "A", None, "pw")
            .await
            .expect("a");
        let b = db
            .users()
            .create("+2", None, "B", None, "pw")
            .await
            .expect("b");

        assert!(!db.users().is_blocked(a.id, b.id).await.expect("query"));
        db.users().block(a.id, b.id).await.expect("block");
        assert!(db.users().is_blocked(a.id, b.id).await.expect("query"));
        // One-directional.
        assert!(!db.users().is_blocked(b.id, a.id).await.expect("query"));
        // Re-blocking is a no-op.
        db.users().block(a.id, b.id).await.expect("re-block");

        db.users().unblock(a.id, b.id).await.expect("unblock");
        assert!(!db.users().is_blocked(a.id, b.id).await.expect("query"));
    }

    #[tokio::test]
    async fn self_block_rejected() {
        let db = test_db().await;
        let a = db
            .users()
            .create("+1", None, "A", None, "pw")
            .await
            .expect("a");
        assert!(matches!(
            db.users().block(a.id, a.id).await,
            Err(StoreError::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn touch_last_seen_advances() {
        let db = test_db().await;
        let a = db
            .users()
            .create("+1", None, "A", None, "pw")
            .await
            .expect("a");
        sqlx::query("UPDATE users SET last_seen_at = 0 WHERE id = ?")
            .bind(a.id)
            .execute(db.pool())
            .await
            .expect("reset");
        db.users().touch_last_seen(a.id).await.expect("touch");
        let user = db.users().find_by_id(a.id).await.expect("find").expect("some");
        assert!(user.last_seen_at > 0);
    }
}
