//! Session repository: refresh-token-backed device sessions.
//!
//! A session is created at login, keyed by the SHA-256 hash of its opaque
//! refresh token. Only the hash is stored; presenting the token is the only
//! way to exercise the session.

use super::StoreError;
use sqlx::SqlitePool;

/// A device session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub refresh_token_hash: String,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub ip_address: Option<String>,
    pub location: Option<String>,
    pub created_at: i64,
    pub last_used_at: i64,
    pub expires_at: i64,
    pub is_active: bool,
}

/// Device metadata captured at login.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub ip_address: Option<String>,
    pub location: Option<String>,
}

/// Repository for session operations.
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

const SESSION_COLUMNS: &str = "id, user_id, refresh_token_hash, device_name, device_type, \
     ip_address, location, created_at, last_used_at, expires_at, is_active";

impl<'a> SessionRepository<'a> {
    /// Create a new session repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a session, replacing any still-active session for the same
    /// (user, device name, ip address) tuple. A re-login from the same
    /// device supersedes the old session instead of accumulating rows.
    pub async fn create(
        &self,
        user_id: i64,
        refresh_token_hash: &str,
        device: &DeviceInfo,
        ttl_days: i64,
    ) -> Result<Session, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + ttl_days * 86_400;

        let mut tx = self.pool.begin().await?;

        // `IS ?` rather than `= ?` so NULL device fields compare equal.
        sqlx::query(
            r#"
            UPDATE user_sessions SET is_active = 0
            WHERE user_id = ? AND is_active = 1
              AND device_name IS ? AND ip_address IS ?
            "#,
        )
        .bind(user_id)
        .bind(&device.device_name)
        .bind(&device.ip_address)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO user_sessions
                (user_id, refresh_token_hash, device_name, device_type,
                 ip_address, location, created_at, last_used_at, expires_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(user_id)
        .bind(refresh_token_hash)
        .bind(&device.device_name)
        .bind(&device.device_type)
        .bind(&device.ip_address)
        .bind(&device.location)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Session {
            id: result.last_insert_rowid(),
            user_id,
            refresh_token_hash: refresh_token_hash.to_string(),
            device_name: device.device_name.clone(),
            device_type: device.device_type.clone(),
            ip_address: device.ip_address.clone(),
            location: device.location.clone(),
            created_at: now,
            last_used_at: now,
            expires_at,
            is_active: true,
        })
    }

    /// Validate a refresh token hash and stamp the session as used, in one
    /// statement. Returns `None` for an unknown hash, a revoked session, or
    /// an expired session; none of those are distinguishable to the caller.
    pub async fn validate_and_touch(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let session = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE user_sessions SET last_used_at = ?
            WHERE refresh_token_hash = ? AND is_active = 1 AND expires_at > ?
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(refresh_token_hash)
        .bind(now)
        .fetch_optional(self.pool)
        .await?;
        Ok(session)
    }

    /// Whether a session is still active and unexpired. Used to honor
    /// revocation for access tokens bound to a session.
    pub async fn is_live(&self, session_id: i64) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_sessions WHERE id = ? AND is_active = 1 AND expires_at > ?",
        )
        .bind(session_id)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }

    /// List a user's active, unexpired sessions, most recently used first.
    pub async fn list_active(&self, user_id: i64) -> Result<Vec<Session>, StoreError> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM user_sessions
            WHERE user_id = ? AND is_active = 1 AND expires_at > ?
            ORDER BY last_used_at DESC
            "#
        ))
        .bind(user_id)
        .bind(chrono::Utc::now().timestamp())
        .fetch_all(self.pool)
        .await?;
        Ok(sessions)
    }

    /// Revoke one of the user's sessions. Returns false if the session did
    /// not exist, belonged to someone else, or was already revoked.
    pub async fn revoke(&self, user_id: i64, session_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = 0 WHERE id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(session_id)
        .bind(user_id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke all of the user's sessions, optionally sparing the current one.
    /// Returns the number of sessions revoked.
    pub async fn revoke_all(
        &self,
        user_id: i64,
        keep_session_id: Option<i64>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions SET is_active = 0
            WHERE user_id = ? AND is_active = 1 AND (? IS NULL OR id != ?)
            "#,
        )
        .bind(user_id)
        .bind(keep_session_id)
        .bind(keep_session_id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete sessions that have passed their expiry. Run periodically;
    /// expiry is also enforced at validation time, so this is housekeeping
    /// that keeps the table from accumulating dead rows.
    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= ?")
            .bind(chrono::Utc::now().timestamp())
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
