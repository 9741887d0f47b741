//! Database module for persistent storage.
//!
//! Provides async SQLite database access using SQLx for:
//! - Users, credentials, and block lists
//! - Refresh-token-backed sessions
//! - Chats and their participants
//! - Messages and the read-receipt ledger

mod chats;
mod messages;
mod sessions;
mod users;

pub use chats::{Chat, ChatParticipant, ChatRepository, ChatType, GROUP_CAPACITY};
pub use messages::{MarkRead, Message, MessageKind, MessageRepository, MessageStatus};
pub use sessions::{DeviceInfo, Session, SessionRepository};
pub use users::{User, UserRepository};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Database errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(sqlx::migrate::MigrateError),
    #[error("user not found: {0}")]
    UserNotFound(i64),
    #[error("chat not found: {0}")]
    ChatNotFound(i64),
    #[error("message not found: {0}")]
    MessageNotFound(i64),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not a chat participant")]
    NotParticipant,
    #[error("blocked by recipient")]
    Blocked,
    #[error("not permitted: {0}")]
    NotPermitted(&'static str),
    #[error("group chat is full")]
    ChatFull,
    #[error("private chat membership is fixed")]
    PrivateChatImmutable,
    #[error("invalid participant set: {0}")]
    InvalidParticipants(&'static str),
    #[error("already exists: {0}")]
    AlreadyExists(&'static str),
}

impl StoreError {
    /// Whether this error means "authenticated but not entitled".
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            Self::NotParticipant | Self::Blocked | Self::NotPermitted(_)
        )
    }
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let pool = if path == ":memory:" {
            // Use a uniquely named shared-cache memory database per call.
            // `file::memory:` is global-ish and will collide across parallel tests.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let memdb_uri = format!(
                "file:dialogd-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );

            let options = SqliteConnectOptions::new()
                .filename(&memdb_uri)
                .shared_cache(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            // File-based database; create the parent directory if missing.
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "Database connected");

        // Run embedded migrations
        Self::run_migrations(&pool).await?;

        // WAL mode allows reads to happen while writes are in progress
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        // Foreign key constraints back the ON DELETE CASCADE / SET NULL schema
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run embedded migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(StoreError::Migration)?;

        info!("Database migrations checked/applied");
        Ok(())
    }

    /// Get user repository.
    pub fn users(&self) -> UserRepository<'_> {
        UserRepository::new(&self.pool)
    }

    /// Get session repository.
    pub fn sessions(&self) -> SessionRepository<'_> {
        SessionRepository::new(&self.pool)
    }

    /// Get chat repository.
    pub fn chats(&self) -> ChatRepository<'_> {
        ChatRepository::new(&self.pool)
    }

    /// Get message repository.
    pub fn messages(&self) -> MessageRepository<'_> {
        MessageRepository::new(&self.pool)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Sqlx(err)
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err)
    }
}
