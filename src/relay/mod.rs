//! Relay protocol: dispatch of inbound WebSocket frames.
//!
//! Every inbound frame is JSON with a `type` discriminator; a frame without
//! one is a `new_message` (the overwhelmingly common case). Handler failures
//! are scoped to the offending frame: the caller reports them back on the
//! same socket and keeps the connection alive.

mod message;
pub mod presence;
mod read;

use crate::db::{Database, StoreError};
use crate::push::PushSender;
use crate::state::Roster;
use std::sync::Arc;
use thiserror::Error;

/// A handler failure, rendered as `{"error": "..."}` to the sender.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("{0}")]
    Store(#[from] StoreError),
}

/// Everything a handler needs, bound to the authenticated user of one
/// connection.
pub struct Context {
    pub db: Database,
    pub roster: Arc<Roster>,
    pub push: Arc<dyn PushSender>,
    pub user_id: i64,
}

/// Parse and execute one inbound frame.
pub async fn dispatch(ctx: &Context, raw: &str) -> Result<(), RelayError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| RelayError::Malformed(e.to_string()))?;

    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("new_message")
        .to_string();

    match event_type.as_str() {
        "new_message" => message::handle_send(ctx, parse(value)?).await,
        "read" => read::handle_read(ctx, parse(value)?).await,
        "edit" => message::handle_edit(ctx, parse(value)?).await,
        "delete" => message::handle_delete(ctx, parse(value)?).await,
        "pin" => message::handle_pin(ctx, parse(value)?).await,
        _ => Err(RelayError::UnknownType(event_type)),
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, RelayError> {
    serde_json::from_value(value).map_err(|e| RelayError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::LogPush;

    async fn test_ctx(user_id: i64) -> Context {
        Context {
            db: Database::new(":memory:").await.expect("db"),
            roster: Arc::new(Roster::new()),
            push: Arc::new(LogPush),
            user_id,
        }
    }

    #[tokio::test]
    async fn unknown_type_is_named_in_the_error() {
        let ctx = test_ctx(1).await;
        let err = dispatch(&ctx, r#"{"type": "dance"}"#)
            .await
            .expect_err("should fail");
        assert!(matches!(err, RelayError::UnknownType(ref t) if t == "dance"));
        assert_eq!(err.to_string(), "unknown event type: dance");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let ctx = test_ctx(1).await;
        assert!(matches!(
            dispatch(&ctx, "{not json").await,
            Err(RelayError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn missing_type_means_new_message() {
        let ctx = test_ctx(1).await;
        // Parses as new_message, then fails in the store because the chat
        // does not exist. That proves the default route was taken.
        let err = dispatch(&ctx, r#"{"chat_id": 5, "content": "hi"}"#)
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            RelayError::Store(StoreError::ChatNotFound(5))
        ));
    }

    #[tokio::test]
    async fn missing_fields_are_a_scoped_validation_error() {
        let ctx = test_ctx(1).await;
        assert!(matches!(
            dispatch(&ctx, r#"{"type": "read", "chat_id": 1}"#).await,
            Err(RelayError::Malformed(_))
        ));
    }
}
