//! Push notification hook for offline recipients.
//!
//! The relay calls this for participants with no live connection. The
//! default implementation only logs; a real APNs/FCM bridge implements the
//! same trait. Delivery failures are logged and never fail the send path.

use async_trait::async_trait;
use tracing::info;

/// Sink for out-of-band notifications to offline users.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Deliver a notification. Errors are the implementation's problem to
    /// report; callers log and move on.
    async fn deliver(
        &self,
        user_id: i64,
        title: &str,
        body: &str,
        meta: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Push sink that records deliveries in the log.
#[derive(Debug, Default)]
pub struct LogPush;

#[async_trait]
impl PushSender for LogPush {
    async fn deliver(
        &self,
        user_id: i64,
        title: &str,
        body: &str,
        meta: &serde_json::Value,
    ) -> anyhow::Result<()> {
        info!(user_id, title = %title, body = %body, meta = %meta, "push notification");
        Ok(())
    }
}
