//! Live connection registry with per-user multi-device fan-out.
//!
//! Each WebSocket connection registers an outbound channel keyed by user id.
//! A user with several devices has several entries under the same key;
//! sending to a user clones the frame to every device. Presence is derived
//! from the registry: a user is online exactly while they have at least one
//! registered connection.

use crate::events::Outbound;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque id distinguishing devices of the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

struct LiveConnection {
    id: ConnId,
    tx: mpsc::Sender<Outbound>,
}

/// Connection registry. Cheap to clone-by-reference via `Arc` at call sites.
#[derive(Default)]
pub struct Roster {
    connections: DashMap<i64, Vec<LiveConnection>>,
    next_conn_id: AtomicU64,
}

impl Roster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user. Returns the connection id and
    /// whether this brought the user online (first device).
    pub fn connect(&self, user_id: i64, tx: mpsc::Sender<Outbound>) -> (ConnId, bool) {
        let id = ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.connections.entry(user_id).or_default();
        let came_online = entry.is_empty();
        entry.push(LiveConnection { id, tx });
        debug!(user_id, devices = entry.len(), "connection registered");
        (id, came_online)
    }

    /// Remove a connection. Returns whether the user went offline (that was
    /// their last device).
    pub fn disconnect(&self, user_id: i64, conn_id: ConnId) -> bool {
        let mut went_offline = false;
        if let Some(mut entry) = self.connections.get_mut(&user_id) {
            entry.retain(|c| c.id != conn_id);
            went_offline = entry.is_empty();
        }
        if went_offline {
            // Drop the empty vec so is_online stays a pure key lookup.
            self.connections.remove_if(&user_id, |_, v| v.is_empty());
        }
        went_offline
    }

    /// Whether the user has at least one live connection.
    pub fn is_online(&self, user_id: i64) -> bool {
        self.connections
            .get(&user_id)
            .is_some_and(|v| !v.is_empty())
    }

    /// Number of live connections for a user.
    pub fn device_count(&self, user_id: i64) -> usize {
        self.connections.get(&user_id).map_or(0, |v| v.len())
    }

    /// Send a frame to every device of a user. Returns true if at least one
    /// device accepted it. A device whose channel is closed or full is
    /// skipped; its own read loop handles teardown. Never waits: a stalled
    /// device must not hold up the user's other devices or the caller.
    pub fn send_to_user(&self, user_id: i64, frame: &Outbound) -> bool {
        let Some(entry) = self.connections.get(&user_id) else {
            return false;
        };

        let mut delivered = false;
        for conn in entry.iter() {
            match conn.tx.try_send(frame.clone()) {
                Ok(()) => delivered = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(user_id, "device queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Fan a frame out to a set of users, e.g. a chat's participants.
    pub fn broadcast(&self, user_ids: &[i64], frame: &Outbound) {
        for &uid in user_ids {
            self.send_to_user(uid, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChatEvent, Outbound};

    fn status_frame(user_id: i64) -> Outbound {
        Outbound::Event(ChatEvent::UserStatus {
            user_id,
            is_online: true,
            last_seen_at: 0,
        })
    }

    #[tokio::test]
    async fn multi_device_fan_out() {
        let roster = Roster::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let (c1, came_online) = roster.connect(7, tx1);
        assert!(came_online);
        let (c2, came_online) = roster.connect(7, tx2);
        assert!(!came_online);
        assert_eq!(roster.device_count(7), 2);

        assert!(roster.send_to_user(7, &status_frame(1)));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        // Dropping one device keeps the user online.
        assert!(!roster.disconnect(7, c1));
        assert!(roster.is_online(7));
        assert!(roster.disconnect(7, c2));
        assert!(!roster.is_online(7));
    }

    #[tokio::test]
    async fn send_to_offline_user_reports_undelivered() {
        let roster = Roster::new();
        assert!(!roster.send_to_user(42, &status_frame(1)));
    }

    #[tokio::test]
    async fn closed_receiver_does_not_count_as_delivery() {
        let roster = Roster::new();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        roster.connect(7, tx);
        assert!(!roster.send_to_user(7, &status_frame(1)));
    }

    #[tokio::test]
    async fn stalled_device_does_not_block_fan_out() {
        let roster = Roster::new();

        // A device that never reads, with its queue already full.
        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        stalled_tx.try_send(status_frame(0)).expect("fill queue");
        roster.connect(7, stalled_tx);

        let (healthy_tx, mut healthy_rx) = mpsc::channel(8);
        roster.connect(7, healthy_tx);

        // Must return promptly and still reach the healthy device.
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            roster.send_to_user(7, &status_frame(1))
        })
        .await
        .expect("send must not wait on a full queue");
        assert!(delivered);
        assert!(healthy_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_reaches_each_online_user() {
        let roster = Roster::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        roster.connect(1, tx_a);
        roster.connect(2, tx_b);

        roster.broadcast(&[1, 2, 3], &status_frame(9));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
