//! Connection - handles an individual WebSocket client.
//!
//! Each connection runs in its own Tokio task:
//!
//! 1. WebSocket handshake; the access token rides in the `token` query
//!    parameter. Authentication failures complete the upgrade and then
//!    close with policy code 1008, so clients can read the reason.
//! 2. Register with the roster, announcing presence if this is the user's
//!    first device.
//! 3. A `tokio::select!` loop over inbound frames and the outbound queue.
//!    Handler failures are answered on this socket only and never tear the
//!    connection down.
//! 4. On exit, deregister and announce offline if that was the last device.

use crate::auth::{Authenticator, Identity, TokenError};
use crate::db::Database;
use crate::events::Outbound;
use crate::push::PushSender;
use crate::relay::{self, presence};
use crate::state::Roster;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Outbound queue depth per connection. A client that stops reading has
/// this much slack before fan-out skips it.
const OUTBOUND_QUEUE: usize = 64;

/// A client connection handler.
pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    db: Database,
    roster: Arc<Roster>,
    authenticator: Arc<Authenticator>,
    push: Arc<dyn PushSender>,
}

impl Connection {
    /// Create a new connection handler.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        db: Database,
        roster: Arc<Roster>,
        authenticator: Arc<Authenticator>,
        push: Arc<dyn PushSender>,
    ) -> Self {
        Self {
            stream,
            addr,
            db,
            roster,
            authenticator,
            push,
        }
    }

    /// Run the connection to completion.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            stream,
            addr,
            db,
            roster,
            authenticator,
            push,
        } = self;

        // Pull the token out of the upgrade request's query string.
        let mut token: Option<String> = None;
        let callback = |req: &Request, resp: Response| {
            token = req
                .uri()
                .query()
                .and_then(extract_token)
                .map(String::from);
            Ok(resp)
        };
        let mut ws = accept_hdr_async(stream, callback).await?;

        let identity = match token.as_deref().map(|t| authenticator.decode(t)) {
            Some(Ok(identity)) => identity,
            Some(Err(TokenError::Expired)) => {
                return reject(&mut ws, addr, "token expired").await;
            }
            Some(Err(TokenError::Invalid)) | None => {
                return reject(&mut ws, addr, "invalid token").await;
            }
        };
        let Identity {
            user_id,
            session_id,
        } = identity;

        // A token bound to a revoked session is no longer good.
        if let Some(sid) = session_id
            && !db.sessions().is_live(sid).await?
        {
            return reject(&mut ws, addr, "session revoked").await;
        }
        if db.users().find_by_id(user_id).await?.is_none() {
            return reject(&mut ws, addr, "unknown user").await;
        }

        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let (conn_id, came_online) = roster.connect(user_id, tx);
        info!(user_id, %addr, "Client connected");

        if let Err(e) = db.users().touch_last_seen(user_id).await {
            warn!(user_id, error = %e, "Failed to stamp last seen");
        }
        if came_online
            && let Err(e) = presence::broadcast_status(&db, &roster, user_id, true).await
        {
            warn!(user_id, error = %e, "Failed to announce online status");
        }

        let ctx = relay::Context {
            db: db.clone(),
            roster: roster.clone(),
            push,
            user_id,
        };

        let (mut sink, mut inbound) = ws.split();

        loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = relay::dispatch(&ctx, &text).await {
                            debug!(user_id, error = %e, "Frame rejected");
                            let reply = Outbound::Error {
                                error: e.to_string(),
                            };
                            if sink.send(WsMessage::Text(reply.to_json())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary and pong frames are ignored
                    Some(Err(e)) => {
                        debug!(user_id, error = %e, "Read error");
                        break;
                    }
                },
                queued = rx.recv() => match queued {
                    Some(frame) => {
                        if sink.send(WsMessage::Text(frame.to_json())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        let went_offline = roster.disconnect(user_id, conn_id);
        if let Err(e) = db.users().touch_last_seen(user_id).await {
            warn!(user_id, error = %e, "Failed to stamp last seen");
        }
        if went_offline
            && let Err(e) = presence::broadcast_status(&db, &roster, user_id, false).await
        {
            warn!(user_id, error = %e, "Failed to announce offline status");
        }
        info!(user_id, %addr, "Client disconnected");
        Ok(())
    }
}

/// Close the socket with policy code 1008 and the given reason.
async fn reject(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    addr: SocketAddr,
    reason: &'static str,
) -> anyhow::Result<()> {
    info!(%addr, reason, "Rejecting unauthenticated connection");
    ws.close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    }))
    .await?;
    Ok(())
}

fn extract_token(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::extract_token;

    #[test]
    fn token_extraction() {
        assert_eq!(extract_token("token=abc"), Some("abc"));
        assert_eq!(extract_token("device=phone&token=abc"), Some("abc"));
        assert_eq!(extract_token("token="), None);
        assert_eq!(extract_token("other=1"), None);
        assert_eq!(extract_token(""), None);
    }
}
