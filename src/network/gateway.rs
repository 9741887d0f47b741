//! Gateway - listener that accepts incoming WebSocket connections.
//!
//! The Gateway binds a socket and spawns a Connection task for each
//! incoming client.

use crate::auth::Authenticator;
use crate::db::Database;
use crate::network::Connection;
use crate::push::PushSender;
use crate::state::Roster;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Accepts incoming connections and spawns handlers.
pub struct Gateway {
    listener: TcpListener,
    db: Database,
    roster: Arc<Roster>,
    authenticator: Arc<Authenticator>,
    push: Arc<dyn PushSender>,
}

impl Gateway {
    /// Bind the gateway to the specified address.
    pub async fn bind(
        addr: SocketAddr,
        db: Database,
        roster: Arc<Roster>,
        authenticator: Arc<Authenticator>,
        push: Arc<dyn PushSender>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Relay listener bound");
        Ok(Self {
            listener,
            db,
            roster,
            authenticator,
            push,
        })
    }

    /// The actual bound address. Differs from the requested one when
    /// binding port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let connection = Connection::new(
                stream,
                addr,
                self.db.clone(),
                self.roster.clone(),
                self.authenticator.clone(),
                self.push.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = connection.run().await {
                    debug!(%addr, error = %e, "Connection ended with error");
                }
            });
        }
    }
}
