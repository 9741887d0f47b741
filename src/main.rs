//! dialogd - real-time chat backend daemon.
//!
//! Serves a WebSocket relay for live messaging plus an HTTP API for
//! accounts, sessions, chats, and history.

use dialogd::auth::Authenticator;
use dialogd::config::Config;
use dialogd::db::Database;
use dialogd::http::{self, ApiState};
use dialogd::network::Gateway;
use dialogd::push::LogPush;
use dialogd::state::Roster;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Secrets that ship in example configs and must never sign real tokens.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "secret", "test-secret"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(server = %config.server.name, "Starting dialogd");

    // Refuse to start with a placeholder token secret: every access token
    // would be forgeable.
    if PLACEHOLDER_SECRETS.contains(&config.auth.token_secret.as_str())
        || config.auth.token_secret.len() < 16
    {
        if std::env::var("DIALOGD_ALLOW_INSECURE_SECRET").is_ok() {
            tracing::warn!(
                "INSECURE: Running with weak token_secret (allowed via DIALOGD_ALLOW_INSECURE_SECRET)"
            );
        } else {
            error!("FATAL: Insecure token_secret detected!");
            error!("  The token_secret signs access tokens; a weak one makes them forgeable.");
            error!("  Set a strong secret in config.toml:");
            error!("    [auth]");
            error!("    token_secret = \"<random-32-char-string>\"");
            error!("  Generate one with: openssl rand -hex 32");
            error!("  For testing only, set DIALOGD_ALLOW_INSECURE_SECRET=1 to bypass.");
            return Err(anyhow::anyhow!(
                "Refusing to start with insecure token_secret"
            ));
        }
    }

    // Initialize database
    let db_path = config
        .database
        .as_ref()
        .map(|d| d.path.as_str())
        .unwrap_or("dialogd.db");
    let db = Database::new(db_path).await?;

    let roster = Arc::new(Roster::new());
    let authenticator = Arc::new(Authenticator::new(
        &config.auth.token_secret,
        config.auth.access_ttl_minutes,
    ));

    // Expired session sweep (runs hourly; expiry is also checked at use).
    {
        let db = db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                match db.sessions().sweep_expired().await {
                    Ok(swept) if swept > 0 => {
                        info!(swept, "Expired sessions deleted");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Session sweep failed");
                    }
                }
            }
        });
    }
    info!("Session sweep task started");

    // HTTP API on its own task.
    {
        let state = ApiState {
            db: db.clone(),
            authenticator: authenticator.clone(),
            refresh_ttl_days: config.auth.refresh_ttl_days,
        };
        let addr = config.http.address;
        tokio::spawn(async move {
            if let Err(e) = http::run_http_server(addr, state).await {
                error!(error = %e, "HTTP server error");
            }
        });
    }

    // Start the relay gateway.
    let gateway = Gateway::bind(
        config.listen.address,
        db,
        roster,
        authenticator,
        Arc::new(LogPush),
    )
    .await?;

    gateway.run().await?;

    Ok(())
}
