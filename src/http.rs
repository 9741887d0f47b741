//! HTTP API for account, session, chat, and history management.
//!
//! The relay socket only moves live events; everything else (register,
//! login, token refresh, session management, chat setup, history paging)
//! is a plain REST surface served by axum on its own task.

use crate::auth::{Authenticator, Identity, TokenError};
use crate::db::{Database, DeviceInfo, StoreError};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
    pub authenticator: Arc<Authenticator>,
    pub refresh_ttl_days: i64,
}

/// Error surface of the API. Everything renders as `{"error": "..."}` with
/// a meaningful status code.
#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    Token(TokenError),
    Unauthorized(&'static str),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        Self::Token(err)
    }
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::Token(TokenError::Expired) => {
                (StatusCode::UNAUTHORIZED, "token_expired".to_string())
            }
            Self::Token(TokenError::Invalid) => {
                (StatusCode::UNAUTHORIZED, "token_invalid".to_string())
            }
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, (*msg).to_string()),
            Self::Store(err) => {
                let status = match err {
                    StoreError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                    StoreError::UserNotFound(_)
                    | StoreError::ChatNotFound(_)
                    | StoreError::MessageNotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
                    StoreError::ChatFull
                    | StoreError::PrivateChatImmutable
                    | StoreError::InvalidParticipants(_) => StatusCode::BAD_REQUEST,
                    e if e.is_forbidden() => StatusCode::FORBIDDEN,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %err, "Request failed");
                    (status, "internal error".to_string())
                } else {
                    (status, err.to_string())
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/revoke_all", post(revoke_all_sessions))
        .route("/api/v1/sessions/:id", delete(revoke_session))
        .route("/api/v1/chats", get(list_chats))
        .route("/api/v1/chats/private", post(create_private_chat))
        .route("/api/v1/chats/group", post(create_group_chat))
        .route("/api/v1/chats/:id/clear", post(clear_chat_history))
        .route("/api/v1/chats/:id/nickname", post(set_chat_nickname))
        .route("/api/v1/messages/history/:chat_id", get(message_history))
        .route(
            "/api/v1/users/:id/block",
            post(block_user).delete(unblock_user),
        )
        .with_state(state)
}

/// Serve the API until the process exits.
pub async fn run_http_server(addr: SocketAddr, state: ApiState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Resolve the bearer token in `Authorization` to an identity, honoring
/// session revocation for session-bound tokens.
async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized("missing bearer token"))?;

    let identity = state.authenticator.decode(token)?;
    if let Some(sid) = identity.session_id
        && !state.db.sessions().is_live(sid).await?
    {
        return Err(ApiError::Unauthorized("session revoked"));
    }
    Ok(identity)
}

#[derive(Deserialize)]
struct RegisterRequest {
    phone: String,
    username: Option<String>,
    first_name: String,
    last_name: Option<String>,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    user_id: i64,
}

async fn register(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .users()
        .create(
            &req.phone,
            req.username.as_deref(),
            &req.first_name,
            req.last_name.as_deref(),
            &req.password,
        )
        .await?;
    info!(user_id = user.id, "User registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id: user.id }),
    ))
}

#[derive(Deserialize)]
struct LoginRequest {
    phone: String,
    password: String,
    device_name: Option<String>,
    device_type: Option<String>,
    location: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    user_id: i64,
    session_id: i64,
    access_token: String,
    refresh_token: String,
}

async fn login(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .db
        .users()
        .verify_credentials(&req.phone, &req.password)
        .await?;

    let refresh_token = crate::auth::generate_refresh_token();
    let device = DeviceInfo {
        device_name: req.device_name,
        device_type: req.device_type,
        ip_address: Some(peer.ip().to_string()),
        location: req.location,
    };
    let session = state
        .db
        .sessions()
        .create(
            user.id,
            &crate::auth::hash_refresh_token(&refresh_token),
            &device,
            state.refresh_ttl_days,
        )
        .await?;

    let access_token = state
        .authenticator
        .issue(user.id, Some(session.id))
        .map_err(ApiError::Token)?;

    info!(user_id = user.id, session_id = session.id, "Login");
    Ok(Json(LoginResponse {
        user_id: user.id,
        session_id: session.id,
        access_token,
        refresh_token,
    }))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Serialize)]
struct RefreshResponse {
    access_token: String,
}

async fn refresh(
    State(state): State<ApiState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let hash = crate::auth::hash_refresh_token(&req.refresh_token);
    let session = state
        .db
        .sessions()
        .validate_and_touch(&hash)
        .await?
        .ok_or(ApiError::Unauthorized("invalid refresh token"))?;

    let access_token = state
        .authenticator
        .issue(session.user_id, Some(session.id))
        .map_err(ApiError::Token)?;
    Ok(Json(RefreshResponse { access_token }))
}

async fn logout(
    State(state): State<ApiState>,
    Json(req): Json<RefreshRequest>,
) -> Result<StatusCode, ApiError> {
    let hash = crate::auth::hash_refresh_token(&req.refresh_token);
    if let Some(session) = state.db.sessions().validate_and_touch(&hash).await? {
        state
            .db
            .sessions()
            .revoke(session.user_id, session.id)
            .await?;
    }
    // Logout is idempotent; an already-dead token is fine.
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct SessionView {
    id: i64,
    device_name: Option<String>,
    device_type: Option<String>,
    ip_address: Option<String>,
    location: Option<String>,
    created_at: i64,
    last_used_at: i64,
    is_current: bool,
}

async fn list_sessions(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let sessions = state.db.sessions().list_active(identity.user_id).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionView {
                id: s.id,
                device_name: s.device_name,
                device_type: s.device_type,
                ip_address: s.ip_address,
                location: s.location,
                created_at: s.created_at,
                last_used_at: s.last_used_at,
                is_current: identity.session_id == Some(s.id),
            })
            .collect(),
    ))
}

async fn revoke_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    if state
        .db
        .sessions()
        .revoke(identity.user_id, session_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

#[derive(Serialize)]
struct RevokeAllResponse {
    revoked: u64,
}

async fn revoke_all_sessions(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<RevokeAllResponse>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let revoked = state
        .db
        .sessions()
        .revoke_all(identity.user_id, identity.session_id)
        .await?;
    Ok(Json(RevokeAllResponse { revoked }))
}

#[derive(Serialize)]
struct ChatView {
    id: i64,
    chat_type: &'static str,
    name: Option<String>,
    owner_id: Option<i64>,
    unread_count: i64,
}

async fn list_chats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatView>>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let chats = state.db.chats().list_for_user(identity.user_id).await?;

    let mut views = Vec::with_capacity(chats.len());
    for chat in chats {
        let unread_count = state
            .db
            .messages()
            .unread_count(chat.id, identity.user_id)
            .await?;
        views.push(ChatView {
            id: chat.id,
            chat_type: match chat.chat_type {
                crate::db::ChatType::Private => "private",
                crate::db::ChatType::Group => "group",
            },
            name: chat.name,
            owner_id: chat.owner_id,
            unread_count,
        });
    }
    Ok(Json(views))
}

#[derive(Deserialize)]
struct PrivateChatRequest {
    user_id: i64,
}

#[derive(Serialize)]
struct ChatCreatedResponse {
    chat_id: i64,
}

async fn create_private_chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<PrivateChatRequest>,
) -> Result<Json<ChatCreatedResponse>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let chat = state
        .db
        .chats()
        .create_private(identity.user_id, req.user_id)
        .await?;
    Ok(Json(ChatCreatedResponse { chat_id: chat.id }))
}

#[derive(Deserialize)]
struct GroupChatRequest {
    name: String,
    member_ids: Vec<i64>,
}

async fn create_group_chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<GroupChatRequest>,
) -> Result<(StatusCode, Json<ChatCreatedResponse>), ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let chat = state
        .db
        .chats()
        .create_group(identity.user_id, &req.name, &req.member_ids)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ChatCreatedResponse { chat_id: chat.id }),
    ))
}

#[derive(Deserialize)]
struct NicknameRequest {
    nickname: Option<String>,
}

async fn set_chat_nickname(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Json(req): Json<NicknameRequest>,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state
        .db
        .chats()
        .set_nickname(chat_id, identity.user_id, req.nickname.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_chat_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state
        .db
        .chats()
        .clear_history(chat_id, identity.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    50
}

async fn message_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<crate::events::MessageBody>>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let messages = state
        .db
        .messages()
        .history(
            chat_id,
            identity.user_id,
            query.limit.min(200),
            query.offset,
        )
        .await?;
    Ok(Json(
        messages.iter().map(crate::events::MessageBody::from).collect(),
    ))
}

async fn block_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state.db.users().block(identity.user_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unblock_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state.db.users().unblock(identity.user_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let cases = [
            (
                ApiError::Token(TokenError::Expired),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::Store(StoreError::InvalidCredentials),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::Store(StoreError::ChatNotFound(1)),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Store(StoreError::AlreadyExists("dup")),
                StatusCode::CONFLICT,
            ),
            (ApiError::Store(StoreError::ChatFull), StatusCode::BAD_REQUEST),
            (
                ApiError::Store(StoreError::NotParticipant),
                StatusCode::FORBIDDEN,
            ),
            (
                ApiError::Store(StoreError::Blocked),
                StatusCode::FORBIDDEN,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_and_message().0, expected);
        }
    }

    #[test]
    fn expired_and_invalid_tokens_are_distinguishable() {
        let expired = ApiError::Token(TokenError::Expired).status_and_message().1;
        let invalid = ApiError::Token(TokenError::Invalid).status_and_message().1;
        assert_ne!(expired, invalid);
    }
}
