//! Credential store: password hashing and access/refresh token handling.
//!
//! Passwords are hashed with Argon2. Access tokens are short-lived signed
//! JWTs carrying the user id and, when issued against a session, the
//! session id (which makes them indirectly revocable). Refresh tokens are
//! opaque random secrets; only their SHA-256 hash is ever persisted.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Password verification errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password hashing failed")]
    Hash,
    #[error("invalid credentials")]
    Invalid,
}

/// Access token decode failures.
///
/// `Expired` and `Invalid` are deliberately distinct so callers can surface
/// "expired" to clients that want to auto-refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
}

/// The identity carried by a decoded access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub session_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id, stringified per JWT convention.
    sub: String,
    /// Session id, present when the token was issued against a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<i64>,
    /// Expiry as Unix timestamp.
    exp: i64,
}

/// Issues and validates signed access tokens.
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
}

impl Authenticator {
    /// Create an authenticator from the signing secret and access TTL.
    pub fn new(secret: &str, access_ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs: access_ttl_minutes * 60,
        }
    }

    /// Issue a signed access token for a user, optionally bound to a session.
    pub fn issue(&self, user_id: i64, session_id: Option<i64>) -> Result<String, TokenError> {
        self.issue_with_ttl(user_id, session_id, self.access_ttl_secs)
    }

    fn issue_with_ttl(
        &self,
        user_id: i64,
        session_id: Option<i64>,
        ttl_secs: i64,
    ) -> Result<String, TokenError> {
        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id,
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| TokenError::Invalid)
    }

    /// Decode and validate an access token.
    ///
    /// Fails with `Expired` for an out-of-date token and `Invalid` for
    /// anything else (bad signature, malformed, missing claims).
    pub fn decode(&self, token: &str) -> Result<Identity, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // No clock leeway: an expired token is expired.
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;

        let user_id = data.claims.sub.parse().map_err(|_| TokenError::Invalid)?;
        Ok(Identity {
            user_id,
            session_id: data.claims.sid,
        })
    }
}

/// Generate a fresh refresh token: 256 bits of OS entropy, URL-safe base64.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a refresh token for storage.
///
/// SHA-256 is sufficient here: the token is already high-entropy random
/// data, so no salting or stretching is needed.
pub fn hash_refresh_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    STANDARD.encode(digest)
}

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| CredentialError::Hash)?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash.
pub fn verify_password(password: &str, hash: &str) -> Result<(), CredentialError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| CredentialError::Invalid)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| CredentialError::Invalid)
}

/// Dummy password verification for constant-time principal lookup.
///
/// When the principal doesn't exist we still spend approximately the same
/// CPU time as a real verification, so response timing does not reveal
/// whether an account exists.
pub fn dummy_password_verify(password: &str) {
    // Pre-computed Argon2id hash that will never match any real password.
    const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$dGltaW5nLW9yYWNsZS1kdW1teQ$K4VZh8k8YL3E8H7E8H7E8H7E8H7E8H7E8H7E8H7E8Hs";

    if let Ok(parsed) = PasswordHash::new(DUMMY_HASH) {
        let _ = Argon2::default().verify_password(password.as_bytes(), &parsed);
    }
}
