use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use rand_core::OsRng;
use tracing::{info, warn};
use uuid::Uuid;

use hush_db::{Database, ProtocolError};
use hush_gateway::dispatcher::Dispatcher;
use hush_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use hush_types::error::ErrorKind;
use hush_types::events::GatewayEvent;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub max_content_len: usize,
    pub dispatcher: Dispatcher,
}

impl AppStateInner {
    /// Push an event to a user after the transaction that caused it has
    /// committed. Best effort: the caller's result never depends on it.
    pub async fn notify(&self, user_id: &str, event: GatewayEvent) {
        match user_id.parse::<Uuid>() {
            Ok(user_id) => {
                self.dispatcher.send_to_user(user_id, event).await;
            }
            Err(e) => warn!("Not notifying malformed user id '{}': {}", user_id, e),
        }
    }
}

/// Run blocking SQLite work off the async runtime.
pub(crate) async fn run_db<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> Result<T, ProtocolError> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    Ok(tokio::task::spawn_blocking(move || f(&state.db)).await??)
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    let length = username.chars().count();
    if !(3..=32).contains(&length) {
        return Err(ApiError::validation("username must be 3 to 32 characters"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }

    let user_id = Uuid::new_v4();
    let name = username.clone();
    run_db(&state, move |db| {
        let password_hash = hash_password(&req.password)?;
        db.create_user(&user_id.to_string(), &name, &password_hash)
    })
    .await?;

    let token = create_token(&state.jwt_secret, state.token_ttl_days, user_id, &username)?;
    info!("Registered {} ({})", username, user_id);

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    let user = run_db(&state, move |db| {
        let Some(user) = db.get_user_by_username(&username)? else {
            return Ok(None);
        };
        let verified = password_matches(&user.password, &req.password)?;
        Ok(verified.then_some(user))
    })
    .await?
    .ok_or_else(|| ApiError::new(ErrorKind::Unauthorized, "invalid username or password"))?;

    let user_id: Uuid = user.id.parse().map_err(ApiError::internal)?;
    let token = create_token(&state.jwt_secret, state.token_ttl_days, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

/// Argon2id PHC string with a fresh random salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored PHC string. An unreadable hash is an
/// error, a wrong password is `Ok(false)`.
pub fn password_matches(stored: &str, password: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(stored).map_err(|e| anyhow::anyhow!("stored hash unreadable: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

pub fn create_token(secret: &str, ttl_days: i64, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    anyhow::ensure!(ttl_days > 0, "token lifetime must be positive, got {} days", ttl_days);
    let ttl = chrono::Duration::try_days(ttl_days)
        .ok_or_else(|| anyhow::anyhow!("token lifetime of {} days is out of range", ttl_days))?;
    let expires_at = chrono::Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| anyhow::anyhow!("token lifetime of {} days is out of range", ttl_days))?;
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: expires_at.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hush_gateway::connection::verify_token;

    #[test]
    fn issued_tokens_verify_with_the_same_secret() {
        let user_id = Uuid::new_v4();
        let token = create_token("s3cret", 30, user_id, "alice").unwrap();

        let claims = verify_token(&token, "s3cret").unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.username, "alice");
        assert!(verify_token(&token, "other").is_err());
    }

    #[test]
    fn token_lifetime_must_be_positive_and_bounded() {
        assert!(create_token("s3cret", 0, Uuid::new_v4(), "alice").is_err());
        assert!(create_token("s3cret", -1, Uuid::new_v4(), "alice").is_err());
        assert!(create_token("s3cret", i64::MAX, Uuid::new_v4(), "alice").is_err());
    }

    #[test]
    fn password_hashes_verify_and_are_salted() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(password_matches(&hash, "correct horse").unwrap());
        assert!(!password_matches(&hash, "battery staple").unwrap());
        assert_ne!(hash, hash_password("correct horse").unwrap());
        assert!(password_matches("not-a-phc-string", "x").is_err());
    }
}
