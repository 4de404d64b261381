use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use tracing::debug;
use uuid::Uuid;

use parlor_db::Database;
use parlor_gateway::ConnectionHub;
use parlor_types::api::Claims;
use parlor_types::error::{Error, Result};

use crate::directory::Directory;
use crate::service::{MessageService, blocking};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub hub: ConnectionHub,
    pub messages: Arc<MessageService<Database>>,
    pub directory: Directory,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Database, hub: ConnectionHub, jwt_secret: String) -> AppState {
        let db = Arc::new(db);
        Arc::new(Self {
            messages: Arc::new(MessageService::new(db.clone(), hub.clone())),
            directory: Directory::new(db.clone()),
            db,
            hub,
            jwt_secret,
        })
    }
}

/// The internal user a request acts as, resolved from its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("Rejected token: {}", e);
        Error::Unauthenticated
    })
}

/// Verifies the token and maps its subject to an internal user, creating the
/// user on first sight.
pub async fn authenticate(state: &AppStateInner, token: &str) -> Result<AuthUser> {
    let claims = decode_token(&state.jwt_secret, token)?;
    if claims.sub.is_empty() {
        return Err(Error::Unauthenticated);
    }

    let id = blocking(&state.db, move |db| {
        Ok(db.ensure_user(&claims.sub, claims.email.as_deref(), claims.name.as_deref())?)
    })
    .await?;

    Ok(AuthUser { id })
}

/// Extracts the token from `Sec-WebSocket-Protocol: bearer, <jwt>`.
pub fn token_from_protocols(header: &str) -> Option<&str> {
    let mut parts = header.split(',').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case("bearer") {
        return None;
    }
    parts.next().filter(|token| !token.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    pub(crate) const SECRET: &str = "test-secret";

    pub(crate) fn token_for(sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            email: Some(format!("{}@example.com", sub)),
            name: None,
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    pub(crate) fn state() -> AppState {
        AppStateInner::new(Database::open_in_memory().unwrap(), ConnectionHub::new(), SECRET.into())
    }

    #[test]
    fn protocol_header_parsing() {
        assert_eq!(token_from_protocols("bearer, abc.def"), Some("abc.def"));
        assert_eq!(token_from_protocols("Bearer,abc"), Some("abc"));
        assert_eq!(token_from_protocols("bearer"), None);
        assert_eq!(token_from_protocols("bearer, "), None);
        assert_eq!(token_from_protocols("chat, abc"), None);
    }

    #[test]
    fn wrong_secret_is_unauthenticated() {
        let token = token_for("auth|alice");
        assert!(decode_token(SECRET, &token).is_ok());
        assert!(matches!(decode_token("other", &token), Err(Error::Unauthenticated)));
        assert!(matches!(decode_token(SECRET, "garbage"), Err(Error::Unauthenticated)));
    }

    #[tokio::test]
    async fn first_sight_provisions_once() {
        let state = state();
        let first = authenticate(&state, &token_for("auth|alice")).await.unwrap();
        let again = authenticate(&state, &token_for("auth|alice")).await.unwrap();
        assert_eq!(first, again);

        let user = state.db.get_user(first.id).unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("auth|alice@example.com"));
    }
}
