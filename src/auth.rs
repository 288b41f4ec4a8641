//! The Identity Verifier seam and the `WsAuth` handshake extractor.
//!
//! A connection is only upgraded once its bearer credential has been turned
//! into a [`VerifiedUser`]. The credential is read from the
//! `Authorization: Bearer <token>` header first and from the `?token=` query
//! parameter otherwise, since browsers cannot set headers on a WebSocket
//! handshake.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use axum::{response::{IntoResponse, Response}, routing::get, Router};
//! # use chat_sync_kit::auth::{TokenValidator, VerifiedUser, WsAuth};
//! #[derive(Clone)]
//! struct AppState;
//!
//! #[async_trait]
//! impl TokenValidator for AppState {
//!     type User = VerifiedUser;
//!     type Error = std::io::Error;
//!
//!     async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
//!         match token {
//!             "alice-token" => Ok(VerifiedUser::new("alice")),
//!             _ => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown token")),
//!         }
//!     }
//! }
//!
//! async fn whoami(WsAuth(user): WsAuth<VerifiedUser>) -> Response {
//!     user.id.to_string().into_response()
//! }
//!
//! let app: Router = Router::new().route("/whoami", get(whoami)).with_state(AppState);
//! ```

use crate::error::SyncError;
use crate::events::ErrorPayload;
use crate::types::UserId;
use async_trait::async_trait;
use axum::{
    Json,
    extract::{FromRequestParts, Query},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;

/// The identity a handshake resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub id: UserId,
    /// Shown to peers in typing indicators and new messages.
    pub display_name: Option<String>,
}

impl VerifiedUser {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// The Identity Verifier. Implement it on the router state to enable
/// [`WsAuth`].
#[async_trait]
pub trait TokenValidator {
    type User: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Turns a bearer credential into a user, or fails the handshake.
    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error>;
}

/// Extractor holding the verified user of a handshake.
///
/// On failure the request is rejected with `401 Unauthorized` and an `error`
/// body; the upgrade never happens and no connection state is created.
#[derive(Debug)]
pub struct WsAuth<U>(pub U)
where
    U: Send + Sync + 'static;

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl<S, U> FromRequestParts<S> for WsAuth<U>
where
    S: TokenValidator<User = U> + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, <Self as FromRequestParts<S>>::Rejection>> + Send {
        Box::pin(async move {
            let token = match bearer_token(&parts.headers) {
                Some(t) => Some(t),
                None => Query::<TokenQuery>::from_request_parts(parts, state)
                    .await
                    .ok()
                    .map(|Query(q)| q.token),
            };

            let Some(token) = token else {
                return Err(reject(SyncError::HandshakeRejected(
                    "missing credential".into(),
                )));
            };

            match state.validate_token(&token).await {
                Ok(user) => Ok(WsAuth(user)),
                Err(e) => Err(reject(SyncError::HandshakeRejected(e.to_string()))),
            }
        })
    }
}

fn reject(error: SyncError) -> Response {
    warn!("WebSocket handshake rejected: {}", error);
    let body = ErrorPayload {
        code: error.code().to_owned(),
        message: error.to_string(),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

#[cfg(feature = "jwt")]
pub use jwt::{Claims, JwtValidator, TokenError};

#[cfg(feature = "jwt")]
mod jwt {
    use super::{TokenValidator, VerifiedUser};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum TokenError {
        #[error("token expired")]
        Expired,
        #[error("invalid token")]
        Invalid,
        #[error("token carries no user id")]
        MissingSubject,
        #[error("failed to sign token")]
        Signing,
    }

    /// Accepts both `userId` and the registered `sub` claim.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Claims {
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        pub user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub sub: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        pub iat: i64,
        pub exp: i64,
    }

    impl Claims {
        pub fn subject(&self) -> Option<&str> {
            self.user_id
                .as_deref()
                .or(self.sub.as_deref())
                .filter(|s| !s.is_empty())
        }
    }

    /// HMAC-SHA256 JWT verifier.
    #[derive(Clone)]
    pub struct JwtValidator {
        encoding_key: EncodingKey,
        decoding_key: DecodingKey,
        validation: Validation,
    }

    impl JwtValidator {
        pub fn new(secret: &str) -> Self {
            Self {
                encoding_key: EncodingKey::from_secret(secret.as_bytes()),
                decoding_key: DecodingKey::from_secret(secret.as_bytes()),
                validation: Validation::default(),
            }
        }

        /// Signs a token for `user_id`, valid for `ttl`.
        pub fn issue(
            &self,
            user_id: &str,
            name: Option<&str>,
            ttl: Duration,
        ) -> Result<String, TokenError> {
            let now = Utc::now();
            let claims = Claims {
                user_id: Some(user_id.to_owned()),
                sub: None,
                name: name.map(str::to_owned),
                iat: now.timestamp(),
                exp: (now + ttl).timestamp(),
            };
            encode(&Header::default(), &claims, &self.encoding_key).map_err(|_| TokenError::Signing)
        }

        pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
            decode::<Claims>(token, &self.decoding_key, &self.validation)
                .map(|data| data.claims)
                .map_err(|e| match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                    _ => TokenError::Invalid,
                })
        }
    }

    impl std::fmt::Debug for JwtValidator {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("JwtValidator").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl TokenValidator for JwtValidator {
        type User = VerifiedUser;
        type Error = TokenError;

        async fn validate_token(&self, token: &str) -> Result<VerifiedUser, TokenError> {
            let claims = self.decode(token)?;
            let id = claims.subject().ok_or(TokenError::MissingSubject)?;
            Ok(VerifiedUser {
                id: id.into(),
                display_name: claims.name.clone(),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn validator() -> JwtValidator {
            JwtValidator::new("test-secret-key-that-is-long-enough")
        }

        #[tokio::test]
        async fn issued_token_yields_user_and_name() {
            let v = validator();
            let token = v.issue("alice", Some("Alice"), Duration::minutes(5)).unwrap();
            let user = v.validate_token(&token).await.unwrap();
            assert_eq!(user, VerifiedUser::new("alice").with_display_name("Alice"));
        }

        #[tokio::test]
        async fn expired_token_is_rejected() {
            let v = validator();
            let token = v.issue("alice", None, Duration::hours(-2)).unwrap();
            assert_eq!(v.validate_token(&token).await, Err(TokenError::Expired));
        }

        #[tokio::test]
        async fn foreign_signature_is_rejected() {
            let token = JwtValidator::new("some-other-secret")
                .issue("alice", None, Duration::minutes(5))
                .unwrap();
            assert_eq!(
                validator().validate_token(&token).await,
                Err(TokenError::Invalid)
            );
        }

        #[test]
        fn sub_claim_is_accepted_as_user_id() {
            let claims: Claims =
                serde_json::from_str(r#"{"sub":"bob","iat":0,"exp":1}"#).unwrap();
            assert_eq!(claims.subject(), Some("bob"));
        }
    }
}
