//! The Axum handler that upgrades an authenticated request to a WebSocket.

use crate::auth::{VerifiedUser, WsAuth};
use crate::ws::service::SyncService;
use axum::{
    extract::{State, ws::WebSocketUpgrade},
    response::Response,
};
use std::sync::Arc;
use tracing::{info, instrument};

/// Upgrades the request and hands the socket to the [`SyncService`].
///
/// The handshake credential is checked by the [`WsAuth`] extractor before
/// this body runs; a rejected handshake never reaches the service. The router
/// state must implement [`TokenValidator`](crate::auth::TokenValidator) yielding a [`VerifiedUser`] and
/// expose the service through `FromRef`.
///
/// ```rust,no_run
/// # use async_trait::async_trait;
/// # use axum::{Router, extract::FromRef, routing::get};
/// # use chat_sync_kit::prelude::*;
/// # use std::sync::Arc;
/// #[derive(Clone)]
/// struct AppState {
///     sync: Arc<SyncService>,
///     verifier: Arc<JwtValidator>,
/// }
///
/// impl FromRef<AppState> for Arc<SyncService> {
///     fn from_ref(state: &AppState) -> Self {
///         state.sync.clone()
///     }
/// }
///
/// #[async_trait]
/// impl TokenValidator for AppState {
///     type User = VerifiedUser;
///     type Error = <JwtValidator as TokenValidator>::Error;
///
///     async fn validate_token(&self, token: &str) -> Result<VerifiedUser, Self::Error> {
///         self.verifier.validate_token(token).await
///     }
/// }
///
/// # fn build(state: AppState) -> Router {
/// Router::new()
///     .route("/ws", get(upgrade_handler))
///     .with_state(state)
/// # }
/// ```
#[instrument(skip_all, fields(user_id = %auth.0.id))]
pub async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<SyncService>>,
    auth: WsAuth<VerifiedUser>,
) -> Response {
    let WsAuth(user) = auth;
    info!("Handshake accepted, upgrading connection.");
    ws.on_upgrade(move |socket| async move {
        service.handle_connection(socket, user).await;
    })
}
