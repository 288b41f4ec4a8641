//! A runnable direct-messaging sync server.
//!
//! ```text
//! JWT_SECRET=dev-secret cargo run --example dm_server
//! websocat "ws://127.0.0.1:3000/ws?token=<token printed at startup>"
//! ```
//!
//! Conversations are seeded in memory. Messages are sent over HTTP with
//! `POST /chats/{chat_id}/messages` and show up on every joined socket.

use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chat_sync_kit::events::ErrorPayload;
use chat_sync_kit::prelude::*;
use chat_sync_kit::store::MessageKind;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
struct ServerState {
    sync: Arc<SyncService>,
    verifier: Arc<JwtValidator>,
}

impl FromRef<ServerState> for Arc<SyncService> {
    fn from_ref(state: &ServerState) -> Self {
        Arc::clone(&state.sync)
    }
}

#[async_trait::async_trait]
impl TokenValidator for ServerState {
    type User = VerifiedUser;
    type Error = <JwtValidator as TokenValidator>::Error;

    async fn validate_token(&self, token: &str) -> Result<VerifiedUser, Self::Error> {
        self.verifier.validate_token(token).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    content: String,
    #[serde(default, rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    reply_to: Option<MessageId>,
}

async fn send_message(
    State(state): State<ServerState>,
    Path(chat_id): Path<String>,
    WsAuth(user): WsAuth<VerifiedUser>,
    Json(body): Json<SendMessageBody>,
) -> Response {
    let mut message = NewMessage::text(chat_id.as_str(), user.id.clone(), body.content);
    message.kind = body.kind;
    message.reply_to = body.reply_to;

    match state.sync.send_message(&user, message).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => {
            let status = match e {
                SyncError::NotAParticipant { .. } => StatusCode::FORBIDDEN,
                SyncError::MalformedCommand(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let body = ErrorPayload {
                code: e.code().to_owned(),
                message: e.to_string(),
            };
            (status, Json(body)).into_response()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dm_server=info,chat_sync_kit=info")),
        )
        .init();

    let config = SyncConfig::from_env()?;
    let verifier = Arc::new(JwtValidator::new(config.require_jwt_secret()?));

    let store = Arc::new(MemoryStore::new());
    store.put_conversation("alice-bob", ["alice", "bob"]);
    store.put_conversation("alice-carol", ["alice", "carol"]);

    let bind_addr = config.bind_addr;
    let sync = match config.redis_url.clone() {
        Some(url) => {
            let registry = RedisRegistry::connect(&url, config.node_id.clone()).await?;
            let directory: Arc<dyn ConversationDirectory> = store.clone();
            SyncService::new(config, Arc::new(registry), directory, store)
        }
        None => SyncService::in_memory(config, store),
    };

    for (user, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
        let token = verifier.issue(user, Some(name), chrono::Duration::hours(12))?;
        info!("Token for {}: {}", user, token);
    }

    let state = ServerState { sync, verifier };
    let app = Router::new()
        .route("/ws", get(upgrade_handler))
        .route("/chats/{chat_id}/messages", post(send_message))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    info!("Listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
