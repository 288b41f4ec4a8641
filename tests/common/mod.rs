#![allow(dead_code)]

use chat_sync_kit::prelude::*;
use chat_sync_kit::ws::types::OutboundRx;
use once_cell::sync::Lazy;
use std::sync::Arc;

static TRACING: Lazy<()> = Lazy::new(|| {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "chat_sync_kit=debug".into());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_test_writer()
        .init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// A service over a fresh `MemoryStore`; seed conversations through the
/// returned store.
pub fn service() -> (Arc<SyncService>, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    (SyncService::in_memory(SyncConfig::default(), store.clone()), store)
}

pub struct Client {
    pub context: ConnectionContext,
    pub rx: OutboundRx,
}

impl Client {
    pub async fn connect(service: &SyncService, user: &str) -> Self {
        let user = VerifiedUser::new(user).with_display_name(capitalize(user));
        let (handle, rx) = service.connect(&user).await.unwrap();
        Self {
            context: ConnectionContext { handle, user },
            rx,
        }
    }

    pub async fn send(&self, service: &SyncService, command: serde_json::Value) {
        service.handle_text(&self.context, &command.to_string()).await;
    }

    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            events.push(serde_json::from_str(frame.as_str()).unwrap());
        }
        events
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
