//! WebSocket transport: the `SyncService`, per-connection command handling and
//! the Axum upgrade handler.

pub mod handler;
pub mod service;
pub mod types;
pub mod upgrade;
