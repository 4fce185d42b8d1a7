//! ============================================================================
//! STUDIO-CORE: Image generation proxy and client ledger
//! ============================================================================
//! This crate holds everything except the HTTP surface:
//! - Storage-mode resolution and configuration from the environment
//! - The generation proxy (provider calls, per-mode persistence, auth gate)
//! - Image backends: filesystem, embedded db, S3-compatible object storage
//! - The client side: task ledger, history, favorites, session orchestration
//! ============================================================================

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod cost;
pub mod db;
pub mod favorites;
pub mod ledger;
pub mod provider;
pub mod proxy;
pub mod session;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use api::{ApiError, HttpStudioApi, LocalStudioApi, StudioApi};
pub use config::{resolve_storage_mode, StudioConfig};
pub use db::StudioDb;
pub use favorites::{FavoriteItem, FavoritesIndex};
pub use ledger::{LedgerError, NewTask, TaskLedger};
pub use proxy::{GenerationProxy, ProxyError, ProxyOutcome};
pub use session::{SessionError, StudioSession, SubmitForm};
pub use storage::{ImageBackend, ImageStore, StorageError};
pub use types::*;
