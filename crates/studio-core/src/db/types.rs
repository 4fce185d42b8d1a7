//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================
//! Tasks, history entries and favorites are stored as their domain types
//! (see `crate::types`); the records here only exist in the database.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generated image bytes kept client-side in embedded-db mode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    pub filename: String,
    pub content_type: String,
    pub blob: Vec<u8>,
    pub stored_at: i64,
}

/// Original upload of an edit task, kept for re-edit workflows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceImageRecord {
    pub filename: String,
    pub task_id: String,
    pub content_type: String,
    pub blob: Vec<u8>,
    /// Object-storage URL when the source was also uploaded
    pub s3_url: Option<String>,
}

/// Client preferences that survive restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientPrefs {
    /// `hex(sha256(password))` sent with every request
    pub password_hash: Option<String>,
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub total_tasks: usize,
    pub task_counts: HashMap<String, usize>,
    pub history_entries: usize,
    pub favorites: usize,
    pub images: usize,
    pub image_bytes: u64,
    pub source_images: usize,
}
