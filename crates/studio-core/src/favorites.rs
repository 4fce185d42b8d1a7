//! Favorites index: at most one favorite per history entry, enforced here
//! rather than by the database.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::StudioDb;
use crate::ledger::LedgerError;
use crate::types::{FavoriteRecord, HistoryEntry};

/// A favorite joined with the entry it points at
#[derive(Debug, Clone, PartialEq)]
pub struct FavoriteItem {
    pub favorite: FavoriteRecord,
    pub entry: HistoryEntry,
}

#[derive(Clone)]
pub struct FavoritesIndex {
    db: Arc<StudioDb>,
}

impl FavoritesIndex {
    pub fn new(db: Arc<StudioDb>) -> Self {
        Self { db }
    }

    /// Idempotent: an existing favorite for the entry keeps its id
    pub fn add_to_favorites(&self, history_timestamp: i64, note: Option<String>) -> Result<String, LedgerError> {
        if let Some(id) = self.favorite_id(history_timestamp)? {
            debug!("History entry {} is already a favorite ({})", history_timestamp, id);
            return Ok(id);
        }
        if self.db.get_history(history_timestamp)?.is_none() {
            return Err(LedgerError::HistoryNotFound(history_timestamp));
        }

        let favorite = FavoriteRecord {
            id: Uuid::new_v4().to_string(),
            history_item_timestamp: history_timestamp,
            added_at: chrono::Utc::now().timestamp_millis(),
            note: normalize_note(note),
        };
        self.db.store_favorite(&favorite)?;
        info!("Added history entry {} to favorites", history_timestamp);
        Ok(favorite.id)
    }

    pub fn remove_from_favorites(&self, id: &str) -> Result<bool, LedgerError> {
        Ok(self.db.delete_favorite(id)?)
    }

    /// Returns whether the entry is a favorite afterwards
    pub fn toggle_favorite(&self, history_timestamp: i64) -> Result<bool, LedgerError> {
        match self.favorite_id(history_timestamp)? {
            Some(id) => {
                self.remove_from_favorites(&id)?;
                Ok(false)
            }
            None => {
                self.add_to_favorites(history_timestamp, None)?;
                Ok(true)
            }
        }
    }

    pub fn update_favorite_note(&self, id: &str, note: Option<String>) -> Result<FavoriteRecord, LedgerError> {
        let mut favorite = self
            .db
            .get_favorite(id)?
            .ok_or_else(|| LedgerError::Database(format!("Favorite not found: {}", id)))?;
        favorite.note = normalize_note(note);
        self.db.store_favorite(&favorite)?;
        Ok(favorite)
    }

    pub fn favorite_id(&self, history_timestamp: i64) -> Result<Option<String>, LedgerError> {
        Ok(self
            .db
            .list_favorites()?
            .into_iter()
            .find(|f| f.history_item_timestamp == history_timestamp)
            .map(|f| f.id))
    }

    /// Most recently added first
    pub fn favorites(&self) -> Result<Vec<FavoriteRecord>, LedgerError> {
        Ok(self.db.list_favorites()?)
    }

    /// Favorites with their history entries; dangling favorites are skipped
    pub fn favorite_items(&self) -> Result<Vec<FavoriteItem>, LedgerError> {
        let mut items = Vec::new();
        for favorite in self.favorites()? {
            if let Some(entry) = self.db.get_history(favorite.history_item_timestamp)? {
                items.push(FavoriteItem { favorite, entry });
            }
        }
        Ok(items)
    }

    /// Drop every favorite that points at `history_timestamp`
    pub fn remove_for_history(&self, history_timestamp: i64) -> Result<usize, LedgerError> {
        let mut removed = 0;
        for favorite in self.favorites()? {
            if favorite.history_item_timestamp == history_timestamp && self.db.delete_favorite(&favorite.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn normalize_note(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}
