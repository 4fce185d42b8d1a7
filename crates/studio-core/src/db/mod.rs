// ============================================================================
// StudioDb — Embedded Database (redb)
// ============================================================================
// Client-side persistence for tasks, history, favorites, image blobs and
// preferences. Default path: ~/.image-studio/studio.redb (override through
// the path passed to `open`)
// ============================================================================

pub mod types;

pub use types::{ClientPrefs, DbStats, ImageRecord, SourceImageRecord};

use anyhow::{anyhow, Result};
use redb::{Database, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{FavoriteRecord, HistoryEntry, Task, TaskStatus};

/// Every table maps prefixed string keys to bincode-encoded records
type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

// Table definitions
const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images");
const SOURCE_IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("source_images");
const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");
const FAVORITES: TableDefinition<&str, &[u8]> = TableDefinition::new("favorites");
const PREFS: TableDefinition<&str, &[u8]> = TableDefinition::new("prefs");

const PREFS_KEY: &str = "prefs:client";
const MS_PER_DAY: i64 = 86_400_000;

/// History keys sort chronologically
fn history_key(timestamp: i64) -> String {
    format!("history:{:020}", timestamp.max(0))
}

/// Embedded database for the studio client
pub struct StudioDb {
    db: Database,
    path: PathBuf,
}

impl StudioDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses ~/.image-studio/studio.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create database directory {}: {}", parent.display(), e))?;
        }

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        for table in [IMAGES, SOURCE_IMAGES, TASKS, HISTORY, FAVORITES, PREFS] {
            write_txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to create {} table: {}", table.name(), e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self { db, path: db_path })
    }

    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        Ok(home.join(".image-studio").join("studio.redb"))
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Generic record access
    // ========================================================================

    fn put<T: Serialize>(&self, table: RecordTable, key: &str, record: &T) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| anyhow!("Failed to serialize {} record: {}", table.name(), e))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;
            t.insert(key, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert {}: {}", key, e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> Result<Option<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;

        match t.get(key).map_err(|e| anyhow!("Failed to get {}: {}", key, e))? {
            Some(value) => {
                let record = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize {}: {}", key, e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Every record of a table in key order (reversed when `newest_first`)
    fn scan<T: DeserializeOwned>(&self, table: RecordTable, newest_first: bool) -> Result<Vec<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;

        let mut records = Vec::new();
        for entry in t
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate {}: {}", table.name(), e))?
        {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let record = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize {} record: {}", table.name(), e))?;
            records.push(record);
        }

        if newest_first {
            records.reverse();
        }
        Ok(records)
    }

    fn keys(&self, table: RecordTable) -> Result<Vec<String>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;

        let mut keys = Vec::new();
        for entry in t
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate {}: {}", table.name(), e))?
        {
            let (key, _value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    /// Remove keys in one transaction; returns how many existed
    fn remove_many(&self, table: RecordTable, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let mut removed = 0;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;
            for key in keys {
                if t.remove(key.as_str())
                    .map_err(|e| anyhow!("Failed to remove {}: {}", key, e))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;
        Ok(removed)
    }

    fn remove(&self, table: RecordTable, key: &str) -> Result<bool> {
        Ok(self.remove_many(table, &[key.to_string()])? > 0)
    }

    // ========================================================================
    // Image Blob Operations
    // ========================================================================

    pub fn store_image(&self, image: &ImageRecord) -> Result<()> {
        self.put(IMAGES, &format!("images:{}", image.filename), image)?;
        debug!("Stored image blob: {} ({} bytes)", image.filename, image.blob.len());
        Ok(())
    }

    pub fn get_image(&self, filename: &str) -> Result<Option<ImageRecord>> {
        self.get(IMAGES, &format!("images:{}", filename))
    }

    pub fn delete_image(&self, filename: &str) -> Result<bool> {
        let removed = self.remove(IMAGES, &format!("images:{}", filename))?;
        if removed {
            debug!("Deleted image blob: {}", filename);
        }
        Ok(removed)
    }

    pub fn list_images(&self) -> Result<Vec<ImageRecord>> {
        self.scan(IMAGES, false)
    }

    /// Delete every image blob; returns the number removed
    pub fn clear_images(&self) -> Result<usize> {
        let removed = self.remove_many(IMAGES, &self.keys(IMAGES)?)?;
        info!("Cleared {} image blobs", removed);
        Ok(removed)
    }

    // ========================================================================
    // Source Image Operations
    // ========================================================================

    pub fn store_source_image(&self, image: &SourceImageRecord) -> Result<()> {
        self.put(SOURCE_IMAGES, &format!("source_images:{}", image.filename), image)?;
        debug!("Stored source image {} for task {}", image.filename, image.task_id);
        Ok(())
    }

    pub fn get_source_image(&self, filename: &str) -> Result<Option<SourceImageRecord>> {
        self.get(SOURCE_IMAGES, &format!("source_images:{}", filename))
    }

    pub fn source_images_for_task(&self, task_id: &str) -> Result<Vec<SourceImageRecord>> {
        Ok(self
            .scan::<SourceImageRecord>(SOURCE_IMAGES, false)?
            .into_iter()
            .filter(|img| img.task_id == task_id)
            .collect())
    }

    pub fn delete_source_images_for_task(&self, task_id: &str) -> Result<usize> {
        let keys: Vec<String> = self
            .source_images_for_task(task_id)?
            .into_iter()
            .map(|img| format!("source_images:{}", img.filename))
            .collect();
        let removed = self.remove_many(SOURCE_IMAGES, &keys)?;
        if removed > 0 {
            debug!("Deleted {} source images of task {}", removed, task_id);
        }
        Ok(removed)
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    pub fn store_task(&self, task: &Task) -> Result<()> {
        self.put(TASKS, &format!("tasks:{}", task.id), task)?;
        debug!("Stored task: {} ({})", task.id, task.status.as_str());
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.get(TASKS, &format!("tasks:{}", task_id))
    }

    /// Tasks newest first, optionally filtered by status
    pub fn list_tasks(&self, status_filter: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .scan::<Task>(TASKS, false)?
            .into_iter()
            .filter(|task| status_filter.map_or(true, |status| task.status == status))
            .collect();
        tasks.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(tasks)
    }

    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        let removed = self.remove(TASKS, &format!("tasks:{}", task_id))?;
        if removed {
            debug!("Deleted task: {}", task_id);
        }
        Ok(removed)
    }

    // ========================================================================
    // History Operations
    // ========================================================================

    pub fn store_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.put(HISTORY, &history_key(entry.timestamp), entry)?;
        debug!("Stored history entry: {} ({} images)", entry.timestamp, entry.images.len());
        Ok(())
    }

    pub fn get_history(&self, timestamp: i64) -> Result<Option<HistoryEntry>> {
        self.get(HISTORY, &history_key(timestamp))
    }

    /// History entries, newest first
    pub fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        self.scan(HISTORY, true)
    }

    pub fn delete_history(&self, timestamp: i64) -> Result<bool> {
        let removed = self.remove(HISTORY, &history_key(timestamp))?;
        if removed {
            debug!("Deleted history entry: {}", timestamp);
        }
        Ok(removed)
    }

    pub fn clear_history(&self) -> Result<usize> {
        let removed = self.remove_many(HISTORY, &self.keys(HISTORY)?)?;
        info!("Cleared {} history entries", removed);
        Ok(removed)
    }

    // ========================================================================
    // Favorite Operations
    // ========================================================================

    pub fn store_favorite(&self, favorite: &FavoriteRecord) -> Result<()> {
        self.put(FAVORITES, &format!("favorites:{}", favorite.id), favorite)?;
        debug!(
            "Stored favorite {} for history entry {}",
            favorite.id, favorite.history_item_timestamp
        );
        Ok(())
    }

    pub fn get_favorite(&self, id: &str) -> Result<Option<FavoriteRecord>> {
        self.get(FAVORITES, &format!("favorites:{}", id))
    }

    /// Favorites, most recently added first
    pub fn list_favorites(&self) -> Result<Vec<FavoriteRecord>> {
        let mut favorites: Vec<FavoriteRecord> = self.scan(FAVORITES, false)?;
        favorites.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        Ok(favorites)
    }

    pub fn delete_favorite(&self, id: &str) -> Result<bool> {
        let removed = self.remove(FAVORITES, &format!("favorites:{}", id))?;
        if removed {
            debug!("Deleted favorite: {}", id);
        }
        Ok(removed)
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    pub fn store_prefs(&self, prefs: &ClientPrefs) -> Result<()> {
        self.put(PREFS, PREFS_KEY, prefs)?;
        debug!("Stored client preferences");
        Ok(())
    }

    pub fn get_prefs(&self) -> Result<ClientPrefs> {
        Ok(self.get(PREFS, PREFS_KEY)?.unwrap_or_default())
    }

    // ========================================================================
    // Pruning Operations
    // ========================================================================

    /// Finished (completed or failed) tasks submitted before the cutoff
    pub fn finished_tasks_older_than(&self, older_than_days: i64) -> Result<Vec<Task>> {
        let cutoff = chrono::Utc::now()
            .timestamp_millis()
            .saturating_sub(older_than_days.saturating_mul(MS_PER_DAY));
        Ok(self
            .list_tasks(None)?
            .into_iter()
            .filter(|task| task.status.is_terminal() && task.timestamp < cutoff)
            .collect())
    }

    /// Prune finished tasks (and their source images) older than the given
    /// number of days. History entries are kept. Returns the number of tasks deleted.
    pub fn prune_finished_tasks(&self, older_than_days: i64) -> Result<usize> {
        let mut deleted = 0;
        for task in self.finished_tasks_older_than(older_than_days)? {
            self.delete_source_images_for_task(&task.id)?;
            if self.delete_task(&task.id)? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!("Pruned {} finished tasks older than {} days", deleted, older_than_days);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let all_tasks = self.list_tasks(None)?;
        let images = self.list_images()?;

        let mut task_counts = std::collections::HashMap::new();
        for task in &all_tasks {
            *task_counts.entry(task.status.as_str().to_string()).or_insert(0usize) += 1;
        }

        Ok(DbStats {
            total_tasks: all_tasks.len(),
            task_counts,
            history_entries: self.keys(HISTORY)?.len(),
            favorites: self.keys(FAVORITES)?.len(),
            images: images.len(),
            image_bytes: images.iter().map(|img| img.blob.len() as u64).sum(),
            source_images: self.keys(SOURCE_IMAGES)?.len(),
        })
    }
}
