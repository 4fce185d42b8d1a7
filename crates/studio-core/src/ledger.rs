//! ============================================================================
//! Task/History Ledger - Client-side record of every attempt
//! ============================================================================
//! Tasks move forward only:
//!
//!   pending -> processing -> completed
//!      \            \-----> failed
//!       \-----------------> failed
//!
//! A task can only complete once its history entry exists. History entries
//! are keyed by their batch timestamp and listed newest first.
//! ============================================================================

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{SourceImageRecord, StudioDb};
use crate::favorites::FavoritesIndex;
use crate::storage::{ImageStore, StorageError};
use crate::types::{
    Background, GenerationMode, HistoryEntry, Moderation, OutputFormat, Quality, SourceImageRef, StorageMode,
    Task, TaskStatus,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("History entry not found: {0}")]
    HistoryNotFound(i64),
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("Task {0} cannot complete before its history entry exists")]
    MissingHistory(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for LedgerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Fields of a task known at submission time
#[derive(Debug, Clone)]
pub struct NewTask {
    pub prompt: String,
    pub mode: GenerationMode,
    pub quality: Quality,
    pub background: Option<Background>,
    pub moderation: Option<Moderation>,
    pub output_format: Option<OutputFormat>,
    pub n: Option<u32>,
    pub size: Option<String>,
}

pub struct TaskLedger {
    db: Arc<StudioDb>,
    store: Arc<ImageStore>,
    favorites: FavoritesIndex,
}

impl TaskLedger {
    pub fn new(db: Arc<StudioDb>, store: Arc<ImageStore>) -> Self {
        Self {
            favorites: FavoritesIndex::new(db.clone()),
            db,
            store,
        }
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub fn create_task(&self, new: NewTask) -> Result<Task, LedgerError> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            prompt: new.prompt,
            mode: new.mode,
            status: TaskStatus::Pending,
            error: None,
            quality: new.quality,
            background: new.background,
            moderation: new.moderation,
            output_format: new.output_format,
            source_images: Vec::new(),
            source_storage_mode: None,
            n: new.n,
            size: new.size,
            history_timestamp: None,
        };
        self.db.store_task(&task)?;
        info!("Created {} task {}", task.mode.as_str(), task.id);
        Ok(task)
    }

    /// Keep a source image with its task and record the reference
    pub fn attach_source_image(
        &self,
        task_id: &str,
        record: SourceImageRecord,
        storage_mode: StorageMode,
    ) -> Result<Task, LedgerError> {
        let mut task = self.require_task(task_id)?;
        task.source_images.push(SourceImageRef {
            filename: record.filename.clone(),
            s3_url: record.s3_url.clone(),
        });
        task.source_storage_mode = Some(storage_mode);
        self.db.store_source_image(&record)?;
        self.db.store_task(&task)?;
        Ok(task)
    }

    pub fn mark_processing(&self, task_id: &str) -> Result<Task, LedgerError> {
        self.transition(task_id, TaskStatus::Processing, |_| Ok(()))
    }

    pub fn complete_task(&self, task_id: &str, history_timestamp: i64) -> Result<Task, LedgerError> {
        if self.db.get_history(history_timestamp)?.is_none() {
            return Err(LedgerError::MissingHistory(task_id.to_string()));
        }
        self.transition(task_id, TaskStatus::Completed, |task| {
            task.history_timestamp = Some(history_timestamp);
            Ok(())
        })
    }

    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<Task, LedgerError> {
        self.transition(task_id, TaskStatus::Failed, |task| {
            task.error = Some(error.to_string());
            Ok(())
        })
    }

    fn transition<F>(&self, task_id: &str, to: TaskStatus, apply: F) -> Result<Task, LedgerError>
    where
        F: FnOnce(&mut Task) -> Result<(), LedgerError>,
    {
        let mut task = self.require_task(task_id)?;
        let allowed = matches!(
            (task.status, to),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        );
        if !allowed {
            return Err(LedgerError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status.as_str(),
                to: to.as_str(),
            });
        }
        apply(&mut task)?;
        task.status = to;
        self.db.store_task(&task)?;
        info!("Task {} is now {}", task_id, to.as_str());
        Ok(task)
    }

    fn require_task(&self, task_id: &str) -> Result<Task, LedgerError> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>, LedgerError> {
        Ok(self.db.get_task(task_id)?)
    }

    /// Newest first
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, LedgerError> {
        Ok(self.db.list_tasks(status)?)
    }

    /// Delete a task together with its stored source images
    pub fn delete_task(&self, task_id: &str) -> Result<bool, LedgerError> {
        self.db.delete_source_images_for_task(task_id)?;
        Ok(self.db.delete_task(task_id)?)
    }

    /// Drop finished tasks older than the given number of days
    pub fn prune_tasks(&self, older_than_days: i64) -> Result<usize, LedgerError> {
        Ok(self.db.prune_finished_tasks(older_than_days)?)
    }

    // ========================================================================
    // History
    // ========================================================================

    pub fn add_history_entry(&self, entry: &HistoryEntry) -> Result<(), LedgerError> {
        self.db.store_history(entry)?;
        info!(
            "Recorded history entry {} ({} images, {})",
            entry.timestamp,
            entry.images.len(),
            entry.storage_mode_used
        );
        Ok(())
    }

    /// Newest first
    pub fn history(&self) -> Result<Vec<HistoryEntry>, LedgerError> {
        Ok(self.db.list_history()?)
    }

    pub fn get_history_entry(&self, timestamp: i64) -> Result<Option<HistoryEntry>, LedgerError> {
        Ok(self.db.get_history(timestamp)?)
    }

    /// Delete an entry and its images from the backend it was recorded under.
    /// Every image is attempted. When some deletes fail the entry is kept,
    /// narrowed to the images that are still stored, and the first error is
    /// returned.
    pub async fn delete_history_entry(&self, timestamp: i64) -> Result<(), LedgerError> {
        let mut entry = self
            .db
            .get_history(timestamp)?
            .ok_or(LedgerError::HistoryNotFound(timestamp))?;

        let backend = self.store.backend(entry.storage_mode_used);
        let mut remaining = Vec::new();
        let mut first_error = None;
        for image in &entry.images {
            match backend.delete(&image.filename).await {
                Ok(true) => {}
                Ok(false) => warn!("Image {} of history entry {} was already gone", image.filename, timestamp),
                Err(e) => {
                    warn!("Failed to delete image {} of history entry {}: {}", image.filename, timestamp, e);
                    remaining.push(image.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => {
                self.forget_history_entry(timestamp)?;
                Ok(())
            }
            Some(e) => {
                if remaining.len() < entry.images.len() {
                    entry.images = remaining;
                    self.db.store_history(&entry)?;
                }
                Err(e.into())
            }
        }
    }

    /// Drop only the metadata (and any favorite); images stay where they are
    pub fn forget_history_entry(&self, timestamp: i64) -> Result<bool, LedgerError> {
        let removed = self.db.delete_history(timestamp)?;
        self.favorites.remove_for_history(timestamp)?;
        if removed {
            info!("Removed history entry {}", timestamp);
        }
        Ok(removed)
    }

    /// Remove all history, favorites and embedded-db image rows
    pub async fn clear_history(&self) -> Result<usize, LedgerError> {
        let removed = self.db.clear_history()?;
        for favorite in self.favorites.favorites()? {
            self.favorites.remove_from_favorites(&favorite.id)?;
        }
        let images = self.store.embedded().clear().await?;
        info!("Cleared {} history entries and {} stored images", removed, images);
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{HandleRegistry, ImageSourceCache};
    use crate::config::PublicUrlSettings;
    use crate::storage::{EmbeddedDbBackend, FilesystemBackend, ImageBackend, ObjectStorageBackend};
    use crate::types::HistoryImage;

    pub(crate) struct Fixture {
        pub _dir: tempfile::TempDir,
        pub db: Arc<StudioDb>,
        pub store: Arc<ImageStore>,
        pub ledger: TaskLedger,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(StudioDb::open(Some(&dir.path().join("studio.redb"))).unwrap());
        let cache = Arc::new(ImageSourceCache::new(Arc::new(HandleRegistry::new()), 16));
        let store = Arc::new(ImageStore::new(
            Arc::new(FilesystemBackend::new(dir.path().join("out"))),
            EmbeddedDbBackend::new(db.clone(), cache),
            Arc::new(ObjectStorageBackend::read_only(PublicUrlSettings {
                public_domain: Some("https://cdn.example.com".into()),
                key_prefix: "dreamImage".into(),
            })),
        ));
        let ledger = TaskLedger::new(db.clone(), store.clone());
        Fixture {
            _dir: dir,
            db,
            store,
            ledger,
        }
    }

    pub(crate) fn new_task() -> NewTask {
        NewTask {
            prompt: "a lighthouse at dusk".into(),
            mode: GenerationMode::Generate,
            quality: Quality::Auto,
            background: Some(Background::Auto),
            moderation: Some(Moderation::Auto),
            output_format: Some(OutputFormat::Png),
            n: Some(1),
            size: Some("1024x1024".into()),
        }
    }

    pub(crate) fn entry(timestamp: i64, mode: StorageMode, filenames: &[&str]) -> HistoryEntry {
        HistoryEntry {
            timestamp,
            images: filenames
                .iter()
                .map(|f| HistoryImage {
                    filename: f.to_string(),
                    url: None,
                })
                .collect(),
            storage_mode_used: mode,
            duration_ms: 900,
            quality: Quality::Auto,
            background: Background::Auto,
            moderation: Moderation::Auto,
            prompt: "a lighthouse at dusk".into(),
            mode: GenerationMode::Generate,
            cost_details: None,
            output_format: Some(OutputFormat::Png),
            task_id: None,
            n: Some(1),
            size: None,
        }
    }

    #[test]
    fn test_forward_only_lifecycle() {
        let f = fixture();
        let task = f.ledger.create_task(new_task()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        // Cannot complete straight from pending
        f.ledger
            .add_history_entry(&entry(10, StorageMode::EmbeddedDb, &["10-0.png"]))
            .unwrap();
        assert!(matches!(
            f.ledger.complete_task(&task.id, 10),
            Err(LedgerError::InvalidTransition { .. })
        ));

        f.ledger.mark_processing(&task.id).unwrap();
        let done = f.ledger.complete_task(&task.id, 10).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.history_timestamp, Some(10));

        // Terminal states never move again
        assert!(f.ledger.fail_task(&task.id, "late").is_err());
        assert!(f.ledger.mark_processing(&task.id).is_err());
    }

    #[test]
    fn test_completion_requires_history_entry() {
        let f = fixture();
        let task = f.ledger.create_task(new_task()).unwrap();
        f.ledger.mark_processing(&task.id).unwrap();
        assert!(matches!(
            f.ledger.complete_task(&task.id, 999),
            Err(LedgerError::MissingHistory(_))
        ));
        assert_eq!(f.ledger.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Processing);
    }

    #[test]
    fn test_failure_records_error() {
        let f = fixture();
        let task = f.ledger.create_task(new_task()).unwrap();
        let failed = f.ledger.fail_task(&task.id, "provider exploded").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("provider exploded"));
        assert!(matches!(
            f.ledger.fail_task("missing", "x"),
            Err(LedgerError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_delete_task_removes_source_images() {
        let f = fixture();
        let task = f.ledger.create_task(new_task()).unwrap();
        f.ledger
            .attach_source_image(
                &task.id,
                SourceImageRecord {
                    filename: "src.png".into(),
                    task_id: task.id.clone(),
                    content_type: "image/png".into(),
                    blob: vec![1],
                    s3_url: None,
                },
                StorageMode::EmbeddedDb,
            )
            .unwrap();
        assert_eq!(f.ledger.get_task(&task.id).unwrap().unwrap().source_images.len(), 1);

        assert!(f.ledger.delete_task(&task.id).unwrap());
        assert!(f.db.get_source_image("src.png").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_embedded_entry_removes_images_and_favorite() {
        let f = fixture();
        f.store.embedded().put("5-0.png", b"x", "image/png").await.unwrap();
        f.ledger
            .add_history_entry(&entry(5, StorageMode::EmbeddedDb, &["5-0.png"]))
            .unwrap();
        let favorites = FavoritesIndex::new(f.db.clone());
        favorites.add_to_favorites(5, None).unwrap();

        f.ledger.delete_history_entry(5).await.unwrap();
        assert!(f.ledger.get_history_entry(5).unwrap().is_none());
        assert!(f.db.get_image("5-0.png").unwrap().is_none());
        assert!(favorites.favorite_id(5).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_object_storage_entry_is_kept_on_delete() {
        let f = fixture();
        f.ledger
            .add_history_entry(&entry(7, StorageMode::ObjectStorage, &["7-0.png"]))
            .unwrap();

        let err = f.ledger.delete_history_entry(7).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(StorageError::Unsupported { .. })));
        assert!(f.ledger.get_history_entry(7).unwrap().is_some());

        assert!(f.ledger.forget_history_entry(7).unwrap());
        assert!(f.ledger.get_history_entry(7).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_delete_keeps_only_undeleted_images() {
        let f = fixture();
        f.store.embedded().put("8-0.png", b"x", "image/png").await.unwrap();
        f.ledger
            .add_history_entry(&entry(8, StorageMode::EmbeddedDb, &["8-0.png", "../8-1.png", "8-2.png"]))
            .unwrap();

        let err = f.ledger.delete_history_entry(8).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(StorageError::InvalidFilename(_))));
        assert!(f.db.get_image("8-0.png").unwrap().is_none());

        let kept = f.ledger.get_history_entry(8).unwrap().unwrap();
        assert_eq!(kept.filenames(), vec!["../8-1.png".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_history_wipes_embedded_images() {
        let f = fixture();
        let handle = f.store.embedded().put("1-0.png", b"x", "image/png").await.unwrap();
        f.ledger
            .add_history_entry(&entry(1, StorageMode::EmbeddedDb, &["1-0.png"]))
            .unwrap();
        f.ledger
            .add_history_entry(&entry(2, StorageMode::Filesystem, &["2-0.png"]))
            .unwrap();

        assert_eq!(f.ledger.clear_history().await.unwrap(), 2);
        assert!(f.ledger.history().unwrap().is_empty());
        assert!(f.db.list_images().unwrap().is_empty());
        assert!(!f.store.embedded().cache().registry().is_live(&handle));
    }

    #[test]
    fn test_history_newest_first() {
        let f = fixture();
        for ts in [3, 1, 2] {
            f.ledger
                .add_history_entry(&entry(ts, StorageMode::Filesystem, &[]))
                .unwrap();
        }
        let order: Vec<i64> = f.ledger.history().unwrap().iter().map(|e| e.timestamp).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let f = fixture();
        assert!(matches!(
            f.ledger.delete_history_entry(42).await,
            Err(LedgerError::HistoryNotFound(42))
        ));
        assert!(f.store.backend(StorageMode::Filesystem).resolve("x.png").await.unwrap().is_none());
    }
}
