//! ============================================================================
//! Studio Session - Client-side orchestration of one user's work
//! ============================================================================
//! Drives a submission end to end:
//!   create task -> keep source images -> processing -> call the server ->
//!   store embedded-db blobs -> history entry -> complete task
//!
//! Failures mark the task failed and set the session error string, except a
//! 401 which leaves the task processing so the user can log in and retry.
//! A batch with no image the client can show also fails its task.
//!
//! Generated images and kept sources can be loaded back as edit sources.
//! ============================================================================

use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{ApiError, StudioApi};
use crate::auth::sha256_hex;
use crate::cache::{HandleRegistry, ImageSourceCache, DEFAULT_CACHE_CAPACITY};
use crate::config::StudioConfig;
use crate::cost::calculate_api_cost;
use crate::db::{ClientPrefs, SourceImageRecord, StudioDb};
use crate::favorites::FavoritesIndex;
use crate::ledger::{LedgerError, NewTask, TaskLedger};
use crate::storage::{
    content_type_for, EmbeddedDbBackend, ImageBackend, ImageStore, ObjectStorageBackend, RemoteFilesystemBackend,
};
use crate::types::{
    Background, GenerationMode, GenerationRequest, GenerationResponse, HistoryEntry, HistoryImage, ImageResult,
    Moderation, OutputFormat, Quality, StorageMode, Task, UploadedImage,
};

pub const MISSING_IMAGES_MESSAGE: &str =
    "Some images from this history entry could not be loaded (they might have been cleared or are missing).";

pub const NO_SOURCES_MESSAGE: &str = "None of the images from this history entry could be loaded for editing.";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Request(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What the user filled in
#[derive(Debug, Clone)]
pub struct SubmitForm {
    pub mode: GenerationMode,
    pub prompt: String,
    pub n: u32,
    pub size: Option<String>,
    pub quality: Quality,
    pub output_format: OutputFormat,
    pub output_compression: Option<u8>,
    pub background: Background,
    pub moderation: Moderation,
    pub images: Vec<UploadedImage>,
    pub mask: Option<UploadedImage>,
}

impl SubmitForm {
    pub fn generate(prompt: impl Into<String>) -> Self {
        Self {
            mode: GenerationMode::Generate,
            prompt: prompt.into(),
            n: 1,
            size: None,
            quality: Quality::Auto,
            output_format: OutputFormat::Png,
            output_compression: None,
            background: Background::Auto,
            moderation: Moderation::Auto,
            images: Vec::new(),
            mask: None,
        }
    }

    pub fn edit(prompt: impl Into<String>, images: Vec<UploadedImage>) -> Self {
        Self {
            mode: GenerationMode::Edit,
            images,
            ..Self::generate(prompt)
        }
    }

    /// Attached images always make this an edit
    pub fn effective_mode(&self) -> GenerationMode {
        if self.images.is_empty() {
            self.mode
        } else {
            GenerationMode::Edit
        }
    }

    fn to_request(&self, password_hash: Option<String>) -> GenerationRequest {
        let mode = self.effective_mode();
        let generate = mode == GenerationMode::Generate;
        GenerationRequest {
            mode: Some(mode.as_str().to_string()),
            prompt: Some(self.prompt.clone()),
            n: Some(self.n.to_string()),
            size: self.size.clone(),
            quality: Some(self.quality.as_str().to_string()),
            output_format: Some(self.output_format.as_str().to_string()),
            output_compression: self
                .output_compression
                .filter(|_| self.output_format.supports_compression())
                .map(|c| c.to_string()),
            background: generate.then(|| self.background.as_str().to_string()),
            moderation: generate.then(|| self.moderation.as_str().to_string()),
            images: self.images.clone(),
            mask: self.mask.clone(),
            password_hash,
        }
    }
}

/// An image reference ready for display; `url` is `None` when it is gone
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    pub filename: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task: Task,
    pub entry: HistoryEntry,
    pub images: Vec<ResolvedImage>,
}

#[derive(Debug, Clone)]
pub struct HistorySelection {
    pub images: Vec<ResolvedImage>,
    pub error: Option<String>,
}

pub struct StudioSession {
    api: Arc<dyn StudioApi>,
    db: Arc<StudioDb>,
    config: StudioConfig,
    cache: Arc<ImageSourceCache>,
    store: Arc<ImageStore>,
    ledger: TaskLedger,
    favorites: FavoritesIndex,
    password_hash: Option<String>,
    server_mode: Option<StorageMode>,
    error: Option<String>,
}

impl StudioSession {
    /// Open the client database from the config and build a session on it
    pub fn open(config: &StudioConfig, api: Arc<dyn StudioApi>) -> anyhow::Result<Self> {
        let db = Arc::new(StudioDb::open(config.db_path.as_deref())?);
        Ok(Self::new(db, api, config)?)
    }

    pub fn new(db: Arc<StudioDb>, api: Arc<dyn StudioApi>, config: &StudioConfig) -> Result<Self, SessionError> {
        let password_hash = db.get_prefs().map_err(LedgerError::from)?.password_hash;
        let cache = Arc::new(ImageSourceCache::new(
            Arc::new(HandleRegistry::new()),
            DEFAULT_CACHE_CAPACITY,
        ));
        let store = build_store(&api, &db, &cache, config, password_hash.clone())?;
        Ok(Self {
            ledger: TaskLedger::new(db.clone(), store.clone()),
            favorites: FavoritesIndex::new(db.clone()),
            config: config.clone(),
            api,
            db,
            cache,
            store,
            password_hash,
            server_mode: None,
            error: None,
        })
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn favorites(&self) -> &FavoritesIndex {
        &self.favorites
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn db(&self) -> &Arc<StudioDb> {
        &self.db
    }

    /// Last user-visible error, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    /// Remember the password hash for all later requests
    pub fn set_password(&mut self, password: &str) -> Result<(), SessionError> {
        let hash = sha256_hex(password);
        self.db
            .store_prefs(&ClientPrefs {
                password_hash: Some(hash.clone()),
            })
            .map_err(LedgerError::from)?;
        self.password_hash = Some(hash);
        self.store = build_store(&self.api, &self.db, &self.cache, &self.config, self.password_hash.clone())?;
        self.ledger = TaskLedger::new(self.db.clone(), self.store.clone());
        info!("Stored password hash");
        Ok(())
    }

    fn fail(&mut self, message: String) -> SessionError {
        self.error = Some(message.clone());
        SessionError::Request(message)
    }

    async fn server_mode(&mut self) -> Result<StorageMode, ApiError> {
        if let Some(mode) = self.server_mode {
            return Ok(mode);
        }
        let mode = self.api.auth_status().await?.storage_mode;
        self.server_mode = Some(mode);
        Ok(mode)
    }

    /// Run one generate or edit submission
    pub async fn submit(&mut self, form: SubmitForm) -> Result<SubmitOutcome, SessionError> {
        let mode = form.effective_mode();
        if mode == GenerationMode::Completion {
            return Err(SessionError::Invalid(
                "Completion requests are not tracked as tasks; use complete()".into(),
            ));
        }
        if form.prompt.trim().is_empty() {
            return Err(SessionError::Invalid("Please enter a prompt.".into()));
        }
        if mode == GenerationMode::Edit && form.images.is_empty() {
            return Err(SessionError::Invalid("Please upload at least one image to edit.".into()));
        }

        self.error = None;
        let started = Instant::now();

        let task = self.ledger.create_task(NewTask {
            prompt: form.prompt.clone(),
            mode,
            quality: form.quality,
            background: Some(form.background),
            moderation: Some(form.moderation),
            output_format: Some(form.output_format),
            n: Some(form.n),
            size: form.size.clone(),
        })?;

        if mode == GenerationMode::Edit {
            if let Err(e) = self.keep_source_images(&task, &form.images).await {
                let message = format!("Failed to store source images: {}", e);
                self.ledger.fail_task(&task.id, &message)?;
                return Err(self.fail(message));
            }
        }

        self.ledger.mark_processing(&task.id)?;

        let response = match self.api.submit(form.to_request(self.password_hash.clone())).await {
            Ok(response) => response,
            Err(e) if e.is_unauthorized() => {
                warn!("Task {} rejected as unauthorized", task.id);
                self.error = Some(e.to_string());
                return Err(SessionError::Unauthorized(e.to_string()));
            }
            Err(e) => {
                let message = e.to_string();
                self.ledger.fail_task(&task.id, &message)?;
                return Err(self.fail(message));
            }
        };
        self.server_mode = Some(response.storage_mode);

        if response.images.is_empty() {
            let message = "Failed to retrieve image data from API.".to_string();
            self.ledger.fail_task(&task.id, &message)?;
            return Err(self.fail(message));
        }

        let entry = self.record_batch(&task, &form, response, started).await?;
        let task = self.ledger.complete_task(&task.id, entry.timestamp)?;

        let mut images = Vec::with_capacity(entry.images.len());
        for image in &entry.images {
            let url = self
                .store
                .resolve_image(image, entry.storage_mode_used)
                .await
                .unwrap_or_else(|e| {
                    warn!("Could not resolve {}: {}", image.filename, e);
                    None
                });
            images.push(ResolvedImage {
                filename: image.filename.clone(),
                url,
            });
        }

        Ok(SubmitOutcome { task, entry, images })
    }

    async fn keep_source_images(&mut self, task: &Task, images: &[UploadedImage]) -> Result<(), SessionError> {
        let upload = self.server_mode().await.ok() == Some(StorageMode::ObjectStorage);
        for (index, image) in images.iter().enumerate() {
            let ext = image
                .filename
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_else(|| "png".to_string());
            let filename = format!("source-{}-{}.{}", task.timestamp, index, ext);

            let s3_url = if upload {
                let renamed = UploadedImage {
                    filename: filename.clone(),
                    ..image.clone()
                };
                match self.api.upload_source_image(renamed, self.password_hash.clone()).await {
                    Ok(response) => Some(response.url),
                    Err(e) => {
                        warn!("Source image {} stays local only: {}", filename, e);
                        None
                    }
                }
            } else {
                None
            };

            let storage_mode = if s3_url.is_some() {
                StorageMode::ObjectStorage
            } else {
                StorageMode::EmbeddedDb
            };
            self.ledger.attach_source_image(
                &task.id,
                SourceImageRecord {
                    filename,
                    task_id: task.id.clone(),
                    content_type: image.content_type.clone(),
                    blob: image.bytes.clone(),
                    s3_url,
                },
                storage_mode,
            )?;
        }
        Ok(())
    }

    /// Decode an inline result and keep it client-side
    async fn store_embedded(&self, result: &ImageResult) -> Result<(), String> {
        let b64 = result
            .b64_json
            .as_deref()
            .ok_or_else(|| "no image data returned".to_string())?;
        let bytes = STANDARD.decode(b64.as_bytes()).map_err(|e| e.to_string())?;
        self.store
            .embedded()
            .put(&result.filename, &bytes, content_type_for(&result.filename))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Persist embedded-mode blobs and append the history entry. Images that
    /// could not be kept are left out of the entry; a batch with none left
    /// fails the task.
    async fn record_batch(
        &mut self,
        task: &Task,
        form: &SubmitForm,
        response: GenerationResponse,
        started: Instant,
    ) -> Result<HistoryEntry, SessionError> {
        let storage_mode = response.storage_mode;
        let mut images = Vec::with_capacity(response.images.len());
        let mut failures = Vec::new();

        for result in response.images {
            let url = match storage_mode {
                StorageMode::EmbeddedDb => {
                    if let Err(e) = self.store_embedded(&result).await {
                        warn!("Failed to save image {}: {}", result.filename, e);
                        failures.push(format!("Failed to save image {}: {}", result.filename, e));
                        continue;
                    }
                    None
                }
                StorageMode::ObjectStorage => result.url,
                StorageMode::Filesystem => None,
            };
            images.push(HistoryImage {
                filename: result.filename,
                url,
            });
        }

        if images.is_empty() {
            let message = if failures.is_empty() {
                "Failed to retrieve image data from API.".to_string()
            } else {
                failures.join("; ")
            };
            self.ledger.fail_task(&task.id, &message)?;
            return Err(self.fail(message));
        }
        if let Some(first) = failures.into_iter().next() {
            self.error = Some(first);
        }

        let mut timestamp = chrono::Utc::now().timestamp_millis();
        while self.ledger.get_history_entry(timestamp)?.is_some() {
            timestamp += 1;
        }

        let entry = HistoryEntry {
            timestamp,
            images,
            storage_mode_used: storage_mode,
            duration_ms: started.elapsed().as_millis() as u64,
            quality: form.quality,
            background: form.background,
            moderation: form.moderation,
            prompt: form.prompt.clone(),
            mode: form.effective_mode(),
            cost_details: calculate_api_cost(response.usage.as_ref()),
            output_format: Some(form.output_format),
            task_id: Some(task.id.clone()),
            n: Some(form.n),
            size: form.size.clone(),
        };
        self.ledger.add_history_entry(&entry)?;
        Ok(entry)
    }

    /// Completion mode: not tracked, the provider JSON is returned as-is
    pub async fn complete(&mut self, prompt: &str, n: u32, size: Option<&str>) -> Result<serde_json::Value, SessionError> {
        let request = GenerationRequest {
            mode: Some(GenerationMode::Completion.as_str().to_string()),
            prompt: Some(prompt.to_string()),
            n: Some(n.to_string()),
            size: size.map(String::from),
            password_hash: self.password_hash.clone(),
            ..Default::default()
        };
        match self.api.complete(request).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_unauthorized() => {
                self.error = Some(e.to_string());
                Err(SessionError::Unauthorized(e.to_string()))
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Resolve one image under the mode its entry was recorded with
    pub async fn resolve(&self, image: &HistoryImage, mode: StorageMode) -> Option<String> {
        match self.store.resolve_image(image, mode).await {
            Ok(url) => url,
            Err(e) => {
                warn!("Could not resolve {}: {}", image.filename, e);
                None
            }
        }
    }

    /// Resolve every image of an entry; reports when some are gone
    pub async fn select_history(&mut self, entry: &HistoryEntry) -> HistorySelection {
        let mut images = Vec::with_capacity(entry.images.len());
        for image in &entry.images {
            images.push(ResolvedImage {
                filename: image.filename.clone(),
                url: self.resolve(image, entry.storage_mode_used).await,
            });
        }

        let error = images
            .iter()
            .any(|img| img.url.is_none())
            .then(|| MISSING_IMAGES_MESSAGE.to_string());
        self.error = error.clone();
        HistorySelection { images, error }
    }

    /// Load the images of a history entry back as edit sources, reading
    /// each from the backend the entry was recorded under
    pub async fn sources_from_history(&mut self, timestamp: i64) -> Result<Vec<UploadedImage>, SessionError> {
        let entry = self
            .ledger
            .get_history_entry(timestamp)?
            .ok_or(LedgerError::HistoryNotFound(timestamp))?;

        let mut sources = Vec::with_capacity(entry.images.len());
        for image in &entry.images {
            match self.store.read_image(image, entry.storage_mode_used).await {
                Ok(Some(bytes)) => sources.push(UploadedImage {
                    filename: image.filename.clone(),
                    content_type: content_type_for(&image.filename).to_string(),
                    bytes,
                }),
                Ok(None) => warn!("Image {} of history entry {} is gone", image.filename, timestamp),
                Err(e) => warn!("Could not load {}: {}", image.filename, e),
            }
        }

        if sources.is_empty() {
            return Err(self.fail(NO_SOURCES_MESSAGE.to_string()));
        }
        if sources.len() < entry.images.len() {
            self.error = Some(MISSING_IMAGES_MESSAGE.to_string());
        }
        Ok(sources)
    }

    /// Source images kept for an edit task, in upload order
    pub fn sources_from_task(&self, task_id: &str) -> Result<Vec<UploadedImage>, SessionError> {
        let task = self
            .ledger
            .get_task(task_id)?
            .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))?;

        let mut sources = Vec::with_capacity(task.source_images.len());
        for source in &task.source_images {
            match self.db.get_source_image(&source.filename).map_err(LedgerError::from)? {
                Some(record) => sources.push(UploadedImage {
                    filename: record.filename,
                    content_type: record.content_type,
                    bytes: record.blob,
                }),
                None => warn!("Source image {} of task {} is gone", source.filename, task_id),
            }
        }

        if sources.is_empty() {
            return Err(SessionError::Invalid(format!("Task {} has no stored source images", task_id)));
        }
        Ok(sources)
    }

    /// Edit form repeating an earlier edit task, optionally with a new prompt
    pub fn reedit_form(&self, task_id: &str, prompt: Option<String>) -> Result<SubmitForm, SessionError> {
        let sources = self.sources_from_task(task_id)?;
        let task = self
            .ledger
            .get_task(task_id)?
            .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))?;

        let mut form = SubmitForm::edit(prompt.unwrap_or(task.prompt), sources);
        form.quality = task.quality;
        form.n = task.n.unwrap_or(1);
        form.size = task.size;
        if let Some(format) = task.output_format {
            form.output_format = format;
        }
        Ok(form)
    }

    pub async fn delete_history_entry(&mut self, timestamp: i64) -> Result<(), SessionError> {
        match self.ledger.delete_history_entry(timestamp).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    pub async fn clear_history(&mut self) -> Result<usize, SessionError> {
        Ok(self.ledger.clear_history().await?)
    }
}

fn build_store(
    api: &Arc<dyn StudioApi>,
    db: &Arc<StudioDb>,
    cache: &Arc<ImageSourceCache>,
    config: &StudioConfig,
    password_hash: Option<String>,
) -> Result<Arc<ImageStore>, SessionError> {
    let object: Arc<dyn ImageBackend> = match &config.s3 {
        Some(settings) => Arc::new(
            ObjectStorageBackend::new(settings, config.public_urls.clone())
                .map_err(|e| SessionError::Invalid(e.to_string()))?,
        ),
        None => Arc::new(ObjectStorageBackend::read_only(config.public_urls.clone())),
    };
    Ok(Arc::new(ImageStore::new(
        Arc::new(RemoteFilesystemBackend::new(api.clone(), password_hash)),
        EmbeddedDbBackend::new(db.clone(), cache.clone()),
        object,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AuthStatus, DeleteImagesResponse, ImageResult, TaskStatus, UploadSourceResponse, Usage,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Canned server: answers every submission with `reply`
    struct FakeApi {
        mode: StorageMode,
        reply: Mutex<Option<Result<GenerationResponse, ApiError>>>,
        uploads: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(mode: StorageMode, reply: Result<GenerationResponse, ApiError>) -> Arc<Self> {
            Arc::new(Self {
                mode,
                reply: Mutex::new(Some(reply)),
                uploads: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StudioApi for FakeApi {
        async fn submit(&self, _request: GenerationRequest) -> Result<GenerationResponse, ApiError> {
            self.reply.lock().unwrap().take().expect("one submission per test")
        }

        async fn complete(&self, request: GenerationRequest) -> Result<serde_json::Value, ApiError> {
            Ok(serde_json::json!({ "echo": request.prompt }))
        }

        async fn auth_status(&self) -> Result<AuthStatus, ApiError> {
            Ok(AuthStatus {
                password_required: false,
                storage_mode: self.mode,
            })
        }

        async fn delete_images(
            &self,
            _filenames: Vec<String>,
            _password_hash: Option<String>,
        ) -> Result<DeleteImagesResponse, ApiError> {
            Ok(DeleteImagesResponse {
                success: true,
                results: Vec::new(),
            })
        }

        async fn upload_source_image(
            &self,
            image: UploadedImage,
            _password_hash: Option<String>,
        ) -> Result<UploadSourceResponse, ApiError> {
            self.uploads.lock().unwrap().push(image.filename.clone());
            Ok(UploadSourceResponse {
                success: true,
                url: format!("https://cdn.example.com/{}", image.filename),
                filename: image.filename,
            })
        }

        async fn image_exists(&self, _filename: &str) -> Result<bool, ApiError> {
            Ok(true)
        }

        async fn fetch_image(&self, filename: &str) -> Result<Option<Vec<u8>>, ApiError> {
            Ok(Some(filename.as_bytes().to_vec()))
        }

        fn image_url(&self, filename: &str) -> String {
            format!("/api/image/{}", filename)
        }
    }

    fn b64_result(filename: &str, bytes: &[u8]) -> ImageResult {
        ImageResult {
            filename: filename.into(),
            b64_json: Some(STANDARD.encode(bytes)),
            url: None,
            path: None,
            output_format: "png".into(),
            original: false,
        }
    }

    fn session(api: Arc<FakeApi>) -> (tempfile::TempDir, StudioSession) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(StudioDb::open(Some(&dir.path().join("studio.redb"))).unwrap());
        let config = StudioConfig::from_lookup(|key| {
            (key == "S3_PUBLIC_DOMAIN").then(|| "https://cdn.example.com".to_string())
        });
        let session = StudioSession::new(db, api, &config).unwrap();
        (dir, session)
    }

    #[tokio::test]
    async fn test_embedded_submission_completes_task() {
        let api = FakeApi::new(
            StorageMode::EmbeddedDb,
            Ok(GenerationResponse {
                images: vec![b64_result("1-0.png", b"first"), b64_result("1-1.png", b"second")],
                usage: Some(Usage {
                    input_tokens: 200,
                    output_tokens: 1000,
                    total_tokens: 1200,
                    input_tokens_details: None,
                }),
                storage_mode: StorageMode::EmbeddedDb,
            }),
        );
        let (_dir, mut session) = session(api);

        let mut form = SubmitForm::generate("two foxes");
        form.n = 2;
        let outcome = session.submit(form).await.unwrap();

        assert_eq!(outcome.task.status, TaskStatus::Completed);
        assert_eq!(outcome.task.history_timestamp, Some(outcome.entry.timestamp));
        assert_eq!(outcome.entry.storage_mode_used, StorageMode::EmbeddedDb);
        assert_eq!(outcome.entry.cost_details.unwrap().estimated_cost_usd, 0.041);
        assert_eq!(outcome.images.len(), 2);
        assert!(outcome.images.iter().all(|img| img
            .url
            .as_deref()
            .is_some_and(|u| u.starts_with("blob:studio/"))));
        assert_eq!(session.db().get_image("1-1.png").unwrap().unwrap().blob, b"second");
        assert!(session.error().is_none());
    }

    fn embedded_reply(images: Vec<ImageResult>) -> Result<GenerationResponse, ApiError> {
        Ok(GenerationResponse {
            images,
            usage: None,
            storage_mode: StorageMode::EmbeddedDb,
        })
    }

    #[tokio::test]
    async fn test_url_only_embedded_result_fails_task() {
        let api = FakeApi::new(
            StorageMode::EmbeddedDb,
            embedded_reply(vec![ImageResult {
                filename: "5-0.png".into(),
                b64_json: None,
                url: Some("https://provider.example.com/5-0.png".into()),
                path: None,
                output_format: "png".into(),
                original: false,
            }]),
        );
        let (_dir, mut session) = session(api);

        assert!(session.submit(SubmitForm::generate("a fox")).await.is_err());
        let task = &session.ledger().list_tasks(None).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("Failed to save image 5-0.png: no image data returned")
        );
        assert!(session.ledger().history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_embedded_result_fails_task() {
        let mut bad = b64_result("6-0.png", b"");
        bad.b64_json = Some("!!!not base64!!!".into());
        let api = FakeApi::new(StorageMode::EmbeddedDb, embedded_reply(vec![bad]));
        let (_dir, mut session) = session(api);

        assert!(session.submit(SubmitForm::generate("a fox")).await.is_err());
        let task = &session.ledger().list_tasks(None).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().starts_with("Failed to save image 6-0.png"));
        assert_eq!(session.error(), task.error.as_deref());
        assert!(session.ledger().history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_save_records_only_stored_images() {
        let mut bad = b64_result("7-1.png", b"");
        bad.b64_json = Some("%%%".into());
        let api = FakeApi::new(
            StorageMode::EmbeddedDb,
            embedded_reply(vec![b64_result("7-0.png", b"good"), bad]),
        );
        let (_dir, mut session) = session(api);

        let mut form = SubmitForm::generate("two foxes");
        form.n = 2;
        let outcome = session.submit(form).await.unwrap();
        assert_eq!(outcome.task.status, TaskStatus::Completed);
        assert_eq!(outcome.entry.filenames(), vec!["7-0.png".to_string()]);
        assert!(outcome.images[0].url.is_some());
        assert!(session.error().unwrap().starts_with("Failed to save image 7-1.png"));
    }

    #[tokio::test]
    async fn test_history_images_load_as_edit_sources() {
        let api = FakeApi::new(
            StorageMode::EmbeddedDb,
            embedded_reply(vec![b64_result("8-0.png", b"pixels")]),
        );
        let (_dir, mut session) = session(api);
        let outcome = session.submit(SubmitForm::generate("a fox")).await.unwrap();

        let sources = session.sources_from_history(outcome.entry.timestamp).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].filename, "8-0.png");
        assert_eq!(sources[0].content_type, "image/png");
        assert_eq!(sources[0].bytes, b"pixels");
        assert_eq!(
            SubmitForm::edit("add a hat", sources).effective_mode(),
            GenerationMode::Edit
        );

        // Filesystem entries are fetched from the server
        let mut remote = outcome.entry.clone();
        remote.timestamp += 1_000;
        remote.storage_mode_used = StorageMode::Filesystem;
        session.ledger().add_history_entry(&remote).unwrap();
        let sources = session.sources_from_history(remote.timestamp).await.unwrap();
        assert_eq!(sources[0].bytes, b"8-0.png");

        session.store().embedded().delete("8-0.png").await.unwrap();
        let err = session.sources_from_history(outcome.entry.timestamp).await.unwrap_err();
        assert_eq!(err.to_string(), NO_SOURCES_MESSAGE);
    }

    #[tokio::test]
    async fn test_reedit_reuses_kept_sources() {
        let api = FakeApi::new(
            StorageMode::EmbeddedDb,
            embedded_reply(vec![b64_result("9-0.png", b"edited")]),
        );
        let (_dir, mut session) = session(api.clone());

        let source = UploadedImage {
            filename: "cat.png".into(),
            content_type: "image/png".into(),
            bytes: vec![1, 2, 3],
        };
        let mut form = SubmitForm::edit("add a hat", vec![source]);
        form.quality = Quality::High;
        let outcome = session.submit(form).await.unwrap();
        assert!(api.uploads.lock().unwrap().is_empty());

        let again = session.reedit_form(&outcome.task.id, Some("add a scarf".into())).unwrap();
        assert_eq!(again.effective_mode(), GenerationMode::Edit);
        assert_eq!(again.prompt, "add a scarf");
        assert_eq!(again.quality, Quality::High);
        assert_eq!(again.images.len(), 1);
        assert_eq!(again.images[0].bytes, vec![1, 2, 3]);
        assert!(again.images[0].filename.starts_with("source-"));

        let same = session.reedit_form(&outcome.task.id, None).unwrap();
        assert_eq!(same.prompt, "add a hat");

        assert!(session.reedit_form("missing", None).is_err());
    }

    #[tokio::test]
    async fn test_server_reported_mode_wins() {
        let api = FakeApi::new(
            StorageMode::Filesystem,
            Ok(GenerationResponse {
                images: vec![ImageResult {
                    filename: "9-0.png".into(),
                    b64_json: Some(STANDARD.encode(b"x")),
                    url: None,
                    path: Some("/api/image/9-0.png".into()),
                    output_format: "png".into(),
                    original: false,
                }],
                usage: None,
                storage_mode: StorageMode::Filesystem,
            }),
        );
        let (_dir, mut session) = session(api);

        let outcome = session.submit(SubmitForm::generate("a fox")).await.unwrap();
        assert_eq!(outcome.entry.storage_mode_used, StorageMode::Filesystem);
        assert_eq!(outcome.images[0].url.as_deref(), Some("/api/image/9-0.png"));
        assert!(session.db().get_image("9-0.png").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_leaves_task_processing() {
        let api = FakeApi::new(
            StorageMode::Filesystem,
            Err(ApiError::Unauthorized("Unauthorized: Invalid password.".into())),
        );
        let (_dir, mut session) = session(api);

        let err = session.submit(SubmitForm::generate("a fox")).await.unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized(_)));
        let tasks = session.ledger().list_tasks(None).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Processing);
        assert_eq!(session.error(), Some("Unauthorized: Invalid password."));
    }

    #[tokio::test]
    async fn test_provider_failure_marks_task_failed() {
        let api = FakeApi::new(
            StorageMode::Filesystem,
            Err(ApiError::Status {
                status: 400,
                message: "Your request was rejected by the safety system.".into(),
            }),
        );
        let (_dir, mut session) = session(api);

        assert!(session.submit(SubmitForm::generate("a fox")).await.is_err());
        let task = &session.ledger().list_tasks(None).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("Your request was rejected by the safety system.")
        );
        assert_eq!(session.error(), task.error.as_deref());
        assert!(session.ledger().history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_uploads_sources_in_object_storage_mode() {
        let api = FakeApi::new(
            StorageMode::ObjectStorage,
            Ok(GenerationResponse {
                images: vec![ImageResult {
                    filename: "3-0.png".into(),
                    b64_json: None,
                    url: Some("https://cdn.example.com/dreamImage/3-0.png".into()),
                    path: None,
                    output_format: "png".into(),
                    original: false,
                }],
                usage: None,
                storage_mode: StorageMode::ObjectStorage,
            }),
        );
        let (_dir, mut session) = session(api.clone());

        let source = UploadedImage {
            filename: "cat.PNG".into(),
            content_type: "image/png".into(),
            bytes: vec![1, 2, 3],
        };
        let outcome = session.submit(SubmitForm::edit("add a hat", vec![source])).await.unwrap();

        assert_eq!(outcome.entry.mode, GenerationMode::Edit);
        assert_eq!(api.uploads.lock().unwrap().len(), 1);
        let task = session.ledger().get_task(&outcome.task.id).unwrap().unwrap();
        assert_eq!(task.source_storage_mode, Some(StorageMode::ObjectStorage));
        assert!(task.source_images[0].s3_url.is_some());
        assert!(task.source_images[0].filename.ends_with(".png"));
        assert_eq!(
            outcome.images[0].url.as_deref(),
            Some("https://cdn.example.com/dreamImage/3-0.png")
        );
    }

    #[tokio::test]
    async fn test_select_history_reports_missing_images() {
        let api = FakeApi::new(StorageMode::EmbeddedDb, Err(ApiError::Transport("unused".into())));
        let (_dir, mut session) = session(api);

        session.store().embedded().put("4-0.png", b"ok", "image/png").await.unwrap();
        let entry = HistoryEntry {
            timestamp: 4,
            images: vec![
                HistoryImage {
                    filename: "4-0.png".into(),
                    url: None,
                },
                HistoryImage {
                    filename: "4-1.png".into(),
                    url: None,
                },
            ],
            storage_mode_used: StorageMode::EmbeddedDb,
            duration_ms: 1,
            quality: Quality::Auto,
            background: Background::Auto,
            moderation: Moderation::Auto,
            prompt: "p".into(),
            mode: GenerationMode::Generate,
            cost_details: None,
            output_format: None,
            task_id: None,
            n: None,
            size: None,
        };

        let selection = session.select_history(&entry).await;
        assert!(selection.images[0].url.is_some());
        assert!(selection.images[1].url.is_none());
        assert_eq!(selection.error.as_deref(), Some(MISSING_IMAGES_MESSAGE));
        assert_eq!(session.error(), Some(MISSING_IMAGES_MESSAGE));
    }

    #[tokio::test]
    async fn test_completion_is_not_a_task() {
        let api = FakeApi::new(StorageMode::Filesystem, Err(ApiError::Transport("unused".into())));
        let (_dir, mut session) = session(api);

        let mut form = SubmitForm::generate("hello");
        form.mode = GenerationMode::Completion;
        assert!(matches!(session.submit(form).await, Err(SessionError::Invalid(_))));

        let value = session.complete("hello", 1, None).await.unwrap();
        assert_eq!(value["echo"], "hello");
        assert!(session.ledger().list_tasks(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_password_is_persisted() {
        let api = FakeApi::new(StorageMode::Filesystem, Err(ApiError::Transport("unused".into())));
        let (_dir, mut session) = session(api);
        session.set_password("hunter2").unwrap();
        assert_eq!(session.password_hash(), Some(sha256_hex("hunter2").as_str()));
        assert_eq!(
            session.db().get_prefs().unwrap().password_hash,
            Some(sha256_hex("hunter2"))
        );
    }

    #[test]
    fn test_request_fields_by_mode() {
        let mut form = SubmitForm::generate("p");
        form.output_format = OutputFormat::Png;
        form.output_compression = Some(80);
        let request = form.to_request(None);
        assert_eq!(request.mode.as_deref(), Some("generate"));
        assert!(request.output_compression.is_none());
        assert_eq!(request.background.as_deref(), Some("auto"));

        let edit = SubmitForm::edit(
            "p",
            vec![UploadedImage {
                filename: "a.png".into(),
                content_type: "image/png".into(),
                bytes: vec![0],
            }],
        );
        let request = edit.to_request(Some("h".into()));
        assert_eq!(request.mode.as_deref(), Some("edit"));
        assert!(request.background.is_none());
        assert_eq!(request.password_hash.as_deref(), Some("h"));
    }
}
