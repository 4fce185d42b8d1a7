//! ============================================================================
//! STUDIO-SERVER: HTTP surface of the generation proxy
//! ============================================================================
//! Endpoints:
//! - POST /api/images                  - Generate, edit or complete (multipart)
//! - GET  /api/image/{filename}        - Serve a filesystem-mode image
//! - GET  /api/s3-image/{filename}     - Redirect to an object-storage image
//! - POST /api/upload-source-image     - Upload an edit source to object storage
//! - POST /api/image-delete            - Delete server-held images
//! - GET  /api/auth-status             - Password requirement and storage mode
//! - GET  /health                      - Liveness
//!
//! Errors are JSON `{"error": "..."}` with the status the proxy assigns.
//! ============================================================================

mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use studio_core::{GenerationProxy, StudioConfig};

use self::handlers::{
    handle_auth_status, handle_health, handle_image, handle_image_delete, handle_images, handle_not_found,
    handle_s3_image, handle_upload_source_image,
};

/// Ten source images plus a mask at provider limits
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Shared state for every route
pub struct AppState {
    pub proxy: GenerationProxy,
}

impl AppState {
    pub fn new(config: StudioConfig) -> anyhow::Result<Self> {
        let proxy = GenerationProxy::new(Arc::new(config))?;
        Ok(Self { proxy })
    }
}

/// All proxy routes with CORS, tracing and the body limit applied
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/images", post(handle_images))
        .route("/api/image/{filename}", get(handle_image))
        .route("/api/s3-image/{filename}", get(handle_s3_image))
        .route("/api/upload-source-image", post(handle_upload_source_image))
        .route("/api/image-delete", post(handle_image_delete))
        .route("/api/auth-status", get(handle_auth_status))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Load `.env`, set up logging and serve until Ctrl+C
pub async fn run() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("studio_server=debug".parse()?)
                .add_directive("studio_core=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting Image Studio server");

    let config = StudioConfig::from_env();
    config.log_summary();
    let addr = config.bind_addr.clone();

    let state = Arc::new(AppState::new(config)?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Image Studio listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
