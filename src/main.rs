mod cache;
mod cad;
mod catalog;
mod config;
mod error;
mod extractor;
mod foundry;
mod media;
mod models;
mod pdf;
mod rate_limit;
mod recommendations;
mod routes;
mod storage;
mod workflow;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cache::DiskCache;
use crate::catalog::AssetCatalog;
use crate::config::Settings;
use crate::foundry::FoundryClient;
use crate::rate_limit::RateLimiter;
use crate::routes::AppState;
use crate::storage::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let settings = Settings::load();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    fmt().with_env_filter(filter).init();

    let session_images_dir = PathBuf::from(&settings.session_images_dir);
    let cad_run_dir = session_images_dir.join("cad_runs");
    std::fs::create_dir_all(&cad_run_dir)
        .with_context(|| format!("creating {}", cad_run_dir.display()))?;

    let state = AppState {
        store: Arc::new(SessionStore::new(&settings.db_path).context("opening session store")?),
        catalog: Arc::new(
            AssetCatalog::new(&settings.db_path, &settings.assets_dir)
                .context("opening asset catalog")?,
        ),
        foundry: Arc::new(FoundryClient::new(settings.clone())),
        cache: Arc::new(DiskCache::new(&settings.cache_dir).context("creating cache dir")?),
        limiter: Arc::new(RateLimiter::new(120, 60)),
        session_images_dir: session_images_dir.clone(),
        cad_run_dir,
        settings: Arc::new(settings.clone()),
    };

    let cors = if settings.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> =
            settings.cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/api/chat", post(routes::chat))
        .route("/api/brief/upload", post(routes::upload_brief))
        .route("/api/assets/index", post(routes::index_assets))
        .route("/api/assets/catalog", get(routes::asset_catalog_list))
        .route("/api/recommendations/:session_id", get(routes::get_recommendations))
        .route("/api/image/generate", post(routes::image_generate))
        .route("/api/image/edit", post(routes::image_edit))
        .route("/api/image/adopt-baseline", post(routes::adopt_baseline))
        .route("/api/baseline/skip", post(routes::skip_baseline))
        .route("/api/version/approve", post(routes::approve_version))
        .route("/api/cad/generate", post(routes::cad_generate))
        .route("/api/cad/run-code", post(routes::cad_run_code))
        .route("/api/cad/fix-code", post(routes::cad_fix_code))
        .route("/api/cache/clear", post(routes::clear_cache))
        .route("/api/session/clear", post(routes::clear_session))
        .route("/api/session/:session_id", get(routes::get_session))
        .nest_service("/asset-files", ServeDir::new(&settings.assets_dir))
        .nest_service("/session-files", ServeDir::new(&session_images_dir))
        // Brief uploads run up to 12 MB; leave headroom over the multipart
        // framing.
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, "Starting pack design studio server");
    let listener = tokio::net::TcpListener::bind(addr).await.context("binding listener")?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("serving")?;
    Ok(())
}
