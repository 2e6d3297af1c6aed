use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Multipart, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{sha256_bytes, sha256_text, DiskCache};
use crate::cad;
use crate::catalog::AssetCatalog;
use crate::config::Settings;
use crate::error::AppError;
use crate::extractor::{
    missing_fields, required_questions_for_missing, spec_summary, update_spec_from_message,
};
use crate::foundry::FoundryClient;
use crate::media;
use crate::models::*;
use crate::rate_limit::RateLimiter;
use crate::storage::SessionStore;
use crate::workflow::{handle_chat_turn, WORKFLOW_SYSTEM_PROMPT};

const MAX_BRIEF_BYTES: usize = 12 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<SessionStore>,
    pub catalog: Arc<AssetCatalog>,
    pub foundry: Arc<FoundryClient>,
    pub cache: Arc<DiskCache>,
    pub limiter: Arc<RateLimiter>,
    pub session_images_dir: PathBuf,
    pub cad_run_dir: PathBuf,
}

fn request_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Foundry-Api-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_text(value: &str, field: &str, min: usize, max: usize) -> Result<(), AppError> {
    let len = value.trim().len();
    if len < min {
        return Err(AppError::Validation(format!("{field} must not be empty.")));
    }
    if len > max {
        return Err(AppError::Validation(format!("{field} is too long (max {max} characters).")));
    }
    Ok(())
}

fn normalize_ws(value: &str) -> String {
    Regex::new(r"\s+")
        .expect("static pattern")
        .replace_all(value.trim(), " ")
        .into_owned()
}

/// Public URL for a file under the session images directory.
fn public_session_file(session_images_dir: &FsPath, path: &FsPath) -> Option<String> {
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let base =
        std::fs::canonicalize(session_images_dir).unwrap_or_else(|_| session_images_dir.to_path_buf());
    let rel = resolved.strip_prefix(&base).ok()?;
    Some(format!("/session-files/{}", rel.to_string_lossy().replace('\\', "/")))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub async fn chat(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    app.limiter.check("chat", &addr.ip().to_string())?;
    require_text(&payload.session_id, "session_id", 1, 120)?;
    require_text(&payload.user_message, "user_message", 1, 4000)?;
    let req_api_key = request_api_key(&headers);

    let mut state = app.store.get_or_create(&payload.session_id)?;

    // The baseline decision is one-shot; refresh the catalog ahead of it
    // when auto indexing is on.
    if app.settings.auto_index_assets && !state.baseline.is_decided() && state.step <= 3 {
        match app.catalog.index_assets(&app.foundry, false, req_api_key.as_deref()).await {
            Ok((indexed, total)) if indexed > 0 => {
                info!(indexed, total, "auto-indexed assets before baseline search");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "auto asset indexing failed; continuing with existing metadata");
            }
        }
    }

    let catalog = app.catalog.clone();
    let outcome = handle_chat_turn(&mut state, &payload.user_message, |spec| {
        catalog.find_matches(spec, 2, 5).unwrap_or_default()
    });

    let mut assistant_message =
        outcome.reply.as_ref().map(|r| r.text.clone()).unwrap_or_default();

    // LLM polish only for non-protocol replies; Decision strings must stay
    // bit-exact for the UI and the tests that match on them.
    if let Some(reply) = &outcome.reply {
        if !reply.kind.preserve_verbatim() {
            let history_tail: Vec<_> =
                state.history.iter().rev().take(8).rev().cloned().collect();
            let polish_request = format!(
                "Rewrite this response with concise senior packaging engineer tone while \
                 preserving exact meaning and workflow constraints: {}",
                reply.text
            );
            match app
                .foundry
                .chat(WORKFLOW_SYSTEM_PROMPT, &history_tail, &polish_request, req_api_key.as_deref())
                .await
            {
                Ok(Some(polished)) => {
                    assistant_message = polished.trim().to_string();
                    if let Some(last) = state.history.last_mut() {
                        if last.role == "assistant" {
                            last.content = assistant_message.clone();
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "chat polish failed, using deterministic response");
                }
            }
        }
    }

    app.store.save(&state)?;
    Ok(Json(ChatResponse {
        assistant_message,
        step: state.step,
        spec_summary: spec_summary(&state.spec),
        required_questions: state.required_questions.clone(),
        can_generate_image: outcome.flags.can_generate_image,
        can_iterate_image: outcome.flags.can_iterate_image,
        can_lock: outcome.flags.can_lock,
        can_generate_cad: outcome.flags.can_generate_cad,
    }))
}

pub async fn upload_brief(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<BriefUploadResponse>, AppError> {
    app.limiter.check("brief-upload", &addr.ip().to_string())?;
    let req_api_key = request_api_key(&headers);

    let mut session_id = String::new();
    let mut filename = String::new();
    let mut pdf_bytes: Vec<u8> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart payload: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("session_id") => {
                session_id = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid session_id field: {e}")))?;
            }
            Some("file") => {
                filename = field.file_name().unwrap_or_default().to_string();
                pdf_bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Invalid file field: {e}")))?
                    .to_vec();
            }
            _ => {}
        }
    }

    require_text(&session_id, "session_id", 1, 120)?;
    if !filename.to_lowercase().ends_with(".pdf") {
        return Err(AppError::Validation(
            "Only PDF files are supported for marketing brief upload.".to_string(),
        ));
    }
    if pdf_bytes.is_empty() {
        return Err(AppError::Validation("Uploaded PDF is empty.".to_string()));
    }
    if pdf_bytes.len() > MAX_BRIEF_BYTES {
        return Err(AppError::Validation(
            "PDF is too large. Maximum supported size is 12 MB.".to_string(),
        ));
    }

    let text = crate::pdf::extract_text(&pdf_bytes)?;
    if text.is_empty() {
        return Err(AppError::Validation("Could not extract readable text from PDF.".to_string()));
    }

    let mut state = app.store.get_or_create(&session_id)?;
    update_spec_from_message(&mut state.spec, &text);

    let extracted = match app
        .foundry
        .extract_design_spec_from_brief(&text, req_api_key.as_deref())
        .await
    {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "brief AI extraction failed; using deterministic parse only");
            json!({})
        }
    };

    for field in
        ["product_type", "size_or_volume", "intended_material", "closure_type", "design_style"]
    {
        if let Some(value) = extracted.get(field).and_then(serde_json::Value::as_str) {
            let cleaned = value.trim().to_lowercase();
            if !cleaned.is_empty() {
                match field {
                    "product_type" => state.spec.product_type = Some(cleaned),
                    "size_or_volume" => state.spec.size_or_volume = Some(cleaned),
                    "intended_material" => state.spec.intended_material = Some(cleaned),
                    "closure_type" => state.spec.closure_type = Some(cleaned),
                    _ => state.spec.design_style = Some(cleaned),
                }
            }
        }
    }
    if let Some(dims) = extracted.get("dimensions").and_then(serde_json::Value::as_object) {
        for (key, value) in dims {
            if let Some(number) = value.as_f64() {
                state.spec.dimensions.insert(key.clone(), number);
            }
        }
    }

    state.missing_fields = missing_fields(&state.spec);
    state.required_questions = required_questions_for_missing(&state.missing_fields);
    state.baseline = BaselinePhase::Pending;
    state.baseline_matches.clear();
    state.baseline_asset = None;
    state
        .history
        .push(HistoryEntry::new("system", format!("Marketing brief uploaded: {filename}")));

    let message = if state.missing_fields.is_empty() {
        state.step = 3;
        "Marketing brief processed. Design spec extracted and ready for baseline search."
    } else {
        state.step = 1;
        "Marketing brief processed. Some mandatory fields are still missing."
    };

    app.store.save(&state)?;
    Ok(Json(BriefUploadResponse {
        message: message.to_string(),
        step: state.step,
        spec_summary: spec_summary(&state.spec),
        required_questions: state.required_questions.clone(),
    }))
}

pub async fn index_assets(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<AssetIndexRequest>,
) -> Result<Json<AssetIndexResponse>, AppError> {
    app.limiter.check("assets-index", &addr.ip().to_string())?;
    let req_api_key = request_api_key(&headers);
    let (indexed_count, total_assets) = app
        .catalog
        .index_assets(&app.foundry, payload.force_reindex, req_api_key.as_deref())
        .await?;
    Ok(Json(AssetIndexResponse { indexed_count, total_assets }))
}

pub async fn asset_catalog_list(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<AssetCatalogResponse>, AppError> {
    app.limiter.check("assets-catalog", &addr.ip().to_string())?;
    let items = app.catalog.list_catalog(300)?;
    Ok(Json(AssetCatalogResponse { total: items.len(), items }))
}

pub async fn get_recommendations(
    Path(session_id): Path<String>,
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<EditRecommendationsResponse>, AppError> {
    app.limiter.check("recommendations", &addr.ip().to_string())?;
    let state = app.store.get_or_create(&session_id)?;
    let recommendations = crate::recommendations::build_edit_recommendations(&state.spec);
    Ok(Json(EditRecommendationsResponse { count: recommendations.len(), recommendations }))
}

pub async fn image_generate(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ImageGenerateRequest>,
) -> Result<Json<ImageResponse>, AppError> {
    app.limiter.check("image-generate", &addr.ip().to_string())?;
    require_text(&payload.session_id, "session_id", 1, 120)?;
    require_text(&payload.prompt, "prompt", 3, 2000)?;
    let req_api_key = request_api_key(&headers);

    let mut state = app.store.get_or_create(&payload.session_id)?;
    if state.step < 3 {
        return Err(AppError::Precondition("Workflow has not reached STEP 3.".to_string()));
    }

    let cache_key = sha256_text(&normalize_ws(&payload.prompt));
    let cached = app.cache.get_image("concept", &cache_key);
    let generated = match &cached {
        Some(hit) => crate::foundry::GeneratedImage {
            image_id: hit.image_id.clone(),
            image_url_or_base64: hit.image_data_url.clone(),
        },
        None => app
            .foundry
            .image_generate(&payload.prompt, req_api_key.as_deref())
            .await
            .map_err(|e| AppError::Provider(format!("Image generation failed: {e}")))?,
    };

    let version = state.next_image_version();
    let (image_data_url, local_path) = media::materialize_session_image(
        app.foundry.http_client(),
        &app.session_images_dir,
        &payload.session_id,
        version,
        &generated.image_url_or_base64,
        req_api_key.as_deref(),
    )
    .await?;
    if cached.is_none() {
        let id = if generated.image_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            generated.image_id.clone()
        };
        app.cache.put_image("concept", &cache_key, &id, &image_data_url);
    }

    let image = ImageVersion {
        image_id: if generated.image_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            generated.image_id
        },
        image_url_or_base64: image_data_url,
        version,
        prompt: payload.prompt.clone(),
        local_image_path: Some(local_path),
    };
    state.images.push(image.clone());

    // A new concept restarts active 2D iteration: the previous lock and any
    // downstream CAD artifacts no longer describe the visual reference.
    state.step = 4;
    state.lock = LockPhase::NotAsked;
    state.invalidate_downstream_artifacts();

    app.store.save(&state)?;
    Ok(Json(ImageResponse {
        image_id: image.image_id,
        image_url_or_base64: image.image_url_or_base64,
        version: image.version,
    }))
}

pub async fn image_edit(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ImageEditRequest>,
) -> Result<Json<ImageResponse>, AppError> {
    app.limiter.check("image-edit", &addr.ip().to_string())?;
    require_text(&payload.session_id, "session_id", 1, 120)?;
    require_text(&payload.instruction_prompt, "instruction_prompt", 3, 2000)?;
    let req_api_key = request_api_key(&headers);

    let mut state = app.store.get_or_create(&payload.session_id)?;
    if state.images.is_empty() {
        return Err(AppError::Precondition(
            "No reference image found. Generate or adopt a concept first.".to_string(),
        ));
    }
    if state.locked() {
        return Err(AppError::Precondition(
            "Design is locked. Iteration is not allowed.".to_string(),
        ));
    }
    if state.step < 4 {
        state.step = 4;
    }

    // Iteration is always continuous from the latest visual, not the
    // caller-named image id.
    let latest = state.images.last().map(|img| {
        img.local_image_path.clone().unwrap_or_else(|| img.image_url_or_base64.clone())
    });
    let latest_ref =
        media::normalize_image_ref_for_edit(&latest.unwrap_or_else(|| payload.image_id.clone()));
    let (source_blob, _) =
        media::resolve_image_bytes(app.foundry.http_client(), &latest_ref, req_api_key.as_deref())
            .await?;
    let edit_key = sha256_text(&format!(
        "{}::{}",
        sha256_bytes(&source_blob),
        normalize_ws(&payload.instruction_prompt)
    ));

    let cached = app.cache.get_image("edit", &edit_key);
    let edited = match &cached {
        Some(hit) => crate::foundry::GeneratedImage {
            image_id: hit.image_id.clone(),
            image_url_or_base64: hit.image_data_url.clone(),
        },
        None => app
            .foundry
            .image_edit(&latest_ref, &payload.instruction_prompt, req_api_key.as_deref())
            .await
            .map_err(|e| AppError::Provider(format!("Image edit failed: {e}")))?,
    };

    let version = state.next_image_version();
    let (image_data_url, local_path) = media::materialize_session_image(
        app.foundry.http_client(),
        &app.session_images_dir,
        &payload.session_id,
        version,
        &edited.image_url_or_base64,
        req_api_key.as_deref(),
    )
    .await?;
    if cached.is_none() {
        let id = if edited.image_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            edited.image_id.clone()
        };
        app.cache.put_image("edit", &edit_key, &id, &image_data_url);
    }

    let image = ImageVersion {
        image_id: if edited.image_id.is_empty() { Uuid::new_v4().to_string() } else { edited.image_id },
        image_url_or_base64: image_data_url,
        version,
        prompt: payload.instruction_prompt.clone(),
        local_image_path: Some(local_path),
    };
    state.images.push(image.clone());
    state.invalidate_downstream_artifacts();

    app.store.save(&state)?;
    Ok(Json(ImageResponse {
        image_id: image.image_id,
        image_url_or_base64: image.image_url_or_base64,
        version: image.version,
    }))
}

pub async fn adopt_baseline(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<BaselineAdoptRequest>,
) -> Result<Json<ImageResponse>, AppError> {
    app.limiter.check("image-adopt-baseline", &addr.ip().to_string())?;
    require_text(&payload.session_id, "session_id", 1, 120)?;

    let mut state = app.store.get_or_create(&payload.session_id)?;
    let matched = state
        .baseline_matches
        .iter()
        .find(|m| m.asset_rel_path == payload.asset_rel_path)
        .cloned()
        .ok_or_else(|| {
            AppError::Validation(
                "Selected baseline match is not available for this session.".to_string(),
            )
        })?;

    let asset_path = PathBuf::from(&matched.asset_path);
    if !asset_path.is_file() {
        return Err(AppError::NotFound("Baseline asset file not found.".to_string()));
    }

    let blob = std::fs::read(&asset_path)?;
    let mime = media::guess_mime_for_path(&asset_path).unwrap_or_else(|| "image/png".to_string());
    let data_url =
        format!("data:{mime};base64,{}", base64::engine::general_purpose::STANDARD.encode(&blob));
    let resolved = std::fs::canonicalize(&asset_path).unwrap_or(asset_path);

    let version = state.next_image_version();
    let image = ImageVersion {
        image_id: format!("baseline-{}", Uuid::new_v4()),
        image_url_or_base64: data_url,
        version,
        prompt: format!("Adopted baseline asset: {}", matched.filename),
        local_image_path: Some(resolved.to_string_lossy().into_owned()),
    };
    state.baseline_asset = Some(matched);
    state.images.push(image.clone());
    state.invalidate_downstream_artifacts();
    if state.step < 4 {
        state.step = 4;
    }

    app.store.save(&state)?;
    Ok(Json(ImageResponse {
        image_id: image.image_id,
        image_url_or_base64: image.image_url_or_base64,
        version: image.version,
    }))
}

pub async fn skip_baseline(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<BaselineSkipRequest>,
) -> Result<Json<BaselineSkipResponse>, AppError> {
    app.limiter.check("baseline-skip", &addr.ip().to_string())?;
    let mut state = app.store.get_or_create(&payload.session_id)?;
    state.baseline_asset = None;
    if state.step < 4 {
        state.step = 4;
    }
    app.store.save(&state)?;
    Ok(Json(BaselineSkipResponse {
        message: "Proceeding without baseline selection.".to_string(),
        step: state.step,
    }))
}

pub async fn approve_version(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<VersionApproveRequest>,
) -> Result<Json<VersionApproveResponse>, AppError> {
    app.limiter.check("version-approve", &addr.ip().to_string())?;
    let mut state = app.store.get_or_create(&payload.session_id)?;

    let position = state
        .images
        .iter()
        .position(|img| img.version == payload.version)
        .ok_or_else(|| AppError::NotFound(format!("Version v{} not found.", payload.version)))?;

    // Repair the local path when an old state row predates materialization.
    if state.images[position].local_image_path.is_none() {
        let (data_url, local_path) = media::materialize_session_image(
            app.foundry.http_client(),
            &app.session_images_dir,
            &payload.session_id,
            state.images[position].version,
            &state.images[position].image_url_or_base64.clone(),
            None,
        )
        .await?;
        state.images[position].image_url_or_base64 = data_url;
        state.images[position].local_image_path = Some(local_path);
    }

    let approved_version = state.images[position].version;
    state.approved_image_local_path = state.images[position].local_image_path.clone();
    state.approved_image_version = Some(approved_version);
    state.cad_code = None;
    state.cad_code_path = None;
    state.cad_step_file = None;
    state.cad_last_error = None;

    app.store.save(&state)?;
    Ok(Json(VersionApproveResponse {
        message: format!("Version v{approved_version} approved for STEP CAD generation."),
        approved_version,
    }))
}

/// The CAD generation gate: lock precondition plus dimension validation,
/// then deterministic script templating. No code is executed here.
pub async fn cad_generate(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<CadGenerateRequest>,
) -> Result<Json<CadGenerateResponse>, AppError> {
    app.limiter.check("cad-generate", &addr.ip().to_string())?;
    let mut state = app.store.get_or_create(&payload.session_id)?;

    if !state.locked() {
        return Err(AppError::Precondition(
            "Design is not locked. Confirm the design lock before CAD generation.".to_string(),
        ));
    }

    let generated = cad::generate_cadquery_code(&state.spec)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    state.cad_code = Some(generated.cad_code.clone());
    state.design_summary = Some(generated.summary.clone());
    state.cad_last_error = None;
    app.store.save(&state)?;

    Ok(Json(CadGenerateResponse {
        cad_code: generated.cad_code,
        design_summary: generated.summary,
        step: state.step,
    }))
}

fn cad_failure(
    app: &AppState,
    state: &mut SessionState,
    message: &str,
    cad_code: &str,
    error_detail: &str,
    attempts: Option<u32>,
) -> Result<Json<CadRunResponse>, AppError> {
    state.cad_code = Some(cad_code.to_string());
    state.cad_last_error = Some(error_detail.to_string());
    state.cad_code_path = None;
    state.cad_step_file = None;
    app.store.save(state)?;
    Ok(Json(CadRunResponse {
        message: message.to_string(),
        success: false,
        cad_code: cad_code.to_string(),
        code_file: None,
        step_file: None,
        error_detail: Some(error_detail.to_string()),
        attempts,
    }))
}

/// Validates and executes a script, persisting public artifact paths on
/// success. Returns the failure detail otherwise.
async fn execute_and_persist(
    app: &AppState,
    state: &mut SessionState,
    cad_code: &str,
) -> Result<(String, String), String> {
    cad::validate_cad_script(cad_code).map_err(|e| e.to_string())?;
    let artifacts = cad::run_generated_script(
        cad_code,
        &app.cad_run_dir,
        &media::safe_session_key(&state.session_id),
    )
    .await?;

    let code_file = public_session_file(&app.session_images_dir, &artifacts.script_path)
        .ok_or_else(|| "CAD artifacts were written outside the public directory.".to_string())?;
    let step_file = public_session_file(&app.session_images_dir, &artifacts.step_path)
        .ok_or_else(|| "CAD artifacts were written outside the public directory.".to_string())?;

    state.cad_code = Some(cad_code.to_string());
    state.cad_last_error = None;
    state.cad_code_path = Some(code_file.clone());
    state.cad_step_file = Some(step_file.clone());
    if state.step < 7 {
        state.step = 7;
    }
    Ok((code_file, step_file))
}

pub async fn cad_run_code(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<CadRunCodeRequest>,
) -> Result<Json<CadRunResponse>, AppError> {
    app.limiter.check("cad-run-code", &addr.ip().to_string())?;
    let mut state = app.store.get_or_create(&payload.session_id)?;

    let cad_code = payload.cad_code.trim().to_string();
    if cad_code.is_empty() {
        return cad_failure(&app, &mut state, "No CAD code provided.", "", "CAD code is empty.", None);
    }

    match execute_and_persist(&app, &mut state, &cad_code).await {
        Ok((code_file, step_file)) => {
            app.store.save(&state)?;
            Ok(Json(CadRunResponse {
                message: "CAD code executed successfully and STEP generated.".to_string(),
                success: true,
                cad_code,
                code_file: Some(code_file),
                step_file: Some(step_file),
                error_detail: None,
                attempts: None,
            }))
        }
        Err(detail) => cad_failure(
            &app,
            &mut state,
            "CAD execution failed. Fix code and retry.",
            &cad_code,
            &detail,
            None,
        ),
    }
}

/// Bounded auto-fix loop: execute, and on failure resubmit the script with
/// the captured error to the codegen provider, up to the attempt budget.
pub async fn cad_fix_code(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<CadFixRequest>,
) -> Result<Json<CadRunResponse>, AppError> {
    app.limiter.check("cad-fix-code", &addr.ip().to_string())?;
    let req_api_key = request_api_key(&headers);
    let mut state = app.store.get_or_create(&payload.session_id)?;

    let mut code = payload.cad_code.trim().to_string();
    if code.is_empty() {
        return cad_failure(&app, &mut state, "No CAD code provided.", "", "CAD code is empty.", Some(0));
    }

    let max_attempts = payload.max_attempts.clamp(1, 5);
    let mut last_error = payload
        .error_detail
        .clone()
        .or_else(|| state.cad_last_error.clone())
        .unwrap_or_default();
    let mut attempts_done = 0;

    for _ in 0..max_attempts {
        attempts_done += 1;
        match execute_and_persist(&app, &mut state, &code).await {
            Ok((code_file, step_file)) => {
                app.store.save(&state)?;
                return Ok(Json(CadRunResponse {
                    message: format!(
                        "CAD code fixed and STEP generated in {attempts_done} attempt(s)."
                    ),
                    success: true,
                    cad_code: code,
                    code_file: Some(code_file),
                    step_file: Some(step_file),
                    error_detail: None,
                    attempts: Some(attempts_done),
                }));
            }
            Err(detail) => {
                if !detail.is_empty() {
                    last_error = detail;
                }
            }
        }

        let fix_prompt = format!(
            "Fix this CadQuery Python script so it executes successfully and exports at least one .step file.\n\
             Return only corrected Python code.\n\n\
             Execution error:\n{last_error}\n\n\
             Current code:\n{code}"
        );
        match app
            .foundry
            .cad_codegen(cad::CAD_LLM_SYSTEM_PROMPT, &fix_prompt, None, req_api_key.as_deref())
            .await
        {
            Ok(Some(llm_text)) if !llm_text.trim().is_empty() => {
                code = cad::extract_python_code(&llm_text);
            }
            Ok(_) => break,
            Err(e) => {
                warn!(error = %e, "codegen provider failed during auto-fix");
                break;
            }
        }
    }

    let detail = if last_error.is_empty() {
        "Auto-fix failed without error output.".to_string()
    } else {
        last_error
    };
    cad_failure(
        &app,
        &mut state,
        &format!("Auto-fix did not produce a STEP file after {attempts_done} attempt(s)."),
        &code,
        &detail,
        Some(attempts_done),
    )
}

pub async fn clear_cache(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<CacheClearResponse>, AppError> {
    app.limiter.check("cache-clear", &addr.ip().to_string())?;
    let removed_files = app.cache.clear_all(&[&app.cad_run_dir]);
    Ok(Json(CacheClearResponse { message: "Cache cleared.".to_string(), removed_files }))
}

pub async fn clear_session(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<SessionClearRequest>,
) -> Result<Json<SessionClearResponse>, AppError> {
    app.limiter.check("session-clear", &addr.ip().to_string())?;
    let mut state = app.store.get_or_create(&payload.session_id)?;
    state.reset();
    app.store.save(&state)?;
    Ok(Json(SessionClearResponse { message: "Session state cleared.".to_string() }))
}

pub async fn get_session(
    Path(session_id): Path<String>,
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<SessionResponse>, AppError> {
    app.limiter.check("session", &addr.ip().to_string())?;
    Ok(Json(SessionResponse { state: app.store.as_json(&session_id)? }))
}
