use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use regex::Regex;
use reqwest::Client;

use crate::error::AppError;

const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(45);

/// Sniffs the mime type from magic bytes, falling back to a hint and then
/// to PNG. Providers are inconsistent about content-type headers.
pub fn detect_mime_from_bytes(blob: &[u8], hinted: Option<&str>) -> String {
    if let Ok(format) = image::guess_format(blob) {
        return format.to_mime_type().to_string();
    }
    match hinted {
        Some(h) if h.starts_with("image/") => h.to_string(),
        _ => "image/png".to_string(),
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/svg+xml" => ".svg",
        _ => ".png",
    }
}

pub fn guess_mime_for_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Accepts a file path, data URI, http(s) URL, or bare base64 payload and
/// returns the raw bytes plus a detected mime type.
pub async fn resolve_image_bytes(
    client: &Client,
    value: &str,
    bearer: Option<&str>,
) -> Result<(Vec<u8>, String), AppError> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err(AppError::Validation("Empty image content.".to_string()));
    }

    let path = Path::new(raw);
    if path.is_file() {
        let blob = std::fs::read(path)?;
        let hinted = guess_mime_for_path(path);
        let mime = detect_mime_from_bytes(&blob, hinted.as_deref());
        return Ok((blob, mime));
    }

    if raw.starts_with("data:image") {
        let (header, b64_data) = raw
            .split_once(',')
            .ok_or_else(|| AppError::Validation("Malformed data URI.".to_string()))?;
        let hinted = Regex::new(r"data:(image/[^;]+);base64")
            .expect("static pattern")
            .captures(header)
            .map(|c| c[1].to_string());
        let blob = base64::engine::general_purpose::STANDARD
            .decode(b64_data)
            .map_err(|e| AppError::Validation(format!("Invalid base64 image payload: {e}")))?;
        let mime = detect_mime_from_bytes(&blob, hinted.as_deref());
        return Ok((blob, mime));
    }

    if raw.starts_with("http://") || raw.starts_with("https://") {
        let mut req = client.get(raw).timeout(URL_FETCH_TIMEOUT);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::Provider(format!("image fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| AppError::Provider(format!("image fetch failed: {e}")))?;
        let hinted = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .filter(|v| !v.is_empty());
        let blob = resp
            .bytes()
            .await
            .map_err(|e| AppError::Provider(format!("image fetch failed: {e}")))?
            .to_vec();
        let mime = detect_mime_from_bytes(&blob, hinted.as_deref());
        return Ok((blob, mime));
    }

    // Assume bare base64.
    let blob = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| AppError::Validation(format!("Invalid base64 image payload: {e}")))?;
    let mime = detect_mime_from_bytes(&blob, None);
    Ok((blob, mime))
}

/// Normalizes an edit input: existing file paths, URLs, and data URIs pass
/// through, bare base64 becomes a data URL.
pub fn normalize_image_ref_for_edit(value: &str) -> String {
    let raw = value.trim();
    if raw.is_empty() {
        return raw.to_string();
    }
    if Path::new(raw).is_file()
        || raw.starts_with("http://")
        || raw.starts_with("https://")
        || raw.starts_with("data:image")
    {
        return raw.to_string();
    }
    format!("data:image/png;base64,{raw}")
}

pub fn safe_session_key(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .take(100)
        .collect()
}

/// Writes one session image to the session images directory and returns a
/// (data URL, local path) pair.
pub async fn materialize_session_image(
    client: &Client,
    session_images_dir: &Path,
    session_id: &str,
    version: u32,
    image_value: &str,
    bearer: Option<&str>,
) -> Result<(String, String), AppError> {
    let (blob, mime) = resolve_image_bytes(client, image_value, bearer).await?;
    let ext = extension_for_mime(&mime);
    let sess_dir: PathBuf = session_images_dir.join(safe_session_key(session_id));
    std::fs::create_dir_all(&sess_dir)?;
    let local_path = sess_dir.join(format!("v{version}{ext}"));
    std::fs::write(&local_path, &blob)?;
    let data_url = format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&blob)
    );
    let resolved = std::fs::canonicalize(&local_path).unwrap_or(local_path);
    Ok((data_url, resolved.to_string_lossy().into_owned()))
}
