use std::path::Path;
use std::time::Duration;

use base64::Engine;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Settings;
use crate::media;
use crate::models::HistoryEntry;

const CHAT_TIMEOUT: Duration = Duration::from_secs(45);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(60);
const EDIT_TIMEOUT: Duration = Duration::from_secs(90);
const CODEGEN_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum FoundryError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image_id: String,
    pub image_url_or_base64: String,
}

/// Client for the LLM Foundry gateway: chat polish, image generation/edit,
/// vision metadata extraction and CAD code generation. Unconfigured (no API
/// key) calls return deterministic fallbacks instead of erroring.
pub struct FoundryClient {
    client: Client,
    settings: Settings,
}

impl FoundryClient {
    pub fn new(settings: Settings) -> Self {
        Self { client: Client::new(), settings }
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    fn api_key(&self, api_key_override: Option<&str>) -> Option<String> {
        let key = api_key_override
            .map(str::to_string)
            .filter(|k| !k.is_empty())
            .or_else(|| {
                (!self.settings.foundry_api_key.is_empty())
                    .then(|| self.settings.foundry_api_key.clone())
            });
        key
    }

    /// Tone polish for deterministic workflow strings. Returns None when no
    /// API key is configured; never makes workflow decisions.
    pub async fn chat(
        &self,
        system_prompt: &str,
        history: &[HistoryEntry],
        user_message: &str,
        api_key_override: Option<&str>,
    ) -> Result<Option<String>, FoundryError> {
        let Some(key) = self.api_key(api_key_override) else { return Ok(None) };

        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        for entry in history {
            messages.push(json!({"role": entry.role, "content": entry.content}));
        }
        messages.push(json!({"role": "user", "content": user_message}));

        let payload = json!({
            "model": self.settings.model_name,
            "messages": messages,
            "temperature": 0.2,
        });
        let resp = self
            .client
            .post(&self.settings.chat_url)
            .bearer_auth(&key)
            .json(&payload)
            .timeout(CHAT_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FoundryError::Http(format!("status={status} body={body}")));
        }
        let data: ChatCompletion =
            resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))?;
        Ok(extract_openai_text(&data))
    }

    /// Text-to-image generation. Falls back to a placeholder SVG when
    /// unconfigured; URL payloads are materialized to base64.
    pub async fn image_generate(
        &self,
        prompt: &str,
        api_key_override: Option<&str>,
    ) -> Result<GeneratedImage, FoundryError> {
        let Some(key) = self.api_key(api_key_override) else {
            return Ok(self.fallback_image(prompt));
        };

        let payload = json!({
            "model": "gpt-image-1",
            "prompt": prompt,
            "size": "1024x1024",
            "response_format": "b64_json",
        });
        let data = self.post_image_generate(&payload, &key).await?;
        let item = data.data.into_iter().next().unwrap_or_default();
        let mut img = item.b64_json.or(item.url).unwrap_or_default();
        if img.starts_with("http") {
            img = self.url_to_b64(&img, &key).await?;
        }
        Ok(GeneratedImage {
            image_id: item.id.unwrap_or_else(|| "generated-image".to_string()),
            image_url_or_base64: img,
        })
    }

    async fn post_image_generate(
        &self,
        payload: &Value,
        key: &str,
    ) -> Result<ImagesResponse, FoundryError> {
        let mut resp = self
            .client
            .post(&self.settings.image_generate_url)
            .bearer_auth(key)
            .json(payload)
            .timeout(IMAGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?;

        // Some gateways reject response_format in the images API; retry once
        // without it.
        if resp.status().is_client_error() || resp.status().is_server_error() {
            if let Some(obj) = payload.as_object() {
                if obj.contains_key("response_format") {
                    warn!(status = %resp.status(), "image generate retrying without response_format");
                    let mut fallback: Map<String, Value> = obj.clone();
                    fallback.remove("response_format");
                    resp = self
                        .client
                        .post(&self.settings.image_generate_url)
                        .bearer_auth(key)
                        .json(&Value::Object(fallback))
                        .timeout(IMAGE_TIMEOUT)
                        .send()
                        .await
                        .map_err(|e| FoundryError::Http(e.to_string()))?;
                }
            }
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FoundryError::Http(format!("status={status} body={body}")));
        }
        resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))
    }

    /// Instruction-based edit of an existing visual. Accepts a file path,
    /// data URI, URL, or bare base64 as the source reference. Tries
    /// multipart first, then a JSON body, against the configured endpoint
    /// and its non-openai twin.
    pub async fn image_edit(
        &self,
        image_ref: &str,
        instruction_prompt: &str,
        api_key_override: Option<&str>,
    ) -> Result<GeneratedImage, FoundryError> {
        let Some(key) = self.api_key(api_key_override) else {
            return Ok(self.fallback_image(&format!("{image_ref}: {instruction_prompt}")));
        };

        let (image_bytes, mime_type) =
            media::resolve_image_bytes(&self.client, image_ref, Some(&key))
                .await
                .map_err(|e| FoundryError::Other(e.to_string()))?;
        let filename = format!("edit_input{}", media::extension_for_mime(&mime_type));

        let data = self
            .post_image_edit_with_fallbacks(
                instruction_prompt,
                image_ref,
                &image_bytes,
                &mime_type,
                &filename,
                &key,
            )
            .await?;
        let item = data.data.into_iter().next().unwrap_or_default();
        let mut img = item.b64_json.or(item.url).unwrap_or_default();
        if img.starts_with("http") {
            img = self.url_to_b64(&img, &key).await?;
        }
        Ok(GeneratedImage {
            image_id: item.id.unwrap_or_else(|| "edited-image".to_string()),
            image_url_or_base64: img,
        })
    }

    async fn post_image_edit_multipart(
        &self,
        url: &str,
        fields: &[(&str, &str)],
        image_bytes: &[u8],
        mime_type: &str,
        filename: &str,
        key: &str,
    ) -> Result<ImagesResponse, FoundryError> {
        let part = reqwest::multipart::Part::bytes(image_bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| FoundryError::Other(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().part("image", part);
        for (name, value) in fields {
            form = form.text(name.to_string(), value.to_string());
        }
        let resp = self
            .client
            .post(url)
            .bearer_auth(key)
            .multipart(form)
            .timeout(EDIT_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FoundryError::Http(format!("status={status} body={body}")));
        }
        resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))
    }

    async fn post_image_edit_json(
        &self,
        url: &str,
        payload: &Value,
        key: &str,
    ) -> Result<ImagesResponse, FoundryError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(key)
            .json(payload)
            .timeout(EDIT_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FoundryError::Http(format!("status={status} body={body}")));
        }
        resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))
    }

    async fn post_image_edit_with_fallbacks(
        &self,
        instruction_prompt: &str,
        image_ref: &str,
        image_bytes: &[u8],
        mime_type: &str,
        filename: &str,
        key: &str,
    ) -> Result<ImagesResponse, FoundryError> {
        let mut urls = vec![self.settings.image_edit_url.clone()];
        if self.settings.image_edit_url.contains("/openai/") {
            urls.push(self.settings.image_edit_url.replace("/openai/", "/"));
        }

        let mut errors: Vec<String> = Vec::new();

        for url in &urls {
            match self
                .post_image_edit_multipart(
                    url,
                    &[("model", "gpt-image-1"), ("prompt", instruction_prompt)],
                    image_bytes,
                    mime_type,
                    filename,
                    key,
                )
                .await
            {
                Ok(data) => return Ok(data),
                Err(e) => errors.push(format!("multipart-basic@{url}: {e}")),
            }
        }

        for url in &urls {
            match self
                .post_image_edit_multipart(
                    url,
                    &[
                        ("model", "gpt-image-1"),
                        ("prompt", instruction_prompt),
                        ("response_format", "b64_json"),
                    ],
                    image_bytes,
                    mime_type,
                    filename,
                    key,
                )
                .await
            {
                Ok(data) => return Ok(data),
                Err(e) => errors.push(format!("multipart-b64@{url}: {e}")),
            }
        }

        // Some gateways only accept JSON image input on this path.
        let data_url_ref = if image_ref.starts_with("data:image") {
            image_ref.to_string()
        } else {
            format!(
                "data:{mime_type};base64,{}",
                base64::engine::general_purpose::STANDARD.encode(image_bytes)
            )
        };
        for url in &urls {
            let payload = json!({
                "model": "gpt-image-1",
                "image": data_url_ref,
                "prompt": instruction_prompt,
            });
            match self.post_image_edit_json(url, &payload, key).await {
                Ok(data) => return Ok(data),
                Err(e) => errors.push(format!("json@{url}: {e}")),
            }
        }

        Err(FoundryError::Other(format!(
            "All edit strategies failed: {}",
            errors.iter().take(3).cloned().collect::<Vec<_>>().join(" | ")
        )))
    }

    async fn url_to_b64(&self, url: &str, key: &str) -> Result<String, FoundryError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(key)
            .timeout(CHAT_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| FoundryError::Http(e.to_string()))?;
        let blob = resp.bytes().await.map_err(|e| FoundryError::Http(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(&blob))
    }

    /// Vision metadata for one catalog asset. Any provider failure falls
    /// back to the filename-token heuristic so indexing always completes.
    pub async fn describe_packaging_asset(
        &self,
        image_path: &Path,
        api_key_override: Option<&str>,
    ) -> Value {
        let Some(key) = self.api_key(api_key_override) else {
            return fallback_asset_metadata(image_path);
        };
        match self.describe_packaging_asset_inner(image_path, &key).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %image_path.display(), error = %e, "asset description failed, using filename heuristic");
                fallback_asset_metadata(image_path)
            }
        }
    }

    async fn describe_packaging_asset_inner(
        &self,
        image_path: &Path,
        key: &str,
    ) -> Result<Value, FoundryError> {
        let blob = std::fs::read(image_path).map_err(|e| FoundryError::Other(e.to_string()))?;
        let mime = media::guess_mime_for_path(image_path).unwrap_or_else(|| "image/png".to_string());
        let data_url =
            format!("data:{mime};base64,{}", base64::engine::general_purpose::STANDARD.encode(&blob));

        let system_prompt = "You are a packaging image metadata extractor. \
            Return strict JSON only with exactly these keys and no extras: \
            product_type, material, closure_type, design_style, size_or_volume. \
            If a value is unknown, return null.";
        let payload = json!({
            "model": self.settings.model_name,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": [
                    {"type": "text", "text": "Extract only the required fields for baseline matching."},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ]},
            ],
            "temperature": 0,
            "response_format": {"type": "json_object"},
        });
        let resp = self
            .client
            .post(&self.settings.chat_url)
            .bearer_auth(key)
            .json(&payload)
            .timeout(CODEGEN_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FoundryError::Http(format!("status={status} body={body}")));
        }
        let data: ChatCompletion =
            resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))?;
        let content = extract_openai_text(&data).unwrap_or_else(|| "{}".to_string());
        let parsed = parse_json_object(&content);
        Ok(normalize_asset_metadata(&parsed, image_path))
    }

    /// CAD code generation via the Gemini generateContent endpoint,
    /// optionally with the approved design image inlined. None when
    /// unconfigured.
    pub async fn cad_codegen(
        &self,
        system_prompt: &str,
        user_message: &str,
        image: Option<(&[u8], &str)>,
        api_key_override: Option<&str>,
    ) -> Result<Option<String>, FoundryError> {
        let Some(key) = self.api_key(api_key_override) else { return Ok(None) };

        let merged_prompt = format!("{}\n\n{}", system_prompt.trim(), user_message.trim());
        let mut parts = vec![json!({"text": merged_prompt})];
        if let Some((bytes, mime)) = image {
            parts.push(json!({
                "inline_data": {
                    "mime_type": mime,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }
            }));
        }
        let payload = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {"temperature": 0.2, "maxOutputTokens": 4096},
        });
        info!("requesting CAD codegen from provider");
        let resp = self
            .client
            .post(&self.settings.cad_codegen_url)
            .bearer_auth(&key)
            .json(&payload)
            .timeout(CODEGEN_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(format!("codegen provider network error: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(500).collect();
            return Err(FoundryError::Http(format!(
                "HTTP {status} from codegen provider: {truncated}"
            )));
        }
        let data: VertexResponse =
            resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))?;
        Ok(extract_vertex_text(&data))
    }

    /// Strict-JSON extraction of spec fields from a marketing brief.
    /// Empty object when unconfigured.
    pub async fn extract_design_spec_from_brief(
        &self,
        brief_text: &str,
        api_key_override: Option<&str>,
    ) -> Result<Value, FoundryError> {
        let Some(key) = self.api_key(api_key_override) else { return Ok(json!({})) };

        let trimmed: String = brief_text.chars().take(24_000).collect();
        let system_prompt = "Extract packaging design requirements from a marketing brief. \
            Return strict JSON only with keys: \
            product_type, size_or_volume, intended_material, closure_type, design_style, dimensions. \
            Use null for unknowns. dimensions must be an object of numeric mm values if present.";
        let payload = json!({
            "model": self.settings.model_name,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": trimmed},
            ],
            "temperature": 0,
            "response_format": {"type": "json_object"},
        });
        let resp = self
            .client
            .post(&self.settings.chat_url)
            .bearer_auth(&key)
            .json(&payload)
            .timeout(IMAGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| FoundryError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FoundryError::Http(format!("status={status} body={body}")));
        }
        let data: ChatCompletion =
            resp.json().await.map_err(|e| FoundryError::Other(format!("parse error: {e}")))?;
        let content = extract_openai_text(&data).unwrap_or_else(|| "{}".to_string());
        Ok(parse_json_object(&content))
    }

    fn fallback_image(&self, label: &str) -> GeneratedImage {
        let label_trimmed: String = label.chars().take(60).collect();
        let svg = format!(
            "<svg xmlns='http://www.w3.org/2000/svg' width='1024' height='1024'>\n\
             <rect width='100%' height='100%' fill='white'/>\n\
             <rect x='120' y='100' width='784' height='824' rx='24' fill='#f7f7f7' stroke='#F57C00' stroke-width='8'/>\n\
             <text x='512' y='460' text-anchor='middle' fill='#444' font-size='40' font-family='Arial'>Preview Placeholder</text>\n\
             <text x='512' y='520' text-anchor='middle' fill='#666' font-size='26' font-family='Arial'>{label_trimmed}</text>\n\
             </svg>"
        );
        let b64 = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());
        GeneratedImage {
            image_id: "fallback-image".to_string(),
            image_url_or_base64: format!("data:image/svg+xml;base64,{b64}"),
        }
    }
}

// --- Response parsing helpers ---

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageDatum {
    id: Option<String>,
    b64_json: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VertexResponse {
    #[serde(default)]
    candidates: Vec<VertexCandidate>,
}

#[derive(Debug, Deserialize)]
struct VertexCandidate {
    #[serde(default)]
    content: VertexContent,
}

#[derive(Debug, Default, Deserialize)]
struct VertexContent {
    #[serde(default)]
    parts: Vec<VertexPart>,
}

#[derive(Debug, Deserialize)]
struct VertexPart {
    text: Option<String>,
}

fn extract_openai_text(data: &ChatCompletion) -> Option<String> {
    let content = data.choices.first()?.message.content.as_ref()?;
    match content {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Array(parts) => {
            let chunks: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            let text = chunks.join("\n").trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn extract_vertex_text(data: &VertexResponse) -> Option<String> {
    let candidate = data.candidates.first()?;
    let chunks: Vec<&str> =
        candidate.content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    let text = chunks.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Lenient JSON-object parsing for model output: strips code fences, then
/// falls back to the first `{...}` blob in free-form text. An embedded
/// `metadata` object wins over the envelope.
pub fn parse_json_object(content: &str) -> Value {
    let mut stripped = content.trim().to_string();
    if stripped.starts_with("```") {
        stripped = Regex::new(r"^```(?:json)?")
            .expect("static pattern")
            .replace(&stripped, "")
            .trim()
            .to_string();
        stripped =
            Regex::new(r"```$").expect("static pattern").replace(&stripped, "").trim().to_string();
    }
    if let Some(obj) = try_parse_object(&stripped) {
        return obj;
    }
    if let Some(m) = Regex::new(r"\{[\s\S]*\}").expect("static pattern").find(&stripped) {
        if let Some(obj) = try_parse_object(m.as_str()) {
            return obj;
        }
    }
    json!({})
}

fn try_parse_object(raw: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    if !parsed.is_object() {
        return None;
    }
    if let Some(metadata) = parsed.get("metadata") {
        if metadata.is_object() {
            return Some(metadata.clone());
        }
    }
    Some(parsed)
}

fn clean_scalar(value: Option<&Value>) -> Value {
    let Some(value) = value else { return Value::Null };
    let txt = match value {
        Value::Null => return Value::Null,
        Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string().trim().to_lowercase(),
    };
    if txt.is_empty() || matches!(txt.as_str(), "none" | "null" | "n/a" | "na" | "unknown") {
        return Value::Null;
    }
    Value::String(txt)
}

/// Canonical five-field metadata record; falls back to the filename-token
/// heuristic when the provider produced nothing usable.
pub fn normalize_asset_metadata(data: &Value, image_path: &Path) -> Value {
    let normalized = json!({
        "product_type": clean_scalar(data.get("product_type")),
        "material": clean_scalar(data.get("material")),
        "closure_type": clean_scalar(data.get("closure_type")),
        "design_style": clean_scalar(data.get("design_style")),
        "size_or_volume": clean_scalar(data.get("size_or_volume")),
    });
    let has_value = normalized
        .as_object()
        .is_some_and(|map| map.values().any(|v| !v.is_null()));
    if has_value {
        normalized
    } else {
        fallback_asset_metadata(image_path)
    }
}

/// Filename-token heuristic used when the vision provider is unavailable.
pub fn fallback_asset_metadata(image_path: &Path) -> Value {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .replace(['-', '_'], " ");

    let material = ["glass", "pp", "pet", "hdpe", "aluminum", "paper"]
        .into_iter()
        .find(|m| stem.contains(m));
    let product_type =
        ["jar", "bottle", "container", "cap"].into_iter().find(|p| stem.contains(p));

    let closure = if stem.contains("flip") {
        Some("flip top")
    } else if stem.contains("screw") || stem.contains("thread") {
        Some("screw")
    } else if stem.contains("pump") {
        Some("pump")
    } else if stem.contains("snap") {
        Some("snap")
    } else {
        None
    };

    let style = ["matte", "glossy", "minimal", "luxury", "premium", "clinical", "playful"]
        .into_iter()
        .find(|s| stem.contains(s));

    let size_or_volume = Regex::new(r"(\d+(?:\.\d+)?)\s*(ml|l|cc|oz|mm|cm)\b")
        .expect("static pattern")
        .captures(&stem)
        .map(|c| format!("{} {}", &c[1], &c[2]));

    json!({
        "product_type": product_type,
        "material": material,
        "closure_type": closure,
        "design_style": style,
        "size_or_volume": size_or_volume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn filename_heuristic_extracts_tokens() {
        let meta = fallback_asset_metadata(&PathBuf::from("/assets/glass_jar_screw_matte_50ml.png"));
        assert_eq!(meta["product_type"], "jar");
        assert_eq!(meta["material"], "glass");
        assert_eq!(meta["closure_type"], "screw");
        assert_eq!(meta["design_style"], "matte");
        assert_eq!(meta["size_or_volume"], "50 ml");
    }

    #[test]
    fn filename_heuristic_handles_bare_names() {
        let meta = fallback_asset_metadata(&PathBuf::from("/assets/IMG_0001.png"));
        assert_eq!(meta["product_type"], Value::Null);
        assert_eq!(meta["material"], Value::Null);
    }

    #[test]
    fn normalization_lowercases_and_drops_placeholders() {
        let raw = serde_json::json!({
            "product_type": "Jar",
            "material": "N/A",
            "closure_type": "",
            "design_style": null,
            "size_or_volume": "50 ML",
        });
        let meta = normalize_asset_metadata(&raw, &PathBuf::from("/assets/x.png"));
        assert_eq!(meta["product_type"], "jar");
        assert_eq!(meta["material"], Value::Null);
        assert_eq!(meta["closure_type"], Value::Null);
        assert_eq!(meta["size_or_volume"], "50 ml");
    }

    #[test]
    fn normalization_falls_back_to_filename_when_empty() {
        let raw = serde_json::json!({"product_type": "unknown"});
        let meta = normalize_asset_metadata(&raw, &PathBuf::from("/assets/pp_bottle_pump.png"));
        assert_eq!(meta["product_type"], "bottle");
        assert_eq!(meta["material"], "pp");
        assert_eq!(meta["closure_type"], "pump");
    }

    #[test]
    fn lenient_parsing_strips_fences_and_envelopes() {
        let fenced = "```json\n{\"product_type\": \"jar\"}\n```";
        assert_eq!(parse_json_object(fenced)["product_type"], "jar");

        let enveloped = "{\"metadata\": {\"material\": \"glass\"}}";
        assert_eq!(parse_json_object(enveloped)["material"], "glass");

        let chatty = "Sure! Here you go: {\"closure_type\": \"screw\"} hope that helps";
        assert_eq!(parse_json_object(chatty)["closure_type"], "screw");

        assert_eq!(parse_json_object("not json at all"), serde_json::json!({}));
    }
}
