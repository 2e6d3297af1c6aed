use std::env;

/// Process-wide configuration, built once at startup and passed by
/// reference into every component. No ambient globals.
#[derive(Debug, Clone)]
pub struct Settings {
    pub foundry_api_key: String,
    pub chat_url: String,
    pub image_generate_url: String,
    pub image_edit_url: String,
    pub cad_codegen_url: String,
    pub model_name: String,
    pub cors_origins: Vec<String>,
    pub db_path: String,
    pub assets_dir: String,
    pub auto_index_assets: bool,
    pub cache_dir: String,
    pub session_images_dir: String,
    pub log_level: String,
    pub port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Settings {
    pub fn load() -> Self {
        let origins_raw = env_or("CORS_ORIGINS", "*");
        let origins: Vec<String> = origins_raw
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        Self {
            foundry_api_key: env_or("FOUNDRY_API_KEY", ""),
            chat_url: env_or(
                "FOUNDRY_CHAT_URL",
                "https://llmfoundry.straive.com/openai/v1/chat/completions",
            ),
            image_generate_url: env_or(
                "FOUNDRY_IMAGE_GENERATE_URL",
                "https://llmfoundry.straive.com/openai/v1/images/generations",
            ),
            image_edit_url: env_or(
                "FOUNDRY_IMAGE_EDIT_URL",
                "https://llmfoundry.straive.com/openai/v1/images/edits",
            ),
            cad_codegen_url: env_or(
                "CAD_CODEGEN_URL",
                "https://llmfoundry.straivedemo.com/vertexai/google/models/gemini-2.5-pro:generateContent",
            ),
            model_name: env_or("FOUNDRY_MODEL", "gpt-5.2"),
            cors_origins: if origins.is_empty() {
                vec!["*".to_string()]
            } else {
                origins
            },
            db_path: env_or("APP_DB_PATH", "app.db"),
            assets_dir: env_or("ASSETS_DIR", "assets"),
            auto_index_assets: env_or("AUTO_INDEX_ASSETS", "false").to_lowercase() == "true",
            cache_dir: env_or("CACHE_DIR", "tmp_runtime/cache"),
            session_images_dir: env_or("SESSION_IMAGES_DIR", "tmp_runtime/session_images"),
            log_level: env_or("LOG_LEVEL", "info"),
            port: env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080),
        }
    }
}
