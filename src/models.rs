use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Structured packaging requirement accumulated over the conversation.
/// Every field is optional; absence drives the missing-field question set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DesignSpec {
    pub product_type: Option<String>,
    pub size_or_volume: Option<String>,
    pub intended_material: Option<String>,
    pub closure_type: Option<String>,
    pub design_style: Option<String>,
    /// Named measurement -> value in millimeters. New extractions overlay
    /// existing keys, never clear them.
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    pub process_notes: Option<String>,
}

/// One-shot baseline decision sub-state of step 3.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BaselinePhase {
    #[default]
    Pending,
    Decided { message: String },
}

impl BaselinePhase {
    pub fn is_decided(&self) -> bool {
        matches!(self, BaselinePhase::Decided { .. })
    }

    pub fn decision_message(&self) -> Option<&str> {
        match self {
            BaselinePhase::Decided { message } => Some(message),
            BaselinePhase::Pending => None,
        }
    }
}

/// Lock confirmation sub-state of steps 4-6. The question must be asked
/// before a confirmation can be accepted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    #[default]
    NotAsked,
    Asked,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.to_string(), content: content.into() }
    }
}

/// One generated or adopted 2D concept. Immutable once appended except for
/// local path repair on old rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageVersion {
    pub image_id: String,
    pub image_url_or_base64: String,
    pub version: u32,
    pub prompt: String,
    #[serde(default)]
    pub local_image_path: Option<String>,
}

/// Ranked catalog candidate returned by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineMatch {
    pub asset_path: String,
    pub asset_rel_path: String,
    pub filename: String,
    pub product_type: Option<String>,
    pub material: Option<String>,
    pub closure_type: Option<String>,
    pub design_style: Option<String>,
    pub size_or_volume: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<String>,
    pub score: i64,
}

/// Per-session conversation state. Mutated only by the workflow machine and
/// the handlers that call it; persisted after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub step: u8,
    #[serde(default)]
    pub spec: DesignSpec,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub required_questions: Vec<String>,
    #[serde(default)]
    pub baseline: BaselinePhase,
    #[serde(default)]
    pub baseline_matches: Vec<BaselineMatch>,
    #[serde(default)]
    pub baseline_asset: Option<BaselineMatch>,
    #[serde(default)]
    pub images: Vec<ImageVersion>,
    #[serde(default)]
    pub approved_image_version: Option<u32>,
    #[serde(default)]
    pub approved_image_local_path: Option<String>,
    #[serde(default)]
    pub lock: LockPhase,
    #[serde(default)]
    pub cad_code: Option<String>,
    #[serde(default)]
    pub cad_code_path: Option<String>,
    #[serde(default)]
    pub cad_step_file: Option<String>,
    #[serde(default)]
    pub cad_last_error: Option<String>,
    #[serde(default)]
    pub design_summary: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            step: 1,
            spec: DesignSpec::default(),
            missing_fields: Vec::new(),
            required_questions: Vec::new(),
            baseline: BaselinePhase::Pending,
            baseline_matches: Vec::new(),
            baseline_asset: None,
            images: Vec::new(),
            approved_image_version: None,
            approved_image_local_path: None,
            lock: LockPhase::NotAsked,
            cad_code: None,
            cad_code_path: None,
            cad_step_file: None,
            cad_last_error: None,
            design_summary: None,
            history: Vec::new(),
        }
    }

    pub fn locked(&self) -> bool {
        self.lock == LockPhase::Confirmed
    }

    /// Reset to a fresh state while keeping session id continuity.
    pub fn reset(&mut self) {
        *self = SessionState::new(self.session_id.clone());
    }

    /// Next 1-based image version number (strictly increasing, no gaps).
    pub fn next_image_version(&self) -> u32 {
        self.images.len() as u32 + 1
    }

    /// Clear approval and CAD artifacts after the visual reference changed.
    pub fn invalidate_downstream_artifacts(&mut self) {
        self.approved_image_version = None;
        self.approved_image_local_path = None;
        self.cad_code = None;
        self.cad_code_path = None;
        self.cad_step_file = None;
        self.cad_last_error = None;
        self.design_summary = None;
    }
}

// --- API request/response payloads ---

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub user_message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub assistant_message: String,
    pub step: u8,
    pub spec_summary: String,
    pub required_questions: Vec<String>,
    pub can_generate_image: bool,
    pub can_iterate_image: bool,
    pub can_lock: bool,
    pub can_generate_cad: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImageGenerateRequest {
    pub session_id: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageEditRequest {
    pub session_id: String,
    pub image_id: String,
    pub instruction_prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub image_id: String,
    pub image_url_or_base64: String,
    pub version: u32,
}

#[derive(Debug, Deserialize)]
pub struct CadGenerateRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct CadGenerateResponse {
    pub cad_code: String,
    pub design_summary: String,
    pub step: u8,
}

#[derive(Debug, Deserialize)]
pub struct CadRunCodeRequest {
    pub session_id: String,
    pub cad_code: String,
}

fn default_fix_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
pub struct CadFixRequest {
    pub session_id: String,
    pub cad_code: String,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default = "default_fix_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Serialize)]
pub struct CadRunResponse {
    pub message: String,
    pub success: bool,
    pub cad_code: String,
    pub code_file: Option<String>,
    pub step_file: Option<String>,
    pub error_detail: Option<String>,
    pub attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AssetIndexRequest {
    #[serde(default)]
    pub force_reindex: bool,
}

#[derive(Debug, Serialize)]
pub struct AssetIndexResponse {
    pub indexed_count: usize,
    pub total_assets: usize,
}

#[derive(Debug, Serialize)]
pub struct AssetCatalogResponse {
    pub total: usize,
    pub items: Vec<CatalogItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogItem {
    pub asset_rel_path: String,
    pub filename: String,
    pub product_type: Option<String>,
    pub material: Option<String>,
    pub closure_type: Option<String>,
    pub design_style: Option<String>,
    pub size_or_volume: Option<String>,
    pub tags: Option<String>,
    pub summary: Option<String>,
    pub metadata_json: Option<serde_json::Value>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EditRecommendationsResponse {
    pub count: usize,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BaselineAdoptRequest {
    pub session_id: String,
    pub asset_rel_path: String,
}

#[derive(Debug, Deserialize)]
pub struct BaselineSkipRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct BaselineSkipResponse {
    pub message: String,
    pub step: u8,
}

#[derive(Debug, Deserialize)]
pub struct VersionApproveRequest {
    pub session_id: String,
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct VersionApproveResponse {
    pub message: String,
    pub approved_version: u32,
}

#[derive(Debug, Serialize)]
pub struct BriefUploadResponse {
    pub message: String,
    pub step: u8,
    pub spec_summary: String,
    pub required_questions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionClearRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionClearResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub state: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub message: String,
    pub removed_files: usize,
}
