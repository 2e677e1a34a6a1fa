//! Dispatch request and response payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response header carrying the serving model identity (comma-joined in
/// fan-out mode).
pub const MODEL_HEADER: &str = "x-dispatcher-model";
/// Response header set to "true" when any earlier attempt failed.
pub const FAILOVER_HEADER: &str = "x-dispatcher-is-failover";
/// Response header listing `name(model)` identities of failed attempts.
pub const FAILED_MODELS_HEADER: &str = "x-dispatcher-failed-models";

/// Reserved capability label that triggers automatic classification.
pub const DETECT_TYPE: &str = "detect";
/// Reserved capability label of the toxicity scoring backend.
pub const TOXICITY_TYPE: &str = "toxicity";
/// Pseudo endpoint name selecting fan-out across a whole capability.
pub const ALL_ENDPOINTS: &str = "all";

/// Inbound dispatch payload. `function` and `type` are synonyms; `function`
/// wins when both are present (compatibility with older clients). Unknown
/// fields are carried through to the backend untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub try_next_on_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Per-request backend timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl DispatchRequest {
    /// Effective capability label, if the caller supplied one.
    pub fn capability(&self) -> Option<&str> {
        self.function.as_deref().or(self.type_name.as_deref())
    }
}

/// Result handed back to the transport layer: body bytes, an HTTP-style
/// status, and a header set describing how the request was served.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}
