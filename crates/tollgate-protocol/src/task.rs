use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Legacy task error JSON shared by the Midjourney-proxy and task dialects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: i32,
}

impl TaskError {
    pub fn upstream(description: impl Into<String>, code: i32) -> Self {
        Self {
            description: description.into(),
            kind: "upstream_error".to_string(),
            code,
        }
    }
}

/// Vendor task submission envelope (Suno / video / Midjourney-proxy). The
/// relay never interprets the payload beyond the model/action hints it needs
/// for channel selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
