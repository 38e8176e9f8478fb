use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error event framed the way the Realtime protocol expects it: a regular
/// server event with `type: "error"`, never a bare HTTP error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeErrorEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: RealtimeErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub code: Value,
}

impl RealtimeErrorEvent {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, code: Value) -> Self {
        Self {
            kind: "error".to_string(),
            error: RealtimeErrorDetail {
                kind: kind.into(),
                message: message.into(),
                code,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_as_server_event() {
        let event = RealtimeErrorEvent::new(
            "tollgate_error",
            "upgrade required",
            Value::String("invalid_request".into()),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["message"], "upgrade required");
    }
}
