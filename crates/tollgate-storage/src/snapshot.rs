//! Plain-row snapshot of the runtime-relevant tables.
//!
//! The relay never reads the database on the hot path; it works from a
//! snapshot loaded at bootstrap and refreshed by a background task.

use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub channel_type: i32,
    pub name: String,
    pub base_url: String,
    pub key: String,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub priority: i64,
    pub weight: i64,
    pub status: i32,
    pub auto_ban: bool,
    pub model_mapping: Map<String, Value>,
    pub param_override: Map<String, Value>,
}

impl ChannelRow {
    pub fn is_enabled(&self) -> bool {
        self.status == crate::entities::channels::STATUS_ENABLED
    }

    /// Credentials of a multi-key channel; single-key channels yield one.
    pub fn keys(&self) -> Vec<String> {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&self.key) {
            let keys: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !keys.is_empty() {
                return keys;
            }
        }
        vec![self.key.clone()]
    }

    pub fn is_multi_key(&self) -> bool {
        self.keys().len() > 1
    }

    /// Requested model name → upstream model name, when an alias is mapped.
    pub fn mapped_model(&self, model: &str) -> Option<String> {
        self.model_mapping
            .get(model)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct AbilityRow {
    pub user_group: String,
    pub model: String,
    pub channel_id: i64,
    pub priority: i64,
    pub weight: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub user_group: String,
    pub quota: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub key_hash: String,
    pub name: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub channels: Vec<ChannelRow>,
    pub abilities: Vec<AbilityRow>,
    pub users: Vec<UserRow>,
    pub tokens: Vec<TokenRow>,
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub(crate) fn json_object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str) -> ChannelRow {
        ChannelRow {
            id: 1,
            channel_type: 1,
            name: "c".into(),
            base_url: "https://u".into(),
            key: key.into(),
            models: vec![],
            groups: vec![],
            priority: 0,
            weight: 1,
            status: 1,
            auto_ban: true,
            model_mapping: Map::new(),
            param_override: Map::new(),
        }
    }

    #[test]
    fn single_key_channels_yield_one_credential() {
        let channel = row("sk-only");
        assert_eq!(channel.keys(), vec!["sk-only".to_string()]);
        assert!(!channel.is_multi_key());
    }

    #[test]
    fn json_array_key_is_a_multi_key_bag() {
        let channel = row(r#"["sk-a","sk-b"]"#);
        assert_eq!(channel.keys(), vec!["sk-a".to_string(), "sk-b".to_string()]);
        assert!(channel.is_multi_key());
    }

    #[test]
    fn model_mapping_resolves_alias() {
        let mut channel = row("k");
        channel.model_mapping.insert(
            "gpt-x".into(),
            Value::String("gpt-x-2024".into()),
        );
        assert_eq!(channel.mapped_model("gpt-x").as_deref(), Some("gpt-x-2024"));
        assert!(channel.mapped_model("other").is_none());
    }
}
