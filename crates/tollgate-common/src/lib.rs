pub mod mask;

use serde::{Deserialize, Serialize};

pub use mask::{mask_email, mask_sensitive_info};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidField(&'static str, String),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults. Immutable after startup except where a
/// background refresh swaps the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// One initial attempt plus this many retries per relayed request.
    pub retry_times: u32,
    /// Whether recordable relay errors are persisted to the error-log sink.
    pub error_log_enabled: bool,
    /// Redirect target for unknown routes; JSON 404 when unset.
    pub frontend_base_url: Option<String>,
    /// Secret used by the external session surface; read here so the process
    /// fails fast when it is absent.
    pub session_secret: String,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    /// Prompt words that abort a request before token counting.
    pub sensitive_words: Vec<String>,
    /// Seconds between ability-cache refreshes.
    pub cache_refresh_secs: u64,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub retry_times: Option<u32>,
    pub error_log_enabled: Option<bool>,
    pub frontend_base_url: Option<String>,
    pub session_secret: Option<String>,
    pub proxy: Option<String>,
    pub sensitive_words: Option<Vec<String>>,
    pub cache_refresh_secs: Option<u64>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.retry_times.is_some() {
            self.retry_times = other.retry_times;
        }
        if other.error_log_enabled.is_some() {
            self.error_log_enabled = other.error_log_enabled;
        }
        if other.frontend_base_url.is_some() {
            self.frontend_base_url = other.frontend_base_url;
        }
        if other.session_secret.is_some() {
            self.session_secret = other.session_secret;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.sensitive_words.is_some() {
            self.sensitive_words = other.sensitive_words;
        }
        if other.cache_refresh_secs.is_some() {
            self.cache_refresh_secs = other.cache_refresh_secs;
        }
    }

    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").ok().filter(|v| !v.is_empty()),
            port: std::env::var("PORT").ok().and_then(|v| v.parse().ok()),
            dsn: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            retry_times: std::env::var("RETRY_TIMES")
                .ok()
                .and_then(|v| v.parse().ok()),
            error_log_enabled: std::env::var("ERROR_LOG_ENABLED")
                .ok()
                .and_then(|v| parse_bool(&v)),
            frontend_base_url: std::env::var("FRONTEND_BASE_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| v.trim_end_matches('/').to_string()),
            session_secret: std::env::var("SESSION_SECRET")
                .ok()
                .filter(|v| !v.is_empty()),
            proxy: std::env::var("OUTBOUND_PROXY").ok().filter(|v| !v.is_empty()),
            sensitive_words: std::env::var("SENSITIVE_WORDS").ok().map(|v| {
                v.split(',')
                    .map(|w| w.trim().to_string())
                    .filter(|w| !w.is_empty())
                    .collect()
            }),
            cache_refresh_secs: std::env::var("CACHE_REFRESH_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            retry_times: self.retry_times.unwrap_or(3),
            error_log_enabled: self.error_log_enabled.unwrap_or(true),
            frontend_base_url: self.frontend_base_url,
            session_secret: self
                .session_secret
                .ok_or(GlobalConfigError::MissingField("session_secret"))?,
            proxy: self.proxy,
            sensitive_words: self.sensitive_words.unwrap_or_default(),
            cache_refresh_secs: self.cache_refresh_secs.unwrap_or(60),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            retry_times: Some(value.retry_times),
            error_log_enabled: Some(value.error_log_enabled),
            frontend_base_url: value.frontend_base_url,
            session_secret: Some(value.session_secret),
            proxy: value.proxy,
            sensitive_words: Some(value.sensitive_words),
            cache_refresh_secs: Some(value.cache_refresh_secs),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Suffix every client-visible error message with the request id so support
/// can correlate reports against the logs.
pub fn message_with_request_id(message: &str, request_id: &str) -> String {
    format!("{message} (request id: {request_id})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GlobalConfigPatch {
            port: Some(3000),
            retry_times: Some(3),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(8080),
            ..Default::default()
        });
        assert_eq!(base.port, Some(8080));
        assert_eq!(base.retry_times, Some(3));
    }

    #[test]
    fn into_config_requires_dsn() {
        let patch = GlobalConfigPatch {
            session_secret: Some("s".into()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::MissingField("dsn"))
        ));
    }

    #[test]
    fn request_id_suffix() {
        assert_eq!(
            message_with_request_id("boom", "req-1"),
            "boom (request id: req-1)"
        );
    }
}
