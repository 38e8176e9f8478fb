use serde_json::Value;

use tollgate_common::mask_sensitive_info;
use tollgate_protocol::claude::ClaudeError;
use tollgate_protocol::openai::OpenAIError;
use tollgate_protocol::realtime::RealtimeErrorEvent;
use tollgate_protocol::task::TaskError;

/// Closed set of failure classes the relay core produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    GetChannelFailed,
    GenRelayInfoFailed,
    SensitiveWordsDetected,
    CountTokenFailed,
    ModelPriceError,
    InsufficientQuota,
    PreConsumeFailed,
    /// Upstream returned a non-success response; carries its status.
    ChannelResponseError,
    StreamDecodeError,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::GetChannelFailed => "get_channel_failed",
            ErrorKind::GenRelayInfoFailed => "gen_relay_info_failed",
            ErrorKind::SensitiveWordsDetected => "sensitive_words_detected",
            ErrorKind::CountTokenFailed => "count_token_failed",
            ErrorKind::ModelPriceError => "model_price_error",
            ErrorKind::InsufficientQuota => "insufficient_quota",
            ErrorKind::PreConsumeFailed => "pre_consume_failed",
            ErrorKind::ChannelResponseError => "channel_response_error",
            ErrorKind::StreamDecodeError => "stream_decode_error",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "invalid_request" => ErrorKind::InvalidRequest,
            "get_channel_failed" => ErrorKind::GetChannelFailed,
            "gen_relay_info_failed" => ErrorKind::GenRelayInfoFailed,
            "sensitive_words_detected" => ErrorKind::SensitiveWordsDetected,
            "count_token_failed" => ErrorKind::CountTokenFailed,
            "model_price_error" => ErrorKind::ModelPriceError,
            "insufficient_quota" => ErrorKind::InsufficientQuota,
            "pre_consume_failed" => ErrorKind::PreConsumeFailed,
            "channel_response_error" => ErrorKind::ChannelResponseError,
            "stream_decode_error" => ErrorKind::StreamDecodeError,
            "internal_error" => ErrorKind::Internal,
            _ => return None,
        })
    }

    fn default_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest | ErrorKind::SensitiveWordsDetected => 400,
            ErrorKind::InsufficientQuota | ErrorKind::PreConsumeFailed => 403,
            ErrorKind::GetChannelFailed => 503,
            ErrorKind::GenRelayInfoFailed
            | ErrorKind::CountTokenFailed
            | ErrorKind::ModelPriceError
            | ErrorKind::ChannelResponseError
            | ErrorKind::StreamDecodeError
            | ErrorKind::Internal => 500,
        }
    }
}

/// Classification record handed to the channel-error handler after a failed
/// attempt. Values are copied out of the request context so asynchronous
/// processing never reads a context that may have been repointed at another
/// channel.
#[derive(Debug, Clone)]
pub struct ChannelError {
    pub channel_id: i64,
    pub channel_type: i32,
    pub channel_name: String,
    pub is_multi_key: bool,
    pub used_key: String,
    pub auto_ban: bool,
}

/// The error value that travels through the relay pipeline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    /// Forbids further channel attempts regardless of remaining budget.
    pub skip_retry: bool,
    /// The fault is attributable to the chosen upstream channel.
    pub channel_error: bool,
}

impl RelayError {
    pub fn new(kind: ErrorKind, cause: impl std::fmt::Display) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: cause.to_string(),
            skip_retry: false,
            channel_error: false,
        }
    }

    /// Failures where the class itself is the cause (e.g. sensitive-word
    /// detection wraps no underlying error).
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.code().replace('_', " "))
    }

    /// A non-success upstream response. Whether it retries is decided by the
    /// status table; `channel_error` is reserved for faults attributable to
    /// the channel itself (set by the transport layer).
    pub fn channel_response(status: u16, message: impl std::fmt::Display) -> Self {
        Self {
            kind: ErrorKind::ChannelResponseError,
            status,
            message: message.to_string(),
            skip_retry: false,
            channel_error: false,
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            status: 501,
            message: format!("unsupported operation: {operation}"),
            skip_retry: true,
            channel_error: false,
        }
    }

    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, cause)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn with_channel_error(mut self) -> Self {
        self.channel_error = true;
        self
    }

    /// Message with URLs, domains, IPs, and email local parts masked; the only
    /// form that may leave the process.
    pub fn masked_message(&self) -> String {
        mask_sensitive_info(&self.message)
    }

    /// Whether the failure class warrants soft-disabling the channel (the
    /// channel's own auto-ban flag still gates the actual disable).
    pub fn should_disable_channel(&self) -> bool {
        if self.kind != ErrorKind::ChannelResponseError {
            return false;
        }
        if self.status == 401 {
            return true;
        }
        let lowered = self.message.to_ascii_lowercase();
        lowered.contains("invalid api key")
            || lowered.contains("incorrect api key")
            || lowered.contains("account_deactivated")
            || lowered.contains("permission_denied")
            || lowered.contains("has been suspended")
            || lowered.contains("organization has been restricted")
            || (lowered.contains("model") && lowered.contains("does not exist"))
    }

    /// Whether the failure is worth a persisted error-log row. Caller-side
    /// rejections stay out of the sink.
    pub fn is_recordable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::InvalidRequest
                | ErrorKind::SensitiveWordsDetected
                | ErrorKind::InsufficientQuota
        )
    }

    pub fn to_openai_error(&self) -> OpenAIError {
        OpenAIError {
            message: self.masked_message(),
            kind: "tollgate_error".to_string(),
            param: String::new(),
            code: Value::String(self.kind.code().to_string()),
        }
    }

    pub fn to_claude_error(&self) -> ClaudeError {
        ClaudeError {
            kind: self.kind.code().to_string(),
            message: self.masked_message(),
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError {
            description: self.masked_message(),
            kind: "upstream_error".to_string(),
            code: self.status as i32,
        }
    }

    pub fn to_realtime_event(&self) -> RealtimeErrorEvent {
        RealtimeErrorEvent::new(
            "tollgate_error",
            self.masked_message(),
            Value::String(self.kind.code().to_string()),
        )
    }

    /// Rebuild a pipeline error from an emitted OpenAI envelope; inverse of
    /// `to_openai_error` up to kind and status.
    pub fn from_openai_error(status: u16, error: &OpenAIError) -> Self {
        let kind = error
            .code
            .as_str()
            .and_then(ErrorKind::from_code)
            .unwrap_or(ErrorKind::ChannelResponseError);
        Self {
            kind,
            status,
            message: error.message.clone(),
            skip_retry: false,
            channel_error: false,
        }
    }
}
