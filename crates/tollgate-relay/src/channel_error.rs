//! Classification and side effects for failed upstream attempts.

use tracing::error;

use tollgate_adapter::{ChannelError, RelayError};
use tollgate_storage::ErrorLogRow;

use crate::sink::{SideTask, SideTaskSink};

/// Request identity copied out for the error-log row.
#[derive(Debug, Clone)]
pub struct ErrorLogContext {
    pub user_id: i64,
    pub token_id: i64,
    pub model_name: String,
    pub group: String,
    pub multi_key_index: Option<i32>,
    pub use_channel: Vec<i64>,
}

/// Invoked after every failed attempt. Logging is synchronous; the disable
/// and the persisted row go through the worker pool because they involve
/// slow writes that must not delay the retry.
pub fn process_channel_error(
    sink: &SideTaskSink,
    error_log_enabled: bool,
    channel_error: ChannelError,
    err: &RelayError,
    ctx: ErrorLogContext,
) {
    error!(
        "relay error (channel #{}, status code: {}): {}",
        channel_error.channel_id, err.status, err.message
    );

    if channel_error.channel_id != 0 {
        sink.post(SideTask::BumpErrorCount {
            channel_id: channel_error.channel_id,
        });
    }

    if err.should_disable_channel() && channel_error.auto_ban {
        sink.post(SideTask::DisableChannel {
            channel_id: channel_error.channel_id,
            channel_name: channel_error.channel_name.clone(),
            reason: err.masked_message(),
        });
    }

    if error_log_enabled && err.is_recordable() {
        sink.post(SideTask::RecordError(ErrorLogRow {
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            channel_id: channel_error.channel_id,
            channel_name: channel_error.channel_name,
            channel_type: channel_error.channel_type,
            model_name: ctx.model_name,
            user_group: ctx.group,
            error_kind: err.kind.code().to_string(),
            status_code: err.status as i32,
            is_multi_key: channel_error.is_multi_key,
            multi_key_index: ctx.multi_key_index,
            use_channel: ctx.use_channel,
            message: err.masked_message(),
        }));
    }
}
