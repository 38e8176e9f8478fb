//! The relay pipeline: validate, count, price, pre-consume, then the retry
//! loop around channel selection and adapter dispatch, with settlement and
//! refund exactly once on the way out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::info;

use tollgate_adapter::count::count_request_tokens;
use tollgate_adapter::{
    adapter_for, convert_request, ChannelError, ErrorKind, ParsedRequest, RelayEnvelope,
    RelayError, RelayInfo, RelayPayload, UsageHandle,
};

use crate::channel_error::{process_channel_error, ErrorLogContext};
use crate::quota::SettleContext;
use crate::select::{apply_selection, select_channel};
use crate::sink::SideTask;
use crate::state::AppState;

pub struct RelayPipeline {
    state: Arc<AppState>,
}

/// Keeps the pre-consumed hold refundable if the request future is dropped
/// mid-flight (client disconnect cancels the task at the next suspension
/// point). Disarmed when the hold is refunded explicitly or handed to a
/// settlement job.
struct HoldGuard {
    sink: crate::sink::SideTaskSink,
    ctx: Option<SettleContext>,
}

impl HoldGuard {
    fn disarm(&mut self) {
        self.ctx = None;
    }
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.sink.post(SideTask::Refund { ctx });
        }
    }
}

impl RelayPipeline {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one request to completion. On any error exit the pre-consumed
    /// hold is refunded exactly once; on success the hold is handed to the
    /// settlement job before the payload is returned.
    pub async fn handle(
        &self,
        info: &mut RelayInfo,
        envelope: &RelayEnvelope,
    ) -> Result<RelayPayload, RelayError> {
        let result = self.run(info, envelope).await;
        if result.is_err() {
            self.state.accountant.refund(info).await;
        }
        result
    }

    async fn run(
        &self,
        info: &mut RelayInfo,
        envelope: &RelayEnvelope,
    ) -> Result<RelayPayload, RelayError> {
        let global = self.state.global.load();

        if let Some(word) = find_sensitive_word(&global.sensitive_words, envelope) {
            info!(request_id = %info.request_id, word = %word, "sensitive words detected");
            // The detection itself is the failure cause.
            return Err(RelayError::from_kind(ErrorKind::SensitiveWordsDetected));
        }

        let meta = envelope.token_count_meta();
        info.prompt_tokens = count_request_tokens(&meta)
            .map_err(|err| RelayError::new(ErrorKind::CountTokenFailed, err))?;

        let price = self.state.prices.load().price_data(
            info,
            info.prompt_tokens,
            envelope_max_tokens(envelope),
        )?;
        self.state
            .accountant
            .pre_consume(info, price.should_pre_consumed_quota)
            .await?;
        let mut guard = HoldGuard {
            sink: self.state.sink.clone(),
            ctx: Some(settle_context(info, &price)),
        };

        let retry_times = global.retry_times;
        let mut tried: Vec<i64> = Vec::new();
        let mut last_err = RelayError::internal("relay attempts exhausted");

        // One initial attempt plus `retry_times` retries.
        for attempt in 0..=retry_times {
            if attempt == 0 {
                if info.channel_id == 0 {
                    // No channel pinned by the routing middleware; fall back
                    // to a fresh draw.
                    match select_channel(
                        &self.state.cache,
                        &info.group,
                        &info.original_model,
                        &tried,
                    ) {
                        Ok(selected) => apply_selection(info, &selected),
                        Err(err) => {
                            last_err = err;
                            break;
                        }
                    }
                }
            } else {
                match select_channel(
                    &self.state.cache,
                    &info.group,
                    &info.original_model,
                    &tried,
                ) {
                    Ok(selected) => apply_selection(info, &selected),
                    Err(err) => {
                        last_err = err;
                        break;
                    }
                }
            }
            tried.push(info.channel_id);

            let attempt_result =
                match AssertUnwindSafe(self.attempt(info, envelope, &price, &mut guard))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::internal("adapter panicked")),
                };

            match attempt_result {
                Ok(payload) => {
                    log_retry_path(info, &tried);
                    return Ok(payload);
                }
                Err(err) => {
                    process_channel_error(
                        &self.state.sink,
                        global.error_log_enabled,
                        channel_error_from(info),
                        &err,
                        ErrorLogContext {
                            user_id: info.user_id,
                            token_id: info.token_id,
                            model_name: info.original_model.clone(),
                            group: info.group.clone(),
                            multi_key_index: info.multi_key_index.map(|index| index as i32),
                            use_channel: tried.clone(),
                        },
                    );
                    let remaining = retry_times as i64 - attempt as i64;
                    let retry = should_retry(&err, remaining, info.specific_channel);
                    last_err = err;
                    if !retry {
                        break;
                    }
                }
            }
        }

        log_retry_path(info, &tried);
        // The explicit refund in `handle` settles the hold; the guard only
        // covers cancellation.
        guard.disarm();
        Err(last_err)
    }

    /// One dispatch: convert, execute, respond, hand off settlement.
    async fn attempt(
        &self,
        info: &mut RelayInfo,
        envelope: &RelayEnvelope,
        price: &tollgate_adapter::PriceData,
        guard: &mut HoldGuard,
    ) -> Result<RelayPayload, RelayError> {
        let adapter = adapter_for(info.channel_type);
        adapter.init(info);
        // Conversion starts from the retained envelope every time, so each
        // attempt sends the same input regardless of earlier attempts.
        let body = convert_request(adapter.as_ref(), info, envelope)?;
        let resp = adapter
            .execute(self.state.client.as_ref(), info, body)
            .await?;
        let adapter_resp = adapter.respond(info, resp)?;

        let ctx = settle_context(info, price);
        // Ownership of the hold moves to the settlement job; neither the
        // pipeline's refund-on-error nor the cancellation guard may see it
        // anymore. No suspension point between here and the spawn.
        info.final_pre_consumed_quota = 0;
        guard.disarm();
        self.spawn_settlement(ctx, adapter_resp.usage);

        Ok(adapter_resp.payload)
    }

    fn spawn_settlement(&self, ctx: SettleContext, usage: UsageHandle) {
        let sink = self.state.sink.clone();
        match usage {
            UsageHandle::Immediate(usage) => {
                tokio::spawn(async move {
                    sink.post_wait(SideTask::Settle { ctx, usage }).await;
                });
            }
            UsageHandle::Deferred(done) => {
                tokio::spawn(async move {
                    match done.await {
                        Ok(outcome) if outcome.completed => {
                            sink.post_wait(SideTask::Settle {
                                ctx,
                                usage: outcome.usage,
                            })
                            .await;
                        }
                        // Aborted stream: no trustworthy token count, so the
                        // hold is returned instead of settled.
                        _ => sink.post_wait(SideTask::Refund { ctx }).await,
                    }
                });
            }
        }
    }
}

/// The retry ladder. Order matters: budget, then the explicit flags, then
/// the status table.
pub fn should_retry(err: &RelayError, remaining: i64, specific_channel: bool) -> bool {
    if remaining <= 0 {
        return false;
    }
    if err.skip_retry {
        return false;
    }
    if specific_channel {
        return false;
    }
    if err.channel_error {
        return true;
    }
    match err.status {
        429 => true,
        307 => true,
        // Gateway timeouts are not worth another channel.
        504 | 524 => false,
        status if (500..600).contains(&status) => true,
        400 | 408 => false,
        status if (200..300).contains(&status) => false,
        _ => true,
    }
}

fn settle_context(info: &RelayInfo, price: &tollgate_adapter::PriceData) -> SettleContext {
    SettleContext {
        request_id: info.request_id.clone(),
        user_id: info.user_id,
        token_id: info.token_id,
        channel_id: info.channel_id,
        model_name: info.original_model.clone(),
        group: info.group.clone(),
        is_stream: info.is_stream,
        pre_consumed: info.final_pre_consumed_quota,
        price: price.clone(),
    }
}

fn channel_error_from(info: &RelayInfo) -> ChannelError {
    ChannelError {
        channel_id: info.channel_id,
        channel_type: info.channel_type as i32,
        channel_name: info.channel_name.clone(),
        is_multi_key: info.is_multi_key,
        used_key: info.api_key.clone(),
        auto_ban: info.channel_id != 0 && info.auto_ban,
    }
}

fn log_retry_path(info: &RelayInfo, tried: &[i64]) {
    if tried.len() > 1 {
        let path = tried
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("->");
        info!(request_id = %info.request_id, use_channel = %path, "retry path");
    }
}

fn find_sensitive_word(words: &[String], envelope: &RelayEnvelope) -> Option<String> {
    if words.is_empty() {
        return None;
    }
    let text = envelope.token_count_meta().combined_text.to_lowercase();
    words
        .iter()
        .find(|word| !word.is_empty() && text.contains(&word.to_lowercase()))
        .cloned()
}

/// Output bound carried by the request, when the dialect has one.
fn envelope_max_tokens(envelope: &RelayEnvelope) -> Option<i64> {
    match &envelope.parsed {
        ParsedRequest::Chat(req) => req
            .extra
            .get("max_tokens")
            .or_else(|| req.extra.get("max_completion_tokens"))
            .and_then(Value::as_i64),
        ParsedRequest::Claude(req) => req.max_tokens,
        ParsedRequest::GeminiGenerate(req) => req
            .extra
            .get("generationConfig")
            .and_then(|config| config.get("maxOutputTokens"))
            .and_then(Value::as_i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_err(status: u16) -> RelayError {
        RelayError::channel_response(status, "boom")
    }

    #[test]
    fn no_budget_means_no_retry() {
        assert!(!should_retry(&channel_err(429), 0, false));
        assert!(should_retry(&channel_err(429), 1, false));
    }

    #[test]
    fn skip_retry_flag_wins() {
        let err = RelayError::channel_response(429, "x").with_skip_retry();
        assert!(!should_retry(&err, 3, false));
    }

    #[test]
    fn pinned_channel_never_retries() {
        assert!(!should_retry(&channel_err(429), 3, true));
    }

    #[test]
    fn channel_error_flag_retries_regardless_of_status() {
        let err = RelayError::channel_response(400, "connection reset").with_channel_error();
        assert!(should_retry(&err, 3, false));
        // Without the flag the status table applies.
        assert!(!should_retry(&channel_err(400), 3, false));
    }

    #[test]
    fn status_table() {
        assert!(should_retry(&channel_err(429), 3, false));
        assert!(should_retry(&channel_err(307), 3, false));
        assert!(should_retry(&channel_err(500), 3, false));
        assert!(should_retry(&channel_err(502), 3, false));
        assert!(!should_retry(&channel_err(504), 3, false));
        assert!(!should_retry(&channel_err(524), 3, false));
        assert!(!should_retry(&channel_err(400), 3, false));
        assert!(!should_retry(&channel_err(408), 3, false));
        assert!(!should_retry(&channel_err(204), 3, false));
        assert!(should_retry(&channel_err(403), 3, false));
    }
}
