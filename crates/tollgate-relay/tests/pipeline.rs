//! End-to-end pipeline behavior against a scripted upstream and in-memory
//! storage: happy path settlement, retry with fallback, and skip-retry.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Map;

use tollgate_adapter::{
    ErrorKind, ParsedRequest, PriceTable, RelayEnvelope, RelayFormat, RelayInfo, RelayMode,
    TransportError, UpstreamBody, UpstreamClient, UpstreamHttpRequest, UpstreamHttpResponse,
};
use tollgate_common::GlobalConfig;
use tollgate_relay::{AppState, RelayPipeline};
use tollgate_storage::{
    AbilityRow, ChannelRow, ErrorLogRow, Storage, StorageResult, StorageSnapshot, TokenRow,
    UsageLogRow, UserRow,
};

#[derive(Default)]
struct MemStorage {
    quota: Mutex<i64>,
    used: Mutex<i64>,
    usage_logs: Mutex<Vec<UsageLogRow>>,
    error_logs: Mutex<Vec<ErrorLogRow>>,
    error_counts: Mutex<Vec<i64>>,
    disabled: Mutex<Vec<i64>>,
}

#[async_trait]
impl Storage for MemStorage {
    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        Ok(StorageSnapshot::default())
    }

    async fn debit_user_quota(&self, _user_id: i64, amount: i64) -> StorageResult<bool> {
        let mut quota = self.quota.lock().unwrap();
        if *quota < amount {
            return Ok(false);
        }
        *quota -= amount;
        Ok(true)
    }

    async fn credit_user_quota(&self, _user_id: i64, amount: i64) -> StorageResult<()> {
        *self.quota.lock().unwrap() += amount;
        Ok(())
    }

    async fn add_used_quota(&self, _user_id: i64, amount: i64) -> StorageResult<()> {
        *self.used.lock().unwrap() += amount;
        Ok(())
    }

    async fn debit_token_quota(&self, _token_id: i64, _amount: i64) -> StorageResult<()> {
        Ok(())
    }

    async fn set_channel_status(&self, channel_id: i64, _status: i32) -> StorageResult<()> {
        self.disabled.lock().unwrap().push(channel_id);
        Ok(())
    }

    async fn bump_channel_error_count(&self, channel_id: i64) -> StorageResult<()> {
        self.error_counts.lock().unwrap().push(channel_id);
        Ok(())
    }

    async fn append_usage_log(&self, row: UsageLogRow) -> StorageResult<()> {
        self.usage_logs.lock().unwrap().push(row);
        Ok(())
    }

    async fn append_error_log(&self, row: ErrorLogRow) -> StorageResult<()> {
        self.error_logs.lock().unwrap().push(row);
        Ok(())
    }
}

/// Scripted upstream: the response depends on the channel's base URL.
struct ScriptedClient {
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls.lock().unwrap().push(req.url.clone());
            if req.url.contains("flaky.example") {
                return Ok(UpstreamHttpResponse {
                    status: 429,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        br#"{"error":{"message":"rate limited"}}"#,
                    )),
                });
            }
            if req.url.contains("badkey.example") {
                return Ok(UpstreamHttpResponse {
                    status: 401,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        br#"{"error":{"message":"Incorrect API key provided"}}"#,
                    )),
                });
            }
            if req.url.contains("reject.example") {
                return Ok(UpstreamHttpResponse {
                    status: 400,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        br#"{"error":{"message":"malformed request"}}"#,
                    )),
                });
            }
            Ok(UpstreamHttpResponse {
                status: 200,
                headers: vec![("content-type".into(), "application/json".into())],
                body: UpstreamBody::Bytes(Bytes::from_static(
                    br#"{"id":"cmpl-1","choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
                )),
            })
        })
    }
}

fn channel(id: i64, base_url: &str) -> ChannelRow {
    ChannelRow {
        id,
        channel_type: 1,
        name: format!("ch-{id}"),
        base_url: base_url.into(),
        key: format!("sk-{id}"),
        models: vec!["gpt-x".into()],
        groups: vec!["default".into()],
        priority: 0,
        weight: 1,
        status: 1,
        auto_ban: true,
        model_mapping: Map::new(),
        param_override: Map::new(),
    }
}

fn ability(channel_id: i64, priority: i64) -> AbilityRow {
    AbilityRow {
        user_group: "default".into(),
        model: "gpt-x".into(),
        channel_id,
        priority,
        weight: 1,
        enabled: true,
    }
}

fn snapshot(channels: Vec<ChannelRow>, abilities: Vec<AbilityRow>) -> StorageSnapshot {
    StorageSnapshot {
        channels,
        abilities,
        users: vec![UserRow {
            id: 7,
            username: "u".into(),
            user_group: "default".into(),
            quota: 10_000,
            enabled: true,
        }],
        tokens: vec![TokenRow {
            id: 3,
            user_id: 7,
            key_hash: "h".into(),
            name: "t".into(),
            remain_quota: 10_000,
            unlimited_quota: false,
            enabled: true,
        }],
    }
}

fn global_config() -> GlobalConfig {
    GlobalConfig {
        host: "127.0.0.1".into(),
        port: 0,
        dsn: "sqlite::memory:".into(),
        retry_times: 3,
        error_log_enabled: true,
        frontend_base_url: None,
        session_secret: "secret".into(),
        proxy: None,
        sensitive_words: vec![],
        cache_refresh_secs: 3600,
    }
}

fn chat_envelope() -> RelayEnvelope {
    let body = serde_json::json!({
        "model": "gpt-x",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
    });
    let raw = Bytes::from(serde_json::to_vec(&body).unwrap());
    RelayEnvelope {
        parsed: ParsedRequest::Chat(serde_json::from_value(body).unwrap()),
        raw_body: raw,
        content_type: "application/json".into(),
    }
}

fn relay_info() -> RelayInfo {
    let mut info = RelayInfo::new(
        "req-test".into(),
        RelayFormat::OpenAI,
        RelayMode::ChatCompletions,
        "gpt-x".into(),
    );
    info.user_id = 7;
    info.token_id = 3;
    info.group = "default".into();
    info
}

fn build_state(
    storage: Arc<MemStorage>,
    client: Arc<ScriptedClient>,
    channels: Vec<ChannelRow>,
    abilities: Vec<AbilityRow>,
) -> Arc<AppState> {
    AppState::new(
        global_config(),
        snapshot(channels, abilities),
        PriceTable::default(),
        storage,
        client,
    )
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn happy_path_settles_actual_usage() {
    let storage = Arc::new(MemStorage::default());
    *storage.quota.lock().unwrap() = 10_000;
    let client = Arc::new(ScriptedClient::new());
    let state = build_state(
        storage.clone(),
        client.clone(),
        vec![channel(1, "https://good.example")],
        vec![ability(1, 0)],
    );

    let pipeline = RelayPipeline::new(state);
    let mut info = relay_info();
    let result = pipeline.handle(&mut info, &chat_envelope()).await;
    assert!(result.is_ok());
    assert_eq!(client.call_count(), 1);
    // Hold handed to settlement, not refunded by the pipeline.
    assert_eq!(info.final_pre_consumed_quota, 0);

    // Actual cost at default pricing: ceil(10 * 0.05 + 5 * 0.1) = 2.
    wait_for(|| storage.usage_logs.lock().unwrap().len() == 1).await;
    wait_for(|| *storage.quota.lock().unwrap() == 10_000 - 2).await;
    assert_eq!(*storage.used.lock().unwrap(), 2);
    let logs = storage.usage_logs.lock().unwrap();
    assert_eq!(logs[0].prompt_tokens, 10);
    assert_eq!(logs[0].completion_tokens, 5);
}

#[tokio::test]
async fn rate_limited_channel_falls_back_to_second() {
    let storage = Arc::new(MemStorage::default());
    *storage.quota.lock().unwrap() = 10_000;
    let client = Arc::new(ScriptedClient::new());
    // The flaky channel sits in a higher priority tier, so it is always
    // drawn first; the retry must exclude it and land on the good one.
    let state = build_state(
        storage.clone(),
        client.clone(),
        vec![
            channel(1, "https://flaky.example"),
            channel(2, "https://good.example"),
        ],
        vec![ability(1, 10), ability(2, 0)],
    );

    let pipeline = RelayPipeline::new(state);
    let mut info = relay_info();
    let result = pipeline.handle(&mut info, &chat_envelope()).await;
    assert!(result.is_ok());
    assert_eq!(client.call_count(), 2);

    // The failed channel's error counter is bumped; no disable for a 429.
    wait_for(|| storage.error_counts.lock().unwrap().contains(&1)).await;
    assert!(storage.disabled.lock().unwrap().is_empty());

    // Exactly one settlement; pre-consume happened once, not per attempt.
    wait_for(|| storage.usage_logs.lock().unwrap().len() == 1).await;
    wait_for(|| *storage.quota.lock().unwrap() == 10_000 - 2).await;
}

#[tokio::test]
async fn bad_request_does_not_retry_and_refunds() {
    let storage = Arc::new(MemStorage::default());
    *storage.quota.lock().unwrap() = 10_000;
    let client = Arc::new(ScriptedClient::new());
    let state = build_state(
        storage.clone(),
        client.clone(),
        vec![
            channel(1, "https://reject.example"),
            channel(2, "https://good.example"),
        ],
        vec![ability(1, 10), ability(2, 0)],
    );

    let pipeline = RelayPipeline::new(state);
    let mut info = relay_info();
    let err = pipeline.handle(&mut info, &chat_envelope()).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.kind, ErrorKind::ChannelResponseError);
    assert_eq!(client.call_count(), 1);
    assert_eq!(info.final_pre_consumed_quota, 0);

    // The hold came back in full.
    wait_for(|| *storage.quota.lock().unwrap() == 10_000).await;
    assert!(storage.usage_logs.lock().unwrap().is_empty());
    // A recordable channel error landed in the sink.
    wait_for(|| storage.error_logs.lock().unwrap().len() == 1).await;
    let rows = storage.error_logs.lock().unwrap();
    assert_eq!(rows[0].channel_id, 1);
    assert_eq!(rows[0].use_channel, vec![1]);
}

#[tokio::test]
async fn invalid_credential_auto_disables_channel() {
    let storage = Arc::new(MemStorage::default());
    *storage.quota.lock().unwrap() = 10_000;
    let client = Arc::new(ScriptedClient::new());
    let state = build_state(
        storage.clone(),
        client.clone(),
        vec![
            channel(1, "https://badkey.example"),
            channel(2, "https://good.example"),
        ],
        vec![ability(1, 10), ability(2, 0)],
    );

    let pipeline = RelayPipeline::new(state.clone());
    let mut info = relay_info();
    let result = pipeline.handle(&mut info, &chat_envelope()).await;
    // 401 retries onto the healthy channel.
    assert!(result.is_ok());
    assert_eq!(client.call_count(), 2);

    // The invalid-key channel is disabled asynchronously and leaves the
    // live index, and the scrubbed error row names it.
    wait_for(|| storage.disabled.lock().unwrap().contains(&1)).await;
    wait_for(|| !state.cache.load().channels.get(&1).unwrap().is_enabled()).await;
    wait_for(|| storage.error_logs.lock().unwrap().len() == 1).await;
    assert_eq!(storage.error_logs.lock().unwrap()[0].channel_id, 1);
}

#[tokio::test]
async fn insufficient_quota_fails_before_dispatch() {
    let storage = Arc::new(MemStorage::default());
    *storage.quota.lock().unwrap() = 1;
    let client = Arc::new(ScriptedClient::new());
    let state = build_state(
        storage.clone(),
        client.clone(),
        vec![channel(1, "https://good.example")],
        vec![ability(1, 0)],
    );

    let pipeline = RelayPipeline::new(state);
    let mut info = relay_info();
    let err = pipeline.handle(&mut info, &chat_envelope()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientQuota);
    assert!(err.skip_retry);
    assert_eq!(client.call_count(), 0);
    assert_eq!(*storage.quota.lock().unwrap(), 1);
}
