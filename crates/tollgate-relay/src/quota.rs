//! Hold-and-release quota accounting.
//!
//! Pre-consume debits an upper-bound estimate before the first upstream
//! attempt; settlement either refunds the hold (failure) or reconciles it
//! against observed usage (success). Debits for one user are serialized
//! through a per-user async lock on top of the storage layer's conditional
//! update, so concurrent requests cannot interleave a lost update.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use tollgate_adapter::{ErrorKind, PriceData, RelayError, RelayInfo};
use tollgate_protocol::openai::Usage;
use tollgate_storage::{Storage, UsageLogRow};

pub struct QuotaAccountant {
    storage: Arc<dyn Storage>,
    user_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

/// Everything settlement needs, copied out of the request context so the
/// side task never touches a cancelled request.
#[derive(Debug, Clone)]
pub struct SettleContext {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub group: String,
    pub is_stream: bool,
    pub pre_consumed: i64,
    pub price: PriceData,
}

impl QuotaAccountant {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user_id).or_default().clone()
    }

    /// Debit the hold. At most one pre-consume happens per request: the
    /// amount lands in `info.final_pre_consumed_quota` and stays there until
    /// refund or settlement zeroes it.
    pub async fn pre_consume(&self, info: &mut RelayInfo, amount: i64) -> Result<(), RelayError> {
        if amount <= 0 {
            info.final_pre_consumed_quota = 0;
            return Ok(());
        }
        let lock = self.user_lock(info.user_id).await;
        let _guard = lock.lock().await;
        let debited = self
            .storage
            .debit_user_quota(info.user_id, amount)
            .await
            .map_err(|err| RelayError::new(ErrorKind::PreConsumeFailed, err))?;
        if !debited {
            return Err(RelayError::new(
                ErrorKind::InsufficientQuota,
                "user quota is not enough",
            )
            .with_skip_retry());
        }
        if let Err(err) = self.storage.debit_token_quota(info.token_id, amount).await {
            warn!(
                request_id = %info.request_id,
                error = %err,
                "token quota debit failed after user debit"
            );
        }
        info.final_pre_consumed_quota = amount;
        Ok(())
    }

    /// Return the hold. Zeroing the field first makes a second refund for
    /// the same request a no-op.
    pub async fn refund(&self, info: &mut RelayInfo) {
        let amount = info.final_pre_consumed_quota;
        if amount <= 0 {
            return;
        }
        info.final_pre_consumed_quota = 0;
        let lock = self.user_lock(info.user_id).await;
        let _guard = lock.lock().await;
        if let Err(err) = self.storage.credit_user_quota(info.user_id, amount).await {
            warn!(
                request_id = %info.request_id,
                amount,
                error = %err,
                "quota refund failed"
            );
        }
    }

    /// Refund path for settlement jobs that only hold copied context.
    pub async fn refund_held(&self, ctx: &SettleContext) {
        if ctx.pre_consumed <= 0 {
            return;
        }
        let lock = self.user_lock(ctx.user_id).await;
        let _guard = lock.lock().await;
        if let Err(err) = self
            .storage
            .credit_user_quota(ctx.user_id, ctx.pre_consumed)
            .await
        {
            warn!(
                request_id = %ctx.request_id,
                amount = ctx.pre_consumed,
                error = %err,
                "quota refund failed"
            );
        }
    }

    /// Success settlement: compute actual cost from observed tokens, adjust
    /// the balance by `actual − pre_consumed` (either direction), and write
    /// the accounting row.
    pub async fn post_consume(&self, ctx: &SettleContext, usage: &Usage) {
        let actual = ctx
            .price
            .final_quota(usage.prompt_tokens, usage.completion_tokens);
        let delta = ctx.pre_consumed - actual;
        {
            let lock = self.user_lock(ctx.user_id).await;
            let _guard = lock.lock().await;
            if delta != 0 {
                if let Err(err) = self.storage.credit_user_quota(ctx.user_id, delta).await {
                    warn!(
                        request_id = %ctx.request_id,
                        delta,
                        error = %err,
                        "quota reconcile failed"
                    );
                }
            }
            if let Err(err) = self.storage.add_used_quota(ctx.user_id, actual).await {
                warn!(
                    request_id = %ctx.request_id,
                    actual,
                    error = %err,
                    "used-quota update failed"
                );
            }
        }
        let row = UsageLogRow {
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            channel_id: ctx.channel_id,
            model_name: ctx.model_name.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: actual,
            is_stream: ctx.is_stream,
            content: format!(
                "group {} rate {:.2} per-call {}",
                ctx.group, ctx.price.group_ratio, ctx.price.per_call
            ),
        };
        if let Err(err) = self.storage.append_usage_log(row).await {
            warn!(request_id = %ctx.request_id, error = %err, "usage log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tollgate_adapter::{RelayFormat, RelayMode};
    use tollgate_storage::{ErrorLogRow, StorageResult, StorageSnapshot};

    #[derive(Default)]
    struct MemStorage {
        quota: StdMutex<i64>,
        used: StdMutex<i64>,
        logs: StdMutex<Vec<UsageLogRow>>,
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

        async fn set_channel_status(&self, _channel_id: i64, _status: i32) -> StorageResult<()> {
            Ok(())
        }

        async fn bump_channel_error_count(&self, _channel_id: i64) -> StorageResult<()> {
            Ok(())
        }

        async fn append_usage_log(&self, row: UsageLogRow) -> StorageResult<()> {
            self.logs.lock().unwrap().push(row);
            Ok(())
        }

        async fn append_error_log(&self, _row: ErrorLogRow) -> StorageResult<()> {
            Ok(())
        }
    }

    fn info() -> RelayInfo {
        let mut info = RelayInfo::new(
            "r".into(),
            RelayFormat::OpenAI,
            RelayMode::ChatCompletions,
            "gpt-x".into(),
        );
        info.user_id = 7;
        info.token_id = 3;
        info
    }

    fn settle_ctx(pre_consumed: i64) -> SettleContext {
        SettleContext {
            request_id: "r".into(),
            user_id: 7,
            token_id: 3,
            channel_id: 1,
            model_name: "gpt-x".into(),
            group: "default".into(),
            is_stream: false,
            pre_consumed,
            price: PriceData {
                input_per_token: 1.0,
                output_per_token: 1.0,
                per_call: 0,
                group_ratio: 1.0,
                should_pre_consumed_quota: pre_consumed,
            },
        }
    }

    #[tokio::test]
    async fn insufficient_quota_is_skip_retry_and_leaves_balance() {
        let storage = Arc::new(MemStorage::default());
        *storage.quota.lock().unwrap() = 100;
        let accountant = QuotaAccountant::new(storage.clone());
        let mut info = info();
        let err = accountant.pre_consume(&mut info, 500).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientQuota);
        assert!(err.skip_retry);
        assert_eq!(*storage.quota.lock().unwrap(), 100);
        assert_eq!(info.final_pre_consumed_quota, 0);
    }

    #[tokio::test]
    async fn refund_is_idempotent() {
        let storage = Arc::new(MemStorage::default());
        *storage.quota.lock().unwrap() = 1000;
        let accountant = QuotaAccountant::new(storage.clone());
        let mut info = info();
        accountant.pre_consume(&mut info, 400).await.unwrap();
        assert_eq!(*storage.quota.lock().unwrap(), 600);
        assert_eq!(info.final_pre_consumed_quota, 400);

        accountant.refund(&mut info).await;
        accountant.refund(&mut info).await;
        assert_eq!(*storage.quota.lock().unwrap(), 1000);
        assert_eq!(info.final_pre_consumed_quota, 0);
    }

    #[tokio::test]
    async fn zero_hold_skips_debit() {
        let storage = Arc::new(MemStorage::default());
        *storage.quota.lock().unwrap() = 50;
        let accountant = QuotaAccountant::new(storage.clone());
        let mut info = info();
        accountant.pre_consume(&mut info, 0).await.unwrap();
        assert_eq!(*storage.quota.lock().unwrap(), 50);
        assert_eq!(info.final_pre_consumed_quota, 0);
    }

    #[tokio::test]
    async fn post_consume_reconciles_and_logs() {
        let storage = Arc::new(MemStorage::default());
        *storage.quota.lock().unwrap() = 10_000;
        let accountant = QuotaAccountant::new(storage.clone());
        let mut info = info();
        accountant.pre_consume(&mut info, 500).await.unwrap();
        assert_eq!(*storage.quota.lock().unwrap(), 9_500);

        // Actual cost: 10 prompt + 5 completion at unit price = 15.
        accountant
            .post_consume(&settle_ctx(500), &Usage::new(10, 5))
            .await;
        assert_eq!(*storage.quota.lock().unwrap(), 10_000 - 15);
        assert_eq!(*storage.used.lock().unwrap(), 15);
        let logs = storage.logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 15);
        assert_eq!(logs[0].prompt_tokens, 10);
    }
}
