//! Bounded worker pool for side effects that must not block or outlive the
//! request path: channel auto-disable, error-log persistence, and quota
//! settlement. Every task carries copied data only.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tollgate_protocol::openai::Usage;
use tollgate_storage::entities::channels::STATUS_AUTO_DISABLED;
use tollgate_storage::{ErrorLogRow, Storage};

use crate::cache::AbilityCache;
use crate::quota::{QuotaAccountant, SettleContext};

#[derive(Debug)]
pub enum SideTask {
    DisableChannel {
        channel_id: i64,
        channel_name: String,
        reason: String,
    },
    BumpErrorCount {
        channel_id: i64,
    },
    RecordError(ErrorLogRow),
    Settle {
        ctx: SettleContext,
        usage: Usage,
    },
    Refund {
        ctx: SettleContext,
    },
}

#[derive(Clone)]
pub struct SideTaskSink {
    tx: mpsc::Sender<SideTask>,
}

const QUEUE_CAPACITY: usize = 256;
const WORKERS: usize = 4;

impl SideTaskSink {
    pub fn spawn(
        storage: Arc<dyn Storage>,
        cache: Arc<AbilityCache>,
        accountant: Arc<QuotaAccountant>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<SideTask>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..WORKERS {
            let rx = rx.clone();
            let storage = storage.clone();
            let cache = cache.clone();
            let accountant = accountant.clone();
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(task) = task else {
                        break;
                    };
                    run_task(task, &storage, &cache, &accountant).await;
                }
            });
        }
        Self { tx }
    }

    /// Fire-and-forget; a full queue drops the task with a warning rather
    /// than stalling the request path.
    pub fn post(&self, task: SideTask) {
        if let Err(err) = self.tx.try_send(task) {
            warn!(error = %err, "side task dropped");
        }
    }

    /// Settlement must not be dropped; waits for queue space.
    pub async fn post_wait(&self, task: SideTask) {
        if let Err(err) = self.tx.send(task).await {
            error!(error = %err, "side task queue closed");
        }
    }
}

async fn run_task(
    task: SideTask,
    storage: &Arc<dyn Storage>,
    cache: &Arc<AbilityCache>,
    accountant: &Arc<QuotaAccountant>,
) {
    match task {
        SideTask::DisableChannel {
            channel_id,
            channel_name,
            reason,
        } => {
            if let Err(err) = storage
                .set_channel_status(channel_id, STATUS_AUTO_DISABLED)
                .await
            {
                error!(channel_id, error = %err, "channel disable write failed");
                return;
            }
            cache.evict_channel(channel_id);
            // Out-of-band operator notification rides the log stream.
            warn!(
                channel_id,
                channel = %channel_name,
                reason = %reason,
                "channel has been auto-disabled"
            );
        }
        SideTask::BumpErrorCount { channel_id } => {
            if let Err(err) = storage.bump_channel_error_count(channel_id).await {
                warn!(channel_id, error = %err, "error counter update failed");
            }
        }
        SideTask::RecordError(row) => {
            if let Err(err) = storage.append_error_log(row).await {
                warn!(error = %err, "error log write failed");
            }
        }
        SideTask::Settle { ctx, usage } => {
            accountant.post_consume(&ctx, &usage).await;
            info!(
                request_id = %ctx.request_id,
                model = %ctx.model_name,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "usage settled"
            );
        }
        SideTask::Refund { ctx } => {
            accountant.refund_held(&ctx).await;
        }
    }
}
