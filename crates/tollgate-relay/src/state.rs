use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use tollgate_adapter::{PriceTable, UpstreamClient};
use tollgate_common::GlobalConfig;
use tollgate_storage::{Storage, StorageSnapshot};

use crate::cache::AbilityCache;
use crate::quota::QuotaAccountant;
use crate::sink::SideTaskSink;

/// Identity resolved by the auth middleware before the pipeline starts.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub token_id: i64,
    pub group: String,
}

pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub snapshot: ArcSwap<StorageSnapshot>,
    pub prices: ArcSwap<PriceTable>,
    pub cache: Arc<AbilityCache>,
    pub storage: Arc<dyn Storage>,
    pub client: Arc<dyn UpstreamClient>,
    pub accountant: Arc<QuotaAccountant>,
    pub sink: SideTaskSink,
}

impl AppState {
    pub fn new(
        global: GlobalConfig,
        snapshot: StorageSnapshot,
        prices: PriceTable,
        storage: Arc<dyn Storage>,
        client: Arc<dyn UpstreamClient>,
    ) -> Arc<Self> {
        let cache = Arc::new(AbilityCache::new());
        cache.rebuild(&snapshot);
        let accountant = Arc::new(QuotaAccountant::new(storage.clone()));
        let sink = SideTaskSink::spawn(storage.clone(), cache.clone(), accountant.clone());
        Arc::new(Self {
            global: ArcSwap::from_pointee(global),
            snapshot: ArcSwap::from_pointee(snapshot),
            prices: ArcSwap::from_pointee(prices),
            cache,
            storage,
            client,
            accountant,
            sink,
        })
    }

    /// Reload the runtime snapshot and rebuild the ability index.
    pub async fn refresh(&self) {
        match self.storage.load_snapshot().await {
            Ok(snapshot) => {
                self.cache.rebuild(&snapshot);
                self.snapshot.store(Arc::new(snapshot));
            }
            Err(err) => warn!(error = %err, "snapshot refresh failed; keeping previous"),
        }
    }

    /// Resolve a caller token. Reads only the in-memory snapshot.
    pub fn authenticate_token(&self, api_key: &str) -> Option<AuthContext> {
        let hashed = hash_token_key(api_key);
        let snapshot = self.snapshot.load();
        let token = snapshot
            .tokens
            .iter()
            .find(|token| token.enabled && token.key_hash == hashed)?;
        let user = snapshot
            .users
            .iter()
            .find(|user| user.id == token.user_id && user.enabled)?;
        Some(AuthContext {
            user_id: user.id,
            token_id: token.id,
            group: user.user_group.clone(),
        })
    }
}

pub fn hash_token_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Periodic snapshot refresh; invalidation on channel state change goes
/// through `AbilityCache::evict_channel` without waiting for this timer.
pub fn spawn_refresh_task(state: Arc<AppState>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(state.global.load().cache_refresh_secs.max(5));
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.refresh().await;
            info!(event = "ability_cache_refreshed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_key_hash_is_stable_hex() {
        let hashed = hash_token_key("sk-abc");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, hash_token_key("sk-abc"));
        assert_ne!(hashed, hash_token_key("sk-abd"));
    }
}
