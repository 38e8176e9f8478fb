//! Ability-index cache.
//!
//! Readers take a consistent snapshot through an atomic swap; a background
//! task rebuilds the index from storage on a timer, and the auto-disable path
//! rebuilds it immediately after flipping a channel off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use tollgate_storage::{ChannelRow, StorageSnapshot};

/// One eligible channel for a `(group, model)` pair.
#[derive(Debug, Clone)]
pub struct ChannelChoice {
    pub channel_id: i64,
    pub priority: i64,
    pub weight: i64,
}

#[derive(Debug, Default)]
pub struct AbilityIndex {
    /// `(group, model)` → weighted candidate set.
    pub by_group_model: HashMap<(String, String), Vec<ChannelChoice>>,
    /// Live channel rows by id.
    pub channels: HashMap<i64, ChannelRow>,
}

pub struct AbilityCache {
    index: ArcSwap<AbilityIndex>,
    /// Multi-key rotation cursors, preserved across refreshes.
    cursors: ArcSwap<HashMap<i64, Arc<AtomicUsize>>>,
}

impl AbilityCache {
    pub fn new() -> Self {
        Self {
            index: ArcSwap::from_pointee(AbilityIndex::default()),
            cursors: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn load(&self) -> Arc<AbilityIndex> {
        self.index.load_full()
    }

    /// Rebuild the index from a fresh snapshot. Disabled channels and
    /// disabled ability rows never enter the index.
    pub fn rebuild(&self, snapshot: &StorageSnapshot) {
        let channels: HashMap<i64, ChannelRow> = snapshot
            .channels
            .iter()
            .map(|row| (row.id, row.clone()))
            .collect();

        let mut by_group_model: HashMap<(String, String), Vec<ChannelChoice>> = HashMap::new();
        for ability in &snapshot.abilities {
            if !ability.enabled {
                continue;
            }
            let Some(channel) = channels.get(&ability.channel_id) else {
                continue;
            };
            if !channel.is_enabled() {
                continue;
            }
            by_group_model
                .entry((ability.user_group.clone(), ability.model.clone()))
                .or_default()
                .push(ChannelChoice {
                    channel_id: ability.channel_id,
                    priority: ability.priority,
                    weight: ability.weight.max(1),
                });
        }

        let previous = self.cursors.load();
        let mut cursors: HashMap<i64, Arc<AtomicUsize>> = HashMap::new();
        for channel in channels.values() {
            if channel.is_multi_key() {
                let cursor = previous
                    .get(&channel.id)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)));
                cursors.insert(channel.id, cursor);
            }
        }

        self.index.store(Arc::new(AbilityIndex {
            by_group_model,
            channels,
        }));
        self.cursors.store(Arc::new(cursors));
    }

    /// Drop a channel from the live index without waiting for the next
    /// refresh; used by the auto-disable path.
    pub fn evict_channel(&self, channel_id: i64) {
        let current = self.index.load();
        let mut channels = current.channels.clone();
        if let Some(row) = channels.get_mut(&channel_id) {
            row.status = tollgate_storage::entities::channels::STATUS_AUTO_DISABLED;
        }
        let mut by_group_model = current.by_group_model.clone();
        for choices in by_group_model.values_mut() {
            choices.retain(|choice| choice.channel_id != channel_id);
        }
        self.index.store(Arc::new(AbilityIndex {
            by_group_model,
            channels,
        }));
    }

    /// Advance the channel's key cursor and return the index to use. Exact
    /// fairness is not required, only eventual rotation.
    pub fn next_key_index(&self, channel_id: i64, key_count: usize) -> usize {
        if key_count <= 1 {
            return 0;
        }
        let cursors = self.cursors.load();
        match cursors.get(&channel_id) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % key_count,
            None => 0,
        }
    }
}

impl Default for AbilityCache {
    fn default() -> Self {
        Self::new()
    }
}
