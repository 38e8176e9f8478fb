//! Weighted channel selection over the ability cache.

use rand::Rng;

use tollgate_adapter::{ChannelType, ErrorKind, RelayError, RelayInfo};
use tollgate_storage::ChannelRow;

use crate::cache::AbilityCache;

/// A channel resolved for one attempt, with the concrete credential drawn
/// from a multi-key bag when applicable.
#[derive(Debug, Clone)]
pub struct SelectedChannel {
    pub row: ChannelRow,
    pub api_key: String,
    pub key_index: Option<usize>,
}

/// Draw a channel for `(group, model)`, excluding channels already tried by
/// this request. An empty candidate set, or an index row whose channel has
/// since been disabled in the live store, is a skip-retry failure.
pub fn select_channel(
    cache: &AbilityCache,
    group: &str,
    model: &str,
    exclude: &[i64],
) -> Result<SelectedChannel, RelayError> {
    let index = cache.load();
    let no_channel = || {
        RelayError::new(
            ErrorKind::GetChannelFailed,
            format!("no available channel for group {group} and model {model}"),
        )
        .with_skip_retry()
    };

    let candidates: Vec<_> = index
        .by_group_model
        .get(&(group.to_string(), model.to_string()))
        .map(|choices| {
            choices
                .iter()
                .filter(|choice| !exclude.contains(&choice.channel_id))
                .collect()
        })
        .unwrap_or_default();
    if candidates.is_empty() {
        return Err(no_channel());
    }

    // Highest priority tier wins; weight decides inside the tier.
    let top_priority = candidates
        .iter()
        .map(|choice| choice.priority)
        .max()
        .unwrap_or(0);
    let tier: Vec<_> = candidates
        .into_iter()
        .filter(|choice| choice.priority == top_priority)
        .collect();

    let total_weight: i64 = tier.iter().map(|choice| choice.weight).sum();
    let mut roll = rand::thread_rng().gen_range(0..total_weight.max(1));
    let mut chosen = tier[tier.len() - 1];
    for &choice in &tier {
        if roll < choice.weight {
            chosen = choice;
            break;
        }
        roll -= choice.weight;
    }

    let Some(row) = index.channels.get(&chosen.channel_id) else {
        // Index and live store disagree; treat as cache inconsistency.
        return Err(no_channel());
    };
    if !row.is_enabled() {
        return Err(no_channel());
    }

    let keys = row.keys();
    let key_index = if keys.len() > 1 {
        Some(cache.next_key_index(row.id, keys.len()))
    } else {
        None
    };
    let api_key = keys[key_index.unwrap_or(0)].clone();

    Ok(SelectedChannel {
        row: row.clone(),
        api_key,
        key_index,
    })
}

/// Copy the selection into the per-request ledger: channel identity, base
/// URL, credential, and the alias-resolved upstream model.
pub fn apply_selection(info: &mut RelayInfo, selected: &SelectedChannel) {
    let row = &selected.row;
    info.channel_id = row.id;
    info.channel_type = ChannelType::from_i32(row.channel_type).unwrap_or(ChannelType::OpenAI);
    info.channel_name = row.name.clone();
    info.base_url = row.base_url.clone();
    info.api_key = selected.api_key.clone();
    info.is_multi_key = selected.key_index.is_some();
    info.multi_key_index = selected.key_index;
    info.auto_ban = row.auto_ban;
    info.param_override = row.param_override.clone();
    info.upstream_model = row
        .mapped_model(&info.original_model)
        .unwrap_or_else(|| info.original_model.clone());
}
