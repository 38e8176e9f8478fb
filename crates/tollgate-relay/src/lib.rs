//! Relay engine: channel cache and weighted selection, quota accounting,
//! the per-request pipeline, channel-error side effects, and the realtime
//! upstream handshake.

pub mod cache;
pub mod channel_error;
pub mod pipeline;
pub mod quota;
pub mod realtime;
pub mod select;
pub mod sink;
pub mod state;

pub use cache::{AbilityCache, AbilityIndex, ChannelChoice};
pub use channel_error::{process_channel_error, ErrorLogContext};
pub use pipeline::{should_retry, RelayPipeline};
pub use quota::{QuotaAccountant, SettleContext};
pub use select::{apply_selection, select_channel, SelectedChannel};
pub use sink::{SideTask, SideTaskSink};
pub use state::{hash_token_key, spawn_refresh_task, AppState, AuthContext};
