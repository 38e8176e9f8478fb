pub mod db;
pub mod entities;
pub mod snapshot;
pub mod storage;

pub use snapshot::{AbilityRow, ChannelRow, StorageSnapshot, TokenRow, UserRow};
pub use storage::{
    ErrorLogRow, SeaOrmStorage, Storage, StorageError, StorageResult, UsageLogRow,
};
