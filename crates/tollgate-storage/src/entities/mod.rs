pub mod abilities;
pub mod channels;
pub mod error_logs;
pub mod logs;
pub mod tokens;
pub mod users;
