pub mod database;
pub mod database_channels;
pub mod database_consume_logs;
pub mod time;
pub mod types;

pub use database::DatabaseLogger;
pub use types::ConsumeLog;
