//! Database layer for idp

mod connection;
mod migrations;
mod records;
mod settings_repository;

pub use connection::Database;
pub use records::{values, RecordRepository, RowReader, SyncRecord};
pub use settings_repository::{LibSqlSettingsRepository, SettingsRepository};
