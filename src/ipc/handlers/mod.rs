pub mod backup_exchange;
pub mod config;
pub mod core;
pub mod schedules;
pub mod versions;
