//! Repository implementations for database access.
//!
//! - [`targets`]: the durable target pool and its counters
//! - [`request_logs`]: the append-only dispatch outcome log
//! - [`settings`]: the singleton dispatcher settings row

pub mod request_logs;
pub mod settings;
pub mod targets;

pub use request_logs::RequestLogs;
pub use settings::AppSettings;
pub use targets::Targets;
