//! Request log records: one row per dispatch outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Sentinel target id used when no target could be acquired for the request.
pub const TARGET_UNAVAILABLE: &str = "TARGET_UNAVAILABLE";
/// Sentinel target id used when the owning target could not be determined.
pub const TARGET_UNKNOWN: &str = "TARGET_UNKNOWN";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RequestLog {
    pub id: String,
    pub request_id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub requested_model: String,
    pub model_used: Option<String>,
    pub is_streaming: bool,
    pub status_code: i64,
    pub is_error: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: i64,
    pub ip_address: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Append shape consumed by the log sink; the row id and timestamp are filled
/// in by the repository.
#[derive(Debug, Clone)]
pub struct RequestLogCreate {
    pub request_id: String,
    pub target_id: String,
    pub requested_model: String,
    pub model_used: Option<String>,
    pub is_streaming: bool,
    pub status_code: i64,
    pub is_error: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: i64,
    pub ip_address: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}
