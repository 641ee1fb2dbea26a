//! Dispatcher settings snapshot.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;

/// Tunables read fresh for every dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Settings {
    /// Requests served by the adopted target before rotating to the next one.
    pub target_rotation_request_count: i64,
    /// Non-rate-limit failures tolerated before a target is deactivated.
    pub max_failure_count: i64,
    /// Cooldown applied after an upstream 429 without a server-supplied reset.
    pub rate_limit_cooldown_secs: i64,
    /// Failover attempts after the first failed call.
    pub max_retries: i64,
    /// Delay before re-dispatching after a rate-limited attempt.
    pub failover_delay_secs: i64,
    /// Retention horizon consumed by the external log cleaner.
    pub log_retention_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_rotation_request_count: 10,
            max_failure_count: 5,
            rate_limit_cooldown_secs: 60,
            max_retries: 3,
            failover_delay_secs: 2,
            log_retention_days: 30,
        }
    }
}

impl Settings {
    /// Force every tunable into its documented range, warning on adjustment.
    /// Out-of-range values can only come from manual edits of the settings
    /// row, and serving with a clamped value beats refusing to dispatch.
    pub fn clamped(mut self) -> Self {
        self.target_rotation_request_count =
            clamp_field("target_rotation_request_count", self.target_rotation_request_count, 1, 100);
        self.max_failure_count = clamp_field("max_failure_count", self.max_failure_count, 1, 1000);
        self.rate_limit_cooldown_secs = clamp_field("rate_limit_cooldown_secs", self.rate_limit_cooldown_secs, 10, 3600);
        self.max_retries = clamp_field("max_retries", self.max_retries, 0, 10);
        self.failover_delay_secs = clamp_field("failover_delay_secs", self.failover_delay_secs, 0, 60);
        self.log_retention_days = clamp_field("log_retention_days", self.log_retention_days, 1, 90);
        self
    }
}

fn clamp_field(name: &str, value: i64, min: i64, max: i64) -> i64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!(field = name, value, clamped, "settings value outside permitted range, clamping");
    }
    clamped
}
