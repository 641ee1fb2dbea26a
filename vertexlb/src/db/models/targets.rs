//! Target records: one row per routable Vertex AI binding.

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A routable Vertex endpoint binding (project + region + credential) and its
/// usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Target {
    pub id: String,
    pub name: Option<String>,
    pub project_id: String,
    pub location: String,
    pub service_account_key_json: String,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub failure_count: i64,
    pub request_count: i64,
    /// Absent means unlimited.
    pub daily_rate_limit: Option<i64>,
    pub daily_requests_used: i64,
    pub last_reset_date: Option<DateTime<Utc>>,
    /// Future instant while the target is under an upstream cooldown.
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub is_disabled_by_rate_limit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    /// A target may be acquired iff it is administratively active, its daily
    /// quota is not exhausted, and any upstream cooldown has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && !self.is_disabled_by_rate_limit
            && self.rate_limit_reset_at.is_none_or(|reset| reset <= now)
    }

    /// True when the target has not yet been reset on the given local day.
    pub fn needs_daily_reset(&self, today: NaiveDate) -> bool {
        match self.last_reset_date {
            None => true,
            Some(reset) => reset.with_timezone(&Local).date_naive() < today,
        }
    }

    /// True when a configured daily limit has been consumed.
    pub fn daily_quota_exhausted(&self) -> bool {
        self.daily_rate_limit
            .is_some_and(|limit| self.daily_requests_used >= limit)
    }

    /// Label used on the models listing and in logs: the human name when set,
    /// the id otherwise.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Creation shape consumed by the targets repository.
#[derive(Debug, Clone)]
pub struct TargetCreate {
    pub name: Option<String>,
    pub project_id: String,
    pub location: String,
    pub service_account_key_json: String,
    pub daily_rate_limit: Option<i64>,
}

/// Upsert shape for `add_or_reactivate`: matched on (project_id, location).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetUpsert {
    pub name: Option<String>,
    pub project_id: String,
    pub location: String,
    pub service_account_key_json: String,
    #[serde(default)]
    pub daily_rate_limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn target() -> Target {
        let now = Utc::now();
        Target {
            id: "t-1".to_string(),
            name: None,
            project_id: "proj".to_string(),
            location: "us-central1".to_string(),
            service_account_key_json: "{}".to_string(),
            is_active: true,
            last_used_at: None,
            failure_count: 0,
            request_count: 0,
            daily_rate_limit: None,
            daily_requests_used: 0,
            last_reset_date: Some(now),
            rate_limit_reset_at: None,
            is_disabled_by_rate_limit: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn eligible_when_active_and_unthrottled() {
        let now = Utc::now();
        assert!(target().is_eligible(now));
    }

    #[test]
    fn ineligible_when_inactive() {
        let mut t = target();
        t.is_active = false;
        assert!(!t.is_eligible(Utc::now()));
    }

    #[test]
    fn ineligible_while_cooldown_in_future() {
        let now = Utc::now();
        let mut t = target();
        t.rate_limit_reset_at = Some(now + Duration::seconds(30));
        assert!(!t.is_eligible(now));

        // A cooldown that has passed no longer blocks acquisition.
        t.rate_limit_reset_at = Some(now - Duration::seconds(1));
        assert!(t.is_eligible(now));
    }

    #[test]
    fn ineligible_when_disabled_by_rate_limit() {
        let mut t = target();
        t.is_disabled_by_rate_limit = true;
        assert!(!t.is_eligible(Utc::now()));
    }

    #[test]
    fn needs_reset_when_never_reset() {
        let mut t = target();
        t.last_reset_date = None;
        assert!(t.needs_daily_reset(Local::now().date_naive()));
    }

    #[test]
    fn needs_reset_when_last_reset_was_yesterday() {
        let mut t = target();
        t.last_reset_date = Some(Utc::now() - Duration::days(1));
        assert!(t.needs_daily_reset(Local::now().date_naive()));

        t.last_reset_date = Some(Utc::now());
        assert!(!t.needs_daily_reset(Local::now().date_naive()));
    }

    #[test]
    fn daily_quota_accounting() {
        let mut t = target();
        assert!(!t.daily_quota_exhausted());

        t.daily_rate_limit = Some(2);
        t.daily_requests_used = 1;
        assert!(!t.daily_quota_exhausted());

        t.daily_requests_used = 2;
        assert!(t.daily_quota_exhausted());
    }
}
