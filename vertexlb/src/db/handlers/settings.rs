//! Repository for the singleton settings row.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::settings::Settings;

pub struct AppSettings<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> AppSettings<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// Fresh snapshot of the tunables, clamped into their documented ranges.
    /// The dispatcher calls this once per request and never caches across
    /// requests.
    #[instrument(skip(self), err)]
    pub async fn get(&mut self) -> Result<Settings> {
        let settings = sqlx::query_as::<_, Settings>(
            r#"
            SELECT target_rotation_request_count, max_failure_count, rate_limit_cooldown_secs,
                   max_retries, failover_delay_secs, log_retention_days
            FROM app_settings WHERE id = 1
            "#,
        )
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(settings.unwrap_or_default().clamped())
    }

    #[instrument(skip(self, settings), err)]
    pub async fn update(&mut self, settings: &Settings) -> Result<Settings> {
        sqlx::query(
            r#"
            UPDATE app_settings SET
                target_rotation_request_count = ?,
                max_failure_count = ?,
                rate_limit_cooldown_secs = ?,
                max_retries = ?,
                failover_delay_secs = ?,
                log_retention_days = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(settings.target_rotation_request_count)
        .bind(settings.max_failure_count)
        .bind(settings.rate_limit_cooldown_secs)
        .bind(settings.max_retries)
        .bind(settings.failover_delay_secs)
        .bind(settings.log_retention_days)
        .bind(Utc::now())
        .execute(&mut *self.db)
        .await?;

        self.get().await
    }
}
