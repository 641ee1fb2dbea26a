//! Database repository for the target pool.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::db::models::targets::{Target, TargetCreate};
use crate::types::abbrev_id;

pub struct Targets<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> Targets<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(project_id = %request.project_id, location = %request.location), err)]
    pub async fn create(&mut self, request: &TargetCreate) -> Result<Target> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO targets (
                id, name, project_id, location, service_account_key_json,
                is_active, failure_count, request_count, daily_rate_limit,
                daily_requests_used, is_disabled_by_rate_limit, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 1, 0, 0, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(&request.project_id)
        .bind(&request.location)
        .bind(&request.service_account_key_json)
        .bind(request.daily_rate_limit)
        .bind(now)
        .bind(now)
        .execute(&mut *self.db)
        .await?;

        self.get_by_id(&id).await?.ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(target_id = %abbrev_id(id)), err)]
    pub async fn get_by_id(&mut self, id: &str) -> Result<Option<Target>> {
        let target = sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(target)
    }

    /// Look up the target bound to a (project, location) pair; the pair is
    /// unique, so this is the upsert key for `add_or_reactivate`.
    #[instrument(skip(self), err)]
    pub async fn find_by_binding(&mut self, project_id: &str, location: &str) -> Result<Option<Target>> {
        let target = sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE project_id = ? AND location = ?")
            .bind(project_id)
            .bind(location)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(target)
    }

    #[instrument(skip(self), err)]
    pub async fn list_all(&mut self) -> Result<Vec<Target>> {
        let targets = sqlx::query_as::<_, Target>("SELECT * FROM targets ORDER BY created_at ASC")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(targets)
    }

    #[instrument(skip(self), err)]
    pub async fn list_active(&mut self) -> Result<Vec<Target>> {
        let targets = sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE is_active = 1 ORDER BY created_at ASC")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(targets)
    }

    /// Persist the full row. Counter mutation happens in memory on the
    /// manager side; the row here is the single source of truth afterwards.
    #[instrument(skip(self, target), fields(target_id = %abbrev_id(&target.id)), err)]
    pub async fn save(&mut self, target: &Target) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE targets SET
                name = ?,
                project_id = ?,
                location = ?,
                service_account_key_json = ?,
                is_active = ?,
                last_used_at = ?,
                failure_count = ?,
                request_count = ?,
                daily_rate_limit = ?,
                daily_requests_used = ?,
                last_reset_date = ?,
                rate_limit_reset_at = ?,
                is_disabled_by_rate_limit = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&target.name)
        .bind(&target.project_id)
        .bind(&target.location)
        .bind(&target.service_account_key_json)
        .bind(target.is_active)
        .bind(target.last_used_at)
        .bind(target.failure_count)
        .bind(target.request_count)
        .bind(target.daily_rate_limit)
        .bind(target.daily_requests_used)
        .bind(target.last_reset_date)
        .bind(target.rate_limit_reset_at)
        .bind(target.is_disabled_by_rate_limit)
        .bind(Utc::now())
        .bind(&target.id)
        .execute(&mut *self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Persist several rows in one call. Callers run this inside a
    /// transaction so the whole batch lands as a single observable step.
    #[instrument(skip(self, targets), fields(count = targets.len()), err)]
    pub async fn bulk_update(&mut self, targets: &[Target]) -> Result<()> {
        for target in targets {
            self.save(target).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(target_id = %abbrev_id(id)), err)]
    pub async fn delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM targets WHERE id = ?")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
