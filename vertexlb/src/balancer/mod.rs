//! Target selection, rotation, and failure accounting.
//!
//! One [`TargetManager`] instance serves the whole process. Every state
//! transition (acquiring a target, recording an outcome, upserting a
//! binding) runs under a single async mutex and persists inside one
//! transaction while the lock is held, so no dispatch ever observes a
//! half-applied daily reset or failure count. A readers-writers split would
//! buy nothing here: every hot-path operation writes.
//!
//! Selection works through a rotation window: an adopted target serves up to
//! `target_rotation_request_count` consecutive requests, then the pool is
//! re-consulted. Fresh selection prefers never-used targets, then the least
//! recently used. Any forced drop (upstream cooldown, exhausted daily quota,
//! deactivation) clears the adopted target, and the next acquire starts a
//! fresh window.

use chrono::{Duration, Local, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::db::errors::DbError;
use crate::db::handlers::Targets;
use crate::db::models::settings::Settings;
use crate::db::models::targets::{Target, TargetCreate, TargetUpsert};
use crate::errors::{Error, Result};
use crate::types::abbrev_id;

#[derive(Debug, Default)]
struct RotationState {
    /// Target adopted by the previous dispatch, if still considered current.
    current_id: Option<String>,
    /// Requests served by the adopted target in this rotation window.
    served: i64,
}

pub struct TargetManager {
    pool: SqlitePool,
    state: Mutex<RotationState>,
}

impl TargetManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            state: Mutex::new(RotationState::default()),
        }
    }

    /// Select a target that is eligible now. Runs the daily-reset sweep,
    /// validates the retained target, and falls back to fresh selection with
    /// the new-first / least-recently-used tie-break.
    #[instrument(skip(self, settings), err)]
    pub async fn acquire(&self, settings: &Settings) -> Result<Target> {
        let mut state = self.state.lock().await;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let now = Utc::now();
        let today = Local::now().date_naive();

        // Daily reset sweep across all active targets, persisted as one step.
        {
            let mut repo = Targets::new(&mut *tx);
            let active = repo.list_active().await?;
            let mut swept: Vec<Target> = active.into_iter().filter(|target| target.needs_daily_reset(today)).collect();
            if !swept.is_empty() {
                for target in &mut swept {
                    target.daily_requests_used = 0;
                    target.is_disabled_by_rate_limit = false;
                    target.last_reset_date = Some(now);
                }
                info!(count = swept.len(), "Applying daily reset sweep");
                repo.bulk_update(&swept).await?;
            }
        }

        // Validate the target retained from the previous dispatch.
        if let Some(current_id) = state.current_id.clone() {
            let mut repo = Targets::new(&mut *tx);
            let current = repo.get_by_id(&current_id).await?;
            state.current_id = None;

            match current {
                Some(mut current) if current.is_active => {
                    if current.rate_limit_reset_at.is_some_and(|reset| reset > now) {
                        debug!(target_id = %abbrev_id(&current.id), "Dropping current target: upstream cooldown active");
                    } else if current.daily_quota_exhausted() {
                        current.is_disabled_by_rate_limit = true;
                        repo.save(&current).await?;
                        info!(target_id = %abbrev_id(&current.id), "Daily quota exhausted, disabling until reset");
                    } else if state.served >= settings.target_rotation_request_count {
                        debug!(
                            target_id = %abbrev_id(&current.id),
                            served = state.served,
                            "Rotation threshold reached, releasing current target"
                        );
                    } else {
                        state.current_id = Some(current.id.clone());
                        state.served += 1;
                        drop(repo);
                        tx.commit().await.map_err(DbError::from)?;
                        return Ok(current);
                    }
                }
                _ => debug!(target_id = %abbrev_id(&current_id), "Current target vanished or was deactivated"),
            }
        }

        // Fresh selection over the eligible pool. Targets whose daily quota
        // is consumed flip to disabled here, at the eligibility check.
        let mut repo = Targets::new(&mut *tx);
        let mut eligible: Vec<Target> = Vec::new();
        for mut target in repo.list_active().await? {
            if target.daily_quota_exhausted() && !target.is_disabled_by_rate_limit {
                target.is_disabled_by_rate_limit = true;
                repo.save(&target).await?;
                info!(target_id = %abbrev_id(&target.id), "Daily quota exhausted, disabling until reset");
                continue;
            }
            if target.is_eligible(now) {
                eligible.push(target);
            }
        }

        let Some(chosen) = eligible
            .into_iter()
            .min_by_key(|target| (target.last_used_at.is_some(), target.last_used_at, target.created_at))
        else {
            drop(repo);
            tx.commit().await.map_err(DbError::from)?;
            warn!("No eligible targets in the pool");
            return Err(Error::NoTargetsAvailable);
        };

        drop(repo);
        tx.commit().await.map_err(DbError::from)?;

        debug!(target_id = %abbrev_id(&chosen.id), "Adopted target for new rotation window");
        state.current_id = Some(chosen.id.clone());
        state.served = 1;
        Ok(chosen)
    }

    /// Record a successful call: bump usage counters and the LRU stamp.
    #[instrument(skip(self, target), fields(target_id = %abbrev_id(&target.id)), err)]
    pub async fn mark_success(&self, target: &Target) -> Result<()> {
        let _state = self.state.lock().await;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        {
            let mut repo = Targets::new(&mut *tx);
            let mut row = repo.get_by_id(&target.id).await?.ok_or(DbError::NotFound)?;
            row.last_used_at = Some(Utc::now());
            row.request_count += 1;
            row.daily_requests_used += 1;
            repo.save(&row).await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    /// Record a failed call. Rate limits put the target on cooldown and drop
    /// it from the rotation window; other failures count toward
    /// deactivation. Returns whether the failure was a rate limit.
    #[instrument(skip(self, target, error, settings), fields(target_id = %abbrev_id(&target.id)), err)]
    pub async fn mark_error(&self, target: &Target, error: &Error, settings: &Settings) -> Result<bool> {
        let mut state = self.state.lock().await;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let was_rate_limit = {
            let mut repo = Targets::new(&mut *tx);
            let mut row = repo.get_by_id(&target.id).await?.ok_or(DbError::NotFound)?;

            if error.is_rate_limit() {
                let reset_at = error
                    .rate_limit_reset_at()
                    .unwrap_or_else(|| Utc::now() + Duration::seconds(settings.rate_limit_cooldown_secs));
                row.rate_limit_reset_at = Some(reset_at);
                repo.save(&row).await?;

                info!(target_id = %abbrev_id(&row.id), reset_at = %reset_at, "Target rate limited, cooling down");
                if state.current_id.as_deref() == Some(row.id.as_str()) {
                    state.current_id = None;
                    state.served = 0;
                }
                true
            } else {
                row.failure_count += 1;
                let deactivated = row.failure_count >= settings.max_failure_count;
                if deactivated {
                    row.is_active = false;
                }
                repo.save(&row).await?;

                if deactivated {
                    warn!(
                        target_id = %abbrev_id(&row.id),
                        failures = row.failure_count,
                        "Failure threshold reached, deactivating target"
                    );
                    if state.current_id.as_deref() == Some(row.id.as_str()) {
                        state.current_id = None;
                        state.served = 0;
                    }
                }
                false
            }
        };

        tx.commit().await.map_err(DbError::from)?;
        Ok(was_rate_limit)
    }

    /// Upsert a binding keyed on (project, location): refresh the credential,
    /// name, and daily limit of an existing target and clear its failure
    /// state, or create a new one.
    #[instrument(skip(self, spec), fields(project_id = %spec.project_id, location = %spec.location), err)]
    pub async fn add_or_reactivate(&self, spec: &TargetUpsert) -> Result<Target> {
        let _state = self.state.lock().await;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let target = {
            let mut repo = Targets::new(&mut *tx);
            match repo.find_by_binding(&spec.project_id, &spec.location).await? {
                Some(mut existing) => {
                    existing.name = spec.name.clone().or(existing.name);
                    existing.service_account_key_json = spec.service_account_key_json.clone();
                    existing.daily_rate_limit = spec.daily_rate_limit;
                    existing.failure_count = 0;
                    existing.is_active = true;
                    existing.rate_limit_reset_at = None;
                    existing.is_disabled_by_rate_limit = false;
                    repo.save(&existing).await?;
                    info!(target_id = %abbrev_id(&existing.id), "Reactivated existing target binding");
                    existing
                }
                None => {
                    let created = repo
                        .create(&TargetCreate {
                            name: spec.name.clone(),
                            project_id: spec.project_id.clone(),
                            location: spec.location.clone(),
                            service_account_key_json: spec.service_account_key_json.clone(),
                            daily_rate_limit: spec.daily_rate_limit,
                        })
                        .await?;
                    info!(target_id = %abbrev_id(&created.id), "Created new target binding");
                    created
                }
            }
        };

        tx.commit().await.map_err(DbError::from)?;
        Ok(target)
    }
}
