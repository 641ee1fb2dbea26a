//! Append-only repository for dispatch outcome logs.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::Result;
use crate::db::models::request_logs::{RequestLog, RequestLogCreate};

pub struct RequestLogs<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> RequestLogs<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// Append one outcome record. Rows are write-once; nothing updates them.
    #[instrument(skip(self, record), fields(request_id = %record.request_id, status = record.status_code), err)]
    pub async fn append(&mut self, record: &RequestLogCreate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request_logs (
                id, request_id, target_id, timestamp, requested_model, model_used,
                is_streaming, status_code, is_error, error_type, error_message,
                response_time_ms, ip_address, prompt_tokens, completion_tokens, total_tokens
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.request_id)
        .bind(&record.target_id)
        .bind(Utc::now())
        .bind(&record.requested_model)
        .bind(&record.model_used)
        .bind(record.is_streaming)
        .bind(record.status_code)
        .bind(record.is_error)
        .bind(&record.error_type)
        .bind(&record.error_message)
        .bind(record.response_time_ms)
        .bind(&record.ip_address)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    /// All records sharing a correlation key, oldest first.
    #[instrument(skip(self), err)]
    pub async fn list_for_request(&mut self, request_id: &str) -> Result<Vec<RequestLog>> {
        let logs = sqlx::query_as::<_, RequestLog>(
            "SELECT * FROM request_logs WHERE request_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(request_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(logs)
    }

    #[instrument(skip(self), err)]
    pub async fn list_recent(&mut self, limit: i64) -> Result<Vec<RequestLog>> {
        let logs = sqlx::query_as::<_, RequestLog>("SELECT * FROM request_logs ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::request_logs::TARGET_UNAVAILABLE;
    use crate::test_utils::test_pool;

    fn record(request_id: &str, status: i64) -> RequestLogCreate {
        RequestLogCreate {
            request_id: request_id.to_string(),
            target_id: "t-1".to_string(),
            requested_model: "gemini-2.0-flash".to_string(),
            model_used: Some("gemini-2.0-flash".to_string()),
            is_streaming: false,
            status_code: status,
            is_error: status >= 400,
            error_type: (status >= 400).then(|| "rate_limit_error".to_string()),
            error_message: (status >= 400).then(|| "quota exceeded".to_string()),
            response_time_ms: 12,
            ip_address: Some("203.0.113.9".to_string()),
            prompt_tokens: Some(3),
            completion_tokens: Some(1),
            total_tokens: Some(4),
        }
    }

    #[tokio::test]
    async fn append_and_list_by_request() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = RequestLogs::new(&mut conn);

        repo.append(&record("req-1", 429)).await.unwrap();
        repo.append(&record("req-1", 200)).await.unwrap();
        repo.append(&record("req-2", 200)).await.unwrap();

        let logs = repo.list_for_request("req-1").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status_code, 429);
        assert!(logs[0].is_error);
        assert_eq!(logs[0].error_type.as_deref(), Some("rate_limit_error"));
        assert_eq!(logs[1].status_code, 200);
        assert!(!logs[1].is_error);
        assert_eq!(logs[1].total_tokens, Some(4));
    }

    #[tokio::test]
    async fn sentinel_target_ids_are_accepted() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = RequestLogs::new(&mut conn);

        let mut rec = record("req-1", 503);
        rec.target_id = TARGET_UNAVAILABLE.to_string();
        repo.append(&rec).await.unwrap();

        let logs = repo.list_for_request("req-1").await.unwrap();
        assert_eq!(logs[0].target_id, TARGET_UNAVAILABLE);
    }
}
