//! `GET /v1/models`: the active target pool rendered as an OpenAI model list.

use axum::{Json, extract::State};

use crate::AppState;
use crate::db::errors::DbError;
use crate::db::handlers::Targets;
use crate::errors::{Error, Result};
use crate::openai::ModelList;

#[tracing::instrument(skip_all)]
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let active = Targets::new(&mut conn).list_active().await?;

    if active.is_empty() {
        return Err(Error::NoTargetsAvailable);
    }

    Ok(Json(ModelList::new(
        active.iter().map(|target| target.display_name().to_string()),
    )))
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{insert_target, test_app_with_pool};
    use axum::http::StatusCode;
    use serde_json::Value;

    #[tokio::test]
    async fn empty_pool_is_service_unavailable() {
        let (server, _state, _pool) = test_app_with_pool(None, None).await;

        let response = server.get("/v1/models").await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "no_targets_available");
    }

    #[tokio::test]
    async fn active_targets_become_model_entries() {
        let (server, _state, pool) = test_app_with_pool(None, None).await;
        insert_target(&pool, "proj-a", |t| t.name = Some("primary".to_string())).await;
        let unnamed = insert_target(&pool, "proj-b", |_| {}).await;
        insert_target(&pool, "proj-c", |t| t.is_active = false).await;

        let response = server.get("/v1/models").await;
        response.assert_status(StatusCode::OK);

        let body: Value = response.json();
        assert_eq!(body["object"], "list");
        let entries = body["data"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["id"], "primary");
        assert_eq!(entries[0]["object"], "model");
        assert_eq!(entries[1]["id"], unnamed.id.as_str());
    }
}
