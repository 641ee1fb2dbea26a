//! `POST /v1/chat/completions`: the per-request dispatch pipeline.
//!
//! Each request walks the same machine: validate, acquire a target, build a
//! Vertex client from the target's credential, translate, call upstream, and
//! classify the outcome. Failures feed back into the target manager; when
//! the classification allows and retry budget remains, the loop re-acquires
//! and tries again. The manager cannot hand back a target it just dropped.
//! Every attempt writes one request-log record; log-sink failures are warned
//! about and never block the response.
//!
//! Retries only cover failures observed before the first upstream stream
//! byte is handed to the client. Once SSE framing starts, errors are
//! reported in-band and the response cannot be rebuilt on another target.

use std::time::Instant;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response, Sse},
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::AppState;
use crate::api::handlers::client_ip;
use crate::db::errors::DbError;
use crate::db::handlers::{AppSettings, RequestLogs};
use crate::db::models::request_logs::{RequestLogCreate, TARGET_UNAVAILABLE, TARGET_UNKNOWN};
use crate::db::models::settings::Settings;
use crate::db::models::targets::Target;
use crate::errors::{Error, Result};
use crate::openai::{ChatCompletionRequest, Usage};
use crate::translate;
use crate::vertex::{ServiceAccountKey, VertexClient};

/// Per-request identity woven into every log record.
struct RequestContext {
    request_id: String,
    started: Instant,
    ip_address: Option<String>,
    requested_model: String,
    is_streaming: bool,
}

impl RequestContext {
    fn new(headers: &HeaderMap, request: &ChatCompletionRequest) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            ip_address: client_ip(headers),
            requested_model: request.model.clone(),
            is_streaming: request.stream,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

#[instrument(skip_all)]
pub async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    // Master-credential check. Mismatches produce no request log: the
    // request never bound to a target.
    if let Err(error) = check_master_key(&state, &headers) {
        return error.into_response();
    }

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Error::InvalidRequest {
                message: format!("Request body is not valid JSON: {e}"),
            }
            .into_response();
        }
    };
    if !parsed.get("model").is_some_and(|model| model.is_string()) {
        return Error::InvalidRequest {
            message: "Request must carry a string `model` field".to_string(),
        }
        .into_response();
    }
    let request: ChatCompletionRequest = match serde_json::from_value(parsed) {
        Ok(request) => request,
        Err(e) => {
            return Error::InvalidRequest {
                message: format!("Request body does not match the chat-completion shape: {e}"),
            }
            .into_response();
        }
    };

    let ctx = RequestContext::new(&headers, &request);
    dispatch(&state, &ctx, &request).await
}

fn check_master_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(master_key) = &state.config.master_key else {
        return Ok(());
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if bearer == Some(master_key.as_str()) {
        Ok(())
    } else {
        Err(Error::Authentication {
            message: "Unauthorized".to_string(),
            forbidden: false,
        })
    }
}

/// The retry/failover loop. `retries` counts completed failed attempts that
/// were answered with another acquisition.
async fn dispatch(state: &AppState, ctx: &RequestContext, request: &ChatCompletionRequest) -> Response {
    let settings = match read_settings(state).await {
        Ok(settings) => settings,
        Err(error) => return error.into_response(),
    };

    let mut retries: i64 = 0;

    loop {
        let target = match state.manager.acquire(&settings).await {
            Ok(target) => target,
            Err(error) => {
                let sentinel = match &error {
                    Error::NoTargetsAvailable => TARGET_UNAVAILABLE,
                    _ => TARGET_UNKNOWN,
                };
                append_log(state, error_record(ctx, sentinel, &error)).await;
                return error.into_response();
            }
        };

        let error = match attempt(state, ctx, request, &target).await {
            Ok(response) => return response,
            Err(error) => error,
        };

        // Credential faults never reached upstream and persistence faults
        // must not masquerade as target failures; neither feeds the
        // failure counters.
        if !matches!(error, Error::Configuration { .. } | Error::Database(_)) {
            if let Err(persist_error) = state.manager.mark_error(&target, &error, &settings).await {
                append_log(state, error_record(ctx, &target.id, &persist_error)).await;
                return persist_error.into_response();
            }
        }
        append_log(state, error_record(ctx, &target.id, &error)).await;

        if error.is_retryable() && retries < settings.max_retries {
            retries += 1;
            let delay = if error.is_rate_limit() {
                std::time::Duration::from_secs(settings.failover_delay_secs as u64)
            } else {
                std::time::Duration::from_millis(500).saturating_mul(retries as u32)
            };
            debug!(
                request_id = %ctx.request_id,
                retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying dispatch on a fresh target"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            continue;
        }

        if error.is_retryable() {
            // Retries ran out without a more specific terminal error.
            let terminal = Error::MaxRetriesExceeded {
                message: format!(
                    "Dispatch failed after {} attempts; last error: {}",
                    retries + 1,
                    error.user_message()
                ),
            };
            append_log(state, error_record(ctx, &target.id, &terminal)).await;
            return terminal.into_response();
        }

        return error.into_response();
    }
}

/// One dispatch attempt against one target. Success marks the target and
/// writes the log before the response body is produced.
async fn attempt(state: &AppState, ctx: &RequestContext, request: &ChatCompletionRequest, target: &Target) -> Result<Response> {
    let key = ServiceAccountKey::parse(&target.service_account_key_json)?;
    let client = VertexClient::new(
        state.http.clone(),
        key,
        &target.project_id,
        &target.location,
        &ctx.requested_model,
        state.config.vertex_base_url.as_ref(),
    );

    let vertex_request = translate::to_vertex_request(request);

    if request.stream {
        let upstream = client.stream_generate(&vertex_request).await?;
        state.manager.mark_success(target).await?;
        append_log(state, success_record(ctx, target, None)).await;

        let frames = translate::stream_frames(upstream, ctx.requested_model.clone());
        let mut response = Sse::new(translate::frames_to_events(frames)).into_response();
        let response_headers = response.headers_mut();
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        Ok(response)
    } else {
        let vertex_response = client.generate(&vertex_request).await?;
        state.manager.mark_success(target).await?;

        let completion = translate::to_openai_completion(&vertex_response, &ctx.requested_model);
        append_log(state, success_record(ctx, target, Some(&completion.usage))).await;
        Ok(Json(completion).into_response())
    }
}

async fn read_settings(state: &AppState) -> Result<Settings> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    Ok(AppSettings::new(&mut conn).get().await?)
}

fn success_record(ctx: &RequestContext, target: &Target, usage: Option<&Usage>) -> RequestLogCreate {
    RequestLogCreate {
        request_id: ctx.request_id.clone(),
        target_id: target.id.clone(),
        requested_model: ctx.requested_model.clone(),
        model_used: Some(ctx.requested_model.clone()),
        is_streaming: ctx.is_streaming,
        status_code: 200,
        is_error: false,
        error_type: None,
        error_message: None,
        response_time_ms: ctx.elapsed_ms(),
        ip_address: ctx.ip_address.clone(),
        prompt_tokens: usage.map(|usage| usage.prompt_tokens),
        completion_tokens: usage.map(|usage| usage.completion_tokens),
        total_tokens: usage.map(|usage| usage.total_tokens),
    }
}

fn error_record(ctx: &RequestContext, target_id: &str, error: &Error) -> RequestLogCreate {
    RequestLogCreate {
        request_id: ctx.request_id.clone(),
        target_id: target_id.to_string(),
        requested_model: ctx.requested_model.clone(),
        model_used: None,
        is_streaming: ctx.is_streaming,
        status_code: error.status_code().as_u16() as i64,
        is_error: true,
        error_type: Some(error.error_type().to_string()),
        error_message: Some(error.user_message()),
        response_time_ms: ctx.elapsed_ms(),
        ip_address: ctx.ip_address.clone(),
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
    }
}

/// Append to the log sink; a sink failure is logged and never blocks the
/// response.
async fn append_log(state: &AppState, record: RequestLogCreate) {
    let result: crate::db::errors::Result<()> = async {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        RequestLogs::new(&mut conn).append(&record).await
    }
    .await;

    if let Err(error) = result {
        warn!(request_id = %record.request_id, error = %error, "Failed to append request log");
    }
}

#[cfg(test)]
mod tests {
    use crate::db::handlers::{RequestLogs, Targets};
    use crate::db::models::request_logs::{RequestLog, TARGET_UNAVAILABLE};
    use crate::test_utils::{
        mock_token_endpoint, seed_target, set_settings, test_app_with_pool, vertex_path, vertex_stream_path,
    };
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use sqlx::SqlitePool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "gemini-2.0-flash";

    fn chat_body(stream: bool) -> Value {
        json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream,
        })
    }

    fn ok_vertex_body(text: &str) -> Value {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4}
        })
    }

    fn rate_limit_body() -> Value {
        json!({
            "error": {"code": 8, "message": "Resource exhausted", "status": "RESOURCE_EXHAUSTED"}
        })
    }

    async fn all_logs(pool: &SqlitePool) -> Vec<RequestLog> {
        let mut conn = pool.acquire().await.unwrap();
        RequestLogs::new(&mut conn).list_recent(100).await.unwrap()
    }

    #[tokio::test]
    async fn single_target_unary_success() {
        let upstream = MockServer::start().await;
        mock_token_endpoint(&upstream).await;
        Mock::given(method("POST"))
            .and(path(vertex_path("proj-a", MODEL)))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_vertex_body("ok")))
            .mount(&upstream)
            .await;

        let (server, state, pool) = test_app_with_pool(Some(&upstream.uri()), None).await;
        let target = seed_target(&state, &upstream.uri(), "proj-a").await;

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::OK);

        let body: Value = response.json();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], MODEL);
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 4);

        // Usage counters moved by exactly one.
        let mut conn = pool.acquire().await.unwrap();
        let row = Targets::new(&mut conn).get_by_id(&target.id).await.unwrap().unwrap();
        assert_eq!(row.request_count, 1);
        assert_eq!(row.daily_requests_used, 1);
        drop(conn);

        let logs = all_logs(&pool).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, 200);
        assert!(!logs[0].is_error);
        assert_eq!(logs[0].total_tokens, Some(4));
        assert_eq!(logs[0].model_used.as_deref(), Some(MODEL));
    }

    #[tokio::test]
    async fn rate_limited_target_fails_over() {
        let upstream = MockServer::start().await;
        mock_token_endpoint(&upstream).await;
        Mock::given(method("POST"))
            .and(path(vertex_path("proj-a", MODEL)))
            .respond_with(ResponseTemplate::new(429).set_body_json(rate_limit_body()))
            .mount(&upstream)
            .await;
        Mock::given(method("POST"))
            .and(path(vertex_path("proj-b", MODEL)))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_vertex_body("from-b")))
            .mount(&upstream)
            .await;

        let (server, state, pool) = test_app_with_pool(Some(&upstream.uri()), None).await;
        set_settings(&pool, |settings| settings.failover_delay_secs = 0).await;
        let a = seed_target(&state, &upstream.uri(), "proj-a").await;
        let b = seed_target(&state, &upstream.uri(), "proj-b").await;

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["choices"][0]["message"]["content"], "from-b");

        // A cooled down, B served.
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Targets::new(&mut conn);
        let row_a = repo.get_by_id(&a.id).await.unwrap().unwrap();
        assert!(row_a.rate_limit_reset_at.is_some());
        assert_eq!(row_a.failure_count, 0);
        let row_b = repo.get_by_id(&b.id).await.unwrap().unwrap();
        assert_eq!(row_b.request_count, 1);
        drop(conn);

        let logs = all_logs(&pool).await;
        assert_eq!(logs.len(), 2);
        let statuses: Vec<i64> = logs.iter().map(|log| log.status_code).collect();
        assert!(statuses.contains(&429));
        assert!(statuses.contains(&200));
        let failed = logs.iter().find(|log| log.is_error).unwrap();
        assert_eq!(failed.target_id, a.id);
        assert_eq!(failed.error_type.as_deref(), Some("rate_limit_error"));
    }

    #[tokio::test]
    async fn streaming_translates_to_openai_sse() {
        let upstream = MockServer::start().await;
        mock_token_endpoint(&upstream).await;

        let sse_body = concat!(
            "data: {\"candidates\": [{\"content\": {\"role\": \"model\", \"parts\": [{\"text\": \"ans\"}]}}]}\n\n",
            "data: {\"candidates\": [{\"finishReason\": \"STOP\"}], ",
            "\"usageMetadata\": {\"promptTokenCount\": 3, \"candidatesTokenCount\": 1, \"totalTokenCount\": 4}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path(vertex_stream_path("proj-a", MODEL)))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
            .mount(&upstream)
            .await;

        let (server, state, pool) = test_app_with_pool(Some(&upstream.uri()), None).await;
        let target = seed_target(&state, &upstream.uri(), "proj-a").await;

        let response = server.post("/v1/chat/completions").json(&chat_body(true)).await;
        response.assert_status(StatusCode::OK);
        assert!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let text = response.text();
        let frames: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(frames.len(), 3);

        let first: Value = serde_json::from_str(frames[0]).unwrap();
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["content"], "ans");
        assert_eq!(first["choices"][0]["finish_reason"], Value::Null);

        let second: Value = serde_json::from_str(frames[1]).unwrap();
        assert_eq!(second["choices"][0]["delta"], json!({}));
        assert_eq!(second["choices"][0]["finish_reason"], "stop");
        assert_eq!(second["usage"]["prompt_tokens"], 3);
        assert_eq!(second["usage"]["total_tokens"], 4);
        assert_eq!(second["id"], first["id"]);

        assert_eq!(frames[2], "[DONE]");

        // The streaming success was logged and counted at stream start.
        let logs = all_logs(&pool).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_streaming);
        assert_eq!(logs[0].status_code, 200);

        let mut conn = pool.acquire().await.unwrap();
        let row = Targets::new(&mut conn).get_by_id(&target.id).await.unwrap().unwrap();
        assert_eq!(row.request_count, 1);
    }

    #[tokio::test]
    async fn mismatched_master_key_is_unauthorized_and_unlogged() {
        let (server, _state, pool) = test_app_with_pool(None, Some("sk-master")).await;

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"]["message"], "Unauthorized");
        assert_eq!(body["error"]["type"], "authentication_error");

        let response = server
            .post("/v1/chat/completions")
            .authorization_bearer("wrong")
            .json(&chat_body(false))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        assert!(all_logs(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn matching_master_key_passes_through() {
        let upstream = MockServer::start().await;
        mock_token_endpoint(&upstream).await;
        Mock::given(method("POST"))
            .and(path(vertex_path("proj-a", MODEL)))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_vertex_body("ok")))
            .mount(&upstream)
            .await;

        let (server, state, _pool) = test_app_with_pool(Some(&upstream.uri()), Some("sk-master")).await;
        seed_target(&state, &upstream.uri(), "proj-a").await;

        let response = server
            .post("/v1/chat/completions")
            .authorization_bearer("sk-master")
            .json(&chat_body(false))
            .await;
        response.assert_status(StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_json_and_missing_model_are_bad_requests() {
        let (server, _state, pool) = test_app_with_pool(None, None).await;

        let response = server
            .post("/v1/chat/completions")
            .content_type("application/json")
            .text("{not json")
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "invalid_request_error");

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": 42, "messages": []}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        // Validation failures never bound to a target, so nothing is logged.
        assert!(all_logs(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn empty_pool_is_service_unavailable_with_sentinel_log() {
        let (server, _state, pool) = test_app_with_pool(None, None).await;

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "no_targets_available");

        let logs = all_logs(&pool).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].target_id, TARGET_UNAVAILABLE);
        assert_eq!(logs[0].status_code, 503);
    }

    #[tokio::test]
    async fn non_retryable_upstream_error_fails_immediately() {
        let upstream = MockServer::start().await;
        mock_token_endpoint(&upstream).await;
        Mock::given(method("POST"))
            .and(path(vertex_path("proj-a", MODEL)))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": 3, "message": "Invalid request content", "status": "INVALID_ARGUMENT"}
            })))
            .mount(&upstream)
            .await;

        let (server, state, pool) = test_app_with_pool(Some(&upstream.uri()), None).await;
        let target = seed_target(&state, &upstream.uri(), "proj-a").await;

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "invalid_request_error");

        // One attempt, one log, one failure counted.
        assert_eq!(all_logs(&pool).await.len(), 1);
        let mut conn = pool.acquire().await.unwrap();
        let row = Targets::new(&mut conn).get_by_id(&target.id).await.unwrap().unwrap();
        assert_eq!(row.failure_count, 1);
        assert!(row.is_active);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_max_retries_exceeded() {
        let upstream = MockServer::start().await;
        mock_token_endpoint(&upstream).await;
        Mock::given(method("POST"))
            .and(path(vertex_path("proj-a", MODEL)))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": {"code": 14, "message": "Service unavailable", "status": "UNAVAILABLE"}
            })))
            .mount(&upstream)
            .await;

        let (server, state, pool) = test_app_with_pool(Some(&upstream.uri()), None).await;
        set_settings(&pool, |settings| settings.max_retries = 0).await;
        seed_target(&state, &upstream.uri(), "proj-a").await;

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "max_retries_exceeded");

        // The attempt log and the terminal record.
        let logs = all_logs(&pool).await;
        assert_eq!(logs.len(), 2);
        let types: Vec<&str> = logs.iter().filter_map(|log| log.error_type.as_deref()).collect();
        assert!(types.contains(&"upstream_unavailable_error"));
        assert!(types.contains(&"max_retries_exceeded"));
    }

    #[tokio::test]
    async fn broken_credential_is_a_configuration_error() {
        let (server, state, pool) = test_app_with_pool(None, None).await;
        // Seed a target whose stored credential is junk.
        state
            .manager
            .add_or_reactivate(&crate::db::models::targets::TargetUpsert {
                name: None,
                project_id: "proj-a".to_string(),
                location: "us-central1".to_string(),
                service_account_key_json: r#"{"client_email": "", "private_key": ""}"#.to_string(),
                daily_rate_limit: None,
            })
            .await
            .unwrap();

        let response = server.post("/v1/chat/completions").json(&chat_body(false)).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "configuration_error");

        // No upstream call was made; the failure counter stays untouched.
        let mut conn = pool.acquire().await.unwrap();
        let rows = Targets::new(&mut conn).list_all().await.unwrap();
        assert_eq!(rows[0].failure_count, 0);
    }
}
