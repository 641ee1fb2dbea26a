//! Error taxonomy and HTTP response conversion.
//!
//! Every failure a dispatch can produce (client-side validation, upstream
//! Vertex errors in their three shapes of HTTP status, google.rpc status
//! code, and ad-hoc message text, credential problems, pool exhaustion) is
//! classified into one [`Error`] variant. The variant determines the HTTP
//! status, the wire `type` string, and whether the dispatcher may fail over
//! to another target. Classification lives here and nowhere else.
//!
//! User-visible failures always take the shape:
//!
//! ```json
//! {"error": {"message": "...", "type": "rate_limit_error"}}
//! ```

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error as ThisError;

use crate::db::errors::DbError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Body unparseable, bad or missing `model`, or upstream INVALID_ARGUMENT
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Master bearer mismatch, or upstream PERMISSION_DENIED / UNAUTHENTICATED
    #[error("{message}")]
    Authentication { message: String, forbidden: bool },

    /// Upstream NOT_FOUND (unknown model or publisher path)
    #[error("{message}")]
    NotFound { message: String },

    /// Upstream ABORTED; transient, the call may be replayed elsewhere
    #[error("{message}")]
    Conflict { message: String },

    /// Upstream RESOURCE_EXHAUSTED, HTTP 429, or quota-flavored message text.
    /// `reset_at` carries the server-supplied cooldown end when one was given.
    #[error("{message}")]
    RateLimit {
        message: String,
        reset_at: Option<DateTime<Utc>>,
    },

    /// Upstream INTERNAL
    #[error("{message}")]
    UpstreamServer { message: String },

    /// Upstream UNAVAILABLE
    #[error("{message}")]
    UpstreamUnavailable { message: String },

    /// Upstream replied with something this proxy could not parse
    #[error("{message}")]
    UpstreamResponse { message: String },

    /// Service-account key missing or malformed; no point retrying the target
    #[error("{message}")]
    Configuration { message: String },

    /// The target manager found no eligible target
    #[error("No targets available to serve the request")]
    NoTargetsAvailable,

    /// Upstream failure that matched no classification rule
    #[error("{message}")]
    UnknownUpstream { message: String },

    /// Terminal marker once the retry budget is spent
    #[error("{message}")]
    MaxRetriesExceeded { message: String },

    /// Persistence failure surfaced through the dispatch path
    #[error(transparent)]
    Database(#[from] DbError),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Authentication { forbidden: false, .. } => StatusCode::UNAUTHORIZED,
            Error::Authentication { forbidden: true, .. } => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamServer { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoTargetsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownUpstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::MaxRetriesExceeded { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The wire `type` string; also recorded as `error_type` in request logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidRequest { .. } => "invalid_request_error",
            Error::Authentication { .. } => "authentication_error",
            Error::NotFound { .. } => "not_found_error",
            Error::Conflict { .. } => "conflict_error",
            Error::RateLimit { .. } => "rate_limit_error",
            Error::UpstreamServer { .. } => "upstream_server_error",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable_error",
            Error::UpstreamResponse { .. } => "upstream_response_error",
            Error::Configuration { .. } => "configuration_error",
            Error::NoTargetsAvailable => "no_targets_available",
            Error::UnknownUpstream { .. } => "upstream_error",
            Error::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Error::Database(_) => "internal_error",
        }
    }

    /// Whether the dispatcher may fail over to another target after this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::RateLimit { .. }
                | Error::UpstreamServer { .. }
                | Error::UpstreamUnavailable { .. }
                | Error::UpstreamResponse { .. }
                | Error::UnknownUpstream { .. }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimit { .. })
    }

    /// Server-supplied cooldown end for rate-limit errors, when present.
    pub fn rate_limit_reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::RateLimit { reset_at, .. } => *reset_at,
            _ => None,
        }
    }

    /// Message stored in request logs; same text the client sees.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// The raw facts extracted from a failed upstream exchange, before
/// classification. The Vertex API reports failures as an HTTP status plus a
/// `google.rpc.Status` body carrying a numeric code and message; any of the
/// three may be missing or garbled.
#[derive(Debug, Clone, Default)]
pub struct UpstreamFailure {
    pub http_status: Option<u16>,
    pub code: Option<i64>,
    pub message: String,
    /// Parsed from a `Retry-After` header or `google.rpc.RetryInfo` detail.
    pub retry_after: Option<std::time::Duration>,
}

impl From<UpstreamFailure> for Error {
    fn from(failure: UpstreamFailure) -> Self {
        let message = if failure.message.is_empty() {
            match failure.http_status {
                Some(status) => format!("Upstream request failed with status {status}"),
                None => "Upstream request failed".to_string(),
            }
        } else {
            failure.message
        };

        // Rate limits first: RESOURCE_EXHAUSTED, HTTP 429, or quota-flavored
        // message text all mean the target needs a cooldown.
        if failure.code == Some(8)
            || failure.http_status == Some(429)
            || message.to_ascii_lowercase().contains("quota")
        {
            let reset_at = failure
                .retry_after
                .map(|delay| Utc::now() + Duration::milliseconds(delay.as_millis() as i64));
            return Error::RateLimit { message, reset_at };
        }

        match failure.code {
            Some(3) => Error::InvalidRequest { message },
            Some(5) => Error::NotFound { message },
            Some(7) => Error::Authentication { message, forbidden: true },
            Some(16) => Error::Authentication { message, forbidden: false },
            Some(10) => Error::Conflict { message },
            Some(13) => Error::UpstreamServer { message },
            Some(14) => Error::UpstreamUnavailable { message },
            _ => match failure.http_status {
                Some(400) => Error::InvalidRequest { message },
                Some(401) => Error::Authentication { message, forbidden: false },
                Some(403) => Error::Authentication { message, forbidden: true },
                Some(404) => Error::NotFound { message },
                Some(409) => Error::Conflict { message },
                Some(500) => Error::UpstreamServer { message },
                Some(503) => Error::UpstreamUnavailable { message },
                _ => Error::UnknownUpstream { message },
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(_) | Error::UpstreamServer { .. } | Error::UnknownUpstream { .. } => {
                tracing::error!("Dispatch error: {:#}", self);
            }
            Error::UpstreamUnavailable { .. }
            | Error::UpstreamResponse { .. }
            | Error::Configuration { .. }
            | Error::NoTargetsAvailable
            | Error::MaxRetriesExceeded { .. }
            | Error::Conflict { .. } => {
                tracing::warn!("Dispatch error: {}", self);
            }
            Error::RateLimit { .. } | Error::Authentication { .. } => {
                tracing::info!("Dispatch error: {}", self);
            }
            Error::InvalidRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let body = json!({
            "error": {
                "message": self.user_message(),
                "type": self.error_type(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Type alias for dispatch operation results
pub type Result<T> = std::result::Result<T, Error>;
