//! HTTP surface: the OpenAI-compatible proxy endpoints.
//!
//! - `POST /v1/chat/completions`: the dispatch pipeline ([`handlers::chat_completions`])
//! - `GET /v1/models`: active targets rendered as a model list ([`handlers::models`])

pub mod handlers;
