//! Vertex AI upstream: wire types, service-account auth, and the HTTP client.

pub mod auth;
pub mod client;
pub mod types;

pub use auth::ServiceAccountKey;
pub use client::VertexClient;
