//! Database layer for data persistence and access.
//!
//! This module implements the data access layer using SQLx over SQLite,
//! following the repository pattern: one repository per entity, constructed
//! from a connection or transaction owned by the caller.
//!
//! # Modules
//!
//! - [`handlers`]: Repository implementations for target, log, and settings access
//! - [`models`]: Database record structures matching table schemas
//! - [`errors`]: Database-specific error types
//!
//! Repositories never begin transactions themselves. Multi-row steps that must
//! be observable as a single state change (the daily-reset sweep in
//! particular) run inside a transaction begun by the caller:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let mut targets = Targets::new(&mut tx);
//! targets.bulk_update(&swept).await?;
//! tx.commit().await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod models;
