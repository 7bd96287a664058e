//! # pg-db-template
//!
//! Fast, isolated PostgreSQL test databases cloned from a migrated template.
//!
//! Running migrations for every test is slow. Instead, [`TemplateManager`] creates
//! one template database, migrates it once, and then hands out test databases made
//! with `CREATE DATABASE ... TEMPLATE ...`, which copies the schema and data at the
//! file level.
//!
//! ## Core Types
//!
//! - **[`TemplateManager`]**: Owns the template and every test database cloned from it
//! - **[`TemplateConfig`]**: Template name, test database prefix, retry and timeout settings
//! - **[`ConnectionProvider`]** / **[`DatabaseConnection`]**: What the manager needs from a driver
//! - **[`MigrationRunner`]**: Applies the schema to the template
//! - **[`Error`]**: Error type for every operation
//!
//! The `pg-db-template-sqlx` crate implements the driver traits on top of sqlx.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --initialize()--> Ready --cleanup()--> Uninitialized
//!                                   |
//!                   create_test_database() / drop_test_database()
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use pg_db_template::{
//!    ConnectionProvider, DatabaseConnection, StatementMigrationRunner, TemplateConfig,
//!    TemplateManager,
//! };
//!
//! # async fn example<P: ConnectionProvider>(provider: P) -> pg_db_template::Result<()> {
//! let runner = StatementMigrationRunner::new([
//!    "CREATE TABLE users (id SERIAL PRIMARY KEY, email TEXT UNIQUE NOT NULL)",
//! ]);
//! let manager = TemplateManager::new(TemplateConfig::new("app_template"), provider, runner)?;
//! manager.initialize().await?;
//!
//! // Each test gets its own database with the schema already in place
//! let db = manager.create_test_database().await?;
//! db.execute("INSERT INTO users (email) VALUES ($1)", &[serde_json::json!("a@example.com")])
//!    .await
//!    .map_err(|e| pg_db_template::Error::Configuration(e.to_string()))?;
//!
//! let (conn, name) = db.into_parts();
//! let _ = conn.close().await;
//! manager.drop_test_database(&name).await?;
//!
//! manager.cleanup().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! - All methods take `&self`; clone the manager to share it across tasks
//! - Test databases get distinct names from a per-manager counter plus a random nonce
//! - CREATE/DROP DATABASE contention (SQLSTATE `55006`, `55P03`, `40P01`) is retried with backoff
//! - Dropping an operation's future mid-flight never loses track of a database that may exist
//! - `cleanup()` waits for creates already in flight and drops at most `cleanup_concurrency` databases at once

mod config;
mod connection;
mod error;
mod manager;
mod naming;
mod retry;
mod state;

pub use config::{RetryConfig, TemplateConfig};
pub use connection::{
   ConnectionProvider, DatabaseConnection, MigrationRunner, Row, StatementMigrationRunner,
};
pub use error::{CleanupFailure, DriverError, Error, Operation, Result, SqlStateError};
pub use manager::{TemplateManager, TestDatabase};
pub use naming::{MAX_IDENTIFIER_LEN, NameGenerator, quote_identifier};
pub use retry::CONTENTION_SQLSTATES;
pub use state::Lifecycle;
