//! sqlx PostgreSQL driver for `pg-db-template`.
//!
//! - [`PgConnectionProvider`]: opens a pinged [`PgPool`](sqlx::PgPool) per database
//! - [`PgDatabaseConnection`]: pooled connection; JSON parameter binding and row decoding
//! - [`SqlxMigrationRunner`]: runs a sqlx [`Migrator`] against the template
//! - [`PgPoolConfig`]: pool limits applied to every connection
//!
//! # Example
//!
//! ```no_run
//! use pg_db_template::{TemplateConfig, TemplateManager};
//! use pg_db_template_sqlx::{PgConnectionProvider, SqlxMigrationRunner};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = PgConnectionProvider::from_url(&std::env::var("POSTGRES_CONNECTION_STRING")?)?;
//! let runner = SqlxMigrationRunner::from_dir("./migrations").await?;
//! let manager = TemplateManager::new(TemplateConfig::new("app_template"), provider, runner)?;
//!
//! manager.initialize().await?;
//!
//! let db = manager.create_test_database().await?;
//! let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
//!    .fetch_one(db.pool())
//!    .await?;
//! assert_eq!(count, 0);
//!
//! manager.drop_test_database(db.name()).await?;
//! manager.cleanup().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
pub mod decode;
mod error;
mod migrate;
mod provider;

pub use config::PgPoolConfig;
pub use connection::PgDatabaseConnection;
pub use error::{Error, Result};
pub use migrate::SqlxMigrationRunner;
pub use provider::PgConnectionProvider;

// Re-export sqlx migrate types for convenience
pub use sqlx::migrate::Migrator;
