use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pg_db_template::{DriverError, MigrationRunner};
use sqlx::migrate::Migrator;
use tracing::info;

use crate::Result;
use crate::connection::PgDatabaseConnection;

/// Runs a sqlx [`Migrator`] against the template database.
///
/// The `_sqlx_migrations` bookkeeping table is created in the template and so
/// is present, already up to date, in every test database cloned from it.
#[derive(Debug, Clone)]
pub struct SqlxMigrationRunner {
   migrator: Arc<Migrator>,
}

impl SqlxMigrationRunner {
   pub fn new(migrator: Migrator) -> Self {
      Self {
         migrator: Arc::new(migrator),
      }
   }

   /// Share a migrator that is also used elsewhere, e.g. one built with `sqlx::migrate!()`.
   pub fn from_shared(migrator: Arc<Migrator>) -> Self {
      Self { migrator }
   }

   /// Load migrations from a directory at runtime.
   pub async fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
      let migrator = Migrator::new(dir.as_ref()).await?;
      Ok(Self::new(migrator))
   }

   pub fn migrator(&self) -> &Migrator {
      &self.migrator
   }
}

#[async_trait]
impl MigrationRunner<PgDatabaseConnection> for SqlxMigrationRunner {
   async fn run_migrations(&self, conn: &PgDatabaseConnection) -> std::result::Result<(), DriverError> {
      self
         .migrator
         .run(conn.pool())
         .await
         .map_err(|e| Box::new(crate::Error::Migration(e)) as DriverError)?;
      info!(
         database = %conn.database(),
         migrations = self.migrator.iter().count(),
         "Migrations applied"
      );
      Ok(())
   }
}
