//! Template/clone lifecycle: build one migrated template, clone it per test, tear it all down

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::config::TemplateConfig;
use crate::connection::{ConnectionProvider, DatabaseConnection, MigrationRunner};
use crate::error::{CleanupFailure, DriverError, Error, Operation, SqlStateError};
use crate::naming::{NameGenerator, ddl};
use crate::retry::retry_on_contention;
use crate::state::{ClaimGuard, CleanupGuard, CreateGuard, InitializeGuard, Lifecycle, ManagerState};

/// SQLSTATE for `CREATE DATABASE` of a name that already exists.
const DUPLICATE_DATABASE: &str = "42P04";

/// A freshly cloned test database and an open connection to it.
///
/// The caller owns the connection. Derefs to the connection so it can be used directly.
#[derive(Debug)]
pub struct TestDatabase<C> {
   name: String,
   connection: C,
}

impl<C> TestDatabase<C> {
   /// Name to pass to [`TemplateManager::drop_test_database`].
   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn connection(&self) -> &C {
      &self.connection
   }

   pub fn into_parts(self) -> (C, String) {
      (self.connection, self.name)
   }
}

impl<C> Deref for TestDatabase<C> {
   type Target = C;

   fn deref(&self) -> &Self::Target {
      &self.connection
   }
}

impl<C> DerefMut for TestDatabase<C> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.connection
   }
}

/// Creates a migrated template database once and clones isolated test databases from it.
///
/// Cloning is cheap to share: clones of a manager operate on the same template,
/// live-set and counter, so one manager can serve many concurrent tasks.
///
/// Every CREATE/DROP DATABASE runs on its own short-lived admin connection, opened
/// and closed inside the operation, because PostgreSQL refuses to drop a database
/// while any session (including an idle pooled one) is attached to it.
///
/// # Example
///
/// ```no_run
/// use pg_db_template::{
///    DatabaseConnection, ConnectionProvider, StatementMigrationRunner, TemplateConfig,
///    TemplateManager,
/// };
///
/// # async fn example<P: ConnectionProvider>(provider: P) -> pg_db_template::Result<()> {
/// let runner = StatementMigrationRunner::new(["CREATE TABLE users (id SERIAL PRIMARY KEY)"]);
/// let manager = TemplateManager::new(TemplateConfig::new("app_template"), provider, runner)?;
///
/// manager.initialize().await?;
///
/// let db = manager.create_test_database().await?;
/// // ... run a test against db.connection() ...
/// let (conn, name) = db.into_parts();
/// let _ = conn.close().await;
/// manager.drop_test_database(&name).await?;
///
/// manager.cleanup().await?;
/// # Ok(())
/// # }
/// ```
pub struct TemplateManager<P, M> {
   inner: Arc<Inner<P, M>>,
}

struct Inner<P, M> {
   config: TemplateConfig,
   names: NameGenerator,
   provider: P,
   runner: M,
   state: Arc<ManagerState>,
}

impl<P, M> Clone for TemplateManager<P, M> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<P, M> std::fmt::Debug for TemplateManager<P, M> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TemplateManager")
         .field("config", &self.inner.config)
         .field("lifecycle", &self.inner.state.lifecycle())
         .field("live_databases", &self.inner.state.live_databases())
         .finish()
   }
}

impl<P, M> TemplateManager<P, M>
where
   P: ConnectionProvider,
   M: MigrationRunner<P::Connection>,
{
   /// Create a manager. Nothing touches the server until [`initialize`](Self::initialize).
   pub fn new(config: TemplateConfig, provider: P, runner: M) -> Result<Self> {
      config.validate()?;
      let names = NameGenerator::new(config.test_db_prefix.clone());
      Ok(Self {
         inner: Arc::new(Inner {
            config,
            names,
            provider,
            runner,
            state: Arc::new(ManagerState::new()),
         }),
      })
   }

   pub fn config(&self) -> &TemplateConfig {
      &self.inner.config
   }

   pub fn template_name(&self) -> &str {
      &self.inner.config.template_name
   }

   /// Whether the template exists and test databases can be cloned.
   pub fn is_initialized(&self) -> bool {
      self.lifecycle() == Lifecycle::Ready
   }

   pub fn lifecycle(&self) -> Lifecycle {
      self.inner.state.lifecycle()
   }

   /// Sorted snapshot of the test databases this manager currently tracks.
   pub fn live_databases(&self) -> Vec<String> {
      self.inner.state.live_databases()
   }

   /// Create the template database and run the migrations against it, once.
   ///
   /// Fails with [`Error::AlreadyInitialized`] if a template is already owned (or
   /// being built) by this manager, and with [`Error::Configuration`] if a database
   /// with the template's name already exists on the server. A migration failure
   /// leaves the partially migrated template in place; drop it before retrying.
   pub async fn initialize(&self) -> Result<()> {
      let guard = InitializeGuard::begin(Arc::clone(&self.inner.state))?;
      let start = Instant::now();
      let template = self.template_name();
      let admin_db = &self.inner.config.admin_database;

      let admin = self.connect(admin_db).await?;
      let created = self.create_template(&admin, template).await;
      self.close(admin, admin_db, created).await?;
      info!(template = %template, "Template database created");

      let conn = self.connect(template).await?;
      let migrated = self
         .inner
         .runner
         .run_migrations(&conn)
         .await
         .map_err(|source| Error::Migration {
            template: template.to_string(),
            source,
         });
      if let Err(e) = &migrated {
         error!(template = %template, error = %e, "Migrations failed, template left in place");
      }
      // The template must have no attached sessions before it can be cloned.
      self.close(conn, template, migrated).await?;

      guard.complete();
      info!(
         template = %template,
         elapsed_ms = start.elapsed().as_millis() as u64,
         "Template database ready"
      );
      Ok(())
   }

   /// Clone the template into a uniquely named database and connect to it.
   ///
   /// The name is tracked only once the server confirmed the CREATE. If that
   /// confirmation never arrives because the future was dropped, a database the
   /// server did create is an orphan this manager does not know about.
   ///
   /// A `cleanup()` started meanwhile waits for the CREATE to settle, so a clone
   /// made here is always either dropped by that cleanup or still tracked.
   pub async fn create_test_database(&self) -> Result<TestDatabase<P::Connection>> {
      let create = CreateGuard::begin(Arc::clone(&self.inner.state))?;
      let name = self.inner.names.generate(create.counter())?;
      let start = Instant::now();

      self.clone_template(&name).await?;
      create.track(&name);
      debug!(
         database = %name,
         elapsed_ms = start.elapsed().as_millis() as u64,
         "Test database created"
      );

      // On failure the clone stays tracked so cleanup() still drops it.
      let connection = self.connect(&name).await?;
      drop(create);
      Ok(TestDatabase { name, connection })
   }

   /// Disconnect any sessions on `name` and drop it.
   ///
   /// Names this manager does not track (never created, or already dropped) are a
   /// no-op. Of several concurrent calls for the same name only one issues the DROP.
   /// If the drop fails the name stays tracked.
   pub async fn drop_test_database(&self, name: &str) -> Result<()> {
      if !self.inner.state.claim(name) {
         debug!(database = %name, "Not a tracked test database, nothing to drop");
         return Ok(());
      }
      let claim = ClaimGuard::new(Arc::clone(&self.inner.state), name.to_string());

      self.drop_database(name).await?;
      claim.release();
      debug!(database = %name, "Test database dropped");
      Ok(())
   }

   /// Drop every tracked test database, then the template.
   ///
   /// Creates already in flight finish first and their databases are dropped too;
   /// new creates fail with [`Error::NotInitialized`]. At most
   /// `cleanup_concurrency` drops run at once. Keeps going past individual failures and reports all of them in one
   /// [`Error::PartialCleanup`]; failed test databases stay tracked. The manager is
   /// uninitialized afterwards if the template was dropped, so `initialize()` may
   /// be called again. Calling this on an uninitialized manager is a no-op.
   pub async fn cleanup(&self) -> Result<()> {
      let Some(mut guard) = CleanupGuard::begin(Arc::clone(&self.inner.state)) else {
         debug!("Template manager not initialized, nothing to clean up");
         return Ok(());
      };
      guard.collect().await;
      let start = Instant::now();
      let template = self.template_name();
      info!(
         template = %template,
         databases = guard.names().len(),
         "Cleaning up test databases"
      );

      let drops: Vec<_> = guard
         .names()
         .iter()
         .map(|name| async move { (name, self.drop_database(name).await) })
         .collect();
      let results: Vec<_> = stream::iter(drops)
         .buffer_unordered(self.inner.config.cleanup_concurrency)
         .collect()
         .await;

      let mut failures = Vec::new();
      let mut failed_names = Vec::new();
      for (name, result) in results {
         if let Err(error) = result {
            warn!(database = %name, error = %error, "Failed to drop test database");
            failed_names.push(name.clone());
            failures.push(CleanupFailure {
               database: name.clone(),
               error,
            });
         }
      }

      let template_dropped = match self.drop_database(template).await {
         Ok(()) => true,
         Err(error) => {
            warn!(template = %template, error = %error, "Failed to drop template database");
            failures.push(CleanupFailure {
               database: template.to_string(),
               error,
            });
            false
         }
      };

      guard.finish(&failed_names, template_dropped);

      if failures.is_empty() {
         info!(
            template = %template,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cleanup complete"
         );
         Ok(())
      } else {
         warn!(failed = failures.len(), "Cleanup finished with failures");
         Err(Error::PartialCleanup { failures })
      }
   }

   async fn create_template(&self, admin: &P::Connection, template: &str) -> Result<()> {
      let params = [JsonValue::String(template.to_string())];
      let probe = self
         .bounded(
            Operation::ProbeTemplate,
            template,
            admin.query_row(ddl::DATABASE_EXISTS, &params),
         )
         .await?;
      match probe {
         Ok(_) => {
            return Err(Error::Configuration(format!(
               "template database {:?} already exists; drop it or choose another name",
               template
            )));
         }
         Err(e) if self.inner.provider.is_no_rows(&e) => {}
         Err(e) => return Err(self.engine_error(Operation::ProbeTemplate, template, e)),
      }

      let sql = ddl::create_database(template)?;
      trace!(sql = %sql, "Creating template database");
      match self.timed(Operation::CreateTemplate, template, admin.execute(&sql, &[])).await {
         Ok(_) => Ok(()),
         Err(e) if e.sqlstate() == Some(DUPLICATE_DATABASE) => Err(Error::Configuration(format!(
            "template database {:?} already exists: {}",
            template, e
         ))),
         Err(e) => Err(e),
      }
   }

   async fn clone_template(&self, name: &str) -> Result<()> {
      let admin_db = &self.inner.config.admin_database;
      let sql = ddl::create_from_template(name, self.template_name())?;
      trace!(sql = %sql, "Cloning template");

      let admin = self.connect(admin_db).await?;
      let (conn, sql) = (&admin, sql.as_str());
      let created = retry_on_contention(&self.inner.config.retry, name, move || {
         self.timed(Operation::CloneTemplate, name, conn.execute(sql, &[]))
      })
      .await
      .map(|_| ());
      self.close(admin, admin_db, created).await
   }

   async fn drop_database(&self, name: &str) -> Result<()> {
      let admin_db = &self.inner.config.admin_database;
      let sql = ddl::drop_database(name)?;
      let params = [JsonValue::String(name.to_string())];

      let admin = self.connect(admin_db).await?;
      let (conn, sql, params) = (&admin, sql.as_str(), &params);
      let dropped = retry_on_contention(&self.inner.config.retry, name, move || async move {
         let terminated = self
            .timed(
               Operation::TerminateBackends,
               name,
               conn.execute(ddl::TERMINATE_BACKENDS, params),
            )
            .await?;
         if terminated > 0 {
            debug!(database = %name, sessions = terminated, "Terminated sessions before drop");
         }
         trace!(sql = %sql, "Dropping database");
         self.timed(Operation::DropDatabase, name, conn.execute(sql, &[]))
            .await?;
         Ok::<(), Error>(())
      })
      .await;
      self.close(admin, admin_db, dropped).await
   }

   async fn connect(&self, database: &str) -> Result<P::Connection> {
      self.timed(Operation::Connect, database, self.inner.provider.connect(database))
         .await
   }

   /// Close `conn`, then report `outcome`. A close failure is only surfaced when
   /// the operation itself succeeded; otherwise the operation error wins.
   async fn close<T>(&self, conn: P::Connection, database: &str, outcome: Result<T>) -> Result<T> {
      let closed = self.timed(Operation::Close, database, conn.close()).await;
      match (outcome, closed) {
         (Ok(value), Ok(())) => Ok(value),
         (Ok(_), Err(e)) => Err(e),
         (Err(e), Ok(())) => Err(e),
         (Err(e), Err(close_err)) => {
            warn!(database = %database, error = %close_err, "Failed to close connection after error");
            Err(e)
         }
      }
   }

   /// Run an engine round-trip and map its driver error.
   async fn timed<T, F>(&self, operation: Operation, database: &str, fut: F) -> Result<T>
   where
      F: Future<Output = std::result::Result<T, DriverError>>,
   {
      self.bounded(operation, database, fut)
         .await?
         .map_err(|e| self.engine_error(operation, database, e))
   }

   /// Run an engine round-trip under the configured timeout, leaving its driver error untouched.
   async fn bounded<T, F>(
      &self,
      operation: Operation,
      database: &str,
      fut: F,
   ) -> Result<std::result::Result<T, DriverError>>
   where
      F: Future<Output = std::result::Result<T, DriverError>>,
   {
      match self.inner.config.operation_timeout() {
         Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout {
               operation,
               database: database.to_string(),
            }),
         None => Ok(fut.await),
      }
   }

   fn engine_error(&self, operation: Operation, database: &str, source: DriverError) -> Error {
      let source = match self.inner.provider.sqlstate(&source) {
         Some(code) => Box::new(SqlStateError { code, source }) as DriverError,
         None => source,
      };
      Error::engine(operation, database, source)
   }
}
