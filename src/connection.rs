//! Capabilities the manager consumes from a database driver

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::DriverError;

/// A live connection to one database.
///
/// Parameters are bound positionally (`$1`, `$2`, ...). The manager only ever
/// passes database names as parameters; identifiers it interpolates into DDL are
/// quoted with [`quote_identifier`](crate::quote_identifier) first.
#[async_trait]
pub trait DatabaseConnection: Send + Sync + 'static {
   /// Execute a statement and return the number of rows it affected.
   async fn execute(
      &self,
      sql: &str,
      params: &[JsonValue],
   ) -> std::result::Result<u64, DriverError>;

   /// Execute a query and return its first row.
   ///
   /// When the query yields no rows this must fail with the error the provider
   /// recognizes in [`ConnectionProvider::is_no_rows`].
   async fn query_row(
      &self,
      sql: &str,
      params: &[JsonValue],
   ) -> std::result::Result<Row, DriverError>;

   /// Close the connection, waiting for the driver to release it.
   async fn close(self) -> std::result::Result<(), DriverError>
   where
      Self: Sized;
}

/// Opens connections to databases by name.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
   type Connection: DatabaseConnection;

   /// Open a connection to `database`, failing if it is unreachable.
   async fn connect(&self, database: &str) -> std::result::Result<Self::Connection, DriverError>;

   /// Whether `error` is the driver's "query returned no rows" sentinel.
   fn is_no_rows(&self, error: &DriverError) -> bool;

   /// SQLSTATE carried by `error`, if the driver exposes one.
   ///
   /// Used to recognize duplicate databases (`42P04`) and lock contention
   /// (`55006`, `55P03`, `40P01`). Providers that return `None` get no retries.
   fn sqlstate(&self, _error: &DriverError) -> Option<String> {
      None
   }
}

/// Applies a schema to a freshly created template database, once.
#[async_trait]
pub trait MigrationRunner<C: DatabaseConnection>: Send + Sync + 'static {
   async fn run_migrations(&self, conn: &C) -> std::result::Result<(), DriverError>;
}

/// Runs an ordered list of SQL statements through [`DatabaseConnection::execute`].
///
/// Meant for small schemas and tests; there is no version table, so it must only
/// ever run against a database that has never been migrated.
///
/// # Example
///
/// ```
/// use pg_db_template::StatementMigrationRunner;
///
/// let runner = StatementMigrationRunner::new([
///    "CREATE TABLE users (id SERIAL PRIMARY KEY, email TEXT NOT NULL)",
///    "CREATE INDEX idx_users_email ON users(email)",
/// ]);
/// assert_eq!(runner.statements().len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StatementMigrationRunner {
   statements: Vec<String>,
}

impl StatementMigrationRunner {
   pub fn new<I, S>(statements: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      Self {
         statements: statements.into_iter().map(Into::into).collect(),
      }
   }

   pub fn statements(&self) -> &[String] {
      &self.statements
   }
}

#[async_trait]
impl<C: DatabaseConnection> MigrationRunner<C> for StatementMigrationRunner {
   async fn run_migrations(&self, conn: &C) -> std::result::Result<(), DriverError> {
      for (i, statement) in self.statements.iter().enumerate() {
         tracing::trace!(step = i + 1, sql = %statement, "Applying migration statement");
         conn.execute(statement, &[]).await?;
      }
      Ok(())
   }
}

/// A single row decoded into JSON values, keyed by column name in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
   columns: IndexMap<String, JsonValue>,
}

impl Row {
   pub fn new(columns: IndexMap<String, JsonValue>) -> Self {
      Self { columns }
   }

   /// Deserialize the named column into `T`.
   pub fn get<T: DeserializeOwned>(&self, column: &str) -> std::result::Result<T, DriverError> {
      let value = self
         .columns
         .get(column)
         .ok_or_else(|| format!("no column named {column} in row"))?;
      Ok(serde_json::from_value(value.clone())?)
   }

   /// Deserialize the column at `index` into `T`.
   pub fn get_index<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, DriverError> {
      let (_, value) = self
         .columns
         .get_index(index)
         .ok_or_else(|| format!("column index {index} out of range ({} columns)", self.len()))?;
      Ok(serde_json::from_value(value.clone())?)
   }

   pub fn len(&self) -> usize {
      self.columns.len()
   }

   pub fn is_empty(&self) -> bool {
      self.columns.is_empty()
   }

   pub fn columns(&self) -> &IndexMap<String, JsonValue> {
      &self.columns
   }
}

impl FromIterator<(String, JsonValue)> for Row {
   fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
      Self {
         columns: iter.into_iter().collect(),
      }
   }
}
