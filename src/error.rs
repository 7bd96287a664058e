//! Error types for pg-db-template

use std::fmt;

/// Error returned by a driver behind a [`ConnectionProvider`](crate::ConnectionProvider).
///
/// The manager never inspects these beyond asking the provider whether one is the
/// no-rows sentinel or which SQLSTATE it carries.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The engine round-trip that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
   /// Opening a connection through the provider.
   Connect,
   /// Checking whether the template database already exists.
   ProbeTemplate,
   /// `CREATE DATABASE` for the template.
   CreateTemplate,
   /// `CREATE DATABASE ... TEMPLATE ...` for a test database.
   CloneTemplate,
   /// Disconnecting sessions bound to a database about to be dropped.
   TerminateBackends,
   /// `DROP DATABASE`.
   DropDatabase,
   /// Closing a connection.
   Close,
}

impl fmt::Display for Operation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         Operation::Connect => "connect",
         Operation::ProbeTemplate => "probe template",
         Operation::CreateTemplate => "create template",
         Operation::CloneTemplate => "clone template",
         Operation::TerminateBackends => "terminate backends",
         Operation::DropDatabase => "drop database",
         Operation::Close => "close connection",
      };
      f.write_str(name)
   }
}

/// A database that could not be dropped during [`cleanup`](crate::TemplateManager::cleanup).
#[derive(Debug)]
pub struct CleanupFailure {
   /// Name of the database that is still present on the server.
   pub database: String,
   /// Why the drop failed.
   pub error: Error,
}

impl fmt::Display for CleanupFailure {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}: {}", self.database, self.error)
   }
}

/// Errors that may occur while managing template and test databases
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Invalid configuration, or a template that already exists on the server.
   #[error("configuration error: {0}")]
   Configuration(String),

   /// The operation needs a completed `initialize()`.
   #[error("template manager is not initialized")]
   NotInitialized,

   /// `initialize()` was called again without an intervening `cleanup()`.
   #[error("template manager is already initialized")]
   AlreadyInitialized,

   /// The engine or driver rejected an operation.
   #[error("failed to {operation} for database {database}: {source}")]
   Engine {
      operation: Operation,
      database: String,
      #[source]
      source: DriverError,
   },

   /// The migration runner failed against the template. The template is left in place.
   #[error("migrations failed on template database {template}: {source}")]
   Migration {
      template: String,
      #[source]
      source: DriverError,
   },

   /// An engine round-trip exceeded the configured operation timeout.
   #[error("timed out waiting to {operation} for database {database}")]
   Timeout {
      operation: Operation,
      database: String,
   },

   /// Some databases could not be dropped during cleanup.
   #[error("cleanup failed for {} database(s): {}", .failures.len(), join_failures(.failures))]
   PartialCleanup { failures: Vec<CleanupFailure> },
}

fn join_failures(failures: &[CleanupFailure]) -> String {
   failures
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
      .join("; ")
}

impl Error {
   pub(crate) fn engine(operation: Operation, database: &str, source: DriverError) -> Self {
      Error::Engine {
         operation,
         database: database.to_string(),
         source,
      }
   }

   /// SQLSTATE reported by the engine, when the provider could classify it.
   pub fn sqlstate(&self) -> Option<&str> {
      match self {
         Error::Engine { source, .. } => source
            .downcast_ref::<SqlStateError>()
            .map(|e| e.code.as_str()),
         _ => None,
      }
   }

   /// Names of databases a `PartialCleanup` error left behind.
   pub fn failed_databases(&self) -> Vec<&str> {
      match self {
         Error::PartialCleanup { failures } => {
            failures.iter().map(|f| f.database.as_str()).collect()
         }
         _ => Vec::new(),
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// Engine errors carry the SQLSTATE when the provider reported one (e.g. `PG_55006`).
   pub fn error_code(&self) -> String {
      match self {
         Error::Configuration(_) => "CONFIGURATION_ERROR".to_string(),
         Error::NotInitialized => "NOT_INITIALIZED".to_string(),
         Error::AlreadyInitialized => "ALREADY_INITIALIZED".to_string(),
         Error::Engine { .. } => match self.sqlstate() {
            Some(code) => format!("PG_{}", code),
            None => "ENGINE_ERROR".to_string(),
         },
         Error::Migration { .. } => "MIGRATION_ERROR".to_string(),
         Error::Timeout { .. } => "TIMEOUT".to_string(),
         Error::PartialCleanup { .. } => "PARTIAL_CLEANUP".to_string(),
      }
   }
}

/// Driver error tagged with the SQLSTATE the provider extracted from it.
///
/// The manager wraps engine errors in this when [`ConnectionProvider::sqlstate`]
/// returns a code, so callers can match on [`Error::sqlstate`] without knowing the driver.
///
/// [`ConnectionProvider::sqlstate`]: crate::ConnectionProvider::sqlstate
#[derive(Debug)]
pub struct SqlStateError {
   pub code: String,
   pub source: DriverError,
}

impl fmt::Display for SqlStateError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} (SQLSTATE {})", self.source, self.code)
   }
}

impl std::error::Error for SqlStateError {
   fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
      Some(self.source.as_ref())
   }
}
