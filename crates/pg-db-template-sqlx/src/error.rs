//! Error types for pg-db-template-sqlx

use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that may occur in the sqlx PostgreSQL driver
///
/// Returned boxed as a [`DriverError`](pg_db_template::DriverError) through the
/// connection traits; the provider recognizes them again by downcasting.
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// A freshly built pool could not run `SELECT 1`
   #[error("failed to ping database: {0}")]
   Ping(#[source] sqlx::Error),

   /// Migration error from the sqlx migrate framework
   #[error("Migration error: {0}")]
   Migration(#[from] sqlx::migrate::MigrateError),

   /// PostgreSQL type that cannot be mapped to JSON
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Connection URL that does not parse as PostgreSQL connect options
   #[error("invalid connection url: {0}")]
   InvalidUrl(String),
}

impl Error {
   /// The underlying sqlx error, if any.
   pub fn as_sqlx(&self) -> Option<&sqlx::Error> {
      match self {
         Error::Sqlx(e) | Error::Ping(e) => Some(e),
         _ => None,
      }
   }

   /// SQLSTATE reported by PostgreSQL, if this came from the server.
   pub fn sqlstate(&self) -> Option<String> {
      self
         .as_sqlx()
         .and_then(|e| e.as_database_error())
         .and_then(|db_err| db_err.code())
         .map(|code| code.into_owned())
   }

   /// Extract a structured error code from the error type.
   ///
   /// Server errors map to `PG_<SQLSTATE>`, e.g. `PG_55006`.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(_) | Error::Ping(_) => match self.sqlstate() {
            Some(code) => format!("PG_{}", code),
            None if matches!(self, Error::Ping(_)) => "PING_FAILED".to_string(),
            None => "SQLX_ERROR".to_string(),
         },
         Error::Migration(_) => "MIGRATION_ERROR".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::InvalidUrl(_) => "INVALID_URL".to_string(),
      }
   }
}
