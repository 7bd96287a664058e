//! Pool settings for connections handed out by the provider

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;

/// Configuration for the pool behind every [`PgDatabaseConnection`](crate::PgDatabaseConnection)
///
/// Each `connect` call builds its own pool, so these limits apply per database
/// connection handed to the manager or to a test.
///
/// # Examples
///
/// ```
/// use pg_db_template_sqlx::PgPoolConfig;
///
/// // Use defaults
/// let config = PgPoolConfig::default();
/// assert_eq!(config.max_connections, 5);
///
/// // Override just one field
/// let config = PgPoolConfig {
///    max_connections: 2,
///    ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgPoolConfig {
   /// Maximum number of open connections in the pool
   ///
   /// Default: 5
   pub max_connections: u32,

   /// Connections kept open while idle
   ///
   /// Default: 0
   pub min_connections: u32,

   /// How long to wait for a free connection before failing (in seconds)
   ///
   /// Default: 30
   pub acquire_timeout_secs: u64,

   /// Idle connections are closed after this long (in seconds)
   ///
   /// Default: 60
   pub idle_timeout_secs: u64,

   /// Connections are recycled after this long regardless of use (in seconds).
   /// `None` keeps them until the pool closes.
   ///
   /// Default: Some(1800)
   pub max_lifetime_secs: Option<u64>,
}

impl Default for PgPoolConfig {
   fn default() -> Self {
      Self {
         max_connections: 5,
         min_connections: 0,
         acquire_timeout_secs: 30,
         idle_timeout_secs: 60,
         max_lifetime_secs: Some(1800),
      }
   }
}

impl PgPoolConfig {
   pub fn with_max_connections(mut self, max: u32) -> Self {
      self.max_connections = max;
      self
   }

   pub fn with_min_connections(mut self, min: u32) -> Self {
      self.min_connections = min;
      self
   }

   pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
      self.acquire_timeout_secs = timeout.as_secs();
      self
   }

   pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
      self.idle_timeout_secs = timeout.as_secs();
      self
   }

   pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
      self.max_lifetime_secs = lifetime.map(|d| d.as_secs());
      self
   }

   pub(crate) fn pool_options(&self) -> PgPoolOptions {
      PgPoolOptions::new()
         .max_connections(self.max_connections.max(1))
         .min_connections(self.min_connections.min(self.max_connections))
         .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
         .idle_timeout(Some(Duration::from_secs(self.idle_timeout_secs)))
         .max_lifetime(self.max_lifetime_secs.map(Duration::from_secs))
   }
}
