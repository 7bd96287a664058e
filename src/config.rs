//! Configuration for the template manager

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;
use crate::naming::{MAX_IDENTIFIER_LEN, MIN_SUFFIX_LEN, validate_identifier};

/// Configuration for a [`TemplateManager`](crate::TemplateManager)
///
/// # Examples
///
/// ```
/// use pg_db_template::TemplateConfig;
///
/// // Defaults for everything but the template name
/// let config = TemplateConfig::new("app_template");
/// assert_eq!(config.admin_database, "postgres");
/// assert_eq!(config.test_db_prefix, "test_");
///
/// // Override individual settings
/// let config = TemplateConfig::new("app_template")
///    .with_test_db_prefix("app_test_")
///    .with_operation_timeout(std::time::Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
   /// Database the manager connects to when issuing CREATE/DROP DATABASE.
   ///
   /// Default: "postgres"
   pub admin_database: String,

   /// Name of the template database created by `initialize()`.
   pub template_name: String,

   /// Prefix for generated test database names.
   ///
   /// Default: "test_"
   pub test_db_prefix: String,

   /// Retry policy for lock contention on CREATE/DROP DATABASE.
   pub retry: RetryConfig,

   /// Upper bound on every engine round-trip, in milliseconds. `None` waits indefinitely.
   ///
   /// Default: None
   pub operation_timeout_ms: Option<u64>,

   /// Most test databases `cleanup()` drops at once. Each drop holds its own
   /// admin connection, so this also caps admin sessions during cleanup.
   ///
   /// Default: 8
   pub cleanup_concurrency: usize,
}

impl Default for TemplateConfig {
   fn default() -> Self {
      Self {
         admin_database: "postgres".to_string(),
         template_name: String::new(),
         test_db_prefix: "test_".to_string(),
         retry: RetryConfig::default(),
         operation_timeout_ms: None,
         cleanup_concurrency: 8,
      }
   }
}

impl TemplateConfig {
   /// Creates a configuration for `template_name` with default settings.
   pub fn new(template_name: impl Into<String>) -> Self {
      Self {
         template_name: template_name.into(),
         ..Default::default()
      }
   }

   pub fn with_admin_database(mut self, name: impl Into<String>) -> Self {
      self.admin_database = name.into();
      self
   }

   pub fn with_test_db_prefix(mut self, prefix: impl Into<String>) -> Self {
      self.test_db_prefix = prefix.into();
      self
   }

   pub fn with_retry(mut self, retry: RetryConfig) -> Self {
      self.retry = retry;
      self
   }

   pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
      self.operation_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1));
      self
   }

   pub fn with_cleanup_concurrency(mut self, limit: usize) -> Self {
      self.cleanup_concurrency = limit;
      self
   }

   pub fn operation_timeout(&self) -> Option<Duration> {
      self.operation_timeout_ms.map(Duration::from_millis)
   }

   /// Checks the configuration before any database is touched.
   pub fn validate(&self) -> Result<()> {
      if self.template_name.is_empty() {
         return Err(Error::Configuration(
            "template database name cannot be empty".to_string(),
         ));
      }
      if self.test_db_prefix.is_empty() {
         return Err(Error::Configuration(
            "test database prefix cannot be empty".to_string(),
         ));
      }
      if self.template_name == self.admin_database {
         return Err(Error::Configuration(format!(
            "template database and admin database are both {:?}",
            self.template_name
         )));
      }
      validate_identifier(&self.admin_database)?;
      validate_identifier(&self.template_name)?;

      let max_prefix = MAX_IDENTIFIER_LEN - MIN_SUFFIX_LEN;
      if self.test_db_prefix.len() > max_prefix || self.test_db_prefix.contains('\0') {
         return Err(Error::Configuration(format!(
            "test database prefix {:?} must be at most {} bytes without NUL",
            self.test_db_prefix, max_prefix
         )));
      }
      if self.cleanup_concurrency == 0 {
         return Err(Error::Configuration(
            "cleanup_concurrency must be at least 1".to_string(),
         ));
      }
      if self.retry.max_attempts == 0 {
         return Err(Error::Configuration(
            "retry.max_attempts must be at least 1".to_string(),
         ));
      }
      Ok(())
   }
}

/// Bounded retry for engine lock contention
///
/// Only contention errors (SQLSTATE `55006`, `55P03`, `40P01`) are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
   /// Total attempts including the first one. `1` disables retries.
   ///
   /// Default: 5
   pub max_attempts: u32,

   /// Delay before the first retry, doubled on each further attempt (milliseconds).
   ///
   /// Default: 10
   pub base_delay_ms: u64,

   /// Cap on the delay between attempts (milliseconds).
   ///
   /// Default: 200
   pub max_delay_ms: u64,
}

impl Default for RetryConfig {
   fn default() -> Self {
      Self {
         max_attempts: 5,
         base_delay_ms: 10,
         max_delay_ms: 200,
      }
   }
}

impl RetryConfig {
   /// A policy that surfaces contention errors on first occurrence.
   pub fn disabled() -> Self {
      Self {
         max_attempts: 1,
         ..Default::default()
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults() {
      let config = TemplateConfig::new("tmpl");
      assert_eq!(config.admin_database, "postgres");
      assert_eq!(config.template_name, "tmpl");
      assert_eq!(config.test_db_prefix, "test_");
      assert_eq!(config.retry, RetryConfig::default());
      assert_eq!(config.operation_timeout(), None);
      assert_eq!(config.cleanup_concurrency, 8);
      assert!(config.validate().is_ok());
   }

   #[test]
   fn test_rejects_empty_prefix() {
      let config = TemplateConfig::new("tmpl").with_test_db_prefix("");
      assert!(matches!(config.validate(), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_rejects_empty_template_name() {
      let config = TemplateConfig::default();
      assert!(matches!(config.validate(), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_rejects_template_named_like_admin_database() {
      let config = TemplateConfig::new("postgres");
      let err = config.validate().unwrap_err();
      assert!(err.to_string().contains("admin database"));

      let config = TemplateConfig::new("tmpl").with_admin_database("tmpl");
      assert!(matches!(config.validate(), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_rejects_prefix_without_room_for_suffix() {
      let prefix = "p".repeat(MAX_IDENTIFIER_LEN - MIN_SUFFIX_LEN);
      assert!(TemplateConfig::new("tmpl").with_test_db_prefix(prefix.clone()).validate().is_ok());

      let config = TemplateConfig::new("tmpl").with_test_db_prefix(format!("{prefix}p"));
      assert!(matches!(config.validate(), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_rejects_zero_cleanup_concurrency() {
      let config = TemplateConfig::new("tmpl").with_cleanup_concurrency(0);
      assert!(matches!(config.validate(), Err(Error::Configuration(_))));
      assert!(TemplateConfig::new("tmpl").with_cleanup_concurrency(1).validate().is_ok());
   }

   #[test]
   fn test_rejects_zero_attempts() {
      let config = TemplateConfig::new("tmpl").with_retry(RetryConfig {
         max_attempts: 0,
         ..Default::default()
      });
      assert!(matches!(config.validate(), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_operation_timeout_is_at_least_a_millisecond() {
      let config = TemplateConfig::new("tmpl").with_operation_timeout(Duration::from_micros(10));
      assert_eq!(config.operation_timeout(), Some(Duration::from_millis(1)));

      let config = TemplateConfig::new("tmpl").with_operation_timeout(Duration::from_secs(3));
      assert_eq!(config.operation_timeout_ms, Some(3000));
   }

   #[test]
   fn test_deserialize_fills_defaults() {
      let config: TemplateConfig =
         serde_json::from_str(r#"{"template_name": "tmpl", "retry": {"max_attempts": 2}}"#)
            .unwrap();
      assert_eq!(config.admin_database, "postgres");
      assert_eq!(config.retry.max_attempts, 2);
      assert_eq!(config.retry.base_delay_ms, 10);
   }
}
