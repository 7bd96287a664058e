//! Identifier quoting, test database naming and the DDL the manager issues

use crate::Result;
use crate::error::Error;

/// Longest identifier PostgreSQL keeps (NAMEDATALEN - 1). Longer names are
/// silently truncated by the server, which would break name uniqueness.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Hex characters of random nonce appended to each generated name.
const NONCE_LEN: usize = 8;

/// Shortest suffix a generated name carries: one counter digit, `_`, and the nonce.
pub(crate) const MIN_SUFFIX_LEN: usize = 1 + 1 + NONCE_LEN;

/// Quote a PostgreSQL identifier for interpolation into DDL.
///
/// The name is wrapped in double quotes with embedded quotes doubled, so it can
/// only ever be read as a single identifier and cannot:
/// - Terminate statements (;)
/// - Start comments (--)
/// - Break out of the quoted context (")
///
/// Empty names, names containing NUL and names longer than
/// [`MAX_IDENTIFIER_LEN`] bytes are rejected.
///
/// # Example
///
/// ```
/// use pg_db_template::quote_identifier;
///
/// assert_eq!(quote_identifier("app_template").unwrap(), "\"app_template\"");
/// assert_eq!(quote_identifier("we\"ird").unwrap(), "\"we\"\"ird\"");
/// assert!(quote_identifier("").is_err());
/// ```
pub fn quote_identifier(name: &str) -> Result<String> {
   validate_identifier(name)?;
   Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub(crate) fn validate_identifier(name: &str) -> Result<()> {
   if name.is_empty() {
      return Err(Error::Configuration(
         "database name cannot be empty".to_string(),
      ));
   }
   if name.contains('\0') {
      return Err(Error::Configuration(format!(
         "database name {:?} contains a NUL byte",
         name
      )));
   }
   if name.len() > MAX_IDENTIFIER_LEN {
      return Err(Error::Configuration(format!(
         "database name {:?} is {} bytes, PostgreSQL keeps at most {}",
         name,
         name.len(),
         MAX_IDENTIFIER_LEN
      )));
   }
   Ok(())
}

/// Builds unique test database names: `{prefix}{counter}_{nonce}`.
///
/// The counter comes from the manager and never repeats within one manager. The
/// nonce keeps names from separate processes (or separate managers sharing a
/// prefix) apart even when their counters line up.
#[derive(Debug, Clone)]
pub struct NameGenerator {
   prefix: String,
}

impl NameGenerator {
   pub fn new(prefix: impl Into<String>) -> Self {
      Self {
         prefix: prefix.into(),
      }
   }

   pub fn prefix(&self) -> &str {
      &self.prefix
   }

   /// Name for the `counter`-th test database.
   pub fn generate(&self, counter: u64) -> Result<String> {
      let nonce = uuid::Uuid::new_v4().simple().to_string();
      let name = format!("{}{}_{}", self.prefix, counter, &nonce[..NONCE_LEN]);
      if name.len() > MAX_IDENTIFIER_LEN {
         return Err(Error::Configuration(format!(
            "test database prefix {:?} is too long: generated name {:?} exceeds {} bytes",
            self.prefix, name, MAX_IDENTIFIER_LEN
         )));
      }
      Ok(name)
   }
}

/// DDL and catalog queries, with identifiers already quoted.
pub(crate) mod ddl {
   use super::quote_identifier;
   use crate::Result;

   /// Probe that yields one row when the database exists and none otherwise.
   pub const DATABASE_EXISTS: &str = "SELECT 1 AS present FROM pg_database WHERE datname = $1";

   /// Disconnect every session bound to `$1` except the issuing one.
   pub const TERMINATE_BACKENDS: &str = "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
      WHERE datname = $1 AND pid <> pg_backend_pid()";

   pub fn create_database(name: &str) -> Result<String> {
      Ok(format!("CREATE DATABASE {}", quote_identifier(name)?))
   }

   pub fn create_from_template(name: &str, template: &str) -> Result<String> {
      Ok(format!(
         "CREATE DATABASE {} TEMPLATE {}",
         quote_identifier(name)?,
         quote_identifier(template)?
      ))
   }

   pub fn drop_database(name: &str) -> Result<String> {
      Ok(format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)?))
   }
}
