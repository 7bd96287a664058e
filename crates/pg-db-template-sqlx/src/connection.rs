//! Pooled connection to one PostgreSQL database

use async_trait::async_trait;
use pg_db_template::{DatabaseConnection, DriverError, Row};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::trace;

use crate::decode::row_to_json;
use crate::{Error, Result};

/// Connection to a single database, backed by its own [`PgPool`].
///
/// Tests usually go straight to [`pool`](Self::pool) and use plain sqlx queries;
/// the [`DatabaseConnection`] methods exist for the manager and for code that
/// stays driver-agnostic.
#[derive(Debug)]
pub struct PgDatabaseConnection {
   pool: PgPool,
   database: String,
}

impl PgDatabaseConnection {
   pub(crate) fn new(pool: PgPool, database: impl Into<String>) -> Self {
      Self {
         pool,
         database: database.into(),
      }
   }

   pub fn pool(&self) -> &PgPool {
      &self.pool
   }

   /// Name of the database this connection is bound to.
   pub fn database(&self) -> &str {
      &self.database
   }

   /// Execute a statement and return the number of affected rows.
   ///
   /// Without parameters the statement goes over the simple query protocol, so
   /// utility statements such as `CREATE DATABASE` and multi-statement scripts work.
   pub async fn execute_sql(&self, sql: &str, params: &[JsonValue]) -> Result<u64> {
      trace!(database = %self.database, sql = %sql, params = params.len(), "execute");
      let result = if params.is_empty() {
         sqlx::raw_sql(sql).execute(&self.pool).await?
      } else {
         bind_all(sqlx::query(sql), params).execute(&self.pool).await?
      };
      Ok(result.rows_affected())
   }

   /// Fetch the first row of a query, decoded to JSON.
   pub async fn fetch_optional(&self, sql: &str, params: &[JsonValue]) -> Result<Option<Row>> {
      trace!(database = %self.database, sql = %sql, params = params.len(), "fetch");
      let row = bind_all(sqlx::query(sql), params)
         .fetch_optional(&self.pool)
         .await?;
      row.as_ref().map(row_to_json).transpose()
   }
}

#[async_trait]
impl DatabaseConnection for PgDatabaseConnection {
   async fn execute(&self, sql: &str, params: &[JsonValue]) -> std::result::Result<u64, DriverError> {
      Ok(self.execute_sql(sql, params).await?)
   }

   async fn query_row(&self, sql: &str, params: &[JsonValue]) -> std::result::Result<Row, DriverError> {
      match self.fetch_optional(sql, params).await? {
         Some(row) => Ok(row),
         None => Err(Box::new(Error::Sqlx(sqlx::Error::RowNotFound))),
      }
   }

   async fn close(self) -> std::result::Result<(), DriverError> {
      self.pool.close().await;
      trace!(database = %self.database, "Connection pool closed");
      Ok(())
   }
}

/// A JSON parameter mapped onto the PostgreSQL type it is bound as.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BindValue {
   Null,
   Bool(bool),
   Int(i64),
   Float(f64),
   Text(String),
   Json(JsonValue),
}

impl From<&JsonValue> for BindValue {
   fn from(value: &JsonValue) -> Self {
      match value {
         JsonValue::Null => BindValue::Null,
         JsonValue::Bool(b) => BindValue::Bool(*b),
         JsonValue::String(s) => BindValue::Text(s.clone()),
         JsonValue::Number(number) => {
            // Preserve integer precision by binding as i64 when possible
            if let Some(int_val) = number.as_i64() {
               BindValue::Int(int_val)
            } else if let Some(uint_val) = number.as_u64() {
               // Only reachable above i64::MAX; precision is lost
               BindValue::Float(uint_val as f64)
            } else {
               BindValue::Float(number.as_f64().unwrap_or_default())
            }
         }
         JsonValue::Array(_) | JsonValue::Object(_) => BindValue::Json(value.clone()),
      }
   }
}

/// Bind one JSON value. Null is sent as a `text` null.
pub(crate) fn bind_value<'q>(
   query: Query<'q, Postgres, PgArguments>,
   value: &JsonValue,
) -> Query<'q, Postgres, PgArguments> {
   match BindValue::from(value) {
      BindValue::Null => query.bind(None::<String>),
      BindValue::Bool(b) => query.bind(b),
      BindValue::Int(i) => query.bind(i),
      BindValue::Float(f) => query.bind(f),
      BindValue::Text(s) => query.bind(s),
      BindValue::Json(j) => query.bind(j),
   }
}

fn bind_all<'q>(
   query: Query<'q, Postgres, PgArguments>,
   params: &[JsonValue],
) -> Query<'q, Postgres, PgArguments> {
   params.iter().fold(query, bind_value)
}
