use serde_json::Value as JsonValue;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgRow, PgValueRef};
use sqlx::types::Uuid;
use sqlx::{Column, Row as _, TypeInfo, Value, ValueRef};

use pg_db_template::Row;

use crate::Error;

/// Convert a PostgreSQL value to a JSON value.
///
/// Integers and floats become JSON numbers, text-like types strings, and
/// `json`/`jsonb` are passed through as parsed JSON. UUIDs are rendered in their
/// hyphenated form.
///
/// Note: `numeric` has no lossless JSON form and is not decoded; cast it to
/// `text` in the query. Types without a text representation sqlx can decode
/// are reported as [`Error::UnsupportedDatatype`].
pub fn to_json(value: PgValueRef) -> Result<JsonValue, Error> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_info = value.type_info().into_owned();

   let result = match type_info.name() {
      "BOOL" => JsonValue::Bool(ValueRef::to_owned(&value).try_decode::<bool>()?),

      "INT2" => JsonValue::from(ValueRef::to_owned(&value).try_decode::<i16>()?),
      "INT4" => JsonValue::from(ValueRef::to_owned(&value).try_decode::<i32>()?),
      "INT8" => JsonValue::from(ValueRef::to_owned(&value).try_decode::<i64>()?),
      "OID" => JsonValue::from(ValueRef::to_owned(&value).try_decode::<Oid>()?.0),

      // NaN and infinities have no JSON form and become null
      "FLOAT4" => JsonValue::from(f64::from(ValueRef::to_owned(&value).try_decode::<f32>()?)),
      "FLOAT8" => JsonValue::from(ValueRef::to_owned(&value).try_decode::<f64>()?),

      "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
         JsonValue::String(ValueRef::to_owned(&value).try_decode::<String>()?)
      }

      "JSON" | "JSONB" => ValueRef::to_owned(&value).try_decode::<JsonValue>()?,

      "UUID" => JsonValue::String(ValueRef::to_owned(&value).try_decode::<Uuid>()?.to_string()),

      "VOID" => JsonValue::Null,

      other => {
         // For unknown types, try to decode as text
         if let Ok(text) = ValueRef::to_owned(&value).try_decode::<String>() {
            JsonValue::String(text)
         } else {
            return Err(Error::UnsupportedDatatype(format!(
               "Unknown PostgreSQL type: {}",
               other
            )));
         }
      }
   };

   Ok(result)
}

/// Decode every column of `row`, keyed by column name in select order.
pub fn row_to_json(row: &PgRow) -> Result<Row, Error> {
   row.columns()
      .iter()
      .map(|column| {
         let value = to_json(row.try_get_raw(column.ordinal())?)?;
         Ok::<_, Error>((column.name().to_string(), value))
      })
      .collect()
}
