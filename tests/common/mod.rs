//! In-memory stand-in for a PostgreSQL server, plus test logging.
//!
//! Understands exactly the statements the manager and the tests issue: database
//! probes, CREATE/DROP DATABASE, session termination, and a toy table model
//! (`CREATE TABLE`, `INSERT INTO`, `SELECT COUNT(*)`).
#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pg_db_template::{ConnectionProvider, DatabaseConnection, DriverError, Row};
use serde_json::{Value as JsonValue, json};

static LOGGING: Once = Once::new();

/// Route tracing output through the test harness. Honors TEST_LOG, then RUST_LOG.
pub fn init_logging() {
   LOGGING.call_once(|| {
      let filter = std::env::var("TEST_LOG")
         .or_else(|_| std::env::var("RUST_LOG"))
         .unwrap_or_else(|_| "warn".to_string());
      let _ = tracing_subscriber::fmt()
         .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
         .with_test_writer()
         .without_time()
         .try_init();
   });
}

#[derive(Debug, Clone)]
pub struct FakeError {
   pub message: String,
   pub sqlstate: Option<String>,
   pub no_rows: bool,
}

impl FakeError {
   fn new(message: impl Into<String>, sqlstate: &str) -> DriverError {
      Box::new(Self {
         message: message.into(),
         sqlstate: Some(sqlstate.to_string()),
         no_rows: false,
      })
   }

   fn no_rows() -> DriverError {
      Box::new(Self {
         message: "no rows returned".to_string(),
         sqlstate: None,
         no_rows: true,
      })
   }
}

impl fmt::Display for FakeError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.message)
   }
}

impl std::error::Error for FakeError {}

/// A scripted failure: the next `remaining` statements containing `pattern` fail.
struct Fault {
   pattern: String,
   remaining: usize,
   message: String,
   sqlstate: Option<String>,
}

#[derive(Default)]
struct EngineState {
   /// database -> table -> row count
   databases: HashMap<String, HashMap<String, i64>>,
   /// session id -> database
   sessions: HashMap<u64, String>,
   /// database -> most sessions ever open on it at once
   peak_sessions: HashMap<String, usize>,
   faults: Vec<Fault>,
   delays: Vec<(String, Duration)>,
   statements: Vec<String>,
}

/// Shared server state. Cheap to clone; every clone sees the same databases.
#[derive(Clone, Default)]
pub struct FakeEngine {
   state: Arc<Mutex<EngineState>>,
   next_session: Arc<AtomicU64>,
   clones_in_flight: Arc<AtomicUsize>,
   max_clones_in_flight: Arc<AtomicUsize>,
}

impl FakeEngine {
   pub fn new() -> Self {
      let engine = Self::default();
      engine.add_database("postgres");
      engine
   }

   pub fn provider(&self) -> FakeProvider {
      FakeProvider {
         engine: self.clone(),
      }
   }

   pub fn add_database(&self, name: &str) {
      self
         .state
         .lock()
         .databases
         .insert(name.to_string(), HashMap::new());
   }

   pub fn has_database(&self, name: &str) -> bool {
      self.state.lock().databases.contains_key(name)
   }

   /// Every database except the admin one, sorted.
   pub fn user_databases(&self) -> Vec<String> {
      let mut names: Vec<String> = self
         .state
         .lock()
         .databases
         .keys()
         .filter(|name| name.as_str() != "postgres")
         .cloned()
         .collect();
      names.sort();
      names
   }

   pub fn tables(&self, database: &str) -> Vec<String> {
      let mut tables: Vec<String> = self
         .state
         .lock()
         .databases
         .get(database)
         .map(|t| t.keys().cloned().collect())
         .unwrap_or_default();
      tables.sort();
      tables
   }

   pub fn open_sessions(&self, database: &str) -> usize {
      self
         .state
         .lock()
         .sessions
         .values()
         .filter(|db| db.as_str() == database)
         .count()
   }

   pub fn peak_sessions(&self, database: &str) -> usize {
      self
         .state
         .lock()
         .peak_sessions
         .get(database)
         .copied()
         .unwrap_or_default()
   }

   pub fn total_sessions(&self) -> usize {
      self.state.lock().sessions.len()
   }

   /// Statements executed so far, in order.
   pub fn statements(&self) -> Vec<String> {
      self.state.lock().statements.clone()
   }

   pub fn max_clones_in_flight(&self) -> usize {
      self.max_clones_in_flight.load(Ordering::SeqCst)
   }

   /// Fail the next `times` statements (or connects, as `connect:<db>`) containing `pattern`.
   pub fn fail(&self, pattern: &str, times: usize, message: &str, sqlstate: Option<&str>) {
      self.state.lock().faults.push(Fault {
         pattern: pattern.to_string(),
         remaining: times,
         message: message.to_string(),
         sqlstate: sqlstate.map(str::to_string),
      });
   }

   /// Sleep for `delay` before every statement (or connect) containing `pattern`.
   pub fn delay(&self, pattern: &str, delay: Duration) {
      self.state.lock().delays.push((pattern.to_string(), delay));
   }

   async fn intercept(&self, key: &str) -> Result<(), DriverError> {
      let delay = {
         let state = self.state.lock();
         state
            .delays
            .iter()
            .find(|(pattern, _)| key.contains(pattern.as_str()))
            .map(|(_, delay)| *delay)
      };
      if let Some(delay) = delay {
         tokio::time::sleep(delay).await;
      }

      let mut state = self.state.lock();
      if let Some(fault) = state
         .faults
         .iter_mut()
         .find(|f| f.remaining > 0 && key.contains(f.pattern.as_str()))
      {
         fault.remaining -= 1;
         return Err(Box::new(FakeError {
            message: fault.message.clone(),
            sqlstate: fault.sqlstate.clone(),
            no_rows: false,
         }));
      }
      Ok(())
   }

   fn open_session(&self, database: &str) -> Result<u64, DriverError> {
      let mut state = self.state.lock();
      if !state.databases.contains_key(database) {
         return Err(FakeError::new(
            format!("database \"{database}\" does not exist"),
            "3D000",
         ));
      }
      let id = self.next_session.fetch_add(1, Ordering::SeqCst);
      state.sessions.insert(id, database.to_string());
      let open = state.sessions.values().filter(|db| db.as_str() == database).count();
      let peak = state.peak_sessions.entry(database.to_string()).or_default();
      *peak = (*peak).max(open);
      Ok(id)
   }

   fn run(&self, session: u64, database: &str, sql: &str, params: &[JsonValue]) -> Result<Option<Row>, DriverError> {
      let mut state = self.state.lock();
      if !state.sessions.contains_key(&session) {
         return Err(FakeError::new("terminating connection due to administrator command", "57P01"));
      }
      state.statements.push(sql.to_string());

      if sql.starts_with("SELECT 1 AS present FROM pg_database") {
         let name = param_str(params, 0)?;
         return if state.databases.contains_key(&name) {
            Ok(Some([("present".to_string(), json!(1))].into_iter().collect()))
         } else {
            Err(FakeError::no_rows())
         };
      }

      if sql.starts_with("SELECT pg_terminate_backend") {
         let name = param_str(params, 0)?;
         let before = state.sessions.len();
         state
            .sessions
            .retain(|id, db| *id == session || db.as_str() != name);
         let terminated = before - state.sessions.len();
         return Ok(Some([("terminated".to_string(), json!(terminated))].into_iter().collect()));
      }

      if let Some(rest) = sql.strip_prefix("CREATE DATABASE ") {
         let (name, rest) = parse_identifier(rest)?;
         if state.databases.contains_key(&name) {
            return Err(FakeError::new(
               format!("database \"{name}\" already exists"),
               "42P04",
            ));
         }
         let tables = match rest.trim().strip_prefix("TEMPLATE ") {
            Some(template) => {
               let (template, _) = parse_identifier(template)?;
               if state.sessions.values().any(|db| *db == template) {
                  return Err(FakeError::new(
                     format!("source database \"{template}\" is being accessed by other users"),
                     "55006",
                  ));
               }
               state
                  .databases
                  .get(&template)
                  .cloned()
                  .ok_or_else(|| FakeError::new(format!("template database \"{template}\" does not exist"), "3D000"))?
            }
            None => HashMap::new(),
         };
         state.databases.insert(name, tables);
         return Ok(None);
      }

      if let Some(rest) = sql.strip_prefix("DROP DATABASE IF EXISTS ") {
         let (name, _) = parse_identifier(rest)?;
         if state.sessions.values().any(|db| *db == name) {
            return Err(FakeError::new(
               format!("database \"{name}\" is being accessed by other users"),
               "55006",
            ));
         }
         state.databases.remove(&name);
         return Ok(None);
      }

      let tables = state
         .databases
         .get_mut(database)
         .ok_or_else(|| FakeError::new(format!("database \"{database}\" does not exist"), "3D000"))?;

      if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
         let table = first_word(rest);
         if tables.contains_key(&table) {
            return Err(FakeError::new(format!("relation \"{table}\" already exists"), "42P07"));
         }
         tables.insert(table, 0);
         return Ok(None);
      }

      if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
         let table = first_word(rest);
         let count = tables
            .get_mut(&table)
            .ok_or_else(|| FakeError::new(format!("relation \"{table}\" does not exist"), "42P01"))?;
         *count += 1;
         return Ok(None);
      }

      if let Some(rest) = sql.strip_prefix("SELECT COUNT(*) AS count FROM ") {
         let table = first_word(rest);
         let count = tables
            .get(&table)
            .ok_or_else(|| FakeError::new(format!("relation \"{table}\" does not exist"), "42P01"))?;
         return Ok(Some([("count".to_string(), json!(count))].into_iter().collect()));
      }

      Err(FakeError::new(format!("syntax error in {sql:?}"), "42601"))
   }

   fn close_session(&self, session: u64) {
      self.state.lock().sessions.remove(&session);
   }
}

fn param_str(params: &[JsonValue], index: usize) -> Result<String, DriverError> {
   params
      .get(index)
      .and_then(JsonValue::as_str)
      .map(str::to_string)
      .ok_or_else(|| FakeError::new(format!("missing text parameter ${}", index + 1), "08P01"))
}

/// Parse a leading double-quoted identifier, returning it unescaped and the rest of the input.
fn parse_identifier(input: &str) -> Result<(String, &str), DriverError> {
   let body = input
      .strip_prefix('"')
      .ok_or_else(|| FakeError::new(format!("expected quoted identifier in {input:?}"), "42601"))?;
   let mut name = String::new();
   let mut chars = body.char_indices().peekable();
   while let Some((i, c)) = chars.next() {
      if c == '"' {
         if matches!(chars.peek(), Some((_, '"'))) {
            chars.next();
            name.push('"');
         } else {
            return Ok((name, &body[i + 1..]));
         }
      } else {
         name.push(c);
      }
   }
   Err(FakeError::new(format!("unterminated identifier in {input:?}"), "42601"))
}

fn first_word(input: &str) -> String {
   input
      .split(|c: char| c.is_whitespace() || c == '(')
      .next()
      .unwrap_or_default()
      .to_string()
}

#[derive(Clone)]
pub struct FakeProvider {
   engine: FakeEngine,
}

#[async_trait]
impl ConnectionProvider for FakeProvider {
   type Connection = FakeConnection;

   async fn connect(&self, database: &str) -> Result<FakeConnection, DriverError> {
      self.engine.intercept(&format!("connect:{database}")).await?;
      let session = self.engine.open_session(database)?;
      Ok(FakeConnection {
         engine: self.engine.clone(),
         database: database.to_string(),
         session,
      })
   }

   fn is_no_rows(&self, error: &DriverError) -> bool {
      error
         .downcast_ref::<FakeError>()
         .is_some_and(|e| e.no_rows)
   }

   fn sqlstate(&self, error: &DriverError) -> Option<String> {
      error
         .downcast_ref::<FakeError>()
         .and_then(|e| e.sqlstate.clone())
   }
}

pub struct FakeConnection {
   engine: FakeEngine,
   database: String,
   session: u64,
}

impl fmt::Debug for FakeConnection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("FakeConnection")
         .field("database", &self.database)
         .field("session", &self.session)
         .finish_non_exhaustive()
   }
}

impl FakeConnection {
   pub fn database(&self) -> &str {
      &self.database
   }
}

#[async_trait]
impl DatabaseConnection for FakeConnection {
   async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<u64, DriverError> {
      let cloning = sql.contains(" TEMPLATE ");
      if cloning {
         let now = self.engine.clones_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
         self.engine.max_clones_in_flight.fetch_max(now, Ordering::SeqCst);
      }
      let result = match self.engine.intercept(sql).await {
         Ok(()) => self.engine.run(self.session, &self.database, sql, params),
         Err(e) => Err(e),
      };
      if cloning {
         self.engine.clones_in_flight.fetch_sub(1, Ordering::SeqCst);
      }
      Ok(match result? {
         Some(row) => row.get::<u64>("terminated").unwrap_or(1),
         None => 1,
      })
   }

   async fn query_row(&self, sql: &str, params: &[JsonValue]) -> Result<Row, DriverError> {
      self.engine.intercept(sql).await?;
      self
         .engine
         .run(self.session, &self.database, sql, params)?
         .ok_or_else(FakeError::no_rows)
   }

   async fn close(self) -> Result<(), DriverError> {
      self.engine.intercept(&format!("close:{}", self.database)).await?;
      self.engine.close_session(self.session);
      Ok(())
   }
}
