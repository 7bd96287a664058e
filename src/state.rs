//! Bookkeeping shared by every operation on one manager

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Result;
use crate::error::Error;

/// Where the manager is in its template lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
   /// No template owned by this manager exists.
   Uninitialized,
   /// `initialize()` is creating and migrating the template.
   Initializing,
   /// The template exists and test databases can be cloned from it.
   Ready,
   /// `cleanup()` is dropping test databases and the template.
   CleaningUp,
}

/// Mutable state of one manager: live-set, naming counter and lifecycle.
///
/// Every method takes the lock for the duration of a few in-memory updates only;
/// nothing here ever awaits.
#[derive(Debug)]
pub(crate) struct ManagerState {
   inner: Mutex<StateInner>,
   /// Woken when the last in-flight create finishes.
   settled: Notify,
}

#[derive(Debug)]
struct StateInner {
   lifecycle: Lifecycle,
   live: HashSet<String>,
   counter: u64,
   creating: usize,
}

impl ManagerState {
   pub(crate) fn new() -> Self {
      Self {
         inner: Mutex::new(StateInner {
            lifecycle: Lifecycle::Uninitialized,
            live: HashSet::new(),
            counter: 0,
            creating: 0,
         }),
         settled: Notify::new(),
      }
   }

   pub(crate) fn lifecycle(&self) -> Lifecycle {
      self.inner.lock().lifecycle
   }

   /// Move `Uninitialized -> Initializing`, refusing if a template is owned or being built.
   pub(crate) fn begin_initialize(&self) -> Result<()> {
      let mut inner = self.inner.lock();
      match inner.lifecycle {
         Lifecycle::Uninitialized => {
            inner.lifecycle = Lifecycle::Initializing;
            Ok(())
         }
         _ => Err(Error::AlreadyInitialized),
      }
   }

   /// Finish an `initialize()`; `ready` is false when it failed.
   pub(crate) fn finish_initialize(&self, ready: bool) {
      let mut inner = self.inner.lock();
      if inner.lifecycle == Lifecycle::Initializing {
         inner.lifecycle = if ready {
            Lifecycle::Ready
         } else {
            Lifecycle::Uninitialized
         };
      }
   }

   /// Reserve the next counter value and count a create in flight, provided
   /// the template is ready.
   fn begin_create(&self) -> Result<u64> {
      let mut inner = self.inner.lock();
      if inner.lifecycle != Lifecycle::Ready {
         return Err(Error::NotInitialized);
      }
      inner.counter += 1;
      inner.creating += 1;
      Ok(inner.counter)
   }

   fn finish_create(&self) {
      let settled = {
         let mut inner = self.inner.lock();
         inner.creating -= 1;
         inner.creating == 0
      };
      if settled {
         self.settled.notify_waiters();
      }
   }

   /// Resolves once no create is in flight.
   pub(crate) async fn creates_settled(&self) {
      loop {
         let notified = self.settled.notified();
         let mut notified = std::pin::pin!(notified);
         notified.as_mut().enable();
         if self.inner.lock().creating == 0 {
            return;
         }
         notified.await;
      }
   }

   /// Record a database the server confirmed it created.
   pub(crate) fn track(&self, name: &str) {
      self.inner.lock().live.insert(name.to_string());
   }

   /// Remove `name` from the live-set, returning whether this caller owned it.
   pub(crate) fn claim(&self, name: &str) -> bool {
      self.inner.lock().live.remove(name)
   }

   /// Move `Ready -> CleaningUp`, after which no new create starts.
   ///
   /// Returns false when there is nothing to clean up.
   pub(crate) fn begin_cleanup(&self) -> bool {
      let mut inner = self.inner.lock();
      if inner.lifecycle != Lifecycle::Ready {
         return false;
      }
      inner.lifecycle = Lifecycle::CleaningUp;
      true
   }

   /// Take every tracked name, sorted.
   pub(crate) fn drain_live(&self) -> Vec<String> {
      let mut names: Vec<String> = self.inner.lock().live.drain().collect();
      names.sort();
      names
   }

   /// Finish a `cleanup()`: failed names go back into the live-set, and the
   /// manager is only uninitialized once its template is gone.
   pub(crate) fn finish_cleanup(&self, failed: &[String], template_dropped: bool) {
      let mut inner = self.inner.lock();
      inner.live.extend(failed.iter().cloned());
      inner.lifecycle = if template_dropped {
         Lifecycle::Uninitialized
      } else {
         Lifecycle::Ready
      };
   }

   pub(crate) fn live_databases(&self) -> Vec<String> {
      let mut names: Vec<String> = self.inner.lock().live.iter().cloned().collect();
      names.sort();
      names
   }
}

/// One `create_test_database` in flight. `cleanup()` waits for every guard to
/// go away before it collects the live-set.
pub(crate) struct CreateGuard {
   state: Arc<ManagerState>,
   counter: u64,
}

impl CreateGuard {
   pub(crate) fn begin(state: Arc<ManagerState>) -> Result<Self> {
      let counter = state.begin_create()?;
      Ok(Self { state, counter })
   }

   pub(crate) fn counter(&self) -> u64 {
      self.counter
   }

   /// Record the database the server confirmed it created.
   pub(crate) fn track(&self, name: &str) {
      self.state.track(name);
   }
}

impl Drop for CreateGuard {
   fn drop(&mut self) {
      self.state.finish_create();
   }
}

/// Puts a claimed name back into the live-set unless the drop completed.
///
/// Covers both a failed DROP and a caller dropping the future mid-operation:
/// the database may still exist, so it stays tracked for `cleanup()`.
#[must_use = "if unused, the claimed name is immediately re-tracked"]
pub(crate) struct ClaimGuard {
   state: Arc<ManagerState>,
   name: Option<String>,
}

impl ClaimGuard {
   pub(crate) fn new(state: Arc<ManagerState>, name: String) -> Self {
      Self {
         state,
         name: Some(name),
      }
   }

   /// The database is gone; stop tracking it for good.
   pub(crate) fn release(mut self) {
      self.name = None;
   }
}

impl Drop for ClaimGuard {
   fn drop(&mut self) {
      if let Some(name) = self.name.take() {
         tracing::debug!(database = %name, "Drop did not complete, database stays tracked");
         self.state.track(&name);
      }
   }
}

/// Holds the manager in `Initializing`; falls back to `Uninitialized` unless completed.
#[must_use = "if unused, initialization is immediately abandoned"]
pub(crate) struct InitializeGuard {
   state: Arc<ManagerState>,
   done: bool,
}

impl InitializeGuard {
   pub(crate) fn begin(state: Arc<ManagerState>) -> Result<Self> {
      state.begin_initialize()?;
      Ok(Self { state, done: false })
   }

   pub(crate) fn complete(mut self) {
      self.done = true;
      self.state.finish_initialize(true);
   }
}

impl Drop for InitializeGuard {
   fn drop(&mut self) {
      if !self.done {
         self.state.finish_initialize(false);
      }
   }
}

/// Holds the manager in `CleaningUp`. If the cleanup future is dropped before
/// `finish`, every collected name is re-tracked and the manager returns to `Ready`.
#[must_use = "if unused, cleanup is immediately abandoned"]
pub(crate) struct CleanupGuard {
   state: Arc<ManagerState>,
   names: Vec<String>,
   done: bool,
}

impl CleanupGuard {
   pub(crate) fn begin(state: Arc<ManagerState>) -> Option<Self> {
      if !state.begin_cleanup() {
         return None;
      }
      Some(Self {
         state,
         names: Vec::new(),
         done: false,
      })
   }

   /// Wait out in-flight creates, then take the live-set.
   pub(crate) async fn collect(&mut self) {
      self.state.creates_settled().await;
      self.names = self.state.drain_live();
   }

   pub(crate) fn names(&self) -> &[String] {
      &self.names
   }

   pub(crate) fn finish(mut self, failed: &[String], template_dropped: bool) {
      self.done = true;
      self.state.finish_cleanup(failed, template_dropped);
   }
}

impl Drop for CleanupGuard {
   fn drop(&mut self) {
      if !self.done {
         tracing::warn!(
            databases = self.names.len(),
            "Cleanup interrupted, databases stay tracked"
         );
         self.state.finish_cleanup(&self.names, false);
      }
   }
}
