//! Bounded retry with jittered exponential backoff for engine lock contention

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Error;

/// SQLSTATEs that mean "someone else holds the database right now".
///
/// - `55006` object_in_use: the template (or drop target) has other sessions
/// - `55P03` lock_not_available
/// - `40P01` deadlock_detected
pub const CONTENTION_SQLSTATES: [&str; 3] = ["55006", "55P03", "40P01"];

pub(crate) fn is_contention(error: &Error) -> bool {
   error
      .sqlstate()
      .is_some_and(|code| CONTENTION_SQLSTATES.contains(&code))
}

/// Delay before retry number `attempt` (1-based count of failures so far).
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
   let shift = attempt.saturating_sub(1).min(16);
   let base_ms = config
      .base_delay_ms
      .saturating_mul(1u64 << shift)
      .min(config.max_delay_ms);
   let jitter_ms = if base_ms >= 4 {
      rand::rng().random_range(0..=base_ms / 4)
   } else {
      0
   };
   Duration::from_millis(base_ms + jitter_ms)
}

/// Run `op` until it succeeds, fails with a non-contention error, or runs out of attempts.
pub(crate) async fn retry_on_contention<T, F, Fut>(
   config: &RetryConfig,
   database: &str,
   mut op: F,
) -> Result<T, Error>
where
   F: FnMut() -> Fut,
   Fut: Future<Output = Result<T, Error>>,
{
   let max_attempts = config.max_attempts.max(1);
   let mut attempt = 1;

   loop {
      match op().await {
         Ok(value) => {
            if attempt > 1 {
               debug!(database = %database, attempts = attempt, "Succeeded after lock contention");
            }
            return Ok(value);
         }
         Err(e) if is_contention(&e) && attempt < max_attempts => {
            let delay = backoff_delay(config, attempt);
            debug!(
               database = %database,
               attempt = attempt,
               max_attempts = max_attempts,
               delay_ms = delay.as_millis() as u64,
               error = %e,
               "Lock contention, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
         }
         Err(e) => {
            if is_contention(&e) {
               warn!(
                  database = %database,
                  attempts = attempt,
                  error = %e,
                  "Giving up after repeated lock contention"
               );
            }
            return Err(e);
         }
      }
   }
}
