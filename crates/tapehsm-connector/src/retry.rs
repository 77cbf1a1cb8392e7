//! Fixed-delay retry policy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how far apart an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between two attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay_ms: 100,
        }
    }
}

/// Returned when every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {} attempts: {}", self.attempts, self.last)
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Runs `op` until it succeeds or the attempts are used up, sleeping
    /// between attempts. `op` receives the zero-based attempt number.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: fmt::Debug,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        tracing::debug!(attempt, "giving up: {:?}", e);
                        return Err(RetryExhausted { attempts: attempt, last: e });
                    }
                    tracing::debug!(
                        "attempt {}/{} failed: {:?}, retrying in {}ms",
                        attempt,
                        attempts,
                        e,
                        self.delay_ms
                    );
                    std::thread::sleep(self.delay());
                }
            }
        }
    }
}
