//! Bounded, immediate retry.
//!
//! SITL startup is occasionally flaky (a port still held by a previous run,
//! a transient download failure). [`RetryPolicy`] re-runs an operation a
//! fixed number of times with no delay between attempts.

use std::fmt::Display;

use tracing::warn;

/// Attempts used by [`RetryPolicy::default`].
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Re-invokes an operation up to a fixed number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// A policy allowing `max_attempts` calls. Zero is treated as one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. The first `Ok` is returned
    /// immediately; on exhaustion the error from the final attempt is
    /// returned unchanged. `label` only appears in log lines.
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
