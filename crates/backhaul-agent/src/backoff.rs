//! Reconnect pacing for the control connection.
//!
//! The agent never gives up on its gateway: every failed or ended control
//! session is followed by a pause that doubles up to a cap, and a session
//! that actually registered resets the pause to its starting value.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Pause after the first failure.
    pub initial: Duration,
    /// Upper bound on the pause.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff between registration attempts.
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Sleep out the current pause, then double it (capped).
    pub async fn wait(&mut self) {
        self.attempt += 1;
        debug!(
            attempt = self.attempt,
            pause_ms = self.current.as_millis() as u64,
            "waiting before re-registration"
        );

        sleep(self.current).await;
        self.current = (self.current * 2).min(self.config.max);
    }

    /// Reset after a successful registration.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(15),
        });

        assert_eq!(backoff.current(), Duration::from_millis(5));
        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(10));
        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(15));
        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(15));
        assert_eq!(backoff.attempt(), 3);
    }

    #[tokio::test]
    async fn test_reset_restores_initial_pause() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(40),
        });

        backoff.wait().await;
        backoff.wait().await;
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(5));
        assert_eq!(backoff.attempt(), 0);
    }
}
