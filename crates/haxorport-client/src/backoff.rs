//! Exponential backoff for the reconnect supervisor.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Doubling backoff between reconnect attempts, capped at a ceiling and
/// reset after a successful authentication.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Sleep for the current delay, then double it up to the ceiling.
    pub async fn wait(&mut self) {
        debug!("waiting {:?} before next reconnect attempt", self.current);
        sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn doubles_until_the_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.current(), Duration::from_millis(10));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(20));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(40));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(50));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn reset_returns_to_the_initial_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(80));
        backoff.wait().await;
        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(40));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }
}
