//! Production [`Environment`] backed by system time and the OS RNG.

use std::time::Duration;

use parley_core::Environment;

/// Production environment: `std::time::Instant` for monotonic time,
/// `tokio::time::sleep` for delays, getrandom for entropy.
///
/// # Panics
///
/// Panics if the OS RNG fails. A relay without functioning cryptographic
/// randomness cannot mint unpredictable session and delivery IDs, and
/// OS RNG failure indicates a machine-level problem.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - relay cannot operate securely");
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn monotonic_time_advances() {
        let env = SystemEnv::new();

        let before = env.now();
        std::thread::sleep(Duration::from_millis(10));
        assert!(env.now() > before);
    }

    #[test]
    fn random_bytes_differ_between_calls() {
        let env = SystemEnv::new();

        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        env.random_bytes(&mut first);
        env.random_bytes(&mut second);

        assert_ne!(first, second);
    }

    #[test]
    fn wall_clock_is_past_2024() {
        let env = SystemEnv::new();
        assert!(env.wall_clock_millis() > 1_704_067_200_000);
    }

    #[tokio::test]
    async fn sleep_waits_the_requested_duration() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(50)).await;
        assert!(env.now() - start >= Duration::from_millis(50));
    }
}
