//! Environment abstraction for deterministic testing.
//!
//! Everything the engine and relay driver need from the outside world —
//! time and randomness — goes through this trait, so the same protocol
//! code runs under a manual clock with a seeded RNG in tests and on
//! real system resources in production.

use std::time::Duration;

/// Time and randomness source for protocol state machines.
///
/// Implementations MUST guarantee that `now()` never goes backwards and
/// that `random_bytes()` draws cryptographically secure entropy in
/// production. Methods are infallible; an environment that cannot supply
/// entropy is a machine-level failure, not a recoverable error.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// `std::time::Instant` in production, virtual time in tests
    /// (e.g., [`crate::MockInstant`]). Only `Sub` is required: deadlines
    /// are stored as a start instant plus a delay and checked with
    /// `now - start >= delay`.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time. Never decreases between calls.
    fn now(&self) -> Self::Instant;

    /// Sleep for `duration`.
    ///
    /// The only async method in the trait; for driver loops, never for
    /// protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    ///
    /// Deterministic under a seeded test environment; cryptographically
    /// secure in production.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Wall-clock time as milliseconds since the Unix epoch.
    ///
    /// Monotonicity is NOT guaranteed (wall clocks can be adjusted); used
    /// only for human-facing message timestamps, never for scheduling.
    fn wall_clock_millis(&self) -> u64;

    /// Random `u64`, for session and delivery IDs.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random duration in `[0, bound)`, with millisecond granularity.
    ///
    /// Used for jittered scheduling delays. A zero `bound` yields zero.
    fn random_jitter(&self, bound: Duration) -> Duration {
        let bound_millis = bound.as_millis() as u64;
        if bound_millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.random_u64() % bound_millis)
    }
}
