//! Deterministic environment implementation for tests.
//!
//! [`MockEnv`] provides a manually-advanced virtual clock, a seeded ChaCha20
//! RNG, and sleeps that resolve immediately. The same seed always produces
//! the same random sequence, so tests that drive the clock by hand are fully
//! reproducible.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::env::Environment;

/// Wall-clock origin for mock environments: 2024-01-01T00:00:00Z.
const MOCK_WALL_BASE_MILLIS: u64 = 1_704_067_200_000;

/// Virtual instant measured as an offset from the mock clock's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant(Duration);

impl std::ops::Sub for MockInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

struct MockState {
    elapsed: Duration,
    rng: ChaCha20Rng,
}

/// Deterministic [`Environment`] for tests.
///
/// - Time advances only through [`MockEnv::advance`]
/// - Randomness comes from a ChaCha20 RNG seeded at construction
/// - [`Environment::sleep`] resolves immediately (tests drive time manually)
/// - Wall clock = fixed origin + virtual elapsed time
#[derive(Clone)]
pub struct MockEnv {
    state: Arc<Mutex<MockState>>,
}

impl MockEnv {
    /// Create a mock environment with seed 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Create a mock environment with a specific RNG seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                elapsed: Duration::ZERO,
                rng: ChaCha20Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Advance the virtual clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.lock().elapsed += duration;
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for MockEnv {
    type Instant = MockInstant;

    fn now(&self) -> Self::Instant {
        MockInstant(self.lock().elapsed)
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }

    fn wall_clock_millis(&self) -> u64 {
        MOCK_WALL_BASE_MILLIS + self.lock().elapsed.as_millis() as u64
    }
}
