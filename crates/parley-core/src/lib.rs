//! Core abstractions shared by the Parley engine and relay.
//!
//! The [`Environment`] trait decouples protocol logic from system resources
//! (time, randomness) so the same state machines run deterministically under
//! test and against real clocks and OS entropy in production.
//!
//! # Components
//!
//! - [`Environment`]: time, randomness, and async sleep abstraction
//! - [`MockEnv`]: deterministic implementation for tests (manual clock,
//!   seeded RNG)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod env;
pub mod mock;

pub use env::Environment;
pub use mock::{MockEnv, MockInstant};
