//! Parley Client Engine
//!
//! Sans-IO session establishment and messaging for one logged-in user.
//! The [`Engine`] consumes [`EngineEvent`]s and returns [`EngineAction`]s;
//! it never performs I/O, reads clocks, or spawns tasks, which is what
//! makes the whole exchange protocol testable under a virtual clock.
//!
//! # Architecture
//!
//! ```text
//! relay envelopes ──┐                       ┌── envelopes to relay
//! user input ───────┼─▶ EngineEvent ─▶ Engine ─▶ EngineAction ─┼─▶ app updates
//! clock ticks ──────┘                       └── log lines
//! ```
//!
//! The optional `transport` feature adds a QUIC connection to the relay
//! ([`transport`]) for drivers that want the production wiring.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod engine;
pub mod error;
pub mod event;
pub mod queue;
pub mod session;
#[cfg(feature = "transport")]
pub mod transport;

pub use engine::{Engine, MAX_ATTEMPTS};
pub use error::EngineError;
pub use event::{ChannelStatus, DeliveryOutcome, EngineAction, EngineEvent, LogLevel};
pub use queue::{PendingQueue, QueuedMessage};
pub use session::{SessionStatus, SessionStore};
