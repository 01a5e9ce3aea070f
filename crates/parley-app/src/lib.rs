//! Application layer for Parley.
//!
//! Pure state machines sitting between the session engine and a
//! presentation layer, so the whole user-visible flow can be tested
//! deterministically without a terminal or a network.
//!
//! # Components
//!
//! - [`App`]: presentation state machine (connection state, roster,
//!   message history, status line)
//! - [`Bridge`]: owns the session [`Engine`](parley_client::Engine) and
//!   translates between [`AppAction`]s / [`AppEvent`]s and engine
//!   events/actions, accumulating outbound requests for the transport

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod action;
mod app;
mod bridge;
mod event;
mod state;

pub use action::AppAction;
pub use app::App;
pub use bridge::Bridge;
pub use event::AppEvent;
pub use state::{ConnectionState, HistoryEntry, RosterEntry};
