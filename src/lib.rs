//! Adaptive admission control for trading engines.
//!
//! ```text
//! TradeSource ──► signals ──► gate ──► command (mode-gated side effect)
//!                                  └──► snapshot ──► broadcast
//! ```
//!
//! [`control::ControlLoop`] owns and sequences every component. Readers go
//! through [`api::GovernorHandle`].

pub mod api;
pub mod broadcast;
pub mod command;
pub mod control;
pub mod data;
pub mod gate;
pub mod logging;
pub mod signals;
pub mod snapshot;
pub mod state;
pub mod stream;
