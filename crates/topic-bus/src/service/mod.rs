//! # Connection Service
//!
//! Wires the domain (backoff policy, configuration) to the broker port:
//! the [`ConnectionManager`] state machine, its bind-replay bookkeeping,
//! and the inbound delivery pump.

mod manager;

pub use manager::{BindOutcome, ConnectionManager, ConnectionState, DeliverySink};
