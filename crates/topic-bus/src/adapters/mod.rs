//! # Adapters
//!
//! Concrete implementations of the broker port. Only the in-process
//! broker lives here; a wire-level AMQP adapter plugs in through the same
//! traits.

mod memory;

pub use memory::{BrokerOp, MemoryBroker};
