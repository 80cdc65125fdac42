//! # Topic Bus
//!
//! A topic-based publish/subscribe façade over a message broker.
//! Publishers emit messages tagged with a dot-segmented routing key;
//! subscribers register wildcard binding keys (`*` one token, `#` one or
//! more) and receive every message whose routing key matches.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - **Domain layer:** key grammar + matching engine, backoff policy,
//!   configuration, error taxonomy — pure logic, no I/O
//! - **Ports layer:** the narrow broker-channel capability
//!   ([`ports::BrokerTransport`] and friends) the core drives
//! - **Service layer:** the [`ConnectionManager`] state machine — connect
//!   pipeline, binding replay, backoff-scheduled reconnects
//! - **Adapters layer:** the in-process [`adapters::MemoryBroker`]
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──pipeline ok──▶ Ready
//!      ▲                          │                         │
//!      └────── backoff retry ◀────┴──── transport failure ◀─┘
//! ```
//!
//! Failures are broadcast as [`BusEvent`]s instead of being raised
//! through the caller's control flow; registered handlers survive every
//! reconnect and their bindings are replayed.

pub mod adapters;
pub mod bus;
pub mod domain;
pub mod events;
pub mod ports;
pub mod service;

pub use bus::{Bus, MessageHandler};
pub use domain::{
    is_valid_binding_key, is_valid_routing_key, matches, BindingPattern, BusConfig, BusError,
    ReconnectBackoff, TransportError,
};
pub use events::{BusEvent, EventStream};
pub use service::{BindOutcome, ConnectionManager, ConnectionState};

/// Capacity of the lifecycle/error event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Deliveries buffered per consumer before the in-process broker drops.
pub const DELIVERY_QUEUE_CAPACITY: usize = 256;
