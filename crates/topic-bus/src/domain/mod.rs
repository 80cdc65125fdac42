//! # Domain Layer
//!
//! Pure bus logic with no I/O: key grammar and matching, reconnect
//! backoff policy, configuration, and the error taxonomy.

pub mod backoff;
pub mod binding_key;
pub mod config;
pub mod errors;

pub use backoff::{ReconnectBackoff, DEFAULT_MAX_RECONNECT, DEFAULT_MIN_RECONNECT};
pub use binding_key::{is_valid_binding_key, is_valid_routing_key, matches, BindingPattern};
pub use config::BusConfig;
pub use errors::{BusError, TransportError};
