//! # Bus Error Taxonomy
//!
//! All recoverable failures are also broadcast as [`BusEvent::Error`]
//! rather than raised to the caller's control flow; the variants here are
//! what short-circuits the triggering call.
//!
//! [`BusEvent::Error`]: crate::BusEvent::Error

use thiserror::Error;

/// Failures reported by the broker transport port.
///
/// Any of these during the connect pipeline, and a lost connection at any
/// time, trigger the disconnect-and-maybe-reconnect sequence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the transport connection failed.
    #[error("broker unreachable: {0}")]
    Connect(String),

    /// Opening a logical channel on the connection failed.
    #[error("channel open failed: {0}")]
    Channel(String),

    /// Declaring the topic exchange failed.
    #[error("exchange declare failed: {0}")]
    DeclareExchange(String),

    /// Declaring the exclusive server-named queue failed.
    #[error("queue declare failed: {0}")]
    DeclareQueue(String),

    /// Starting the consumer failed.
    #[error("consume failed: {0}")]
    Consume(String),

    /// Binding the queue to the exchange failed.
    #[error("queue bind failed: {0}")]
    Bind(String),

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The broker dropped the connection.
    #[error("broker connection lost")]
    ConnectionLost,
}

/// Errors surfaced by the bus façade and the connection manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The routing key failed the word-token grammar.
    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(String),

    /// The binding key failed the grammar or used a forbidden wildcard pair.
    #[error("invalid binding key: {0}")]
    InvalidBindingKey(String),

    /// `connect()` was called while already connecting or ready.
    #[error("already connected")]
    AlreadyConnected,

    /// The operation requires a ready connection.
    #[error("not connected")]
    NotConnected,

    /// A broker transport operation failed.
    #[error("broker transport failure: {0}")]
    Transport(#[from] TransportError),

    /// An inbound payload could not be deserialized. The message is
    /// dropped; the connection is untouched.
    #[error("payload decode failure: {0}")]
    PayloadDecode(String),
}
