//! # Bus Façade
//!
//! Public entry point: validates keys, owns the handler registry,
//! delegates transport actions to the [`ConnectionManager`], and fans
//! inbound messages out to every handler whose binding key matches.
//!
//! Errors are funneled to the event channel rather than raised through
//! the caller's control flow; see [`crate::domain::errors`].

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::domain::{is_valid_routing_key, BindingPattern, BusConfig, BusError};
use crate::events::{BusEvent, EventStream};
use crate::ports::BrokerTransport;
use crate::service::{BindOutcome, ConnectionManager, ConnectionState, DeliverySink};
use crate::EVENT_CHANNEL_CAPACITY;

/// Receives messages whose routing key matched a registered binding key.
///
/// Dispatch is sequential: a slow handler delays later matches for the
/// same message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message.
    async fn handle(&self, routing_key: &str, payload: serde_json::Value);
}

/// Plain closures work as handlers.
#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&str, serde_json::Value) + Send + Sync,
{
    async fn handle(&self, routing_key: &str, payload: serde_json::Value) {
        self(routing_key, payload);
    }
}

/// One subscription: the compiled binding pattern and its handler.
/// Registrations are insertion-ordered and live as long as the bus.
struct HandlerRegistration {
    pattern: BindingPattern,
    handler: Arc<dyn MessageHandler>,
}

/// Decodes inbound payloads and fans them out to matching handlers.
struct Dispatcher {
    handlers: RwLock<Vec<HandlerRegistration>>,
    events: broadcast::Sender<BusEvent>,
}

#[async_trait]
impl DeliverySink for Dispatcher {
    async fn on_delivery(&self, routing_key: &str, payload: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(err) => {
                // Decode failures drop the message only; the connection
                // stays up and no redelivery happens at this layer.
                let err = BusError::PayloadDecode(err.to_string());
                warn!(routing_key, error = %err, "inbound payload dropped");
                let _ = self.events.send(BusEvent::Error(err.to_string()));
                return;
            }
        };
        let matched: Vec<Arc<dyn MessageHandler>> = {
            let Ok(handlers) = self.handlers.read() else {
                return;
            };
            handlers
                .iter()
                .filter(|r| r.pattern.matches(routing_key))
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };
        debug!(routing_key, matched = matched.len(), "dispatching message");
        for handler in matched {
            handler.handle(routing_key, value.clone()).await;
        }
    }
}

/// Topic publish/subscribe façade over a broker transport.
///
/// ```
/// use std::sync::Arc;
/// use topic_bus::adapters::MemoryBroker;
/// use topic_bus::{Bus, BusConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = Arc::new(MemoryBroker::new());
/// let bus = Bus::new(BusConfig::for_testing(), broker);
/// bus.connect().await;
///
/// bus.subscribe("orders.*", |routing_key: &str, payload: serde_json::Value| {
///     println!("{routing_key}: {payload}");
/// })
/// .await
/// .expect("valid binding key");
///
/// bus.publish("orders.created", &serde_json::json!({ "id": 1 })).await;
/// # }
/// ```
pub struct Bus {
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<BusEvent>,
}

impl Bus {
    /// Create a bus over the given transport. No connection is opened
    /// until [`Bus::connect`].
    pub fn new(config: BusConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let dispatcher = Arc::new(Dispatcher {
            handlers: RwLock::new(Vec::new()),
            events: events.clone(),
        });
        let manager = Arc::new(ConnectionManager::new(
            config,
            transport,
            events.clone(),
            Arc::clone(&dispatcher) as Arc<dyn DeliverySink>,
        ));
        Self {
            manager,
            dispatcher,
            events,
        }
    }

    /// Open the connection. Failures surface on the event channel, not as
    /// a return value.
    pub async fn connect(&self) {
        match self.manager.connect().await {
            Ok(()) => {}
            // Pipeline failures were already broadcast by the manager.
            Err(BusError::Transport(_)) => {}
            Err(err) => self.report(err),
        }
    }

    /// Serialize `message` as JSON and publish it under `routing_key`.
    ///
    /// Invalid routing keys and transport failures are routed to the
    /// event channel and the publish is aborted.
    pub async fn publish<T: Serialize>(&self, routing_key: &str, message: &T) {
        if !is_valid_routing_key(routing_key) {
            self.report(BusError::InvalidRoutingKey(routing_key.to_string()));
            return;
        }
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(routing_key, error = %err, "payload encode failure");
                let _ = self
                    .events
                    .send(BusEvent::Error(format!("payload encode failure: {err}")));
                return;
            }
        };
        if let Err(err) = self.manager.send(routing_key, payload).await {
            self.report(err);
        }
    }

    /// Register a handler for every message whose routing key matches
    /// `binding_key`.
    ///
    /// The registration persists for the lifetime of the bus and is
    /// replayed on every reconnect. The returned [`BindOutcome`] says
    /// whether the broker-side bind happened now or is deferred to the
    /// next connect.
    pub async fn subscribe<H>(&self, binding_key: &str, handler: H) -> Result<BindOutcome, BusError>
    where
        H: MessageHandler + 'static,
    {
        let Some(pattern) = BindingPattern::compile(binding_key) else {
            let err = BusError::InvalidBindingKey(binding_key.to_string());
            self.report(err.clone());
            return Err(err);
        };
        {
            let Ok(mut handlers) = self.dispatcher.handlers.write() else {
                return Err(BusError::NotConnected);
            };
            handlers.push(HandlerRegistration {
                pattern,
                handler: Arc::new(handler),
            });
        }
        match self.manager.register_binding_key(binding_key).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.report(err.clone());
                Err(err)
            }
        }
    }

    /// True while the connection manager is `Ready`.
    pub async fn is_connected(&self) -> bool {
        self.manager.state().await == ConnectionState::Ready
    }

    /// Subscribe to lifecycle and error events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Lifecycle and error events as a `Stream`.
    #[must_use]
    pub fn event_stream(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    fn report(&self, err: BusError) {
        error!(error = %err, "bus operation failed");
        let _ = self.events.send(BusEvent::Error(err.to_string()));
    }
}
