//! In-process topic broker implementing the broker port.
//!
//! Backs tests and single-process wiring: exchanges with binding tables,
//! one mpsc delivery queue per consumer, uuid-named queues and consumer
//! tags. Failure injection ([`MemoryBroker::fail_next`]) makes one named
//! pipeline step fail; [`MemoryBroker::sever`] kills live consumers the
//! way a dying broker would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{BindingPattern, TransportError};
use crate::ports::{BrokerChannel, BrokerConnection, BrokerTransport, ConsumeStart, Delivery};
use crate::DELIVERY_QUEUE_CAPACITY;

/// Broker operations that can be made to fail, one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOp {
    /// Opening the transport connection.
    Open,
    /// Opening a logical channel.
    OpenChannel,
    /// Declaring the topic exchange.
    DeclareExchange,
    /// Declaring the server-named queue.
    DeclareQueue,
    /// Starting the consumer.
    Consume,
    /// Binding a queue to an exchange.
    Bind,
    /// Publishing a message.
    Publish,
}

struct MemoryBinding {
    exchange: String,
    queue: String,
    pattern: BindingPattern,
}

#[derive(Default)]
struct Shared {
    /// Declared exchange names.
    exchanges: Mutex<HashSet<String>>,
    /// Queue name to consumer sender; `None` until `consume` attaches one.
    queues: Mutex<HashMap<String, Option<mpsc::Sender<Delivery>>>>,
    bindings: Mutex<Vec<MemoryBinding>>,
    /// Next operation of this kind fails, then the trap clears.
    fail_next: Mutex<Option<BrokerOp>>,
    /// Total `bind_queue` calls received.
    bind_calls: AtomicUsize,
}

impl Shared {
    fn take_failure(&self, op: BrokerOp) -> Option<TransportError> {
        let Ok(mut trap) = self.fail_next.lock() else {
            return None;
        };
        if *trap != Some(op) {
            return None;
        }
        *trap = None;
        let reason = "injected failure".to_string();
        Some(match op {
            BrokerOp::Open => TransportError::Connect(reason),
            BrokerOp::OpenChannel => TransportError::Channel(reason),
            BrokerOp::DeclareExchange => TransportError::DeclareExchange(reason),
            BrokerOp::DeclareQueue => TransportError::DeclareQueue(reason),
            BrokerOp::Consume => TransportError::Consume(reason),
            BrokerOp::Bind => TransportError::Bind(reason),
            BrokerOp::Publish => TransportError::Publish(reason),
        })
    }

    /// Fan a message out to every queue with a matching binding, once per
    /// queue regardless of how many of its bindings match.
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        reply_to: Option<String>,
    ) -> Result<(), TransportError> {
        {
            let Ok(exchanges) = self.exchanges.lock() else {
                return Ok(());
            };
            if !exchanges.contains(exchange) {
                return Err(TransportError::Publish(format!(
                    "unknown exchange: {exchange}"
                )));
            }
        }
        let targets: Vec<mpsc::Sender<Delivery>> = {
            let Ok(bindings) = self.bindings.lock() else {
                return Ok(());
            };
            let Ok(queues) = self.queues.lock() else {
                return Ok(());
            };
            let mut seen = HashSet::new();
            bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.pattern.matches(routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .filter_map(|b| queues.get(&b.queue).and_then(Clone::clone))
                .collect()
        };
        debug!(routing_key, consumers = targets.len(), "routing message");
        for sender in targets {
            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                reply_to: reply_to.clone(),
            };
            if sender.try_send(delivery).is_err() {
                warn!(routing_key, "delivery dropped (queue full or consumer gone)");
            }
        }
        Ok(())
    }
}

/// An in-process broker shared by every connection opened through it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure: the next operation of kind `op` fails.
    pub fn fail_next(&self, op: BrokerOp) {
        if let Ok(mut trap) = self.shared.fail_next.lock() {
            *trap = Some(op);
        }
    }

    /// Kill every consumer queue and binding, simulating a broker that
    /// dropped its clients. Declared exchanges survive, mirroring broker
    /// restarts where exclusive queues are the casualties.
    pub fn sever(&self) {
        if let Ok(mut queues) = self.shared.queues.lock() {
            queues.clear();
        }
        if let Ok(mut bindings) = self.shared.bindings.lock() {
            bindings.clear();
        }
    }

    /// Number of `bind_queue` calls received so far.
    #[must_use]
    pub fn bind_calls(&self) -> usize {
        self.shared.bind_calls.load(Ordering::Relaxed)
    }

    /// Push a raw frame through the exchange, bypassing any client. Lets
    /// tests deliver payloads a well-behaved publisher would never send.
    pub fn inject_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.shared.route(exchange, routing_key, payload, None)
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn open(&self, _url: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
        if let Some(err) = self.shared.take_failure(BrokerOp::Open) {
            return Err(err);
        }
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            owned_queues: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    /// Queues declared through this connection; exclusive, so they die
    /// with it.
    owned_queues: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        if let Some(err) = self.shared.take_failure(BrokerOp::OpenChannel) {
            return Err(err);
        }
        Ok(Box::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            owned_queues: Arc::clone(&self.owned_queues),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let owned: Vec<String> = {
            let Ok(mut owned) = self.owned_queues.lock() else {
                return Ok(());
            };
            owned.drain(..).collect()
        };
        if let Ok(mut queues) = self.shared.queues.lock() {
            for name in &owned {
                queues.remove(name);
            }
        }
        if let Ok(mut bindings) = self.shared.bindings.lock() {
            bindings.retain(|b| !owned.contains(&b.queue));
        }
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    owned_queues: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError> {
        if let Some(err) = self.shared.take_failure(BrokerOp::DeclareExchange) {
            return Err(err);
        }
        if let Ok(mut exchanges) = self.shared.exchanges.lock() {
            exchanges.insert(name.to_string());
        }
        Ok(())
    }

    async fn declare_queue(&self) -> Result<String, TransportError> {
        if let Some(err) = self.shared.take_failure(BrokerOp::DeclareQueue) {
            return Err(err);
        }
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        if let Ok(mut queues) = self.shared.queues.lock() {
            queues.insert(name.clone(), None);
        }
        if let Ok(mut owned) = self.owned_queues.lock() {
            owned.push(name.clone());
        }
        Ok(name)
    }

    async fn consume(&self, queue: &str) -> Result<ConsumeStart, TransportError> {
        if let Some(err) = self.shared.take_failure(BrokerOp::Consume) {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        {
            let Ok(mut queues) = self.shared.queues.lock() else {
                return Err(TransportError::Consume("broker state unavailable".into()));
            };
            let Some(slot) = queues.get_mut(queue) else {
                return Err(TransportError::Consume(format!("unknown queue: {queue}")));
            };
            *slot = Some(tx);
        }
        Ok(ConsumeStart {
            consumer_tag: format!("ctag-{}", Uuid::new_v4().simple()),
            deliveries: rx,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        self.shared.bind_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.shared.take_failure(BrokerOp::Bind) {
            return Err(err);
        }
        let Some(pattern) = BindingPattern::compile(binding_key) else {
            return Err(TransportError::Bind(format!(
                "invalid binding key: {binding_key}"
            )));
        };
        let Ok(mut bindings) = self.shared.bindings.lock() else {
            return Err(TransportError::Bind("broker state unavailable".into()));
        };
        // Re-binding the same key is idempotent, as on a real broker.
        let exists = bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.pattern.as_str() == binding_key
        });
        if !exists {
            bindings.push(MemoryBinding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern,
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        reply_to: &str,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.shared.take_failure(BrokerOp::Publish) {
            return Err(err);
        }
        let reply_to = (!reply_to.is_empty()).then(|| reply_to.to_string());
        self.shared.route(exchange, routing_key, payload, reply_to)
    }
}
