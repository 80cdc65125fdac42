//! Connection manager: drives the connect pipeline, owns the connection
//! state, replays bindings, and schedules backoff reconnects.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info};

use crate::domain::{BusConfig, BusError, ReconnectBackoff, TransportError};
use crate::events::BusEvent;
use crate::ports::{BrokerChannel, BrokerConnection, BrokerTransport, Delivery};

/// Connection lifecycle state. Transitions are owned solely by the
/// [`ConnectionManager`]; nothing outside the pipeline driver mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport. Initial state, and the state during a backoff wait.
    Disconnected,
    /// The connect pipeline is in flight.
    Connecting,
    /// Consuming and able to publish.
    Ready,
}

/// Whether a binding registration took effect immediately or was recorded
/// for replay during the next successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The queue was bound on the broker.
    Bound,
    /// The key was recorded; the bind happens at the next connect.
    Pending,
}

/// Where the manager forwards inbound deliveries after self-filtering.
///
/// The bus façade implements this with its dispatch logic.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Handle one inbound frame.
    async fn on_delivery(&self, routing_key: &str, payload: &[u8]);
}

/// Mutable connection state, guarded by one mutex so a retry timer and an
/// in-flight pipeline can never mutate it concurrently.
struct Inner {
    state: ConnectionState,
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<Box<dyn BrokerChannel>>,
    queue: Option<String>,
    consumer_tag: Option<String>,
    /// Registered binding keys, deduplicated, kept for replay.
    binding_keys: Vec<String>,
    /// True once `connect()` has been invoked at least once.
    connect_attempted: bool,
    backoff: ReconnectBackoff,
    /// Incremented on every teardown; lets a pump from a dead connection
    /// recognize it is stale.
    epoch: u64,
}

/// Drives the connect sequence against the broker port, tracks connection
/// state, replays bindings, and triggers reconnection on failure.
pub struct ConnectionManager {
    config: BusConfig,
    transport: Arc<dyn BrokerTransport>,
    events: broadcast::Sender<BusEvent>,
    sink: Arc<dyn DeliverySink>,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(
        config: BusConfig,
        transport: Arc<dyn BrokerTransport>,
        events: broadcast::Sender<BusEvent>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        let backoff = ReconnectBackoff::new(config.min_reconnect(), config.max_reconnect());
        Self {
            config,
            transport,
            events,
            sink,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                connection: None,
                channel: None,
                queue: None,
                consumer_tag: None,
                binding_keys: Vec::new(),
                connect_attempted: false,
                backoff,
                epoch: 0,
            }),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Run the connect pipeline.
    ///
    /// Allowed only from `Disconnected`; a call while `Connecting` or
    /// `Ready` fails with [`BusError::AlreadyConnected`] and performs no
    /// action. On pipeline failure the manager tears down, emits events,
    /// and (with auto-reconnect) schedules a retry before returning the
    /// error.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BusError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Disconnected => {
                    inner.state = ConnectionState::Connecting;
                    inner.connect_attempted = true;
                }
                ConnectionState::Connecting | ConnectionState::Ready => {
                    return Err(BusError::AlreadyConnected);
                }
            }
        }
        match self.run_pipeline().await {
            Ok(()) => {
                info!(exchange = %self.config.exchange_name, "connection ready");
                self.emit(BusEvent::Connected);
                Ok(())
            }
            Err(err) => {
                let reported = err.clone();
                self.handle_failure(err).await;
                Err(BusError::Transport(reported))
            }
        }
    }

    /// Publish a payload to the configured exchange.
    ///
    /// Fails with [`BusError::NotConnected`] unless `Ready`. The own
    /// consumer tag rides along as the reply-to marker so receivers can
    /// filter self-sent messages.
    pub async fn send(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let inner = self.inner.lock().await;
        if inner.state != ConnectionState::Ready {
            return Err(BusError::NotConnected);
        }
        let Some(channel) = inner.channel.as_ref() else {
            return Err(BusError::NotConnected);
        };
        let reply_to = inner.consumer_tag.clone().unwrap_or_default();
        channel
            .publish(&self.config.exchange_name, routing_key, payload, &reply_to)
            .await?;
        debug!(routing_key, "message published");
        Ok(())
    }

    /// Register a binding key.
    ///
    /// Idempotent: an already-registered key causes no second bind call.
    /// While `Ready` the bind is issued immediately; while `Connecting`,
    /// or while `Disconnected` after a connect attempt, the key is
    /// recorded and replayed by the next successful pipeline. When no
    /// connect was ever attempted the key is still recorded, but the call
    /// reports [`BusError::NotConnected`].
    pub async fn register_binding_key(&self, binding_key: &str) -> Result<BindOutcome, BusError> {
        let mut inner = self.inner.lock().await;
        let already = inner.binding_keys.iter().any(|k| k == binding_key);
        if !already {
            inner.binding_keys.push(binding_key.to_string());
        }
        match inner.state {
            ConnectionState::Ready => {
                if already {
                    return Ok(BindOutcome::Bound);
                }
                let (Some(channel), Some(queue)) = (inner.channel.as_ref(), inner.queue.as_ref())
                else {
                    return Err(BusError::NotConnected);
                };
                channel
                    .bind_queue(queue, &self.config.exchange_name, binding_key)
                    .await?;
                debug!(binding_key, "binding registered");
                Ok(BindOutcome::Bound)
            }
            ConnectionState::Connecting => Ok(BindOutcome::Pending),
            ConnectionState::Disconnected => {
                if inner.connect_attempted {
                    Ok(BindOutcome::Pending)
                } else {
                    Err(BusError::NotConnected)
                }
            }
        }
    }

    /// The ordered pipeline: open, channel, exchange, queue, consume,
    /// bind replay. Each step starts only after the previous completed.
    async fn run_pipeline(self: &Arc<Self>) -> Result<(), TransportError> {
        let url = self.config.amqp_url();
        debug!(host = %self.config.host, port = self.config.port, "opening broker connection");
        let connection = self.transport.open(&url).await?;

        let snapshot = { self.inner.lock().await.binding_keys.clone() };
        match Self::establish(connection.as_ref(), &self.config, &snapshot).await {
            Ok((channel, queue, consumer_tag, deliveries)) => {
                let mut inner = self.inner.lock().await;
                // Keys registered while the pipeline ran were not in the
                // snapshot; bind them before going ready so nothing
                // matching them is missed.
                let missed: Vec<String> = inner
                    .binding_keys
                    .iter()
                    .filter(|k| !snapshot.contains(k))
                    .cloned()
                    .collect();
                for key in &missed {
                    if let Err(err) = channel
                        .bind_queue(&queue, &self.config.exchange_name, key)
                        .await
                    {
                        drop(inner);
                        let _ = connection.close().await;
                        return Err(err);
                    }
                }
                inner.connection = Some(connection);
                inner.channel = Some(channel);
                inner.queue = Some(queue);
                inner.consumer_tag = Some(consumer_tag.clone());
                inner.backoff.reset();
                inner.state = ConnectionState::Ready;
                let epoch = inner.epoch;
                drop(inner);
                self.spawn_pump(deliveries, consumer_tag, epoch);
                Ok(())
            }
            Err(err) => {
                let _ = connection.close().await;
                Err(err)
            }
        }
    }

    /// Steps 2-6 of the pipeline, run against a fresh connection.
    async fn establish(
        connection: &dyn BrokerConnection,
        config: &BusConfig,
        binding_keys: &[String],
    ) -> Result<
        (
            Box<dyn BrokerChannel>,
            String,
            String,
            mpsc::Receiver<Delivery>,
        ),
        TransportError,
    > {
        let channel = connection.open_channel().await?;
        channel.declare_exchange(&config.exchange_name).await?;
        let queue = channel.declare_queue().await?;
        let consume = channel.consume(&queue).await?;
        for key in binding_keys {
            channel
                .bind_queue(&queue, &config.exchange_name, key)
                .await?;
        }
        Ok((channel, queue, consume.consumer_tag, consume.deliveries))
    }

    /// Forward deliveries from the broker consumer to the sink, dropping
    /// self-sent frames when `no_local` is set. Channel closure means the
    /// broker connection died.
    fn spawn_pump(
        self: &Arc<Self>,
        mut deliveries: mpsc::Receiver<Delivery>,
        own_tag: String,
        epoch: u64,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if manager.config.no_local
                    && delivery.reply_to.as_deref() == Some(own_tag.as_str())
                {
                    debug!(routing_key = %delivery.routing_key, "self-published delivery dropped");
                    continue;
                }
                manager
                    .sink
                    .on_delivery(&delivery.routing_key, &delivery.payload)
                    .await;
            }
            let current = {
                let inner = manager.inner.lock().await;
                inner.epoch == epoch && inner.state == ConnectionState::Ready
            };
            if current {
                manager.handle_failure(TransportError::ConnectionLost).await;
            }
        });
    }

    /// Teardown after a pipeline failure or a lost connection: emit the
    /// error, close and clear the transport, go `Disconnected`, and (with
    /// auto-reconnect) arm a one-shot retry timer.
    ///
    /// Returns a boxed future: `connect` awaits this and the retry timer
    /// spawned here awaits `connect`, so the signature must erase the
    /// future type to break the async recursion cycle for `Send`.
    fn handle_failure(
        self: &Arc<Self>,
        err: TransportError,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.handle_failure_inner(err))
    }

    async fn handle_failure_inner(self: &Arc<Self>, err: TransportError) {
        error!(error = %err, "broker transport failure");
        self.emit(BusEvent::Error(err.to_string()));
        let retry_in = {
            let mut inner = self.inner.lock().await;
            if let Some(connection) = inner.connection.take() {
                let _ = connection.close().await;
            }
            inner.channel = None;
            inner.queue = None;
            inner.consumer_tag = None;
            inner.state = ConnectionState::Disconnected;
            inner.epoch += 1;
            if self.config.auto_reconnect {
                let delay = inner.backoff.current();
                inner.backoff.grow();
                Some(delay)
            } else {
                None
            }
        };
        self.emit(BusEvent::Disconnected);
        if let Some(delay) = retry_in {
            info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = manager.connect().await {
                    debug!(error = %err, "scheduled reconnect attempt failed");
                }
            });
        }
    }

    /// Best-effort broadcast; a bus owner without listeners is fine.
    fn emit(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }
}
