//! Connection manager: owns the broker connection and the channel pair.
//!
//! Every rebuild bumps a generation counter. A publisher that sees the
//! channel closed passes the generation it published on; if another caller
//! already rebuilt past it, the reconnect is skipped and the publish simply
//! retried on the new channel. This keeps concurrent failures down to one
//! rebuild.
//!
//! A rebuild never aborts the old consumers. Closing the old channel ends
//! their delivery streams; each replacement consumer waits for its
//! predecessor on the same queue to finish dispatching what it already took
//! before it starts, so nothing received is lost and queue order holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::transport::{BrokerChannel, BrokerConnection, Deliveries, Transport, TransportError};
use crate::utils::retry::dial_backoff;

use super::dispatch::{run_consumer, DeliverySink};
use super::ClientError;

/// Where requests are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Link state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Channels are open and consumers are running.
    Open,
    /// A reconnect failed part-way; publishing is refused until an explicit
    /// reconnect succeeds.
    Broken,
    /// Shut down.
    Closed,
}

/// A consumer to (re)start on every rebuild.
pub(crate) struct Subscription {
    pub(crate) queue: String,
    pub(crate) sink: Arc<dyn DeliverySink>,
}

struct Wiring {
    state: LinkState,
    generation: u64,
    connection: Option<Arc<dyn BrokerConnection>>,
    inbound: Option<Arc<dyn BrokerChannel>>,
    outbound: Option<Arc<dyn BrokerChannel>>,
    consumers: Vec<Consumer>,
    /// Predecessors still dispatching deliveries from a closed channel.
    draining: Vec<AbortHandle>,
}

impl Wiring {
    fn abort_consumers(&mut self) {
        for consumer in self.consumers.drain(..) {
            consumer.task.abort();
        }
        for predecessor in self.draining.drain(..) {
            predecessor.abort();
        }
    }
}

struct Consumer {
    queue: String,
    task: JoinHandle<()>,
}

/// Freshly dialed connection with both channels open.
struct Link {
    connection: Arc<dyn BrokerConnection>,
    inbound: Arc<dyn BrokerChannel>,
    outbound: Arc<dyn BrokerChannel>,
}

pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    target: PublishTarget,
    dial_attempts: usize,
    wiring: RwLock<Wiring>,
    reconnect_lock: Mutex<()>,
    subscriptions: std::sync::Mutex<Vec<Arc<Subscription>>>,
}

impl ConnectionManager {
    /// Dial, open both channels and start the given consumers.
    pub(crate) async fn connect(
        transport: Arc<dyn Transport>,
        target: PublishTarget,
        dial_attempts: usize,
        subscriptions: Vec<Subscription>,
    ) -> Result<Self, ClientError> {
        let manager = Self {
            transport,
            target,
            dial_attempts: dial_attempts.max(1),
            wiring: RwLock::new(Wiring {
                state: LinkState::Broken,
                generation: 0,
                connection: None,
                inbound: None,
                outbound: None,
                consumers: Vec::new(),
                draining: Vec::new(),
            }),
            reconnect_lock: Mutex::new(()),
            subscriptions: std::sync::Mutex::new(
                subscriptions.into_iter().map(Arc::new).collect(),
            ),
        };

        let link = manager.dial().await?;
        let subscriptions = manager.subscriptions();
        let streams = match Self::start_streams(&link, &subscriptions).await {
            Ok(streams) => streams,
            Err(e) => {
                Self::close_link(link).await;
                return Err(e.into());
            }
        };
        manager.install(link, subscriptions, streams).await;

        info!(endpoint = %manager.transport.endpoint(), "Session connected");
        Ok(manager)
    }

    pub(crate) async fn state(&self) -> LinkState {
        self.wiring.read().await.state
    }

    pub(crate) async fn generation(&self) -> u64 {
        self.wiring.read().await.generation
    }

    fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn is_subscribed(&self, queue: &str) -> bool {
        self.subscriptions()
            .iter()
            .any(|subscription| subscription.queue == queue)
    }

    /// Start a consumer on the current inbound channel and record it so
    /// reconnects restart it.
    pub(crate) async fn add_subscription(&self, subscription: Subscription) -> Result<(), ClientError> {
        let _rebuild = self.reconnect_lock.lock().await;
        let mut wiring = self.wiring.write().await;

        match wiring.state {
            LinkState::Open => {}
            LinkState::Broken => return Err(ClientError::Broken),
            LinkState::Closed => return Err(ClientError::Closed),
        }

        if self.is_subscribed(&subscription.queue) {
            return Err(ClientError::AlreadySubscribed {
                topic: subscription.queue,
            });
        }

        let inbound = wiring.inbound.clone().ok_or(ClientError::Broken)?;
        let deliveries = inbound.consume(&subscription.queue).await?;

        let subscription = Arc::new(subscription);
        wiring
            .consumers
            .push(Self::spawn_consumer(&subscription, deliveries, None));
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscription);
        Ok(())
    }

    /// Publish on the outbound channel.
    ///
    /// A "channel closed" failure triggers one reconnect and one retry; a
    /// second failure is returned as is. Other errors are returned directly.
    pub(crate) async fn publish(&self, body: &[u8]) -> Result<(), ClientError> {
        let (generation, channel) = self.outbound().await?;

        match channel
            .publish(&self.target.exchange, &self.target.routing_key, body)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_channel_closed() => {
                warn!(error = %e, generation, "Outbound channel closed, reconnecting");
                self.reconnect_from(generation).await?;

                let (_, channel) = self.outbound().await?;
                channel
                    .publish(&self.target.exchange, &self.target.routing_key, body)
                    .await
                    .map_err(|e| {
                        error!(error = %e, "Publish failed after reconnect");
                        ClientError::Transport(e)
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn outbound(&self) -> Result<(u64, Arc<dyn BrokerChannel>), ClientError> {
        let wiring = self.wiring.read().await;
        match wiring.state {
            LinkState::Open => {}
            LinkState::Broken => return Err(ClientError::Broken),
            LinkState::Closed => return Err(ClientError::Closed),
        }
        let channel = wiring.outbound.clone().ok_or(ClientError::Broken)?;
        Ok((wiring.generation, channel))
    }

    /// Rebuild unconditionally. Also recovers a `Broken` session.
    pub(crate) async fn reconnect(&self) -> Result<(), ClientError> {
        let _rebuild = self.reconnect_lock.lock().await;
        self.rebuild().await
    }

    /// Rebuild unless another caller already replaced `generation`.
    async fn reconnect_from(&self, generation: u64) -> Result<(), ClientError> {
        let _rebuild = self.reconnect_lock.lock().await;

        let current = self.wiring.read().await;
        match current.state {
            LinkState::Closed => return Err(ClientError::Closed),
            LinkState::Broken => return Err(ClientError::Broken),
            LinkState::Open if current.generation != generation => {
                info!(generation = current.generation, "Already reconnected");
                return Ok(());
            }
            LinkState::Open => {}
        }
        drop(current);

        self.rebuild().await
    }

    /// Caller holds `reconnect_lock`.
    async fn rebuild(&self) -> Result<(), ClientError> {
        if self.wiring.read().await.state == LinkState::Closed {
            return Err(ClientError::Closed);
        }

        // (1) new connection and channels
        let link = self.dial().await?;

        // (2) close the old wiring, best-effort. The closed references stay
        // installed so concurrent publishers fail with "channel closed" and
        // queue up behind this rebuild. Old consumers keep running until
        // their streams end.
        let old = {
            let wiring = self.wiring.read().await;
            (
                wiring.inbound.clone(),
                wiring.outbound.clone(),
                wiring.connection.clone(),
            )
        };
        Self::close_resources(old.0, old.1, old.2).await;

        // (3) restart every consumer, all or nothing
        let subscriptions = self.subscriptions();
        let streams = match Self::start_streams(&link, &subscriptions).await {
            Ok(streams) => streams,
            Err(e) => {
                error!(error = %e, "Failed to restart consumers, session is unusable");
                Self::close_link(link).await;
                let mut wiring = self.wiring.write().await;
                wiring.state = LinkState::Broken;
                wiring.inbound = None;
                wiring.outbound = None;
                wiring.connection = None;
                return Err(e.into());
            }
        };

        let count = subscriptions.len();
        self.install(link, subscriptions, streams).await;
        info!(consumers = count, "Reconnected");
        Ok(())
    }

    async fn dial(&self) -> Result<Link, TransportError> {
        let transport = self.transport.clone();
        (|| {
            let transport = transport.clone();
            async move {
                let connection: Arc<dyn BrokerConnection> = Arc::from(transport.connect().await?);
                match Self::open_pair(connection.as_ref()).await {
                    Ok((inbound, outbound)) => Ok(Link {
                        connection,
                        inbound,
                        outbound,
                    }),
                    Err(e) => {
                        if let Err(close) = connection.close().await {
                            warn!(error = %close, "Failed to close half-open connection");
                        }
                        Err(e)
                    }
                }
            }
        })
        .retry(dial_backoff(self.dial_attempts))
        .notify(|err: &TransportError, dur: Duration| {
            warn!(
                endpoint = %self.transport.endpoint(),
                error = %err,
                delay = ?dur,
                "Dial failed, retrying"
            );
        })
        .await
    }

    async fn open_pair(
        connection: &dyn BrokerConnection,
    ) -> Result<(Arc<dyn BrokerChannel>, Arc<dyn BrokerChannel>), TransportError> {
        let inbound = connection.open_channel().await?;
        let outbound = connection.open_channel().await?;
        Ok((inbound, outbound))
    }

    async fn start_streams(
        link: &Link,
        subscriptions: &[Arc<Subscription>],
    ) -> Result<Vec<Deliveries>, TransportError> {
        let mut streams = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            streams.push(link.inbound.consume(&subscription.queue).await?);
        }
        Ok(streams)
    }

    async fn install(
        &self,
        link: Link,
        subscriptions: Vec<Arc<Subscription>>,
        streams: Vec<Deliveries>,
    ) {
        let mut wiring = self.wiring.write().await;

        let mut predecessors: HashMap<String, JoinHandle<()>> = wiring
            .consumers
            .drain(..)
            .map(|consumer| (consumer.queue, consumer.task))
            .collect();
        wiring.draining.retain(|predecessor| !predecessor.is_finished());

        let mut consumers = Vec::with_capacity(subscriptions.len());
        for (subscription, deliveries) in subscriptions.iter().zip(streams) {
            let predecessor = predecessors.remove(&subscription.queue);
            if let Some(predecessor) = &predecessor {
                wiring.draining.push(predecessor.abort_handle());
            }
            consumers.push(Self::spawn_consumer(subscription, deliveries, predecessor));
        }
        for (_, orphan) in predecessors {
            wiring.draining.push(orphan.abort_handle());
        }

        wiring.connection = Some(link.connection);
        wiring.inbound = Some(link.inbound);
        wiring.outbound = Some(link.outbound);
        wiring.consumers = consumers;
        wiring.generation += 1;
        wiring.state = LinkState::Open;
    }

    /// Spawn a consumer loop. With a `predecessor`, the loop starts once the
    /// previous consumer of the same queue has finished.
    fn spawn_consumer(
        subscription: &Arc<Subscription>,
        deliveries: Deliveries,
        predecessor: Option<JoinHandle<()>>,
    ) -> Consumer {
        let queue = subscription.queue.clone();
        let sink = subscription.sink.clone();

        let task = tokio::spawn({
            let queue = queue.clone();
            async move {
                if let Some(predecessor) = predecessor {
                    if let Err(e) = predecessor.await {
                        if e.is_panic() {
                            error!(queue = %queue, error = %e, "Previous consumer panicked");
                        }
                    }
                }
                run_consumer(queue, deliveries, sink).await
            }
        });

        Consumer { queue, task }
    }

    async fn close_link(link: Link) {
        Self::close_resources(Some(link.inbound), Some(link.outbound), Some(link.connection)).await;
    }

    async fn close_resources(
        inbound: Option<Arc<dyn BrokerChannel>>,
        outbound: Option<Arc<dyn BrokerChannel>>,
        connection: Option<Arc<dyn BrokerConnection>>,
    ) {
        for (name, channel) in [("inbound", inbound), ("outbound", outbound)] {
            if let Some(channel) = channel {
                if let Err(e) = channel.close().await {
                    warn!(channel = name, error = %e, "Failed to close channel");
                }
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close connection");
            }
        }
    }

    /// Stop everything: streams first, then `on_streams_closed`, then
    /// channels, then the connection.
    ///
    /// Idempotent; returns false if already shut down.
    pub(crate) async fn shutdown(&self, on_streams_closed: impl FnOnce()) -> bool {
        let _rebuild = self.reconnect_lock.lock().await;
        let mut wiring = self.wiring.write().await;
        if wiring.state == LinkState::Closed {
            return false;
        }
        wiring.state = LinkState::Closed;

        for subscription in self.subscriptions() {
            subscription.sink.close();
        }
        wiring.abort_consumers();
        on_streams_closed();

        let old = (
            wiring.inbound.take(),
            wiring.outbound.take(),
            wiring.connection.take(),
        );
        drop(wiring);
        Self::close_resources(old.0, old.1, old.2).await;
        true
    }
}

impl Drop for ConnectionManager {
    /// Dropped without `shutdown`: stop the consumers, end every stream and
    /// close the connection in the background if a runtime is still around.
    fn drop(&mut self) {
        if self.wiring.get_mut().state == LinkState::Closed {
            return;
        }
        for subscription in self.subscriptions() {
            subscription.sink.close();
        }

        let wiring = self.wiring.get_mut();
        wiring.state = LinkState::Closed;
        wiring.abort_consumers();

        let old = (
            wiring.inbound.take(),
            wiring.outbound.take(),
            wiring.connection.take(),
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(Self::close_resources(old.0, old.1, old.2));
        } else {
            warn!("Session dropped outside a runtime, connection left to the broker");
        }
    }
}
