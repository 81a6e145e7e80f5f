//! In-process broker for local development and testing.
//!
//! Queues buffer messages while nobody consumes them, like durable broker
//! queues. Published messages are recorded and can be observed by a test
//! acting as the server. Faults can be injected to exercise reconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{BrokerChannel, BrokerConnection, Deliveries, Delivery, Result, Transport, TransportError};

/// A message published through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Queue {
    buffer: VecDeque<Delivery>,
    consumer: Option<(u64, mpsc::UnboundedSender<Delivery>)>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    published: Vec<Published>,
    observers: Vec<mpsc::UnboundedSender<Published>>,
    refuse_consume: HashSet<String>,
    fail_publish: Option<TransportError>,
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InProcessBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel_id: Arc<AtomicU64>,
    connections: Arc<AtomicUsize>,
    failing_connects: Arc<AtomicUsize>,
    closing_publishes: Arc<AtomicUsize>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent across a panicking holder; keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver a message to a queue, as the server would.
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let delivery = Delivery {
            routing_key: queue.to_string(),
            body: body.into(),
        };
        let mut state = self.lock();
        let entry = state.queues.entry(queue.to_string()).or_default();

        if let Some((_, tx)) = &entry.consumer {
            match tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    entry.consumer = None;
                    entry.buffer.push_back(returned);
                    return;
                }
            }
        }
        entry.buffer.push_back(delivery);
    }

    /// Observe every message published from now on.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<Published> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().observers.push(tx);
        rx
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Number of successful dials.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of messages waiting in a queue with no consumer attached.
    pub fn backlog(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.buffer.len())
            .unwrap_or(0)
    }

    /// Whether a consumer is currently attached to the queue.
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.as_ref().is_some_and(|(_, tx)| !tx.is_closed()))
    }

    /// Close every open channel, as a peer-initiated channel close would.
    pub fn close_all_channels(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            Self::close_channel_locked(&mut state, id);
        }
        info!("Closed all in-process channels");
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes close their channel and fail with
    /// `ChannelClosed`.
    pub fn close_on_next_publishes(&self, n: usize) {
        self.closing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make every publish fail with `error` until cleared with `None`.
    pub fn fail_publishes(&self, error: Option<TransportError>) {
        self.lock().fail_publish = error;
    }

    /// Refuse consumers on a queue, as a broker would for a missing queue.
    pub fn refuse_consume(&self, queue: &str, refuse: bool) {
        let mut state = self.lock();
        if refuse {
            state.refuse_consume.insert(queue.to_string());
        } else {
            state.refuse_consume.remove(queue);
        }
    }

    fn close_channel_locked(state: &mut BrokerState, id: u64) {
        if let Some(closed) = state.channels.remove(&id) {
            closed.store(true, Ordering::SeqCst);
        }
        for queue in state.queues.values_mut() {
            if matches!(queue.consumer, Some((owner, _)) if owner == id) {
                queue.consumer = None;
            }
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for InProcessBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>> {
        if Self::take_one(&self.failing_connects) {
            return Err(TransportError::Connection(
                "in-process broker refused connection".to_string(),
            ));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InProcessConnection {
            broker: self.clone(),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        "in-process".to_string()
    }
}

struct InProcessConnection {
    broker: InProcessBroker,
    channels: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for InProcessConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelOpen("connection is closed".to_string()));
        }
        let id = self.broker.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        self.broker.lock().channels.insert(id, closed.clone());
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);

        debug!(channel_id = id, "Opened in-process channel");

        Ok(Arc::new(InProcessChannel {
            id,
            broker: self.broker.clone(),
            closed,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let ids = std::mem::take(
            &mut *self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut state = self.broker.lock();
        for id in ids {
            InProcessBroker::close_channel_locked(&mut state, id);
        }
        Ok(())
    }
}

struct InProcessChannel {
    id: u64,
    broker: InProcessBroker,
    closed: Arc<AtomicBool>,
}

impl InProcessChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed(format!(
                "channel {} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InProcessChannel {
    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if state.refuse_consume.contains(queue) {
            return Err(TransportError::Consume(format!("no queue '{}'", queue)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let entry = state.queues.entry(queue.to_string()).or_default();
        for delivery in entry.buffer.drain(..) {
            // Receiver is alive in this scope.
            let _ = tx.send(delivery);
        }
        entry.consumer = Some((self.id, tx));

        debug!(queue = %queue, channel_id = self.id, "In-process consumer attached");

        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;

        if InProcessBroker::take_one(&self.broker.closing_publishes) {
            let mut state = self.broker.lock();
            InProcessBroker::close_channel_locked(&mut state, self.id);
            return Err(TransportError::ChannelClosed(format!(
                "channel {} closed by peer",
                self.id
            )));
        }

        let mut state = self.broker.lock();
        if let Some(error) = state.fail_publish.clone() {
            return Err(error);
        }

        let message = Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        };
        state.published.push(message.clone());
        state
            .observers
            .retain(|observer| observer.send(message.clone()).is_ok());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        InProcessBroker::close_channel_locked(&mut state, self.id);
        Ok(())
    }
}
