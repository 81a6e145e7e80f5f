//! Consumer loops.
//!
//! One loop per open subscription: the main inbound queue feeds the
//! `InboundDispatcher`, each subscribed feed feeds a `FeedSink`. A loop runs
//! until its delivery stream ends (channel closed) or its task is aborted on
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn, Instrument};

use crate::envelope::{self, ProtocolError, Response};
use crate::transport::{Deliveries, Delivery};

use super::registry::CorrelationRegistry;
use super::stream::StreamSender;

/// Receives every delivery of one subscription, in broker order.
#[async_trait]
pub(crate) trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: Delivery);

    /// Close the stream this sink feeds.
    fn close(&self);
}

/// Decoder of one feed's message bodies.
pub type FeedDecoder<T> = Arc<dyn Fn(&[u8]) -> Result<T, ProtocolError> + Send + Sync>;

/// Sink of the main inbound queue.
///
/// Until the application claims the updates stream, responses are only
/// buffered while there is room and dropped after that, so calls keep
/// resolving. Once claimed, a full stream blocks the dispatcher.
pub(crate) struct InboundDispatcher {
    registry: Arc<CorrelationRegistry>,
    updates: StreamSender<Response>,
    claimed: Arc<AtomicBool>,
}

impl InboundDispatcher {
    pub(crate) fn new(
        registry: Arc<CorrelationRegistry>,
        updates: StreamSender<Response>,
        claimed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            updates,
            claimed,
        }
    }
}

#[async_trait]
impl DeliverySink for InboundDispatcher {
    async fn deliver(&self, delivery: Delivery) {
        let response = match envelope::decode(&delivery.body) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Dropping undecodable response"
                );
                return;
            }
        };

        debug!(
            uuid = %response.uuid,
            action = %response.action,
            result = %response.result,
            "Received response"
        );

        // Resolve before the push, which may wait on a full stream.
        if let Some(key) = response.correlation_key() {
            self.registry.resolve(key, response.clone());
        }

        if self.claimed.load(Ordering::Acquire) {
            if !self.updates.send(response).await {
                debug!("Updates stream closed, response not forwarded");
            }
        } else if !self.updates.try_send(response) {
            debug!("Updates stream unclaimed and full, response not forwarded");
        }
    }

    fn close(&self) {
        self.updates.close();
    }
}

/// Sink of one feed.
pub(crate) struct FeedSink<T> {
    topic: String,
    decode: FeedDecoder<T>,
    events: StreamSender<T>,
}

impl<T> FeedSink<T> {
    pub(crate) fn new(topic: String, decode: FeedDecoder<T>, events: StreamSender<T>) -> Self {
        Self {
            topic,
            decode,
            events,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> DeliverySink for FeedSink<T> {
    async fn deliver(&self, delivery: Delivery) {
        match (self.decode)(&delivery.body) {
            Ok(event) => {
                if !self.events.send(event).await {
                    debug!(topic = %self.topic, "Feed stream closed, event not forwarded");
                }
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Dropping undecodable feed event");
            }
        }
    }

    fn close(&self) {
        self.events.close();
    }
}

/// Run one consumer loop to completion.
pub(crate) async fn run_consumer(queue: String, mut deliveries: Deliveries, sink: Arc<dyn DeliverySink>) {
    let span = tracing::info_span!("consumer", queue = %queue);

    async move {
        info!("Consumer running");
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => sink.deliver(delivery).await,
                Err(e) => {
                    warn!(error = %e, "Consumer delivery error, stopping");
                    break;
                }
            }
        }
        info!("Consumer stopped");
    }
    .instrument(span)
    .await
}
