//! Session: the long-lived client handle.
//!
//! This module contains:
//! - `Session`: fire-and-forget sends, synchronous calls, feed subscriptions
//! - `registry`: pending synchronous calls keyed by correlation key
//! - `connection`: broker connection, channel pair, reconnect
//! - `dispatch`: consumer loops feeding the registry and the streams
//! - `stream`: bounded streams handed to the application
//!
//! A synchronous call registers its wait before publishing, so a response
//! that arrives before the publish returns is still matched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::envelope::{self, CorrelationKey, ProtocolError, Request, Response, ResultCode};
use crate::feeds::{Feed, FeedEvent};
use crate::transport::{Transport, TransportError};

pub mod connection;
pub mod dispatch;
pub mod registry;
pub mod stream;

pub use connection::{LinkState, PublishTarget};
pub use dispatch::FeedDecoder;
pub use registry::{CorrelationRegistry, WaitHandle};
pub use stream::BroadcastStream;

use connection::{ConnectionManager, Subscription};
use dispatch::{FeedSink, InboundDispatcher};

/// Largest capacity of a feed stream.
pub const MAX_FEED_CAPACITY: usize = 100;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced to callers of a `Session`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered with a result other than `Ok`.
    #[error("{} failed: {result}", .response.action)]
    Application {
        result: ResultCode,
        response: Box<Response>,
    },

    #[error("No response for key {key} within {after:?}")]
    Timeout { key: CorrelationKey, after: Duration },

    #[error("A call for key {key} is already pending")]
    AlreadyPending { key: CorrelationKey },

    #[error("Already subscribed to '{topic}'")]
    AlreadySubscribed { topic: String },

    #[error("Session is broken after a failed reconnect")]
    Broken,

    #[error("Session is closed")]
    Closed,
}

impl ClientError {
    /// Operation the server wants authorized first, for `Forbidden` results.
    pub fn required_operation(&self) -> Option<&str> {
        match self {
            ClientError::Application { response, .. } => response.required_operation.as_deref(),
            _ => None,
        }
    }
}

/// Session parameters independent of the transport.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub inbound_queue: String,
    pub target: PublishTarget,
    pub call_timeout: Duration,
    pub updates_capacity: usize,
    pub feed_capacity: usize,
    pub dial_attempts: usize,
    /// Prefix of feed queue names.
    pub feed_prefix: String,
}

impl SessionSettings {
    /// Settings for `user` with default sizes and timeouts.
    pub fn for_user(user: &str) -> Self {
        Self::from(&ClientConfig::new(user, ""))
    }

    /// Queue name of a feed.
    pub fn feed_topic(&self, feed: Feed) -> String {
        format!("{}{}", self.feed_prefix, feed.suffix())
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            inbound_queue: config.inbound_queue(),
            target: PublishTarget {
                exchange: config.exchange(),
                routing_key: config.routing_key(),
            },
            call_timeout: config.call_timeout(),
            updates_capacity: config.updates_capacity,
            feed_capacity: config.feed_capacity,
            dial_attempts: config.dial_attempts,
            feed_prefix: config.feed_queue_prefix(),
        }
    }
}

/// A connected API client.
pub struct Session {
    manager: ConnectionManager,
    registry: Arc<CorrelationRegistry>,
    updates: Mutex<Option<BroadcastStream<Response>>>,
    updates_claimed: Arc<AtomicBool>,
    settings: SessionSettings,
}

impl Session {
    /// Connect to the AMQP broker named by `config`.
    #[cfg(feature = "amqp")]
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let transport = Arc::new(crate::transport::AmqpTransport::new(config.url()));
        Self::connect_with(transport, SessionSettings::from(config)).await
    }

    /// Connect over an arbitrary transport.
    ///
    /// Starts the consumer of the inbound queue before returning.
    pub async fn connect_with(transport: Arc<dyn Transport>, settings: SessionSettings) -> Result<Self> {
        let registry = Arc::new(CorrelationRegistry::new());
        let (tx, updates) = stream::bounded(settings.updates_capacity);
        let updates_claimed = Arc::new(AtomicBool::new(false));
        let inbound = Subscription {
            queue: settings.inbound_queue.clone(),
            sink: Arc::new(InboundDispatcher::new(
                registry.clone(),
                tx,
                updates_claimed.clone(),
            )),
        };

        let manager = ConnectionManager::connect(
            transport,
            settings.target.clone(),
            settings.dial_attempts,
            vec![inbound],
        )
        .await?;

        Ok(Self {
            manager,
            registry,
            updates: Mutex::new(Some(updates)),
            updates_claimed,
            settings,
        })
    }

    /// Take the stream of every decoded response. Available once.
    ///
    /// Until taken, the stream keeps the first responses that fit and drops
    /// the rest. Once taken, the dispatcher waits whenever the stream is
    /// full, which also holds back the responses pending calls wait for.
    /// Keep reading it, or drop it.
    pub fn take_updates(&self) -> Option<BroadcastStream<Response>> {
        let updates = self
            .updates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if updates.is_some() {
            self.updates_claimed.store(true, Ordering::Release);
        }
        updates
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub async fn state(&self) -> LinkState {
        self.manager.state().await
    }

    /// Number of connections built so far, the initial one included.
    pub async fn generation(&self) -> u64 {
        self.manager.generation().await
    }

    /// Publish a request without waiting for its response.
    pub async fn send(&self, request: &Request) -> Result<()> {
        let body = envelope::encode_request(request)?;
        self.manager.publish(&body).await?;
        debug!(action = %request.action, "Request sent");
        Ok(())
    }

    /// Publish a request and wait for the response carrying `key`, using the
    /// configured call timeout.
    ///
    /// If the updates stream was taken and is left full, responses stop
    /// being dispatched and calls time out; see `take_updates`.
    pub async fn call(&self, key: impl Into<CorrelationKey>, request: &Request) -> Result<Response> {
        self.call_with_timeout(key, request, self.settings.call_timeout)
            .await
    }

    /// Publish a request and wait up to `timeout` for the response carrying
    /// `key`.
    ///
    /// Non-`Ok` results are returned as `ClientError::Application`.
    pub async fn call_with_timeout(
        &self,
        key: impl Into<CorrelationKey>,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let key = key.into();
        let body = envelope::encode_request(request)?;

        let handle = self.registry.register(key)?;
        self.manager.publish(&body).await?;
        debug!(key = %key, action = %request.action, "Awaiting response");

        let response = handle.wait(timeout).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(ClientError::Application {
                result: response.result,
                response: Box::new(response),
            })
        }
    }

    /// Subscribe to a feed queue, decoding every message with `decode`.
    ///
    /// `capacity` is clamped to `1..=MAX_FEED_CAPACITY`. The subscription
    /// survives reconnects.
    pub async fn subscribe<T, F>(
        &self,
        topic: impl Into<String>,
        capacity: usize,
        decode: F,
    ) -> Result<BroadcastStream<T>>
    where
        T: Send + 'static,
        F: Fn(&[u8]) -> std::result::Result<T, ProtocolError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let (tx, events) = stream::bounded(capacity.clamp(1, MAX_FEED_CAPACITY));
        let decode: FeedDecoder<T> = Arc::new(decode);

        self.manager
            .add_subscription(Subscription {
                queue: topic.clone(),
                sink: Arc::new(FeedSink::new(topic.clone(), decode, tx)),
            })
            .await?;

        info!(topic = %topic, "Subscribed");
        Ok(events)
    }

    /// Subscribe to the feed carrying `F`, under the configured prefix.
    pub async fn subscribe_feed<F: FeedEvent>(&self) -> Result<BroadcastStream<F>> {
        let topic = self.settings.feed_topic(F::FEED);
        self.subscribe(topic, self.settings.feed_capacity, F::decode)
            .await
    }

    /// Rebuild the connection and restart every consumer.
    ///
    /// Recovers a `Broken` session.
    pub async fn reconnect(&self) -> Result<()> {
        self.manager.reconnect().await
    }

    /// Close every stream, fail pending calls with `Closed`, then close the
    /// channels and the connection. Safe to call more than once.
    ///
    /// Dropping the session without this stops the consumers and closes the
    /// connection in the background.
    pub async fn shutdown(&self) {
        let registry = self.registry.clone();
        if self.manager.shutdown(move || registry.clear()).await {
            info!("Session shut down");
        }
    }
}
