//! cwapi - Chat Wars broker API client
//!
//! Turns the per-client AMQP queues of the Chat Wars API into a client with
//! fire-and-forget sends, synchronous request/response calls, and typed
//! broadcast feeds, reconnecting transparently when the broker closes a
//! channel.

pub mod config;
pub mod envelope;
pub mod feeds;
pub mod session;
pub mod transport;
pub mod utils;

pub use config::ClientConfig;
pub use envelope::{Action, CorrelationKey, Request, Response, ResultCode};
pub use feeds::{Feed, FeedEvent};
pub use session::{BroadcastStream, ClientError, LinkState, Result, Session, SessionSettings};
