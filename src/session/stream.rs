//! Bounded, ordered streams handed to the application.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Consumer side of a bounded FIFO of decoded events.
///
/// Intended for a single logical consumer. The producer blocks when the
/// stream is full, so a consumer that stops reading eventually stalls the
/// dispatcher feeding it. The stream ends after the session shuts down and
/// buffered items are drained.
#[derive(Debug)]
pub struct BroadcastStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> BroadcastStream<T> {
    /// Receive the next event, or `None` once the stream is closed and empty.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Stream for BroadcastStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer side, owned by exactly one dispatcher at a time.
///
/// `close` drops the underlying sender so the consumer sees the end of the
/// stream; sends after that are discarded.
#[derive(Debug)]
pub(crate) struct StreamSender<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T> StreamSender<T> {
    /// Send, waiting for room. Returns false if the stream is closed or the
    /// consumer is gone.
    pub(crate) async fn send(&self, item: T) -> bool {
        let tx = match self.sender() {
            Some(tx) => tx,
            None => return false,
        };
        tx.send(item).await.is_ok()
    }

    /// Send only if there is room. Returns false if the item was dropped.
    pub(crate) fn try_send(&self, item: T) -> bool {
        self.sender().is_some_and(|tx| tx.try_send(item).is_ok())
    }

    pub(crate) fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Create a bounded stream pair. `capacity` is clamped to at least 1.
pub(crate) fn bounded<T>(capacity: usize) -> (StreamSender<T>, BroadcastStream<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamSender {
            tx: Mutex::new(Some(tx)),
        },
        BroadcastStream { rx },
    )
}
