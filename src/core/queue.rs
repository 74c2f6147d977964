// Bounded MPMC queues between pipeline stages; every wait also races cancellation.
use crossbeam_channel::{Receiver, Sender, select};

use crate::core::cancel::CancellationToken;

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Push {
    Sent,
    Closed,
    Cancelled,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Pop<T> {
    Item(T),
    Closed,
    Cancelled,
}

/// Create a queue holding at most `capacity` items.
///
/// The queue closes for consumers once every `QueueSender` is dropped and the
/// buffer drains; it closes for producers once every `QueueReceiver` is dropped.
pub(crate) fn work_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

pub(crate) struct QueueSender<T> {
    tx: Sender<T>,
}

pub(crate) struct QueueReceiver<T> {
    rx: Receiver<T>,
}

impl<T> QueueSender<T> {
    /// Blocks while the queue is full.
    pub(crate) fn push(&self, item: T, cancel: &CancellationToken) -> Push {
        if cancel.is_cancelled() {
            return Push::Cancelled;
        }
        select! {
            send(self.tx, item) -> sent => match sent {
                Ok(()) => Push::Sent,
                Err(_) => Push::Closed,
            },
            recv(cancel.signal()) -> _ => Push::Cancelled,
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Blocks while the queue is empty and still open.
    pub(crate) fn pop(&self, cancel: &CancellationToken) -> Pop<T> {
        if cancel.is_cancelled() {
            return Pop::Cancelled;
        }
        select! {
            recv(self.rx) -> item => match item {
                Ok(item) => Pop::Item(item),
                Err(_) => Pop::Closed,
            },
            recv(cancel.signal()) -> _ => Pop::Cancelled,
        }
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}
