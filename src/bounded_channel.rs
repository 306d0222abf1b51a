// SPDX-License-Identifier: Apache-2.0

//! Bounded channels linking the stages of a watcher pipeline.
//!
//! A send suspends while the channel is at capacity, so a slow stage
//! throttles everything upstream of it instead of dropping lines. A closed
//! channel ends a stage cleanly: senders get `ChannelClosed` once the
//! receiving stage is gone, receivers get `None` once the producing stage
//! is gone.

use flume::{Receiver, Sender};
use std::fmt;

/// The receiving half was dropped; nothing downstream is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel closed")
    }
}

impl std::error::Error for ChannelClosed {}

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

impl<T> BoundedSender<T> {
    /// Deliver `item`, suspending while the channel is at capacity.
    pub async fn send(&self, item: T) -> Result<(), ChannelClosed> {
        self.tx.send_async(item).await.map_err(|_e| ChannelClosed)
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// The next item, or None once the sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }
}

pub fn bounded<T>(capacity: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(capacity);

    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{ChannelClosed, bounded};
    use tokio_test::{assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn send_then_recv() {
        let (tx, mut rx) = bounded(2);

        tx.send("error line").await.unwrap();
        assert_eq!(rx.recv().await, Some("error line"));
    }

    #[tokio::test]
    async fn full_channel_applies_backpressure() {
        let (tx, mut rx) = bounded(1);

        tx.send(1).await.unwrap();

        // at capacity: the next send suspends until the receiver drains
        let mut blocked = spawn(tx.send(2));
        assert_pending!(blocked.poll());

        assert_eq!(rx.recv().await, Some(1));

        assert!(blocked.is_woken());
        assert_ready!(blocked.poll()).unwrap();
        drop(blocked);

        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn recv_drains_then_ends_after_sender_drops() {
        let (tx, mut rx) = bounded::<u8>(1);

        tx.send(9).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(9));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn send_fails_after_receiver_drops() {
        let (tx, rx) = bounded(1);

        drop(rx);
        assert_eq!(tx.send(1).await, Err(ChannelClosed));
    }
}
