// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded queue between packet senders and the writer task.
//!
//! Pushes never block: when the queue is full the packet is dropped, as
//! media senders must not stall on a slow peer. Pulls resolve to `None`
//! once every sender is gone, which is how the writer task learns to exit.

use tokio::sync::mpsc;

pub(crate) struct Sender<T>(mpsc::Sender<T>);

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

pub(crate) struct Receiver<T>(mpsc::Receiver<T>);

pub(crate) fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Sender(tx), Receiver(rx))
}

impl<T> Sender<T> {
    /// Enqueues `v`, returning false if it was dropped (queue full or closed).
    pub(crate) fn push(&self, v: T) -> bool {
        self.0.try_send(v).is_ok()
    }
}

impl<T> Receiver<T> {
    /// Dequeues the next value, or `None` once all senders have been dropped.
    pub(crate) async fn pull(&mut self) -> Option<T> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_drops_when_full() {
        let (tx, mut rx) = bounded(2);
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert!(!tx.push(3));
        assert_eq!(rx.pull().await, Some(1));
        assert_eq!(rx.pull().await, Some(2));
        assert!(tx.push(4));
        drop(tx);
        assert_eq!(rx.pull().await, Some(4));
        assert_eq!(rx.pull().await, None);
    }
}
