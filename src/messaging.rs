//! Inter-component messaging.
//!
//! Every component owns exactly one `Inbox`; everyone else holds cloned
//! `Outbox` handles. This is the only way state crosses a component
//! boundary, which keeps each event loop single-writer.

use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The receiving end of a component queue. Owned by the component task.
#[derive(Debug)]
pub struct Inbox<T> {
    rx: UnboundedReceiver<T>,
}

/// The sending end of a component queue. Clone freely.
#[derive(Debug)]
pub struct Outbox<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Outbox {
            tx: self.tx.clone(),
        }
    }
}

/// Create a queue pair.
pub fn channel<T>() -> (Inbox<T>, Outbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Inbox { rx }, Outbox { tx })
}

impl<T> Inbox<T> {
    /// Receive the next message; `None` once all outboxes are dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drain whatever is immediately available.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Stop accepting new messages but keep draining buffered ones.
    ///
    /// First half of the two-phase component shutdown.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl<T> Outbox<T> {
    /// Send a message. Fails only when the receiving component is gone.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.tx.send(msg)
    }

    /// Send and ignore a closed receiver. For notifications where a
    /// departed consumer is not the sender's problem (shutdown races).
    pub fn send_lossy(&self, msg: T) {
        let _ = self.tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv() {
        let (mut inbox, outbox) = channel::<u32>();
        outbox.send(42).unwrap();
        outbox.send(43).unwrap();
        assert_eq!(inbox.recv().await, Some(42));
        assert_eq!(inbox.recv().await, Some(43));
    }

    #[tokio::test]
    async fn test_drain() {
        let (mut inbox, outbox) = channel::<u32>();
        for i in 0..3 {
            outbox.send(i).unwrap();
        }
        assert_eq!(inbox.drain(), vec![0, 1, 2]);
        assert!(inbox.drain().is_empty());
    }

    #[tokio::test]
    async fn test_clone_outbox() {
        let (mut inbox, outbox) = channel::<&'static str>();
        let outbox2 = outbox.clone();
        outbox.send("a").unwrap();
        outbox2.send("b").unwrap();
        assert_eq!(inbox.recv().await, Some("a"));
        assert_eq!(inbox.recv().await, Some("b"));
    }

    #[tokio::test]
    async fn test_closed_inbox_rejects_new_sends() {
        let (mut inbox, outbox) = channel::<u32>();
        outbox.send(1).unwrap();
        inbox.close();
        assert!(outbox.send(2).is_err());
        // buffered message still drains
        assert_eq!(inbox.recv().await, Some(1));
        assert_eq!(inbox.recv().await, None);
    }
}
