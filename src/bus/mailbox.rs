//! Per-worker FIFO mailbox.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use super::message::Message;

/// Receiving side of a worker's mailbox.
///
/// Cloning shares the same queue. The bus keeps the sending side; once the
/// worker is unregistered, `recv` drains what is left and then returns `None`.
#[derive(Debug, Clone)]
pub struct Mailbox {
    worker_id: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Mailbox {
    pub(crate) fn new(worker_id: String, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            worker_id,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Id of the worker this mailbox belongs to.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Take the next message if one is queued.
    pub async fn try_recv(&self) -> Option<Message> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Drain everything currently queued, in send order.
    pub async fn drain(&self) -> Vec<Message> {
        let mut rx = self.rx.lock().await;
        drain_queued(&mut rx)
    }

    /// Drain the queue; if it is empty, first wait up to `timeout` for one
    /// message to arrive. A zero timeout never waits.
    pub async fn collect(&self, timeout: Duration) -> Vec<Message> {
        let mut rx = self.rx.lock().await;
        let mut messages = Vec::new();

        if !timeout.is_zero() && rx.is_empty() {
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(msg)) => messages.push(msg),
                // Closed (unregistered) or timed out
                Ok(None) | Err(_) => return messages,
            }
        }

        messages.extend(drain_queued(&mut rx));
        messages
    }
}

fn drain_queued(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}
