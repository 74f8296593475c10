//! In-process message bus: per-worker mailboxes plus correlated ask/answer.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::mailbox::Mailbox;
use super::message::{Message, MessageType};
use super::observer::{MessageObserver, ObserverId};
use crate::error::BusError;

/// Resolution slots keyed by correlation id. `None` marks a slot that has
/// already been resolved but whose asker has not yet cleaned up.
type PendingSlots = Arc<Mutex<HashMap<Uuid, Option<oneshot::Sender<Message>>>>>;

/// Sending side of a registered mailbox.
struct MailboxSlot {
    tx: mpsc::UnboundedSender<Message>,
    mailbox: Mailbox,
}

struct BusInner {
    mailboxes: RwLock<HashMap<String, MailboxSlot>>,
    pending: PendingSlots,
    observers: RwLock<Vec<(ObserverId, Arc<dyn MessageObserver>)>>,
    next_observer: AtomicU64,
}

/// How [`MessageBus::answer`] delivered an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerRoute {
    /// A waiting `ask` was resolved directly.
    Resolved,
    /// The matching question was already answered; nothing was delivered.
    AlreadyResolved,
    /// Nobody was waiting, so the answer went to the asker's mailbox.
    Enqueued,
}

/// Single-process message bus.
///
/// Cheap to clone; clones share the same mailboxes, pending questions and
/// observers.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                mailboxes: RwLock::new(HashMap::new()),
                pending: Arc::new(Mutex::new(HashMap::new())),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    /// Create a mailbox for `worker_id`.
    pub fn register(&self, worker_id: impl Into<String>) -> Result<Mailbox, BusError> {
        let worker_id = worker_id.into();
        let mut mailboxes = self
            .inner
            .mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if mailboxes.contains_key(&worker_id) {
            return Err(BusError::AlreadyRegistered { id: worker_id });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = Mailbox::new(worker_id.clone(), rx);
        mailboxes.insert(
            worker_id.clone(),
            MailboxSlot {
                tx,
                mailbox: mailbox.clone(),
            },
        );

        debug!(worker = %worker_id, "Registered mailbox");
        Ok(mailbox)
    }

    /// Remove the mailbox for `worker_id`. Unknown ids are ignored.
    pub fn unregister(&self, worker_id: &str) {
        let removed = self
            .inner
            .mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker_id);

        if removed.is_some() {
            debug!(worker = %worker_id, "Unregistered mailbox");
        }
    }

    /// Check if a worker has a mailbox.
    pub fn is_registered(&self, worker_id: &str) -> bool {
        self.inner
            .mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(worker_id)
    }

    /// All registered worker ids, sorted.
    pub fn registered_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Another handle on a registered worker's mailbox.
    pub fn mailbox(&self, worker_id: &str) -> Option<Mailbox> {
        self.inner
            .mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .map(|slot| slot.mailbox.clone())
    }

    /// Add an observer that sees every enqueued message.
    pub fn add_observer(&self, observer: Arc<dyn MessageObserver>) -> ObserverId {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Remove a previously added observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Enqueue `message` on its receiver's mailbox, then notify observers.
    pub async fn send(&self, message: Message) -> Result<(), BusError> {
        {
            let mailboxes = self
                .inner
                .mailboxes
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = mailboxes
                .get(message.receiver())
                .ok_or_else(|| BusError::UnknownReceiver {
                    id: message.receiver().to_string(),
                })?;
            slot.tx
                .send(message.clone())
                .map_err(|_| BusError::UnknownReceiver {
                    id: message.receiver().to_string(),
                })?;
        }

        debug!(
            kind = %message.kind(),
            sender = %message.sender(),
            receiver = %message.receiver(),
            task_id = %message.task_id(),
            "Message enqueued"
        );

        self.notify(&message).await;
        Ok(())
    }

    async fn notify(&self, message: &Message) {
        let observers: Vec<Arc<dyn MessageObserver>> = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            let fut = observer.on_message(message);
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(observer = %observer.name(), error = %e, "Message observer failed");
                }
                Err(_) => {
                    warn!(observer = %observer.name(), "Message observer panicked");
                }
            }
        }
    }

    /// Register a resolution slot and build the question message, without
    /// sending it. Send and wait with [`MessageBus::ask_with`].
    pub fn prepare_question(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        question: serde_json::Value,
        task_id: impl Into<String>,
    ) -> Result<PendingQuestion, BusError> {
        let receiver = receiver.into();
        if !self.is_registered(&receiver) {
            return Err(BusError::UnknownReceiver { id: receiver });
        }

        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(correlation_id, Some(tx));

        let message = Message::new(MessageType::Question, sender, receiver, question, task_id)
            .with_correlation(correlation_id);

        Ok(PendingQuestion {
            message,
            correlation_id,
            rx,
            slots: Arc::clone(&self.inner.pending),
        })
    }

    /// Send a prepared question and wait up to `timeout` for its answer.
    pub async fn ask_with(
        &self,
        pending: PendingQuestion,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.send(pending.message().clone()).await?;
        pending.wait(timeout).await
    }

    /// Send a question and wait for the correlated answer.
    pub async fn ask(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        question: serde_json::Value,
        task_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let pending = self.prepare_question(sender, receiver, question, task_id)?;
        self.ask_with(pending, timeout).await
    }

    /// Answer `original`.
    ///
    /// A live `ask` for the same correlation id is resolved directly and the
    /// mailbox is bypassed. Without one, the answer is enqueued on the
    /// original sender's mailbox like any other message.
    pub async fn answer(
        &self,
        original: &Message,
        payload: serde_json::Value,
    ) -> Result<AnswerRoute, BusError> {
        let response = Message::answer_to(original, payload);

        // Check-and-take happens under one lock so two answers cannot both resolve.
        let slot = original.correlation_id().and_then(|cid| {
            lock(&self.inner.pending)
                .get_mut(&cid)
                .map(|slot| slot.take())
        });

        match slot {
            Some(Some(tx)) => {
                if tx.send(response).is_err() {
                    debug!(task_id = %original.task_id(), "Asker stopped waiting before the answer arrived");
                }
                debug!(task_id = %original.task_id(), receiver = %original.sender(), "Question resolved");
                Ok(AnswerRoute::Resolved)
            }
            Some(None) => {
                debug!(task_id = %original.task_id(), "Question already answered, ignoring");
                Ok(AnswerRoute::AlreadyResolved)
            }
            None => {
                self.send(response).await?;
                Ok(AnswerRoute::Enqueued)
            }
        }
    }

    /// Drain a worker's mailbox, waiting up to `timeout` for a first message
    /// if it is empty.
    pub async fn get_messages(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Vec<Message>, BusError> {
        let mailbox = self.mailbox(worker_id).ok_or_else(|| BusError::UnknownWorker {
            id: worker_id.to_string(),
        })?;
        Ok(mailbox.collect(timeout).await)
    }

    /// Number of questions still waiting for an answer.
    pub fn pending_questions(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An outstanding question: its message and the slot its answer lands in.
///
/// Dropping it removes the slot, including when the asker is aborted
/// mid-wait.
pub struct PendingQuestion {
    message: Message,
    correlation_id: Uuid,
    rx: oneshot::Receiver<Message>,
    slots: PendingSlots,
}

impl PendingQuestion {
    /// The question message, carrying the correlation id.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait up to `timeout` for the answer.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, BusError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) | Err(_) => {
                debug!(
                    correlation_id = %self.correlation_id,
                    task_id = %self.message.task_id(),
                    "Question timed out"
                );
                Err(BusError::Timeout { timeout })
            }
        }
    }
}

impl Drop for PendingQuestion {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.correlation_id);
    }
}

impl std::fmt::Debug for PendingQuestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQuestion")
            .field("correlation_id", &self.correlation_id)
            .field("task_id", &self.message.task_id())
            .finish()
    }
}
