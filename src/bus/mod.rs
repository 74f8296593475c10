//! Message bus — per-worker mailboxes and correlated questions.
//!
//! - `message` — immutable envelope and message kinds
//! - `mailbox` — FIFO receiving side handed to each registered worker
//! - `message_bus` — registration, delivery, ask/answer correlation
//! - `observer` — best-effort observers notified after each delivery

pub mod mailbox;
pub mod message;
pub mod message_bus;
pub mod observer;

pub use mailbox::Mailbox;
pub use message::{Message, MessageType};
pub use message_bus::{AnswerRoute, MessageBus, PendingQuestion};
pub use observer::{LogObserver, MessageObserver, ObserverId};
