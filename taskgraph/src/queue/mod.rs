//! Queues backing graph edges, the fail queue and the log sink.
//!
//! Executors only see the [`QueueSender`] and [`TaskQueue`] traits, so an
//! edge can be backed by an in-process [`MemoryQueue`] or by a pipe to or
//! from a worker process ([`PipeSender`], [`PipeQueue`]) without the
//! executor knowing which.

mod broadcast;
mod memory;
mod pipe;

pub use broadcast::BroadcastCoupler;
pub use memory::MemoryQueue;
pub use pipe::{FrameWriter, PipeQueue, PipeSender};

use crate::errors::QueueError;
use crate::task::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// Producer side of a queue.
#[async_trait]
pub trait QueueSender<T>: Send + Sync {
    /// Enqueues a message, waiting for capacity if the queue is bounded.
    async fn put(&self, message: Message<T>) -> Result<(), QueueError>;

    /// Enqueues a message without waiting.
    ///
    /// Fails with [`QueueError::Full`] when a bounded queue is at capacity.
    fn try_put(&self, message: Message<T>) -> Result<(), QueueError>;
}

/// Consumer side of a queue, owned by exactly one executor.
#[async_trait]
pub trait TaskQueue<T>: QueueSender<T> {
    /// Dequeues the next message, waiting until one is available.
    ///
    /// Cancel safe: dropping the future never loses a message.
    async fn get(&self) -> Result<Message<T>, QueueError>;

    /// Appends a message regardless of capacity.
    ///
    /// Used by the consumer itself for retries and re-injected markers, so it
    /// never blocks on its own input.
    fn put_back(&self, message: Message<T>) -> Result<(), QueueError>;

    /// Number of messages waiting.
    fn len(&self) -> usize;

    /// Returns true when nothing is waiting.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue. Pending puts fail; `get` drains what is left and
    /// then fails with [`QueueError::Closed`].
    fn close(&self);
}

/// Shared producer handle.
pub type SharedSender<T> = Arc<dyn QueueSender<T>>;

/// Shared consumer handle.
pub type SharedQueue<T> = Arc<dyn TaskQueue<T>>;
