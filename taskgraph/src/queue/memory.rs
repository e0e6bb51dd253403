//! In-process queue on tokio primitives.

use super::{QueueSender, TaskQueue};
use crate::errors::QueueError;
use crate::task::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore, TryAcquireError};

struct Entry<T> {
    message: Message<T>,
    holds_slot: bool,
}

/// Multi-producer FIFO queue with an optional capacity.
///
/// Capacity is enforced with a semaphore: every `put` takes a slot that is
/// returned when the message is dequeued. `put_back` takes no slot.
pub struct MemoryQueue<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<Entry<T>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Entry<T>>>,
    slots: Option<Arc<Semaphore>>,
    capacity: Option<usize>,
    len: AtomicUsize,
    markers_put: AtomicUsize,
    markers_put_back: AtomicUsize,
}

impl<T: Send + 'static> MemoryQueue<T> {
    /// Creates a queue, bounded when `capacity` is set.
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let capacity = capacity.map(|c| c.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            slots: capacity.map(|c| Arc::new(Semaphore::new(c))),
            capacity,
            len: AtomicUsize::new(0),
            markers_put: AtomicUsize::new(0),
            markers_put_back: AtomicUsize::new(0),
        }
    }

    /// Creates an unbounded queue.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Creates a bounded queue.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of termination markers delivered by producers through `put`.
    #[must_use]
    pub fn markers_received(&self) -> usize {
        self.markers_put.load(Ordering::SeqCst)
    }

    /// Number of termination markers re-injected through `put_back`.
    #[must_use]
    pub fn markers_reinjected(&self) -> usize {
        self.markers_put_back.load(Ordering::SeqCst)
    }

    /// Removes and returns everything still queued.
    pub async fn drain(&self) -> Vec<Message<T>> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            self.release(entry.holds_slot);
            drained.push(entry.message);
        }
        drained
    }

    fn release(&self, holds_slot: bool) {
        if holds_slot {
            if let Some(slots) = &self.slots {
                slots.add_permits(1);
            }
        }
    }

    fn send(&self, message: Message<T>, holds_slot: bool, put_back: bool) -> Result<(), QueueError> {
        let marker = message.is_terminate();
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.release(holds_slot);
            return Err(QueueError::Closed);
        };

        self.len.fetch_add(1, Ordering::SeqCst);
        if tx.send(Entry { message, holds_slot }).is_err() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            self.release(holds_slot);
            return Err(QueueError::Closed);
        }

        if marker {
            let counter = if put_back { &self.markers_put_back } else { &self.markers_put };
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> QueueSender<T> for MemoryQueue<T> {
    async fn put(&self, message: Message<T>) -> Result<(), QueueError> {
        let holds_slot = match &self.slots {
            Some(slots) => {
                let permit = slots.acquire().await.map_err(|_| QueueError::Closed)?;
                permit.forget();
                true
            }
            None => false,
        };
        self.send(message, holds_slot, false)
    }

    fn try_put(&self, message: Message<T>) -> Result<(), QueueError> {
        let holds_slot = match &self.slots {
            Some(slots) => match slots.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(TryAcquireError::NoPermits) => {
                    return Err(QueueError::Full {
                        capacity: self.capacity.unwrap_or_default(),
                    })
                }
                Err(TryAcquireError::Closed) => return Err(QueueError::Closed),
            },
            None => false,
        };
        self.send(message, holds_slot, false)
    }
}

#[async_trait]
impl<T: Send + 'static> TaskQueue<T> for MemoryQueue<T> {
    async fn get(&self) -> Result<Message<T>, QueueError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(entry) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                self.release(entry.holds_slot);
                Ok(entry.message)
            }
            None => Err(QueueError::Closed),
        }
    }

    fn put_back(&self, message: Message<T>) -> Result<(), QueueError> {
        self.send(message, false, true)
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.tx.lock().take();
        if let Some(slots) = &self.slots {
            slots.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::unbounded();
        for i in 0..3 {
            queue.put(Message::Item(i)).await.unwrap();
        }
        queue.put(Message::Terminate).await.unwrap();

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.get().await.unwrap(), Message::Item(0));
        assert_eq!(queue.get().await.unwrap(), Message::Item(1));
        assert_eq!(queue.get().await.unwrap(), Message::Item(2));
        assert!(queue.get().await.unwrap().is_terminate());
        assert!(queue.is_empty());
        assert_eq!(queue.markers_received(), 1);
    }

    #[tokio::test]
    async fn test_bounded_try_put_reports_full() {
        let queue = MemoryQueue::bounded(1);
        queue.try_put(Message::Item(1)).unwrap();
        let err = queue.try_put(Message::Item(2)).unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 1 }));
    }

    #[tokio::test]
    async fn test_bounded_put_waits_for_slot() {
        let queue = Arc::new(MemoryQueue::bounded(1));
        queue.put(Message::Item(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.put(Message::Item(2))).await;
        assert!(blocked.is_err());

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(Message::Item(3)).await })
        };
        assert_eq!(queue.get().await.unwrap(), Message::Item(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.get().await.unwrap(), Message::Item(3));
    }

    #[tokio::test]
    async fn test_put_back_bypasses_capacity() {
        let queue = MemoryQueue::bounded(1);
        queue.put(Message::Item(1)).await.unwrap();
        queue.put_back(Message::Item(2)).unwrap();
        queue.put_back(Message::Terminate).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.markers_received(), 0);
        assert_eq!(queue.markers_reinjected(), 1);

        queue.get().await.unwrap();
        queue.get().await.unwrap();
        // Only the slot taken by `put` came back.
        queue.try_put(Message::Item(4)).unwrap();
        assert!(queue.try_put(Message::Item(5)).is_err());
    }

    #[tokio::test]
    async fn test_close_drains_then_fails() {
        let queue = MemoryQueue::unbounded();
        queue.put(Message::Item("a")).await.unwrap();
        queue.close();

        assert!(matches!(queue.put(Message::Item("b")).await, Err(QueueError::Closed)));
        assert_eq!(queue.get().await.unwrap(), Message::Item("a"));
        assert!(matches!(queue.get().await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_drain_returns_leftovers() {
        let queue = MemoryQueue::bounded(4);
        queue.put(Message::Item(1)).await.unwrap();
        queue.put(Message::Item(2)).await.unwrap();

        let left = queue.drain().await;
        assert_eq!(left, vec![Message::Item(1), Message::Item(2)]);
        assert!(queue.is_empty());
    }
}
