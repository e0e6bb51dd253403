//! Cross-process queue ends.
//!
//! Frames are single-line JSON documents. The sending end writes them
//! synchronously under a lock so concurrent producers never interleave
//! partial lines; the receiving end pumps lines into a local
//! [`MemoryQueue`].

use super::{MemoryQueue, QueueSender, TaskQueue};
use crate::errors::QueueError;
use crate::task::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, Lines};
use tokio::task::JoinHandle;
use tracing::warn;

/// Line-oriented JSON frame writer shared by every producer of a process.
pub struct FrameWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl FrameWriter {
    /// Wraps a writer.
    #[must_use]
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Writes frames to this process's stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Serialises `frame` and writes it as one line.
    pub fn write<F: Serialize>(&self, frame: &F) -> Result<(), QueueError> {
        let mut line =
            serde_json::to_string(frame).map_err(|e| QueueError::Encode(e.to_string()))?;
        line.push('\n');

        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

/// Sending end of a cross-process edge.
///
/// Each message is wrapped into the process's frame type `F` before it is
/// written.
pub struct PipeSender<T, F> {
    writer: Arc<FrameWriter>,
    wrap: fn(Message<T>) -> F,
}

impl<T, F> PipeSender<T, F> {
    /// Creates a sender writing through `writer`.
    #[must_use]
    pub fn new(writer: Arc<FrameWriter>, wrap: fn(Message<T>) -> F) -> Self {
        Self { writer, wrap }
    }
}

#[async_trait]
impl<T, F> QueueSender<T> for PipeSender<T, F>
where
    T: Send + 'static,
    F: Serialize + Send + 'static,
{
    async fn put(&self, message: Message<T>) -> Result<(), QueueError> {
        self.try_put(message)
    }

    fn try_put(&self, message: Message<T>) -> Result<(), QueueError> {
        self.writer.write(&(self.wrap)(message))
    }
}

/// Receiving end of a cross-process edge.
///
/// A pump task decodes incoming lines into a local queue. Lines that fail to
/// decode are logged and skipped. If the pipe closes before
/// `expected_markers` termination markers arrived, the local queue is closed
/// so the consumer fails instead of waiting forever.
pub struct PipeQueue<T> {
    local: Arc<MemoryQueue<T>>,
    pump: JoinHandle<()>,
}

impl<T: Send + 'static> PipeQueue<T> {
    /// Starts pumping `lines` into a new queue.
    pub fn spawn<R>(
        mut lines: Lines<R>,
        decode: fn(&str) -> Result<Message<T>, QueueError>,
        expected_markers: usize,
    ) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let local = Arc::new(MemoryQueue::unbounded());
        let sink = local.clone();

        let pump = tokio::spawn(async move {
            let mut markers = 0usize;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode(&line) {
                            Ok(message) => {
                                if message.is_terminate() {
                                    markers += 1;
                                }
                                if sink.put(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Skipping undecodable pipe frame"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Pipe read failed");
                        break;
                    }
                }
            }

            if markers < expected_markers {
                warn!(markers, expected_markers, "Pipe closed before every producer finished");
                sink.close();
            }
        });

        Self { local, pump }
    }
}

impl<T> Drop for PipeQueue<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl<T: Send + 'static> QueueSender<T> for PipeQueue<T> {
    async fn put(&self, message: Message<T>) -> Result<(), QueueError> {
        self.local.put(message).await
    }

    fn try_put(&self, message: Message<T>) -> Result<(), QueueError> {
        self.local.try_put(message)
    }
}

#[async_trait]
impl<T: Send + 'static> TaskQueue<T> for PipeQueue<T> {
    async fn get(&self) -> Result<Message<T>, QueueError> {
        self.local.get().await
    }

    fn put_back(&self, message: Message<T>) -> Result<(), QueueError> {
        self.local.put_back(message)
    }

    fn len(&self) -> usize {
        self.local.len()
    }

    fn close(&self) {
        self.local.close();
    }
}
