//! Fan-out of one result stream to several downstream queues.

use super::{SharedQueue, SharedSender};
use crate::errors::QueueError;
use crate::task::Message;
use tokio::task::JoinHandle;
use tracing::debug;

/// Copies every message of a source queue onto each target queue.
///
/// Targets see messages in source order. A full target blocks the coupler,
/// and with it the producing stage once the source fills up.
pub struct BroadcastCoupler;

impl BroadcastCoupler {
    /// Spawns the coupler task.
    ///
    /// The task ends after forwarding the first termination marker and
    /// returns the number of items it forwarded to each target.
    pub fn spawn<T>(
        name: impl Into<String>,
        source: SharedQueue<T>,
        targets: Vec<SharedSender<T>>,
    ) -> JoinHandle<Result<u64, QueueError>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let name = name.into();
        tokio::spawn(async move {
            let mut forwarded = 0u64;
            loop {
                match source.get().await? {
                    Message::Item(item) => {
                        for target in &targets {
                            target.put(Message::Item(item.clone())).await?;
                        }
                        forwarded += 1;
                    }
                    Message::Terminate => {
                        for target in &targets {
                            target.put(Message::Terminate).await?;
                        }
                        debug!(coupler = %name, forwarded, "Broadcast finished");
                        return Ok(forwarded);
                    }
                }
            }
        })
    }
}
