//! Point-in-time progress of each stage.

use crate::stage::{Stage, StageStatus};
use serde::{Deserialize, Serialize};

/// Progress of one stage, as pushed to the reporting endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// Stage tag.
    pub stage: String,
    /// Lifecycle status.
    pub status: StageStatus,
    /// Tasks that succeeded.
    pub tasks_processed: u64,
    /// Tasks that failed for good.
    pub tasks_failed: u64,
    /// Tasks skipped as duplicates.
    pub tasks_duplicated: u64,
    /// Tasks delivered to the stage and not yet handled.
    pub tasks_pending: u64,
    /// Items produced by splitting.
    pub split_output_count: u64,
    /// Seconds the stage has been running.
    pub elapsed_secs: f64,
    /// Estimated seconds until the pending tasks are handled.
    pub remaining_secs: f64,
    /// Why the stage stopped abnormally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl StageSnapshot {
    /// Takes a snapshot of `stage`.
    ///
    /// Pending work is everything the upstream stages emitted plus what the
    /// driver seeded, less what the stage already handled.
    #[must_use]
    pub fn of(stage: &Stage) -> Self {
        let state = stage.state();
        let counts = state.counts();
        let delivered: u64 = stage
            .prev_stages()
            .iter()
            .map(|prev| prev.state().counts().emitted)
            .sum::<u64>()
            + counts.seeded;
        let pending = delivered.saturating_sub(counts.handled());

        let elapsed = state.elapsed().as_secs_f64();
        let handled = counts.handled();
        #[allow(clippy::cast_precision_loss)]
        let remaining = if handled == 0 || elapsed <= 0.0 {
            0.0
        } else {
            pending as f64 * elapsed / handled as f64
        };

        Self {
            stage: stage.tag(),
            status: state.status(),
            tasks_processed: counts.processed,
            tasks_failed: counts.failed,
            tasks_duplicated: counts.duplicates,
            tasks_pending: pending,
            split_output_count: counts.split_output_count,
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            stop_reason: state.stop_reason(),
        }
    }
}

/// Snapshots every stage in `stages`.
#[must_use]
pub fn snapshot_all(stages: &[Stage]) -> Vec<StageSnapshot> {
    stages.iter().map(StageSnapshot::of).collect()
}
