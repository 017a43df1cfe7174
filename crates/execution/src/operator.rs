//! Pipeline operator contract between the driver host and the core.

use std::collections::HashMap;

use arbor_common::ids::PlanNodeId;
use arbor_common::{ArborError, Result};
use arbor_memory::ReclaimStats;
use arrow::record_batch::RecordBatch;

use crate::driver::DriverCtx;
use crate::future::ContinueFuture;

/// Runtime stat key: serde used by a merge exchange for incoming pages.
pub const SHUFFLE_SERDE_KIND: &str = "shuffleSerdeKind";
/// Runtime stat key: compression applied to exchange pages.
pub const SHUFFLE_COMPRESSION_KIND: &str = "shuffleCompressionKind";
/// Runtime stat key: stripe sizes flushed by a spilling writer.
pub const STRIPE_SIZE: &str = "stripeSize";

/// Why an operator cannot run right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReason {
    /// Upstream has not produced the next batch yet.
    WaitForProducer,
    /// Downstream has not consumed buffered output yet.
    WaitForConsumer,
    /// The task has not delivered the next split yet.
    WaitForSplit,
    /// Waiting on a memory arbitration round.
    WaitForMemory,
}

/// A blocked operator's reason plus the future the driver must wait on.
#[derive(Debug)]
pub struct Blocked {
    /// Why the operator yielded.
    pub reason: BlockingReason,
    /// Completes when the operator may be re-entered.
    pub future: ContinueFuture,
}

/// One named runtime statistic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCounter {
    /// Sum of recorded values.
    pub sum: i64,
    /// Number of recorded values.
    pub count: u64,
}

impl RuntimeCounter {
    /// Record one value.
    pub fn add(&mut self, value: i64) {
        self.sum += value;
        self.count += 1;
    }
}

/// Per-operator statistics surfaced to the host.
#[derive(Debug, Clone, Default)]
pub struct OperatorStats {
    /// Rows emitted by `get_output`.
    pub rows_out: u64,
    /// Batches emitted by `get_output`.
    pub batches_out: u64,
    /// Named runtime statistics (see the `*_KIND` and `STRIPE_SIZE` keys).
    pub runtime_stats: HashMap<&'static str, RuntimeCounter>,
}

impl OperatorStats {
    /// Record one value under a named runtime statistic.
    pub fn add_runtime_stat(&mut self, name: &'static str, value: i64) {
        self.runtime_stats.entry(name).or_default().add(value);
    }
}

/// Identity and host context of one operator instance.
#[derive(Clone)]
pub struct OperatorCtx {
    /// Position of the operator inside its pipeline.
    pub operator_id: u32,
    /// Plan node this operator was instantiated from.
    pub plan_node_id: PlanNodeId,
    /// The driver slot executing this operator.
    pub driver: DriverCtx,
}

/// A pipeline operator driven by the cooperative pull loop.
///
/// The driver advances an operator with `is_blocked` → `get_output` ticks and
/// waits on the returned future whenever the operator yields. Reclaim entry
/// points are only invoked while the owning task is paused.
pub trait Operator: Send {
    /// Stable operator type name for logs and stats.
    fn operator_type(&self) -> &'static str;

    /// Install prerequisites and report whether the operator must wait.
    /// `None` means not blocked.
    fn is_blocked(&mut self) -> Result<Option<Blocked>>;

    /// Whether the operator currently accepts input batches.
    fn needs_input(&self) -> bool {
        false
    }

    /// Feed one input batch. Source operators reject this.
    fn add_input(&mut self, _input: RecordBatch) -> Result<()> {
        Err(ArborError::InvariantViolation(format!(
            "{} is a source operator and takes no input",
            self.operator_type()
        )))
    }

    /// Signal that no more input will arrive.
    fn no_more_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next output batch, or `None` when blocked or finished.
    fn get_output(&mut self) -> Result<Option<RecordBatch>>;

    /// Whether the operator has emitted all output.
    fn is_finished(&self) -> bool;

    /// Release resources. Idempotent.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether this operator can release memory on request.
    fn can_reclaim(&self) -> bool {
        false
    }

    /// Bytes this operator could plausibly release.
    fn reclaimable_bytes(&self) -> u64 {
        0
    }

    /// Release up to `target_bytes`; returns bytes actually released.
    /// Called only while the owning task is paused.
    fn reclaim(&mut self, _target_bytes: u64, _stats: &mut ReclaimStats) -> Result<u64> {
        Ok(0)
    }

    /// Snapshot of this operator's statistics.
    fn stats(&self) -> OperatorStats {
        OperatorStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::{OperatorStats, RuntimeCounter, SHUFFLE_SERDE_KIND};

    #[test]
    fn runtime_stats_accumulate() {
        let mut stats = OperatorStats::default();
        stats.add_runtime_stat(SHUFFLE_SERDE_KIND, 0);
        stats.add_runtime_stat(SHUFFLE_SERDE_KIND, 0);
        assert_eq!(
            stats.runtime_stats[SHUFFLE_SERDE_KIND],
            RuntimeCounter { sum: 0, count: 2 }
        );
    }
}
