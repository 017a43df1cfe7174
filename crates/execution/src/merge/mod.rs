//! Order-preserving k-way merge operator.
//!
//! Fuses N pre-sorted batch streams into one sorted batch stream. The two
//! concrete shapes differ only in where sources come from: `LocalMerge` pulls
//! in-process queues from the task, `MergeExchange` discovers remote tasks
//! through splits and fetches their pages. Both run on driver 0 only.

pub mod source;

mod output;
mod stream;
mod tree;

use std::sync::Arc;

use arbor_common::config::CompressionKind;
use arbor_common::ids::PlanNodeId;
use arbor_common::{global_metrics, ArborError, Result};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use arrow_schema::{SchemaRef, SortOptions};
use tracing::debug;

use crate::exchange::{ExchangeClient, ExchangeSerdeKind};
use crate::future::ContinueFuture;
use crate::operator::{
    Blocked, BlockingReason, Operator, OperatorCtx, OperatorStats, SHUFFLE_COMPRESSION_KIND,
    SHUFFLE_SERDE_KIND,
};
use crate::split::SplitFetch;

use output::MergeOutputBuilder;
use source::{max_queued_bytes_per_source, MergeExchangeSource, MergeSource};
use stream::SourceStream;
use tree::TreeOfLosers;

/// How nulls participate in key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullHandling {
    /// Nulls order as values, placed by `nulls_first`.
    NullAsValue,
    /// SQL three-valued comparison; not usable for ordering.
    NullAsIndeterminate,
}

/// Per-key comparison flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareFlags {
    /// Nulls sort before non-nulls.
    pub nulls_first: bool,
    /// Ascending key order.
    pub ascending: bool,
    /// Equality-only comparison; merge rejects this.
    pub equals_only: bool,
    /// Null comparison mode; merge requires [`NullHandling::NullAsValue`].
    pub null_handling: NullHandling,
}

impl Default for CompareFlags {
    fn default() -> Self {
        Self {
            nulls_first: true,
            ascending: true,
            equals_only: false,
            null_handling: NullHandling::NullAsValue,
        }
    }
}

/// Where a sort key reads from, as described by the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChannel {
    /// A column of the merged row type.
    Ordinal(usize),
    /// A constant expression; forbidden for merge keys.
    Constant,
}

/// One validated merge sort key.
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    channel: usize,
    flags: CompareFlags,
}

impl SortKey {
    /// Validate a plan-side key description against the merge row type.
    pub fn try_new(channel: KeyChannel, flags: CompareFlags, schema: &SchemaRef) -> Result<Self> {
        let channel = match channel {
            KeyChannel::Ordinal(ordinal) => ordinal,
            KeyChannel::Constant => {
                return Err(ArborError::InvalidConfig(
                    "merge doesn't allow constant sort keys".to_string(),
                ))
            }
        };
        if channel >= schema.fields().len() {
            return Err(ArborError::InvalidConfig(format!(
                "sort key column {channel} out of range for {} columns",
                schema.fields().len()
            )));
        }
        if flags.null_handling != NullHandling::NullAsValue {
            return Err(ArborError::InvalidConfig(
                "merge requires null-as-value compare flags".to_string(),
            ));
        }
        if flags.equals_only {
            return Err(ArborError::InvalidConfig(
                "merge requires ordering compare flags, not equals-only".to_string(),
            ));
        }
        Ok(Self { channel, flags })
    }

    /// Column ordinal this key compares.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// This key's comparison flags.
    pub fn flags(&self) -> CompareFlags {
        self.flags
    }
}

/// Populates a merge's sources. The only point where the local and exchange
/// shapes differ.
trait SourceInstaller: Send {
    fn install(
        &mut self,
        ctx: &OperatorCtx,
        sources: &mut Vec<Arc<dyn MergeSource>>,
    ) -> Result<Option<Blocked>>;

    fn record_close_stats(&self, _stats: &mut OperatorStats) {}
}

/// Local shape: one task registry lookup.
struct LocalSourceInstaller {
    plan_node_id: PlanNodeId,
}

impl SourceInstaller for LocalSourceInstaller {
    fn install(
        &mut self,
        ctx: &OperatorCtx,
        sources: &mut Vec<Arc<dyn MergeSource>>,
    ) -> Result<Option<Blocked>> {
        if sources.is_empty() {
            *sources = ctx
                .driver
                .task
                .local_merge_sources(self.plan_node_id)
                .into_iter()
                .map(|source| source as Arc<dyn MergeSource>)
                .collect();
        }
        Ok(None)
    }
}

/// Exchange shape: drain splits to learn remote task ids, then build one
/// exchange source per remote task with a per-source queue budget.
struct ExchangeSourceInstaller {
    plan_node_id: PlanNodeId,
    client: Arc<dyn ExchangeClient>,
    serde_kind: ExchangeSerdeKind,
    compression_kind: CompressionKind,
    remote_task_ids: Vec<arbor_common::ids::RemoteTaskId>,
    no_more_splits: bool,
}

impl SourceInstaller for ExchangeSourceInstaller {
    fn install(
        &mut self,
        ctx: &OperatorCtx,
        sources: &mut Vec<Arc<dyn MergeSource>>,
    ) -> Result<Option<Blocked>> {
        if ctx.driver.driver_id != 0 {
            // With multiple drivers, only the one from slot 0 merges pages.
            return Ok(None);
        }
        if self.no_more_splits {
            return Ok(None);
        }

        loop {
            match ctx.driver.task.split_or_future(self.plan_node_id)? {
                SplitFetch::Blocked(future) => {
                    return Ok(Some(Blocked {
                        reason: BlockingReason::WaitForSplit,
                        future,
                    }));
                }
                SplitFetch::Split(split) => {
                    self.remote_task_ids.push(split.remote_task_id);
                }
                SplitFetch::Finished => {
                    self.no_more_splits = true;
                    if !self.remote_task_ids.is_empty() {
                        let config = ctx.driver.task.query().config();
                        let budget = max_queued_bytes_per_source(
                            config.max_merge_exchange_buffer_size,
                            self.remote_task_ids.len(),
                        );
                        for (index, remote) in self.remote_task_ids.iter().enumerate() {
                            let pool = ctx
                                .driver
                                .task
                                .add_merge_source_pool(self.plan_node_id, index)?;
                            let source = MergeExchangeSource::new(
                                remote.clone(),
                                Arc::clone(&self.client),
                                budget,
                                pool,
                            );
                            ctx.driver
                                .task
                                .register_merge_source(Arc::clone(&source) as Arc<dyn MergeSource>);
                            sources.push(source);
                        }
                        debug!(
                            node = %self.plan_node_id,
                            sources = self.remote_task_ids.len(),
                            budget,
                            "merge exchange sources installed"
                        );
                    }
                    ctx.driver
                        .task
                        .splits_consumed(self.remote_task_ids.len() as u64);
                    return Ok(None);
                }
            }
        }
    }

    fn record_close_stats(&self, stats: &mut OperatorStats) {
        stats.add_runtime_stat(SHUFFLE_SERDE_KIND, self.serde_kind.code());
        stats.add_runtime_stat(SHUFFLE_COMPRESSION_KIND, self.compression_kind.code());
    }
}

/// The merge operator. See the module docs for the two shapes.
pub struct MergeOperator {
    ctx: OperatorCtx,
    operator_type: &'static str,
    schema: SchemaRef,
    key_channels: Vec<usize>,
    converter: Arc<RowConverter>,
    output_batch_size: usize,
    installer: Box<dyn SourceInstaller>,
    sources: Vec<Arc<dyn MergeSource>>,
    streams: Vec<SourceStream>,
    tree: Option<TreeOfLosers>,
    output: Option<MergeOutputBuilder>,
    output_size: usize,
    source_blocking_futures: Vec<ContinueFuture>,
    num_started_sources: usize,
    finished: bool,
    closed: bool,
    stats: OperatorStats,
}

impl MergeOperator {
    /// Local merge over the task's registered in-process sources.
    /// Must be constructed on driver 0; anything else is a plan bug.
    pub fn local(ctx: OperatorCtx, schema: SchemaRef, keys: Vec<SortKey>) -> Result<Self> {
        if ctx.driver.driver_id != 0 {
            return Err(ArborError::InvariantViolation(
                "LocalMerge needs to run single-threaded".to_string(),
            ));
        }
        let plan_node_id = ctx.plan_node_id;
        Self::try_new(
            ctx,
            schema,
            keys,
            "LocalMerge",
            Box::new(LocalSourceInstaller { plan_node_id }),
        )
    }

    /// Merge exchange over remote tasks discovered through splits.
    pub fn exchange(
        ctx: OperatorCtx,
        schema: SchemaRef,
        keys: Vec<SortKey>,
        client: Arc<dyn ExchangeClient>,
        serde_kind: ExchangeSerdeKind,
    ) -> Result<Self> {
        let plan_node_id = ctx.plan_node_id;
        let compression_kind = ctx.driver.task.query().config().shuffle_compression_kind;
        Self::try_new(
            ctx,
            schema,
            keys,
            "MergeExchange",
            Box::new(ExchangeSourceInstaller {
                plan_node_id,
                client,
                serde_kind,
                compression_kind,
                remote_task_ids: Vec::new(),
                no_more_splits: false,
            }),
        )
    }

    fn try_new(
        ctx: OperatorCtx,
        schema: SchemaRef,
        keys: Vec<SortKey>,
        operator_type: &'static str,
        installer: Box<dyn SourceInstaller>,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(ArborError::InvalidConfig(
                "merge requires at least one sort key".to_string(),
            ));
        }
        let fields = keys
            .iter()
            .map(|key| {
                SortField::new_with_options(
                    schema.field(key.channel).data_type().clone(),
                    SortOptions {
                        descending: !key.flags.ascending,
                        nulls_first: key.flags.nulls_first,
                    },
                )
            })
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields)
            .map_err(|e| ArborError::InvalidConfig(format!("unorderable sort key type: {e}")))?;
        let output_batch_size = ctx.driver.task.query().config().batch_size_rows;

        Ok(Self {
            ctx,
            operator_type,
            schema,
            key_channels: keys.iter().map(SortKey::channel).collect(),
            converter: Arc::new(converter),
            output_batch_size,
            installer,
            sources: Vec::new(),
            streams: Vec::new(),
            tree: None,
            output: None,
            output_size: 0,
            source_blocking_futures: Vec::new(),
            num_started_sources: 0,
            finished: false,
            closed: false,
            stats: OperatorStats::default(),
        })
    }

    fn start_sources(&mut self) -> Result<()> {
        if self.num_started_sources >= self.sources.len() {
            return Ok(());
        }
        if self.num_started_sources != 0
            || !self.streams.is_empty()
            || !self.source_blocking_futures.is_empty()
        {
            return Err(ArborError::InvariantViolation(
                "merge sources must be started exactly once, together".to_string(),
            ));
        }
        for source in &self.sources {
            source.start();
        }
        self.num_started_sources = self.sources.len();
        Ok(())
    }

    fn init_tree(&mut self) {
        self.streams = self
            .sources
            .iter()
            .map(|source| {
                SourceStream::new(
                    Arc::clone(source),
                    Arc::clone(&self.converter),
                    self.key_channels.clone(),
                    self.output_batch_size,
                )
            })
            .collect();
        self.tree = Some(TreeOfLosers::new(self.streams.len()));
    }

    fn record_output(&mut self, batch: &RecordBatch) {
        self.stats.rows_out += batch.num_rows() as u64;
        self.stats.batches_out += 1;
        global_metrics().record_operator_output(self.operator_type, batch.num_rows() as u64, 1);
    }

    fn passthrough_output(&mut self) -> Result<Option<RecordBatch>> {
        match self.sources[0].next()? {
            source::SourceNext::Blocked(future) => {
                self.source_blocking_futures.push(future);
                Ok(None)
            }
            source::SourceNext::AtEnd => {
                self.finished = true;
                Ok(None)
            }
            source::SourceNext::Batch(batch) => {
                self.record_output(&batch);
                Ok(Some(batch))
            }
        }
    }

    fn merge_output(&mut self) -> Result<Option<RecordBatch>> {
        if self.output.is_none() {
            self.output = Some(MergeOutputBuilder::new(
                Arc::clone(&self.schema),
                self.output_batch_size,
            ));
        }

        loop {
            let winner = self.tree.as_mut().expect("tournament").next(&self.streams);
            let Some(stream_idx) = winner else {
                self.finished = true;
                if self.output_size == 0 {
                    return Ok(None);
                }
                let size = self.output_size;
                self.output_size = 0;
                let batch = self.output.as_mut().expect("output").build(size)?;
                self.record_output(&batch);
                return Ok(Some(batch));
            };

            if self.streams[stream_idx].set_output_row(self.output_size) {
                // The stream is at the end of its batch: copy its pending
                // rows out before the batch pointer is replaced in pop.
                let output = self.output.as_mut().expect("output");
                self.streams[stream_idx].copy_to_output(output)?;
            }
            self.output_size += 1;

            self.streams[stream_idx].pop(&mut self.source_blocking_futures)?;
            self.tree.as_mut().expect("tournament").winner_advanced();

            if self.output_size == self.output_batch_size {
                let output = self.output.as_mut().expect("output");
                for stream in &mut self.streams {
                    stream.copy_to_output(output)?;
                }
                let size = self.output_size;
                self.output_size = 0;
                let batch = output.build(size)?;
                self.record_output(&batch);
                return Ok(Some(batch));
            }

            if !self.source_blocking_futures.is_empty() {
                return Ok(None);
            }
        }
    }
}

impl Operator for MergeOperator {
    fn operator_type(&self) -> &'static str {
        self.operator_type
    }

    fn is_blocked(&mut self) -> Result<Option<Blocked>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(blocked) = self.installer.install(&self.ctx, &mut self.sources)? {
            return Ok(Some(blocked));
        }

        // The task might terminate early and leave no sources; the merge then
        // simply finishes.
        if self.sources.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        self.start_sources()?;

        if self.streams.is_empty() && self.sources.len() > 1 {
            self.init_tree();
        }

        if self.source_blocking_futures.is_empty() {
            for stream in &mut self.streams {
                stream.ensure_ready(&mut self.source_blocking_futures)?;
            }
        }

        match self.source_blocking_futures.pop() {
            Some(future) => Ok(Some(Blocked {
                reason: BlockingReason::WaitForProducer,
                future,
            })),
            None => Ok(None),
        }
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        if self.finished {
            return Ok(None);
        }
        if self.num_started_sources != self.sources.len() {
            return Err(ArborError::InvariantViolation(
                "merge produced output before all sources started".to_string(),
            ));
        }

        // No merging is needed if there is only one source.
        if self.sources.len() == 1 {
            return self.passthrough_output();
        }
        self.merge_output()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for source in &self.sources {
            source.close();
        }
        self.installer.record_close_stats(&mut self.stats);
        Ok(())
    }

    fn stats(&self) -> OperatorStats {
        self.stats.clone()
    }
}
