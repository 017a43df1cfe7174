//! Output batch assembly for the merge.
//!
//! Streams assign output slots to (batch, row) pairs as the tournament pops
//! rows; the builder materializes each column with one interleave when the
//! batch fills or input ends.

use arbor_common::{ArborError, Result};
use arrow::array::Array;
use arrow::compute::interleave;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;

pub(crate) struct MergeOutputBuilder {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    slots: Vec<(usize, usize)>,
}

impl MergeOutputBuilder {
    pub(crate) fn new(schema: SchemaRef, batch_size: usize) -> Self {
        Self {
            schema,
            batches: Vec::new(),
            slots: vec![(usize::MAX, 0); batch_size],
        }
    }

    /// Register a source batch and return its index for slot assignments.
    /// Batches are Arc'd columns, so registration is cheap; the list resets
    /// on every emitted output batch.
    pub(crate) fn add_batch(&mut self, batch: RecordBatch) -> usize {
        self.batches.push(batch);
        self.batches.len() - 1
    }

    /// Point output slot `slot` at `row` of registered batch `batch_index`.
    pub(crate) fn assign(&mut self, slot: usize, batch_index: usize, row: usize) {
        self.slots[slot] = (batch_index, row);
    }

    /// Materialize the first `size` slots into a batch and reset the builder.
    pub(crate) fn build(&mut self, size: usize) -> Result<RecordBatch> {
        debug_assert!(size > 0);
        debug_assert!(self.slots[..size].iter().all(|(b, _)| *b != usize::MAX));

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for col in 0..self.schema.fields().len() {
            let arrays = self
                .batches
                .iter()
                .map(|batch| batch.column(col).as_ref() as &dyn Array)
                .collect::<Vec<_>>();
            let column = interleave(&arrays, &self.slots[..size])
                .map_err(|e| ArborError::Execution(format!("merge output interleave failed: {e}")))?;
            columns.push(column);
        }
        let batch = RecordBatch::try_new(self.schema.clone(), columns)
            .map_err(|e| ArborError::Execution(format!("merge output batch invalid: {e}")))?;

        self.batches.clear();
        for slot in &mut self.slots {
            *slot = (usize::MAX, 0);
        }
        Ok(batch)
    }
}
