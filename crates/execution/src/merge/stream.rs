//! Cursor over one merge source.
//!
//! A stream owns the source's current batch, the row representing it in the
//! tournament, and a selection bitmap of output slots it has produced but not
//! yet materialized. The selection must be flushed before the batch pointer
//! is replaced; `pop` enforces that.

use std::cmp::Ordering;
use std::sync::Arc;

use arbor_common::{ArborError, Result};
use arrow::array::{ArrayRef, BooleanBufferBuilder};
use arrow::record_batch::RecordBatch;
use arrow::row::{Row, RowConverter, Rows};

use crate::future::ContinueFuture;
use crate::merge::output::MergeOutputBuilder;
use crate::merge::source::{MergeSource, SourceNext};

pub(crate) struct SourceStream {
    source: Arc<dyn MergeSource>,
    converter: Arc<RowConverter>,
    key_channels: Vec<usize>,
    batch: Option<RecordBatch>,
    key_rows: Option<Rows>,
    current_row: usize,
    first_source_row: usize,
    selection: BooleanBufferBuilder,
    num_selected: usize,
    output_batch_size: usize,
    need_data: bool,
    at_end: bool,
}

impl SourceStream {
    pub(crate) fn new(
        source: Arc<dyn MergeSource>,
        converter: Arc<RowConverter>,
        key_channels: Vec<usize>,
        output_batch_size: usize,
    ) -> Self {
        let mut selection = BooleanBufferBuilder::new(output_batch_size);
        selection.append_n(output_batch_size, false);
        Self {
            source,
            converter,
            key_channels,
            batch: None,
            key_rows: None,
            current_row: 0,
            first_source_row: 0,
            selection,
            num_selected: 0,
            output_batch_size,
            need_data: true,
            at_end: false,
        }
    }

    /// Whether this stream currently represents a row in the tournament.
    pub(crate) fn has_row(&self) -> bool {
        !self.at_end
            && !self.need_data
            && self
                .batch
                .as_ref()
                .is_some_and(|batch| self.current_row < batch.num_rows())
    }

    /// Whether the stream is waiting on its source for the next batch.
    pub(crate) fn needs_data(&self) -> bool {
        self.need_data
    }

    /// Fetch the first/next batch if one is due. Blocked fetches record their
    /// future in `futures`.
    pub(crate) fn ensure_ready(&mut self, futures: &mut Vec<ContinueFuture>) -> Result<()> {
        if self.need_data && !self.at_end {
            self.fetch_more_data(futures)?;
        }
        Ok(())
    }

    fn key_row(&self) -> Row<'_> {
        self.key_rows
            .as_ref()
            .expect("stream compared without key rows")
            .row(self.current_row)
    }

    /// Compare the current rows of two streams under the shared sort keys.
    pub(crate) fn compare(&self, other: &SourceStream) -> Ordering {
        self.key_row().cmp(&other.key_row())
    }

    /// Mark `slot` in the output selection. Returns true when the current row
    /// is the last of its batch, meaning the caller must flush the selection
    /// before advancing replaces the batch.
    pub(crate) fn set_output_row(&mut self, slot: usize) -> bool {
        debug_assert!(slot < self.output_batch_size);
        self.selection.set_bit(slot, true);
        self.num_selected += 1;
        let batch = self.batch.as_ref().expect("set_output_row without batch");
        self.current_row + 1 == batch.num_rows()
    }

    /// Advance to the next row, fetching the next batch at a batch boundary.
    /// Returns true when the advance blocked on the source.
    pub(crate) fn pop(&mut self, futures: &mut Vec<ContinueFuture>) -> Result<bool> {
        let batch_rows = self
            .batch
            .as_ref()
            .map(RecordBatch::num_rows)
            .ok_or_else(|| {
                ArborError::InvariantViolation("pop on a stream without a batch".to_string())
            })?;
        self.current_row += 1;
        if self.current_row == batch_rows {
            if self.num_selected != 0 {
                return Err(ArborError::InvariantViolation(
                    "stream selection must be flushed before its batch is replaced".to_string(),
                ));
            }
            return self.fetch_more_data(futures);
        }
        Ok(false)
    }

    /// Materialize the selected output slots into `output` and clear the
    /// selection. Selected slots map to consecutive source rows starting at
    /// `first_source_row`.
    pub(crate) fn copy_to_output(&mut self, output: &mut MergeOutputBuilder) -> Result<()> {
        if self.num_selected == 0 {
            return Ok(());
        }
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| {
                ArborError::InvariantViolation(
                    "selection outlived the batch it points into".to_string(),
                )
            })?
            .clone();

        let selected = self.selection.finish();
        self.selection.append_n(self.output_batch_size, false);
        self.num_selected = 0;

        let batch_rows = batch.num_rows();
        let batch_index = output.add_batch(batch);
        let mut source_row = self.first_source_row;
        for slot in selected.set_indices() {
            output.assign(slot, batch_index, source_row);
            source_row += 1;
        }
        self.first_source_row = if source_row == batch_rows { 0 } else { source_row };
        Ok(())
    }

    fn fetch_more_data(&mut self, futures: &mut Vec<ContinueFuture>) -> Result<bool> {
        match self.source.next()? {
            SourceNext::Blocked(future) => {
                self.need_data = true;
                futures.push(future);
                Ok(true)
            }
            SourceNext::AtEnd => {
                self.at_end = true;
                self.need_data = false;
                self.batch = None;
                self.key_rows = None;
                self.current_row = 0;
                Ok(false)
            }
            SourceNext::Batch(batch) => {
                if batch.num_rows() == 0 {
                    self.at_end = true;
                    self.need_data = false;
                    self.batch = None;
                    self.key_rows = None;
                    self.current_row = 0;
                    return Ok(false);
                }
                let key_columns = self
                    .key_channels
                    .iter()
                    .map(|channel| Arc::clone(batch.column(*channel)))
                    .collect::<Vec<ArrayRef>>();
                let key_rows = self
                    .converter
                    .convert_columns(&key_columns)
                    .map_err(|e| ArborError::Execution(format!("sort key encoding failed: {e}")))?;
                self.key_rows = Some(key_rows);
                self.batch = Some(batch);
                self.current_row = 0;
                self.need_data = false;
                Ok(false)
            }
        }
    }
}
