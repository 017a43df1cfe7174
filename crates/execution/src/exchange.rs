//! Exchange page framing and the client trait merge exchange pulls through.
//!
//! A page is one Arrow IPC stream holding one or more record batches, the
//! same framing the shuffle layer writes to disk. The transport that moves
//! pages between workers lives outside this workspace; sources only see the
//! blocking [`ExchangeClient`] interface.

use std::io::Cursor;

use arbor_common::ids::RemoteTaskId;
use arbor_common::{ArborError, Result};
use arrow::record_batch::RecordBatch;

/// Serialization format of exchange pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeSerdeKind {
    /// Arrow IPC stream framing.
    ArrowIpc,
}

impl ExchangeSerdeKind {
    /// Stable numeric code recorded in runtime statistics.
    pub fn code(self) -> i64 {
        match self {
            Self::ArrowIpc => 0,
        }
    }
}

impl std::fmt::Display for ExchangeSerdeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArrowIpc => write!(f, "arrow-ipc"),
        }
    }
}

/// Blocking page fetcher for one merge exchange.
///
/// `next_page` returns `Ok(None)` when the remote task has delivered all of
/// its sorted output. Implementations may block; sources call this from a
/// dedicated fetch thread, never from a driver.
pub trait ExchangeClient: Send + Sync {
    /// Fetch the next page produced by `remote_task`.
    fn next_page(&self, remote_task: &RemoteTaskId) -> Result<Option<Vec<u8>>>;
}

/// Encode batches into one IPC stream page.
pub fn encode_page(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let schema = batches.first().map(|b| b.schema()).ok_or_else(|| {
        ArborError::InvalidConfig("exchange page cannot be empty".to_string())
    })?;
    let mut out = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| ArborError::Execution(format!("ipc writer init failed: {e}")))?;
        for b in batches {
            writer
                .write(b)
                .map_err(|e| ArborError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| ArborError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode one IPC stream page back into batches.
pub fn decode_page(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let cur = Cursor::new(bytes.to_vec());
    let reader = arrow::ipc::reader::StreamReader::try_new(cur, None)
        .map_err(|e| ArborError::Execution(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ArborError::Execution(format!("ipc read failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn page_round_trip() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2, 3]))],
        )
        .expect("batch");

        let page = encode_page(std::slice::from_ref(&batch)).expect("encode");
        let decoded = decode_page(&page).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].num_rows(), 3);
    }

    #[test]
    fn empty_page_is_rejected() {
        assert!(encode_page(&[]).is_err());
    }
}
