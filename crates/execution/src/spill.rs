//! Spill files for reclaim-capable operators.
//!
//! Runs are Arrow IPC stream files under the query's spill directory. An
//! operator that catches a capacity-exceeded error writes its in-memory state
//! as a run, releases the memory, and retries; reclaim does the same on the
//! arbitrator's request.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arbor_common::{global_metrics, ArborError, Result};
use arrow::record_batch::RecordBatch;
use tracing::debug;

/// Location and size of one written spill run.
#[derive(Debug, Clone)]
pub struct SpillFileMeta {
    /// Absolute path of the run file.
    pub path: PathBuf,
    /// File size in bytes.
    pub bytes: u64,
    /// Rows across all batches in the run.
    pub rows: u64,
}

/// Writes ordered runs for one operator instance.
pub struct SpillWriter {
    dir: PathBuf,
    kind: &'static str,
    next_seq: u64,
}

impl SpillWriter {
    /// Create a writer rooted at `dir` (created if missing). `kind` labels
    /// spill metrics, e.g. "aggregate" or "writer".
    pub fn new(dir: impl Into<PathBuf>, kind: &'static str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            kind,
            next_seq: 0,
        })
    }

    /// Write one run. The batches must already be in the operator's output
    /// order; the merge reading runs back relies on it.
    pub fn write_run(&mut self, batches: &[RecordBatch]) -> Result<SpillFileMeta> {
        let schema = batches.first().map(|b| b.schema()).ok_or_else(|| {
            ArborError::InvalidConfig("spill run cannot be empty".to_string())
        })?;

        let path = self.dir.join(format!("run_{}.arrow", self.next_seq));
        self.next_seq += 1;

        let mut file = File::create(&path)?;
        {
            let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut file, schema.as_ref())
                .map_err(|e| ArborError::Execution(format!("spill writer init failed: {e}")))?;
            for batch in batches {
                writer
                    .write(batch)
                    .map_err(|e| ArborError::Execution(format!("spill write failed: {e}")))?;
            }
            writer
                .finish()
                .map_err(|e| ArborError::Execution(format!("spill finish failed: {e}")))?;
        }

        let bytes = fs::metadata(&path)?.len();
        let rows = batches.iter().map(|b| b.num_rows() as u64).sum();
        global_metrics().record_spill(self.kind, bytes);
        debug!(path = %path.display(), bytes, rows, kind = self.kind, "spill run written");
        Ok(SpillFileMeta { path, bytes, rows })
    }
}

/// Read one run back into memory.
pub fn read_spill_file(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path)?;
    let reader = arrow::ipc::reader::StreamReader::try_new(file, None)
        .map_err(|e| ArborError::Execution(format!("spill reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ArborError::Execution(format!("spill read failed: {e}")))
}
