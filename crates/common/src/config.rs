use serde::{Deserialize, Serialize};

/// Compression applied to exchange pages in flight.
///
/// The core records the configured kind in operator runtime stats; the actual
/// codec lives in the exchange transport, outside this workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// No compression.
    None,
    /// LZ4 frame compression.
    Lz4,
    /// Zstandard compression.
    Zstd,
}

impl Default for CompressionKind {
    fn default() -> Self {
        Self::None
    }
}

impl CompressionKind {
    /// Stable numeric code recorded in runtime statistics.
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Lz4 => write!(f, "lz4"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

/// Per-query configuration shared across the memory and execution layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Target rows per output batch for operators.
    pub batch_size_rows: usize,

    /// Hard per-query memory ceiling enforced by the arbitrator.
    pub memory_capacity: u64,
    /// Capacity granted to a fresh root pool before its first grow request.
    pub memory_pool_init_capacity: u64,

    /// Whether operators may spill at all.
    pub spill_enabled: bool,
    /// Whether join operators may spill (requires `spill_enabled`).
    pub join_spill_enabled: bool,
    /// Whether table writers may spill (requires `spill_enabled`).
    pub writer_spill_enabled: bool,
    /// Buffered bytes above which a writer flushes a stripe.
    pub writer_flush_threshold_bytes: u64,
    /// log2 of the spill partition fan-out.
    pub spill_num_partition_bits: u8,
    /// Directory used for spill files.
    pub spill_dir: String,

    /// Total queued-bytes budget shared by the sources of one merge exchange.
    pub max_merge_exchange_buffer_size: u64,
    /// Compression applied to exchange pages.
    #[serde(default)]
    pub shuffle_compression_kind: CompressionKind,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 1024,
            memory_capacity: 512 * 1024 * 1024,          // 512MB
            memory_pool_init_capacity: 64 * 1024 * 1024, // 64MB
            spill_enabled: false,
            join_spill_enabled: true,
            writer_spill_enabled: true,
            writer_flush_threshold_bytes: 96 * 1024 * 1024, // 96MB
            spill_num_partition_bits: 3,
            spill_dir: "./arbor_spill".to_string(),
            max_merge_exchange_buffer_size: 128 * 1024 * 1024, // 128MB
            shuffle_compression_kind: CompressionKind::None,
        }
    }
}
