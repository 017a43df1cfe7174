//! Execution-time core: the cooperative operator contract, task/driver host
//! glue, and the order-preserving k-way merge.
//!
//! Architecture role:
//! - [`operator`] defines the pull contract drivers advance operators with
//! - [`task`] and [`driver`] provide the host surface the core consumes:
//!   split queues, merge source registries, the cooperative pause barrier
//! - [`merge`] implements the tournament merge with its local and exchange
//!   shapes
//! - [`query`] wires a query's config and root memory pool to its tasks so
//!   the shared arbitrator can pause, reclaim from, or abort them
//!
//! Key modules:
//! - [`merge`]
//! - [`operator`]
//! - [`task`]
//! - [`driver`]
//! - [`exchange`]
//! - [`spill`]

pub mod driver;
pub mod exchange;
pub mod future;
pub mod merge;
pub mod operator;
pub mod query;
pub mod spill;
pub mod split;
pub mod task;

pub use driver::{with_suspended_section, Driver, DriverCtx};
pub use exchange::{decode_page, encode_page, ExchangeClient, ExchangeSerdeKind};
pub use future::{continue_pair, ContinueFuture, ContinuePromise};
pub use merge::source::{
    max_queued_bytes_per_source, LocalMergeSource, MergeExchangeSource, MergeSource, SourceNext,
    MAX_QUEUED_BYTES_LOWER_LIMIT, MAX_QUEUED_BYTES_UPPER_LIMIT,
};
pub use merge::{CompareFlags, KeyChannel, MergeOperator, NullHandling, SortKey};
pub use operator::{
    Blocked, BlockingReason, Operator, OperatorCtx, OperatorStats, RuntimeCounter,
    SHUFFLE_COMPRESSION_KIND, SHUFFLE_SERDE_KIND, STRIPE_SIZE,
};
pub use query::QueryCtx;
pub use spill::{read_spill_file, SpillFileMeta, SpillWriter};
pub use split::{Split, SplitFetch};
pub use task::Task;
