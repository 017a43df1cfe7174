use thiserror::Error;

/// Canonical arbor error taxonomy used across crates.
///
/// Classification guidance:
/// - [`ArborError::CapacityExceeded`]: a memory pool could not grow within its
///   hard ceiling; recoverable by the caller if it can shed memory (spill)
/// - [`ArborError::MemoryAborted`]: the owning query was aborted by the
///   arbitrator; non-recoverable within the task
/// - [`ArborError::Allocation`]: the underlying allocator refused; classified
///   like capacity-exceeded
/// - [`ArborError::ExternalAbort`]: host-initiated cancellation of a task
/// - [`ArborError::InvariantViolation`]: programming error; fatal
/// - [`ArborError::Execution`]: runtime operator evaluation or data-shape
///   failures
/// - [`ArborError::InvalidConfig`]: config/plan contract violations discovered
///   before execution
#[derive(Debug, Error)]
pub enum ArborError {
    /// A memory pool could not grow within its max capacity.
    ///
    /// Examples:
    /// - per-query cap reached and no free capacity left process-wide
    /// - global arbitration reclaimed less than the shortfall
    #[error("memory capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The owning query's root pool was aborted by the arbitrator.
    #[error("memory pool aborted: {0}")]
    MemoryAborted(String),

    /// The underlying allocator refused an allocation.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Host-initiated cancellation of a task or query.
    #[error("aborted by host: {0}")]
    ExternalAbort(String),

    /// Internal invariant broken; indicates a bug, not user error.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - exchange page decode failures
    /// - batch/schema shape mismatches inside an operator
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid or inconsistent configuration/plan state.
    ///
    /// Examples:
    /// - constant sort key handed to a merge
    /// - unsupported null-handling mode in compare flags
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArborError {
    /// True for errors an operator may catch to initiate spill and retry.
    ///
    /// Allocation errors classify as capacity-exceeded: the caller cannot tell
    /// whether quota or the allocator said no, and the recovery is the same.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            ArborError::CapacityExceeded(_) | ArborError::Allocation(_)
        )
    }

    /// True when the owning query was aborted by the memory arbitrator.
    pub fn is_memory_aborted(&self) -> bool {
        matches!(self, ArborError::MemoryAborted(_))
    }

    /// True when the host cancelled the task.
    pub fn is_external_abort(&self) -> bool {
        matches!(self, ArborError::ExternalAbort(_))
    }
}

/// Standard arbor result alias.
pub type Result<T> = std::result::Result<T, ArborError>;

#[cfg(test)]
mod tests {
    use super::ArborError;

    #[test]
    fn allocation_classifies_as_capacity_exceeded() {
        assert!(ArborError::CapacityExceeded("cap".into()).is_capacity_exceeded());
        assert!(ArborError::Allocation("mmap".into()).is_capacity_exceeded());
        assert!(!ArborError::MemoryAborted("oom victim".into()).is_capacity_exceeded());
        assert!(ArborError::MemoryAborted("oom victim".into()).is_memory_aborted());
    }
}
