//! Node-level run errors

use std::time::Duration;
use strata_adapter::AdapterError;

/// Why a node ended in `error`
///
/// Always scoped to one node: it cascades along dependency edges as skips and
/// never aborts the run by itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Got {0} failing row(s)")]
    TestFailures(u64),
}

impl NodeError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Cancelled | Self::TestFailures(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message() {
        assert_eq!(NodeError::Timeout(Duration::from_millis(1500)).to_string(), "Timed out after 1.5s");
    }

    #[test]
    fn retry_policy() {
        assert!(NodeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(NodeError::from(AdapterError::ExecutionError("lock timeout".into())).is_retryable());
        assert!(!NodeError::Cancelled.is_retryable());
        assert!(!NodeError::TestFailures(3).is_retryable());
    }
}
