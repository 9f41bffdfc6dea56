//! Run configuration

use std::time::Duration;
use strata_core::TargetConfig;

/// Settings for one execution pass
///
/// Injected explicitly into the executor; nothing is read from globals.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Worker and connection count (at least 1)
    pub threads: usize,

    /// Timeout for nodes that set none themselves
    pub default_timeout: Option<Duration>,

    /// Cancel the rest of the run on the first error
    pub fail_fast: bool,

    /// Rebuild incremental models from scratch
    pub full_refresh: bool,

    /// Target the run executes against
    pub target: TargetConfig,
}

impl RunConfig {
    pub fn new(target: TargetConfig) -> Self {
        Self {
            threads: target.threads.max(1),
            default_timeout: None,
            fail_fast: false,
            full_refresh: false,
            target,
        }
    }

    /// Set the worker count; zero is raised to one
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    /// Effective timeout of a node given its own `timeout` setting in seconds
    pub fn timeout_for(&self, node_timeout: Option<u64>) -> Option<Duration> {
        node_timeout.map(Duration::from_secs).or(self.default_timeout)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(TargetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_never_drop_below_one() {
        assert_eq!(RunConfig::default().with_threads(0).threads, 1);
        assert_eq!(RunConfig::default().threads, 4);
    }

    #[test]
    fn node_timeout_overrides_default() {
        let config = RunConfig::default().with_default_timeout(Duration::from_secs(30));
        assert_eq!(config.timeout_for(Some(5)), Some(Duration::from_secs(5)));
        assert_eq!(config.timeout_for(None), Some(Duration::from_secs(30)));
        assert_eq!(RunConfig::default().timeout_for(None), None);
    }
}
