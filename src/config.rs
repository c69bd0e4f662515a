use core::num::NonZeroUsize;
use tracing::warn;

/// Environment variable consulted by [`ExecutorConfig::from_env`].
pub const WORKER_THREADS_ENV: &str = "TXGRAPH_WORKER_THREADS";

const DEFAULT_THREAD_NAME_PREFIX: &str = "txgraph-worker";

/// Configuration entry-point for instantiating the executor.
///
/// Controls the worker pool that runs task facets. Every field has a
/// default, so `ExecutorConfig::default()` is a complete configuration.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads. `None` lets the pool pick one thread per
    /// logical CPU.
    pub worker_threads: Option<NonZeroUsize>,
    /// Prefix of worker thread names; the worker index is appended.
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
        }
    }
}

impl ExecutorConfig {
    /// Default configuration with the worker count taken from
    /// `TXGRAPH_WORKER_THREADS` when it holds a positive integer.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(WORKER_THREADS_ENV) {
            match parse_worker_threads(&raw) {
                Some(threads) => config.worker_threads = Some(threads),
                None => warn!(
                    value = %raw,
                    "ignoring {WORKER_THREADS_ENV}: expected a positive integer"
                ),
            }
        }
        config
    }

    /// Use exactly `threads` worker threads.
    pub fn with_worker_threads(mut self, threads: NonZeroUsize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Name worker threads `<prefix>-<index>`.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

fn parse_worker_threads(raw: &str) -> Option<NonZeroUsize> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positive_thread_counts_only() {
        assert_eq!(parse_worker_threads("4"), NonZeroUsize::new(4));
        assert_eq!(parse_worker_threads(" 12\n"), NonZeroUsize::new(12));
        assert_eq!(parse_worker_threads("0"), None);
        assert_eq!(parse_worker_threads("-3"), None);
        assert_eq!(parse_worker_threads("many"), None);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = ExecutorConfig::default()
            .with_worker_threads(NonZeroUsize::new(3).unwrap())
            .with_thread_name_prefix("engine");
        assert_eq!(config.worker_threads, NonZeroUsize::new(3));
        assert_eq!(config.thread_name_prefix, "engine");
        assert_eq!(ExecutorConfig::default().worker_threads, None);
    }
}
