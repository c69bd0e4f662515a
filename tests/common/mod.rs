#![allow(dead_code)]

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex, Once, OnceLock},
};
use tracing_subscriber::{EnvFilter, fmt};
use txgraph::{config::ExecutorConfig, executor::Executor};

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=txgraph=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn executor() -> Executor {
    executor_with_threads(4)
}

pub fn executor_with_threads(threads: usize) -> Executor {
    init_tracing();
    let config = ExecutorConfig::default()
        .with_worker_threads(NonZeroUsize::new(threads).unwrap())
        .with_thread_name_prefix("txgraph-test");
    Executor::new(config).expect("worker pool")
}

/// One executor for every case of a property test.
pub fn shared_executor() -> &'static Executor {
    static EXECUTOR: OnceLock<Executor> = OnceLock::new();
    EXECUTOR.get_or_init(executor)
}

/// Shared log of facet calls, in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == event)
    }

    /// Position of `event` in the log.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().unwrap().iter().position(|e| e == event)
    }

    /// A facet closure that records `event` and succeeds.
    pub fn step(&self, event: &str) -> impl FnMut() -> anyhow::Result<()> + Send + 'static {
        let recorder = self.clone();
        let event = event.to_owned();
        move || {
            recorder.record(event.clone());
            Ok(())
        }
    }
}
