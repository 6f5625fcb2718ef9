//! Environment interfaces supplied by the embedder.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::fs::{Mount, WritableMount};

/// A metric the core reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Time spent executing a computer on a worker thread.
    ComputerTasks,
    /// Time spent running a computer's main-thread tasks.
    MainThreadTasks,
}

/// Sink for per-computer timing observations.
pub trait MetricsObserver: Send + Sync {
    fn observe(&self, metric: Metric, duration: Duration);
}

/// A metrics observer which discards everything.
pub struct NoOpMetrics;

impl MetricsObserver for NoOpMetrics {
    fn observe(&self, _metric: Metric, _duration: Duration) {}
}

/// The per-computer environment: where this computer's writable storage lives
/// and what time it is.
pub trait ComputerEnvironment: Send + Sync {
    /// The in-world day, for timestamps the machine may ask for.
    fn day(&self) -> u32;

    /// The time of day in hours, `0.0..24.0`.
    fn time_of_day(&self) -> f64;

    fn metrics(&self) -> Arc<dyn MetricsObserver>;

    /// Create the writable root mount for this computer's private storage.
    fn create_root_mount(&self) -> anyhow::Result<Arc<dyn WritableMount>>;
}

/// The process-wide environment shared by every computer.
pub trait GlobalEnvironment: Send + Sync {
    /// A free-form description of the host, surfaced to machines.
    fn host_string(&self) -> String;

    /// Create a read-only mount over a bundled resource tree, such as the rom.
    fn create_resource_mount(&self, domain: &str, sub_path: &str) -> Option<Arc<dyn Mount>>;

    /// Open a single bundled resource file, such as the boot script.
    fn create_resource_file(&self, domain: &str, sub_path: &str)
        -> Option<Box<dyn Read + Send>>;
}
