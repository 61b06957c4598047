//! Runtime configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tag::Interval;

/// Options for a runtime instance, typically parsed from the command
/// line by the embedding binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Logical duration after which execution stops, if any. The stop
    /// tag becomes `(start + timeout, 0)` and shutdown reactions fire
    /// there.
    pub timeout: Option<Interval>,
    /// Skip waiting for physical time to catch up with logical time.
    pub fast: bool,
    /// Worker thread count; clamped to at least 1.
    pub workers: usize,
    /// Keep running on an empty event queue even without physical
    /// actions, waiting for external schedules.
    pub keepalive: bool,
    /// Safe-to-process offset applied in federated execution.
    pub stp_offset: Interval,
    /// Write a binary trace file here when set.
    pub trace_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            timeout: None,
            fast: false,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            keepalive: false,
            stp_offset: 0,
            trace_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Worker count with the >= 1 clamp applied.
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_at_least_one_worker() {
        assert!(RuntimeConfig::default().worker_count() >= 1);
    }

    #[test]
    fn zero_workers_clamps_to_one() {
        let config = RuntimeConfig {
            workers: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
    }
}
