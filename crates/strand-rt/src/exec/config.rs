// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executor tuning knobs.

use std::thread;
use std::time::Duration;

/// Executor configuration. Passed by value at construction; every field has
/// a documented default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on live workers. Defaults to hardware parallelism.
    pub max_workers: usize,
    /// Floor below which idle timeouts never retire a worker.
    /// Defaults to half of `max_workers`, at least 1.
    pub min_workers: usize,
    /// Average queue depth per worker above which a submission spawns an
    /// additional worker. Default 3.
    pub tasks_per_worker_threshold: usize,
    /// Idle duration after which a worker above the floor exits.
    /// Default 60 seconds.
    pub keep_alive: Duration,
    /// Give each worker a local queue and let idle workers steal from
    /// peers. Default true.
    pub work_stealing: bool,
    /// Starting cell-pool capacity of every queue. Default 256.
    pub initial_task_pool_size: usize,
    /// Acquire work in batches: drain up to `batch_size` tasks from one
    /// priority class, run the first, spill the rest locally. Default false.
    pub batch_acquisition: bool,
    /// Most tasks one batch acquisition may drain. Default 512.
    pub batch_size: usize,
}

/// Hardware parallelism, falling back to 4 when detection fails.
pub(crate) fn hardware_workers() -> usize {
    thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

impl Default for Config {
    fn default() -> Self {
        let max_workers = hardware_workers();
        Self {
            max_workers,
            min_workers: (max_workers / 2).max(1),
            tasks_per_worker_threshold: 3,
            keep_alive: Duration::from_secs(60),
            work_stealing: true,
            initial_task_pool_size: 256,
            batch_acquisition: false,
            batch_size: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_hardware() {
        let cfg = Config::default();
        assert_eq!(cfg.max_workers, hardware_workers());
        assert_eq!(cfg.min_workers, (cfg.max_workers / 2).max(1));
        assert_eq!(cfg.tasks_per_worker_threshold, 3);
        assert_eq!(cfg.keep_alive, Duration::from_secs(60));
        assert!(cfg.work_stealing);
        assert_eq!(cfg.initial_task_pool_size, 256);
        assert!(!cfg.batch_acquisition);
        assert_eq!(cfg.batch_size, 512);
    }

    #[test]
    fn min_workers_never_zero() {
        let cfg = Config::default();
        assert!(cfg.min_workers >= 1);
    }
}
