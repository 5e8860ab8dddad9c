use std::{path::PathBuf, time::Duration};

use crate::store::StorageMedium;

/// One configured storage volume root.
#[derive(Debug, Clone)]
pub struct StorePath {
    /// Root directory of the volume.
    pub path: PathBuf,
    /// Advertised capacity in bytes.
    pub capacity_bytes: u64,
    /// Medium class of the backing device.
    pub medium: StorageMedium,
}

impl StorePath {
    /// Describe a volume rooted at `path`.
    pub fn new(path: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        StorePath {
            path: path.into(),
            capacity_bytes,
            medium: StorageMedium::Hdd,
        }
    }

    /// Set the storage medium class.
    pub fn medium(self, medium: StorageMedium) -> Self {
        StorePath { medium, ..self }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub(crate) store_paths: Vec<StorePath>,
    /// Cluster id handed down by the control plane, if already known.
    pub(crate) cluster_id: i32,
    pub(crate) compaction_failure_backoff: Duration,
    pub(crate) compaction_check_interval: Duration,
    pub(crate) snapshot_expire: Duration,
    pub(crate) trash_expire: Duration,
    /// Usage fraction above which trash is reclaimed regardless of age.
    pub(crate) trash_guard_fraction: f64,
    /// Fraction of unusable volumes above which the engine is done for.
    pub(crate) error_disk_fraction: f64,
    pub(crate) disk_monitor_interval: Duration,
    pub(crate) gc_interval: Duration,
    pub(crate) trash_sweep_interval: Duration,
    pub(crate) index_cache_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            store_paths: Vec::new(),
            cluster_id: -1,
            compaction_failure_backoff: Duration::from_secs(600),
            compaction_check_interval: Duration::from_secs(10),
            snapshot_expire: Duration::from_secs(48 * 3600),
            trash_expire: Duration::from_secs(72 * 3600),
            trash_guard_fraction: 0.9,
            error_disk_fraction: 0.5,
            disk_monitor_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(60),
            trash_sweep_interval: Duration::from_secs(3600),
            index_cache_capacity: 4096,
        }
    }
}

impl EngineOptions {
    /// Options for the given set of volumes.
    pub fn new(store_paths: Vec<StorePath>) -> Self {
        EngineOptions {
            store_paths,
            ..Default::default()
        }
    }

    /// Add one volume.
    pub fn store_path(mut self, store_path: StorePath) -> Self {
        self.store_paths.push(store_path);
        self
    }

    /// Cluster id known ahead of open, `-1` when it is not.
    pub fn cluster_id(self, cluster_id: i32) -> Self {
        EngineOptions { cluster_id, ..self }
    }

    /// Minimum wait after a failed compaction before the tablet is
    /// considered again.
    pub fn compaction_failure_backoff(self, compaction_failure_backoff: Duration) -> Self {
        EngineOptions {
            compaction_failure_backoff,
            ..self
        }
    }

    /// Interval between compaction scheduling passes.
    pub fn compaction_check_interval(self, compaction_check_interval: Duration) -> Self {
        EngineOptions {
            compaction_check_interval,
            ..self
        }
    }

    /// Age past which snapshot directory entries are reclaimed.
    pub fn snapshot_expire(self, snapshot_expire: Duration) -> Self {
        EngineOptions {
            snapshot_expire,
            ..self
        }
    }

    /// Age past which trash directory entries are reclaimed.
    pub fn trash_expire(self, trash_expire: Duration) -> Self {
        EngineOptions {
            trash_expire,
            ..self
        }
    }

    /// Usage fraction that switches trash sweeping to immediate reclamation.
    pub fn trash_guard_fraction(self, trash_guard_fraction: f64) -> Self {
        EngineOptions {
            trash_guard_fraction,
            ..self
        }
    }

    /// Fraction of unusable volumes the engine tolerates before reporting
    /// itself dead.
    pub fn error_disk_fraction(self, error_disk_fraction: f64) -> Self {
        EngineOptions {
            error_disk_fraction,
            ..self
        }
    }

    /// Interval between disk health checks.
    pub fn disk_monitor_interval(self, disk_monitor_interval: Duration) -> Self {
        EngineOptions {
            disk_monitor_interval,
            ..self
        }
    }

    /// Interval between unused index/rowset sweeps.
    pub fn gc_interval(self, gc_interval: Duration) -> Self {
        EngineOptions {
            gc_interval,
            ..self
        }
    }

    /// Interval between trash/snapshot sweeps.
    pub fn trash_sweep_interval(self, trash_sweep_interval: Duration) -> Self {
        EngineOptions {
            trash_sweep_interval,
            ..self
        }
    }

    /// Capacity of the shared segment-index cache. Must be nonzero.
    pub fn index_cache_capacity(self, index_cache_capacity: usize) -> Self {
        EngineOptions {
            index_cache_capacity,
            ..self
        }
    }
}
