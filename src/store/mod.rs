//! Physical storage volumes ("data directories").

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::EngineError,
    meta::store::MetaStore,
    option::StorePath,
    tablet::TabletInfo,
};

/// Subdirectory holding tablet data, laid out as `data/<shard>/<tablet>/<hash>`.
pub const DATA_PREFIX: &str = "data";
/// Subdirectory holding snapshot exports, entries named `%Y%m%d%H%M%S.*`.
pub const SNAPSHOT_PREFIX: &str = "snapshot";
/// Subdirectory holding retired files awaiting expiry, same naming scheme.
pub const TRASH_PREFIX: &str = "trash";

/// Number of shard subdirectories tablet data is spread across per volume.
const SHARD_NUM: u64 = 1024;

/// Medium class of a volume's backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMedium {
    /// Rotational storage.
    Hdd,
    /// Flash storage.
    Ssd,
}

/// Query for the free space under a path.
///
/// The engine core does not talk to the OS for this; the embedding process
/// supplies the probe (and tests supply fakes).
pub trait DiskSpace: Send + Sync {
    /// Available bytes on the filesystem holding `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Probe that reports every volume as empty. Placeholder for embedders that
/// do not wire a real statfs-style query.
#[derive(Debug, Default)]
pub struct UnboundedDiskSpace;

impl DiskSpace for UnboundedDiskSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

/// One physical storage volume.
pub struct DataDir {
    path: PathBuf,
    capacity_bytes: u64,
    available_bytes: AtomicU64,
    medium: StorageMedium,
    is_used: AtomicBool,
    next_shard: AtomicU64,
    meta: MetaStore,
    /// Tablets registered on this volume, so an unusable volume can name
    /// what it took down.
    tablets: Mutex<HashSet<TabletInfo>>,
}

impl DataDir {
    /// Initialize a volume from configuration: open its meta store and make
    /// sure the well-known subdirectories exist.
    pub fn init(store_path: &StorePath) -> Result<Self, EngineError> {
        for sub in [DATA_PREFIX, SNAPSHOT_PREFIX, TRASH_PREFIX] {
            std::fs::create_dir_all(store_path.path.join(sub))?;
        }
        let meta = MetaStore::open(&store_path.path)?;

        Ok(DataDir {
            path: store_path.path.clone(),
            capacity_bytes: store_path.capacity_bytes,
            available_bytes: AtomicU64::new(store_path.capacity_bytes),
            medium: store_path.medium,
            is_used: AtomicBool::new(true),
            next_shard: AtomicU64::new(0),
            meta,
            tablets: Mutex::new(HashSet::new()),
        })
    }

    /// Volume root path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The volume's embedded metadata store.
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    /// Medium class.
    pub fn storage_medium(&self) -> StorageMedium {
        self.medium
    }

    /// Configured capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Last observed available bytes.
    pub fn available_bytes(&self) -> u64 {
        self.available_bytes.load(Ordering::Acquire)
    }

    /// Record a fresh available-bytes observation, clamped to capacity.
    pub fn set_available_bytes(&self, available: u64) {
        self.available_bytes
            .store(available.min(self.capacity_bytes), Ordering::Release);
    }

    /// Fraction of capacity currently in use.
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.capacity_bytes - self.available_bytes()) as f64 / self.capacity_bytes as f64
    }

    /// Whether the volume is healthy and schedulable.
    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }

    /// Flip the volume's usable flag.
    pub fn set_is_used(&self, is_used: bool) {
        self.is_used.store(is_used, Ordering::Release);
    }

    /// The volume's stored cluster id, `-1` when unset.
    pub fn cluster_id(&self) -> Result<i32, EngineError> {
        Ok(self.meta.cluster_id()?)
    }

    /// Persist the volume's cluster id.
    pub fn set_cluster_id(&self, cluster_id: i32) -> Result<(), EngineError> {
        Ok(self.meta.set_cluster_id(cluster_id)?)
    }

    /// Allocate the shard subdirectory for a new tablet and make sure it
    /// exists on disk.
    pub fn get_shard(&self) -> Result<u64, EngineError> {
        let shard = self.next_shard.fetch_add(1, Ordering::AcqRel) % SHARD_NUM;
        std::fs::create_dir_all(self.shard_path(shard))?;
        Ok(shard)
    }

    /// Absolute path of one shard subdirectory.
    pub fn shard_path(&self, shard: u64) -> PathBuf {
        self.path.join(DATA_PREFIX).join(shard.to_string())
    }

    /// Absolute data path of one tablet.
    pub fn tablet_path(&self, shard: u64, tablet_id: u64, schema_hash: u32) -> PathBuf {
        self.shard_path(shard)
            .join(tablet_id.to_string())
            .join(schema_hash.to_string())
    }

    /// Remember that a tablet lives on this volume.
    pub fn register_tablet(&self, info: TabletInfo) {
        self.tablets.lock().insert(info);
    }

    /// Forget a tablet that was dropped or moved.
    pub fn deregister_tablet(&self, info: &TabletInfo) {
        self.tablets.lock().remove(info);
    }

    /// Take the full set of tablets registered on this volume. Called when
    /// the volume goes unusable so the directory can unregister them.
    pub fn clear_tablets(&self) -> Vec<TabletInfo> {
        self.tablets.lock().drain().collect()
    }

    /// Probe the volume by round-tripping a small file under its root. A
    /// failing probe marks the volume unused.
    pub fn health_check(&self) -> bool {
        let probe = self.path.join(".health_check");
        let healthy = std::fs::write(&probe, b"ok")
            .and_then(|()| std::fs::remove_file(&probe))
            .map_err(|e| {
                warn!(path = %self.path.display(), "volume health check failed: {e}");
                e
            })
            .is_ok();
        if !healthy {
            self.set_is_used(false);
        }
        healthy
    }

    /// Snapshot of the volume's externally visible state.
    pub fn dir_info(&self) -> DataDirInfo {
        let is_used = self.is_used();
        if is_used {
            DataDirInfo {
                path: self.path.clone(),
                capacity_bytes: self.capacity_bytes,
                available_bytes: self.available_bytes(),
                medium: self.medium,
                is_used,
            }
        } else {
            // Unused volumes report a placeholder so consumers never divide
            // by a stale capacity.
            DataDirInfo {
                path: self.path.clone(),
                capacity_bytes: 1,
                available_bytes: 0,
                medium: StorageMedium::Hdd,
                is_used,
            }
        }
    }
}

impl std::fmt::Debug for DataDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDir")
            .field("path", &self.path)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("medium", &self.medium)
            .field("is_used", &self.is_used())
            .finish()
    }
}

/// Externally visible description of one volume.
#[derive(Debug, Clone)]
pub struct DataDirInfo {
    /// Volume root path.
    pub path: PathBuf,
    /// Configured capacity in bytes.
    pub capacity_bytes: u64,
    /// Last observed available bytes.
    pub available_bytes: u64,
    /// Medium class.
    pub medium: StorageMedium,
    /// Whether the volume is usable.
    pub is_used: bool,
}

impl DataDirInfo {
    /// Fraction of capacity currently in use.
    pub fn usage_fraction(&self) -> f64 {
        (self.capacity_bytes - self.available_bytes) as f64 / self.capacity_bytes as f64
    }
}
