//! Tablets: table shards with a versioned rowset history on one volume.

pub mod directory;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    error::EngineError,
    meta::{TabletMeta, TabletSchema},
    rowset::{Rowset, Version},
    store::{DataDir, StorageMedium},
};

/// Identity of one tablet: id plus schema hash.
///
/// Ordered by `(tablet_id, schema_hash)`; multi-tablet operations sort by
/// this order before locking so lock acquisition is deadlock-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TabletInfo {
    /// Tablet id.
    pub tablet_id: u64,
    /// Schema hash.
    pub schema_hash: u32,
}

impl TabletInfo {
    /// Identity for `tablet_id` at `schema_hash`.
    pub fn new(tablet_id: u64, schema_hash: u32) -> Self {
        TabletInfo {
            tablet_id,
            schema_hash,
        }
    }
}

impl std::fmt::Display for TabletInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.tablet_id, self.schema_hash)
    }
}

/// Request to create a new tablet.
#[derive(Debug, Clone)]
pub struct CreateTabletRequest {
    /// Tablet id assigned by the control plane.
    pub tablet_id: u64,
    /// Schema hash.
    pub schema_hash: u32,
    /// Logical schema.
    pub schema: TabletSchema,
    /// Requested medium class for the backing volume.
    pub storage_medium: StorageMedium,
    /// Tablet this one is derived from (schema change). When set and live,
    /// the new tablet is placed on the same volume so the conversion can
    /// link files locally.
    pub base_tablet: Option<TabletInfo>,
}

/// The two background compaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    /// Merge of recent small rowsets to bound version count.
    Cumulative,
    /// Rewrite of the tablet's base data to reclaim space.
    Base,
}

impl std::fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionKind::Cumulative => write!(f, "cumulative"),
            CompactionKind::Base => write!(f, "base"),
        }
    }
}

/// Milliseconds since the epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub(crate) struct TabletHeader {
    /// Visible rowsets keyed by version range.
    rowsets: BTreeMap<Version, Arc<Rowset>>,
}

/// One tablet. All mutation of the rowset set goes through the header write
/// lock; reads take at least the read lock.
pub struct Tablet {
    tablet_id: u64,
    schema_hash: u32,
    shard_id: u64,
    schema: TabletSchema,
    data_dir: Arc<DataDir>,
    header: RwLock<TabletHeader>,
    cumulative_lock: Mutex<()>,
    base_lock: Mutex<()>,
    /// Millis of the last compaction failure, `0` meaning none.
    last_compaction_failure_ms: AtomicU64,
    compaction_failure_count: AtomicU64,
    is_used: AtomicBool,
    is_loaded: AtomicBool,
}

impl Tablet {
    /// Materialize a tablet from its persisted meta on the given volume.
    pub fn from_meta(meta: TabletMeta, data_dir: Arc<DataDir>) -> Arc<Self> {
        Arc::new(Tablet {
            tablet_id: meta.tablet_id,
            schema_hash: meta.schema_hash,
            shard_id: meta.shard_id,
            schema: meta.schema,
            data_dir,
            header: RwLock::new(TabletHeader::default()),
            cumulative_lock: Mutex::new(()),
            base_lock: Mutex::new(()),
            last_compaction_failure_ms: AtomicU64::new(0),
            compaction_failure_count: AtomicU64::new(0),
            is_used: AtomicBool::new(true),
            is_loaded: AtomicBool::new(true),
        })
    }

    /// Tablet id.
    pub fn tablet_id(&self) -> u64 {
        self.tablet_id
    }

    /// Schema hash.
    pub fn schema_hash(&self) -> u32 {
        self.schema_hash
    }

    /// Identity key of this tablet.
    pub fn info(&self) -> TabletInfo {
        TabletInfo::new(self.tablet_id, self.schema_hash)
    }

    /// `tablet_id.schema_hash`, the form used in logs.
    pub fn full_name(&self) -> String {
        self.info().to_string()
    }

    /// Logical schema.
    pub fn schema(&self) -> &TabletSchema {
        &self.schema
    }

    /// Volume this tablet lives on for its whole lifetime.
    pub fn data_dir(&self) -> &Arc<DataDir> {
        &self.data_dir
    }

    /// Shard subdirectory on the volume.
    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    /// Absolute data path of this tablet.
    pub fn tablet_path(&self) -> std::path::PathBuf {
        self.data_dir
            .tablet_path(self.shard_id, self.tablet_id, self.schema_hash)
    }

    /// Whether the tablet is schedulable.
    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }

    /// Whether startup loading completed for this tablet.
    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::Acquire)
    }

    /// Attach a visible rowset to the version history.
    ///
    /// A rowset whose exact version range is already present is rejected;
    /// callers on the load path log and continue.
    pub fn add_rowset(&self, rowset: Arc<Rowset>) -> Result<(), EngineError> {
        let mut header = self.header.write();
        let version = rowset.version();
        if header.rowsets.contains_key(&version) {
            return Err(EngineError::AlreadyExists(format!(
                "rowset version [{}-{}] of tablet {}",
                version.start,
                version.end,
                self.full_name()
            )));
        }
        header.rowsets.insert(version, rowset);
        Ok(())
    }

    /// Snapshot of the visible rowsets in version order.
    pub fn visible_rowsets(&self) -> Vec<Arc<Rowset>> {
        self.header.read().rowsets.values().cloned().collect()
    }

    /// Number of visible rowsets.
    pub fn version_count(&self) -> usize {
        self.header.read().rowsets.len()
    }

    /// Greatest version currently visible.
    pub fn max_version(&self) -> Option<Version> {
        self.header.read().rowsets.keys().next_back().copied()
    }

    /// Retire every rowset whose range reaches past `version`, returning the
    /// removed handles so the caller can queue them for GC.
    pub fn recover_until_version(&self, version: u64) -> Vec<Arc<Rowset>> {
        let mut header = self.header.write();
        let retired: Vec<Version> = header
            .rowsets
            .keys()
            .filter(|v| v.end > version)
            .copied()
            .collect();
        retired
            .into_iter()
            .filter_map(|v| header.rowsets.remove(&v))
            .collect()
    }

    /// The header lock guarding rowset and version state.
    pub(crate) fn header_lock(&self) -> &RwLock<TabletHeader> {
        &self.header
    }

    /// The mutual-exclusion lock for one compaction kind.
    pub fn compaction_lock(&self, kind: CompactionKind) -> &Mutex<()> {
        match kind {
            CompactionKind::Cumulative => &self.cumulative_lock,
            CompactionKind::Base => &self.base_lock,
        }
    }

    /// Probe whether a compaction of `kind` could run right now. The guard
    /// is dropped immediately; the real guard is taken when the compaction
    /// itself starts.
    pub fn probe_compaction_lock(&self, kind: CompactionKind) -> bool {
        self.compaction_lock(kind).try_lock().is_some()
    }

    /// Try to take the real per-kind guard for a compaction run.
    pub fn try_compaction_lock(&self, kind: CompactionKind) -> Option<MutexGuard<'_, ()>> {
        self.compaction_lock(kind).try_lock()
    }

    /// Millis timestamp of the last compaction failure, `None` if clear.
    pub fn last_compaction_failure_ms(&self) -> Option<u64> {
        match self.last_compaction_failure_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Arm the failure backoff and count the failure.
    pub fn set_last_compaction_failure(&self) {
        self.last_compaction_failure_ms
            .store(unix_millis(), Ordering::Release);
        self.compaction_failure_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Clear the failure backoff after a successful compaction. The failure
    /// count keeps its lifetime total.
    pub fn clear_last_compaction_failure(&self) {
        self.last_compaction_failure_ms.store(0, Ordering::Release);
    }

    /// Compaction failures accumulated over the tablet's lifetime.
    pub fn compaction_failure_count(&self) -> u64 {
        self.compaction_failure_count.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet")
            .field("tablet_id", &self.tablet_id)
            .field("schema_hash", &self.schema_hash)
            .field("data_dir", &self.data_dir.path())
            .field("version_count", &self.version_count())
            .finish()
    }
}
