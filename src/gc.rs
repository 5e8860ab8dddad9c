//! Garbage collection of retired on-disk artifacts.
//!
//! Compactions and schema changes retire index artifacts and rowsets that
//! readers may still hold. Retired artifacts are parked here and reclaimed
//! by periodic sweeps once they report themselves unreferenced. The registry
//! lock is independent of every tablet lock, so a sweep never contends with
//! query or compaction paths.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::rowset::{Rowset, RowsetId};

/// A retired index artifact awaiting reclamation.
///
/// Implemented by the segment-index side, which is outside the engine core.
/// The artifact knows its constituent files and whether any reader still
/// holds it.
pub trait IndexArtifact: Send + Sync {
    /// Stable identity of the artifact.
    fn artifact_id(&self) -> u64;

    /// Number of segments the artifact spans.
    fn segment_count(&self) -> usize;

    /// Path of one segment's index file.
    fn index_file_path(&self, segment: usize) -> PathBuf;

    /// Path of one segment's data file.
    fn data_file_path(&self, segment: usize) -> PathBuf;

    /// Whether a reader still references the artifact.
    fn is_in_use(&self) -> bool;
}

struct GcInner {
    /// Retired index artifacts and the file paths recorded at retirement.
    indexes: HashMap<u64, (Arc<dyn IndexArtifact>, Vec<PathBuf>)>,
    /// Retired rowsets by id.
    rowsets: HashMap<RowsetId, Arc<Rowset>>,
}

/// Registries of retired artifacts, guarded by one dedicated lock.
pub struct GarbageCollector {
    inner: Mutex<GcInner>,
}

impl GarbageCollector {
    /// Empty registries.
    pub fn new() -> Self {
        GarbageCollector {
            inner: Mutex::new(GcInner {
                indexes: HashMap::new(),
                rowsets: HashMap::new(),
            }),
        }
    }

    /// Track a retired index artifact. The file list is captured now, so a
    /// later sweep deletes exactly what existed at retirement. Re-adding a
    /// tracked artifact is a no-op.
    pub fn add_unused_index(&self, artifact: Arc<dyn IndexArtifact>) {
        let mut inner = self.inner.lock();
        let id = artifact.artifact_id();
        if inner.indexes.contains_key(&id) {
            return;
        }
        let mut files = Vec::with_capacity(artifact.segment_count() * 2);
        for segment in 0..artifact.segment_count() {
            files.push(artifact.index_file_path(segment));
            files.push(artifact.data_file_path(segment));
        }
        inner.indexes.insert(id, (artifact, files));
    }

    /// Reclaim every tracked index artifact that is no longer referenced.
    /// Artifacts still in use stay tracked for the next sweep.
    pub fn sweep_unused_index(&self) {
        let mut inner = self.inner.lock();
        inner.indexes.retain(|id, (artifact, files)| {
            if artifact.is_in_use() {
                return true;
            }
            for file in files.iter() {
                if let Err(e) = std::fs::remove_file(file) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %file.display(), "failed to remove retired index file: {e}");
                    }
                }
            }
            info!(artifact_id = id, files = files.len(), "reclaimed retired index artifact");
            false
        });
    }

    /// Track a retired rowset. Re-adding a tracked rowset is a no-op.
    pub fn add_unused_rowset(&self, rowset: Arc<Rowset>) {
        let mut inner = self.inner.lock();
        inner.rowsets.entry(rowset.rowset_id()).or_insert(rowset);
    }

    /// Reclaim every tracked rowset no holder references anymore, through
    /// the rowset's own removal operation.
    pub fn sweep_unused_rowset(&self) {
        let mut inner = self.inner.lock();
        inner.rowsets.retain(|id, rowset| {
            if Rowset::in_use(rowset) {
                return true;
            }
            rowset.remove();
            info!(rowset_id = %id, "reclaimed retired rowset");
            false
        });
    }

    /// Number of tracked index artifacts.
    pub fn tracked_indexes(&self) -> usize {
        self.inner.lock().indexes.len()
    }

    /// Number of tracked rowsets.
    pub fn tracked_rowsets(&self) -> usize {
        self.inner.lock().rowsets.len()
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{
        rowset::{RowsetIdGenerator, Version},
        tablet::tests::{test_data_dir, test_tablet, visible_rowset},
    };

    struct FakeArtifact {
        id: u64,
        dir: PathBuf,
        segments: usize,
        in_use: AtomicBool,
    }

    impl FakeArtifact {
        fn new(id: u64, dir: PathBuf, segments: usize, in_use: bool) -> Arc<Self> {
            let artifact = Arc::new(FakeArtifact {
                id,
                dir,
                segments,
                in_use: AtomicBool::new(in_use),
            });
            for segment in 0..segments {
                std::fs::write(artifact.index_file_path(segment), b"idx").unwrap();
                std::fs::write(artifact.data_file_path(segment), b"dat").unwrap();
            }
            artifact
        }
    }

    impl IndexArtifact for FakeArtifact {
        fn artifact_id(&self) -> u64 {
            self.id
        }

        fn segment_count(&self) -> usize {
            self.segments
        }

        fn index_file_path(&self, segment: usize) -> PathBuf {
            self.dir.join(format!("{}_{segment}.idx", self.id))
        }

        fn data_file_path(&self, segment: usize) -> PathBuf {
            self.dir.join(format!("{}_{segment}.dat", self.id))
        }

        fn is_in_use(&self) -> bool {
            self.in_use.load(Ordering::Acquire)
        }
    }

    #[test]
    fn sweep_spares_in_use_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let gc = GarbageCollector::new();
        let artifact = FakeArtifact::new(1, dir.path().to_path_buf(), 2, true);

        gc.add_unused_index(artifact.clone());
        gc.sweep_unused_index();
        assert_eq!(gc.tracked_indexes(), 1);
        assert!(artifact.index_file_path(0).exists());

        artifact.in_use.store(false, Ordering::Release);
        gc.sweep_unused_index();
        assert_eq!(gc.tracked_indexes(), 0);
        for segment in 0..2 {
            assert!(!artifact.index_file_path(segment).exists());
            assert!(!artifact.data_file_path(segment).exists());
        }
    }

    #[test]
    fn re_adding_an_artifact_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let gc = GarbageCollector::new();
        let artifact = FakeArtifact::new(1, dir.path().to_path_buf(), 1, true);

        gc.add_unused_index(artifact.clone());
        gc.add_unused_index(artifact);
        assert_eq!(gc.tracked_indexes(), 1);
    }

    #[test]
    fn rowset_sweep_waits_for_last_holder() {
        let (_dir, data_dir) = test_data_dir();
        let tablet = test_tablet(1, data_dir.clone());
        let ids = RowsetIdGenerator::new();
        let gc = GarbageCollector::new();

        let rowset = visible_rowset(&ids, &tablet, Version::new(0, 1));
        data_dir.meta().save_rowset_meta(rowset.meta()).unwrap();
        let rowset_id = rowset.rowset_id();

        gc.add_unused_rowset(rowset.clone());
        gc.sweep_unused_rowset();
        // The local handle still references the rowset.
        assert_eq!(gc.tracked_rowsets(), 1);

        drop(rowset);
        gc.sweep_unused_rowset();
        assert_eq!(gc.tracked_rowsets(), 0);
        assert!(data_dir.meta().get_rowset_meta(rowset_id).unwrap().is_none());
    }
}
