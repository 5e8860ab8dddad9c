//! Rowsets: immutable, versioned chunks of tablet data.
//!
//! Only the metadata and lifecycle side lives here; the physical segment
//! encoding is produced behind the [`RowsetBuilder`] contract by an external
//! writer.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::{Generator, Ulid};

use crate::{error::EngineError, store::DataDir};

/// Globally unique identifier of one rowset.
pub type RowsetId = Ulid;

/// Thread-safe rowset id generator scoped to a single engine instance.
pub struct RowsetIdGenerator {
    inner: Mutex<Generator>,
}

impl RowsetIdGenerator {
    /// Create a new generator seeded with the current time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Produce the next [`RowsetId`] in a monotonic, time-ordered sequence.
    pub fn generate(&self) -> RowsetId {
        let mut guard = self
            .inner
            .lock()
            .expect("rowset id generator mutex should not be poisoned");
        guard
            .generate()
            .expect("rowset id generator should advance without error")
    }
}

impl Default for RowsetIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Inclusive version range covered by a rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// First version in the range.
    pub start: u64,
    /// Last version in the range.
    pub end: u64,
}

impl Version {
    /// A range covering `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        Version { start, end }
    }
}

/// Lifecycle state of a rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsetState {
    /// Under construction by a writer.
    Prepared,
    /// Written for an in-flight transaction, not yet queryable.
    Committed,
    /// Part of the tablet's queryable version history.
    Visible,
}

/// Persisted description of one rowset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsetMeta {
    /// Globally unique rowset id.
    pub rowset_id: RowsetId,
    /// Owning tablet.
    pub tablet_id: u64,
    /// Schema hash of the owning tablet.
    pub schema_hash: u32,
    /// Version range this rowset covers.
    pub version: Version,
    /// Lifecycle state.
    pub state: RowsetState,
    /// Transaction that produced the rowset, for `Committed` entries.
    pub txn_id: Option<u64>,
    /// Partition of that transaction.
    pub partition_id: Option<u64>,
    /// Load that produced the rowset.
    pub load_id: Option<u64>,
}

/// A shared handle to one rowset on one volume.
///
/// Lifetime is governed by its holders: the owning tablet's version map,
/// in-flight transactions, and the GC registry. The GC sweep reclaims the
/// on-disk artifact only once it is the sole remaining holder.
pub struct Rowset {
    meta: RowsetMeta,
    data_dir: Arc<DataDir>,
}

impl Rowset {
    /// Bind a meta record to the volume holding its data.
    pub fn new(meta: RowsetMeta, data_dir: Arc<DataDir>) -> Self {
        Rowset { meta, data_dir }
    }

    /// Rowset id.
    pub fn rowset_id(&self) -> RowsetId {
        self.meta.rowset_id
    }

    /// Persisted meta record.
    pub fn meta(&self) -> &RowsetMeta {
        &self.meta
    }

    /// Version range covered by this rowset.
    pub fn version(&self) -> Version {
        self.meta.version
    }

    /// Volume holding the rowset's data.
    pub fn data_dir(&self) -> &Arc<DataDir> {
        &self.data_dir
    }

    /// Whether any holder besides `registry_ref` still references the rowset.
    pub fn in_use(this: &Arc<Self>) -> bool {
        Arc::strong_count(this) > 1
    }

    /// Drop the rowset's persisted meta record. File reclamation of its
    /// segments goes through the trash path, so a crash here loses nothing.
    pub fn remove(&self) {
        if let Err(e) = self.data_dir.meta().delete_rowset_meta(self.meta.rowset_id) {
            warn!(
                rowset_id = %self.meta.rowset_id,
                path = %self.data_dir.path().display(),
                "failed to remove rowset meta: {e}"
            );
        }
    }
}

impl std::fmt::Debug for Rowset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rowset")
            .field("meta", &self.meta)
            .field("data_dir", &self.data_dir.path())
            .finish()
    }
}

/// Producer contract for writing a new rowset.
///
/// Implemented by the physical segment writer, which is out of scope for the
/// engine core. The engine only drives the protocol: `init`, any number of
/// `add_row`/`flush` calls, then `build`.
pub trait RowsetBuilder {
    /// Bind the builder to its output rowset.
    fn init(&mut self, context: RowsetBuilderContext) -> Result<(), EngineError>;

    /// Append one encoded row.
    fn add_row(&mut self, row: &[u8]) -> Result<(), EngineError>;

    /// Force buffered rows to stable storage.
    fn flush(&mut self) -> Result<(), EngineError>;

    /// Finish writing and hand back the completed rowset.
    fn build(&mut self) -> Result<Arc<Rowset>, EngineError>;

    /// Bytes of working memory currently pinned by the builder.
    fn mem_pool_bytes(&self) -> usize;
}

/// Everything a [`RowsetBuilder`] needs to place its output.
#[derive(Debug, Clone)]
pub struct RowsetBuilderContext {
    /// Id assigned to the rowset under construction.
    pub rowset_id: RowsetId,
    /// Owning tablet.
    pub tablet_id: u64,
    /// Schema hash of the owning tablet.
    pub schema_hash: u32,
    /// Version range the rowset will cover.
    pub version: Version,
    /// Directory the segment files are written under.
    pub rowset_path: std::path::PathBuf,
}
