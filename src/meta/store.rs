//! Per-volume metadata store backed by redb.
//!
//! Each data directory owns one store holding its legacy headers, current
//! tablet metas, rowset metas, the conversion-finished flag, and the volume's
//! cluster-id record. Values are bincode-encoded; traversals iterate in key
//! order and stop early when the consumer breaks.

use std::{ops::ControlFlow, path::Path};

use redb::{Database, ReadableTable, TableDefinition};

use crate::{
    meta::{parse_tablet_key, rowset_key, tablet_key, TabletMeta},
    rowset::{RowsetId, RowsetMeta},
};

/// Current tablet metas, keyed by `tablet_id.schema_hash`.
const TABLET_METAS: TableDefinition<&str, &[u8]> = TableDefinition::new("tablet_metas");
/// Rowset metas, keyed by rowset id.
const ROWSET_METAS: TableDefinition<&str, &[u8]> = TableDefinition::new("rowset_metas");
/// Unconverted legacy headers, keyed by `tablet_id.schema_hash`.
const LEGACY_HEADERS: TableDefinition<&str, &[u8]> = TableDefinition::new("legacy_headers");
/// Engine state records (conversion flag, cluster id).
const ENGINE_STATE: TableDefinition<&str, i64> = TableDefinition::new("engine_state");

const CONVERSION_FINISHED_KEY: &str = "conversion_finished";
const CLUSTER_ID_KEY: &str = "cluster_id";

/// Error type for metadata store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

/// Per-volume metadata store.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the store under the volume root.
    pub fn open(volume_root: impl AsRef<Path>) -> Result<Self, MetaError> {
        let path = volume_root.as_ref().join("meta").join("engine.redb");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail.
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(TABLET_METAS)?;
            let _t = write_txn.open_table(ROWSET_METAS)?;
            let _t = write_txn.open_table(LEGACY_HEADERS)?;
            let _t = write_txn.open_table(ENGINE_STATE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn put_bytes(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), MetaError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(table)?;
            t.insert(key, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_bytes(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<Vec<u8>>, MetaError> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table)?;
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn delete_key(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<(), MetaError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(table)?;
            t.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Iterate a table in key order, feeding each entry to `f` until it
    /// breaks or the table is exhausted. A consumer break is not an error.
    fn traverse(
        &self,
        table: TableDefinition<&str, &[u8]>,
        mut f: impl FnMut(&str, &[u8]) -> ControlFlow<()>,
    ) -> Result<(), MetaError> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table)?;
        for entry in t.iter()? {
            let (key, value) = entry?;
            if let ControlFlow::Break(()) = f(key.value(), value.value()) {
                break;
            }
        }
        Ok(())
    }

    fn clear_table(&self, table: TableDefinition<&str, &[u8]>) -> Result<(), MetaError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(table)?;
            t.retain(|_, _| false)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Tablet metas ----

    /// Persist a tablet meta record.
    pub fn save_tablet_meta(&self, meta: &TabletMeta) -> Result<(), MetaError> {
        let bytes = bincode::serialize(meta)?;
        self.put_bytes(TABLET_METAS, &tablet_key(meta.tablet_id, meta.schema_hash), &bytes)
    }

    /// Load one tablet meta record.
    pub fn get_tablet_meta(
        &self,
        tablet_id: u64,
        schema_hash: u32,
    ) -> Result<Option<TabletMeta>, MetaError> {
        match self.get_bytes(TABLET_METAS, &tablet_key(tablet_id, schema_hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove one tablet meta record.
    pub fn delete_tablet_meta(&self, tablet_id: u64, schema_hash: u32) -> Result<(), MetaError> {
        self.delete_key(TABLET_METAS, &tablet_key(tablet_id, schema_hash))
    }

    /// Traverse all tablet metas in key order. Entries whose key does not
    /// parse as a tablet identity are skipped.
    pub fn traverse_tablet_metas(
        &self,
        mut f: impl FnMut(u64, u32, &[u8]) -> ControlFlow<()>,
    ) -> Result<(), MetaError> {
        self.traverse(TABLET_METAS, |key, value| match parse_tablet_key(key) {
            Some((tablet_id, schema_hash)) => f(tablet_id, schema_hash, value),
            None => ControlFlow::Continue(()),
        })
    }

    /// Drop every tablet meta record. Used to discard the partial output of
    /// an interrupted legacy conversion.
    pub fn clear_tablet_metas(&self) -> Result<(), MetaError> {
        self.clear_table(TABLET_METAS)
    }

    // ---- Rowset metas ----

    /// Persist a rowset meta record.
    pub fn save_rowset_meta(&self, meta: &RowsetMeta) -> Result<(), MetaError> {
        let bytes = bincode::serialize(meta)?;
        self.put_bytes(ROWSET_METAS, &rowset_key(meta.rowset_id), &bytes)
    }

    /// Load one rowset meta record.
    pub fn get_rowset_meta(&self, rowset_id: RowsetId) -> Result<Option<RowsetMeta>, MetaError> {
        match self.get_bytes(ROWSET_METAS, &rowset_key(rowset_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove one rowset meta record.
    pub fn delete_rowset_meta(&self, rowset_id: RowsetId) -> Result<(), MetaError> {
        self.delete_key(ROWSET_METAS, &rowset_key(rowset_id))
    }

    /// Traverse all rowset metas in id order.
    pub fn traverse_rowset_metas(
        &self,
        mut f: impl FnMut(&str, &[u8]) -> ControlFlow<()>,
    ) -> Result<(), MetaError> {
        self.traverse(ROWSET_METAS, |key, value| f(key, value))
    }

    /// Drop every rowset meta record.
    pub fn clear_rowset_metas(&self) -> Result<(), MetaError> {
        self.clear_table(ROWSET_METAS)
    }

    // ---- Legacy headers ----

    /// Persist a legacy header blob. Only written by migration tooling and
    /// tests; the engine itself just converts what it finds.
    pub fn save_legacy_header(
        &self,
        tablet_id: u64,
        schema_hash: u32,
        bytes: &[u8],
    ) -> Result<(), MetaError> {
        self.put_bytes(LEGACY_HEADERS, &tablet_key(tablet_id, schema_hash), bytes)
    }

    /// Traverse all legacy headers in key order.
    pub fn traverse_legacy_headers(
        &self,
        mut f: impl FnMut(u64, u32, &[u8]) -> ControlFlow<()>,
    ) -> Result<(), MetaError> {
        self.traverse(LEGACY_HEADERS, |key, value| match parse_tablet_key(key) {
            Some((tablet_id, schema_hash)) => f(tablet_id, schema_hash, value),
            None => ControlFlow::Continue(()),
        })
    }

    // ---- Engine state ----

    fn get_state(&self, key: &str) -> Result<Option<i64>, MetaError> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(ENGINE_STATE)?;
        Ok(t.get(key)?.map(|v| v.value()))
    }

    fn set_state(&self, key: &str, value: i64) -> Result<(), MetaError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(ENGINE_STATE)?;
            t.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Whether legacy conversion has completed on this volume.
    pub fn conversion_finished(&self) -> Result<bool, MetaError> {
        Ok(self.get_state(CONVERSION_FINISHED_KEY)?.unwrap_or(0) != 0)
    }

    /// Mark legacy conversion as completed.
    pub fn set_conversion_finished(&self) -> Result<(), MetaError> {
        self.set_state(CONVERSION_FINISHED_KEY, 1)
    }

    /// The volume's stored cluster id, `-1` when unset.
    pub fn cluster_id(&self) -> Result<i32, MetaError> {
        Ok(self.get_state(CLUSTER_ID_KEY)?.unwrap_or(-1) as i32)
    }

    /// Record the volume's cluster id.
    pub fn set_cluster_id(&self, cluster_id: i32) -> Result<(), MetaError> {
        self.set_state(CLUSTER_ID_KEY, i64::from(cluster_id))
    }
}
