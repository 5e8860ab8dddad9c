//! Persisted tablet metadata and the legacy-format migration.

pub mod store;

use serde::{Deserialize, Serialize};

use crate::rowset::{RowsetId, RowsetIdGenerator, RowsetMeta, RowsetState, Version};

/// One column of a tablet schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Whether the column participates in the sort key.
    pub is_key: bool,
}

/// Logical schema of a tablet. Schema design is outside the engine core;
/// this record only round-trips through create/convert/load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSchema {
    /// Ordered column set.
    pub columns: Vec<ColumnSpec>,
}

/// Persisted description of one tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMeta {
    /// Tablet id.
    pub tablet_id: u64,
    /// Schema hash disambiguating concurrent schema versions.
    pub schema_hash: u32,
    /// Shard subdirectory the tablet lives under on its volume.
    pub shard_id: u64,
    /// Logical schema.
    pub schema: TabletSchema,
}

/// A delta of the legacy on-disk format that is already queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyDelta {
    /// Version range the delta covers.
    pub version: Version,
}

/// A legacy delta still waiting on its transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyPendingDelta {
    /// Transaction that wrote the delta.
    pub txn_id: u64,
    /// Partition of that transaction.
    pub partition_id: u64,
    /// Load id, if the delta came from a bulk load.
    pub load_id: Option<u64>,
}

/// Header blob of the legacy metadata format, one per tablet.
///
/// Present only on volumes created before the current tablet/rowset meta
/// layout; converted once at startup and then left in place for the GC path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyHeader {
    /// Tablet id.
    pub tablet_id: u64,
    /// Schema hash.
    pub schema_hash: u32,
    /// Shard subdirectory on the volume.
    pub shard_id: u64,
    /// Logical schema.
    pub schema: TabletSchema,
    /// Queryable deltas, to become `Visible` rowsets.
    pub visible_deltas: Vec<LegacyDelta>,
    /// In-flight deltas, to become `Committed` rowsets.
    pub pending_deltas: Vec<LegacyPendingDelta>,
}

impl LegacyHeader {
    /// Translate a legacy header into the current format: one tablet meta
    /// plus a rowset meta per delta, each assigned a fresh rowset id.
    ///
    /// The caller must persist the rowset metas before the tablet meta so a
    /// reader that sees the tablet can resolve every rowset it references.
    pub fn convert(&self, ids: &RowsetIdGenerator) -> (TabletMeta, Vec<RowsetMeta>) {
        let tablet_meta = TabletMeta {
            tablet_id: self.tablet_id,
            schema_hash: self.schema_hash,
            shard_id: self.shard_id,
            schema: self.schema.clone(),
        };

        let mut rowsets = Vec::with_capacity(self.visible_deltas.len() + self.pending_deltas.len());
        for delta in &self.visible_deltas {
            rowsets.push(RowsetMeta {
                rowset_id: ids.generate(),
                tablet_id: self.tablet_id,
                schema_hash: self.schema_hash,
                version: delta.version,
                state: RowsetState::Visible,
                txn_id: None,
                partition_id: None,
                load_id: None,
            });
        }
        // Pending deltas never carry a version yet; the version is assigned
        // when the transaction publishes. They keep a placeholder range.
        for delta in &self.pending_deltas {
            rowsets.push(RowsetMeta {
                rowset_id: ids.generate(),
                tablet_id: self.tablet_id,
                schema_hash: self.schema_hash,
                version: Version::new(0, 0),
                state: RowsetState::Committed,
                txn_id: Some(delta.txn_id),
                partition_id: Some(delta.partition_id),
                load_id: delta.load_id,
            });
        }

        (tablet_meta, rowsets)
    }
}

/// Key of one tablet inside a volume's meta store.
pub(crate) fn tablet_key(tablet_id: u64, schema_hash: u32) -> String {
    // Zero-padded so lexicographic table order matches numeric order.
    format!("{tablet_id:020}.{schema_hash:010}")
}

/// Inverse of [`tablet_key`].
pub(crate) fn parse_tablet_key(key: &str) -> Option<(u64, u32)> {
    let (tablet_id, schema_hash) = key.split_once('.')?;
    Some((tablet_id.parse().ok()?, schema_hash.parse().ok()?))
}

/// Key of one rowset inside a volume's meta store.
pub(crate) fn rowset_key(rowset_id: RowsetId) -> String {
    rowset_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> LegacyHeader {
        LegacyHeader {
            tablet_id: 42,
            schema_hash: 7,
            shard_id: 0,
            schema: TabletSchema::default(),
            visible_deltas: vec![
                LegacyDelta {
                    version: Version::new(0, 5),
                },
                LegacyDelta {
                    version: Version::new(6, 6),
                },
            ],
            pending_deltas: vec![LegacyPendingDelta {
                txn_id: 1001,
                partition_id: 3,
                load_id: None,
            }],
        }
    }

    #[test]
    fn convert_produces_visible_and_committed_rowsets() {
        let ids = RowsetIdGenerator::new();
        let (tablet_meta, rowsets) = header().convert(&ids);

        assert_eq!(tablet_meta.tablet_id, 42);
        assert_eq!(rowsets.len(), 3);
        assert_eq!(
            rowsets
                .iter()
                .filter(|m| m.state == RowsetState::Visible)
                .count(),
            2
        );
        let pending: Vec<_> = rowsets
            .iter()
            .filter(|m| m.state == RowsetState::Committed)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].txn_id, Some(1001));
        assert_eq!(pending[0].partition_id, Some(3));
    }

    #[test]
    fn tablet_key_round_trips() {
        let key = tablet_key(15007, 368169781);
        assert_eq!(parse_tablet_key(&key), Some((15007, 368169781)));
    }

    #[test]
    fn tablet_keys_order_numerically() {
        assert!(tablet_key(9, 1) < tablet_key(10, 1));
        assert!(tablet_key(10, 1) < tablet_key(10, 2));
    }
}
