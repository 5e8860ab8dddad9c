//! In-flight transaction bookkeeping.
//!
//! Maps `(partition_id, txn_id)` to the committed-but-unpublished rowset of
//! each participating tablet. Populated by loads at commit time and by the
//! startup reconciliation pass; drained when the control plane publishes or
//! aborts the transaction.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{rowset::Rowset, tablet::TabletInfo};

/// Key of one transaction within one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnKey {
    /// Partition the transaction writes into.
    pub partition_id: u64,
    /// Transaction id.
    pub txn_id: u64,
}

/// Registry of in-flight transactions and their pending rowsets.
#[derive(Default)]
pub struct TxnManager {
    txns: Mutex<HashMap<TxnKey, HashMap<TabletInfo, Arc<Rowset>>>>,
}

impl TxnManager {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tablet's committed rowset under a transaction.
    ///
    /// Re-registering the same `(transaction, tablet)` pair is benign: the
    /// first rowset wins and the call still succeeds, so replaying commits
    /// during crash recovery needs no special casing.
    pub fn commit_txn(
        &self,
        partition_id: u64,
        txn_id: u64,
        tablet: TabletInfo,
        rowset: Arc<Rowset>,
    ) {
        let key = TxnKey {
            partition_id,
            txn_id,
        };
        let mut txns = self.txns.lock();
        let tablets = txns.entry(key).or_default();
        if tablets.contains_key(&tablet) {
            debug!(
                txn_id,
                partition_id,
                tablet = %tablet,
                "transaction already holds a rowset for this tablet"
            );
            return;
        }
        tablets.insert(tablet, rowset);
    }

    /// The tablets (and their pending rowsets) touched by a transaction.
    pub fn related_tablets(
        &self,
        partition_id: u64,
        txn_id: u64,
    ) -> Vec<(TabletInfo, Arc<Rowset>)> {
        let key = TxnKey {
            partition_id,
            txn_id,
        };
        self.txns
            .lock()
            .get(&key)
            .map(|tablets| tablets.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default()
    }

    /// Remove one tablet's pending rowset from a transaction, dropping the
    /// transaction record once its last tablet is gone.
    pub fn delete_txn(&self, partition_id: u64, txn_id: u64, tablet: &TabletInfo) {
        let key = TxnKey {
            partition_id,
            txn_id,
        };
        let mut txns = self.txns.lock();
        if let Some(tablets) = txns.get_mut(&key) {
            tablets.remove(tablet);
            if tablets.is_empty() {
                txns.remove(&key);
                info!(txn_id, partition_id, "transaction cleared");
            }
        }
    }

    /// Number of tracked transactions.
    pub fn len(&self) -> usize {
        self.txns.lock().len()
    }

    /// Whether no transaction is tracked.
    pub fn is_empty(&self) -> bool {
        self.txns.lock().is_empty()
    }
}
