//! Process-wide registry of live tablets.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    error::EngineError,
    meta::{TabletMeta, TabletSchema},
    store::DataDir,
    tablet::{CreateTabletRequest, Tablet, TabletInfo},
};

/// Registry mapping tablet identity to the live [`Tablet`] object.
///
/// Lookups share a read lock; insert and remove take the write lock. No
/// tablet-level lock is ever acquired while the registry lock is held.
#[derive(Default)]
pub struct TabletDirectory {
    tablets: RwLock<HashMap<TabletInfo, Arc<Tablet>>>,
}

impl TabletDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live tablet.
    pub fn get(&self, tablet_id: u64, schema_hash: u32) -> Option<Arc<Tablet>> {
        self.tablets
            .read()
            .get(&TabletInfo::new(tablet_id, schema_hash))
            .cloned()
    }

    /// Number of registered tablets.
    pub fn len(&self) -> usize {
        self.tablets.read().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.tablets.read().is_empty()
    }

    /// Register a tablet, failing if its identity is already present.
    pub fn register(&self, tablet: Arc<Tablet>) -> Result<(), EngineError> {
        let info = tablet.info();
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&info) {
            return Err(EngineError::AlreadyExists(format!("tablet {info}")));
        }
        tablet.data_dir().register_tablet(info);
        tablets.insert(info, tablet);
        Ok(())
    }

    /// Unregister a tablet. The on-disk state is untouched; reclamation is
    /// the GC/trash path's job.
    pub fn drop_tablet(&self, tablet_id: u64, schema_hash: u32) -> Option<Arc<Tablet>> {
        let info = TabletInfo::new(tablet_id, schema_hash);
        let removed = self.tablets.write().remove(&info);
        if let Some(tablet) = &removed {
            tablet.data_dir().deregister_tablet(&info);
            info!(tablet = %info, "dropped tablet from directory");
        }
        removed
    }

    /// Unregister every tablet that lived on a volume that went unusable.
    pub fn drop_tablets(&self, infos: &[TabletInfo]) {
        if infos.is_empty() {
            return;
        }
        let mut tablets = self.tablets.write();
        for info in infos {
            if tablets.remove(info).is_none() {
                warn!(tablet = %info, "tablet to drop was not registered");
            }
        }
        info!(count = infos.len(), "dropped tablets on unusable volume");
    }

    /// Snapshot of the tablets owned by one volume.
    pub fn tablets_on(&self, data_dir: &Arc<DataDir>) -> Vec<Arc<Tablet>> {
        self.tablets
            .read()
            .values()
            .filter(|t| Arc::ptr_eq(t.data_dir(), data_dir))
            .cloned()
            .collect()
    }

    /// Construct a tablet from a persisted meta record and register it.
    pub fn load_tablet_from_meta(
        &self,
        data_dir: &Arc<DataDir>,
        meta: TabletMeta,
    ) -> Result<Arc<Tablet>, EngineError> {
        let tablet = Tablet::from_meta(meta, data_dir.clone());
        self.register(tablet.clone())?;
        Ok(tablet)
    }

    /// Load one tablet by identity from a volume's meta store. Used by the
    /// clone/restore path after rowset files were copied under `shard_path`.
    pub fn load_one_tablet(
        &self,
        data_dir: &Arc<DataDir>,
        tablet_id: u64,
        schema_hash: u32,
    ) -> Result<Arc<Tablet>, EngineError> {
        let meta = data_dir
            .meta()
            .get_tablet_meta(tablet_id, schema_hash)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("tablet {tablet_id}.{schema_hash} meta"))
            })?;
        self.load_tablet_from_meta(data_dir, meta)
    }

    /// Create a brand-new tablet on the given volume: allocate its shard,
    /// persist the meta record, then register the live object.
    pub fn create_tablet_on(
        &self,
        request: &CreateTabletRequest,
        data_dir: &Arc<DataDir>,
    ) -> Result<Arc<Tablet>, EngineError> {
        if self.get(request.tablet_id, request.schema_hash).is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "tablet {}.{}",
                request.tablet_id, request.schema_hash
            )));
        }

        let shard_id = data_dir.get_shard()?;
        let meta = TabletMeta {
            tablet_id: request.tablet_id,
            schema_hash: request.schema_hash,
            shard_id,
            schema: TabletSchema {
                columns: request.schema.columns.clone(),
            },
        };
        data_dir.meta().save_tablet_meta(&meta)?;
        std::fs::create_dir_all(data_dir.tablet_path(
            shard_id,
            request.tablet_id,
            request.schema_hash,
        ))?;

        let tablet = Tablet::from_meta(meta, data_dir.clone());
        self.register(tablet.clone())?;
        info!(
            tablet = %tablet.info(),
            path = %data_dir.path().display(),
            "created tablet"
        );
        Ok(tablet)
    }
}
