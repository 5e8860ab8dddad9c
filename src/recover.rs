//! Startup loading: legacy conversion, meta replay and reconciliation.
//!
//! Each volume is loaded independently. Loading first finishes any pending
//! legacy-format conversion, then replays the volume's tablet and rowset
//! metas into the live directory, transaction registry and GC registry.

use std::{ops::ControlFlow, sync::Arc};

use tracing::{error, info, warn};

use crate::{
    error::EngineError,
    gc::GarbageCollector,
    meta::{LegacyHeader, TabletMeta},
    rowset::{Rowset, RowsetIdGenerator, RowsetMeta, RowsetState},
    store::DataDir,
    tablet::{directory::TabletDirectory, TabletInfo},
    txn::TxnManager,
};

/// Shared sinks the load path populates.
pub(crate) struct LoadContext<'a> {
    pub directory: &'a TabletDirectory,
    pub txn_manager: &'a TxnManager,
    pub gc: &'a GarbageCollector,
    pub rowset_ids: &'a RowsetIdGenerator,
}

/// Convert every legacy header on the volume into current-format metas.
///
/// Idempotent across crashes: until the conversion-finished flag is set, any
/// tablet or rowset meta on the volume is partial output of an interrupted
/// earlier conversion and is discarded before converting again. Rowset metas
/// are persisted before their tablet meta so a reader that sees the tablet
/// can resolve every rowset it references. Converted headers stay in place;
/// the file-level GC uses them to recognize legacy leftovers.
pub(crate) fn convert_legacy_metas(
    data_dir: &DataDir,
    rowset_ids: &RowsetIdGenerator,
) -> Result<(), EngineError> {
    let meta = data_dir.meta();
    if meta.conversion_finished()? {
        return Ok(());
    }

    meta.clear_tablet_metas()?;
    meta.clear_rowset_metas()?;

    let mut headers: Vec<LegacyHeader> = Vec::new();
    let mut parse_failure: Option<String> = None;
    meta.traverse_legacy_headers(|tablet_id, schema_hash, bytes| {
        match bincode::deserialize::<LegacyHeader>(bytes) {
            Ok(header) => {
                headers.push(header);
                ControlFlow::Continue(())
            }
            Err(e) => {
                // An unreadable header means unknown data would be lost;
                // abort this volume rather than silently dropping a tablet.
                parse_failure = Some(format!(
                    "legacy header of tablet {tablet_id}.{schema_hash}: {e}"
                ));
                ControlFlow::Break(())
            }
        }
    })?;
    if let Some(detail) = parse_failure {
        return Err(EngineError::Parse(detail));
    }

    let converted = headers.len();
    for header in headers {
        let (tablet_meta, rowset_metas) = header.convert(rowset_ids);
        for rowset_meta in &rowset_metas {
            meta.save_rowset_meta(rowset_meta)?;
        }
        meta.save_tablet_meta(&tablet_meta)?;
    }

    meta.set_conversion_finished()?;
    if converted > 0 {
        info!(
            path = %data_dir.path().display(),
            tablets = converted,
            "converted legacy tablet headers"
        );
    }
    Ok(())
}

/// Load one volume: finish conversion, replay metas, reconcile rowsets.
/// Any failure is wrapped with the volume's path so the error names which
/// volume it took down.
pub(crate) fn load_data_dir(
    data_dir: &Arc<DataDir>,
    ctx: &LoadContext<'_>,
) -> Result<(), EngineError> {
    load_volume(data_dir, ctx).map_err(|e| EngineError::VolumeLoad {
        path: data_dir.path().to_path_buf(),
        source: Box::new(e),
    })
}

fn load_volume(data_dir: &Arc<DataDir>, ctx: &LoadContext<'_>) -> Result<(), EngineError> {
    convert_legacy_metas(data_dir, ctx.rowset_ids)?;

    // Collect rowset metas first so tablets can be fully populated as soon
    // as they register. A record that fails to decode is skipped; its files
    // fall to the GC path.
    let mut rowset_metas: Vec<RowsetMeta> = Vec::new();
    data_dir.meta().traverse_rowset_metas(|key, bytes| {
        match bincode::deserialize::<RowsetMeta>(bytes) {
            Ok(meta) => rowset_metas.push(meta),
            Err(e) => warn!(
                path = %data_dir.path().display(),
                key,
                "skipping undecodable rowset meta: {e}"
            ),
        }
        ControlFlow::Continue(())
    })?;

    let mut tablet_metas: Vec<TabletMeta> = Vec::new();
    data_dir.meta().traverse_tablet_metas(|tablet_id, schema_hash, bytes| {
        match bincode::deserialize::<TabletMeta>(bytes) {
            Ok(meta) => tablet_metas.push(meta),
            Err(e) => warn!(
                path = %data_dir.path().display(),
                tablet = %TabletInfo::new(tablet_id, schema_hash),
                "skipping undecodable tablet meta: {e}"
            ),
        }
        ControlFlow::Continue(())
    })?;

    let mut loaded = 0usize;
    for meta in tablet_metas {
        let info = TabletInfo::new(meta.tablet_id, meta.schema_hash);
        match ctx.directory.load_tablet_from_meta(data_dir, meta) {
            Ok(_) => loaded += 1,
            Err(e) => warn!(
                path = %data_dir.path().display(),
                tablet = %info,
                "failed to load tablet, skipping: {e}"
            ),
        }
    }

    for meta in rowset_metas {
        reconcile_rowset(data_dir, ctx, meta);
    }

    info!(
        path = %data_dir.path().display(),
        tablets = loaded,
        "loaded volume"
    );
    Ok(())
}

/// Route one persisted rowset into the live structures.
fn reconcile_rowset(data_dir: &Arc<DataDir>, ctx: &LoadContext<'_>, meta: RowsetMeta) {
    let info = TabletInfo::new(meta.tablet_id, meta.schema_hash);
    let Some(tablet) = ctx.directory.get(info.tablet_id, info.schema_hash) else {
        // The owning tablet is gone (dropped, or its meta was unreadable).
        // Keep the rowset tracked so its meta and files are reclaimed.
        warn!(
            rowset_id = %meta.rowset_id,
            tablet = %info,
            "rowset references a missing tablet, queueing for reclamation"
        );
        ctx.gc
            .add_unused_rowset(Arc::new(Rowset::new(meta, data_dir.clone())));
        return;
    };

    match meta.state {
        RowsetState::Committed => {
            let (Some(partition_id), Some(txn_id)) = (meta.partition_id, meta.txn_id) else {
                warn!(
                    rowset_id = %meta.rowset_id,
                    tablet = %info,
                    "committed rowset lacks its transaction identity, queueing for reclamation"
                );
                ctx.gc
                    .add_unused_rowset(Arc::new(Rowset::new(meta, data_dir.clone())));
                return;
            };
            let rowset = Arc::new(Rowset::new(meta, data_dir.clone()));
            ctx.txn_manager.commit_txn(partition_id, txn_id, info, rowset);
        }
        RowsetState::Visible => {
            let rowset = Arc::new(Rowset::new(meta, data_dir.clone()));
            if let Err(e) = tablet.add_rowset(rowset) {
                warn!(tablet = %info, "skipping duplicate visible rowset: {e}");
            }
        }
        RowsetState::Prepared => {
            // A prepared rowset's write never reached commit; its meta stays
            // persisted and its files fall to the trash path.
            warn!(
                rowset_id = %meta.rowset_id,
                tablet = %info,
                "skipping prepared rowset left over from an interrupted write"
            );
        }
    }
}

/// Load every volume in parallel, one OS thread per volume.
///
/// A volume that fails to load is marked unusable and the rest proceed; open
/// only fails later if no usable volume remains.
pub(crate) fn load_data_dirs(data_dirs: &[Arc<DataDir>], ctx: &LoadContext<'_>) {
    std::thread::scope(|scope| {
        for data_dir in data_dirs {
            scope.spawn(move || {
                if let Err(e) = load_data_dir(data_dir, ctx) {
                    error!("marking volume unusable: {e}");
                    data_dir.set_is_used(false);
                }
            });
        }
    });
}
