//! The storage engine: open/close lifecycle, volume health, and the public
//! operation surface the control plane drives.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    cache::LruCache,
    compaction::{
        CompactionPolicy, CompactionRunner, CompactionScheduler, DisabledCompaction,
        VersionCountPolicy,
    },
    error::EngineError,
    gc::GarbageCollector,
    option::EngineOptions,
    recover::{self, LoadContext},
    rowset::RowsetIdGenerator,
    store::{DataDir, DataDirInfo, DiskSpace, StorageMedium, UnboundedDiskSpace},
    sweep,
    tablet::{directory::TabletDirectory, CompactionKind, CreateTabletRequest, Tablet},
    task::{self, EngineTask},
    txn::TxnManager,
};

/// Shared cache of decoded segment-index payloads, keyed by file path.
pub type IndexCache = LruCache<PathBuf, Arc<[u8]>>;

struct EngineCore {
    options: EngineOptions,
    data_dirs: Vec<Arc<DataDir>>,
    directory: Arc<TabletDirectory>,
    txn_manager: TxnManager,
    gc: GarbageCollector,
    rowset_ids: RowsetIdGenerator,
    index_cache: IndexCache,
    disk_space: Arc<dyn DiskSpace>,
    scheduler: CompactionScheduler,
    effective_cluster_id: AtomicI32,
    exhaustion_reported: AtomicBool,
    /// Raised when tablets were dropped, asking the embedder for a full
    /// re-report. One flag per report kind; each is cleared on observation.
    report_disk_pending: AtomicBool,
    report_tablet_pending: AtomicBool,
    fatal_tx: flume::Sender<EngineError>,
    fatal_rx: flume::Receiver<EngineError>,
}

impl EngineCore {
    fn usable_stores(&self) -> Vec<Arc<DataDir>> {
        self.data_dirs.iter().filter(|d| d.is_used()).cloned().collect()
    }

    /// Pick the volume for new data: usable, medium-matching when the node
    /// actually has more than one medium, greatest available space.
    fn pick_store(&self, medium: StorageMedium) -> Result<Arc<DataDir>, EngineError> {
        let usable = self.usable_stores();
        let media: HashSet<StorageMedium> =
            usable.iter().map(|d| d.storage_medium()).collect();

        let candidates: Vec<Arc<DataDir>> = if media.len() > 1 {
            usable
                .into_iter()
                .filter(|d| d.storage_medium() == medium)
                .collect()
        } else {
            if !usable.is_empty() && !media.contains(&medium) {
                info!(
                    requested = ?medium,
                    "node has a single storage medium, ignoring the requested one"
                );
            }
            usable
        };

        candidates
            .into_iter()
            .max_by_key(|d| d.available_bytes())
            .ok_or(EngineError::NoAvailableVolume(medium))
    }

    /// One health/space pass over every volume. Volumes that fail the probe
    /// go unusable and take their tablets out of the directory. Past the
    /// configured unusable fraction the engine reports itself dead, once.
    fn disk_monitor_pass(&self) -> Result<(), EngineError> {
        for data_dir in &self.data_dirs {
            if !data_dir.is_used() {
                continue;
            }
            if !data_dir.health_check() {
                self.drop_store_tablets(data_dir);
                continue;
            }
            match self.disk_space.available_bytes(data_dir.path()) {
                Ok(bytes) => data_dir.set_available_bytes(bytes),
                Err(e) => warn!(
                    path = %data_dir.path().display(),
                    "failed to probe available space: {e}"
                ),
            }
        }

        let total = self.data_dirs.len();
        let unused = self.data_dirs.iter().filter(|d| !d.is_used()).count();
        if total > 0 && unused as f64 / total as f64 >= self.options.error_disk_fraction {
            if !self.exhaustion_reported.swap(true, Ordering::AcqRel) {
                error!(unused, total, "too many volumes are unusable, engine cannot continue");
                let _ = self.fatal_tx.send(EngineError::DiskExhaustion { unused, total });
            }
            return Err(EngineError::DiskExhaustion { unused, total });
        }
        Ok(())
    }

    /// Unregister a dead volume's tablets and raise the re-report flags so
    /// the control plane learns about the loss promptly.
    fn drop_store_tablets(&self, data_dir: &Arc<DataDir>) {
        let infos = data_dir.clear_tablets();
        if !infos.is_empty() {
            self.directory.drop_tablets(&infos);
            self.report_disk_pending.store(true, Ordering::Release);
            self.report_tablet_pending.store(true, Ordering::Release);
        }
    }

    fn trash_sweep_pass(&self) -> f64 {
        sweep::sweep_trash_and_snapshots(
            &self.data_dirs,
            self.options.snapshot_expire,
            self.options.trash_expire,
            self.options.trash_guard_fraction,
        )
    }
}

/// The storage engine. Owns every volume and tablet on this node and the
/// background threads that keep them healthy; dropping it (or calling
/// [`Engine::close`]) stops those threads.
pub struct Engine {
    core: Arc<EngineCore>,
    shutdown: Option<flume::Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Open the engine with no space probe and no compaction body wired in.
    pub fn open(options: EngineOptions) -> Result<Self, EngineError> {
        Self::open_with(
            options,
            Arc::new(UnboundedDiskSpace),
            Arc::new(VersionCountPolicy::default()),
            Arc::new(DisabledCompaction),
        )
    }

    /// Open the engine with explicit collaborators.
    pub fn open_with(
        options: EngineOptions,
        disk_space: Arc<dyn DiskSpace>,
        compaction_policy: Arc<dyn CompactionPolicy>,
        compaction_runner: Arc<dyn CompactionRunner>,
    ) -> Result<Self, EngineError> {
        if options.store_paths.is_empty() {
            return Err(EngineError::Config("no store path configured".into()));
        }
        if options.index_cache_capacity == 0 {
            return Err(EngineError::InitFailed(
                "index cache capacity must be nonzero".into(),
            ));
        }

        let mut data_dirs = Vec::with_capacity(options.store_paths.len());
        for store_path in &options.store_paths {
            match DataDir::init(store_path) {
                Ok(data_dir) => data_dirs.push(Arc::new(data_dir)),
                Err(e) => warn!(
                    path = %store_path.path.display(),
                    "failed to initialize volume, skipping: {e}"
                ),
            }
        }
        if data_dirs.is_empty() {
            return Err(EngineError::InitFailed("no usable volume".into()));
        }

        let effective_cluster_id = reconcile_cluster_ids(&data_dirs, options.cluster_id)?;

        let directory = Arc::new(TabletDirectory::new());
        let txn_manager = TxnManager::new();
        let gc = GarbageCollector::new();
        let rowset_ids = RowsetIdGenerator::new();

        let ctx = LoadContext {
            directory: &directory,
            txn_manager: &txn_manager,
            gc: &gc,
            rowset_ids: &rowset_ids,
        };
        recover::load_data_dirs(&data_dirs, &ctx);
        if !data_dirs.iter().any(|d| d.is_used()) {
            return Err(EngineError::InitFailed("every volume failed to load".into()));
        }

        let scheduler = CompactionScheduler::new(
            directory.clone(),
            compaction_policy,
            compaction_runner,
            options.compaction_failure_backoff,
        );
        let index_cache = IndexCache::new(options.index_cache_capacity);
        let (fatal_tx, fatal_rx) = flume::unbounded();

        let core = Arc::new(EngineCore {
            options,
            data_dirs,
            directory,
            txn_manager,
            gc,
            rowset_ids,
            index_cache,
            disk_space,
            scheduler,
            effective_cluster_id: AtomicI32::new(effective_cluster_id),
            exhaustion_reported: AtomicBool::new(false),
            report_disk_pending: AtomicBool::new(false),
            report_tablet_pending: AtomicBool::new(false),
            fatal_tx,
            fatal_rx,
        });

        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(0);
        let mut threads = Vec::new();

        {
            let core = core.clone();
            threads.push(spawn_loop(
                "lithos-disk-monitor",
                core.options.disk_monitor_interval,
                shutdown_rx.clone(),
                move || {
                    let _ = core.disk_monitor_pass();
                },
            )?);
        }
        for kind in [CompactionKind::Cumulative, CompactionKind::Base] {
            let core = core.clone();
            threads.push(spawn_loop(
                match kind {
                    CompactionKind::Cumulative => "lithos-cumulative-compaction",
                    CompactionKind::Base => "lithos-base-compaction",
                },
                core.options.compaction_check_interval,
                shutdown_rx.clone(),
                move || {
                    for store in core.usable_stores() {
                        core.scheduler.perform_compaction(kind, &store);
                    }
                },
            )?);
        }
        {
            let core = core.clone();
            threads.push(spawn_loop(
                "lithos-gc",
                core.options.gc_interval,
                shutdown_rx.clone(),
                move || {
                    core.gc.sweep_unused_index();
                    core.gc.sweep_unused_rowset();
                },
            )?);
        }
        {
            let core = core.clone();
            threads.push(spawn_loop(
                "lithos-trash-sweep",
                core.options.trash_sweep_interval,
                shutdown_rx.clone(),
                move || {
                    core.trash_sweep_pass();
                },
            )?);
        }
        {
            let core = core.clone();
            threads.push(spawn_loop(
                "lithos-cache-prune",
                core.options.gc_interval,
                shutdown_rx,
                move || {
                    let pruned = core.index_cache.prune();
                    if pruned > 0 {
                        info!(pruned, "pruned index cache");
                    }
                },
            )?);
        }

        info!(
            volumes = core.data_dirs.len(),
            tablets = core.directory.len(),
            cluster_id = effective_cluster_id,
            "storage engine opened"
        );
        Ok(Engine {
            core,
            shutdown: Some(shutdown_tx),
            threads,
        })
    }

    // ---- Cluster identity ----

    /// The node's cluster id, `-1` while unassigned.
    pub fn effective_cluster_id(&self) -> i32 {
        self.core.effective_cluster_id.load(Ordering::Acquire)
    }

    /// Adopt a cluster id handed down by the control plane and persist it to
    /// every volume. Changing an already-set id is a conflict.
    pub fn set_cluster_id(&self, cluster_id: i32) -> Result<(), EngineError> {
        let current = self.effective_cluster_id();
        if current != -1 && current != cluster_id {
            return Err(EngineError::ClusterIdConflict {
                left: current,
                right: cluster_id,
            });
        }
        for data_dir in &self.core.data_dirs {
            data_dir.set_cluster_id(cluster_id)?;
        }
        self.core
            .effective_cluster_id
            .store(cluster_id, Ordering::Release);
        Ok(())
    }

    // ---- Volumes ----

    /// The volumes, optionally including those marked unusable.
    pub fn get_stores(&self, include_unused: bool) -> Vec<Arc<DataDir>> {
        if include_unused {
            self.core.data_dirs.clone()
        } else {
            self.core.usable_stores()
        }
    }

    /// Look up a volume by its root path.
    pub fn get_store(&self, path: &Path) -> Option<Arc<DataDir>> {
        self.core
            .data_dirs
            .iter()
            .find(|d| d.path() == path)
            .cloned()
    }

    /// Flip a volume's usable flag. Marking a volume unusable drops its
    /// tablets from the directory.
    pub fn set_store_used_flag(&self, path: &Path, is_used: bool) -> Result<(), EngineError> {
        let data_dir = self
            .get_store(path)
            .ok_or_else(|| EngineError::NotFound(format!("store {}", path.display())))?;
        data_dir.set_is_used(is_used);
        if !is_used {
            self.core.drop_store_tablets(&data_dir);
        }
        Ok(())
    }

    /// Whether a disk-state re-report is due; observing the flag clears it.
    pub fn take_disk_report_notice(&self) -> bool {
        self.core.report_disk_pending.swap(false, Ordering::AcqRel)
    }

    /// Whether a tablet re-report is due; observing the flag clears it.
    pub fn take_tablet_report_notice(&self) -> bool {
        self.core.report_tablet_pending.swap(false, Ordering::AcqRel)
    }

    /// Per-volume state, optionally refreshing available space first.
    pub fn get_all_data_dir_info(&self, refresh: bool) -> Vec<DataDirInfo> {
        if refresh {
            for data_dir in self.core.usable_stores() {
                match self.core.disk_space.available_bytes(data_dir.path()) {
                    Ok(bytes) => data_dir.set_available_bytes(bytes),
                    Err(e) => warn!(
                        path = %data_dir.path().display(),
                        "failed to probe available space: {e}"
                    ),
                }
            }
        }
        self.core.data_dirs.iter().map(|d| d.dir_info()).collect()
    }

    /// Run one disk health/space pass now. Fails with
    /// [`EngineError::DiskExhaustion`] when too few volumes remain usable;
    /// that failure is also published once on [`Engine::fatal_events`].
    pub fn start_disk_stat_monitor(&self) -> Result<(), EngineError> {
        self.core.disk_monitor_pass()
    }

    /// Receiver of unrecoverable conditions for the embedding process.
    pub fn fatal_events(&self) -> flume::Receiver<EngineError> {
        self.core.fatal_rx.clone()
    }

    // ---- Tablets ----

    /// The live tablet directory.
    pub fn tablet_directory(&self) -> &Arc<TabletDirectory> {
        &self.core.directory
    }

    /// In-flight transaction registry.
    pub fn txn_manager(&self) -> &TxnManager {
        &self.core.txn_manager
    }

    /// Retired-artifact registries.
    pub fn garbage_collector(&self) -> &GarbageCollector {
        &self.core.gc
    }

    /// Generator for ids of newly written rowsets.
    pub fn rowset_id_generator(&self) -> &RowsetIdGenerator {
        &self.core.rowset_ids
    }

    /// Shared segment-index cache.
    pub fn index_cache(&self) -> &IndexCache {
        &self.core.index_cache
    }

    /// Create a tablet on the best-fitting volume. A tablet derived from a
    /// live base tablet (schema change) is pinned to the base's volume.
    pub fn create_tablet(&self, request: &CreateTabletRequest) -> Result<Arc<Tablet>, EngineError> {
        let pinned = request.base_tablet.and_then(|base| {
            self.core
                .directory
                .get(base.tablet_id, base.schema_hash)
                .map(|t| t.data_dir().clone())
        });
        let store = match pinned {
            Some(store) if store.is_used() => store,
            _ => self.core.pick_store(request.storage_medium)?,
        };
        self.core.directory.create_tablet_on(request, &store)
    }

    /// Allocate a shard directory for incoming tablet data (clone/restore),
    /// returning its absolute path and the volume it lives on.
    pub fn obtain_shard_path(
        &self,
        medium: StorageMedium,
    ) -> Result<(PathBuf, Arc<DataDir>), EngineError> {
        let store = self.core.pick_store(medium)?;
        let shard = store.get_shard()?;
        Ok((store.shard_path(shard), store))
    }

    /// Load a tablet whose meta and files already sit on `store_root`, as
    /// left there by a clone or restore.
    pub fn load_tablet(
        &self,
        store_root: &Path,
        tablet_id: u64,
        schema_hash: u32,
    ) -> Result<Arc<Tablet>, EngineError> {
        let data_dir = self.get_store(store_root).ok_or_else(|| {
            EngineError::NotFound(format!("store {}", store_root.display()))
        })?;
        self.core.directory.load_one_tablet(&data_dir, tablet_id, schema_hash)
    }

    /// Drop a tablet: unregister it, delete its persisted meta, and queue
    /// its visible rowsets for reclamation. Data files are not touched here;
    /// they fall to the GC and trash paths.
    pub fn drop_tablet(&self, tablet_id: u64, schema_hash: u32) -> Result<(), EngineError> {
        let tablet = self
            .core
            .directory
            .drop_tablet(tablet_id, schema_hash)
            .ok_or_else(|| EngineError::NotFound(format!("tablet {tablet_id}.{schema_hash}")))?;
        for rowset in tablet.visible_rowsets() {
            self.core.gc.add_unused_rowset(rowset);
        }
        tablet.data_dir().meta().delete_tablet_meta(tablet_id, schema_hash)?;
        Ok(())
    }

    /// Roll a tablet back so `version` is its greatest visible version,
    /// queueing the rowsets past it for reclamation.
    pub fn recover_tablet_until_version(
        &self,
        tablet_id: u64,
        schema_hash: u32,
        version: u64,
    ) -> Result<(), EngineError> {
        let tablet = self.core.directory.get(tablet_id, schema_hash).ok_or_else(|| {
            EngineError::NotFound(format!("tablet {tablet_id}.{schema_hash}"))
        })?;
        let retired = tablet.recover_until_version(version);
        let count = retired.len();
        for rowset in retired {
            self.core.gc.add_unused_rowset(rowset);
        }
        info!(
            tablet = %tablet.info(),
            version,
            retired = count,
            "recovered tablet to version"
        );
        Ok(())
    }

    /// Drive a task through prepare, execute and finish.
    pub fn execute_task(&self, task: &dyn EngineTask) -> Result<(), EngineError> {
        task::execute_task(&self.core.directory, task)
    }

    // ---- Transactions ----

    /// Abort a transaction across the given partitions, retiring every
    /// pending rowset it committed.
    pub fn clear_transaction_task(&self, txn_id: u64, partition_ids: &[u64]) {
        for &partition_id in partition_ids {
            for (info, rowset) in self.core.txn_manager.related_tablets(partition_id, txn_id) {
                self.core.gc.add_unused_rowset(rowset);
                self.core.txn_manager.delete_txn(partition_id, txn_id, &info);
            }
        }
        info!(txn_id, partitions = partition_ids.len(), "cleared transaction");
    }

    // ---- Reclamation ----

    /// Sweep snapshots and trash now, returning the highest volume usage
    /// fraction observed.
    pub fn start_trash_sweep(&self) -> f64 {
        self.core.trash_sweep_pass()
    }

    /// Reclaim retired index artifacts now.
    pub fn start_delete_unused_index(&self) {
        self.core.gc.sweep_unused_index();
    }

    /// Reclaim retired rowsets now.
    pub fn start_delete_unused_rowset(&self) {
        self.core.gc.sweep_unused_rowset();
    }

    // ---- Lifecycle ----

    /// Stop the background threads and release the engine.
    pub fn close(mut self) {
        self.shutdown_threads();
    }

    fn shutdown_threads(&mut self) {
        // Dropping the sender disconnects every loop's receiver.
        if self.shutdown.take().is_some() {
            for handle in self.threads.drain(..) {
                let _ = handle.join();
            }
            info!("storage engine closed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("volumes", &self.core.data_dirs.len())
            .field("tablets", &self.core.directory.len())
            .field("cluster_id", &self.effective_cluster_id())
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_threads();
    }
}

/// Check that every volume agrees on the cluster id and settle the
/// effective one, writing it back to volumes that never recorded it.
fn reconcile_cluster_ids(
    data_dirs: &[Arc<DataDir>],
    configured: i32,
) -> Result<i32, EngineError> {
    let mut effective = configured;
    for data_dir in data_dirs {
        let id = data_dir.cluster_id()?;
        if id == -1 {
            continue;
        }
        if effective == -1 {
            effective = id;
        } else if effective != id {
            return Err(EngineError::ClusterIdConflict {
                left: effective,
                right: id,
            });
        }
    }
    if effective != -1 {
        for data_dir in data_dirs {
            if data_dir.cluster_id()? == -1 {
                data_dir.set_cluster_id(effective)?;
            }
        }
    }
    Ok(effective)
}

fn spawn_loop(
    name: &str,
    interval: Duration,
    shutdown: flume::Receiver<()>,
    mut body: impl FnMut() + Send + 'static,
) -> Result<JoinHandle<()>, EngineError> {
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match shutdown.recv_timeout(interval) {
                Err(flume::RecvTimeoutError::Timeout) => body(),
                Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        meta::TabletSchema,
        option::StorePath,
        rowset::{Rowset, RowsetMeta, RowsetState, Version},
    };

    /// Options with intervals long enough that background threads stay idle
    /// for the whole test.
    fn quiet_options(roots: &[&Path]) -> EngineOptions {
        let idle = Duration::from_secs(3600);
        EngineOptions::new(
            roots
                .iter()
                .map(|root| StorePath::new(*root, 1 << 30))
                .collect(),
        )
        .disk_monitor_interval(idle)
        .compaction_check_interval(idle)
        .gc_interval(idle)
        .trash_sweep_interval(idle)
    }

    fn create_request(tablet_id: u64) -> CreateTabletRequest {
        CreateTabletRequest {
            tablet_id,
            schema_hash: 1,
            schema: TabletSchema::default(),
            storage_medium: StorageMedium::Hdd,
            base_tablet: None,
        }
    }

    #[test]
    fn engine_debug_summarizes_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        let rendered = format!("{engine:?}");
        assert!(rendered.contains("Engine"));
        assert!(rendered.contains("volumes: 1"));
    }

    #[test]
    fn open_rejects_empty_configuration() {
        let err = Engine::open(EngineOptions::new(Vec::new())).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn open_rejects_zero_cache_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let options = quiet_options(&[dir.path()]).index_cache_capacity(0);
        let err = Engine::open(options).unwrap_err();
        assert!(matches!(err, EngineError::InitFailed(_)));
    }

    #[test]
    fn cluster_id_spreads_to_unset_volumes() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        // Volume A already belongs to cluster 7.
        {
            let engine =
                Engine::open(quiet_options(&[dir_a.path()])).unwrap();
            engine.set_cluster_id(7).unwrap();
            engine.close();
        }

        let engine = Engine::open(quiet_options(&[dir_a.path(), dir_b.path()])).unwrap();
        assert_eq!(engine.effective_cluster_id(), 7);
        let store_b = engine.get_store(dir_b.path()).unwrap();
        assert_eq!(store_b.cluster_id().unwrap(), 7);
    }

    #[test]
    fn conflicting_cluster_ids_fail_open() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        for (dir, id) in [(&dir_a, 7), (&dir_b, 8)] {
            let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
            engine.set_cluster_id(id).unwrap();
            engine.close();
        }

        let err = Engine::open(quiet_options(&[dir_a.path(), dir_b.path()])).unwrap_err();
        assert!(matches!(err, EngineError::ClusterIdConflict { .. }));
    }

    #[test]
    fn changing_a_set_cluster_id_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();

        engine.set_cluster_id(7).unwrap();
        engine.set_cluster_id(7).unwrap();
        let err = engine.set_cluster_id(9).unwrap_err();
        assert!(matches!(err, EngineError::ClusterIdConflict { left: 7, right: 9 }));
    }

    #[test]
    fn create_tablet_lands_on_the_emptiest_volume() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir_a.path(), dir_b.path()])).unwrap();

        engine
            .get_store(dir_a.path())
            .unwrap()
            .set_available_bytes(1 << 10);
        engine
            .get_store(dir_b.path())
            .unwrap()
            .set_available_bytes(1 << 20);

        let tablet = engine.create_tablet(&create_request(1)).unwrap();
        assert_eq!(tablet.data_dir().path(), dir_b.path());
        assert!(engine.tablet_directory().get(1, 1).is_some());
    }

    #[test]
    fn tablets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
            engine.create_tablet(&create_request(5)).unwrap();
            engine.close();
        }

        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        assert!(engine.tablet_directory().get(5, 1).is_some());
    }

    #[test]
    fn recover_tablet_until_version_retires_later_rowsets() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        let tablet = engine.create_tablet(&create_request(5)).unwrap();

        for version in [Version::new(0, 3), Version::new(4, 6), Version::new(7, 9)] {
            let meta = RowsetMeta {
                rowset_id: engine.rowset_id_generator().generate(),
                tablet_id: 5,
                schema_hash: 1,
                version,
                state: RowsetState::Visible,
                txn_id: None,
                partition_id: None,
                load_id: None,
            };
            tablet
                .add_rowset(Arc::new(Rowset::new(meta, tablet.data_dir().clone())))
                .unwrap();
        }

        engine.recover_tablet_until_version(5, 1, 6).unwrap();
        assert_eq!(tablet.max_version(), Some(Version::new(4, 6)));
        assert_eq!(engine.garbage_collector().tracked_rowsets(), 1);
    }

    #[test]
    fn drop_tablet_retires_rowsets_and_deletes_meta() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        let tablet = engine.create_tablet(&create_request(5)).unwrap();

        let meta = RowsetMeta {
            rowset_id: engine.rowset_id_generator().generate(),
            tablet_id: 5,
            schema_hash: 1,
            version: Version::new(0, 3),
            state: RowsetState::Visible,
            txn_id: None,
            partition_id: None,
            load_id: None,
        };
        tablet
            .add_rowset(Arc::new(Rowset::new(meta, tablet.data_dir().clone())))
            .unwrap();
        let store = tablet.data_dir().clone();
        drop(tablet);

        engine.drop_tablet(5, 1).unwrap();
        assert!(engine.tablet_directory().get(5, 1).is_none());
        assert_eq!(engine.garbage_collector().tracked_rowsets(), 1);
        assert!(store.meta().get_tablet_meta(5, 1).unwrap().is_none());

        let err = engine.drop_tablet(5, 1).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn clear_transaction_task_retires_pending_rowsets() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        let tablet = engine.create_tablet(&create_request(5)).unwrap();

        let meta = RowsetMeta {
            rowset_id: engine.rowset_id_generator().generate(),
            tablet_id: 5,
            schema_hash: 1,
            version: Version::new(0, 0),
            state: RowsetState::Committed,
            txn_id: Some(1001),
            partition_id: Some(3),
            load_id: None,
        };
        engine.txn_manager().commit_txn(
            3,
            1001,
            tablet.info(),
            Arc::new(Rowset::new(meta, tablet.data_dir().clone())),
        );

        engine.clear_transaction_task(1001, &[3]);
        assert!(engine.txn_manager().is_empty());
        assert_eq!(engine.garbage_collector().tracked_rowsets(), 1);
    }

    #[test]
    fn disk_exhaustion_is_reported_once_on_the_fatal_channel() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();

        engine.set_store_used_flag(dir.path(), false).unwrap();
        let err = engine.start_disk_stat_monitor().unwrap_err();
        assert!(matches!(err, EngineError::DiskExhaustion { unused: 1, total: 1 }));

        let events = engine.fatal_events();
        assert!(matches!(
            events.try_recv(),
            Ok(EngineError::DiskExhaustion { .. })
        ));
        // A second pass still fails but does not report again.
        engine.start_disk_stat_monitor().unwrap_err();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn schema_change_tablet_is_pinned_to_the_base_volume() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir_a.path(), dir_b.path()])).unwrap();

        let base = engine.create_tablet(&create_request(1)).unwrap();
        // Make the other volume strictly more attractive by free space.
        let other = engine
            .get_stores(false)
            .into_iter()
            .find(|d| d.path() != base.data_dir().path())
            .unwrap();
        other.set_available_bytes(1 << 29);
        base.data_dir().set_available_bytes(1 << 10);

        let mut request = create_request(2);
        request.base_tablet = Some(base.info());
        let derived = engine.create_tablet(&request).unwrap();
        assert_eq!(derived.data_dir().path(), base.data_dir().path());
    }

    #[test]
    fn marking_a_store_unused_drops_its_tablets() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        engine.create_tablet(&create_request(5)).unwrap();

        engine.set_store_used_flag(dir.path(), false).unwrap();
        assert!(engine.tablet_directory().is_empty());
        assert!(engine.get_stores(false).is_empty());
        assert_eq!(engine.get_stores(true).len(), 1);

        // The loss raises both re-report notices, each observable once.
        assert!(engine.take_disk_report_notice());
        assert!(!engine.take_disk_report_notice());
        assert!(engine.take_tablet_report_notice());
        assert!(!engine.take_tablet_report_notice());
    }

    #[test]
    fn obtain_shard_path_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();
        let (shard, store) = engine.obtain_shard_path(StorageMedium::Hdd).unwrap();
        assert!(shard.is_dir());
        assert!(shard.starts_with(dir.path()));
        assert_eq!(store.path(), dir.path());
    }

    #[test]
    fn load_tablet_picks_up_out_of_band_metas() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();

        // A clone placed the meta directly into the volume's store.
        let store = engine.get_store(dir.path()).unwrap();
        store
            .meta()
            .save_tablet_meta(&crate::meta::TabletMeta {
                tablet_id: 77,
                schema_hash: 2,
                shard_id: 0,
                schema: TabletSchema::default(),
            })
            .unwrap();

        let tablet = engine.load_tablet(dir.path(), 77, 2).unwrap();
        assert_eq!(tablet.tablet_id(), 77);
        assert!(engine.tablet_directory().get(77, 2).is_some());
    }

    #[test]
    fn dir_info_reflects_refresh_probe() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(quiet_options(&[dir.path()])).unwrap();

        let infos = engine.get_all_data_dir_info(true);
        assert_eq!(infos.len(), 1);
        // The unbounded probe clamps to capacity, so the volume reads empty.
        assert_eq!(infos[0].available_bytes, infos[0].capacity_bytes);
        assert!(infos[0].is_used);
    }
}
