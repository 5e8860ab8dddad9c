//! Two-phase engine tasks with sorted tablet locking.
//!
//! Control-plane tasks (schema change, clone, restore) touch one or more
//! tablets and follow a prepare/execute/finish shape. Prepare and finish run
//! under every related tablet's header write lock; the long-running execute
//! phase runs with no tablet lock held. Locks are always taken in ascending
//! [`TabletInfo`] order so two tasks over overlapping tablet sets cannot
//! deadlock.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::EngineError,
    tablet::{directory::TabletDirectory, Tablet, TabletInfo},
};

/// A task the engine drives through prepare, execute and finish.
pub trait EngineTask {
    /// Human-readable task name for logs.
    fn name(&self) -> &str;

    /// The tablets this task touches. Queried twice: once before prepare and
    /// again before finish, since execute may create tablets (clone) that
    /// finish must also lock.
    fn related_tablets(&self) -> Vec<TabletInfo>;

    /// Validate and stage under all related tablet header locks.
    fn prepare(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// The long-running body. No tablet lock is held.
    fn execute(&self) -> Result<(), EngineError>;

    /// Publish results under all related tablet header locks.
    fn finish(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Resolve `infos` against the directory, keeping ascending order.
/// Tablets that disappeared since the task was issued are skipped with a
/// warning rather than failing the task.
fn resolve_sorted(directory: &TabletDirectory, mut infos: Vec<TabletInfo>) -> Vec<Arc<Tablet>> {
    infos.sort_unstable();
    infos.dedup();
    infos
        .into_iter()
        .filter_map(|info| {
            let tablet = directory.get(info.tablet_id, info.schema_hash);
            if tablet.is_none() {
                warn!(tablet = %info, "related tablet is not registered, skipping");
            }
            tablet
        })
        .collect()
}

/// Drive one task through its three phases against the live directory.
pub fn execute_task(directory: &TabletDirectory, task: &dyn EngineTask) -> Result<(), EngineError> {
    let tablets = resolve_sorted(directory, task.related_tablets());
    {
        // Guards borrow from `tablets`; both vectors drop at the end of this
        // block, guards first.
        let mut guards = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            guards.push(tablet.header_lock().write());
        }
        task.prepare()?;
    }

    task.execute()?;

    let tablets = resolve_sorted(directory, task.related_tablets());
    let mut guards = Vec::with_capacity(tablets.len());
    for tablet in &tablets {
        guards.push(tablet.header_lock().write());
    }
    let result = task.finish();
    drop(guards);

    match &result {
        Ok(()) => info!(task = task.name(), "task finished"),
        Err(e) => warn!(task = task.name(), "task finish failed: {e}"),
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::tablet::tests::{test_data_dir, test_tablet};

    /// Records the phase sequence and, per phase, whether the tablet header
    /// lock was observably held (via try-write from the test side).
    struct RecordingTask {
        infos: Vec<TabletInfo>,
        directory: Arc<TabletDirectory>,
        phases: Mutex<Vec<(&'static str, bool)>>,
        fail_prepare: bool,
        fail_execute: bool,
    }

    impl RecordingTask {
        fn locked_anywhere(&self) -> bool {
            self.infos.iter().any(|info| {
                self.directory
                    .get(info.tablet_id, info.schema_hash)
                    .map(|t| t.header_lock().try_write().is_none())
                    .unwrap_or(false)
            })
        }
    }

    impl EngineTask for RecordingTask {
        fn name(&self) -> &str {
            "recording"
        }

        fn related_tablets(&self) -> Vec<TabletInfo> {
            self.infos.clone()
        }

        fn prepare(&self) -> Result<(), EngineError> {
            self.phases.lock().push(("prepare", self.locked_anywhere()));
            if self.fail_prepare {
                return Err(EngineError::InitFailed("prepare".into()));
            }
            Ok(())
        }

        fn execute(&self) -> Result<(), EngineError> {
            self.phases.lock().push(("execute", self.locked_anywhere()));
            if self.fail_execute {
                return Err(EngineError::InitFailed("execute".into()));
            }
            Ok(())
        }

        fn finish(&self) -> Result<(), EngineError> {
            self.phases.lock().push(("finish", self.locked_anywhere()));
            Ok(())
        }
    }

    struct CountingTask {
        executes: AtomicUsize,
    }

    impl EngineTask for CountingTask {
        fn name(&self) -> &str {
            "counting"
        }

        fn related_tablets(&self) -> Vec<TabletInfo> {
            vec![TabletInfo::new(404, 1)]
        }

        fn execute(&self) -> Result<(), EngineError> {
            self.executes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(ids: &[u64]) -> (tempfile::TempDir, Arc<TabletDirectory>, Vec<TabletInfo>) {
        let (dir, data_dir) = test_data_dir();
        let directory = Arc::new(TabletDirectory::new());
        let mut infos = Vec::new();
        for &id in ids {
            let tablet = test_tablet(id, data_dir.clone());
            infos.push(tablet.info());
            directory.register(tablet).unwrap();
        }
        (dir, directory, infos)
    }

    #[test]
    fn phases_run_in_order_with_locks_held_outside_execute() {
        let (_dir, directory, infos) = setup(&[2, 1, 3]);
        let task = RecordingTask {
            infos,
            directory: directory.clone(),
            phases: Mutex::new(Vec::new()),
            fail_prepare: false,
            fail_execute: false,
        };

        execute_task(&directory, &task).unwrap();

        let phases = task.phases.lock();
        assert_eq!(
            phases.as_slice(),
            &[("prepare", true), ("execute", false), ("finish", true)]
        );
    }

    #[test]
    fn prepare_failure_skips_execute_and_finish() {
        let (_dir, directory, infos) = setup(&[1]);
        let task = RecordingTask {
            infos,
            directory: directory.clone(),
            phases: Mutex::new(Vec::new()),
            fail_prepare: true,
            fail_execute: false,
        };

        execute_task(&directory, &task).unwrap_err();
        let phases = task.phases.lock();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].0, "prepare");
        drop(phases);

        // No header lock may survive the failed prepare.
        for info in &task.infos {
            let tablet = directory.get(info.tablet_id, info.schema_hash).unwrap();
            assert!(tablet.header_lock().try_write().is_some());
        }
    }

    #[test]
    fn overlapping_tasks_complete_without_deadlock() {
        struct NoopTask {
            infos: Vec<TabletInfo>,
        }

        impl EngineTask for NoopTask {
            fn name(&self) -> &str {
                "noop"
            }

            fn related_tablets(&self) -> Vec<TabletInfo> {
                self.infos.clone()
            }

            fn execute(&self) -> Result<(), EngineError> {
                Ok(())
            }
        }

        let (_dir, directory, _infos) = setup(&[3, 7, 9]);
        // Two tasks naming overlapping tablets in opposite orders; the
        // sorted acquisition order must keep them deadlock-free.
        std::thread::scope(|scope| {
            let wide = directory.clone();
            scope.spawn(move || {
                let task = NoopTask {
                    infos: vec![
                        TabletInfo::new(7, 1),
                        TabletInfo::new(3, 1),
                        TabletInfo::new(9, 1),
                    ],
                };
                for _ in 0..200 {
                    execute_task(&wide, &task).unwrap();
                }
            });
            let narrow = directory.clone();
            scope.spawn(move || {
                let task = NoopTask {
                    infos: vec![TabletInfo::new(9, 1), TabletInfo::new(3, 1)],
                };
                for _ in 0..200 {
                    execute_task(&narrow, &task).unwrap();
                }
            });
        });
    }

    #[test]
    fn execute_failure_skips_finish() {
        let (_dir, directory, infos) = setup(&[1]);
        let task = RecordingTask {
            infos,
            directory: directory.clone(),
            phases: Mutex::new(Vec::new()),
            fail_prepare: false,
            fail_execute: true,
        };

        execute_task(&directory, &task).unwrap_err();
        let phases = task.phases.lock();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[1].0, "execute");
    }

    #[test]
    fn missing_related_tablets_are_skipped() {
        let directory = Arc::new(TabletDirectory::new());
        let task = CountingTask {
            executes: AtomicUsize::new(0),
        };

        execute_task(&directory, &task).unwrap();
        assert_eq!(task.executes.load(Ordering::SeqCst), 1);
    }
}
