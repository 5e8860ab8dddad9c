//! Compaction scheduling.
//!
//! Two independent kinds (cumulative and base) are scheduled per volume.
//! Selection scans the tablet directory under its read lock, excludes
//! tablets that are ineligible, backing off after a failure, or whose
//! per-kind lock is busy, and keeps the highest-scoring candidate. The
//! merge body itself is an external collaborator behind [`CompactionRunner`];
//! only its scheduling contract lives here.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    store::DataDir,
    tablet::{directory::TabletDirectory, unix_millis, CompactionKind, Tablet},
};

/// Errors surfaced by compaction init and run.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// No version range is currently worth merging. Silent at init.
    #[error("no suitable version for {0} compaction")]
    NoSuitableVersion(CompactionKind),
    /// Another compaction of the same kind holds the tablet. Silent at init.
    #[error("{0} compaction lock is busy")]
    Contention(CompactionKind),
    /// The merge failed.
    #[error("compaction failed: {0}")]
    Failed(String),
    /// Filesystem failure during the merge.
    #[error("compaction io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind-specific eligibility and urgency scoring.
///
/// Supplied by the compaction-policy module; the engine ships a version-count
/// default so a bare engine still schedules sensibly.
pub trait CompactionPolicy: Send + Sync {
    /// Whether the tablet is worth considering for `kind` at all.
    fn eligible(&self, tablet: &Tablet, kind: CompactionKind) -> bool;

    /// Urgency score, higher meaning more urgent.
    fn score(&self, tablet: &Tablet, kind: CompactionKind) -> u32;
}

/// Policy that scores tablets by visible version count.
#[derive(Debug, Clone)]
pub struct VersionCountPolicy {
    /// Minimum version count before cumulative compaction is considered.
    pub cumulative_threshold: usize,
    /// Minimum version count before base compaction is considered.
    pub base_threshold: usize,
}

impl Default for VersionCountPolicy {
    fn default() -> Self {
        VersionCountPolicy {
            cumulative_threshold: 5,
            base_threshold: 10,
        }
    }
}

impl CompactionPolicy for VersionCountPolicy {
    fn eligible(&self, tablet: &Tablet, kind: CompactionKind) -> bool {
        let threshold = match kind {
            CompactionKind::Cumulative => self.cumulative_threshold,
            CompactionKind::Base => self.base_threshold,
        };
        tablet.version_count() >= threshold
    }

    fn score(&self, tablet: &Tablet, _kind: CompactionKind) -> u32 {
        tablet.version_count() as u32
    }
}

/// The merge body, bound to a winning tablet by the scheduler.
///
/// `init` runs with the per-kind tablet lock already held and may refuse
/// with [`CompactionError::NoSuitableVersion`]; `run` performs the merge and
/// may block for a long time while holding only that per-kind lock.
pub trait CompactionRunner: Send + Sync {
    /// Validate that a merge can proceed on this tablet.
    fn init(&self, tablet: &Arc<Tablet>, kind: CompactionKind) -> Result<(), CompactionError>;

    /// Perform the merge.
    fn run(&self, tablet: &Arc<Tablet>, kind: CompactionKind) -> Result<(), CompactionError>;
}

/// Runner for engines with no merge implementation wired in: every init
/// reports no suitable version, so scheduling stays a no-op.
#[derive(Debug, Default)]
pub struct DisabledCompaction;

impl CompactionRunner for DisabledCompaction {
    fn init(&self, _tablet: &Arc<Tablet>, kind: CompactionKind) -> Result<(), CompactionError> {
        Err(CompactionError::NoSuitableVersion(kind))
    }

    fn run(&self, _tablet: &Arc<Tablet>, kind: CompactionKind) -> Result<(), CompactionError> {
        Err(CompactionError::NoSuitableVersion(kind))
    }
}

/// Per-kind, per-volume compaction scheduling over the tablet directory.
pub struct CompactionScheduler {
    directory: Arc<TabletDirectory>,
    policy: Arc<dyn CompactionPolicy>,
    runner: Arc<dyn CompactionRunner>,
    failure_backoff: Duration,
}

impl CompactionScheduler {
    /// Scheduler over `directory` with the given policy and merge body.
    pub fn new(
        directory: Arc<TabletDirectory>,
        policy: Arc<dyn CompactionPolicy>,
        runner: Arc<dyn CompactionRunner>,
        failure_backoff: Duration,
    ) -> Self {
        CompactionScheduler {
            directory,
            policy,
            runner,
            failure_backoff,
        }
    }

    /// Pick the most urgent compaction candidate on one volume, or `None`.
    ///
    /// The per-kind lock is only probed here; the probe guard is released
    /// immediately and real exclusivity is re-established when the
    /// compaction runs. Holding the lock across the whole scan would stall
    /// every other compaction of this kind engine-wide.
    pub fn select_best(&self, kind: CompactionKind, store: &Arc<DataDir>) -> Option<Arc<Tablet>> {
        let now = unix_millis();
        let backoff_ms = self.failure_backoff.as_millis() as u64;

        let mut highest_score = 0u32;
        let mut best: Option<Arc<Tablet>> = None;
        for tablet in self.directory.tablets_on(store) {
            if !tablet.is_used() || !tablet.is_loaded() {
                continue;
            }
            if !self.policy.eligible(&tablet, kind) {
                continue;
            }
            if let Some(failed_at) = tablet.last_compaction_failure_ms() {
                if now.saturating_sub(failed_at) <= backoff_ms {
                    debug!(
                        tablet = %tablet.info(),
                        failed_at,
                        "skipping tablet inside compaction failure backoff"
                    );
                    continue;
                }
            }
            if !tablet.probe_compaction_lock(kind) {
                continue;
            }

            let score = self.policy.score(&tablet, kind);
            if score > highest_score {
                highest_score = score;
                best = Some(tablet);
            }
        }

        if let Some(tablet) = &best {
            info!(
                kind = %kind,
                tablet = %tablet.info(),
                score = highest_score,
                "selected tablet for compaction"
            );
        }
        best
    }

    /// Run one scheduling cycle for `kind` on one volume.
    pub fn perform_compaction(&self, kind: CompactionKind, store: &Arc<DataDir>) {
        let Some(tablet) = self.select_best(kind, store) else {
            return;
        };

        // Real exclusivity starts here; the selection probe was advisory.
        let Some(_guard) = tablet.try_compaction_lock(kind) else {
            return;
        };

        if let Err(e) = self.runner.init(&tablet, kind) {
            match e {
                CompactionError::NoSuitableVersion(_) | CompactionError::Contention(_) => {}
                other => {
                    tablet.set_last_compaction_failure();
                    warn!(
                        kind = %kind,
                        tablet = %tablet.full_name(),
                        "failed to init compaction: {other}"
                    );
                }
            }
            return;
        }

        match self.runner.run(&tablet, kind) {
            Ok(()) => tablet.clear_last_compaction_failure(),
            Err(e) => {
                tablet.set_last_compaction_failure();
                warn!(
                    kind = %kind,
                    tablet = %tablet.full_name(),
                    "failed to run compaction: {e}"
                );
            }
        }
    }
}
