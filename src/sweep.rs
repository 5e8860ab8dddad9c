//! Periodic expiry of snapshot exports and trashed files.
//!
//! Entries under a volume's `snapshot/` and `trash/` subdirectories are
//! named with a `%Y%m%d%H%M%S` local-time prefix (up to the first `.`), so
//! their age is read from the name rather than filesystem timestamps, which
//! copies and restores do not preserve.

use std::{path::Path, sync::Arc, time::Duration};

use chrono::{Local, NaiveDateTime};
use tracing::{info, warn};

use crate::store::{DataDir, SNAPSHOT_PREFIX, TRASH_PREFIX};

const ENTRY_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Age in seconds of a timestamped entry name, `None` if the prefix does not
/// parse.
fn entry_age_seconds(name: &str, now: NaiveDateTime) -> Option<i64> {
    let stamp = name.split('.').next()?;
    let created = NaiveDateTime::parse_from_str(stamp, ENTRY_TIME_FORMAT).ok()?;
    Some((now - created).num_seconds())
}

/// Delete every entry under `dir` older than `expire`. Entries with an
/// unparseable name are left in place.
fn sweep_dir(dir: &Path, expire: Duration, now: NaiveDateTime) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "failed to scan sweep directory: {e}");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %dir.display(), "failed to read sweep entry: {e}");
                continue;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            warn!(path = %entry.path().display(), "sweep entry name is not UTF-8, skipping");
            continue;
        };
        let Some(age) = entry_age_seconds(name, now) else {
            warn!(path = %entry.path().display(), "sweep entry name has no timestamp, skipping");
            continue;
        };
        if age < 0 || (age as u64) < expire.as_secs() {
            continue;
        }

        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => info!(path = %path.display(), age_seconds = age, "swept expired entry"),
            Err(e) => warn!(path = %path.display(), "failed to sweep entry: {e}"),
        }
    }
}

/// Sweep snapshots and trash on every usable volume, returning the highest
/// usage fraction observed.
///
/// Snapshots always use `snapshot_expire`. Trash uses `trash_expire`, but a
/// volume past `trash_guard_fraction` of its capacity empties its trash
/// immediately to give writes room.
pub(crate) fn sweep_trash_and_snapshots(
    data_dirs: &[Arc<DataDir>],
    snapshot_expire: Duration,
    trash_expire: Duration,
    trash_guard_fraction: f64,
) -> f64 {
    let now = Local::now().naive_local();
    let mut max_usage = 0.0f64;

    for data_dir in data_dirs {
        if !data_dir.is_used() {
            continue;
        }
        let usage = data_dir.usage_fraction();
        max_usage = max_usage.max(usage);

        sweep_dir(
            &data_dir.path().join(SNAPSHOT_PREFIX),
            snapshot_expire,
            now,
        );

        let effective_trash_expire = if usage > trash_guard_fraction {
            warn!(
                path = %data_dir.path().display(),
                usage,
                "volume usage exceeds trash guard, emptying trash immediately"
            );
            Duration::ZERO
        } else {
            trash_expire
        };
        sweep_dir(
            &data_dir.path().join(TRASH_PREFIX),
            effective_trash_expire,
            now,
        );
    }

    max_usage
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::tablet::tests::test_data_dir;

    fn stamped_name(age: Duration) -> String {
        let created = Local::now().naive_local() - TimeDelta::seconds(age.as_secs() as i64);
        format!("{}.tablet_download", created.format(ENTRY_TIME_FORMAT))
    }

    #[test]
    fn expired_entries_are_removed_and_fresh_ones_kept() {
        let (_dir, data_dir) = test_data_dir();
        let snapshot_dir = data_dir.path().join(SNAPSHOT_PREFIX);

        let old = snapshot_dir.join(stamped_name(Duration::from_secs(3 * 3600)));
        let fresh = snapshot_dir.join(stamped_name(Duration::from_secs(60)));
        std::fs::create_dir(&old).unwrap();
        std::fs::write(&fresh, b"snap").unwrap();

        sweep_trash_and_snapshots(
            &[data_dir],
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            0.9,
        );

        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn unparseable_names_are_left_alone() {
        let (_dir, data_dir) = test_data_dir();
        let trash_dir = data_dir.path().join(TRASH_PREFIX);
        let odd = trash_dir.join("not-a-timestamp");
        std::fs::write(&odd, b"x").unwrap();

        sweep_trash_and_snapshots(
            &[data_dir],
            Duration::ZERO,
            Duration::ZERO,
            0.9,
        );
        assert!(odd.exists());
    }

    #[test]
    fn high_usage_empties_trash_but_not_snapshots() {
        let (_dir, data_dir) = test_data_dir();
        // 1 GiB capacity from the test helper; report nearly full.
        data_dir.set_available_bytes(1 << 20);

        let trash_entry = data_dir
            .path()
            .join(TRASH_PREFIX)
            .join(stamped_name(Duration::from_secs(60)));
        let snapshot_entry = data_dir
            .path()
            .join(SNAPSHOT_PREFIX)
            .join(stamped_name(Duration::from_secs(60)));
        std::fs::write(&trash_entry, b"x").unwrap();
        std::fs::write(&snapshot_entry, b"x").unwrap();

        let usage = sweep_trash_and_snapshots(
            &[data_dir],
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            0.9,
        );

        assert!(usage > 0.9);
        assert!(!trash_entry.exists());
        assert!(snapshot_entry.exists());
    }

    #[test]
    fn unusable_volumes_are_skipped() {
        let (_dir, data_dir) = test_data_dir();
        data_dir.set_is_used(false);
        let entry = data_dir
            .path()
            .join(TRASH_PREFIX)
            .join(stamped_name(Duration::from_secs(3600)));
        std::fs::write(&entry, b"x").unwrap();

        let usage = sweep_trash_and_snapshots(
            &[data_dir],
            Duration::ZERO,
            Duration::ZERO,
            0.9,
        );
        assert_eq!(usage, 0.0);
        assert!(entry.exists());
    }
}
