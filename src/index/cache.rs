use super::postings::{Postings, INV_PID_FILE, INV_TAG_FILE};
use super::store::{RowReader, ROWS_FILE};
use super::summary::{IndexSummary, SCHEMA_VERSION, SUMMARY_FILE};
use super::time_index::{TimeIndex, TIME_INDEX_FILE};
use super::{IndexError, Result};
use crate::config::MilkteaConfig;
use crate::report::identity::{default_cache_root, ReportId};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const LOCK_FILE: &str = ".lock";

pub fn cache_root(config: &MilkteaConfig) -> PathBuf {
    config
        .cache_root
        .clone()
        .unwrap_or_else(default_cache_root)
}

pub fn report_dir(root: &Path, id: &ReportId) -> PathBuf {
    root.join(id.as_str())
}

/// Temp directory name for an in-progress build. Hidden so eviction and
/// cache opens never pick it up.
pub fn temp_dir(root: &Path, id: &ReportId) -> PathBuf {
    root.join(format!(".tmp-{}-{}", id.as_str(), std::process::id()))
}

/// Atomically publishes a fully-written temp directory as the report's
/// cache. An existing directory (a stale rebuild) is replaced.
pub fn commit_dir(temp: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    fs::rename(temp, target)?;
    Ok(())
}

/// All four artifacts of one committed report cache, opened read-only.
#[derive(Debug)]
pub struct ReportCache {
    pub dir: PathBuf,
    pub summary: IndexSummary,
    pub rows: RowReader,
    pub time_index: TimeIndex,
    pub inv_tag: Postings,
    pub inv_pid: Postings,
}

impl ReportCache {
    /// Opens the cache for `expected`. Identity or schema mismatch
    /// reports the cache stale; corrupt artifacts additionally delete
    /// the directory so the next parse rebuilds from scratch.
    pub fn open(dir: &Path, expected: &ReportId) -> Result<Self> {
        match Self::try_open(dir, expected) {
            Ok(cache) => Ok(cache),
            Err(IndexError::Corrupt(reason)) => {
                tracing::warn!(
                    dir = %dir.display(),
                    reason = %reason,
                    "deleting corrupt report cache"
                );
                if let Err(err) = fs::remove_dir_all(dir) {
                    tracing::warn!(error = %err, "failed to delete corrupt cache");
                }
                Err(IndexError::Stale(reason))
            }
            Err(err) => Err(err),
        }
    }

    fn try_open(dir: &Path, expected: &ReportId) -> Result<Self> {
        let summary_path = dir.join(SUMMARY_FILE);
        if !summary_path.exists() {
            return Err(IndexError::Stale("no cache for this report".into()));
        }

        let summary = match IndexSummary::load(&summary_path) {
            Ok(summary) => summary,
            Err(IndexError::Json(err)) => {
                return Err(IndexError::Corrupt(format!("summary unreadable: {err}")))
            }
            Err(err) => return Err(err),
        };
        if summary.schema_version != SCHEMA_VERSION {
            return Err(IndexError::Stale(format!(
                "schema version {} != {}",
                summary.schema_version, SCHEMA_VERSION
            )));
        }
        if summary.report_id != expected.as_str() {
            return Err(IndexError::Stale("report identity mismatch".into()));
        }

        let rows = required(RowReader::open(&dir.join(ROWS_FILE)), "row store")?;
        if rows.len() != summary.total_rows {
            return Err(IndexError::Corrupt(format!(
                "row store holds {} records, summary says {}",
                rows.len(),
                summary.total_rows
            )));
        }
        let time_index = required(TimeIndex::load(&dir.join(TIME_INDEX_FILE)), "time index")?;
        let inv_tag = required(Postings::load(&dir.join(INV_TAG_FILE)), "tag postings")?;
        let inv_pid = required(Postings::load(&dir.join(INV_PID_FILE)), "pid postings")?;

        Ok(Self {
            dir: dir.to_path_buf(),
            summary,
            rows,
            time_index,
            inv_tag,
            inv_pid,
        })
    }
}

/// A vanished artifact file is corruption, not a plain I/O failure.
fn required<T>(result: Result<T>, what: &str) -> Result<T> {
    match result {
        Err(IndexError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(IndexError::Corrupt(format!("{what} file missing")))
        }
        other => other,
    }
}

/// Evicts least-recently-used report caches until the root fits under
/// `ceiling_bytes`. The freshly committed report is never evicted. An
/// advisory lock on the root serialises concurrent evictions.
pub fn evict_lru(root: &Path, ceiling_bytes: u64, keep: &ReportId) -> Result<()> {
    let lock_path = root.join(LOCK_FILE);
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    lock.lock_exclusive()?;
    let result = evict_locked(root, ceiling_bytes, keep);
    let _ = lock.unlock();
    result
}

fn evict_locked(root: &Path, ceiling_bytes: u64, keep: &ReportId) -> Result<()> {
    let mut entries: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    let mut total: u64 = 0;

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !entry.file_type()?.is_dir() || name.starts_with('.') {
            continue;
        }
        let size = dir_size(&entry.path())?;
        let modified = entry
            .metadata()?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        total += size;
        entries.push((entry.path(), modified, size));
    }

    if total <= ceiling_bytes {
        return Ok(());
    }

    entries.sort_by_key(|(_, modified, _)| *modified);
    for (path, _, size) in entries {
        if total <= ceiling_bytes {
            break;
        }
        if path.file_name().map(|n| n.to_string_lossy() == keep.as_str()) == Some(true) {
            continue;
        }
        tracing::info!(dir = %path.display(), bytes = size, "evicting cached report");
        fs::remove_dir_all(&path)?;
        total = total.saturating_sub(size);
    }

    Ok(())
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Removes a partial temp directory on drop unless the build committed.
pub struct TempDirGuard {
    path: PathBuf,
    armed: bool,
}

impl TempDirGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    dir = %self.path.display(),
                    error = %err,
                    "failed to clean up partial cache"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_report_dir(root: &Path, name: &str, bytes: usize) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("rows"), vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn eviction_keeps_total_under_ceiling() {
        let root = TempDir::new().unwrap();
        make_report_dir(root.path(), "aaaa", 1000);
        std::thread::sleep(std::time::Duration::from_millis(20));
        make_report_dir(root.path(), "bbbb", 1000);
        std::thread::sleep(std::time::Duration::from_millis(20));
        make_report_dir(root.path(), "cccc", 1000);

        evict_lru(root.path(), 2200, &ReportId::from_string("cccc")).unwrap();

        // Oldest directory goes first.
        assert!(!root.path().join("aaaa").exists());
        assert!(root.path().join("bbbb").exists());
        assert!(root.path().join("cccc").exists());
    }

    #[test]
    fn eviction_never_removes_the_kept_report() {
        let root = TempDir::new().unwrap();
        make_report_dir(root.path(), "keep", 5000);
        evict_lru(root.path(), 100, &ReportId::from_string("keep")).unwrap();
        assert!(root.path().join("keep").exists());
    }

    #[test]
    fn hidden_and_temp_dirs_are_ignored() {
        let root = TempDir::new().unwrap();
        make_report_dir(root.path(), ".tmp-xyz-1", 10_000);
        make_report_dir(root.path(), "live", 100);
        evict_lru(root.path(), 1000, &ReportId::from_string("live")).unwrap();
        assert!(root.path().join(".tmp-xyz-1").exists());
    }

    #[test]
    fn temp_guard_cleans_on_drop() {
        let root = TempDir::new().unwrap();
        let temp = root.path().join(".tmp-guard");
        fs::create_dir_all(&temp).unwrap();
        {
            let _guard = TempDirGuard::new(temp.clone());
        }
        assert!(!temp.exists());
    }

    #[test]
    fn disarmed_guard_leaves_dir() {
        let root = TempDir::new().unwrap();
        let temp = root.path().join(".tmp-guard");
        fs::create_dir_all(&temp).unwrap();
        {
            let mut guard = TempDirGuard::new(temp.clone());
            guard.disarm();
        }
        assert!(temp.exists());
    }

    #[test]
    fn open_missing_cache_is_stale() {
        let root = TempDir::new().unwrap();
        let err = ReportCache::open(&root.path().join("nope"), &ReportId::from_string("nope"))
            .unwrap_err();
        assert!(matches!(err, IndexError::Stale(_)));
    }
}
