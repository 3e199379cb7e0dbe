use super::cache::{self, TempDirGuard};
use super::postings::{pid_key, PostingsBuilder, INV_PID_FILE, INV_TAG_FILE};
use super::store::{RowReader, RowWriter, ROWS_FILE};
use super::summary::{DerivedCounts, IndexSummary, SCHEMA_VERSION, SUMMARY_FILE};
use super::time_index::{TimeIndex, TimeIndexBuilder, TIME_INDEX_FILE};
use super::IndexError;
use crate::config::MilkteaConfig;
use crate::logcat::parser::threadtime_regex;
use crate::logcat::{LogLevel, LogRow, ThreadtimeParser, TimestampNormalizer};
use crate::report::identity::ReportId;
use crate::report::reader::{BugreportFile, LineReader, ReaderError, SectionTracker};
use crate::report::DeviceScanner;
use chrono::Datelike;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// "Recent" window for the E/F count: the final five minutes of the
/// observed timestamp range.
pub const EF_RECENT_WINDOW_MS: i64 = 5 * 60 * 1000;

const CANCEL_CHECK_INTERVAL: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsePhase {
    Starting,
    Scanning,
    Indexing,
    Finalizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseProgress {
    pub phase: ParsePhase,
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub rows_processed: u64,
    pub percent: f32,
}

impl ParseProgress {
    pub fn starting() -> Self {
        Self {
            phase: ParsePhase::Starting,
            bytes_read: 0,
            total_bytes: 0,
            rows_processed: 0,
            percent: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("parse cancelled")]
    Cancelled,
}

/// Single ingest pass: streams the bugreport, parses the logcat
/// sections, and writes all four cache artifacts into a temp directory
/// that is atomically renamed into place on success.
///
/// An already-committed cache for the same report identity is reused
/// without re-reading the bugreport.
pub fn build_index(
    path: &Path,
    config: &MilkteaConfig,
    progress: &watch::Sender<ParseProgress>,
    cancel: &CancellationToken,
) -> Result<IndexSummary, BuildError> {
    progress.send_replace(ParseProgress::starting());

    let report_id = ReportId::for_path(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ReaderError::NotFound(path.to_path_buf())
        } else {
            ReaderError::Io(err)
        }
    })?;

    let root = cache::cache_root(config);
    fs::create_dir_all(&root).map_err(IndexError::Io)?;
    let target = cache::report_dir(&root, &report_id);

    if let Ok(existing) = IndexSummary::load(&target.join(SUMMARY_FILE)) {
        if existing.schema_version == SCHEMA_VERSION && existing.report_id == report_id.as_str() {
            tracing::info!(report = %report_id, "reusing committed cache");
            progress.send_replace(ParseProgress {
                phase: ParsePhase::Finalizing,
                bytes_read: existing.log_bytes,
                total_bytes: existing.log_bytes,
                rows_processed: existing.total_rows,
                percent: 100.0,
            });
            return Ok(existing);
        }
    }

    let source = BugreportFile::open(path)?;
    let total_bytes = source.total_bytes();
    tracing::info!(
        path = %path.display(),
        report = %report_id,
        bytes = total_bytes,
        "building logcat index"
    );

    let mut guard = TempDirGuard::new(cache::temp_dir(&root, &report_id));
    if guard.path().exists() {
        fs::remove_dir_all(guard.path()).map_err(IndexError::Io)?;
    }
    fs::create_dir_all(guard.path()).map_err(IndexError::Io)?;

    let mut state = BuildState {
        cancel,
        progress,
        progress_interval: config.progress_interval,
        total_bytes,
        last_emit: Instant::now(),
        last_emit_bytes: 0,
        phase: ParsePhase::Scanning,
        tracker: SectionTracker::new(),
        scanner: DeviceScanner::new(),
        probe: threadtime_regex(),
        parser: None,
        rows: RowWriter::create(&guard.path().join(ROWS_FILE))?,
        time_index: TimeIndexBuilder::new(),
        inv_tag: PostingsBuilder::new(config.postings_budget, config.sample_step),
        inv_pid: PostingsBuilder::new(config.postings_budget, config.sample_step),
        log_bytes: 0,
        level_counts: BTreeMap::new(),
        min_ts: None,
        max_ts: None,
        counts: DerivedCounts::default(),
        lines_since_cancel_check: 0,
    };

    source.stream(|lines| state.consume(lines))??;

    let rows_processed = state.rows.len();
    progress.send_replace(ParseProgress {
        phase: ParsePhase::Finalizing,
        bytes_read: total_bytes,
        total_bytes,
        rows_processed,
        percent: 100.0,
    });

    let summary = finalize(state, &report_id, guard.path())?;
    cache::commit_dir(guard.path(), &target)?;
    guard.disarm();

    if let Err(err) = cache::evict_lru(&root, config.cache_ceiling_bytes, &report_id) {
        tracing::warn!(error = %err, "cache eviction failed");
    }

    tracing::info!(
        report = %report_id,
        rows = summary.total_rows,
        malformed = summary.malformed_rows,
        "logcat index committed"
    );
    Ok(summary)
}

struct BuildState<'a> {
    cancel: &'a CancellationToken,
    progress: &'a watch::Sender<ParseProgress>,
    progress_interval: Duration,
    total_bytes: u64,
    last_emit: Instant,
    last_emit_bytes: u64,
    phase: ParsePhase,

    tracker: SectionTracker,
    scanner: DeviceScanner,
    probe: Regex,
    parser: Option<ThreadtimeParser>,

    rows: RowWriter,
    time_index: TimeIndexBuilder,
    inv_tag: PostingsBuilder,
    inv_pid: PostingsBuilder,

    log_bytes: u64,
    level_counts: BTreeMap<LogLevel, u64>,
    min_ts: Option<(i64, String)>,
    max_ts: Option<(i64, String)>,
    counts: DerivedCounts,
    lines_since_cancel_check: u32,
}

impl BuildState<'_> {
    fn consume(&mut self, lines: LineReader<'_>) -> Result<(), BuildError> {
        for line in lines {
            let line = line.map_err(ReaderError::Io)?;

            self.lines_since_cancel_check += 1;
            if self.lines_since_cancel_check >= CANCEL_CHECK_INTERVAL {
                self.lines_since_cancel_check = 0;
                if self.cancel.is_cancelled() {
                    tracing::info!("parse cancelled, unwinding");
                    return Err(BuildError::Cancelled);
                }
            }

            let bytes_read = line.offset + line.len;

            if let Some(change) = self.tracker.observe(&line.text) {
                if change.left_logcat {
                    let completed = self.parser.as_mut().and_then(ThreadtimeParser::end_section);
                    if let Some(row) = completed {
                        self.index_row(row)?;
                    }
                }
                self.maybe_emit(bytes_read);
                continue;
            }

            if self.tracker.is_logcat() {
                if self.parser.is_none() && self.probe.is_match(&line.text) {
                    self.init_parser();
                    self.phase = ParsePhase::Indexing;
                }
                if self.parser.is_some() {
                    self.log_bytes += line.len;
                    let completed = self
                        .parser
                        .as_mut()
                        .and_then(|parser| parser.push_line(line.offset, &line.text));
                    if let Some(row) = completed {
                        self.index_row(row)?;
                    }
                }
                if self.tracker.in_preamble() {
                    self.scanner.observe(&line.text);
                }
            } else {
                self.scanner.observe(&line.text);
            }

            self.maybe_emit(bytes_read);
        }

        let trailing = self.parser.as_mut().and_then(ThreadtimeParser::flush);
        if let Some(row) = trailing {
            self.index_row(row)?;
        }
        Ok(())
    }

    fn init_parser(&mut self) {
        let timezone = self.scanner.timezone().map(str::to_string);
        let year = self
            .scanner
            .report_time()
            .map(|time| time.year())
            .unwrap_or_else(|| chrono::Utc::now().year());
        let normalizer = TimestampNormalizer::new(timezone.as_deref(), year);
        self.parser = Some(ThreadtimeParser::new(normalizer));
    }

    fn index_row(&mut self, row: LogRow) -> Result<(), BuildError> {
        let ordinal = self.rows.append(&row)?;

        *self.level_counts.entry(row.level).or_insert(0) += 1;
        self.counts.events += 1;

        if let Some(ts) = row.ts_epoch_ms {
            self.time_index.observe(ts, ordinal);
            if self.min_ts.as_ref().map_or(true, |(min, _)| ts < *min) {
                self.min_ts = Some((ts, row.ts_raw.clone()));
            }
            if self.max_ts.as_ref().map_or(true, |(max, _)| ts > *max) {
                self.max_ts = Some((ts, row.ts_raw.clone()));
            }
        }

        self.inv_tag.observe(row.tag.as_bytes(), ordinal);
        self.inv_pid.observe(&pid_key(row.pid), ordinal);

        if row.tag == "ActivityManager" && row.msg.starts_with("ANR in ") {
            self.counts.anrs += 1;
        }
        if row.level == LogLevel::F
            || (row.tag == "AndroidRuntime" && row.msg.starts_with("FATAL EXCEPTION"))
        {
            self.counts.crashes += 1;
        }
        if matches!(row.level, LogLevel::E | LogLevel::F) {
            self.counts.ef_total += 1;
        }
        Ok(())
    }

    fn maybe_emit(&mut self, bytes_read: u64) {
        let one_percent = (self.total_bytes / 100).max(1);
        let due_time = self.last_emit.elapsed() >= self.progress_interval;
        let due_bytes = bytes_read.saturating_sub(self.last_emit_bytes) >= one_percent;
        if !due_time && !due_bytes {
            return;
        }

        self.last_emit = Instant::now();
        self.last_emit_bytes = bytes_read;
        let percent = if self.total_bytes == 0 {
            100.0
        } else {
            (bytes_read as f64 / self.total_bytes as f64 * 100.0) as f32
        };
        self.progress.send_replace(ParseProgress {
            phase: self.phase,
            bytes_read,
            total_bytes: self.total_bytes,
            rows_processed: self.rows.len(),
            percent,
        });
    }
}

fn finalize(
    state: BuildState<'_>,
    report_id: &ReportId,
    temp: &Path,
) -> Result<IndexSummary, BuildError> {
    let BuildState {
        scanner,
        parser,
        rows,
        time_index,
        inv_tag,
        inv_pid,
        log_bytes,
        level_counts,
        min_ts,
        max_ts,
        mut counts,
        ..
    } = state;

    let malformed_rows = parser.as_ref().map(|p| p.malformed()).unwrap_or(0);
    let timezone_best_effort = parser
        .as_ref()
        .map(|p| p.timezone_best_effort())
        .unwrap_or(true);
    let timezone = scanner.timezone().map(str::to_string);

    rows.finish()?;
    time_index.write(&temp.join(TIME_INDEX_FILE))?;
    inv_tag.write(&temp.join(INV_TAG_FILE))?;
    inv_pid.write(&temp.join(INV_PID_FILE))?;

    if counts.ef_total > 0 {
        if let Some((max_ts, _)) = &max_ts {
            let threshold = max_ts - EF_RECENT_WINDOW_MS;
            counts.ef_recent =
                count_recent_ef(&temp.join(ROWS_FILE), &time_index.into_index(), threshold)?;
        }
    }

    let (min_ts_epoch_ms, min_ts_display) = split_ts(min_ts);
    let (max_ts_epoch_ms, max_ts_display) = split_ts(max_ts);

    let summary = IndexSummary {
        schema_version: SCHEMA_VERSION,
        report_id: report_id.as_str().to_string(),
        log_bytes,
        total_rows: counts.events,
        malformed_rows,
        level_counts,
        min_ts_epoch_ms,
        max_ts_epoch_ms,
        min_ts_display,
        max_ts_display,
        timezone,
        timezone_best_effort,
        device: scanner.finish(),
        counts,
    };
    summary.save(&temp.join(SUMMARY_FILE))?;
    Ok(summary)
}

fn split_ts(ts: Option<(i64, String)>) -> (Option<i64>, Option<String>) {
    match ts {
        Some((epoch, display)) => (Some(epoch), Some(display)),
        None => (None, None),
    }
}

fn count_recent_ef(rows_path: &Path, index: &TimeIndex, threshold: i64) -> Result<u64, IndexError> {
    let Some(anchor) = index.first_ordinal_at_or_after(threshold) else {
        return Ok(0);
    };

    let mut reader = RowReader::open(rows_path)?;
    let mut count = 0;
    for item in reader.scan_from(anchor)? {
        let (_, record) = item?;
        let head = record.head()?;
        let Some(ts) = head.ts_epoch_ms else { continue };
        if ts >= threshold && matches!(head.level, LogLevel::E | LogLevel::F) {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_config(cache_root: &Path) -> MilkteaConfig {
        MilkteaConfig {
            cache_root: Some(cache_root.to_path_buf()),
            ..MilkteaConfig::default()
        }
    }

    fn build(path: &Path, config: &MilkteaConfig) -> Result<IndexSummary, BuildError> {
        let (tx, _rx) = watch::channel(ParseProgress::starting());
        build_index(path, config, &tx, &CancellationToken::new())
    }

    fn write_report(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("bugreport-test.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn basic_flat_log_builds_counts() {
        let dir = TempDir::new().unwrap();
        let path = write_report(
            &dir,
            "01-15 10:00:00.000  1 2 I MyTag: hello\n\
             01-15 10:00:00.001  1 2 E MyTag: boom\n\
             \u{20}   at Foo.bar(Foo.java:1)\n",
        );

        let cache = TempDir::new().unwrap();
        let summary = build(&path, &test_config(cache.path())).unwrap();

        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.level_counts.get(&LogLevel::I), Some(&1));
        assert_eq!(summary.level_counts.get(&LogLevel::E), Some(&1));
        assert_eq!(summary.counts.ef_total, 1);
        assert_eq!(summary.counts.ef_recent, 1);
        assert_eq!(summary.min_ts_display.as_deref(), Some("01-15 10:00:00.000"));
    }

    #[test]
    fn anr_and_crash_rows_are_counted() {
        let dir = TempDir::new().unwrap();
        let path = write_report(
            &dir,
            "01-15 10:00:00.000  1 2 E ActivityManager: ANR in com.example.app\n\
             01-15 10:00:01.000  1 2 E AndroidRuntime: FATAL EXCEPTION: main\n\
             01-15 10:00:02.000  1 2 F libc: Fatal signal 11\n\
             01-15 10:00:03.000  1 2 I Other: fine\n",
        );

        let cache = TempDir::new().unwrap();
        let summary = build(&path, &test_config(cache.path())).unwrap();

        assert_eq!(summary.counts.anrs, 1);
        assert_eq!(summary.counts.crashes, 2);
        assert_eq!(summary.counts.ef_total, 3);
        assert_eq!(summary.counts.events, 4);
    }

    #[test]
    fn second_build_reuses_cache() {
        let dir = TempDir::new().unwrap();
        let path = write_report(&dir, "01-15 10:00:00.000  1 2 I T: once\n");
        let cache = TempDir::new().unwrap();
        let config = test_config(cache.path());

        let first = build(&path, &config).unwrap();
        let rows_path = cache.path().join(&first.report_id).join(ROWS_FILE);
        let modified_before = std::fs::metadata(&rows_path).unwrap().modified().unwrap();

        let second = build(&path, &config).unwrap();
        assert_eq!(second.total_rows, first.total_rows);
        let modified_after = std::fs::metadata(&rows_path).unwrap().modified().unwrap();
        assert_eq!(modified_before, modified_after);
    }

    #[test]
    fn cancelled_build_leaves_no_cache() {
        let dir = TempDir::new().unwrap();
        let mut content = String::new();
        for n in 0..5000 {
            content.push_str(&format!("01-15 10:00:{:02}.000  1 2 I T: row {}\n", n % 60, n));
        }
        let path = write_report(&dir, &content);

        let cache = TempDir::new().unwrap();
        let (tx, _rx) = watch::channel(ParseProgress::starting());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = build_index(&path, &test_config(cache.path()), &tx, &cancel).unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));

        let leftovers: Vec<_> = std::fs::read_dir(cache.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_input_is_not_found() {
        let cache = TempDir::new().unwrap();
        let err = build(Path::new("/no/such/report.txt"), &test_config(cache.path())).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Reader(ReaderError::NotFound(_))
        ));
    }

    #[test]
    fn progress_reaches_one_hundred_percent() {
        let dir = TempDir::new().unwrap();
        let path = write_report(&dir, "01-15 10:00:00.000  1 2 I T: hi\n");
        let cache = TempDir::new().unwrap();

        let (tx, rx) = watch::channel(ParseProgress::starting());
        build_index(
            &path,
            &test_config(cache.path()),
            &tx,
            &CancellationToken::new(),
        )
        .unwrap();

        let last = rx.borrow();
        assert_eq!(last.phase, ParsePhase::Finalizing);
        assert!((last.percent - 100.0).abs() < f32::EPSILON);
        assert_eq!(last.rows_processed, 1);
    }
}
