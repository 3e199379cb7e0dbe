use super::Result;
use crate::logcat::LogLevel;
use crate::report::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const SUMMARY_FILE: &str = "summary.json";

/// Bump on any change to the cache artifact formats; a mismatch on read
/// forces a full rebuild.
pub const SCHEMA_VERSION: u32 = 2;

/// Aggregates derived while indexing the logcat stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedCounts {
    /// Total parsed rows.
    pub events: u64,
    /// `ActivityManager` rows whose message opens with `ANR in `.
    pub anrs: u64,
    /// Fatal rows plus `AndroidRuntime` fatal-exception reports.
    pub crashes: u64,
    /// Rows at level E or F.
    pub ef_total: u64,
    /// E/F rows within the last five minutes of the capture.
    pub ef_recent: u64,
}

/// The `summary.json` cache artifact: everything the stats endpoint and
/// the dashboard need without touching the row store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub schema_version: u32,
    pub report_id: String,
    /// Bytes of logcat section content in the logical text stream.
    pub log_bytes: u64,
    pub total_rows: u64,
    pub malformed_rows: u64,
    pub level_counts: BTreeMap<LogLevel, u64>,
    pub min_ts_epoch_ms: Option<i64>,
    pub max_ts_epoch_ms: Option<i64>,
    pub min_ts_display: Option<String>,
    pub max_ts_display: Option<String>,
    pub timezone: Option<String>,
    /// True when timestamps were resolved against UTC because the report
    /// declared no timezone.
    pub timezone_best_effort: bool,
    pub device: DeviceInfo,
    pub counts: DerivedCounts,
}

impl IndexSummary {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &json)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> IndexSummary {
        let mut level_counts = BTreeMap::new();
        level_counts.insert(LogLevel::I, 2);
        level_counts.insert(LogLevel::E, 1);
        IndexSummary {
            schema_version: SCHEMA_VERSION,
            report_id: "abc123".to_string(),
            log_bytes: 4096,
            total_rows: 3,
            malformed_rows: 1,
            level_counts,
            min_ts_epoch_ms: Some(1000),
            max_ts_epoch_ms: Some(2000),
            min_ts_display: Some("01-15 10:00:00.000".to_string()),
            max_ts_display: Some("01-15 10:00:01.000".to_string()),
            timezone: Some("America/Los_Angeles".to_string()),
            timezone_best_effort: false,
            device: DeviceInfo::default(),
            counts: DerivedCounts {
                events: 3,
                anrs: 0,
                crashes: 1,
                ef_total: 1,
                ef_recent: 1,
            },
        }
    }

    #[test]
    fn round_trips_as_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SUMMARY_FILE);

        let summary = sample();
        summary.save(&path).unwrap();
        let loaded = IndexSummary::load(&path).unwrap();

        assert_eq!(loaded.report_id, summary.report_id);
        assert_eq!(loaded.total_rows, 3);
        assert_eq!(loaded.level_counts.get(&LogLevel::E), Some(&1));
        assert_eq!(loaded.counts, summary.counts);
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"schemaVersion\""));
        assert!(json.contains("\"efRecent\""));
        assert!(json.contains("\"levelCounts\""));
        assert!(json.contains("\"E\":1"));
    }

    #[test]
    fn unparseable_summary_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SUMMARY_FILE);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(IndexSummary::load(&path).is_err());
    }
}
