#![allow(dead_code)]

use milktea::config::MilkteaConfig;
use milktea::{BugreportService, CommandError, ParseSummary};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn test_config(cache_root: &Path) -> MilkteaConfig {
    MilkteaConfig {
        cache_root: Some(cache_root.to_path_buf()),
        ..MilkteaConfig::default()
    }
}

pub fn service(cache_root: &Path) -> BugreportService {
    BugreportService::new(test_config(cache_root))
}

pub async fn load(
    service: &BugreportService,
    path: &Path,
) -> Result<ParseSummary, CommandError> {
    service.parse_bugreport_streaming(path).wait().await
}

pub fn write_report(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// A threadtime line at second-granularity time on Jan 15.
pub fn log_line(hh: u32, mm: u32, ss: u32, pid: u32, level: char, tag: &str, msg: &str) -> String {
    format!("01-15 {hh:02}:{mm:02}:{ss:02}.000 {pid:5} {pid:5} {level} {tag}: {msg}\n")
}

/// `count` one-second-cadence rows starting at 10:00:00.
pub fn ticker_log(count: u32) -> String {
    let mut out = String::new();
    for n in 0..count {
        let secs = 10 * 3600 + n;
        let _ = write!(
            out,
            "01-15 {:02}:{:02}:{:02}.000   100   100 I Ticker: tick {n}\n",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
    }
    out
}

/// A realistic multi-section bugreport with a device preamble, two
/// logcat buffers, and a non-logcat dump in between.
pub fn full_bugreport(system_rows: &str, events_rows: &str) -> String {
    let mut out = String::new();
    out.push_str("========================================================\n");
    out.push_str("== dumpstate: 2024-01-15 12:00:00\n");
    out.push_str("========================================================\n");
    out.push_str("Build: UQ1A.240105.004\n");
    out.push_str(
        "Build fingerprint: 'google/panther/panther:14/UQ1A.240105.004/11206848:user/release-keys'\n",
    );
    out.push_str("Uptime: up 2 days, 1 hour, 2 minutes\n");
    out.push_str("------ SYSTEM PROPERTIES (getprop) ------\n");
    out.push_str("[ro.product.brand]: [google]\n");
    out.push_str("[ro.product.model]: [Pixel 7]\n");
    out.push_str("[ro.build.version.release]: [14]\n");
    out.push_str("[ro.build.version.sdk]: [34]\n");
    out.push_str("[ro.build.id]: [UQ1A.240105.004]\n");
    out.push_str("[persist.sys.timezone]: [America/Los_Angeles]\n");
    out.push_str("------ SYSTEM LOG (logcat -v threadtime -v printable -d *:v) ------\n");
    out.push_str(system_rows);
    out.push_str("------ 0.108s was the duration of 'SYSTEM LOG' ------\n");
    out.push_str("------ DUMPSYS (dumpsys) ------\n");
    out.push_str("DUMP OF SERVICE battery:\n");
    out.push_str("  level: 85\n");
    out.push_str("  temperature: 250\n");
    out.push_str("  status: 2\n");
    out.push_str("DUMP OF SERVICE meminfo:\n");
    out.push_str("  01-15 99:99:99.999 not a log line either\n");
    out.push_str("------ EVENT LOG (logcat -b events -v threadtime -d *:v) ------\n");
    out.push_str(events_rows);
    out.push_str("------ 0.042s was the duration of 'EVENT LOG' ------\n");
    out
}
