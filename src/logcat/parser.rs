use super::timestamp::TimestampNormalizer;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Soft cap on a single row's message, continuation lines included.
pub const MAX_MSG_BYTES: usize = 64 * 1024;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LogLevel {
    V,
    D,
    I,
    W,
    E,
    F,
}

impl LogLevel {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'V' => Some(Self::V),
            'D' => Some(Self::D),
            'I' => Some(Self::I),
            'W' => Some(Self::W),
            'E' => Some(Self::E),
            'F' => Some(Self::F),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::V => 'V',
            Self::D => 'D',
            Self::I => 'I',
            Self::W => 'W',
            Self::E => 'E',
            Self::F => 'F',
        }
    }

    pub const ALL: [LogLevel; 6] = [Self::V, Self::D, Self::I, Self::W, Self::E, Self::F];
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                Self::from_char(c.to_ascii_uppercase()).ok_or_else(|| format!("unknown level: {s}"))
            }
            _ => Err(format!("unknown level: {s}")),
        }
    }
}

/// One parsed threadtime line, continuations folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    /// Offset of the line start in the logical text stream; strictly
    /// increasing and used as the row's primary key.
    pub byte_offset: u64,
    /// Original `MM-DD HH:MM:SS.mmm` text.
    pub ts_raw: String,
    /// Normalised UTC milliseconds; `None` when normalisation failed.
    pub ts_epoch_ms: Option<i64>,
    pub level: LogLevel,
    pub tag: String,
    pub pid: u32,
    pub tid: u32,
    pub msg: String,
}

/// Streaming threadtime parser. Feed lines in file order; a completed
/// row is returned once its continuation run ends.
///
/// Per-line failures are absorbed into counters and never raised.
pub struct ThreadtimeParser {
    pattern: Regex,
    normalizer: TimestampNormalizer,
    pending: Option<LogRow>,
    malformed: u64,
    orphaned: u64,
}

/// The level position accepts any uppercase letter so that lines with a
/// non-canonical level are counted as malformed instead of being folded
/// into the previous row as continuations.
pub(crate) fn threadtime_regex() -> Regex {
    Regex::new(
        r"^(?P<month>\d{2})-(?P<day>\d{2})\s+(?P<hour>\d{2}):(?P<min>\d{2}):(?P<sec>\d{2})\.(?P<ms>\d{3})\s+(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<level>[A-Z])\s+(?P<tag>.+?):\s(?P<msg>.*)$",
    )
    .expect("threadtime pattern")
}

impl ThreadtimeParser {
    pub fn new(normalizer: TimestampNormalizer) -> Self {
        let pattern = threadtime_regex();

        Self {
            pattern,
            normalizer,
            pending: None,
            malformed: 0,
            orphaned: 0,
        }
    }

    /// Rows dropped for a bad level or pid/tid overflow.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Continuation lines that arrived before any matched row.
    pub fn orphaned(&self) -> u64 {
        self.orphaned
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.normalizer.timezone()
    }

    pub fn timezone_best_effort(&self) -> bool {
        self.normalizer.best_effort()
    }

    /// Feeds one line; returns the previous row when this line completes
    /// it (a new match arrived).
    pub fn push_line(&mut self, offset: u64, line: &str) -> Option<LogRow> {
        if line.trim().is_empty() {
            // Blank lines neither match nor break continuation.
            return None;
        }

        let Some(caps) = self.pattern.captures(line) else {
            return self.push_continuation(line);
        };

        let level_char = caps["level"].chars().next().unwrap_or('?');
        let Some(level) = LogLevel::from_char(level_char) else {
            self.malformed += 1;
            return None;
        };

        // The grammar caps pid/tid at i32::MAX; larger values are noise.
        let (Ok(pid), Ok(tid)) = (parse_id(&caps["pid"]), parse_id(&caps["tid"])) else {
            self.malformed += 1;
            return None;
        };

        let tag = caps["tag"].trim();
        if tag.is_empty() {
            self.malformed += 1;
            return None;
        }

        let month = digits(&caps["month"]);
        let day = digits(&caps["day"]);
        let ts_raw = format!(
            "{:02}-{:02} {}:{}:{}.{}",
            month, day, &caps["hour"], &caps["min"], &caps["sec"], &caps["ms"]
        );
        let ts_epoch_ms = self.normalizer.normalize(
            month,
            day,
            digits(&caps["hour"]),
            digits(&caps["min"]),
            digits(&caps["sec"]),
            digits(&caps["ms"]),
        );

        let row = LogRow {
            byte_offset: offset,
            ts_raw,
            ts_epoch_ms,
            level,
            tag: tag.to_string(),
            pid,
            tid,
            msg: caps["msg"].to_string(),
        };

        self.pending.replace(row)
    }

    fn push_continuation(&mut self, line: &str) -> Option<LogRow> {
        let Some(pending) = self.pending.as_mut() else {
            self.orphaned += 1;
            return None;
        };

        let budget = MAX_MSG_BYTES.saturating_sub(pending.msg.len());
        if budget <= 1 {
            return None;
        }
        pending.msg.push('\n');
        let take = floor_char_boundary(line, budget - 1);
        pending.msg.push_str(&line[..take]);
        None
    }

    /// Emits the trailing row, if any. Call at end of input.
    pub fn flush(&mut self) -> Option<LogRow> {
        self.pending.take()
    }

    /// Flushes and resets per-section timestamp state. Call at section
    /// boundaries.
    pub fn end_section(&mut self) -> Option<LogRow> {
        let row = self.pending.take();
        self.normalizer.reset_section();
        row
    }
}

fn parse_id(s: &str) -> Result<u32, ()> {
    match s.parse::<u32>() {
        Ok(value) if value <= i32::MAX as u32 => Ok(value),
        _ => Err(()),
    }
}

fn digits(s: &str) -> u32 {
    // Capture groups are all-digit by construction.
    s.parse().unwrap_or(0)
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
