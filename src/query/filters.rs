use super::QueryError;
use crate::index::store::RowHead;
use crate::logcat::timestamp::local_to_epoch_ms;
use crate::logcat::LogLevel;
use chrono::NaiveDateTime;
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Viewer filter set. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogFilters {
    /// Inclusive lower bound, `YYYY-MM-DD HH:MM:SS` in the report's
    /// local timezone.
    pub ts_from: Option<String>,
    /// Inclusive upper bound, second granularity.
    pub ts_to: Option<String>,
    pub levels: Option<Vec<LogLevel>>,
    /// Tag filter; `|` separates OR alternatives.
    pub tag: Option<String>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub text: Option<String>,
    pub not_text: Option<String>,
    pub text_mode: Option<TextMode>,
    pub case_sensitive: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    Plain,
    Regex,
}

/// Message matcher compiled once per query.
pub enum TextMatcher {
    Regex(Regex),
    Plain {
        alternatives: Vec<String>,
        case_sensitive: bool,
    },
}

impl TextMatcher {
    pub fn matches(&self, msg: &str) -> bool {
        match self {
            Self::Regex(pattern) => pattern.is_match(msg),
            Self::Plain {
                alternatives,
                case_sensitive: true,
            } => alternatives.iter().any(|alt| msg.contains(alt)),
            Self::Plain { alternatives, .. } => {
                let lowered = msg.to_lowercase();
                alternatives.iter().any(|alt| lowered.contains(alt))
            }
        }
    }
}

/// Normalised, validated filter set with its stable fingerprint.
pub struct CompiledFilters {
    pub ts_from_ms: Option<i64>,
    pub ts_to_ms: Option<i64>,
    pub levels: Option<Vec<LogLevel>>,
    /// Sorted, deduplicated tag alternatives (exact match).
    pub tags: Option<Vec<String>>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub matcher: Option<TextMatcher>,
    /// Lowercased literal; rows whose message contains it are excluded.
    pub exclude: Option<String>,
    pub fingerprint: u64,
}

impl CompiledFilters {
    pub fn compile(filters: &LogFilters, tz: Tz) -> Result<Self, QueryError> {
        let ts_from_ms = filters
            .ts_from
            .as_deref()
            .and_then(non_empty)
            .map(|raw| parse_local_ts(raw, tz))
            .transpose()?;
        let ts_to_raw = filters
            .ts_to
            .as_deref()
            .and_then(non_empty)
            .map(|raw| parse_local_ts(raw, tz))
            .transpose()?;

        if let (Some(from), Some(to)) = (ts_from_ms, ts_to_raw) {
            if from > to {
                return Err(QueryError::FilterInvalid(format!(
                    "tsFrom ({from}) is after tsTo ({to})"
                )));
            }
        }
        // The bound is inclusive at second granularity.
        let ts_to_ms = ts_to_raw.map(|to| to + 999);

        let levels = filters.levels.as_ref().and_then(|levels| {
            let mut set: Vec<LogLevel> = levels.clone();
            set.sort();
            set.dedup();
            if set.is_empty() {
                None
            } else {
                Some(set)
            }
        });

        let tags = filters.tag.as_deref().and_then(|raw| {
            let mut set: Vec<String> = raw
                .split('|')
                .map(str::trim)
                .filter(|alt| !alt.is_empty())
                .map(str::to_string)
                .collect();
            set.sort();
            set.dedup();
            if set.is_empty() {
                None
            } else {
                Some(set)
            }
        });

        let case_sensitive = filters.case_sensitive.unwrap_or(false);
        let text_mode = filters.text_mode.unwrap_or(TextMode::Plain);
        let text = filters.text.as_deref().and_then(non_empty);
        let matcher = text.and_then(|text| compile_matcher(text, text_mode, case_sensitive));

        let exclude = filters
            .not_text
            .as_deref()
            .and_then(non_empty)
            .map(str::to_lowercase);

        let fingerprint = fingerprint_of(
            ts_from_ms,
            ts_to_ms,
            levels.as_deref(),
            tags.as_deref(),
            filters.pid,
            filters.tid,
            text,
            text_mode,
            case_sensitive,
            exclude.as_deref(),
        );

        Ok(Self {
            ts_from_ms,
            ts_to_ms,
            levels,
            tags,
            pid: filters.pid,
            tid: filters.tid,
            matcher,
            exclude,
            fingerprint,
        })
    }

    /// True when every row matches and stats can come straight from the
    /// summary artifact.
    pub fn is_unfiltered(&self) -> bool {
        self.ts_from_ms.is_none()
            && self.ts_to_ms.is_none()
            && self.levels.is_none()
            && self.tags.is_none()
            && self.pid.is_none()
            && self.tid.is_none()
            && self.matcher.is_none()
            && self.exclude.is_none()
    }

    /// True when matching requires the message bytes.
    pub fn needs_msg(&self) -> bool {
        self.matcher.is_some() || self.exclude.is_some()
    }

    /// Predicate over the cheap head fields.
    pub fn matches_head(&self, head: &RowHead) -> bool {
        if let Some(levels) = &self.levels {
            if !levels.contains(&head.level) {
                return false;
            }
        }
        if let Some(pid) = self.pid {
            if head.pid != pid {
                return false;
            }
        }
        if let Some(tid) = self.tid {
            if head.tid != tid {
                return false;
            }
        }
        if let Some(from) = self.ts_from_ms {
            match head.ts_epoch_ms {
                Some(ts) if ts >= from => {}
                _ => return false,
            }
        }
        if let Some(to) = self.ts_to_ms {
            match head.ts_epoch_ms {
                Some(ts) if ts <= to => {}
                _ => return false,
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().any(|tag| tag == &head.tag) {
                return false;
            }
        }
        true
    }

    /// Predicate over the message. Apply after `matches_head`.
    pub fn matches_msg(&self, msg: &str) -> bool {
        if let Some(matcher) = &self.matcher {
            if !matcher.matches(msg) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if msg.to_lowercase().contains(exclude.as_str()) {
                return false;
            }
        }
        true
    }
}

fn non_empty(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_local_ts(raw: &str, tz: Tz) -> Result<i64, QueryError> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.3f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| QueryError::FilterInvalid(format!("unparseable timestamp: {raw}")))?;
    local_to_epoch_ms(tz, naive)
        .ok_or_else(|| QueryError::FilterInvalid(format!("unrepresentable local time: {raw}")))
}

fn compile_matcher(text: &str, mode: TextMode, case_sensitive: bool) -> Option<TextMatcher> {
    if let TextMode::Regex = mode {
        let pattern = if case_sensitive {
            text.to_string()
        } else {
            format!("(?i){text}")
        };
        match Regex::new(&pattern) {
            Ok(regex) => return Some(TextMatcher::Regex(regex)),
            Err(err) => {
                // Unparseable patterns degrade to a literal search
                // instead of failing the query.
                tracing::debug!(error = %err, "regex filter fell back to plain text");
            }
        }
    }

    let alternatives: Vec<String> = text
        .split('|')
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .map(|alt| {
            if case_sensitive {
                alt.to_string()
            } else {
                alt.to_lowercase()
            }
        })
        .collect();
    if alternatives.is_empty() {
        None
    } else {
        Some(TextMatcher::Plain {
            alternatives,
            case_sensitive,
        })
    }
}

/// Stable digest of the canonical filter encoding. Cursor validity
/// hinges on this staying identical for logically identical filters.
#[allow(clippy::too_many_arguments)]
fn fingerprint_of(
    ts_from_ms: Option<i64>,
    ts_to_ms: Option<i64>,
    levels: Option<&[LogLevel]>,
    tags: Option<&[String]>,
    pid: Option<u32>,
    tid: Option<u32>,
    text: Option<&str>,
    text_mode: TextMode,
    case_sensitive: bool,
    exclude: Option<&str>,
) -> u64 {
    let mut canonical = String::new();
    if let Some(from) = ts_from_ms {
        canonical.push_str(&format!("from={from};"));
    }
    if let Some(to) = ts_to_ms {
        canonical.push_str(&format!("to={to};"));
    }
    if let Some(levels) = levels {
        canonical.push_str("levels=");
        for level in levels {
            canonical.push(level.as_char());
        }
        canonical.push(';');
    }
    if let Some(tags) = tags {
        canonical.push_str(&format!("tag={};", tags.join("|")));
    }
    if let Some(pid) = pid {
        canonical.push_str(&format!("pid={pid};"));
    }
    if let Some(tid) = tid {
        canonical.push_str(&format!("tid={tid};"));
    }
    if let Some(text) = text {
        let mode = match text_mode {
            TextMode::Plain => "plain",
            TextMode::Regex => "regex",
        };
        let text = if case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };
        canonical.push_str(&format!("text={mode}:{case_sensitive}:{text};"));
    }
    if let Some(exclude) = exclude {
        canonical.push_str(&format!("not={exclude};"));
    }
    xxh64(canonical.as_bytes(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(filters: &LogFilters) -> CompiledFilters {
        CompiledFilters::compile(filters, Tz::UTC).unwrap()
    }

    fn head(level: LogLevel, tag: &str, pid: u32, ts: Option<i64>) -> RowHead {
        RowHead {
            byte_offset: 0,
            ts_epoch_ms: ts,
            level,
            pid,
            tid: 1,
            ts_raw: "01-15 10:00:00.000".to_string(),
            tag: tag.to_string(),
        }
    }

    #[test]
    fn empty_filters_match_everything() {
        let compiled = compile(&LogFilters::default());
        assert!(compiled.is_unfiltered());
        assert!(compiled.matches_head(&head(LogLevel::V, "Any", 1, None)));
        assert!(compiled.matches_msg("anything at all"));
    }

    #[test]
    fn level_set_filters() {
        let compiled = compile(&LogFilters {
            levels: Some(vec![LogLevel::E, LogLevel::F]),
            ..LogFilters::default()
        });
        assert!(compiled.matches_head(&head(LogLevel::E, "T", 1, None)));
        assert!(!compiled.matches_head(&head(LogLevel::I, "T", 1, None)));
    }

    #[test]
    fn tag_alternation_is_exact_or() {
        let compiled = compile(&LogFilters {
            tag: Some("A|C".to_string()),
            ..LogFilters::default()
        });
        assert!(compiled.matches_head(&head(LogLevel::I, "A", 1, None)));
        assert!(compiled.matches_head(&head(LogLevel::I, "C", 1, None)));
        assert!(!compiled.matches_head(&head(LogLevel::I, "B", 1, None)));
        assert!(!compiled.matches_head(&head(LogLevel::I, "AB", 1, None)));
    }

    #[test]
    fn plain_text_pipe_is_a_disjunction() {
        let compiled = compile(&LogFilters {
            text: Some("boom|crash".to_string()),
            ..LogFilters::default()
        });
        assert!(compiled.matches_msg("it went BOOM today"));
        assert!(compiled.matches_msg("crash landing"));
        assert!(!compiled.matches_msg("all fine"));
    }

    #[test]
    fn case_sensitive_plain_text() {
        let compiled = compile(&LogFilters {
            text: Some("Boom".to_string()),
            case_sensitive: Some(true),
            ..LogFilters::default()
        });
        assert!(compiled.matches_msg("Boom happened"));
        assert!(!compiled.matches_msg("boom happened"));
    }

    #[test]
    fn regex_mode_compiles() {
        let compiled = compile(&LogFilters {
            text: Some(r"code \d{3}".to_string()),
            text_mode: Some(TextMode::Regex),
            ..LogFilters::default()
        });
        assert!(compiled.matches_msg("error Code 404 returned"));
        assert!(!compiled.matches_msg("error code x"));
    }

    #[test]
    fn invalid_regex_degrades_to_plain() {
        let compiled = compile(&LogFilters {
            text: Some("[unclosed".to_string()),
            text_mode: Some(TextMode::Regex),
            ..LogFilters::default()
        });
        assert!(compiled.matches_msg("saw [unclosed bracket"));
        assert!(!compiled.matches_msg("nothing here"));
    }

    #[test]
    fn not_text_excludes() {
        let compiled = compile(&LogFilters {
            not_text: Some("Chatty".to_string()),
            ..LogFilters::default()
        });
        assert!(!compiled.matches_msg("chatty uid=1000 expire"));
        assert!(compiled.matches_msg("quiet line"));
    }

    #[test]
    fn ts_bounds_are_inclusive() {
        let compiled = compile(&LogFilters {
            ts_from: Some("2024-01-15 10:00:00".to_string()),
            ts_to: Some("2024-01-15 10:00:01".to_string()),
            ..LogFilters::default()
        });
        let from = compiled.ts_from_ms.unwrap();
        assert!(compiled.matches_head(&head(LogLevel::I, "T", 1, Some(from))));
        assert!(compiled.matches_head(&head(LogLevel::I, "T", 1, Some(from + 1999))));
        assert!(!compiled.matches_head(&head(LogLevel::I, "T", 1, Some(from + 2000))));
        assert!(!compiled.matches_head(&head(LogLevel::I, "T", 1, Some(from - 1))));
        // Rows without a normalised timestamp cannot satisfy a bound.
        assert!(!compiled.matches_head(&head(LogLevel::I, "T", 1, None)));
    }

    #[test]
    fn inverted_range_is_invalid() {
        let result = CompiledFilters::compile(
            &LogFilters {
                ts_from: Some("2024-01-15 11:00:00".to_string()),
                ts_to: Some("2024-01-15 10:00:00".to_string()),
                ..LogFilters::default()
            },
            Tz::UTC,
        );
        assert!(matches!(result, Err(QueryError::FilterInvalid(_))));
    }

    #[test]
    fn garbage_timestamp_is_invalid() {
        let result = CompiledFilters::compile(
            &LogFilters {
                ts_from: Some("yesterday".to_string()),
                ..LogFilters::default()
            },
            Tz::UTC,
        );
        assert!(matches!(result, Err(QueryError::FilterInvalid(_))));
    }

    #[test]
    fn fingerprint_is_order_insensitive() {
        let a = compile(&LogFilters {
            tag: Some("B|A".to_string()),
            levels: Some(vec![LogLevel::E, LogLevel::W]),
            ..LogFilters::default()
        });
        let b = compile(&LogFilters {
            tag: Some("A|B".to_string()),
            levels: Some(vec![LogLevel::W, LogLevel::E]),
            ..LogFilters::default()
        });
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn fingerprint_differs_across_filters() {
        let a = compile(&LogFilters {
            tag: Some("X".to_string()),
            ..LogFilters::default()
        });
        let b = compile(&LogFilters {
            tag: Some("Y".to_string()),
            ..LogFilters::default()
        });
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, compile(&LogFilters::default()).fingerprint);
    }

    #[test]
    fn blank_strings_are_absent() {
        let compiled = compile(&LogFilters {
            tag: Some("  ".to_string()),
            text: Some("".to_string()),
            not_text: Some("  ".to_string()),
            ..LogFilters::default()
        });
        assert!(compiled.is_unfiltered());
        assert_eq!(
            compiled.fingerprint,
            compile(&LogFilters::default()).fingerprint
        );
    }
}
