use super::cursor::{Direction, QueryCursor};
use super::filters::{CompiledFilters, LogFilters};
use super::QueryError;
use crate::index::cache::ReportCache;
use crate::index::store::RawRecord;
use crate::index::time_index::BUCKET_MS;
use crate::logcat::timestamp::local_to_epoch_ms;
use crate::logcat::{LogLevel, LogRow};
use crate::report::identity::ReportId;
use chrono::{NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const MAX_PAGE_LIMIT: u32 = 1000;

/// One row of a query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRow {
    pub ordinal: u64,
    pub byte_offset: u64,
    pub ts_raw: String,
    pub ts_epoch_ms: Option<i64>,
    pub level: LogLevel,
    pub tag: String,
    pub pid: u32,
    pub tid: u32,
    pub msg: String,
}

impl QueryRow {
    fn new(ordinal: u64, row: LogRow) -> Self {
        Self {
            ordinal,
            byte_offset: row.byte_offset,
            ts_raw: row.ts_raw,
            ts_epoch_ms: row.ts_epoch_ms,
            level: row.level,
            tag: row.tag,
            pid: row.pid,
            tid: row.tid,
            msg: row.msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Always ascending by byte offset, regardless of direction.
    pub rows: Vec<QueryRow>,
    pub next_cursor: Option<QueryCursor>,
    pub prev_cursor: Option<QueryCursor>,
    pub has_more_next: bool,
    pub has_more_prev: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_total: Option<u64>,
    pub position_ratio: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogcatStats {
    pub total_rows: u64,
    pub level_counts: BTreeMap<LogLevel, u64>,
    pub min_ts_epoch_ms: Option<i64>,
    pub max_ts_epoch_ms: Option<i64>,
    pub min_ts_display: Option<String>,
    pub max_ts_display: Option<String>,
    pub log_bytes: u64,
    pub filtered: bool,
}

/// Candidate ordinals after filter planning.
///
/// `Exact` lists come from non-sampled postings and are authoritative
/// for the indexed fields; the full predicate still runs per row.
/// `Range` covers everything else; sampled postings only tighten the
/// lower bound (a sampled list always retains each key's first
/// occurrence).
enum Candidates {
    Exact(Vec<u64>),
    Range { lo: u64, hi: u64 },
}

impl Candidates {
    fn lower_bound(&self) -> Option<u64> {
        match self {
            Self::Exact(list) => list.first().copied(),
            Self::Range { lo, .. } => Some(*lo),
        }
    }
}

/// Read-only query engine over one committed report cache.
pub struct QueryExecutor {
    cache: ReportCache,
    tz: Tz,
}

impl QueryExecutor {
    pub fn open(dir: &Path, expected: &ReportId) -> Result<Self, QueryError> {
        let cache = ReportCache::open(dir, expected)?;
        let tz = cache
            .summary
            .timezone
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(Tz::UTC);
        Ok(Self { cache, tz })
    }

    pub fn summary(&self) -> &crate::index::IndexSummary {
        &self.cache.summary
    }

    /// Unfiltered stats come straight from the summary artifact;
    /// filtered stats scan candidate ordinals, decoding messages only
    /// when a text filter requires them.
    pub fn stats(&mut self, filters: &LogFilters) -> Result<LogcatStats, QueryError> {
        let compiled = CompiledFilters::compile(filters, self.tz)?;
        let summary = &self.cache.summary;
        if compiled.is_unfiltered() {
            return Ok(LogcatStats {
                total_rows: summary.total_rows,
                level_counts: summary.level_counts.clone(),
                min_ts_epoch_ms: summary.min_ts_epoch_ms,
                max_ts_epoch_ms: summary.max_ts_epoch_ms,
                min_ts_display: summary.min_ts_display.clone(),
                max_ts_display: summary.max_ts_display.clone(),
                log_bytes: summary.log_bytes,
                filtered: false,
            });
        }
        let log_bytes = summary.log_bytes;

        let mut total = 0u64;
        let mut level_counts: BTreeMap<LogLevel, u64> = BTreeMap::new();
        let mut min_ts: Option<(i64, String)> = None;
        let mut max_ts: Option<(i64, String)> = None;

        self.for_each_match(&compiled, |_, row| {
            total += 1;
            *level_counts.entry(row.level).or_insert(0) += 1;
            if let Some(ts) = row.ts_epoch_ms {
                if min_ts.as_ref().map_or(true, |(min, _)| ts < *min) {
                    min_ts = Some((ts, row.ts_raw.clone()));
                }
                if max_ts.as_ref().map_or(true, |(max, _)| ts > *max) {
                    max_ts = Some((ts, row.ts_raw.clone()));
                }
            }
        })?;

        let (min_ts_epoch_ms, min_ts_display) = match min_ts {
            Some((ts, display)) => (Some(ts), Some(display)),
            None => (None, None),
        };
        let (max_ts_epoch_ms, max_ts_display) = match max_ts {
            Some((ts, display)) => (Some(ts), Some(display)),
            None => (None, None),
        };

        Ok(LogcatStats {
            total_rows: total,
            level_counts,
            min_ts_epoch_ms,
            max_ts_epoch_ms,
            min_ts_display,
            max_ts_display,
            log_bytes,
            filtered: true,
        })
    }

    /// Cursor-paginated page query.
    pub fn query(
        &mut self,
        filters: &LogFilters,
        cursor: Option<QueryCursor>,
        limit: u32,
        direction: Direction,
    ) -> Result<QueryResponse, QueryError> {
        let compiled = CompiledFilters::compile(filters, self.tz)?;
        let total = self.cache.rows.len();
        if let Some(cursor) = &cursor {
            cursor.validate(compiled.fingerprint, direction, total)?;
        }
        let limit = limit.clamp(1, MAX_PAGE_LIMIT) as usize;
        let plan = self.plan(&compiled);

        let (matched, has_more_in_direction) = match direction {
            Direction::Forward => {
                let start = cursor.map(|c| c.position).unwrap_or(0);
                self.collect_forward(&compiled, &plan, start, limit)?
            }
            Direction::Backward => {
                let end = cursor.map(|c| c.position).unwrap_or(total);
                self.collect_backward(&compiled, &plan, end, limit)?
            }
        };

        let fingerprint = compiled.fingerprint;
        let plan_lo = plan.lower_bound().unwrap_or(total);
        let estimated_total = if compiled.is_unfiltered() {
            Some(total)
        } else if let Candidates::Exact(list) = &plan {
            Some(list.len() as u64)
        } else {
            None
        };

        let first = matched.first().map(|(ordinal, _)| *ordinal);
        let last = matched.last().map(|(ordinal, _)| *ordinal);

        let (has_more_next, has_more_prev) = match direction {
            Direction::Forward => {
                let anchor = first.unwrap_or_else(|| cursor.map(|c| c.position).unwrap_or(0));
                (has_more_in_direction, anchor > plan_lo)
            }
            Direction::Backward => {
                // The row at the cursor boundary belonged to the page
                // this cursor was minted from, so something follows.
                let has_next = cursor.map(|c| c.position < total).unwrap_or(false);
                (has_next, has_more_in_direction)
            }
        };

        let next_position = last.map(|l| l + 1).or_else(|| cursor.map(|c| c.position));
        let next_cursor = match (has_more_next, next_position) {
            (true, Some(position)) => Some(QueryCursor {
                position,
                direction: Direction::Forward,
                filter_hash: fingerprint,
            }),
            _ => None,
        };
        let prev_position = first.or_else(|| cursor.map(|c| c.position));
        let prev_cursor = match (has_more_prev, prev_position) {
            (true, Some(position)) => Some(QueryCursor {
                position,
                direction: Direction::Backward,
                filter_hash: fingerprint,
            }),
            _ => None,
        };

        let position_ratio = match first {
            Some(ordinal) if total > 0 => (ordinal as f64 / total as f64) as f32,
            _ => 0.0,
        };

        Ok(QueryResponse {
            rows: matched
                .into_iter()
                .map(|(ordinal, row)| QueryRow::new(ordinal, row))
                .collect(),
            next_cursor,
            prev_cursor,
            has_more_next,
            has_more_prev,
            estimated_total,
            position_ratio,
        })
    }

    /// Anchors at the first record with `ts >= target`, then pages
    /// forward from there. The returned cursors let the caller continue
    /// in either direction from the anchor.
    pub fn jump_to_time(
        &mut self,
        filters: &LogFilters,
        target_time: &str,
        limit: u32,
    ) -> Result<QueryResponse, QueryError> {
        let compiled = CompiledFilters::compile(filters, self.tz)?;
        let target_ms = self.parse_target_time(target_time)?;
        let anchor = self.anchor_at_or_after(target_ms)?;

        let cursor = QueryCursor {
            position: anchor,
            direction: Direction::Forward,
            filter_hash: compiled.fingerprint,
        };
        self.query(filters, Some(cursor), limit, Direction::Forward)
    }

    /// Accepts `YYYY-MM-DD HH:MM:SS[.mmm]`, or a bare `HH:MM:SS`
    /// resolved against the report's first day.
    fn parse_target_time(&self, raw: &str) -> Result<i64, QueryError> {
        let raw = raw.trim();
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.3f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
            .or_else(|_| self.time_on_first_day(raw))
            .map_err(|_| {
                QueryError::FilterInvalid(format!("unparseable target time: {raw}"))
            })?;
        local_to_epoch_ms(self.tz, naive)
            .ok_or_else(|| QueryError::FilterInvalid(format!("unrepresentable target time: {raw}")))
    }

    fn time_on_first_day(&self, raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        let time = NaiveTime::parse_from_str(raw, "%H:%M:%S%.3f")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))?;
        let date = self
            .cache
            .summary
            .min_ts_epoch_ms
            .and_then(|ms| self.tz.timestamp_millis_opt(ms).single())
            .map(|dt| dt.date_naive())
            .unwrap_or_else(|| chrono::Utc::now().date_naive());
        Ok(date.and_time(time))
    }

    /// First ordinal whose timestamp reaches `target_ms`, refined from
    /// the bucket-granular time index by scanning row heads.
    fn anchor_at_or_after(&mut self, target_ms: i64) -> Result<u64, QueryError> {
        let total = self.cache.rows.len();
        let Some(bucket_anchor) = self.cache.time_index.first_ordinal_at_or_after(target_ms)
        else {
            return Ok(total);
        };

        // Only the anchor's own bucket needs refinement; the next bucket
        // transition bounds the scan.
        let scan_limit = self
            .cache
            .time_index
            .first_ordinal_at_or_after(target_ms + BUCKET_MS)
            .unwrap_or(total);

        for item in self.cache.rows.scan_from(bucket_anchor)? {
            let (ordinal, record) = item?;
            if ordinal >= scan_limit {
                break;
            }
            if let Some(ts) = record.head()?.ts_epoch_ms {
                if ts >= target_ms {
                    return Ok(ordinal);
                }
            }
        }
        Ok(scan_limit)
    }

    /// Filter planning (time-index seek, postings intersection).
    fn plan(&self, filters: &CompiledFilters) -> Candidates {
        let total = self.cache.rows.len();
        let mut lo = 0u64;

        if let Some(from) = filters.ts_from_ms {
            lo = self
                .cache
                .time_index
                .first_ordinal_at_or_after(from)
                .unwrap_or(total);
        }

        let mut exact: Option<Vec<u64>> = None;

        if let Some(tags) = &filters.tags {
            let mut union: Vec<u64> = Vec::new();
            for tag in tags {
                if let Some(list) = self.cache.inv_tag.get(tag.as_bytes()) {
                    union.extend_from_slice(list);
                }
            }
            union.sort_unstable();
            union.dedup();
            // Keys are never dropped by sampling, so an empty union is
            // authoritative even for a sampled index.
            if union.is_empty() {
                return Candidates::Exact(Vec::new());
            }
            if self.cache.inv_tag.is_sampled() {
                // A sampled list still holds each key's first occurrence.
                lo = lo.max(union[0]);
            } else {
                exact = Some(union);
            }
        }

        if let Some(pid) = filters.pid {
            let key = crate::index::postings::pid_key(pid);
            match self.cache.inv_pid.get(&key) {
                Some(list) if !self.cache.inv_pid.is_sampled() => {
                    exact = Some(match exact {
                        Some(existing) => intersect_sorted(&existing, list),
                        None => list.to_vec(),
                    });
                }
                Some(list) => {
                    if let Some(&first) = list.first() {
                        lo = lo.max(first);
                    }
                }
                None => return Candidates::Exact(Vec::new()),
            }
        }

        match exact {
            Some(mut list) => {
                let cut = list.partition_point(|&ordinal| ordinal < lo);
                list.drain(..cut);
                Candidates::Exact(list)
            }
            None => Candidates::Range { lo, hi: total },
        }
    }

    /// Applies the full predicate to one record, decoding the message
    /// only when the head fields pass and a text filter needs it.
    fn match_record(
        filters: &CompiledFilters,
        record: RawRecord,
    ) -> Result<Option<LogRow>, QueryError> {
        let head = record.head()?;
        if !filters.matches_head(&head) {
            return Ok(None);
        }
        let row = record.into_row()?;
        if !filters.matches_msg(&row.msg) {
            return Ok(None);
        }
        Ok(Some(row))
    }

    /// Collects up to `limit` matches at or after `start`, plus a peek
    /// that answers "is there more".
    fn collect_forward(
        &mut self,
        filters: &CompiledFilters,
        plan: &Candidates,
        start: u64,
        limit: usize,
    ) -> Result<(Vec<(u64, LogRow)>, bool), QueryError> {
        let mut matched: Vec<(u64, LogRow)> = Vec::with_capacity(limit.min(256));

        match plan {
            Candidates::Exact(list) => {
                let begin = list.partition_point(|&ordinal| ordinal < start);
                for &ordinal in &list[begin..] {
                    let record = self.cache.rows.record(ordinal)?;
                    if let Some(row) = Self::match_record(filters, record)? {
                        if matched.len() == limit {
                            return Ok((matched, true));
                        }
                        matched.push((ordinal, row));
                    }
                }
            }
            Candidates::Range { lo, hi } => {
                let from = start.max(*lo);
                for item in self.cache.rows.scan_from(from)? {
                    let (ordinal, record) = item?;
                    if ordinal >= *hi {
                        break;
                    }
                    if let Some(row) = Self::match_record(filters, record)? {
                        if matched.len() == limit {
                            return Ok((matched, true));
                        }
                        matched.push((ordinal, row));
                    }
                }
            }
        }
        Ok((matched, false))
    }

    /// Collects up to `limit` matches strictly before `end`, walking
    /// backward; the batch is returned in ascending order.
    fn collect_backward(
        &mut self,
        filters: &CompiledFilters,
        plan: &Candidates,
        end: u64,
        limit: usize,
    ) -> Result<(Vec<(u64, LogRow)>, bool), QueryError> {
        let mut matched: Vec<(u64, LogRow)> = Vec::with_capacity(limit.min(256));
        let mut has_more = false;

        match plan {
            Candidates::Exact(list) => {
                let stop = list.partition_point(|&ordinal| ordinal < end);
                for &ordinal in list[..stop].iter().rev() {
                    let record = self.cache.rows.record(ordinal)?;
                    if let Some(row) = Self::match_record(filters, record)? {
                        if matched.len() == limit {
                            has_more = true;
                            break;
                        }
                        matched.push((ordinal, row));
                    }
                }
            }
            Candidates::Range { lo, hi } => {
                let mut ordinal = end.min(*hi);
                while ordinal > *lo {
                    ordinal -= 1;
                    let record = self.cache.rows.record(ordinal)?;
                    if let Some(row) = Self::match_record(filters, record)? {
                        if matched.len() == limit {
                            has_more = true;
                            break;
                        }
                        matched.push((ordinal, row));
                    }
                }
            }
        }

        matched.reverse();
        Ok((matched, has_more))
    }

    /// Runs `visit` over every match in ascending order; messages are
    /// decoded only when the predicate needs them.
    fn for_each_match(
        &mut self,
        filters: &CompiledFilters,
        mut visit: impl FnMut(u64, &StatsRow),
    ) -> Result<(), QueryError> {
        let plan = self.plan(filters);
        let needs_msg = filters.needs_msg();

        let mut handle = |ordinal: u64, record: RawRecord| -> Result<(), QueryError> {
            let head = record.head()?;
            if !filters.matches_head(&head) {
                return Ok(());
            }
            if needs_msg {
                let row = record.into_row()?;
                if filters.matches_msg(&row.msg) {
                    visit(ordinal, &StatsRow::from_row(row));
                }
            } else {
                visit(ordinal, &StatsRow::from_head(head));
            }
            Ok(())
        };

        match plan {
            Candidates::Exact(list) => {
                for ordinal in list {
                    let record = self.cache.rows.record(ordinal)?;
                    handle(ordinal, record)?;
                }
            }
            Candidates::Range { lo, hi } => {
                for item in self.cache.rows.scan_from(lo)? {
                    let (ordinal, record) = item?;
                    if ordinal >= hi {
                        break;
                    }
                    handle(ordinal, record)?;
                }
            }
        }
        Ok(())
    }
}

/// Stats scanning view over a match: head fields always present, the
/// message only when it had to be decoded.
pub struct StatsRow {
    pub level: LogLevel,
    pub ts_epoch_ms: Option<i64>,
    pub ts_raw: String,
}

impl StatsRow {
    fn from_head(head: crate::index::store::RowHead) -> Self {
        Self {
            level: head.level,
            ts_epoch_ms: head.ts_epoch_ms,
            ts_raw: head.ts_raw,
        }
    }

    fn from_row(row: LogRow) -> Self {
        Self {
            level: row.level,
            ts_epoch_ms: row.ts_epoch_ms,
            ts_raw: row.ts_raw,
        }
    }
}

fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}
