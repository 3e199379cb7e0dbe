use chrono::{LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

/// Resolves `MM-DD HH:MM:SS.mmm` logcat timestamps to UTC epoch
/// milliseconds.
///
/// Logcat lines carry no year. The initial year is seeded from the
/// report header; a lexicographic regression of `(month, day)` within a
/// section means the capture crossed New Year and bumps the year. The
/// naive local time is resolved through the report's declared timezone.
pub struct TimestampNormalizer {
    tz: Tz,
    best_effort: bool,
    initial_year: i32,
    year: i32,
    prev_month_day: Option<(u32, u32)>,
}

impl TimestampNormalizer {
    pub fn new(timezone: Option<&str>, initial_year: i32) -> Self {
        let (tz, best_effort) = match timezone.and_then(|name| name.parse::<Tz>().ok()) {
            Some(tz) => (tz, false),
            None => (Tz::UTC, true),
        };
        if best_effort {
            tracing::debug!("no usable report timezone, falling back to UTC");
        }
        Self {
            tz,
            best_effort,
            initial_year,
            year: initial_year,
            prev_month_day: None,
        }
    }

    /// True when the timezone fell back to UTC because the report did
    /// not declare one.
    pub fn best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Resets year-rollover tracking. Each logcat buffer restarts its own
    /// time span, so rollover state must not leak across sections.
    pub fn reset_section(&mut self) {
        self.year = self.initial_year;
        self.prev_month_day = None;
    }

    /// Returns epoch milliseconds, or `None` when the components do not
    /// form a representable instant (e.g. the local time falls into a
    /// DST gap).
    pub fn normalize(
        &mut self,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        milli: u32,
    ) -> Option<i64> {
        if let Some(prev) = self.prev_month_day {
            if (month, day) < prev {
                self.year += 1;
            }
        }
        self.prev_month_day = Some((month, day));

        let date = NaiveDate::from_ymd_opt(self.year, month, day)?;
        let naive = date.and_hms_milli_opt(hour, minute, second, milli)?;
        local_to_epoch_ms(self.tz, naive)
    }
}

/// Resolves a naive local datetime in `tz` to epoch milliseconds,
/// taking the earliest instant when the local time is ambiguous.
pub fn local_to_epoch_ms(tz: Tz, naive: NaiveDateTime) -> Option<i64> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(instant) => Some(instant.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        LocalResult::None => None,
    }
}
