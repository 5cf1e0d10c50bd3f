//! Time-axis helpers shared by the archive, the sampler and the artifact writers
//!
//! All timestamps are naive UTC. Archive and artifact files are keyed by
//! `YYYYMMDD.HHMM`.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{TecError, TecResult};

/// Key format used in file names
pub const KEY_FORMAT: &str = "%Y%m%d.%H%M";

/// Day directory format
pub const DAY_FORMAT: &str = "%Y%m%d";

/// Format a timestamp as `YYYYMMDD.HHMM`
pub fn format_key(ts: &NaiveDateTime) -> String {
    ts.format(KEY_FORMAT).to_string()
}

/// Format the day part as `YYYYMMDD`
pub fn format_day(day: &NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Parse a `YYYYMMDD.HHMM` key
pub fn parse_key(key: &str) -> TecResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(key, KEY_FORMAT)
        .map_err(|e| TecError::Config(format!("bad timestamp key `{}`: {}", key, e)))
}

/// Parse a user-facing timestamp, accepting either a bare date or a date-time
pub fn parse_datetime(value: &str) -> TecResult<NaiveDateTime> {
    let value = value.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(ts);
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(ts) = day.and_hms_opt(0, 0, 0) {
            return Ok(ts);
        }
    }
    parse_key(value)
}

/// Length of one tick
pub fn tick(resolution_minutes: u32) -> Duration {
    Duration::minutes(resolution_minutes as i64)
}

/// Shift `ts` by a signed number of ticks
pub fn shift(ts: NaiveDateTime, ticks: i64, resolution_minutes: u32) -> NaiveDateTime {
    ts + Duration::minutes(ticks * resolution_minutes as i64)
}

/// True when `ts` sits exactly on the resolution grid
pub fn is_aligned(ts: &NaiveDateTime, resolution_minutes: u32) -> bool {
    if resolution_minutes == 0 || ts.second() != 0 || ts.nanosecond() != 0 {
        return false;
    }
    let minute_of_day = ts.hour() * 60 + ts.minute();
    minute_of_day % resolution_minutes == 0
}

/// Every grid tick in `[start, end]`, stepping `stride` ticks at a time
pub fn ticks_between(
    start: NaiveDateTime,
    end: NaiveDateTime,
    resolution_minutes: u32,
    stride: u32,
) -> Vec<NaiveDateTime> {
    let step = Duration::minutes(resolution_minutes as i64 * stride.max(1) as i64);
    let mut out = Vec::new();
    let mut current = start;
    while current <= end {
        out.push(current);
        current += step;
    }
    out
}

/// Every calendar day touched by `[start, end]`
pub fn days_between(start: NaiveDateTime, end: NaiveDateTime) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start.date();
    while day <= end.date() {
        days.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}
