//! Time range, interval and bucketing placeholders

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::error::{CompileError, Result};

static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d|w|M|y)$").expect("valid regex"));

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Literal `round` value meaning "round to the query interval"
pub const STEP: &str = "$step";

/// Dashboard time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// The range ends at "now"; time filters then have no upper bound
    #[serde(default)]
    pub to_now: bool,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            to_now: false,
        }
    }

    /// Bounds rounded to `round_seconds` and widened so that rounding never
    /// cuts points off either end
    pub fn window(&self, round_seconds: u64) -> Result<TimeWindow> {
        let overflow = || CompileError::InvalidInterval {
            interval: format!("{round_seconds}s"),
        };
        let from_ms = round_ms(self.from.timestamp_millis(), round_seconds).ok_or_else(overflow)?;
        let to_ms = round_ms(self.to.timestamp_millis(), round_seconds).ok_or_else(overflow)?;
        let pad = round_seconds
            .checked_mul(2)
            .and_then(|pad| i64::try_from(pad.saturating_sub(1)).ok())
            .ok_or_else(overflow)?;
        let pad_ms = pad.checked_mul(1000).ok_or_else(overflow)?;

        Ok(TimeWindow {
            from: from_ms.div_euclid(1000).checked_sub(pad).ok_or_else(overflow)?,
            to: to_ms.div_euclid(1000).checked_add(pad).ok_or_else(overflow)?,
            from_ms: from_ms.checked_sub(pad_ms).ok_or_else(overflow)?,
            to_ms: to_ms.checked_add(pad_ms).ok_or_else(overflow)?,
        })
    }

    fn length_ms(&self) -> u64 {
        (self.to - self.from).num_milliseconds().max(0) as u64
    }
}

/// Values substituted for `$from` / `$to` (seconds) and `$__from` / `$__to`
/// (milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: i64,
    pub to: i64,
    pub from_ms: i64,
    pub to_ms: i64,
}

/// `ms` rounded half up to a multiple of `round_seconds`; `None` on overflow
fn round_ms(ms: i64, round_seconds: u64) -> Option<i64> {
    if round_seconds == 0 {
        return Some(ms);
    }
    let coeff = i64::try_from(round_seconds).ok()?.checked_mul(1000)?;
    ms.checked_add(coeff / 2)?.div_euclid(coeff).checked_mul(coeff)
}

/// Milliseconds in a duration such as `15s`, `5m` or `1M`; empty is zero
pub fn duration_ms(duration: &str) -> Result<u64> {
    let duration = duration.trim();
    if duration.is_empty() {
        return Ok(0);
    }
    let invalid = || CompileError::InvalidInterval {
        interval: duration.to_string(),
    };

    let caps = DURATION.captures(duration).ok_or_else(invalid)?;
    let value: u64 = caps[1].parse().map_err(|_| invalid())?;
    let unit = match &caps[2] {
        "ms" => 1,
        "s" => SECOND_MS,
        "m" => MINUTE_MS,
        "h" => HOUR_MS,
        "d" => DAY_MS,
        "w" => 7 * DAY_MS,
        "M" => 30 * DAY_MS,
        _ => 365 * DAY_MS,
    };
    value.checked_mul(unit).ok_or_else(invalid)
}

/// `$interval`: whole seconds, at least one, scaled by `factor`
pub fn interval_seconds(interval: &str, factor: u32) -> Result<u64> {
    if interval.trim().is_empty() {
        return Ok(0);
    }
    let seconds = (duration_ms(interval)? as f64 / SECOND_MS as f64).max(1.0);
    Ok((seconds * factor.max(1) as f64).ceil() as u64)
}

/// `$__interval_ms`: milliseconds scaled by `factor`
pub fn interval_ms(interval: &str, factor: u32) -> Result<u64> {
    duration_ms(interval)?
        .checked_mul(factor.max(1) as u64)
        .ok_or_else(|| CompileError::InvalidInterval {
            interval: interval.trim().to_string(),
        })
}

/// Rounding step in seconds: a duration, or `$step` for the interval itself
pub fn round_seconds(round: Option<&str>, interval_seconds: u64) -> Result<u64> {
    match round.map(str::trim) {
        None | Some("") => Ok(0),
        Some(STEP) => Ok(interval_seconds),
        Some(duration) => Ok(duration_ms(duration)? / SECOND_MS),
    }
}

/// Storage type of the date/time column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DateTimeType {
    #[default]
    #[serde(alias = "DATETIME")]
    DateTime,
    #[serde(alias = "DATETIME64")]
    DateTime64,
    /// Unix seconds
    #[serde(alias = "TIMESTAMP")]
    TimeStamp,
    /// Unix milliseconds
    #[serde(rename = "TimeStamp64_3", alias = "TIMESTAMP64_3")]
    TimeStamp64Milli,
    #[serde(rename = "TimeStamp64_6", alias = "TIMESTAMP64_6")]
    TimeStamp64Micro,
    #[serde(rename = "TimeStamp64_9", alias = "TIMESTAMP64_9")]
    TimeStamp64Nano,
    /// Fractional unix seconds
    #[serde(alias = "FLOAT")]
    Float,
}

impl DateTimeType {
    /// `$timeSeries`: bucket start in milliseconds
    pub fn time_series(self) -> &'static str {
        match self {
            DateTimeType::DateTime => "(intDiv(toUInt32($dateTimeCol), $interval) * $interval) * 1000",
            DateTimeType::DateTime64 => {
                "(intDiv(toFloat64($dateTimeCol) * 1000, ($interval * 1000)) * ($interval * 1000))"
            }
            DateTimeType::TimeStamp => "(intDiv($dateTimeCol, $interval) * $interval) * 1000",
            DateTimeType::TimeStamp64Milli => {
                "(intDiv($dateTimeCol, ($interval * 1000)) * ($interval * 1000))"
            }
            DateTimeType::TimeStamp64Micro => {
                "(intDiv($dateTimeCol / 1000, ($interval * 1000)) * ($interval * 1000))"
            }
            DateTimeType::TimeStamp64Nano => {
                "(intDiv($dateTimeCol / 1000000, ($interval * 1000)) * ($interval * 1000))"
            }
            DateTimeType::Float => {
                "(intDiv($dateTimeCol * 1000, ($interval * 1000)) * ($interval * 1000))"
            }
        }
    }

    /// `$timeSeriesMs`: bucket start in milliseconds, for sub-second intervals
    pub fn time_series_ms(self) -> &'static str {
        match self {
            DateTimeType::DateTime | DateTimeType::DateTime64 => {
                "(intDiv(toFloat64($dateTimeCol) * 1000, $__interval_ms) * $__interval_ms)"
            }
            DateTimeType::TimeStamp | DateTimeType::Float => {
                "(intDiv($dateTimeCol * 1000, $__interval_ms) * $__interval_ms)"
            }
            DateTimeType::TimeStamp64Milli => "(intDiv($dateTimeCol, $__interval_ms) * $__interval_ms)",
            DateTimeType::TimeStamp64Micro => {
                "(intDiv($dateTimeCol / 1000, $__interval_ms) * $__interval_ms)"
            }
            DateTimeType::TimeStamp64Nano => {
                "(intDiv($dateTimeCol / 1000000, $__interval_ms) * $__interval_ms)"
            }
        }
    }

    /// `$naturalTimeSeries`: calendar-aligned buckets for long ranges
    pub fn natural_time_series(self, range: &TimeRange) -> String {
        let length = range.length_ms();
        let start = if length >= 2 * 365 * DAY_MS {
            "toStartOfYear"
        } else if length >= 2 * 30 * DAY_MS {
            "toStartOfMonth"
        } else if length >= 2 * 7 * DAY_MS {
            "toMonday"
        } else if length >= 2 * DAY_MS {
            "toStartOfDay"
        } else if length >= 2 * HOUR_MS {
            "toStartOfHour"
        } else {
            return self.time_series().to_string();
        };
        format!("toUInt32(toDateTime({start}({}))) * 1000", self.as_date_time())
    }

    /// `$timeFilter`
    pub fn time_filter(self, to_now: bool) -> String {
        range_filter(&self.seconds_bound("$from"), &self.seconds_bound("$to"), to_now)
    }

    /// `$timeFilterMs`
    pub fn time_filter_ms(self, to_now: bool) -> String {
        range_filter(&self.millis_bound("$__from"), &self.millis_bound("$__to"), to_now)
    }

    /// A seconds placeholder converted to the column's type
    fn seconds_bound(self, bound: &str) -> String {
        match self {
            DateTimeType::DateTime => format!("toDateTime({bound})"),
            DateTimeType::DateTime64 => format!("toDateTime64({bound}, 3)"),
            DateTimeType::TimeStamp => bound.to_string(),
            DateTimeType::TimeStamp64Milli => format!("{bound} * 1000"),
            DateTimeType::TimeStamp64Micro => format!("{bound} * 1000000"),
            DateTimeType::TimeStamp64Nano => format!("{bound} * 1000000000"),
            DateTimeType::Float => format!("toFloat64({bound})"),
        }
    }

    /// A milliseconds placeholder converted to the column's type
    fn millis_bound(self, bound: &str) -> String {
        match self {
            DateTimeType::DateTime => format!("toDateTime({bound}/1000)"),
            DateTimeType::DateTime64 => format!("toDateTime64({bound}/1000, 3)"),
            DateTimeType::TimeStamp => format!("{bound}/1000"),
            DateTimeType::TimeStamp64Milli => bound.to_string(),
            DateTimeType::TimeStamp64Micro => format!("{bound} * 1000"),
            DateTimeType::TimeStamp64Nano => format!("{bound} * 1000000"),
            DateTimeType::Float => format!("toFloat64({bound}/1000)"),
        }
    }

    fn as_date_time(self) -> &'static str {
        match self {
            DateTimeType::DateTime | DateTimeType::DateTime64 => "$dateTimeCol",
            DateTimeType::TimeStamp | DateTimeType::Float => "toDateTime($dateTimeCol)",
            DateTimeType::TimeStamp64Milli => "toDateTime(intDiv($dateTimeCol, 1000))",
            DateTimeType::TimeStamp64Micro => "toDateTime(intDiv($dateTimeCol, 1000000))",
            DateTimeType::TimeStamp64Nano => "toDateTime(intDiv($dateTimeCol, 1000000000))",
        }
    }
}

fn range_filter(from: &str, to: &str, to_now: bool) -> String {
    if to_now {
        format!("$dateTimeCol >= {from}")
    } else {
        format!("$dateTimeCol >= {from} AND $dateTimeCol <= {to}")
    }
}

/// Prefix for time filters when a separate Date column is configured
pub fn date_filter(to_now: bool, millis: bool) -> String {
    let (from, to) = if millis {
        ("toDate($__from/1000)", "toDate($__to/1000)")
    } else {
        ("toDate($from)", "toDate($to)")
    };
    if to_now {
        format!("$dateCol >= {from} AND ")
    } else {
        format!("$dateCol >= {from} AND $dateCol <= {to} AND ")
    }
}

/// `$timeFilterByColumn(col)`
pub fn time_filter_by_column(column: &str) -> String {
    format!("{column} >= toDateTime($from) AND {column} <= toDateTime($to)")
}

/// `$timeFilter64ByColumn(col)`
pub fn time_filter64_by_column(column: &str) -> String {
    format!("{column} >= toDateTime64($__from/1000, 3) AND {column} <= toDateTime64($__to/1000, 3)")
}
