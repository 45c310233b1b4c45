//! Canonical timeperiod strings.
//!
//! Every timeperiod is a fixed-width digit string. Coarser granularities zero
//! out the finer fields:
//!
//! | Qualifier  | Pattern          | Example          |
//! |------------|------------------|------------------|
//! | `RealTime` | `%Y%m%d%H%M%S`   | `20240101134502` |
//! | `Hourly`   | `%Y%m%d%H`       | `2024010113`     |
//! | `Daily`    | `%Y%m%d00`       | `2024010100`     |
//! | `Monthly`  | `%Y%m0000`       | `2024010000`     |
//! | `Yearly`   | `%Y000000`       | `2024000000`     |
//!
//! Strings of the same qualifier sort lexicographically in time order, which
//! the tree relies on when it walks children in ascending order.

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const REAL_TIME_PATTERN: &str = "%Y%m%d%H%M%S";
pub const HOURLY_PATTERN: &str = "%Y%m%d%H";
pub const DAILY_PATTERN: &str = "%Y%m%d00";
pub const MONTHLY_PATTERN: &str = "%Y%m0000";
pub const YEARLY_PATTERN: &str = "%Y000000";

/// Granularity of a timeperiod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
    /// Second-precision stamp used by freerun lanes.
    RealTime,
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl Qualifier {
    /// Ordering weight inside a process hierarchy: coarser levels weigh more.
    pub fn rank(self) -> u32 {
        match self {
            Qualifier::Yearly => 1000,
            Qualifier::Monthly => 900,
            Qualifier::Daily => 800,
            Qualifier::Hourly => 700,
            Qualifier::RealTime => 0,
        }
    }

    /// The calendar bucket that directly encloses this granularity.
    pub fn coarser(self) -> Option<Qualifier> {
        match self {
            Qualifier::Hourly => Some(Qualifier::Daily),
            Qualifier::Daily => Some(Qualifier::Monthly),
            Qualifier::Monthly => Some(Qualifier::Yearly),
            Qualifier::Yearly | Qualifier::RealTime => None,
        }
    }

    pub fn pattern(self) -> &'static str {
        match self {
            Qualifier::RealTime => REAL_TIME_PATTERN,
            Qualifier::Hourly => HOURLY_PATTERN,
            Qualifier::Daily => DAILY_PATTERN,
            Qualifier::Monthly => MONTHLY_PATTERN,
            Qualifier::Yearly => YEARLY_PATTERN,
        }
    }
}

impl std::fmt::Display for Qualifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Qualifier::RealTime => "real_time",
            Qualifier::Hourly => "hourly",
            Qualifier::Daily => "daily",
            Qualifier::Monthly => "monthly",
            Qualifier::Yearly => "yearly",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Qualifier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "real_time" => Ok(Qualifier::RealTime),
            "hourly" => Ok(Qualifier::Hourly),
            "daily" => Ok(Qualifier::Daily),
            "monthly" => Ok(Qualifier::Monthly),
            "yearly" => Ok(Qualifier::Yearly),
            other => Err(format!("unknown qualifier: {other}")),
        }
    }
}

/// Split a 10-digit timeperiod into `(year, month, day, hour)`.
pub fn tokenize(timeperiod: &str) -> Result<(u32, u32, u32, u32)> {
    if timeperiod.len() != 10 || !timeperiod.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::timeperiod(timeperiod, "expected YYYYMMDDHH"));
    }
    Ok((
        digits(timeperiod, 0, 4),
        digits(timeperiod, 4, 6),
        digits(timeperiod, 6, 8),
        digits(timeperiod, 8, 10),
    ))
}

fn digits(s: &str, from: usize, to: usize) -> u32 {
    // Callers validated that the string is ASCII digits only.
    s[from..to].parse().unwrap_or(0)
}

/// Parse any supported timeperiod into a naive UTC datetime.
///
/// Zero month/day fields (coarse timeperiods) are read as the first
/// month/day of the enclosing bucket.
pub fn parse(timeperiod: &str) -> Result<NaiveDateTime> {
    let (year, month, day, hour, minute, second) = match timeperiod.len() {
        10 => {
            let (y, m, d, h) = tokenize(timeperiod)?;
            (y, m, d, h, 0, 0)
        }
        14 if timeperiod.bytes().all(|b| b.is_ascii_digit()) => (
            digits(timeperiod, 0, 4),
            digits(timeperiod, 4, 6),
            digits(timeperiod, 6, 8),
            digits(timeperiod, 8, 10),
            digits(timeperiod, 10, 12),
            digits(timeperiod, 12, 14),
        ),
        _ => {
            return Err(CoreError::timeperiod(
                timeperiod,
                "expected YYYYMMDDHH or YYYYMMDDHHMMSS",
            ))
        }
    };

    NaiveDate::from_ymd_opt(year as i32, month.max(1), day.max(1))
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or_else(|| CoreError::timeperiod(timeperiod, "not a calendar date"))
}

/// Render `dt` in the canonical form of `qualifier`.
pub fn format(qualifier: Qualifier, dt: NaiveDateTime) -> String {
    dt.format(qualifier.pattern()).to_string()
}

/// Truncate `timeperiod` to the canonical form of `qualifier`.
///
/// `cast_to_qualifier(Daily, "2024010113") == "2024010100"`
pub fn cast_to_qualifier(qualifier: Qualifier, timeperiod: &str) -> Result<String> {
    Ok(format(qualifier, parse(timeperiod)?))
}

/// Shift `timeperiod` by `delta` units of `qualifier`.
///
/// Month and year arithmetic goes through chrono's calendar months, so
/// `increment(Monthly, "2010120000", 1) == "2011010000"` and negative deltas
/// roll back across year boundaries.
pub fn increment(qualifier: Qualifier, timeperiod: &str, delta: i32) -> Result<String> {
    let t = parse(timeperiod)?;
    let shifted = match qualifier {
        Qualifier::RealTime => t.checked_add_signed(Duration::seconds(delta as i64)),
        Qualifier::Hourly => t.checked_add_signed(Duration::hours(delta as i64)),
        Qualifier::Daily => t.checked_add_signed(Duration::days(delta as i64)),
        Qualifier::Monthly => shift_months(t, delta),
        Qualifier::Yearly => shift_months(t, delta.saturating_mul(12)),
    }
    .ok_or_else(|| CoreError::timeperiod(timeperiod, format!("cannot shift by {delta}")))?;
    Ok(format(qualifier, shifted))
}

fn shift_months(t: NaiveDateTime, delta: i32) -> Option<NaiveDateTime> {
    if delta >= 0 {
        t.checked_add_months(Months::new(delta as u32))
    } else {
        t.checked_sub_months(Months::new(delta.unsigned_abs()))
    }
}

/// The timeperiod that contains `now`.
pub fn actual_timeperiod(qualifier: Qualifier, now: DateTime<Utc>) -> String {
    format(qualifier, now.naive_utc())
}

/// Start instant of `timeperiod`.
pub fn to_datetime(timeperiod: &str) -> Result<DateTime<Utc>> {
    Ok(Utc.from_utc_datetime(&parse(timeperiod)?))
}
