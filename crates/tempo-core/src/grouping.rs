//! Grouping of raw timeperiods into coarser "every N" buckets.
//!
//! A process configured with `time_grouping = 3` on an hourly qualifier does
//! not run once per hour but once per three hours. Each raw hour maps to the
//! *closing* period of its group:
//!
//! ```text
//! hours 00..=03 -> 03,  04..=06 -> 06,  ...,  22..=23 -> 23
//! ```
//!
//! Groups never cross the enclosing calendar bucket: the last group of a day
//! ends at hour 23, the last daily group of a month ends on that month's last
//! day and the last monthly group of a year ends in December.

use chrono::NaiveDate;

use crate::error::{CoreError, Result};
use crate::time::{cast_to_qualifier, increment, tokenize, Qualifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeperiodGrouping {
    qualifier: Qualifier,
    grouping: u32,
}

impl TimeperiodGrouping {
    /// Validate `grouping` against the qualifier's stem range
    /// (hours 23, days 28, months 12, years 1).
    pub fn new(qualifier: Qualifier, grouping: u32) -> Result<Self> {
        let upper = stem_upper_boundary(qualifier, None)?;
        if grouping < 1 || grouping > upper {
            return Err(CoreError::InvalidGrouping {
                qualifier: qualifier.to_string(),
                grouping,
                upper,
            });
        }
        Ok(Self {
            qualifier,
            grouping,
        })
    }

    /// One raw period per group. Valid for every qualifier, including real time.
    pub fn identity(qualifier: Qualifier) -> Self {
        Self {
            qualifier,
            grouping: 1,
        }
    }

    pub fn qualifier(&self) -> Qualifier {
        self.qualifier
    }

    pub fn grouping(&self) -> u32 {
        self.grouping
    }

    pub fn is_identity(&self) -> bool {
        self.grouping == 1
    }

    /// Map a raw timeperiod onto the grouped timeperiod that owns it.
    pub fn translate(&self, timeperiod: &str) -> Result<String> {
        let canonical = cast_to_qualifier(self.qualifier, timeperiod)?;
        if self.is_identity() || self.qualifier == Qualifier::Yearly {
            return Ok(canonical);
        }

        let (year, month, day, hour) = tokenize(&canonical)?;
        let result = match self.qualifier {
            Qualifier::Hourly => {
                let upper = stem_upper_boundary(Qualifier::Hourly, None)?;
                let stem = self.group_stem(hour, upper);
                format!("{year:04}{month:02}{day:02}{stem:02}")
            }
            Qualifier::Daily => {
                let upper = stem_upper_boundary(Qualifier::Daily, Some((year, month)))?;
                let stem = self.group_stem(day, upper);
                format!("{year:04}{month:02}{stem:02}{hour:02}")
            }
            Qualifier::Monthly => {
                let upper = stem_upper_boundary(Qualifier::Monthly, None)?;
                let stem = self.group_stem(month, upper);
                format!("{year:04}{stem:02}{day:02}{hour:02}")
            }
            Qualifier::Yearly | Qualifier::RealTime => canonical,
        };
        Ok(result)
    }

    /// Inclusive first and exclusive end raw timeperiods covered by the group
    /// owning `timeperiod`.
    ///
    /// The start is found by walking back one raw period at a time while the
    /// period still translates to the same group and stays inside the same
    /// coarser bucket.
    pub fn bounds(&self, timeperiod: &str) -> Result<(String, String)> {
        let grouped = self.translate(timeperiod)?;
        let end = increment(self.qualifier, &grouped, 1)?;
        if self.is_identity() {
            return Ok((grouped, end));
        }

        let Some(coarser) = self.qualifier.coarser() else {
            return Ok((grouped, end));
        };
        let bucket = cast_to_qualifier(coarser, &grouped)?;

        let mut start = grouped.clone();
        loop {
            let prev = increment(self.qualifier, &start, -1)?;
            if cast_to_qualifier(coarser, &prev)? != bucket || self.translate(&prev)? != grouped {
                break;
            }
            start = prev;
        }
        Ok((start, end))
    }

    /// Smallest multiple of the grouping that is >= `stem`, capped at `upper`.
    fn group_stem(&self, stem: u32, upper: u32) -> u32 {
        let lower = if self.grouping == 1 { 0 } else { 1 };
        (lower..upper)
            .map(|i| i * self.grouping)
            .find(|candidate| stem <= *candidate && *candidate <= upper)
            .unwrap_or(upper)
    }
}

fn stem_upper_boundary(qualifier: Qualifier, year_month: Option<(u32, u32)>) -> Result<u32> {
    match qualifier {
        Qualifier::Hourly => Ok(23),
        Qualifier::Daily => Ok(match year_month {
            Some((year, month)) => days_in_month(year, month),
            None => 28,
        }),
        Qualifier::Monthly => Ok(12),
        Qualifier::Yearly => Ok(1),
        Qualifier::RealTime => Err(CoreError::UnsupportedQualifier {
            qualifier: qualifier.to_string(),
            operation: "timeperiod grouping",
        }),
    }
}

fn days_in_month(year: u32, month: u32) -> u32 {
    let (next_year, next_month) = if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first = NaiveDate::from_ymd_opt(year as i32, month.max(1), 1);
    let next = NaiveDate::from_ymd_opt(next_year as i32, next_month, 1);
    match (first, next) {
        (Some(first), Some(next)) => (next - first).num_days() as u32,
        _ => 28,
    }
}
