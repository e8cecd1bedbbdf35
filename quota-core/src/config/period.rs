use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl PeriodUnit {
    fn seconds(self) -> u64 {
        match self {
            PeriodUnit::Second => 1,
            PeriodUnit::Minute => 60,
            PeriodUnit::Hour => 60 * 60,
            PeriodUnit::Day => 24 * 60 * 60,
            PeriodUnit::Week => 7 * 24 * 60 * 60,
            PeriodUnit::Month => 30 * 24 * 60 * 60,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PeriodUnit::Second => "second",
            PeriodUnit::Minute => "minute",
            PeriodUnit::Hour => "hour",
            PeriodUnit::Day => "day",
            PeriodUnit::Week => "week",
            PeriodUnit::Month => "month",
        }
    }
}

/// Longest accepted period. Cutoffs computed from it stay well inside chrono's date range.
const MAX_PERIOD_SECONDS: u64 = 1000 * 365 * 24 * 60 * 60;

/// A positive span of time written as `"<count> <unit>"`, e.g. `"5 minutes"` or `"1 day"`.
/// A month is 30 days.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct QuotaPeriod {
    count: u32,
    unit: PeriodUnit,
}

impl QuotaPeriod {
    pub const FIVE_MINUTES: QuotaPeriod = QuotaPeriod {
        count: 5,
        unit: PeriodUnit::Minute,
    };

    pub fn new(count: u32, unit: PeriodUnit) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "Quota period must be greater than zero".to_string(),
            }));
        }
        if u64::from(count) * unit.seconds() > MAX_PERIOD_SECONDS {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "Quota period `{count} {}(s)` is longer than the maximum of 1000 years",
                    unit.as_str()
                ),
            }));
        }
        Ok(Self { count, unit })
    }

    pub fn to_std_duration(self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.count) * self.unit.seconds())
    }

    pub fn to_duration(self) -> chrono::Duration {
        chrono::Duration::seconds((u64::from(self.count) * self.unit.seconds()) as i64)
    }

    /// The instant `self` before `now`.
    pub fn before(self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        now.checked_sub_signed(self.to_duration()).ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: format!("Quota period `{self}` reaches before the earliest supported date"),
            })
        })
    }
}

impl FromStr for QuotaPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Invalid quota period `{s}`. Expected `<count> <unit>` where unit is one of second, minute, hour, day, week, month"
                ),
            })
        };
        let mut parts = s.split_whitespace();
        let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let count: u32 = count.parse().map_err(|_| invalid())?;
        let unit = unit.to_ascii_lowercase();
        let unit = match unit.strip_suffix('s').unwrap_or(&unit) {
            "second" => PeriodUnit::Second,
            "minute" => PeriodUnit::Minute,
            "hour" => PeriodUnit::Hour,
            "day" => PeriodUnit::Day,
            "week" => PeriodUnit::Week,
            "month" => PeriodUnit::Month,
            _ => return Err(invalid()),
        };
        Self::new(count, unit)
    }
}

impl TryFrom<String> for QuotaPeriod {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QuotaPeriod> for String {
    fn from(period: QuotaPeriod) -> Self {
        period.to_string()
    }
}

impl Display for QuotaPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plural = if self.count == 1 { "" } else { "s" };
        write!(f, "{} {}{plural}", self.count, self.unit.as_str())
    }
}
