//! Calendar-month keys and day-window helpers for the shard cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::schema::EventInstance;

/// A `YYYY-MM` shard key. Derived from the UTC month of an instance's
/// `start_at`, so bucketing is deterministic across machines; day-scoped
/// queries apply local-day bounds separately (see [`day_bounds_local`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> VaultResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(VaultError::Config(format!("invalid month {month}")));
        }
        Ok(MonthKey { year, month })
    }

    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        MonthKey {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        MonthKey {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::from_datetime(&Utc::now())
    }

    pub fn pred(self) -> Self {
        if self.month == 1 {
            MonthKey {
                year: self.year - 1,
                month: 12,
            }
        } else {
            MonthKey {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn succ(self) -> Self {
        if self.month == 12 {
            MonthKey {
                year: self.year + 1,
                month: 1,
            }
        } else {
            MonthKey {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// `span` months before and after `self`, inclusive of `self`.
    pub fn range(self, span: u32) -> Vec<MonthKey> {
        let mut first = self;
        for _ in 0..span {
            first = first.pred();
        }
        let mut keys = Vec::with_capacity(span as usize * 2 + 1);
        let mut key = first;
        for _ in 0..=(span * 2) {
            keys.push(key);
            key = key.succ();
        }
        keys
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the last dash: the year part may itself carry a sign.
        let (year, month) = s
            .rsplit_once('-')
            .ok_or_else(|| VaultError::Config(format!("invalid month key '{s}'")))?;
        let year: i32 = year
            .parse()
            .map_err(|_| VaultError::Config(format!("invalid month key '{s}'")))?;
        let month: u32 = month
            .parse()
            .map_err(|_| VaultError::Config(format!("invalid month key '{s}'")))?;
        MonthKey::new(year, month)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.to_string()
    }
}

/// UTC bounds `[start, end)` of a local calendar day. Ambiguous or skipped
/// local midnights (DST transitions) resolve to the earliest valid instant.
pub fn day_bounds_local(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    (local_midnight(date), local_midnight(date + chrono::Duration::days(1)))
}

fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map_or_else(|| Utc.from_utc_datetime(&naive), |dt| dt.with_timezone(&Utc))
}

/// Day-overlap rule for instance queries: an interval overlaps the day when
/// `start < day_end && end >= day_start`. An end exactly at the day's start
/// counts — the zero-length spillover kept for adjoining-day rendering.
pub fn overlaps_day(
    instance: &EventInstance,
    day_start: DateTime<Utc>,
    day_end: DateTime<Utc>,
) -> bool {
    instance.start_at < day_end && instance.end_at >= day_start
}
