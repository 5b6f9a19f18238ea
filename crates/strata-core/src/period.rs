//! Calendar-day periods, the unit of aggregation and safe recomputation.
//!
//! A [`Period`] is one UTC day. All timestamps in the store are microseconds
//! since the Unix epoch (`_us` suffix); a period owns the half-open interval
//! `[start_us, end_us)`.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One UTC calendar day, parsed from and displayed as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period(NaiveDate);

/// Error returned when parsing an invalid period string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPeriod {
    /// The unrecognised input string.
    pub raw: String,
}

impl fmt::Display for InvalidPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid period '{}': expected YYYY-MM-DD", self.raw)
    }
}

impl std::error::Error for InvalidPeriod {}

impl Period {
    /// Construct from a date.
    #[must_use]
    pub const fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The period containing the given epoch-microsecond timestamp.
    #[must_use]
    pub fn containing_us(ts_us: i64) -> Self {
        let secs = ts_us.div_euclid(1_000_000);
        let dt = chrono::DateTime::from_timestamp(secs, 0).unwrap_or(chrono::DateTime::UNIX_EPOCH);
        Self(dt.date_naive())
    }

    /// Inclusive start of the period, epoch microseconds.
    #[must_use]
    pub fn start_us(self) -> i64 {
        let start = self.0.and_hms_opt(0, 0, 0).unwrap_or_default();
        Utc.from_utc_datetime(&start).timestamp_micros()
    }

    /// Exclusive end of the period, epoch microseconds.
    #[must_use]
    pub fn end_us(self) -> i64 {
        self.next().start_us()
    }

    /// The following day.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + Duration::days(1))
    }

    /// Iterate periods from `self` through `last`, inclusive, oldest first.
    ///
    /// Empty when `last < self`.
    pub fn through(self, last: Self) -> impl Iterator<Item = Self> {
        let mut cur = self;
        std::iter::from_fn(move || {
            if cur > last {
                return None;
            }
            let out = cur;
            cur = cur.next();
            Some(out)
        })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for Period {
    type Err = InvalidPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| InvalidPeriod { raw: s.to_string() })
    }
}

// Serialize as the `YYYY-MM-DD` string.
impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_display_roundtrip() {
        let p: Period = "2024-01-15".parse().expect("should parse");
        assert_eq!(p.to_string(), "2024-01-15");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("2024-13-40".parse::<Period>().is_err());
        assert!("yesterday".parse::<Period>().is_err());
        assert!("".parse::<Period>().is_err());
    }

    #[test]
    fn bounds_are_half_open_day() {
        let p: Period = "2024-01-15".parse().expect("parse");
        assert_eq!(p.end_us() - p.start_us(), 86_400_000_000);
        assert_eq!(p.end_us(), p.next().start_us());
    }

    #[test]
    fn containing_us_maps_to_day() {
        let p: Period = "2024-01-15".parse().expect("parse");
        assert_eq!(Period::containing_us(p.start_us()), p);
        assert_eq!(Period::containing_us(p.end_us() - 1), p);
        assert_eq!(Period::containing_us(p.end_us()), p.next());
    }

    #[test]
    fn through_is_inclusive_and_ordered() {
        let start: Period = "2024-01-30".parse().expect("parse");
        let last: Period = "2024-02-02".parse().expect("parse");
        let got: Vec<String> = start.through(last).map(|p| p.to_string()).collect();
        assert_eq!(got, ["2024-01-30", "2024-01-31", "2024-02-01", "2024-02-02"]);
    }

    #[test]
    fn through_empty_when_reversed() {
        let start: Period = "2024-02-02".parse().expect("parse");
        let last: Period = "2024-01-30".parse().expect("parse");
        assert_eq!(start.through(last).count(), 0);
    }

    #[test]
    fn serde_as_string() {
        let p: Period = "2024-01-15".parse().expect("parse");
        let json = serde_json::to_string(&p).expect("serialize");
        assert_eq!(json, "\"2024-01-15\"");
        let back: Period = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, p);
    }
}
