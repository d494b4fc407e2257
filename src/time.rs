//! Time & Interval Model (C1): canonical UTC arithmetic, interval alignment,
//! and day-bucket enumeration. Every function here is pure and synchronous.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use thiserror::Error;

use crate::market::MarketType;

/// Symbolic kline interval. `1s` is spot-only (enforced by callers via
/// [`Interval::validate_for_market`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Interval {
    S1,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
}

impl Interval {
    /// Canonical wire/cache-path representation, e.g. `"1m"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1s" => Self::S1,
            "1m" => Self::M1,
            "3m" => Self::M3,
            "5m" => Self::M5,
            "15m" => Self::M15,
            "30m" => Self::M30,
            "1h" => Self::H1,
            "2h" => Self::H2,
            "4h" => Self::H4,
            "6h" => Self::H6,
            "8h" => Self::H8,
            "12h" => Self::H12,
            "1d" => Self::D1,
            _ => return None,
        })
    }

    /// Exact duration of one interval step.
    pub fn duration(self) -> Duration {
        match self {
            Self::S1 => Duration::seconds(1),
            Self::M1 => Duration::minutes(1),
            Self::M3 => Duration::minutes(3),
            Self::M5 => Duration::minutes(5),
            Self::M15 => Duration::minutes(15),
            Self::M30 => Duration::minutes(30),
            Self::H1 => Duration::hours(1),
            Self::H2 => Duration::hours(2),
            Self::H4 => Duration::hours(4),
            Self::H6 => Duration::hours(6),
            Self::H8 => Duration::hours(8),
            Self::H12 => Duration::hours(12),
            Self::D1 => Duration::days(1),
        }
    }

    /// `1s` is only meaningful for spot archives/streams; reject elsewhere.
    pub fn validate_for_market(self, market: MarketType) -> Result<(), TimeError> {
        if self == Self::S1 && market != MarketType::Spot {
            return Err(TimeError::IntervalNotSupportedForMarket {
                interval: self.as_str(),
                market,
            });
        }
        Ok(())
    }

    /// `1s` archives are published under the archive's `1m` directory; the
    /// filename itself still says `1s`.
    pub fn archive_directory(self) -> &'static str {
        match self {
            Self::S1 => "1m",
            other => other.as_str(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("timestamp is not UTC-aware (naive timestamps are a programming error)")]
    NaiveTimestamp,
    #[error("interval {interval} is not supported for market {market:?}")]
    IntervalNotSupportedForMarket {
        interval: &'static str,
        market: MarketType,
    },
    #[error("start ({start}) must be strictly before end ({end})")]
    StartNotBeforeEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Round `t` down to the nearest multiple of `interval` since the Unix epoch.
pub fn align_down(t: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let step_ns = interval.duration().num_nanoseconds().expect("interval fits in i64 ns");
    let t_ns = t.timestamp_nanos_opt().expect("timestamp fits in i64 ns");
    let floored = t_ns.div_euclid(step_ns) * step_ns;
    DateTime::from_timestamp_nanos(floored)
}

/// Round `t` up to the nearest multiple of `interval`; unchanged if already aligned.
pub fn align_up(t: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let down = align_down(t, interval);
    if down == t {
        down
    } else {
        down + interval.duration()
    }
}

/// `open_time` is interval-aligned iff it equals its own floor.
pub fn is_aligned(t: DateTime<Utc>, interval: Interval) -> bool {
    align_down(t, interval) == t
}

/// UTC calendar-day boundaries `[start, end)` containing `date`.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is always valid"));
    let end = start + Duration::days(1);
    (start, end)
}

/// Every UTC calendar date whose `[day_start, day_end)` window intersects
/// the half-open range `[start, end)`. Empty ranges yield an empty list.
pub fn enumerate_days(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    if start >= end {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut day = start.date_naive();
    let last_day = (end - Duration::nanoseconds(1)).date_naive();
    while day <= last_day {
        out.push(day);
        day = day.succ_opt().expect("calendar date does not overflow here");
    }
    out
}

/// A UTC day is archive-eligible once it is fully past the publication delay:
/// the entire day must have elapsed *and* the delay must have passed since
/// the day closed.
pub fn is_past_publication_delay(date: NaiveDate, now: DateTime<Utc>, delay: Duration) -> bool {
    let (_, day_end) = day_bounds(date);
    now >= day_end + delay
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_floors_to_interval_multiple() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 10, 37, 42).unwrap();
        let aligned = align_down(t, Interval::M15);
        assert_eq!(aligned, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn align_down_is_idempotent() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(align_down(t, Interval::M15), t);
    }

    #[test]
    fn align_up_rounds_unaligned_up_and_leaves_aligned_alone() {
        let aligned = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(align_up(aligned, Interval::M15), aligned);

        let unaligned = Utc.with_ymd_and_hms(2024, 1, 15, 10, 31, 0).unwrap();
        assert_eq!(
            align_up(unaligned, Interval::M15),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 45, 0).unwrap()
        );
    }

    #[test]
    fn enumerate_days_covers_partial_boundary_days() {
        let start = Utc.with_ymd_and_hms(2025, 4, 10, 23, 58, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 4, 11, 0, 3, 0).unwrap();
        let days = enumerate_days(start, end);
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2025, 4, 10).unwrap(),
                NaiveDate::from_ymd_opt(2025, 4, 11).unwrap(),
            ]
        );
    }

    #[test]
    fn enumerate_days_empty_range_yields_no_days() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(enumerate_days(t, t).is_empty());
    }

    #[test]
    fn publication_delay_cutoff_is_inclusive_of_the_full_day_plus_delay() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let just_short = Utc.with_ymd_and_hms(2024, 6, 2, 23, 59, 59).unwrap();
        let exactly_at = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        assert!(!is_past_publication_delay(date, just_short, Duration::hours(48)));
        assert!(is_past_publication_delay(date, exactly_at, Duration::hours(48)));
    }

    #[test]
    fn s1_is_rejected_outside_spot() {
        assert!(Interval::S1.validate_for_market(MarketType::FuturesUsdt).is_err());
        assert!(Interval::S1.validate_for_market(MarketType::Spot).is_ok());
    }
}
