//! The Candle/Frame data model shared by every component.

use chrono::{DateTime, NaiveDate, Utc};

use crate::time::Interval;

/// A single fixed-interval OHLCV observation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
    pub quote_asset_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
    /// `NaN`-padded rows created by `auto_reindex`/`impute_*` carry no real
    /// data; everything else is `false`.
    #[serde(default)]
    pub imputed: bool,
}

impl Candle {
    /// `close_time` strictly determined by `open_time` and the interval: the
    /// last nanosecond before the next candle opens.
    pub fn expected_close_time(open_time: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
        open_time + interval.duration() - chrono::Duration::nanoseconds(1)
    }

    /// Price-sanity invariant: low/high must bracket open/close, volume non-negative.
    pub fn prices_sane(&self) -> bool {
        if self.imputed {
            return true;
        }
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && lo <= hi && hi <= self.high && self.volume >= 0.0
    }

    pub fn nan_at(open_time: DateTime<Utc>, interval: Interval) -> Self {
        Self {
            open_time,
            open: f64::NAN,
            high: f64::NAN,
            low: f64::NAN,
            close: f64::NAN,
            volume: f64::NAN,
            close_time: Self::expected_close_time(open_time, interval),
            quote_asset_volume: f64::NAN,
            trade_count: 0,
            taker_buy_base_volume: f64::NAN,
            taker_buy_quote_volume: f64::NAN,
            imputed: true,
        }
    }
}

/// A sorted, deduplicated, UTC-aware table of candles.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Frame {
    pub rows: Vec<Candle>,
}

impl Frame {
    pub fn new(rows: Vec<Candle>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn min_open_time(&self) -> Option<DateTime<Utc>> {
        self.rows.first().map(|r| r.open_time)
    }

    pub fn max_open_time(&self) -> Option<DateTime<Utc>> {
        self.rows.last().map(|r| r.open_time)
    }

    /// Strictly-ascending-by-`open_time`, unique invariant.
    pub fn is_strictly_ordered_and_unique(&self) -> bool {
        self.rows.windows(2).all(|w| w[0].open_time < w[1].open_time)
    }

    /// Trim to the exact half-open `[start, end)` bounds.
    pub fn trim(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.rows.retain(|r| r.open_time >= start && r.open_time < end);
        self
    }

    pub fn into_rows(self) -> Vec<Candle> {
        self.rows
    }
}

/// The source that actually produced a row or day-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Source {
    Cache,
    Archive,
    Rest,
    Imputed,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Archive => "archive",
            Self::Rest => "rest",
            Self::Imputed => "imputed",
        }
    }
}

/// Per-day source identity returned alongside the frame.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProvenanceEntry {
    pub day: NaiveDate,
    pub source: Source,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_at(ts: DateTime<Utc>) -> Candle {
        Candle {
            open_time: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            close_time: ts,
            quote_asset_volume: 1.0,
            trade_count: 1,
            taker_buy_base_volume: 1.0,
            taker_buy_quote_volume: 1.0,
            imputed: false,
        }
    }

    #[test]
    fn price_sanity_rejects_high_below_close() {
        let mut c = candle_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        c.high = 0.5;
        c.close = 1.0;
        assert!(!c.prices_sane());
    }

    #[test]
    fn trim_keeps_only_rows_in_half_open_range() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::minutes(1);
        let t2 = t0 + chrono::Duration::minutes(2);
        let frame = Frame::new(vec![candle_at(t0), candle_at(t1), candle_at(t2)]);
        let trimmed = frame.trim(t0, t2);
        assert_eq!(trimmed.rows.iter().map(|r| r.open_time).collect::<Vec<_>>(), vec![t0, t1]);
    }
}
