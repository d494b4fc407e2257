//! REST Adapter (C4): paginated fetch for recent/unarchived ranges, with
//! anti-duplicate cursor advance and a per-minute weight budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::frame::Candle;
use crate::market::{MarketType, Symbol};
use crate::time::Interval;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },
    #[error("rate limited by {endpoint}, retry after {retry_after_secs}s")]
    RateLimited { endpoint: String, retry_after_secs: u64 },
    #[error("{endpoint} rejected the request (HTTP 403): {message}")]
    Forbidden { endpoint: String, message: String },
    #[error("malformed response body from {endpoint}: {message}")]
    MalformedBody { endpoint: String, message: String },
}

/// One page of rows plus whatever server-reported weight it consumed.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<Candle>,
    pub weight_used: u32,
}

#[async_trait]
pub trait RestTransport: Send + Sync {
    /// Fetch one page starting at `start` (inclusive), at most `limit` rows.
    async fn fetch_page(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Page, RestError>;
}

/// Token-bucket rate limiter keyed on a rolling one-minute window, guarding
/// the shared REST weight budget across concurrent day-bucket fetches.
pub struct RateLimiter {
    inner: Mutex<RateLimiterState>,
    budget_per_min: u32,
}

struct RateLimiterState {
    window_start: DateTime<Utc>,
    used: u32,
}

impl RateLimiter {
    pub fn new(budget_per_min: u32, now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(RateLimiterState { window_start: now, used: 0 }),
            budget_per_min,
        }
    }

    /// Reserve `weight` against the current minute window, sleeping out the
    /// remainder of the window if the budget would be exceeded.
    pub async fn acquire(&self, weight: u32, now: impl Fn() -> DateTime<Utc>) {
        loop {
            let mut state = self.inner.lock().await;
            let elapsed = now() - state.window_start;
            if elapsed >= chrono::Duration::minutes(1) {
                state.window_start = now();
                state.used = 0;
            }
            if state.used + weight <= self.budget_per_min {
                state.used += weight;
                return;
            }
            let wait = chrono::Duration::minutes(1) - elapsed;
            drop(state);
            let millis = wait.num_milliseconds().max(0) as u64;
            tokio::time::sleep(StdDuration::from_millis(millis)).await;
        }
    }
}

pub struct FetchRangeOptions {
    pub page_limit: u32,
    pub max_retries: u32,
    pub weight_per_request: u32,
}

impl Default for FetchRangeOptions {
    fn default() -> Self {
        Self { page_limit: 1000, max_retries: 3, weight_per_request: 2 }
    }
}

/// Fetch `[start, end)` by repeated pagination. The cursor always advances to
/// `last_row.open_time + interval`, never to `last_row.open_time` itself —
/// using the raw value would re-request the final row of the prior page
/// forever.
pub async fn fetch_range(
    transport: &dyn RestTransport,
    limiter: &RateLimiter,
    symbol: &Symbol,
    interval: Interval,
    market: MarketType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    opts: &FetchRangeOptions,
) -> Result<Vec<Candle>, RestError> {
    let mut out = Vec::new();
    let mut cursor = start;
    let step = interval.duration();

    while cursor < end {
        limiter.acquire(opts.weight_per_request, Utc::now).await;

        let page = retry_page(transport, opts.max_retries, symbol, interval, market, cursor, end, opts.page_limit).await?;

        if page.rows.is_empty() {
            debug!(component = "rest", event = "rest.page.empty", cursor = %cursor);
            break;
        }

        let last_open_time = page.rows.last().map(|r| r.open_time).expect("checked non-empty above");
        out.extend(page.rows);

        let next_cursor = last_open_time + step;
        if next_cursor <= cursor {
            // Defensive: a misbehaving transport that doesn't advance would
            // spin forever; treat it as exhausted.
            warn!(component = "rest", event = "rest.page.cursor_stalled", cursor = %cursor);
            break;
        }
        cursor = next_cursor;
    }

    Ok(out)
}

async fn retry_page(
    transport: &dyn RestTransport,
    max_retries: u32,
    symbol: &Symbol,
    interval: Interval,
    market: MarketType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: u32,
) -> Result<Page, RestError> {
    let mut attempt = 0u32;
    loop {
        match transport.fetch_page(symbol, interval, market, start, end, limit).await {
            Ok(page) => return Ok(page),
            Err(RestError::RateLimited { retry_after_secs, .. }) => {
                debug!(component = "rest", event = "rest.page.rate_limited", retry_after_secs);
                tokio::time::sleep(StdDuration::from_secs(retry_after_secs)).await;
            }
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                let backoff = StdDuration::from_millis(200 * 2u64.pow(attempt - 1));
                warn!(component = "rest", event = "rest.page.retry", attempt, error = %e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

pub struct ReqwestRestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestRestTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }

    fn endpoint(&self, market: MarketType) -> String {
        match market {
            MarketType::Spot => format!("{}/api/v3/klines", self.base_url),
            MarketType::FuturesUsdt => format!("{}/fapi/v1/klines", self.base_url),
            MarketType::FuturesCoin => format!("{}/dapi/v1/klines", self.base_url),
        }
    }
}

#[async_trait]
impl RestTransport for ReqwestRestTransport {
    async fn fetch_page(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Page, RestError> {
        let endpoint = self.endpoint(market);
        let resp = tokio::time::timeout(
            StdDuration::from_secs(10),
            self.client
                .get(&endpoint)
                .query(&[
                    ("symbol", symbol.archive_symbol().to_string()),
                    ("interval", interval.as_str().to_string()),
                    ("startTime", start.timestamp_millis().to_string()),
                    ("endTime", (end.timestamp_millis() - 1).to_string()),
                    ("limit", limit.to_string()),
                ])
                .send(),
        )
        .await
        .map_err(|_| RestError::Timeout { endpoint: endpoint.clone() })?
        .map_err(|e| RestError::Transport { endpoint: endpoint.clone(), message: e.to_string() })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(RestError::RateLimited { endpoint, retry_after_secs });
        }
        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            // Seen in practice when a future/unpublished timestamp is queried.
            return Err(RestError::Forbidden { endpoint, message: "future or disallowed timestamp range".into() });
        }
        if !resp.status().is_success() {
            return Err(RestError::Transport { endpoint, message: format!("unexpected HTTP status {}", resp.status()) });
        }

        let weight_used = resp
            .headers()
            .get("x-mbx-used-weight-1m")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let body: Vec<Vec<serde_json::Value>> = resp
            .json()
            .await
            .map_err(|e| RestError::MalformedBody { endpoint: endpoint.clone(), message: e.to_string() })?;

        let rows = body
            .into_iter()
            .map(|row| parse_rest_row(&endpoint, &row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page { rows, weight_used })
    }
}

fn parse_rest_row(endpoint: &str, row: &[serde_json::Value]) -> Result<Candle, RestError> {
    let malformed = || RestError::MalformedBody { endpoint: endpoint.to_string(), message: "unexpected row shape".into() };
    let get_i64 = |idx: usize| row.get(idx).and_then(|v| v.as_i64()).ok_or_else(malformed);
    let get_f64_str = |idx: usize| {
        row.get(idx)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(malformed)
    };
    let get_u64 = |idx: usize| row.get(idx).and_then(|v| v.as_u64()).ok_or_else(malformed);

    Ok(Candle {
        open_time: DateTime::<Utc>::from_timestamp_millis(get_i64(0)?).ok_or_else(malformed)?,
        open: get_f64_str(1)?,
        high: get_f64_str(2)?,
        low: get_f64_str(3)?,
        close: get_f64_str(4)?,
        volume: get_f64_str(5)?,
        close_time: DateTime::<Utc>::from_timestamp_millis(get_i64(6)?).ok_or_else(malformed)?,
        quote_asset_volume: get_f64_str(7)?,
        trade_count: get_u64(8)?,
        taker_buy_base_volume: get_f64_str(9)?,
        taker_buy_quote_volume: get_f64_str(10)?,
        imputed: false,
    })
}

/// Shared handle injected into the orchestrator; cheap to clone.
pub type SharedRateLimiter = Arc<RateLimiter>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        pages: StdMutex<VecDeque<Result<Page, RestError>>>,
    }

    #[async_trait]
    impl RestTransport for ScriptedTransport {
        async fn fetch_page(
            &self,
            _symbol: &Symbol,
            _interval: Interval,
            _market: MarketType,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Page, RestError> {
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page { rows: vec![], weight_used: 1 }))
        }
    }

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

    #[tokio::test]
    async fn cursor_advances_past_last_row_not_onto_it() {
        let symbol = Symbol::validate("BTCUSDT", MarketType::Spot).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Interval::M1.duration() * 4;

        let page1 = Page {
            rows: vec![candle_at(start), candle_at(start + Interval::M1.duration())],
            weight_used: 1,
        };
        let page2 = Page {
            rows: vec![
                candle_at(start + Interval::M1.duration() * 2),
                candle_at(start + Interval::M1.duration() * 3),
            ],
            weight_used: 1,
        };
        let transport = ScriptedTransport { pages: StdMutex::new(VecDeque::from([Ok(page1), Ok(page2)])) };
        let limiter = RateLimiter::new(6000, start);

        let rows = fetch_range(&transport, &limiter, &symbol, Interval::M1, MarketType::Spot, start, end, &FetchRangeOptions::default())
            .await
            .unwrap();

        assert_eq!(rows.len(), 4);
        assert_eq!(rows.iter().map(|r| r.open_time).collect::<Vec<_>>(), (0..4).map(|i| start + Interval::M1.duration() * i).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_page_terminates_pagination() {
        let symbol = Symbol::validate("BTCUSDT", MarketType::Spot).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Interval::M1.duration() * 10;
        let transport = ScriptedTransport { pages: StdMutex::new(VecDeque::from([Ok(Page { rows: vec![], weight_used: 1 })])) };
        let limiter = RateLimiter::new(6000, start);

        let rows = fetch_range(&transport, &limiter, &symbol, Interval::M1, MarketType::Spot, start, end, &FetchRangeOptions::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn rate_limiter_blocks_past_budget_within_same_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let limiter = RateLimiter::new(10, start);
        limiter.acquire(8, || start).await;
        let state = limiter.inner.lock().await;
        assert_eq!(state.used, 8);
    }
}
