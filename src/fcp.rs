//! FCP Orchestrator (C6): the failover control protocol itself — cache,
//! then bulk archive, then REST, per UTC day bucket, merged back into one
//! strictly-ordered frame. This module is the composition root; every other
//! module is a dependency of it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveError, ArchiveOutcome, ArchiveTransport, FetchOptions as ArchiveFetchOptions};
use crate::cache::{self, CacheError, CacheKey, CacheLookup, MissReason};
use crate::frame::{Candle, Frame, ProvenanceEntry, Source};
use crate::market::{MarketType, Symbol, SymbolError};
use crate::normalize::{self, GapAction, NormalizeError};
use crate::registry::{self, ChecksumFailureRecord};
use crate::rest::{self, FetchRangeOptions as RestFetchOptions, RateLimiter, RestError, RestTransport};
use crate::time::{self, Interval, TimeError};

/// How strictly the caller wants the provider chain honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnforceSource {
    /// Cache, then archive, then REST — the default failover chain.
    #[default]
    Any,
    /// Serve only from cache; a miss is `FcpError::Incomplete`, never a
    /// network call.
    CacheOnly,
    /// Skip REST entirely; archive-ineligible (too-recent) days are
    /// reported as incomplete rather than filled from REST.
    ArchiveOnly,
    /// Skip the bulk archive entirely, always use REST.
    RestOnly,
}

#[derive(Debug, Clone)]
pub struct FcpOptions {
    pub enforce_source: EnforceSource,
    pub use_cache: bool,
    /// Pad every interval missing from `[start, end)` with a NaN row instead
    /// of leaving it as a reported gap, so the returned frame always has
    /// exactly `ceil((end - start) / interval)` rows.
    pub auto_reindex: bool,
    pub publication_delay: chrono::Duration,
    pub parallelism: usize,
    pub gap_action: GapAction,
    pub proceed_on_checksum_failure: bool,
    /// See `FcpConfig::normalize_on_blocking_pool`.
    pub normalize_on_blocking_pool: bool,
}

impl Default for FcpOptions {
    fn default() -> Self {
        Self {
            enforce_source: EnforceSource::default(),
            use_cache: true,
            auto_reindex: false,
            publication_delay: chrono::Duration::hours(48),
            parallelism: 4,
            gap_action: GapAction::Report,
            proceed_on_checksum_failure: false,
            normalize_on_blocking_pool: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FcpError {
    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),
    #[error("invalid time range: {0}")]
    InvalidTimeRange(#[from] TimeError),
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("policy violation: {0}")]
    Policy(String),
    #[error("day {day} failed on every permitted source: {cache}, {archive}, {rest}")]
    AllSourcesFailed {
        day: NaiveDate,
        cache: String,
        archive: String,
        rest: String,
    },
    #[error("{0} day(s) could not be resolved under the current EnforceSource policy")]
    Incomplete(usize),
}

/// Composed result of a single [`FcpClient::get`] call.
#[derive(Debug, Clone)]
pub struct FcpResult {
    pub frame: Frame,
    pub provenance: Vec<ProvenanceEntry>,
}

pub struct FcpClient {
    provider: String,
    cache_root: PathBuf,
    logs_root: PathBuf,
    archive_base_url: String,
    archive_transport: Arc<dyn ArchiveTransport>,
    rest_transport: Arc<dyn RestTransport>,
    rate_limiter: Arc<RateLimiter>,
}

impl FcpClient {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        logs_root: impl Into<PathBuf>,
        archive_base_url: impl Into<String>,
        archive_transport: Arc<dyn ArchiveTransport>,
        rest_transport: Arc<dyn RestTransport>,
        rate_limit_weight_per_min: u32,
    ) -> Self {
        Self {
            provider: "binance".to_string(),
            cache_root: cache_root.into(),
            logs_root: logs_root.into(),
            archive_base_url: archive_base_url.into(),
            archive_transport,
            rest_transport,
            rate_limiter: Arc::new(RateLimiter::new(rate_limit_weight_per_min, Utc::now())),
        }
    }

    /// Fetch `[start, end)` of `symbol`/`interval` in `market`, failing over
    /// cache -> archive -> REST per UTC day, then merging into one frame.
    pub async fn get(
        &self,
        symbol_raw: &str,
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        opts: &FcpOptions,
    ) -> Result<FcpResult, FcpError> {
        let symbol = Symbol::validate(symbol_raw, market)?;
        interval.validate_for_market(market)?;
        if start >= end {
            return Err(TimeError::StartNotBeforeEnd { start, end }.into());
        }
        let now = Utc::now();
        if end > now {
            return Err(FcpError::Policy(format!("end ({end}) must not be in the future (now is {now})")));
        }

        let days = time::enumerate_days(start, end);
        let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));

        let mut tasks = Vec::with_capacity(days.len());
        for day in days {
            let semaphore = semaphore.clone();
            let symbol = symbol.clone();
            let opts = opts.clone();
            let this = self.clone_handles();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let outcome = this.resolve_day(&symbol, interval, market, day, now, &opts).await;
                (day, outcome)
            }));
        }

        let mut per_day = Vec::with_capacity(tasks.len());
        let mut incomplete = 0usize;
        for task in tasks {
            let (day, outcome) = task.await.expect("day-resolution task does not panic");
            match outcome {
                Ok(resolved) => per_day.push(resolved),
                Err(e) => {
                    warn!(component = "fcp", event = "fcp.day.unresolved", day = %day, error = %e);
                    incomplete += 1;
                }
            }
        }

        if incomplete > 0 {
            return Err(FcpError::Incomplete(incomplete));
        }

        per_day.sort_by_key(|r| r.day);

        let mut provenance = Vec::with_capacity(per_day.len());
        let mut all_rows: Vec<Candle> = Vec::new();
        for resolved in per_day {
            provenance.push(ProvenanceEntry { day: resolved.day, source: resolved.source });
            all_rows.extend(resolved.rows);
        }

        let gap_action = if opts.auto_reindex { GapAction::ImputeNan } else { opts.gap_action };
        let outcome = if opts.normalize_on_blocking_pool {
            tokio::task::spawn_blocking(move || normalize::normalize(all_rows, interval, Some((start, end)), gap_action))
                .await
                .expect("normalize blocking task does not panic")?
        } else {
            normalize::normalize(all_rows, interval, Some((start, end)), gap_action)?
        };
        if !outcome.gaps.is_empty() {
            info!(component = "fcp", event = "fcp.get.gaps_reported", count = outcome.gaps.len());
        }
        let frame = outcome.frame.trim(start, end);

        Ok(FcpResult { frame, provenance })
    }

    /// Cheap clone of the handles needed inside a spawned task, without
    /// cloning the whole client (which isn't `Clone` since it owns `String`s
    /// unnecessarily duplicated otherwise).
    fn clone_handles(&self) -> DayResolver {
        DayResolver {
            provider: self.provider.clone(),
            cache_root: self.cache_root.clone(),
            logs_root: self.logs_root.clone(),
            archive_base_url: self.archive_base_url.clone(),
            archive_transport: self.archive_transport.clone(),
            rest_transport: self.rest_transport.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

struct ResolvedDay {
    day: NaiveDate,
    rows: Vec<Candle>,
    source: Source,
}

/// Per-day resolution logic, split out so it can be moved into a spawned
/// task independently of `&FcpClient`'s lifetime.
#[derive(Clone)]
struct DayResolver {
    provider: String,
    cache_root: PathBuf,
    logs_root: PathBuf,
    archive_base_url: String,
    archive_transport: Arc<dyn ArchiveTransport>,
    rest_transport: Arc<dyn RestTransport>,
    rate_limiter: Arc<RateLimiter>,
}

impl DayResolver {
    async fn resolve_day(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        day: NaiveDate,
        now: DateTime<Utc>,
        opts: &FcpOptions,
    ) -> Result<ResolvedDay, FcpError> {
        let (day_start, day_end) = time::day_bounds(day);
        let key = CacheKey::new(self.provider.clone(), market, symbol.archive_symbol(), interval, day);
        let historical = time::is_past_publication_delay(day, now, opts.publication_delay);

        let mut cache_status = "disabled".to_string();

        if opts.use_cache {
            match cache::load(&self.cache_root, &key, now.timestamp()) {
                Ok(CacheLookup::Hit { frame, .. }) => {
                    debug!(component = "fcp", event = "fcp.day.cache_hit", day = %day);
                    return Ok(ResolvedDay { day, rows: frame.into_rows(), source: Source::Cache });
                }
                Ok(CacheLookup::Miss(reason)) => cache_status = describe_miss(&reason),
                Err(e) => cache_status = e.to_string(),
            }
        }

        if opts.enforce_source == EnforceSource::CacheOnly {
            return Err(FcpError::AllSourcesFailed {
                day,
                cache: cache_status,
                archive: "skipped (EnforceSource::CacheOnly)".into(),
                rest: "skipped (EnforceSource::CacheOnly)".into(),
            });
        }

        let mut archive_status = "skipped".to_string();
        if historical && opts.enforce_source != EnforceSource::RestOnly {
            match self.try_archive(symbol, interval, market, day, opts).await {
                Ok(Some(rows)) => {
                    self.maybe_store(&key, &rows, Source::Archive, opts);
                    return Ok(ResolvedDay { day, rows, source: Source::Archive });
                }
                Ok(None) => archive_status = "not found in archive".to_string(),
                Err(e) => {
                    archive_status = e.to_string();
                    warn!(component = "fcp", event = "fcp.day.archive_failed", day = %day, error = %e);
                }
            }
        }

        if opts.enforce_source == EnforceSource::ArchiveOnly {
            return Err(FcpError::AllSourcesFailed {
                day,
                cache: cache_status,
                archive: archive_status,
                rest: "skipped (EnforceSource::ArchiveOnly)".into(),
            });
        }

        match self.fetch_rest_day(symbol, interval, market, day_start, day_end).await {
            Ok(rows) => {
                // REST-sourced historical days are cached too, so a later
                // request for the same day doesn't re-hit REST for data the
                // archive will never publish differently.
                if historical {
                    self.maybe_store(&key, &rows, Source::Rest, opts);
                }
                Ok(ResolvedDay { day, rows, source: Source::Rest })
            }
            Err(e) => Err(FcpError::AllSourcesFailed {
                day,
                cache: cache_status,
                archive: archive_status,
                rest: e.to_string(),
            }),
        }
    }

    async fn try_archive(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        day: NaiveDate,
        opts: &FcpOptions,
    ) -> Result<Option<Vec<Candle>>, ArchiveError> {
        let fetch_opts = ArchiveFetchOptions {
            proceed_on_checksum_failure: opts.proceed_on_checksum_failure,
            ..ArchiveFetchOptions::default()
        };
        let result = archive::fetch_day(
            self.archive_transport.as_ref(),
            &self.archive_base_url,
            symbol,
            interval,
            market,
            day,
            &fetch_opts,
        )
        .await;

        match result {
            Ok(ArchiveOutcome::Found(rows)) => Ok(Some(rows)),
            Ok(ArchiveOutcome::NotFound) => Ok(None),
            Err(ArchiveError::ChecksumMismatch { expected, actual, .. }) if !opts.proceed_on_checksum_failure => {
                let record = ChecksumFailureRecord {
                    symbol: symbol.archive_symbol().to_string(),
                    interval: interval.as_str().to_string(),
                    date: day,
                    expected,
                    actual,
                    action: "quarantined_fallthrough_to_rest".to_string(),
                    timestamp: Utc::now(),
                    resolved: false,
                };
                if let Err(e) = registry::append(&self.logs_root, record) {
                    warn!(component = "fcp", event = "fcp.registry.append_failed", error = %e);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_rest_day(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, RestError> {
        rest::fetch_range(
            self.rest_transport.as_ref(),
            &self.rate_limiter,
            symbol,
            interval,
            market,
            day_start,
            day_end,
            &RestFetchOptions::default(),
        )
        .await
    }

    fn maybe_store(&self, key: &CacheKey, rows: &[Candle], source: Source, opts: &FcpOptions) {
        if !opts.use_cache {
            return;
        }
        let frame = Frame::new(rows.to_vec());
        if let Err(e) = cache::store(&self.cache_root, key, &frame, source) {
            warn!(component = "fcp", event = "fcp.cache.store_failed", error = %e);
        }
    }
}

fn describe_miss(reason: &MissReason) -> String {
    match reason {
        MissReason::NotFound => "not found".to_string(),
        MissReason::ChecksumMismatch { .. } => "checksum mismatch".to_string(),
        MissReason::SchemaVersionMismatch { found } => format!("schema version mismatch (found {found})"),
        MissReason::Corrupt(msg) => format!("corrupt: {msg}"),
    }
}

impl From<CacheError> for FcpError {
    fn from(e: CacheError) -> Self {
        FcpError::Policy(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockArchive {
        days: Mutex<HashMap<NaiveDate, Vec<Candle>>>,
    }

    #[async_trait]
    impl ArchiveTransport for MockArchive {
        async fn get(&self, _url: &str) -> Result<Option<bytes::Bytes>, ArchiveError> {
            // Not exercised directly: these orchestrator tests stub at the
            // fetch_day level isn't possible without a transport seam here,
            // so archive days are deliberately left unregistered (404) and
            // the orchestrator is expected to fail over to REST.
            Ok(None)
        }
    }

    struct MockRest {
        rows_by_day: Mutex<HashMap<NaiveDate, Vec<Candle>>>,
    }

    #[async_trait]
    impl RestTransport for MockRest {
        async fn fetch_page(
            &self,
            _symbol: &Symbol,
            _interval: Interval,
            _market: MarketType,
            start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: u32,
        ) -> Result<rest::Page, RestError> {
            let day = start.date_naive();
            let rows = self.rows_by_day.lock().unwrap().get(&day).cloned().unwrap_or_default();
            Ok(rest::Page { rows, weight_used: 1 })
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
    async fn falls_through_to_rest_when_archive_has_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Interval::M1.duration() * 2;

        let mut rows = HashMap::new();
        rows.insert(start.date_naive(), vec![candle_at(start), candle_at(start + Interval::M1.duration())]);

        let client = FcpClient::new(
            dir.path(),
            dir.path().join("logs"),
            "https://data.example",
            Arc::new(MockArchive { days: Mutex::new(HashMap::new()) }),
            Arc::new(MockRest { rows_by_day: Mutex::new(rows) }),
            6000,
        );

        let mut opts = FcpOptions::default();
        opts.publication_delay = chrono::Duration::hours(0);

        let result = client
            .get("BTCUSDT", Interval::M1, MarketType::Spot, start, end, &opts)
            .await
            .unwrap();

        assert_eq!(result.frame.len(), 2);
        assert_eq!(result.provenance.len(), 1);
        assert_eq!(result.provenance[0].source, Source::Rest);
    }

    #[tokio::test]
    async fn cache_only_reports_incomplete_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Interval::M1.duration();

        let client = FcpClient::new(
            dir.path(),
            dir.path().join("logs"),
            "https://data.example",
            Arc::new(MockArchive { days: Mutex::new(HashMap::new()) }),
            Arc::new(MockRest { rows_by_day: Mutex::new(HashMap::new()) }),
            6000,
        );

        let mut opts = FcpOptions::default();
        opts.enforce_source = EnforceSource::CacheOnly;

        let err = client
            .get("BTCUSDT", Interval::M1, MarketType::Spot, start, end, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, FcpError::Incomplete(1)));
    }

    #[tokio::test]
    async fn rejects_start_not_before_end() {
        let dir = tempfile::tempdir().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let client = FcpClient::new(
            dir.path(),
            dir.path().join("logs"),
            "https://data.example",
            Arc::new(MockArchive { days: Mutex::new(HashMap::new()) }),
            Arc::new(MockRest { rows_by_day: Mutex::new(HashMap::new()) }),
            6000,
        );
        let err = client.get("BTCUSDT", Interval::M1, MarketType::Spot, t, t, &FcpOptions::default()).await.unwrap_err();
        assert!(matches!(err, FcpError::InvalidTimeRange(_)));
    }

    #[tokio::test]
    async fn rejects_end_in_the_future() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc::now() + chrono::Duration::days(3650);
        let client = FcpClient::new(
            dir.path(),
            dir.path().join("logs"),
            "https://data.example",
            Arc::new(MockArchive { days: Mutex::new(HashMap::new()) }),
            Arc::new(MockRest { rows_by_day: Mutex::new(HashMap::new()) }),
            6000,
        );
        let err = client.get("BTCUSDT", Interval::M1, MarketType::Spot, start, end, &FcpOptions::default()).await.unwrap_err();
        assert!(matches!(err, FcpError::Policy(_)));
    }

    #[tokio::test]
    async fn auto_reindex_pads_missing_intervals_with_nan() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Interval::M1.duration() * 3;

        // Only the first and third minute have data; the second is a gap.
        let mut rows = HashMap::new();
        rows.insert(start.date_naive(), vec![candle_at(start), candle_at(start + Interval::M1.duration() * 2)]);

        let client = FcpClient::new(
            dir.path(),
            dir.path().join("logs"),
            "https://data.example",
            Arc::new(MockArchive { days: Mutex::new(HashMap::new()) }),
            Arc::new(MockRest { rows_by_day: Mutex::new(rows) }),
            6000,
        );

        let mut opts = FcpOptions::default();
        opts.publication_delay = chrono::Duration::hours(0);
        opts.auto_reindex = true;

        let result = client
            .get("BTCUSDT", Interval::M1, MarketType::Spot, start, end, &opts)
            .await
            .unwrap();

        assert_eq!(result.frame.len(), 3);
        let middle = &result.frame.rows[1];
        assert!(middle.imputed);
        assert!(middle.open.is_nan());
    }
}
