//! Cache Store (C2): per-day immutable columnar files, keyed by a composite
//! path, integrity-checked via an embedded content checksum. Single-writer,
//! multi-reader; not guarded against multi-process writers, only documented.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    BooleanArray, Float64Array, TimestampNanosecondArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

use crate::frame::{Candle, Frame, Source};
use crate::market::MarketType;
use crate::time::Interval;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: String,
    pub market_type: MarketType,
    pub data_nature: &'static str,
    pub packaging: &'static str,
    pub symbol: String,
    pub interval: Interval,
    pub date: NaiveDate,
}

impl CacheKey {
    pub fn new(provider: impl Into<String>, market_type: MarketType, symbol: impl Into<String>, interval: Interval, date: NaiveDate) -> Self {
        Self {
            provider: provider.into(),
            market_type,
            data_nature: "klines",
            packaging: "daily",
            symbol: symbol.into(),
            interval,
            date,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("arrow error at {path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    ChecksumMismatch { expected: String, actual: String },
    SchemaVersionMismatch { found: u32 },
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheMeta {
    pub source: Source,
    pub row_count: usize,
    pub content_sha256: String,
    pub min_open_time_ns: i64,
    pub max_open_time_ns: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit { frame: Frame, meta: CacheMeta },
    Miss(MissReason),
}

/// Pure path computation — `root/{provider}/{market_type}/{data_nature}/{packaging}/{symbol}/{interval}/{date}.arrow`.
pub fn locate(root: &Path, key: &CacheKey) -> PathBuf {
    root.join(&key.provider)
        .join(key.market_type.cache_path_segment())
        .join(key.data_nature)
        .join(key.packaging)
        .join(&key.symbol)
        .join(key.interval.as_str())
        .join(format!("{}.arrow", key.date.format("%Y-%m-%d")))
}

pub fn load(root: &Path, key: &CacheKey, now_suffix: i64) -> Result<CacheLookup, CacheError> {
    let path = locate(root, key);
    if !path.exists() {
        return Ok(CacheLookup::Miss(MissReason::NotFound));
    }

    let file = std::fs::File::open(&path).map_err(|e| CacheError::Io { path: path.clone(), source: e })?;
    let reader = match FileReader::try_new(file, None) {
        Ok(r) => r,
        Err(e) => {
            warn!(component = "cache", event = "cache.load.corrupt", path = %path.display(), error = %e);
            quarantine(&path, now_suffix);
            return Ok(CacheLookup::Miss(MissReason::Corrupt(e.to_string())));
        }
    };

    let schema = reader.schema();
    let metadata = schema.metadata();
    let schema_version: u32 = metadata
        .get("schema_version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if schema_version != SCHEMA_VERSION {
        warn!(component = "cache", event = "cache.load.schema_mismatch", path = %path.display(), found = schema_version);
        return Ok(CacheLookup::Miss(MissReason::SchemaVersionMismatch { found: schema_version }));
    }

    let source_str = metadata.get("source").cloned().unwrap_or_default();
    let source = match source_str.as_str() {
        "archive" => Source::Archive,
        "rest" => Source::Rest,
        "imputed" => Source::Imputed,
        _ => Source::Cache,
    };
    let expected = metadata.get("content_sha256").cloned().unwrap_or_default();
    let min_open_time_ns: i64 = metadata.get("min_open_time_ns").and_then(|v| v.parse().ok()).unwrap_or(0);
    let max_open_time_ns: i64 = metadata.get("max_open_time_ns").and_then(|v| v.parse().ok()).unwrap_or(0);

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| CacheError::Arrow { path: path.clone(), source: e })?;
        rows.extend(batch_to_candles(&batch));
    }
    rows.sort_by_key(|r| r.open_time);

    // The embedded checksum can't cover its own field, so it was computed
    // over the checksum-empty serialization at write time. Re-derive that
    // same serialization from the decoded rows and hash it, rather than
    // hashing the file's own bytes (which would always disagree, since they
    // carry the real checksum).
    let recomputed_batch = candles_to_batch(&rows);
    let provisional = serialize_batch(&recomputed_batch, source, rows.len(), min_open_time_ns, max_open_time_ns, "")
        .map_err(|e| CacheError::Arrow { path: path.clone(), source: e })?;
    let actual = hex::encode(Sha256::digest(&provisional));
    if !expected.eq_ignore_ascii_case(&actual) {
        warn!(
            component = "cache",
            event = "cache.load.checksum_mismatch",
            path = %path.display(),
            expected = %expected,
            actual = %actual,
        );
        quarantine(&path, now_suffix);
        return Ok(CacheLookup::Miss(MissReason::ChecksumMismatch { expected, actual }));
    }

    info!(component = "cache", event = "cache.load.hit", path = %path.display(), rows = rows.len());

    let row_count = rows.len();
    Ok(CacheLookup::Hit {
        frame: Frame::new(rows),
        meta: CacheMeta {
            source,
            row_count,
            content_sha256: expected,
            min_open_time_ns,
            max_open_time_ns,
        },
    })
}

fn quarantine(path: &Path, suffix: i64) {
    let quarantined = path.with_extension(format!("arrow.corrupt-{suffix}"));
    if let Err(e) = std::fs::rename(path, &quarantined) {
        warn!(component = "cache", event = "cache.quarantine.failed", path = %path.display(), error = %e);
    }
}

pub fn store(root: &Path, key: &CacheKey, frame: &Frame, source: Source) -> Result<CacheMeta, CacheError> {
    let path = locate(root, key);
    let dir = path.parent().expect("cache path always has a parent").to_path_buf();
    std::fs::create_dir_all(&dir).map_err(|e| CacheError::Io { path: dir.clone(), source: e })?;

    let batch = candles_to_batch(&frame.rows);
    let min_ns = frame.min_open_time().map(|t| t.timestamp_nanos_opt().unwrap_or(0)).unwrap_or(0);
    let max_ns = frame.max_open_time().map(|t| t.timestamp_nanos_opt().unwrap_or(0)).unwrap_or(0);

    // First pass: serialize without a checksum to compute content_sha256,
    // then rewrite with the checksum embedded (IPC metadata is schema-level,
    // so it must be set before the final write).
    let provisional = serialize_batch(&batch, source, frame.rows.len(), min_ns, max_ns, "")
        .map_err(|e| CacheError::Arrow { path: path.clone(), source: e })?;
    let content_sha256 = hex::encode(Sha256::digest(&provisional));
    let final_bytes = serialize_batch(&batch, source, frame.rows.len(), min_ns, max_ns, &content_sha256)
        .map_err(|e| CacheError::Arrow { path: path.clone(), source: e })?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| CacheError::Io { path: dir.clone(), source: e })?;
    use std::io::Write;
    tmp.write_all(&final_bytes).map_err(|e| CacheError::Io { path: dir.clone(), source: e })?;
    tmp.as_file().sync_all().map_err(|e| CacheError::Io { path: dir.clone(), source: e })?;
    tmp.persist(&path).map_err(|e| CacheError::Io { path: path.clone(), source: e.error })?;

    info!(component = "cache", event = "cache.store.written", path = %path.display(), rows = frame.rows.len());

    Ok(CacheMeta {
        source,
        row_count: frame.rows.len(),
        content_sha256,
        min_open_time_ns: min_ns,
        max_open_time_ns: max_ns,
    })
}

pub fn invalidate(root: &Path, key: &CacheKey) -> Result<(), CacheError> {
    let path = locate(root, key);
    if path.exists() {
        std::fs::remove_file(&path).map_err(|e| CacheError::Io { path, source: e })?;
    }
    Ok(())
}

fn arrow_schema(source: Source, row_count: usize, min_ns: i64, max_ns: i64, content_sha256: &str) -> Arc<Schema> {
    let fields = vec![
        Field::new("open_time", DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())), false),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
        Field::new("close_time", DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())), false),
        Field::new("quote_asset_volume", DataType::Float64, false),
        Field::new("trade_count", DataType::UInt64, false),
        Field::new("taker_buy_base_volume", DataType::Float64, false),
        Field::new("taker_buy_quote_volume", DataType::Float64, false),
        Field::new("imputed", DataType::Boolean, false),
    ];
    let metadata = std::collections::HashMap::from([
        ("schema_version".to_string(), SCHEMA_VERSION.to_string()),
        ("source".to_string(), source.as_str().to_string()),
        ("row_count".to_string(), row_count.to_string()),
        ("content_sha256".to_string(), content_sha256.to_string()),
        ("min_open_time_ns".to_string(), min_ns.to_string()),
        ("max_open_time_ns".to_string(), max_ns.to_string()),
    ]);
    Arc::new(Schema::new(fields).with_metadata(metadata))
}

fn candles_to_batch(rows: &[Candle]) -> RecordBatch {
    let open_time: Vec<i64> = rows.iter().map(|r| r.open_time.timestamp_nanos_opt().unwrap_or(0)).collect();
    let close_time: Vec<i64> = rows.iter().map(|r| r.close_time.timestamp_nanos_opt().unwrap_or(0)).collect();
    let open: Vec<f64> = rows.iter().map(|r| r.open).collect();
    let high: Vec<f64> = rows.iter().map(|r| r.high).collect();
    let low: Vec<f64> = rows.iter().map(|r| r.low).collect();
    let close: Vec<f64> = rows.iter().map(|r| r.close).collect();
    let volume: Vec<f64> = rows.iter().map(|r| r.volume).collect();
    let quote_asset_volume: Vec<f64> = rows.iter().map(|r| r.quote_asset_volume).collect();
    let trade_count: Vec<u64> = rows.iter().map(|r| r.trade_count).collect();
    let taker_buy_base_volume: Vec<f64> = rows.iter().map(|r| r.taker_buy_base_volume).collect();
    let taker_buy_quote_volume: Vec<f64> = rows.iter().map(|r| r.taker_buy_quote_volume).collect();
    let imputed: Vec<bool> = rows.iter().map(|r| r.imputed).collect();

    let schema = arrow_schema(Source::Cache, rows.len(), 0, 0, "");
    // field types only (metadata ignored for the in-memory batch); the real
    // schema with metadata is attached by the IPC writer in serialize_batch.
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampNanosecondArray::from(open_time).with_timezone("UTC")),
            Arc::new(Float64Array::from(open)),
            Arc::new(Float64Array::from(high)),
            Arc::new(Float64Array::from(low)),
            Arc::new(Float64Array::from(close)),
            Arc::new(Float64Array::from(volume)),
            Arc::new(TimestampNanosecondArray::from(close_time).with_timezone("UTC")),
            Arc::new(Float64Array::from(quote_asset_volume)),
            Arc::new(UInt64Array::from(trade_count)),
            Arc::new(Float64Array::from(taker_buy_base_volume)),
            Arc::new(Float64Array::from(taker_buy_quote_volume)),
            Arc::new(BooleanArray::from(imputed)),
        ],
    )
    .expect("column lengths always match row count")
}

fn serialize_batch(
    batch: &RecordBatch,
    source: Source,
    row_count: usize,
    min_ns: i64,
    max_ns: i64,
    content_sha256: &str,
) -> Result<Vec<u8>, arrow::error::ArrowError> {
    let schema = arrow_schema(source, row_count, min_ns, max_ns, content_sha256);
    let retyped = RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?;
    let mut buf = Vec::new();
    {
        let mut writer = FileWriter::try_new(&mut buf, &schema)?;
        writer.write(&retyped)?;
        writer.finish()?;
    }
    Ok(buf)
}

fn batch_to_candles(batch: &RecordBatch) -> Vec<Candle> {
    let open_time = batch.column(0).as_any().downcast_ref::<TimestampNanosecondArray>().unwrap();
    let open = batch.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
    let high = batch.column(2).as_any().downcast_ref::<Float64Array>().unwrap();
    let low = batch.column(3).as_any().downcast_ref::<Float64Array>().unwrap();
    let close = batch.column(4).as_any().downcast_ref::<Float64Array>().unwrap();
    let volume = batch.column(5).as_any().downcast_ref::<Float64Array>().unwrap();
    let close_time = batch.column(6).as_any().downcast_ref::<TimestampNanosecondArray>().unwrap();
    let quote_asset_volume = batch.column(7).as_any().downcast_ref::<Float64Array>().unwrap();
    let trade_count = batch.column(8).as_any().downcast_ref::<UInt64Array>().unwrap();
    let taker_buy_base_volume = batch.column(9).as_any().downcast_ref::<Float64Array>().unwrap();
    let taker_buy_quote_volume = batch.column(10).as_any().downcast_ref::<Float64Array>().unwrap();
    let imputed = batch.column(11).as_any().downcast_ref::<BooleanArray>().unwrap();

    (0..batch.num_rows())
        .map(|i| Candle {
            open_time: DateTime::<Utc>::from_timestamp_nanos(open_time.value(i)),
            open: open.value(i),
            high: high.value(i),
            low: low.value(i),
            close: close.value(i),
            volume: volume.value(i),
            close_time: DateTime::<Utc>::from_timestamp_nanos(close_time.value(i)),
            quote_asset_volume: quote_asset_volume.value(i),
            trade_count: trade_count.value(i),
            taker_buy_base_volume: taker_buy_base_volume.value(i),
            taker_buy_quote_volume: taker_buy_quote_volume.value(i),
            imputed: imputed.value(i),
        })
        .collect()
}

/// True if the path for `key` already exists, used by operator tooling
/// (`kline-fcp cache-stat`) without needing a full load.
pub fn exists(root: &Path, key: &CacheKey) -> bool {
    locate(root, key).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Interval;
    use chrono::TimeZone;

    fn sample_frame() -> Frame {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let rows: Vec<Candle> = (0..3)
            .map(|i| {
                let ot = t0 + Interval::H1.duration() * i;
                Candle {
                    open_time: ot,
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.5 + i as f64,
                    volume: 10.0,
                    close_time: Candle::expected_close_time(ot, Interval::H1),
                    quote_asset_volume: 1000.0,
                    trade_count: 5,
                    taker_buy_base_volume: 1.0,
                    taker_buy_quote_volume: 100.0,
                    imputed: false,
                }
            })
            .collect();
        Frame::new(rows)
    }

    #[test]
    fn round_trip_store_then_load_is_row_wise_equal() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("binance", MarketType::Spot, "BTCUSDT", Interval::H1, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let frame = sample_frame();
        let meta = store(dir.path(), &key, &frame, Source::Archive).unwrap();

        match load(dir.path(), &key, 1).unwrap() {
            CacheLookup::Hit { frame: loaded, meta: loaded_meta } => {
                assert_eq!(loaded.rows, frame.rows);
                assert_eq!(loaded_meta.content_sha256, meta.content_sha256);
            }
            CacheLookup::Miss(reason) => panic!("expected hit, got miss: {reason:?}"),
        }
    }

    #[test]
    fn corrupted_checksum_demotes_to_miss_and_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("binance", MarketType::Spot, "BTCUSDT", Interval::H1, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        store(dir.path(), &key, &sample_frame(), Source::Archive).unwrap();

        let path = locate(dir.path(), &key);
        let mut bytes = std::fs::read(&path).unwrap();
        *bytes.last_mut().unwrap() ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        match load(dir.path(), &key, 42).unwrap() {
            CacheLookup::Miss(MissReason::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch miss, got {other:?}"),
        }
        assert!(!path.exists());
        assert!(path.with_extension("arrow.corrupt-42").exists());
    }

    #[test]
    fn missing_file_is_a_plain_miss() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("binance", MarketType::Spot, "ETHUSDT", Interval::M1, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(load(dir.path(), &key, 1).unwrap(), CacheLookup::Miss(MissReason::NotFound));
    }

    #[test]
    fn path_schema_matches_spec() {
        let key = CacheKey::new("binance", MarketType::FuturesCoin, "BTCUSD_PERP", Interval::D1, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let path = locate(Path::new("/cache"), &key);
        assert_eq!(
            path,
            PathBuf::from("/cache/binance/futures_coin/klines/daily/BTCUSD_PERP/1d/2024-03-01.arrow")
        );
    }
}
