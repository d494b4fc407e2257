use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use kline_fcp::archive::ReqwestArchiveTransport;
use kline_fcp::cache::CacheKey;
use kline_fcp::config::FcpConfig;
use kline_fcp::fcp::{FcpClient, FcpOptions};
use kline_fcp::market::MarketType;
use kline_fcp::rest::ReqwestRestTransport;
use kline_fcp::time::{self, Interval};
use kline_fcp::{CacheStatArgs, FetchArgs, RetryChecksumsArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Failover Control Protocol retrieval of historical OHLCV klines")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Fetch(FetchArgs),
    CacheStat(CacheStatArgs),
    RetryChecksums(RetryChecksumsArgs),
}

fn parse_market(raw: &str) -> Result<MarketType> {
    Ok(match raw {
        "spot" => MarketType::Spot,
        "futures-usdt" => MarketType::FuturesUsdt,
        "futures-coin" => MarketType::FuturesCoin,
        other => return Err(anyhow!("unknown market '{other}', expected spot|futures-usdt|futures-coin")),
    })
}

fn parse_interval(raw: &str) -> Result<Interval> {
    Interval::parse(raw).ok_or_else(|| anyhow!("unknown interval '{raw}'"))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("'{raw}' is neither RFC3339 nor YYYY-MM-DD"))?;
    Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is always valid")))
}

fn build_client(config: &FcpConfig) -> FcpClient {
    let http = reqwest::Client::builder()
        .user_agent("kline-fcp/0.1")
        .build()
        .expect("reqwest client builds with default TLS backend");
    FcpClient::new(
        config.cache_root.clone(),
        config.logs_root.clone(),
        config.archive_base_url.clone(),
        Arc::new(ReqwestArchiveTransport::new(http.clone())),
        Arc::new(ReqwestRestTransport::new(http, config.rest_base_url.clone())),
        config.rate_limit_weight_per_min,
    )
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let market = parse_market(&args.market)?;
    let interval = parse_interval(&args.interval)?;
    let start = parse_timestamp(&args.start)?;
    let end = parse_timestamp(&args.end)?;

    let client = build_client(&args.config);
    let opts = FcpOptions {
        use_cache: true,
        auto_reindex: args.auto_reindex,
        publication_delay: args.config.publication_delay(),
        parallelism: args.config.parallelism,
        gap_action: args.config.gap_action.into(),
        proceed_on_checksum_failure: args.config.proceed_on_checksum_failure,
        normalize_on_blocking_pool: args.config.normalize_on_blocking_pool,
        ..FcpOptions::default()
    };

    let result = client.get(&args.symbol, interval, market, start, end, &opts).await?;
    tracing::info!(
        component = "cli",
        event = "cli.fetch.done",
        rows = result.frame.len(),
        days = result.provenance.len(),
    );

    write_csv(&result.frame, args.out.as_deref())
}

fn write_csv(frame: &kline_fcp::frame::Frame, out: Option<&Path>) -> Result<()> {
    let sink: Box<dyn std::io::Write> = match out {
        Some(path) => Box::new(std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?),
        None => Box::new(std::io::stdout()),
    };
    let mut writer = csv::Writer::from_writer(sink);
    writer.write_record([
        "open_time", "open", "high", "low", "close", "volume", "close_time",
        "quote_asset_volume", "trade_count", "taker_buy_base_volume", "taker_buy_quote_volume", "imputed",
    ])?;
    for row in &frame.rows {
        writer.write_record(&[
            row.open_time.to_rfc3339(),
            row.open.to_string(),
            row.high.to_string(),
            row.low.to_string(),
            row.close.to_string(),
            row.volume.to_string(),
            row.close_time.to_rfc3339(),
            row.quote_asset_volume.to_string(),
            row.trade_count.to_string(),
            row.taker_buy_base_volume.to_string(),
            row.taker_buy_quote_volume.to_string(),
            row.imputed.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn run_cache_stat(args: CacheStatArgs) -> Result<()> {
    let market = parse_market(&args.market)?;
    let interval = parse_interval(&args.interval)?;
    let start = parse_timestamp(&args.start)?;
    let end = parse_timestamp(&args.end)?;

    let days = time::enumerate_days(start, end);
    let mut present = 0usize;
    for day in &days {
        let key = CacheKey::new("binance", market, args.symbol.clone(), interval, *day);
        if kline_fcp::cache::exists(&args.cache_root, &key) {
            present += 1;
        } else {
            println!("missing: {day}");
        }
    }
    println!("{present}/{} days cached", days.len());

    let quarantined = count_quarantined(&args.cache_root)?;
    if quarantined > 0 {
        println!("{quarantined} quarantined file(s) under {}", args.cache_root.display());
    }
    Ok(())
}

/// Recursively counts `*.arrow.corrupt-*` quarantine files under `root`, for
/// operator visibility.
fn count_quarantined(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.to_string_lossy().contains(".arrow.corrupt-") {
                count += 1;
            }
        }
    }
    Ok(count)
}

async fn run_retry_checksums(args: RetryChecksumsArgs) -> Result<()> {
    let client = build_client(&args.config);
    let failures = kline_fcp::registry::unresolved(&args.config.logs_root)?;

    for record in failures {
        if let Some(symbol_filter) = &args.symbol {
            if &record.symbol != symbol_filter {
                continue;
            }
        }
        let market = MarketType::Spot; // the registry does not record market; spot is the only provider binance-vision case we retry today
        let interval = Interval::parse(&record.interval).ok_or_else(|| anyhow!("unparseable interval '{}' in registry", record.interval))?;
        let (day_start, day_end) = time::day_bounds(record.date);

        let opts = FcpOptions { enforce_source: kline_fcp::fcp::EnforceSource::ArchiveOnly, ..FcpOptions::default() };
        match client.get(&record.symbol, interval, market, day_start, day_end, &opts).await {
            Ok(_) => {
                kline_fcp::registry::mark_resolved(&args.config.logs_root, &record.symbol, interval, record.date)?;
                tracing::info!(component = "cli", event = "cli.retry.resolved", symbol = %record.symbol, day = %record.date);
            }
            Err(e) => {
                tracing::warn!(component = "cli", event = "cli.retry.still_failing", symbol = %record.symbol, day = %record.date, error = %e);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Fetch(fetch_args) => run_fetch(fetch_args).await?,
        Command::CacheStat(stat_args) => run_cache_stat(stat_args)?,
        Command::RetryChecksums(retry_args) => run_retry_checksums(retry_args).await?,
    }
    Ok(())
}
