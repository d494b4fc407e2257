pub mod archive;
pub mod cache;
pub mod config;
pub mod fcp;
pub mod frame;
pub mod market;
pub mod normalize;
pub mod registry;
pub mod rest;
pub mod time;

use clap::Parser;

use crate::config::FcpConfig;

/// Arguments for `kline-fcp fetch`: retrieve a symbol/interval/range through
/// the failover chain and write the merged frame out as CSV.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Fetch historical OHLCV klines via cache -> archive -> REST failover")]
pub struct FetchArgs {
    #[command(flatten)]
    pub config: FcpConfig,

    /// Exchange symbol, e.g. BTCUSDT or BTCUSD_PERP.
    #[arg(long)]
    pub symbol: String,

    /// Kline interval, e.g. 1m, 1h, 1d.
    #[arg(long)]
    pub interval: String,

    /// Market: spot, futures-usdt, futures-coin.
    #[arg(long, default_value = "spot")]
    pub market: String,

    /// Start of the range (inclusive), RFC3339 or YYYY-MM-DD.
    #[arg(long)]
    pub start: String,

    /// End of the range (exclusive), RFC3339 or YYYY-MM-DD.
    #[arg(long)]
    pub end: String,

    /// Where to write the resulting CSV. Prints to stdout if omitted.
    #[arg(long)]
    pub out: Option<std::path::PathBuf>,

    /// Pad every missing interval in the requested range with a NaN row
    /// instead of leaving it as a reported gap.
    #[arg(long, default_value_t = false)]
    pub auto_reindex: bool,
}

/// Arguments for `kline-fcp cache-stat`: report on-disk cache coverage for a
/// symbol/interval/market without touching the network.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Report cache coverage for a symbol/interval")]
pub struct CacheStatArgs {
    #[arg(long, env = "KLINE_FCP_CACHE_ROOT", default_value = "./cache")]
    pub cache_root: std::path::PathBuf,

    #[arg(long)]
    pub symbol: String,

    #[arg(long)]
    pub interval: String,

    #[arg(long, default_value = "spot")]
    pub market: String,

    #[arg(long)]
    pub start: String,

    #[arg(long)]
    pub end: String,
}

/// Arguments for `kline-fcp retry-checksums`: re-attempt archive days whose
/// checksum previously failed, per the unresolved-failure registry.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Retry days recorded in the checksum-failure registry")]
pub struct RetryChecksumsArgs {
    #[command(flatten)]
    pub config: FcpConfig,

    /// Only retry failures for this symbol; retries every unresolved record otherwise.
    #[arg(long)]
    pub symbol: Option<String>,
}
