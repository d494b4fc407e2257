//! Runtime configuration, loaded from CLI flags, environment variables, and
//! `.env`, in that precedence order.

use std::path::PathBuf;

use clap::Args;

use crate::normalize::GapAction;

#[derive(Debug, Clone, Args)]
pub struct FcpConfig {
    /// Root directory for the on-disk cache.
    #[arg(long, env = "KLINE_FCP_CACHE_ROOT", default_value = "./cache")]
    pub cache_root: PathBuf,

    /// Root directory for operator-facing logs (checksum-failure registry).
    #[arg(long, env = "KLINE_FCP_LOGS_ROOT", default_value = "./logs")]
    pub logs_root: PathBuf,

    /// Base URL for the bulk archive (Binance-vision-shaped).
    #[arg(long, env = "KLINE_FCP_ARCHIVE_BASE_URL", default_value = "https://data.binance.vision/data")]
    pub archive_base_url: String,

    /// Base URL for the REST API.
    #[arg(long, env = "KLINE_FCP_REST_BASE_URL", default_value = "https://api.binance.com")]
    pub rest_base_url: String,

    /// Hours a UTC day must be elapsed before it's considered archive-eligible.
    #[arg(long, env = "KLINE_FCP_PUBLICATION_DELAY_HOURS", default_value_t = 48)]
    pub publication_delay_hours: i64,

    /// Max concurrent day-buckets resolved at once.
    #[arg(long, env = "KLINE_FCP_PARALLELISM", default_value_t = 4)]
    pub parallelism: usize,

    /// REST weight budget consumed per rolling minute.
    #[arg(long, env = "KLINE_FCP_RATE_LIMIT_WEIGHT_PER_MIN", default_value_t = 6000)]
    pub rate_limit_weight_per_min: u32,

    /// Max rows requested per REST page.
    #[arg(long, env = "KLINE_FCP_REST_PAGE_LIMIT", default_value_t = 1000)]
    pub rest_page_limit: u32,

    /// Max retries for transient transport failures (archive + REST).
    #[arg(long, env = "KLINE_FCP_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// What to do with detected gaps once a range is fully assembled.
    #[arg(long, env = "KLINE_FCP_GAP_ACTION", value_enum, default_value_t = GapActionArg::Report)]
    pub gap_action: GapActionArg,

    /// Proceed past archive checksum mismatches instead of falling through to REST.
    #[arg(long, env = "KLINE_FCP_PROCEED_ON_CHECKSUM_FAILURE", default_value_t = false)]
    pub proceed_on_checksum_failure: bool,

    /// Run the final normalize pass on a blocking-pool thread instead of
    /// inline. Off by default — normalize is fast for the default frame
    /// sizes this crate targets; flip it on for very large multi-year pulls.
    #[arg(long, env = "KLINE_FCP_NORMALIZE_ON_BLOCKING_POOL", default_value_t = false)]
    pub normalize_on_blocking_pool: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GapActionArg {
    Report,
    ImputeNan,
    ImputeForwardFill,
    Reject,
}

impl From<GapActionArg> for GapAction {
    fn from(value: GapActionArg) -> Self {
        match value {
            GapActionArg::Report => GapAction::Report,
            GapActionArg::ImputeNan => GapAction::ImputeNan,
            GapActionArg::ImputeForwardFill => GapAction::ImputeForwardFill,
            GapActionArg::Reject => GapAction::Reject,
        }
    }
}

impl FcpConfig {
    pub fn publication_delay(&self) -> chrono::Duration {
        chrono::Duration::hours(self.publication_delay_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_action_arg_maps_onto_domain_enum() {
        assert_eq!(GapAction::from(GapActionArg::ImputeNan), GapAction::ImputeNan);
    }
}
