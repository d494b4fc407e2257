//! Market descriptors and symbol validation. Shared by the time model, the
//! archive adapter, and the orchestrator, so it gets its own module rather
//! than living inside any one of them.

use thiserror::Error;

/// `(provider, market_type, data_nature, packaging)` — drives both the cache
/// path and the archive URL. Provider is currently always `binance`-shaped;
/// the type exists so a second provider can be added without reshaping the
/// rest of the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MarketType {
    Spot,
    /// USDⓈ-margined perpetuals/futures ("futures/um").
    FuturesUsdt,
    /// Coin-margined perpetuals/futures ("futures/cm"); symbols carry a
    /// `_PERP` suffix.
    FuturesCoin,
}

impl MarketType {
    pub fn archive_path_segment(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::FuturesUsdt => "futures/um",
            Self::FuturesCoin => "futures/cm",
        }
    }

    /// Segment used in the on-disk cache path (stable, no `/`).
    pub fn cache_path_segment(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::FuturesUsdt => "futures_usdt",
            Self::FuturesCoin => "futures_coin",
        }
    }

    pub fn is_coin_margined(self) -> bool {
        matches!(self, Self::FuturesCoin)
    }
}

/// Opaque upper-case exchange symbol. Coin-margined perpetuals carry the
/// canonical `_PERP` suffix; other markets must not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Symbol(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("symbol must be non-empty")]
    Empty,
    #[error("symbol '{0}' must be upper-case ASCII alphanumerics (and '_')")]
    InvalidFormat(String),
    #[error("coin-margined symbol '{0}' must end with the canonical _PERP suffix")]
    MissingPerpSuffix(String),
    #[error("symbol '{0}' carries a _PERP suffix but market is not coin-margined")]
    UnexpectedPerpSuffix(String),
}

impl Symbol {
    pub fn validate(raw: &str, market: MarketType) -> Result<Self, SymbolError> {
        if raw.is_empty() {
            return Err(SymbolError::Empty);
        }
        let well_formed = raw
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !well_formed {
            return Err(SymbolError::InvalidFormat(raw.to_string()));
        }
        let has_perp = raw.ends_with("_PERP");
        match (market.is_coin_margined(), has_perp) {
            (true, false) => Err(SymbolError::MissingPerpSuffix(raw.to_string())),
            (false, true) => Err(SymbolError::UnexpectedPerpSuffix(raw.to_string())),
            _ => Ok(Self(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Symbol form used in archive URLs/paths — identical to the canonical
    /// form since the `_PERP` suffix (when required) is already embedded.
    pub fn archive_symbol(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_symbol_rejects_perp_suffix() {
        assert!(matches!(
            Symbol::validate("BTCUSDT_PERP", MarketType::Spot),
            Err(SymbolError::UnexpectedPerpSuffix(_))
        ));
    }

    #[test]
    fn coin_margined_symbol_requires_perp_suffix() {
        assert!(matches!(
            Symbol::validate("BTCUSD", MarketType::FuturesCoin),
            Err(SymbolError::MissingPerpSuffix(_))
        ));
        assert!(Symbol::validate("BTCUSD_PERP", MarketType::FuturesCoin).is_ok());
    }

    #[test]
    fn lowercase_symbol_is_rejected() {
        assert!(matches!(
            Symbol::validate("btcusdt", MarketType::Spot),
            Err(SymbolError::InvalidFormat(_))
        ));
    }
}
