//! Core types shared across the cache engine

use crate::error::{QdbError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Stable internal identifier for an asset
pub type AssetId = i64;

/// Markets recognized by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    /// Mainland China A-shares (Shanghai / Shenzhen)
    CnA,
    /// Hong Kong
    Hk,
}

impl Market {
    pub fn as_str(self) -> &'static str {
        match self {
            Market::CnA => "CN_A",
            Market::Hk => "HK",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "CN_A" | "cn_a" | "CN" | "cn" => Ok(Market::CnA),
            "HK" | "hk" => Ok(Market::Hk),
            other => Err(QdbError::UnknownMarket(other.to_string())),
        }
    }

    /// Infer the market from a raw symbol.
    ///
    /// 6 digits resolve to mainland A-shares, 5 digits (or a `HK.` prefix)
    /// to Hong Kong; anything else is rejected.
    pub fn infer(symbol: &str) -> Result<Self> {
        let body = symbol.strip_prefix("HK.").unwrap_or(symbol);
        if symbol.starts_with("HK.") {
            if body.len() == 5 && body.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(Market::Hk);
            }
            return Err(QdbError::UnrecognizedSymbol(symbol.to_string()));
        }
        if body.bytes().all(|b| b.is_ascii_digit()) {
            match body.len() {
                6 => return Ok(Market::CnA),
                5 => return Ok(Market::Hk),
                _ => {}
            }
        }
        Err(QdbError::UnrecognizedSymbol(symbol.to_string()))
    }
}

/// Canonicalize a raw symbol: strips the `HK.` prefix and returns the bare
/// code together with its inferred market.
pub fn canonical_symbol(symbol: &str) -> Result<(String, Market)> {
    let market = Market::infer(symbol)?;
    let body = symbol.strip_prefix("HK.").unwrap_or(symbol);
    Ok((body.to_string(), market))
}

/// Price-adjustment convention for a historical series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustMode {
    /// Unadjusted prices
    Raw,
    /// Forward-adjusted (qianfuquan)
    Qfq,
    /// Backward-adjusted (houfuquan)
    Hfq,
}

impl AdjustMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustMode::Raw => "none",
            AdjustMode::Qfq => "qfq",
            AdjustMode::Hfq => "hfq",
        }
    }

    /// Case-insensitive parse; empty input selects the unadjusted series.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AdjustMode::Raw),
            "qfq" => Ok(AdjustMode::Qfq),
            "hfq" => Ok(AdjustMode::Hfq),
            other => Err(QdbError::InvalidAdjustMode(other.to_string())),
        }
    }
}

impl Default for AdjustMode {
    fn default() -> Self {
        AdjustMode::Raw
    }
}

/// Bar cadence for index series; equity histories are always daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            "monthly" => Ok(Period::Monthly),
            other => Err(QdbError::InvalidConfig(format!("unknown period: {other}"))),
        }
    }
}

/// The storage fingerprint of one cached series.
///
/// `qfq`, `hfq` and raw series never share rows because upstream adjustments
/// back-fill historical prices non-monotonically; index series are isolated
/// by their period instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub asset_id: AssetId,
    pub adjust: AdjustMode,
    pub period: Period,
}

impl SeriesKey {
    pub fn daily(asset_id: AssetId, adjust: AdjustMode) -> Self {
        Self { asset_id, adjust, period: Period::Daily }
    }

    pub fn index(asset_id: AssetId, period: Period) -> Self {
        Self { asset_id, adjust: AdjustMode::Raw, period }
    }
}

/// A single trading-day record for one asset. All numeric fields are
/// nullable; upstream providers omit columns freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub trade_date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub turnover: Option<f64>,
    pub amplitude: Option<f64>,
    pub pct_change: Option<f64>,
    pub change: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub adjusted_close: Option<f64>,
}

impl Bar {
    /// Bar with every value column empty.
    pub fn empty(trade_date: NaiveDate) -> Self {
        Self {
            trade_date,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            turnover: None,
            amplitude: None,
            pct_change: None,
            change: None,
            turnover_rate: None,
            adjusted_close: None,
        }
    }

    /// Every populated numeric field must be finite before it may be stored.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
            ("turnover", self.turnover),
            ("amplitude", self.amplitude),
            ("pct_change", self.pct_change),
            ("change", self.change),
            ("turnover_rate", self.turnover_rate),
            ("adjusted_close", self.adjusted_close),
        ];
        for (name, value) in fields {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(QdbError::SchemaViolation(format!(
                        "non-finite {name} for {}",
                        self.trade_date
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Realtime quote for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub prev_close: Option<f64>,
    pub volume: Option<f64>,
    pub turnover: Option<f64>,
    pub pct_change: Option<f64>,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// One row of a market's listing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub symbol: String,
    pub name: String,
    pub market: Market,
    pub latest_price: Option<f64>,
}

/// One row of an index listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub symbol: String,
    pub name: String,
    pub category: Option<String>,
    pub latest_price: Option<f64>,
}

/// Asset classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Equity,
    Index,
}

impl AssetType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetType::Equity => "stock",
            AssetType::Index => "index",
        }
    }
}

/// Descriptive record for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: AssetId,
    pub symbol: String,
    pub name: String,
    pub market: Market,
    pub exchange: String,
    pub currency: String,
    pub asset_type: AssetType,
    pub industry: Option<String>,
    pub listing_date: Option<NaiveDate>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub total_shares: Option<f64>,
    /// Provenance of the descriptive fields (`akshare`, `default`, ...).
    pub data_source: String,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Parse a `YYYYMMDD` date as used on the public surface.
pub fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
        .map_err(|_| QdbError::InvalidDateRange(format!("expected YYYYMMDD, got {s:?}")))
}

/// Format a date back to `YYYYMMDD`.
pub fn format_day(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}
