//! Upstream abstraction: the only components allowed to perform network I/O
//!
//! `UpstreamFetcher` turns one sub-window (or one listing request) into
//! normalized records. Everything upstream-specific (column names, date
//! formats, error classification) is resolved inside the adapter; the rest
//! of the crate sees the closed record types only.

mod akshare;
mod scripted;

pub use akshare::AkshareFetcher;
pub use scripted::{FetchCall, ScriptedFetcher};

use crate::config::RetryConfig;
use crate::error::Result;
use crate::request::RequestCtx;
use crate::types::{AdjustMode, AssetSummary, Bar, IndexSummary, Market, Period, Quote};
use chrono::NaiveDate;
use rand::Rng;
use std::time::Duration;

/// Descriptive fields an upstream can supply for one asset; everything is
/// optional because providers omit columns freely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetInfoPatch {
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    pub industry: Option<String>,
    pub listing_date: Option<NaiveDate>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub total_shares: Option<f64>,
}

/// Abstract upstream provider.
pub trait UpstreamFetcher: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Normalized daily bars for `[start, end]`, ascending by date.
    fn fetch_bars(
        &self,
        symbol: &str,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
        adjust: AdjustMode,
    ) -> Result<Vec<Bar>>;

    /// Descriptive fields for one asset.
    fn fetch_asset_info(&self, symbol: &str, market: Market) -> Result<AssetInfoPatch>;

    /// Realtime quote for one symbol.
    fn fetch_quote(&self, symbol: &str, market: Market) -> Result<Quote>;

    /// Listing table of a market (or all markets).
    fn fetch_stock_list(&self, market: Option<Market>) -> Result<Vec<AssetSummary>>;

    /// Index bars at the requested cadence, ascending by date.
    fn fetch_index_series(
        &self,
        index_symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>>;

    /// Realtime quote for an index.
    fn fetch_index_quote(&self, index_symbol: &str) -> Result<Quote>;

    /// Index listing, optionally filtered by category.
    fn fetch_index_list(&self, category: Option<&str>) -> Result<Vec<IndexSummary>>;

    /// Financial summary payload for one symbol, shape owned by the
    /// provider.
    fn fetch_financial_summary(&self, symbol: &str) -> Result<serde_json::Value>;

    /// Trading days of a market, for calendar snapshot construction.
    fn fetch_trade_dates(&self, market: Market, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<NaiveDate>>;
}

/// Calendar source backed by an upstream fetcher's trade-date feed.
pub struct FetcherCalendarSource {
    fetcher: std::sync::Arc<dyn UpstreamFetcher>,
}

impl FetcherCalendarSource {
    pub fn new(fetcher: std::sync::Arc<dyn UpstreamFetcher>) -> Self {
        Self { fetcher }
    }
}

impl crate::calendar::CalendarSource for FetcherCalendarSource {
    fn name(&self) -> &'static str {
        "upstream-trade-dates"
    }

    fn trading_days(&self, market: Market, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<NaiveDate>> {
        self.fetcher.fetch_trade_dates(market, start, end)
    }
}

/// Retry bounds shared by every upstream call site.
///
/// Only failures the upstream classified as retryable are retried; the
/// backoff doubles per attempt from `base_delay` up to `cap`, with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            cap: config.cap,
        }
    }

    /// Run `op`, retrying retryable failures within the caller's budget.
    /// Cancellation and deadline are honored between attempts; the sleep
    /// never outlives the deadline.
    pub fn run<T>(&self, ctx: &RequestCtx, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            ctx.check()?;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let exp = self
                        .base_delay
                        .saturating_mul(1u32 << (attempt - 1).min(16))
                        .min(self.cap);
                    let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4);
                    let mut delay = exp + Duration::from_millis(jitter);
                    if let Some(remaining) = ctx.remaining() {
                        delay = delay.min(remaining);
                    }
                    log::debug!("upstream retry {attempt}/{} in {delay:?}: {err}", self.max_attempts);
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
