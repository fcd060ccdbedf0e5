//! Deterministic in-memory fetcher
//!
//! Serves seeded series and listings, records every call, and can be told
//! to fail. The integration tests drive the engine through this fetcher;
//! embedders can use it to run fully offline.

use crate::calendar::{CalendarSource, RuleBasedSource};
use crate::error::{QdbError, Result, UpstreamErrorKind};
use crate::fetch::{AssetInfoPatch, UpstreamFetcher};
use crate::types::{AdjustMode, AssetSummary, Bar, IndexSummary, Market, Period, Quote};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

/// One recorded `fetch_bars` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub adjust: AdjustMode,
}

#[derive(Default)]
struct Seeded {
    /// (symbol, adjust) -> date -> bar. Index series are seeded per period.
    series: hashbrown::HashMap<(String, AdjustMode, Period), BTreeMap<NaiveDate, Bar>>,
    quotes: hashbrown::HashMap<String, Quote>,
    stock_list: Vec<AssetSummary>,
    index_list: Vec<IndexSummary>,
    info: hashbrown::HashMap<String, AssetInfoPatch>,
}

/// Scriptable fake upstream.
pub struct ScriptedFetcher {
    seeded: RwLock<Seeded>,
    calls: Mutex<Vec<FetchCall>>,
    /// Non-bar operations, by name (`quote:600000`, `stock_list`, ...).
    ops: Mutex<Vec<String>>,
    /// Error every upstream call while set.
    outage: RwLock<Option<UpstreamErrorKind>>,
    /// Fail this many calls, then recover.
    fail_next: AtomicU32,
    fail_next_kind: RwLock<UpstreamErrorKind>,
    /// Simulated upstream latency applied to every call.
    latency: RwLock<Option<std::time::Duration>>,
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            seeded: RwLock::new(Seeded::default()),
            calls: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            outage: RwLock::new(None),
            fail_next: AtomicU32::new(0),
            fail_next_kind: RwLock::new(UpstreamErrorKind::Network),
            latency: RwLock::new(None),
        }
    }

    /// Make every upstream call take this long.
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.write().unwrap() = Some(latency);
    }

    /// Seed a daily equity series with synthetic closes over `dates`.
    pub fn seed_days(&self, symbol: &str, adjust: AdjustMode, dates: &[NaiveDate]) {
        let bars = dates
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let base = 10.0 + i as f64 * 0.1;
                let mut bar = Bar::empty(*d);
                bar.open = Some(base);
                bar.high = Some(base + 0.2);
                bar.low = Some(base - 0.2);
                bar.close = Some(base + 0.1);
                bar.volume = Some(1_000_000.0 + i as f64);
                bar.turnover = Some(1.0e7);
                bar
            })
            .collect();
        self.seed_series(symbol, adjust, Period::Daily, bars);
    }

    pub fn seed_series(&self, symbol: &str, adjust: AdjustMode, period: Period, bars: Vec<Bar>) {
        let mut seeded = self.seeded.write().unwrap();
        let entry = seeded
            .series
            .entry((symbol.to_string(), adjust, period))
            .or_default();
        for bar in bars {
            entry.insert(bar.trade_date, bar);
        }
    }

    pub fn seed_quote(&self, symbol: &str, price: f64) {
        let quote = Quote {
            symbol: symbol.to_string(),
            price: Some(price),
            open: Some(price - 0.1),
            high: Some(price + 0.1),
            low: Some(price - 0.2),
            prev_close: Some(price - 0.05),
            volume: Some(1.0e6),
            turnover: Some(1.0e7),
            pct_change: Some(0.5),
            timestamp: None,
        };
        self.seeded.write().unwrap().quotes.insert(symbol.to_string(), quote);
    }

    pub fn seed_stock_list(&self, list: Vec<AssetSummary>) {
        self.seeded.write().unwrap().stock_list = list;
    }

    pub fn seed_index_list(&self, list: Vec<IndexSummary>) {
        self.seeded.write().unwrap().index_list = list;
    }

    pub fn seed_info(&self, symbol: &str, patch: AssetInfoPatch) {
        self.seeded.write().unwrap().info.insert(symbol.to_string(), patch);
    }

    /// Error every call with `kind` until `clear_outage`.
    pub fn set_outage(&self, kind: UpstreamErrorKind) {
        *self.outage.write().unwrap() = Some(kind);
    }

    pub fn clear_outage(&self) {
        *self.outage.write().unwrap() = None;
    }

    /// Fail the next `n` calls with `kind`, then serve normally.
    pub fn fail_next(&self, n: u32, kind: UpstreamErrorKind) {
        *self.fail_next_kind.write().unwrap() = kind;
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// All recorded `fetch_bars` calls, in order.
    pub fn bar_calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn bar_call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Count of recorded non-bar operations with this prefix.
    pub fn op_count(&self, prefix: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    fn record_op(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn gate(&self) -> Result<()> {
        if let Some(latency) = *self.latency.read().unwrap() {
            std::thread::sleep(latency);
        }
        if let Some(kind) = *self.outage.read().unwrap() {
            return Err(QdbError::upstream(kind, "scripted outage"));
        }
        let took_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if took_failure {
            let kind = *self.fail_next_kind.read().unwrap();
            return Err(QdbError::upstream(kind, "scripted transient failure"));
        }
        Ok(())
    }

    fn series_window(
        &self,
        symbol: &str,
        adjust: AdjustMode,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let seeded = self.seeded.read().unwrap();
        let series = seeded
            .series
            .get(&(symbol.to_string(), adjust, period))
            .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, symbol))?;
        Ok(series.range(start..=end).map(|(_, bar)| bar.clone()).collect())
    }
}

impl UpstreamFetcher for ScriptedFetcher {
    fn source_name(&self) -> &'static str {
        "scripted"
    }

    fn fetch_bars(
        &self,
        symbol: &str,
        _market: Market,
        start: NaiveDate,
        end: NaiveDate,
        adjust: AdjustMode,
    ) -> Result<Vec<Bar>> {
        self.calls.lock().unwrap().push(FetchCall {
            symbol: symbol.to_string(),
            start,
            end,
            adjust,
        });
        self.gate()?;
        self.series_window(symbol, adjust, Period::Daily, start, end)
    }

    fn fetch_asset_info(&self, symbol: &str, _market: Market) -> Result<AssetInfoPatch> {
        self.gate()?;
        self.seeded
            .read()
            .unwrap()
            .info
            .get(symbol)
            .cloned()
            .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, symbol))
    }

    fn fetch_quote(&self, symbol: &str, _market: Market) -> Result<Quote> {
        self.record_op(format!("quote:{symbol}"));
        self.gate()?;
        self.seeded
            .read()
            .unwrap()
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, symbol))
    }

    fn fetch_stock_list(&self, market: Option<Market>) -> Result<Vec<AssetSummary>> {
        self.record_op("stock_list".to_string());
        self.gate()?;
        let list = self.seeded.read().unwrap().stock_list.clone();
        Ok(match market {
            Some(m) => list.into_iter().filter(|s| s.market == m).collect(),
            None => list,
        })
    }

    fn fetch_index_series(
        &self,
        index_symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        self.calls.lock().unwrap().push(FetchCall {
            symbol: index_symbol.to_string(),
            start,
            end,
            adjust: AdjustMode::Raw,
        });
        self.gate()?;
        self.series_window(index_symbol, AdjustMode::Raw, period, start, end)
    }

    fn fetch_index_quote(&self, index_symbol: &str) -> Result<Quote> {
        self.record_op(format!("index_quote:{index_symbol}"));
        self.gate()?;
        self.seeded
            .read()
            .unwrap()
            .quotes
            .get(index_symbol)
            .cloned()
            .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, index_symbol))
    }

    fn fetch_index_list(&self, category: Option<&str>) -> Result<Vec<IndexSummary>> {
        self.record_op("index_list".to_string());
        self.gate()?;
        let list = self.seeded.read().unwrap().index_list.clone();
        Ok(match category {
            Some(c) => list
                .into_iter()
                .filter(|s| s.category.as_deref() == Some(c))
                .collect(),
            None => list,
        })
    }

    fn fetch_financial_summary(&self, symbol: &str) -> Result<serde_json::Value> {
        self.record_op(format!("financial:{symbol}"));
        self.gate()?;
        Ok(serde_json::json!([
            {"指标": "净利润", "symbol": symbol, "value": 1.0e9},
            {"指标": "营业总收入", "symbol": symbol, "value": 5.0e9},
        ]))
    }

    fn fetch_trade_dates(&self, market: Market, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<NaiveDate>> {
        self.gate()?;
        RuleBasedSource.trading_days(market, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        crate::types::parse_day(s).unwrap()
    }

    #[test]
    fn test_serves_seeded_window_and_records_calls() {
        let fetcher = ScriptedFetcher::new();
        fetcher.seed_days(
            "600000",
            AdjustMode::Raw,
            &[d("20240102"), d("20240103"), d("20240104")],
        );

        let bars = fetcher
            .fetch_bars("600000", Market::CnA, d("20240103"), d("20240110"), AdjustMode::Raw)
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].trade_date, d("20240103"));

        let calls = fetcher.bar_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].start, d("20240103"));
    }

    #[test]
    fn test_outage_and_recovery() {
        let fetcher = ScriptedFetcher::new();
        fetcher.seed_days("600000", AdjustMode::Raw, &[d("20240102")]);
        fetcher.set_outage(UpstreamErrorKind::Network);
        assert!(fetcher
            .fetch_bars("600000", Market::CnA, d("20240102"), d("20240102"), AdjustMode::Raw)
            .is_err());
        fetcher.clear_outage();
        assert!(fetcher
            .fetch_bars("600000", Market::CnA, d("20240102"), d("20240102"), AdjustMode::Raw)
            .is_ok());
    }

    #[test]
    fn test_fail_next_is_transient() {
        let fetcher = ScriptedFetcher::new();
        fetcher.seed_days("600000", AdjustMode::Raw, &[d("20240102")]);
        fetcher.fail_next(1, UpstreamErrorKind::RateLimited);
        assert!(fetcher
            .fetch_bars("600000", Market::CnA, d("20240102"), d("20240102"), AdjustMode::Raw)
            .is_err());
        assert!(fetcher
            .fetch_bars("600000", Market::CnA, d("20240102"), d("20240102"), AdjustMode::Raw)
            .is_ok());
    }

    #[test]
    fn test_adjust_modes_seeded_independently() {
        let fetcher = ScriptedFetcher::new();
        fetcher.seed_days("600000", AdjustMode::Raw, &[d("20240102")]);
        assert!(fetcher
            .fetch_bars("600000", Market::CnA, d("20240102"), d("20240102"), AdjustMode::Qfq)
            .is_err());
    }
}
