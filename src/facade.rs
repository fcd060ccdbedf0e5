//! Embeddable facade over the cache engine
//!
//! `QuantDb` is an explicit value built once from a `CacheConfig` and passed
//! around; isolated instances (separate cache directories, scripted
//! fetchers, manual clocks) coexist freely in one process.

use crate::assets::AssetRegistry;
use crate::calendar::{CalendarSource, TradingCalendar};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::engine::{HistoricalEngine, UpstreamGate};
use crate::error::{QdbError, Result};
use crate::fetch::{AkshareFetcher, FetcherCalendarSource, RetryPolicy, UpstreamFetcher};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::request::RequestCtx;
use crate::store::{BarStore, CoverageIndex, CoverageRecord, Db};
use crate::ttl::{CacheKey, CacheKind, TtlCache};
use crate::types::{
    canonical_symbol, parse_day, AdjustMode, Asset, AssetSummary, Bar, IndexSummary, Market,
    Period, Quote,
};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Parameters of one historical request. Exactly one of `start`+`end` and
/// `days` must be given; dates are `YYYYMMDD`.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub symbol: String,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Expanded to `[today − N trading days, today]` in the symbol's market.
    pub days: Option<usize>,
    /// `none` (default), `qfq` or `hfq`.
    pub adjust: Option<String>,
}

impl HistoryRequest {
    pub fn range(symbol: impl Into<String>, start: &str, end: &str) -> Self {
        Self {
            symbol: symbol.into(),
            start: Some(start.to_string()),
            end: Some(end.to_string()),
            ..Default::default()
        }
    }

    pub fn last_days(symbol: impl Into<String>, days: usize) -> Self {
        Self { symbol: symbol.into(), days: Some(days), ..Default::default() }
    }

    pub fn adjust(mut self, adjust: &str) -> Self {
        self.adjust = Some(adjust.to_string());
        self
    }
}

/// Snapshot of the cache surface returned by `cache_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: String,
    pub db_size_bytes: u64,
    pub initialized: bool,
    pub status: String,
    pub series_tracked: usize,
    pub ttl_entries: usize,
    pub counters: MetricsSnapshot,
}

/// Builder for an isolated cache instance.
pub struct QuantDbBuilder {
    config: CacheConfig,
    fetcher: Option<Arc<dyn UpstreamFetcher>>,
    clock: Option<Arc<dyn Clock>>,
    calendar_source: Option<Box<dyn CalendarSource>>,
}

impl QuantDbBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    /// Swap the upstream provider (the default is the AKShare bridge).
    pub fn fetcher(mut self, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Swap the time source (tests drive freshness through a manual clock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Swap the primary calendar source (the default asks the fetcher for
    /// trade dates).
    pub fn calendar_source(mut self, source: Box<dyn CalendarSource>) -> Self {
        self.calendar_source = Some(source);
        self
    }

    pub fn open(self) -> Result<QuantDb> {
        let config = self.config;
        std::fs::create_dir_all(&config.cache_dir)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let fetcher: Arc<dyn UpstreamFetcher> = match self.fetcher {
            Some(f) => f,
            None => Arc::new(AkshareFetcher::new()?),
        };
        let calendar_source = self
            .calendar_source
            .unwrap_or_else(|| Box::new(FetcherCalendarSource::new(fetcher.clone())));

        let calendar = Arc::new(TradingCalendar::new(
            config.calendar_path(),
            clock.clone(),
            calendar_source,
            config.allow_calendar_fallback,
        ));
        calendar.ensure_ready()?;

        let db = Arc::new(Db::open(&config.db_path())?);
        let store = Arc::new(BarStore::new(db.clone()));
        let coverage = Arc::new(CoverageIndex::load(db.clone(), clock.clone())?);
        let registry = Arc::new(AssetRegistry::new(
            db.clone(),
            clock.clone(),
            fetcher.clone(),
            config.asset_info_max_age,
        ));
        let ttl = Arc::new(TtlCache::new(&config, clock.clone(), calendar.clone()));
        let metrics = Arc::new(Metrics::new());
        let gate = Arc::new(UpstreamGate::new(
            config.max_concurrent_upstream,
            config.upstream_queue_limit,
        ));
        let engine = HistoricalEngine::new(
            &config,
            calendar.clone(),
            store.clone(),
            registry.clone(),
            coverage.clone(),
            fetcher.clone(),
            ttl.clone(),
            metrics.clone(),
            gate.clone(),
        );
        let retry = RetryPolicy::new(&config.retry);

        Ok(QuantDb {
            config,
            calendar,
            store,
            registry,
            coverage,
            fetcher,
            ttl,
            metrics,
            gate,
            retry,
            engine,
        })
    }
}

/// The cache: a bounded-staleness, trading-calendar-aware store between the
/// caller and the upstream data provider.
pub struct QuantDb {
    config: CacheConfig,
    calendar: Arc<TradingCalendar>,
    store: Arc<BarStore>,
    registry: Arc<AssetRegistry>,
    coverage: Arc<CoverageIndex>,
    fetcher: Arc<dyn UpstreamFetcher>,
    ttl: Arc<TtlCache>,
    metrics: Arc<Metrics>,
    gate: Arc<UpstreamGate>,
    retry: RetryPolicy,
    engine: HistoricalEngine,
}

impl QuantDb {
    pub fn builder() -> QuantDbBuilder {
        QuantDbBuilder {
            config: CacheConfig::from_env(),
            fetcher: None,
            clock: None,
            calendar_source: None,
        }
    }

    /// Open with environment-derived defaults.
    pub fn open() -> Result<Self> {
        Self::builder().open()
    }

    // -- historical ---------------------------------------------------------

    /// Contiguous daily history for the requested window.
    pub fn get_history(&self, request: &HistoryRequest) -> Result<Vec<Bar>> {
        self.get_history_ctx(request, &self.request_ctx())
    }

    /// As `get_history`, with caller-supplied cancellation/deadline.
    pub fn get_history_ctx(&self, request: &HistoryRequest, ctx: &RequestCtx) -> Result<Vec<Bar>> {
        let adjust = AdjustMode::parse(request.adjust.as_deref().unwrap_or(""))?;
        let (start, end) = self.resolve_window(request)?;
        self.engine.get_history(&request.symbol, start, end, adjust, ctx)
    }

    /// Fan out one request shape over many symbols; each symbol succeeds or
    /// fails independently.
    pub fn get_history_batch(
        &self,
        symbols: &[String],
        template: &HistoryRequest,
    ) -> HashMap<String, Result<Vec<Bar>>> {
        symbols
            .par_iter()
            .map(|symbol| {
                let request = HistoryRequest { symbol: symbol.clone(), ..template.clone() };
                (symbol.clone(), self.get_history(&request))
            })
            .collect()
    }

    // -- realtime and listings ----------------------------------------------

    pub fn get_quote(&self, symbol: &str, force_refresh: bool) -> Result<Quote> {
        let (symbol, market) = canonical_symbol(symbol)?;
        let key = CacheKey::new(CacheKind::Quote).market(market).symbol(symbol.as_str());
        let fetcher = self.fetcher.clone();
        self.cached_fetch(key, force_refresh, move || fetcher.fetch_quote(&symbol, market))
    }

    pub fn get_quote_batch(
        &self,
        symbols: &[String],
        force_refresh: bool,
    ) -> HashMap<String, Result<Quote>> {
        symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), self.get_quote(symbol, force_refresh)))
            .collect()
    }

    pub fn get_stock_list(
        &self,
        market: Option<Market>,
        force_refresh: bool,
    ) -> Result<Vec<AssetSummary>> {
        let mut key = CacheKey::new(CacheKind::StockList);
        match market {
            Some(m) => key = key.market(m),
            None => key = key.extra("all"),
        }
        let fetcher = self.fetcher.clone();
        self.cached_fetch(key, force_refresh, move || fetcher.fetch_stock_list(market))
    }

    pub fn get_asset_info(&self, symbol: &str) -> Result<Asset> {
        self.registry.describe(symbol, false)
    }

    pub fn get_index_series(
        &self,
        index_symbol: &str,
        start: &str,
        end: &str,
        period: Period,
        force_refresh: bool,
    ) -> Result<Vec<Bar>> {
        let start = parse_day(start)?;
        let end = parse_day(end)?;
        if force_refresh {
            // A deliberate miss: drop the cached window so the planner
            // refetches it.
            let (symbol, _) = canonical_symbol(index_symbol)?;
            let asset_id = self.registry.resolve_index(&symbol)?;
            let series = crate::types::SeriesKey::index(asset_id, period);
            self.store.delete(&series, Some(start), Some(end))?;
            self.coverage.update_from_store(&series, &self.store)?;
        }
        self.engine
            .get_index_series(index_symbol, period, start, end, &self.request_ctx())
    }

    pub fn get_index_quote(&self, index_symbol: &str, force_refresh: bool) -> Result<Quote> {
        let key = CacheKey::new(CacheKind::Quote).symbol(index_symbol).extra("index");
        let fetcher = self.fetcher.clone();
        let symbol = index_symbol.to_string();
        self.cached_fetch(key, force_refresh, move || fetcher.fetch_index_quote(&symbol))
    }

    pub fn get_index_list(
        &self,
        category: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<IndexSummary>> {
        let mut key = CacheKey::new(CacheKind::IndexList);
        key = key.extra(category.unwrap_or("all"));
        let fetcher = self.fetcher.clone();
        let category = category.map(str::to_string);
        self.cached_fetch(key, force_refresh, move || {
            fetcher.fetch_index_list(category.as_deref())
        })
    }

    pub fn get_financial_summary(
        &self,
        symbol: &str,
        force_refresh: bool,
    ) -> Result<serde_json::Value> {
        let (symbol, _) = canonical_symbol(symbol)?;
        let key = CacheKey::new(CacheKind::FinancialSummary).symbol(symbol.as_str());
        let fetcher = self.fetcher.clone();
        self.cached_fetch(key, force_refresh, move || fetcher.fetch_financial_summary(&symbol))
    }

    // -- maintenance --------------------------------------------------------

    /// Counters and storage facts for dashboards and debugging.
    pub fn cache_stats(&self) -> CacheStats {
        let db_size_bytes = std::fs::metadata(self.config.db_path())
            .map(|m| m.len())
            .unwrap_or(0);
        let status = if self.calendar.in_fallback_mode() {
            "calendar_fallback".to_string()
        } else {
            "ok".to_string()
        };
        CacheStats {
            cache_dir: self.config.cache_dir.display().to_string(),
            db_size_bytes,
            initialized: true,
            status,
            series_tracked: self.coverage.len(),
            ttl_entries: self.ttl.len(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Drop one symbol's bars, coverage and freshness entries, or the whole
    /// cache. The calendar snapshot is symbol-independent and never touched.
    pub fn clear_cache(&self, symbol: Option<&str>) -> Result<()> {
        match symbol {
            Some(raw) => {
                let (symbol, _) = canonical_symbol(raw)?;
                if let Some(equity_id) = self.registry.lookup(&symbol)? {
                    self.engine.clear_asset(equity_id)?;
                }
                // Index series under the same code live in their own
                // namespace; clear them too when present.
                if let Some(index_id) = self.registry.lookup_index(&symbol)? {
                    self.engine.clear_asset(index_id)?;
                }
                self.ttl.invalidate_symbol(&symbol);
                self.registry.forget(&symbol);
            }
            None => {
                self.store.delete_all()?;
                self.coverage.clear()?;
                self.ttl.clear();
            }
        }
        Ok(())
    }

    /// Coverage summary of one cached daily series, if any.
    pub fn coverage(&self, symbol: &str, adjust: AdjustMode) -> Result<Option<CoverageRecord>> {
        let (symbol, _) = canonical_symbol(symbol)?;
        Ok(self
            .registry
            .lookup(&symbol)?
            .and_then(|id| self.coverage.get(&crate::types::SeriesKey::daily(id, adjust))))
    }

    /// Adjust the process-wide log filter.
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        let filter = level
            .parse::<log::LevelFilter>()
            .map_err(|_| QdbError::InvalidConfig(format!("unknown log level {level:?}")))?;
        log::set_max_level(filter);
        Ok(())
    }

    /// The configuration this instance was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Trading-calendar queries for embedders.
    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    // -- internals ----------------------------------------------------------

    fn request_ctx(&self) -> RequestCtx {
        match self.config.request_deadline {
            Some(deadline) => RequestCtx::with_deadline(Instant::now() + deadline),
            None => RequestCtx::new(),
        }
    }

    fn resolve_window(&self, request: &HistoryRequest) -> Result<(NaiveDate, NaiveDate)> {
        match (&request.start, &request.end, request.days) {
            (Some(start), Some(end), None) => {
                let start = parse_day(start)?;
                let end = parse_day(end)?;
                if start > end {
                    return Err(QdbError::InvalidDateRange(format!(
                        "start {start} after end {end}"
                    )));
                }
                Ok((start, end))
            }
            (None, None, Some(days)) => {
                if days == 0 {
                    return Err(QdbError::InvalidDateRange("days must be positive".into()));
                }
                let (_, market) = canonical_symbol(&request.symbol)?;
                let today = self.calendar.today_in_market(market);
                let start = self
                    .calendar
                    .nth_trading_day_back(market, today, days)?
                    .ok_or_else(|| {
                        QdbError::InvalidDateRange(format!(
                            "no trading day {days} sessions before {today}"
                        ))
                    })?;
                Ok((start, today))
            }
            _ => Err(QdbError::InvalidDateRange(
                "exactly one of start+end and days is required".into(),
            )),
        }
    }

    /// Freshness-cached upstream call used by quotes, listings and
    /// summaries. `force_refresh` produces a deliberate miss.
    fn cached_fetch<T, F>(&self, key: CacheKey, force_refresh: bool, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Result<T>,
    {
        if !force_refresh {
            if let Some(value) = self.ttl.get_as::<T>(&key) {
                self.metrics.record_hits(1);
                return Ok(value);
            }
        }
        self.metrics.record_misses(1);

        let ctx = self.request_ctx();
        let permit = match self.gate.acquire(&ctx) {
            Ok(permit) => permit,
            Err(QdbError::Overloaded) => {
                self.metrics.record_overloaded();
                return Err(QdbError::Overloaded);
            }
            Err(err) => return Err(err),
        };
        let t0 = Instant::now();
        let fetched = self.retry.run(&ctx, &fetch);
        drop(permit);

        match fetched {
            Ok(value) => {
                self.metrics.record_upstream_call(t0.elapsed());
                self.ttl.put_as(key, &value, self.fetcher.source_name(), None)?;
                Ok(value)
            }
            Err(err) => {
                if let QdbError::Upstream { kind, .. } = &err {
                    self.metrics.record_upstream_error(*kind);
                }
                Err(err)
            }
        }
    }
}

/// Initialize the process logger from `QDB_LOG_LEVEL` (defaults to `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let level = std::env::var("QDB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let _ = env_logger::Builder::new().parse_filters(&level).try_init();
}
