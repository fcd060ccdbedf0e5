//! The engine behind `get_history`: gap planning, bounded upstream fetches,
//! store writes and the caller-visible failure semantics.

use crate::assets::AssetRegistry;
use crate::calendar::TradingCalendar;
use crate::config::CacheConfig;
use crate::engine::gate::UpstreamGate;
use crate::engine::singleflight::FlightTable;
use crate::error::{MissingRange, QdbError, Result};
use crate::fetch::{RetryPolicy, UpstreamFetcher};
use crate::gap;
use crate::metrics::Metrics;
use crate::request::RequestCtx;
use crate::store::{BarStore, CoverageIndex};
use crate::ttl::{CacheKey, CacheKind, TtlCache};
use crate::types::{
    canonical_symbol, format_day, AdjustMode, Bar, Market, Period, SeriesKey,
};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Orchestrates calendar, store, gap planner and fetcher behind the
/// per-fingerprint single-flight.
pub struct HistoricalEngine {
    calendar: Arc<TradingCalendar>,
    store: Arc<BarStore>,
    registry: Arc<AssetRegistry>,
    coverage: Arc<CoverageIndex>,
    fetcher: Arc<dyn UpstreamFetcher>,
    ttl: Arc<TtlCache>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    flights: FlightTable,
    gate: Arc<UpstreamGate>,
    negative_ttl: Duration,
    negative_ttl_today: Duration,
    allow_calendar_fallback: bool,
}

impl HistoricalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &CacheConfig,
        calendar: Arc<TradingCalendar>,
        store: Arc<BarStore>,
        registry: Arc<AssetRegistry>,
        coverage: Arc<CoverageIndex>,
        fetcher: Arc<dyn UpstreamFetcher>,
        ttl: Arc<TtlCache>,
        metrics: Arc<Metrics>,
        gate: Arc<UpstreamGate>,
    ) -> Self {
        Self {
            calendar,
            store,
            registry,
            coverage,
            fetcher,
            ttl,
            metrics,
            retry: RetryPolicy::new(&config.retry),
            flights: FlightTable::new(),
            gate,
            negative_ttl: config.negative_ttl,
            negative_ttl_today: config.negative_ttl_today,
            allow_calendar_fallback: config.allow_calendar_fallback,
        }
    }

    /// Contiguous daily series for `[start, end]`: exactly the market's
    /// trading days, ascending, no duplicates. Days upstream has declared
    /// empty are recalled from negative coverage instead of refetched.
    pub fn get_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        adjust: AdjustMode,
        ctx: &RequestCtx,
    ) -> Result<Vec<Bar>> {
        let t0 = Instant::now();
        let result = self.history_inner(symbol, start, end, adjust, ctx);
        self.metrics.record_request(t0.elapsed());
        result
    }

    fn history_inner(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        adjust: AdjustMode,
        ctx: &RequestCtx,
    ) -> Result<Vec<Bar>> {
        let (symbol, market) = canonical_symbol(symbol)?;
        let asset_id = self.registry.resolve(&symbol)?;
        let series = SeriesKey::daily(asset_id, adjust);
        let fetcher = self.fetcher.clone();
        let fetch_symbol = symbol.clone();
        self.fill_series(&symbol, market, series, start, end, ctx, move |s, e| {
            fetcher.fetch_bars(&fetch_symbol, market, s, e, adjust)
        })
    }

    /// Index series at the requested cadence; cached in the same store
    /// under the index's own series key, no adjust modes involved.
    pub fn get_index_series(
        &self,
        index_symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
        ctx: &RequestCtx,
    ) -> Result<Vec<Bar>> {
        let t0 = Instant::now();
        let (symbol, market) = canonical_symbol(index_symbol)?;
        let asset_id = match self.registry.resolve_index(&symbol) {
            Ok(id) => id,
            Err(e) => {
                self.metrics.record_request(t0.elapsed());
                return Err(e);
            }
        };
        let series = SeriesKey::index(asset_id, period);
        let fetcher = self.fetcher.clone();
        let fetch_symbol = symbol.clone();
        let fetch = move |s, e| fetcher.fetch_index_series(&fetch_symbol, period, s, e);
        let result = if period == Period::Daily {
            self.fill_series(&symbol, market, series, start, end, ctx, fetch)
        } else {
            // Weekly/monthly rows land on period boundaries, not on every
            // trading day, so the daily gap grid does not apply; the window
            // is refetched whenever the stored coverage does not enclose it.
            self.fill_coarse_series(market, series, start, end, ctx, fetch)
        };
        self.metrics.record_request(t0.elapsed());
        result
    }

    fn fill_coarse_series<F>(
        &self,
        market: Market,
        series: SeriesKey,
        start: NaiveDate,
        end: NaiveDate,
        ctx: &RequestCtx,
        fetch: F,
    ) -> Result<Vec<Bar>>
    where
        F: Fn(NaiveDate, NaiveDate) -> Result<Vec<Bar>>,
    {
        if start > end {
            return Err(QdbError::InvalidDateRange(format!(
                "start {} after end {}",
                format_day(start),
                format_day(end)
            )));
        }
        ctx.check()?;
        let flight = self.flights.acquire(series, (start, end), ctx)?;
        if flight.covered_by_inflight {
            self.metrics.record_inflight_dedup();
        }

        // Coarse rows land on period boundaries, so the first stored row may
        // legitimately sit up to one period after the window start (and the
        // last one up to one period before its end).
        let slack = chrono::Duration::days(match series.period {
            Period::Daily => 0,
            Period::Weekly => 7,
            Period::Monthly => 31,
        });
        let covered = self
            .coverage
            .get(&series)
            .map(|rec| rec.earliest <= start + slack && rec.latest + slack >= end)
            .unwrap_or(false);
        if covered {
            self.metrics.record_hits(1);
        } else {
            self.metrics.record_misses(1);
            let permit = match self.gate.acquire(ctx) {
                Ok(permit) => permit,
                Err(QdbError::Overloaded) => {
                    self.metrics.record_overloaded();
                    return Err(QdbError::Overloaded);
                }
                Err(err) => return Err(self.control_failure(err, vec![(start, end)])),
            };
            let t0 = Instant::now();
            let fetched = self.retry.run(ctx, || fetch(start, end));
            drop(permit);
            match fetched {
                Ok(bars) => {
                    self.metrics.record_upstream_call(t0.elapsed());
                    let bars = self.filter_trading_days(market, bars)?;
                    self.store.upsert(&series, &bars)?;
                    self.coverage.update_from_store(&series, &self.store)?;
                    self.metrics.record_bars_stored(bars.len() as u64);
                }
                Err(QdbError::Canceled) => return Err(QdbError::Canceled),
                Err(err @ QdbError::Timeout { .. }) => {
                    return Err(self.control_failure(err, vec![(start, end)]));
                }
                Err(err) => {
                    if let QdbError::Upstream { kind, .. } = &err {
                        self.metrics.record_upstream_error(*kind);
                    }
                    let stored = self.store.read_range(&series, start, end)?;
                    if stored.is_empty() {
                        return Err(QdbError::Unavailable(err.to_string()));
                    }
                    return Err(QdbError::PartialData {
                        missing_ranges: vec![(start, end)],
                        cause: err.to_string(),
                    });
                }
            }
        }

        self.coverage.note_access(&series);
        let result = self.store.read_range(&series, start, end)?;
        self.metrics.record_bars_served(result.len() as u64);
        Ok(result)
    }

    /// Drop every cached series of one asset id.
    pub fn clear_asset(&self, asset_id: i64) -> Result<()> {
        self.store.delete_asset(asset_id)?;
        self.coverage.remove_asset(asset_id)?;
        Ok(())
    }

    fn fill_series<F>(
        &self,
        symbol: &str,
        market: Market,
        series: SeriesKey,
        start: NaiveDate,
        end: NaiveDate,
        ctx: &RequestCtx,
        fetch: F,
    ) -> Result<Vec<Bar>>
    where
        F: Fn(NaiveDate, NaiveDate) -> Result<Vec<Bar>>,
    {
        if start > end {
            return Err(QdbError::InvalidDateRange(format!(
                "start {} after end {}",
                format_day(start),
                format_day(end)
            )));
        }
        ctx.check()?;

        if self.allow_calendar_fallback && !self.calendar.has_snapshot(market) {
            self.metrics.record_degraded();
        }
        let grid = self.calendar.trading_days(market, start, end)?;
        if grid.is_empty() {
            return Ok(Vec::new());
        }

        // Single-flight: one outstanding computation per fingerprint. A
        // waiter whose window the in-flight computation covered sees its
        // gaps already filled below.
        let flight = self.flights.acquire(series, (start, end), ctx)?;
        if flight.covered_by_inflight {
            self.metrics.record_inflight_dedup();
        }

        let present = self.store.present_dates(&series, start, end)?;
        let today = self.calendar.today_in_market(market);
        let market_open = self.calendar.is_market_open(market).unwrap_or(false);
        let negative = self.negative_days(symbol, &series, &grid, &present);
        if !negative.is_empty() {
            self.metrics.record_negative_hit(negative.len() as u64);
        }

        let plan = gap::plan(&grid, &present, &negative, Some(today), market_open);
        self.metrics.record_hits(plan.present_days as u64);
        self.metrics.record_misses(plan.missing_days as u64);

        let mut failed: Vec<(MissingRange, String)> = Vec::new();
        for (i, span) in plan.spans.iter().enumerate() {
            if span.hot && !span.has_missing {
                // Refetch of an already-complete hot run is rate-limited.
                let key = self.hot_guard_key(symbol, market, &series, today);
                if self.ttl.get(&key).is_some() {
                    continue;
                }
            }

            if let Err(err) = ctx.check() {
                return Err(self.control_failure(err, outstanding(&failed, &plan.spans, i)));
            }
            let permit = match self.gate.acquire(ctx) {
                Ok(permit) => permit,
                Err(QdbError::Overloaded) => {
                    self.metrics.record_overloaded();
                    return Err(QdbError::Overloaded);
                }
                Err(err) => {
                    return Err(self.control_failure(err, outstanding(&failed, &plan.spans, i)))
                }
            };

            let t0 = Instant::now();
            let fetched = self.retry.run(ctx, || fetch(span.start, span.end));
            drop(permit);

            match fetched {
                Ok(bars) => {
                    self.metrics.record_upstream_call(t0.elapsed());
                    let bars = self.filter_trading_days(market, bars)?;
                    self.store.upsert(&series, &bars)?;
                    self.coverage.update_from_store(&series, &self.store)?;
                    self.metrics.record_bars_stored(bars.len() as u64);
                    self.record_absent_days(symbol, market, &series, span.start, span.end, &bars, today)?;
                    if span.hot {
                        self.ttl.put(
                            self.hot_guard_key(symbol, market, &series, today),
                            serde_json::Value::Bool(true),
                            self.fetcher.source_name(),
                            None,
                        );
                    }
                }
                Err(QdbError::Canceled) => return Err(QdbError::Canceled),
                Err(err @ QdbError::Timeout { .. }) => {
                    return Err(self.control_failure(err, outstanding(&failed, &plan.spans, i)));
                }
                Err(err) => {
                    if let QdbError::Upstream { kind, .. } = &err {
                        self.metrics.record_upstream_error(*kind);
                    }
                    if span.has_missing {
                        failed.push(((span.start, span.end), err.to_string()));
                    } else {
                        log::warn!("hot refetch failed for {symbol}, serving stored bars: {err}");
                    }
                }
            }
        }

        self.coverage.note_access(&series);
        let result = self.store.read_range(&series, start, end)?;
        self.metrics.record_bars_served(result.len() as u64);

        if let Some((_, cause)) = failed.first() {
            let cause = cause.clone();
            let missing_ranges: Vec<MissingRange> =
                failed.iter().map(|(range, _)| *range).collect();
            if result.is_empty() {
                return Err(QdbError::Unavailable(cause));
            }
            return Err(QdbError::PartialData { missing_ranges, cause });
        }
        Ok(result)
    }

    /// Cancellation surfaces as-is; a deadline expiry is annotated with the
    /// sub-windows that were still outstanding.
    fn control_failure(&self, err: QdbError, missing: Vec<MissingRange>) -> QdbError {
        match err {
            QdbError::Timeout { .. } => QdbError::Timeout { missing_ranges: missing },
            other => other,
        }
    }

    /// A stored bar's date must be a declared trading day; rows upstream
    /// places elsewhere are dropped before persistence.
    fn filter_trading_days(&self, market: Market, bars: Vec<Bar>) -> Result<Vec<Bar>> {
        let mut kept = Vec::with_capacity(bars.len());
        for bar in bars {
            if self.calendar.is_trading_day(market, bar.trade_date)? {
                kept.push(bar);
            } else {
                log::warn!(
                    "discarding upstream bar dated {} outside the {} calendar",
                    bar.trade_date,
                    market.as_str()
                );
            }
        }
        Ok(kept)
    }

    /// Trading days of the fetched window the upstream answered without a
    /// row are remembered as negative coverage, so the next request does
    /// not refetch them inside the TTL.
    #[allow(clippy::too_many_arguments)]
    fn record_absent_days(
        &self,
        symbol: &str,
        market: Market,
        series: &SeriesKey,
        span_start: NaiveDate,
        span_end: NaiveDate,
        fetched: &[Bar],
        today: NaiveDate,
    ) -> Result<()> {
        let got: BTreeSet<NaiveDate> = fetched.iter().map(|b| b.trade_date).collect();
        for day in self.calendar.trading_days(market, span_start, span_end)? {
            if got.contains(&day) || day > today {
                continue;
            }
            let ttl = if day == today { self.negative_ttl_today } else { self.negative_ttl };
            self.ttl.put(
                self.no_data_key(symbol, series, day),
                serde_json::Value::Bool(true),
                self.fetcher.source_name(),
                Some(ttl),
            );
        }
        Ok(())
    }

    fn negative_days(
        &self,
        symbol: &str,
        series: &SeriesKey,
        grid: &[NaiveDate],
        present: &BTreeSet<NaiveDate>,
    ) -> BTreeSet<NaiveDate> {
        grid.iter()
            .filter(|d| !present.contains(*d))
            .filter(|d| self.ttl.get(&self.no_data_key(symbol, series, **d)).is_some())
            .copied()
            .collect()
    }

    /// The asset id is part of the tag: an index and an equity can share a
    /// six-digit code but never a series.
    fn series_tag(series: &SeriesKey) -> String {
        format!(
            "{}:{}:{}",
            series.asset_id,
            series.adjust.as_str(),
            series.period.as_str()
        )
    }

    fn no_data_key(&self, symbol: &str, series: &SeriesKey, day: NaiveDate) -> CacheKey {
        CacheKey::new(CacheKind::NoData)
            .symbol(symbol)
            .extra(format!("{}:{}", Self::series_tag(series), format_day(day)))
    }

    fn hot_guard_key(
        &self,
        symbol: &str,
        market: Market,
        series: &SeriesKey,
        today: NaiveDate,
    ) -> CacheKey {
        CacheKey::new(CacheKind::HotHistoryGuard)
            .market(market)
            .symbol(symbol)
            .extra(format!("{}:{}", Self::series_tag(series), format_day(today)))
    }
}

/// Sub-windows still owed upstream work: everything that already failed
/// plus the plan's unprocessed missing spans from `from` on.
fn outstanding(
    failed: &[(MissingRange, String)],
    spans: &[gap::FetchSpan],
    from: usize,
) -> Vec<MissingRange> {
    let mut missing: Vec<MissingRange> = failed.iter().map(|(range, _)| *range).collect();
    missing.extend(
        spans[from..]
            .iter()
            .filter(|s| s.has_missing)
            .map(|s| (s.start, s.end)),
    );
    missing
}
