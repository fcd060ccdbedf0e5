//! Shared fixture: an isolated cache instance over a scripted upstream and
//! a manually driven clock.
#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use quantdb::calendar::{CalendarSource, RuleBasedSource};
use quantdb::clock::ManualClock;
use quantdb::config::CacheConfig;
use quantdb::fetch::ScriptedFetcher;
use quantdb::prelude::*;
use std::sync::Arc;

pub struct TestCache {
    pub db: QuantDb,
    pub fetcher: Arc<ScriptedFetcher>,
    pub clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

pub fn day(s: &str) -> NaiveDate {
    quantdb::types::parse_day(s).unwrap()
}

/// Monday 2024-06-03, 20:00 in Shanghai: a trading day, session closed.
pub fn closed_session_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

/// Monday 2024-06-03, 10:15 in Shanghai: mid-session.
pub fn open_session_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 2, 15, 0).unwrap()
}

pub fn cache_at(now: DateTime<Utc>) -> TestCache {
    cache_with_config(now, CacheConfig::default())
}

pub fn cache_with_config(now: DateTime<Utc>, config: CacheConfig) -> TestCache {
    let dir = tempfile::tempdir().unwrap();
    let config = config.with_cache_dir(dir.path());
    let clock = Arc::new(ManualClock::new(now));
    let fetcher = Arc::new(ScriptedFetcher::new());
    let db = QuantDb::builder()
        .config(config)
        .fetcher(fetcher.clone())
        .clock(clock.clone())
        .open()
        .unwrap();
    TestCache { db, fetcher, clock, _dir: dir }
}

/// Seed every trading day of the window for one symbol, per the built-in
/// calendar rules (the same rules the scripted trade-date feed answers with).
pub fn seed_trading_days(
    fetcher: &ScriptedFetcher,
    market: Market,
    symbol: &str,
    adjust: AdjustMode,
    start: &str,
    end: &str,
) -> Vec<NaiveDate> {
    let days = RuleBasedSource
        .trading_days(market, day(start), day(end))
        .unwrap();
    fetcher.seed_days(symbol, adjust, &days);
    days
}
