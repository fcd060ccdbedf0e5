//! Keyed store for objects whose correctness is a function of freshness only
//!
//! Keys are structured `(kind, market, symbol, extra)`. Each kind carries a
//! market-hours TTL and an off-hours TTL; market state is delegated to the
//! calendar, and when the calendar cannot answer, every kind degrades to its
//! off-hours value. Expired entries are misses: purged lazily on read plus a
//! periodic sweep bounded by cache size.

use crate::calendar::TradingCalendar;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::types::Market;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Mutations between expiry sweeps.
const SWEEP_EVERY: u64 = 256;

/// Payload families with distinct freshness policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Quote,
    StockList,
    IndexList,
    FinancialSummary,
    /// Minimum-interval guard for hot-run refetches.
    HotHistoryGuard,
    /// Negative coverage: upstream declared "no data for this day".
    NoData,
}

/// Structured cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub market: Option<Market>,
    pub symbol: Option<String>,
    pub extra: Option<String>,
}

impl CacheKey {
    pub fn new(kind: CacheKind) -> Self {
        Self { kind, market: None, symbol: None, extra: None }
    }

    pub fn market(mut self, market: Market) -> Self {
        self.market = Some(market);
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }
}

#[derive(Debug, Clone)]
struct TtlEntry {
    payload: Value,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    source_tag: String,
}

struct KindPolicy {
    open: Duration,
    closed: Duration,
}

/// Freshness-keyed store shared by quotes, listings, guards and negative
/// coverage.
pub struct TtlCache {
    clock: Arc<dyn Clock>,
    calendar: Arc<TradingCalendar>,
    /// Uniform override of every kind's TTL (`QDB_CACHE_TTL`).
    ttl_override: Option<Duration>,
    hot_guard: KindPolicy,
    negative: KindPolicy,
    entries: RwLock<HashMap<CacheKey, TtlEntry>>,
    mutations: AtomicU64,
}

impl TtlCache {
    pub fn new(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        calendar: Arc<TradingCalendar>,
    ) -> Self {
        Self {
            clock,
            calendar,
            ttl_override: config.ttl_override,
            hot_guard: KindPolicy {
                open: config.hot_guard_open,
                closed: config.hot_guard_closed,
            },
            negative: KindPolicy {
                open: config.negative_ttl,
                closed: config.negative_ttl,
            },
            entries: RwLock::new(HashMap::new()),
            mutations: AtomicU64::new(0),
        }
    }

    fn policy(&self, kind: CacheKind) -> KindPolicy {
        match kind {
            CacheKind::Quote => KindPolicy {
                open: Duration::from_secs(5 * 60),
                closed: Duration::from_secs(60 * 60),
            },
            CacheKind::StockList | CacheKind::IndexList | CacheKind::FinancialSummary => {
                KindPolicy {
                    open: Duration::from_secs(24 * 3600),
                    closed: Duration::from_secs(24 * 3600),
                }
            }
            CacheKind::HotHistoryGuard => KindPolicy {
                open: self.hot_guard.open,
                closed: self.hot_guard.closed,
            },
            CacheKind::NoData => KindPolicy {
                open: self.negative.open,
                closed: self.negative.closed,
            },
        }
    }

    /// TTL for one key right now: the uniform override when set, otherwise
    /// the kind's market-hours or off-hours value.
    fn ttl_for(&self, key: &CacheKey) -> Duration {
        if let Some(ttl) = self.ttl_override {
            return ttl;
        }
        let policy = self.policy(key.kind);
        let open = key
            .market
            .map(|m| self.calendar.is_market_open(m).unwrap_or(false))
            .unwrap_or(false);
        if open {
            policy.open
        } else {
            policy.closed
        }
    }

    /// Fetch a live entry; expired entries are treated as absent and purged.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now_utc();
        {
            let entries = self.entries.read().unwrap();
            match entries.get(key) {
                Some(entry) if now < entry.expires_at => return Some(entry.payload.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().unwrap().remove(key);
        None
    }

    /// Insert with the key's policy TTL, or an explicit override.
    pub fn put(&self, key: CacheKey, payload: Value, source_tag: &str, ttl: Option<Duration>) {
        let now = self.clock.now_utc();
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(&key));
        let entry = TtlEntry {
            payload,
            inserted_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            source_tag: source_tag.to_string(),
        };
        self.entries.write().unwrap().insert(key, entry);
        self.maybe_sweep(now);
    }

    /// Typed read.
    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Typed insert.
    pub fn put_as<T: Serialize>(
        &self,
        key: CacheKey,
        payload: &T,
        source_tag: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.put(key, serde_json::to_value(payload)?, source_tag, ttl);
        Ok(())
    }

    /// Age of a live entry, for the stats surface.
    pub fn inserted_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        let now = self.clock.now_utc();
        self.entries
            .read()
            .unwrap()
            .get(key)
            .filter(|e| now < e.expires_at)
            .map(|e| e.inserted_at)
    }

    /// Source tag of a live entry.
    pub fn source_tag(&self, key: &CacheKey) -> Option<String> {
        let now = self.clock.now_utc();
        self.entries
            .read()
            .unwrap()
            .get(key)
            .filter(|e| now < e.expires_at)
            .map(|e| e.source_tag.clone())
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.write().unwrap().remove(key);
    }

    /// Drop every entry carrying this symbol, across kinds.
    pub fn invalidate_symbol(&self, symbol: &str) {
        self.entries
            .write()
            .unwrap()
            .retain(|key, _| key.symbol.as_deref() != Some(symbol));
    }

    /// Drop every entry of one kind.
    pub fn invalidate_kind(&self, kind: CacheKind) {
        self.entries.write().unwrap().retain(|key, _| key.kind != kind);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Live entry count (expired entries still pending a sweep excluded).
    pub fn len(&self) -> usize {
        let now = self.clock.now_utc();
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| now < e.expires_at)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        if self.mutations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != SWEEP_EVERY - 1 {
            return;
        }
        self.entries.write().unwrap().retain(|_, e| now < e.expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::RuleBasedSource;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        cache: TtlCache,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    /// Cache whose calendar sees a live CN session (02:00 UTC = 10:00 CST
    /// on Monday 2024-06-03).
    fn fixture() -> Fixture {
        fixture_at(Utc.with_ymd_and_hms(2024, 6, 3, 2, 0, 0).unwrap())
    }

    fn fixture_at(now: DateTime<Utc>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let calendar = Arc::new(TradingCalendar::new(
            dir.path().join("calendar_snapshot.json"),
            clock.clone(),
            Box::new(RuleBasedSource),
            false,
        ));
        calendar.ensure_ready().unwrap();
        let cache = TtlCache::new(&CacheConfig::default(), clock.clone(), calendar);
        Fixture { cache, clock, _dir: dir }
    }

    fn quote_key() -> CacheKey {
        CacheKey::new(CacheKind::Quote).market(Market::CnA).symbol("600000")
    }

    #[test]
    fn test_read_your_writes_and_expiry() {
        let f = fixture();
        f.cache.put(quote_key(), json!({"price": 10.5}), "akshare", None);
        assert_eq!(f.cache.get(&quote_key()).unwrap()["price"], 10.5);

        // Market open: the quote TTL is five minutes.
        f.clock.advance(chrono::Duration::seconds(299));
        assert!(f.cache.get(&quote_key()).is_some());
        f.clock.advance(chrono::Duration::seconds(2));
        assert!(f.cache.get(&quote_key()).is_none());
    }

    #[test]
    fn test_off_hours_ttl_applies() {
        // Sunday: market closed, quotes live for an hour.
        let f = fixture_at(Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap());
        f.cache.put(quote_key(), json!({"price": 10.5}), "akshare", None);
        f.clock.advance(chrono::Duration::minutes(45));
        assert!(f.cache.get(&quote_key()).is_some());
        f.clock.advance(chrono::Duration::minutes(20));
        assert!(f.cache.get(&quote_key()).is_none());
    }

    #[test]
    fn test_explicit_ttl_override() {
        let f = fixture();
        f.cache.put(quote_key(), json!(1), "test", Some(Duration::from_secs(10)));
        f.clock.advance(chrono::Duration::seconds(11));
        assert!(f.cache.get(&quote_key()).is_none());
    }

    #[test]
    fn test_invalidate_symbol_is_scoped() {
        let f = fixture();
        let other = CacheKey::new(CacheKind::Quote).market(Market::CnA).symbol("000001");
        f.cache.put(quote_key(), json!(1), "test", None);
        f.cache.put(other.clone(), json!(2), "test", None);
        f.cache.put(
            CacheKey::new(CacheKind::StockList).market(Market::CnA),
            json!([]),
            "test",
            None,
        );

        f.cache.invalidate_symbol("600000");
        assert!(f.cache.get(&quote_key()).is_none());
        assert!(f.cache.get(&other).is_some());
        assert_eq!(f.cache.len(), 2);
    }

    #[test]
    fn test_typed_round_trip() {
        let f = fixture();
        let list = vec!["a".to_string(), "b".to_string()];
        f.cache
            .put_as(CacheKey::new(CacheKind::IndexList), &list, "test", None)
            .unwrap();
        let got: Vec<String> = f.cache.get_as(&CacheKey::new(CacheKind::IndexList)).unwrap();
        assert_eq!(got, list);
    }

    #[test]
    fn test_sweep_prunes_expired_entries() {
        let f = fixture();
        for i in 0..10 {
            let key = CacheKey::new(CacheKind::Quote).symbol(format!("s{i}"));
            f.cache.put(key, json!(i), "test", Some(Duration::from_secs(1)));
        }
        f.clock.advance(chrono::Duration::seconds(5));
        // Push mutations past the sweep threshold.
        for i in 0..(SWEEP_EVERY as usize) {
            let key = CacheKey::new(CacheKind::NoData).symbol(format!("n{i}"));
            f.cache.put(key, json!(1), "test", Some(Duration::from_secs(3600)));
        }
        let raw = f.cache.entries.read().unwrap().len();
        // The ten expired quotes are physically gone, not just masked.
        assert!(raw <= SWEEP_EVERY as usize);
    }
}
