//! Asset registry: symbol → stable id plus cached descriptive fields
//!
//! Ids are allocated lazily on first reference and persisted; two racing
//! resolves of a new symbol converge on one allocation through the unique
//! constraint. Descriptive fields refresh from upstream when stale; when
//! upstream is down the registry answers with whatever it has, tagged
//! `data_source = "default"`.

use crate::clock::Clock;
use crate::error::{QdbError, Result};
use crate::fetch::{AssetInfoPatch, UpstreamFetcher};
use crate::store::Db;
use crate::types::{
    canonical_symbol, format_day, parse_day, Asset, AssetId, AssetType, Market,
};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Registry of known assets backed by the shared database.
pub struct AssetRegistry {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
    fetcher: Arc<dyn UpstreamFetcher>,
    /// Descriptive records older than this refresh on access.
    max_info_age: Duration,
    /// symbol+type → id, warmed on first resolve.
    ids: RwLock<HashMap<(String, AssetType), AssetId>>,
}

impl AssetRegistry {
    pub fn new(
        db: Arc<Db>,
        clock: Arc<dyn Clock>,
        fetcher: Arc<dyn UpstreamFetcher>,
        max_info_age: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            fetcher,
            max_info_age,
            ids: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a symbol to its stable id, allocating on first sight.
    /// Idempotent; concurrent first sights converge on one allocation.
    pub fn resolve(&self, symbol: &str) -> Result<AssetId> {
        self.resolve_typed(symbol, AssetType::Equity)
    }

    /// Resolve an index symbol; indexes live in their own symbol space
    /// because mainland index codes collide with equity codes.
    pub fn resolve_index(&self, symbol: &str) -> Result<AssetId> {
        self.resolve_typed(symbol, AssetType::Index)
    }

    fn resolve_typed(&self, symbol: &str, asset_type: AssetType) -> Result<AssetId> {
        let (symbol, market) = canonical_symbol(symbol)?;
        let cache_key = (symbol.clone(), asset_type);
        if let Some(id) = self.ids.read().unwrap().get(&cache_key) {
            return Ok(*id);
        }

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO assets (symbol, market, asset_type, data_source)
                 VALUES (?1, ?2, ?3, 'default')",
                params![symbol, market.as_str(), asset_type.as_str()],
            )?;
            let id: AssetId = conn.query_row(
                "SELECT asset_id FROM assets WHERE symbol = ?1 AND asset_type = ?2",
                params![symbol, asset_type.as_str()],
                |row| row.get(0),
            )?;
            Ok(id)
        })?;
        self.ids.write().unwrap().insert(cache_key, id);
        Ok(id)
    }

    /// Id of an already-registered symbol, without allocating one.
    pub fn lookup(&self, symbol: &str) -> Result<Option<AssetId>> {
        self.lookup_typed(symbol, AssetType::Equity)
    }

    /// As `lookup`, in the index namespace.
    pub fn lookup_index(&self, symbol: &str) -> Result<Option<AssetId>> {
        self.lookup_typed(symbol, AssetType::Index)
    }

    fn lookup_typed(&self, symbol: &str, asset_type: AssetType) -> Result<Option<AssetId>> {
        let (symbol, _) = canonical_symbol(symbol)?;
        if let Some(id) = self.ids.read().unwrap().get(&(symbol.clone(), asset_type)) {
            return Ok(Some(*id));
        }
        self.db.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT asset_id FROM assets WHERE symbol = ?1 AND asset_type = ?2",
                    params![symbol, asset_type.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    /// The descriptive record for a symbol, refreshing from upstream when
    /// the cached fields are absent or stale. Upstream failure degrades to
    /// the best available record with a generated display name.
    pub fn describe(&self, symbol: &str, force_refresh: bool) -> Result<Asset> {
        let (symbol, market) = canonical_symbol(symbol)?;
        let asset_id = self.resolve(&symbol)?;
        let now = self.clock.now_utc();

        let stored = self.read_row(asset_id)?;
        let fresh = stored.as_ref().is_some_and(|(asset, updated)| {
            asset.data_source != "default"
                && updated.is_some_and(|t| {
                    (now - t).to_std().map(|age| age < self.max_info_age).unwrap_or(false)
                })
        });
        if fresh && !force_refresh {
            return Ok(stored.unwrap().0);
        }

        match self.fetcher.fetch_asset_info(&symbol, market) {
            Ok(patch) => {
                self.apply_patch(asset_id, &patch, self.fetcher.source_name(), now)?;
                Ok(self.read_row(asset_id)?.map(|(asset, _)| asset).ok_or_else(|| {
                    QdbError::Storage(format!("asset {asset_id} vanished mid-describe"))
                })?)
            }
            Err(e) => {
                log::warn!("asset info refresh failed for {symbol}: {e}");
                match stored {
                    Some((asset, _)) => Ok(asset),
                    None => Ok(default_asset(asset_id, &symbol, market)),
                }
            }
        }
    }

    /// Remove the id-cache entry for a symbol (used by cache clearing).
    pub fn forget(&self, symbol: &str) {
        let mut ids = self.ids.write().unwrap();
        ids.retain(|(s, _), _| s != symbol);
    }

    fn apply_patch(
        &self,
        asset_id: AssetId,
        patch: &AssetInfoPatch,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE assets SET
                    name = COALESCE(?2, name),
                    exchange = COALESCE(?3, exchange),
                    currency = COALESCE(?4, currency),
                    industry = COALESCE(?5, industry),
                    listing_date = COALESCE(?6, listing_date),
                    pe_ratio = COALESCE(?7, pe_ratio),
                    pb_ratio = COALESCE(?8, pb_ratio),
                    roe = COALESCE(?9, roe),
                    total_shares = COALESCE(?10, total_shares),
                    data_source = ?11,
                    updated_at = ?12
                 WHERE asset_id = ?1",
                params![
                    asset_id,
                    patch.name,
                    patch.exchange,
                    patch.currency,
                    patch.industry,
                    patch.listing_date.map(format_day),
                    patch.pe_ratio,
                    patch.pb_ratio,
                    patch.roe,
                    patch.total_shares,
                    source,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    fn read_row(&self, asset_id: AssetId) -> Result<Option<(Asset, Option<DateTime<Utc>>)>> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT symbol, name, market, exchange, currency, asset_type,
                            industry, listing_date, pe_ratio, pb_ratio, roe,
                            total_shares, data_source, updated_at
                     FROM assets WHERE asset_id = ?1",
                    params![asset_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, Option<f64>>(8)?,
                            row.get::<_, Option<f64>>(9)?,
                            row.get::<_, Option<f64>>(10)?,
                            row.get::<_, Option<f64>>(11)?,
                            row.get::<_, String>(12)?,
                            row.get::<_, Option<DateTime<Utc>>>(13)?,
                        ))
                    },
                )
                .optional()?;

            let Some((
                symbol,
                name,
                market,
                exchange,
                currency,
                asset_type,
                industry,
                listing_date,
                pe_ratio,
                pb_ratio,
                roe,
                total_shares,
                data_source,
                updated_at,
            )) = row
            else {
                return Ok(None);
            };

            let market = Market::parse(&market)?;
            let asset_type = match asset_type.as_str() {
                "index" => AssetType::Index,
                _ => AssetType::Equity,
            };
            let asset = Asset {
                asset_id,
                name: name.unwrap_or_else(|| generated_name(&symbol, market)),
                symbol,
                market,
                exchange: exchange.unwrap_or_else(|| default_exchange(market).to_string()),
                currency: currency.unwrap_or_else(|| default_currency(market).to_string()),
                asset_type,
                industry,
                listing_date: listing_date.as_deref().and_then(|s| parse_day(s).ok()),
                pe_ratio,
                pb_ratio,
                roe,
                total_shares,
                data_source,
                updated_at,
            };
            Ok(Some((asset, updated_at)))
        })
    }
}

fn generated_name(symbol: &str, market: Market) -> String {
    match market {
        Market::CnA => format!("Stock {symbol}"),
        Market::Hk => format!("HK Stock {symbol}"),
    }
}

fn default_exchange(market: Market) -> &'static str {
    match market {
        Market::CnA => "SSE/SZSE",
        Market::Hk => "HKEX",
    }
}

fn default_currency(market: Market) -> &'static str {
    match market {
        Market::CnA => "CNY",
        Market::Hk => "HKD",
    }
}

fn default_asset(asset_id: AssetId, symbol: &str, market: Market) -> Asset {
    Asset {
        asset_id,
        symbol: symbol.to_string(),
        name: generated_name(symbol, market),
        market,
        exchange: default_exchange(market).to_string(),
        currency: default_currency(market).to_string(),
        asset_type: AssetType::Equity,
        industry: None,
        listing_date: None,
        pe_ratio: None,
        pb_ratio: None,
        roe: None,
        total_shares: None,
        data_source: "default".to_string(),
        updated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fetch::ScriptedFetcher;
    use chrono::TimeZone;

    fn setup() -> (AssetRegistry, Arc<ScriptedFetcher>, Arc<ManualClock>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 12, 8, 0, 0).unwrap(),
        ));
        let fetcher = Arc::new(ScriptedFetcher::new());
        let registry = AssetRegistry::new(
            db,
            clock.clone(),
            fetcher.clone(),
            Duration::from_secs(24 * 3600),
        );
        (registry, fetcher, clock)
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let (registry, _fetcher, _clock) = setup();
        let a = registry.resolve("600000").unwrap();
        let b = registry.resolve("600000").unwrap();
        assert_eq!(a, b);
        let c = registry.resolve("000001").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_hk_prefix_resolves_to_same_asset() {
        let (registry, _fetcher, _clock) = setup();
        let a = registry.resolve("HK.00700").unwrap();
        let b = registry.resolve("00700").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_index_namespace_is_separate() {
        let (registry, _fetcher, _clock) = setup();
        let equity = registry.resolve("000001").unwrap();
        let index = registry.resolve_index("000001").unwrap();
        assert_ne!(equity, index);
    }

    #[test]
    fn test_concurrent_resolve_single_allocation() {
        let (registry, _fetcher, _clock) = setup();
        let registry = Arc::new(registry);
        let mut ids = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move || registry.resolve("600519").unwrap())
                })
                .collect();
            for handle in handles {
                ids.push(handle.join().unwrap());
            }
        });
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_describe_populates_from_upstream() {
        let (registry, fetcher, _clock) = setup();
        fetcher.seed_info(
            "600000",
            AssetInfoPatch {
                name: Some("浦发银行".to_string()),
                industry: Some("银行".to_string()),
                ..Default::default()
            },
        );
        let asset = registry.describe("600000", false).unwrap();
        assert_eq!(asset.name, "浦发银行");
        assert_eq!(asset.industry.as_deref(), Some("银行"));
        assert_eq!(asset.data_source, "scripted");
        assert_eq!(asset.currency, "CNY");
    }

    #[test]
    fn test_describe_degrades_to_default() {
        let (registry, fetcher, _clock) = setup();
        fetcher.set_outage(crate::error::UpstreamErrorKind::Network);
        let asset = registry.describe("600000", false).unwrap();
        assert_eq!(asset.data_source, "default");
        assert_eq!(asset.name, "Stock 600000");
    }

    #[test]
    fn test_describe_refreshes_when_stale() {
        let (registry, fetcher, clock) = setup();
        fetcher.seed_info(
            "600000",
            AssetInfoPatch { name: Some("浦发银行".to_string()), ..Default::default() },
        );
        registry.describe("600000", false).unwrap();

        // Fresh: no refetch even with changed upstream data.
        fetcher.seed_info(
            "600000",
            AssetInfoPatch { name: Some("浦发银行A".to_string()), ..Default::default() },
        );
        assert_eq!(registry.describe("600000", false).unwrap().name, "浦发银行");

        // Stale after the policy window.
        clock.advance(chrono::Duration::days(2));
        assert_eq!(registry.describe("600000", false).unwrap().name, "浦发银行A");

        // force_refresh produces a deliberate miss.
        fetcher.seed_info(
            "600000",
            AssetInfoPatch { name: Some("浦发银行B".to_string()), ..Default::default() },
        );
        assert_eq!(registry.describe("600000", true).unwrap().name, "浦发银行B");
    }
}
