//! Coverage index: per-series summaries that spare the gap planner a scan
//!
//! The index keeps `(earliest, latest, bar_count)` plus access timestamps
//! for every cached series, in memory with a database mirror. It is
//! recomputed from the bar rows after every committed upsert rather than
//! inferred from request windows.

use crate::clock::Clock;
use crate::error::{QdbError, Result};
use crate::store::{BarStore, Db};
use crate::types::{format_day, parse_day, AdjustMode, Period, SeriesKey};
use chrono::{DateTime, NaiveDate, Utc};
use hashbrown::HashMap;
use rusqlite::params;
use std::sync::{Arc, RwLock};

/// Summary of the persisted range of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRecord {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
    pub bar_count: u64,
    pub first_requested_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// In-memory coverage map mirrored to the `coverage` table.
pub struct CoverageIndex {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<SeriesKey, CoverageRecord>>,
}

impl CoverageIndex {
    /// Load the persisted records into memory.
    pub fn load(db: Arc<Db>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut records = HashMap::new();
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT asset_id, adjust, period, earliest, latest, bar_count,
                        first_requested_at, last_accessed_at, last_updated_at
                 FROM coverage",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<DateTime<Utc>>>(6)?,
                    row.get::<_, Option<DateTime<Utc>>>(7)?,
                    row.get::<_, Option<DateTime<Utc>>>(8)?,
                ))
            })?;
            let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
            for row in rows {
                let (asset_id, adjust, period, earliest, latest, count, first, accessed, updated) =
                    row?;
                let key = SeriesKey {
                    asset_id,
                    adjust: AdjustMode::parse(&adjust)?,
                    period: Period::parse(&period)?,
                };
                let earliest = parse_day(&earliest)?;
                let latest = parse_day(&latest)?;
                if earliest > latest {
                    return Err(QdbError::CoverageCorruption(format!(
                        "series {key:?} has earliest {earliest} after latest {latest}; rebuild suggested"
                    )));
                }
                records.insert(
                    key,
                    CoverageRecord {
                        earliest,
                        latest,
                        bar_count: count as u64,
                        first_requested_at: first.unwrap_or(epoch),
                        last_accessed_at: accessed.unwrap_or(epoch),
                        last_updated_at: updated.unwrap_or(epoch),
                    },
                );
            }
            Ok(())
        })?;
        Ok(Self { db, clock, records: RwLock::new(records) })
    }

    pub fn get(&self, series: &SeriesKey) -> Option<CoverageRecord> {
        self.records.read().unwrap().get(series).cloned()
    }

    /// Stamp a read of the series.
    pub fn note_access(&self, series: &SeriesKey) {
        let now = self.clock.now_utc();
        if let Some(rec) = self.records.write().unwrap().get_mut(series) {
            rec.last_accessed_at = now;
        }
    }

    /// Recompute the summary from the bar rows after a committed upsert and
    /// mirror it to disk.
    pub fn update_from_store(&self, series: &SeriesKey, store: &BarStore) -> Result<()> {
        let now = self.clock.now_utc();
        match store.coverage(series)? {
            Some((earliest, latest, bar_count)) => {
                let mut records = self.records.write().unwrap();
                let rec = records.entry(*series).or_insert_with(|| CoverageRecord {
                    earliest,
                    latest,
                    bar_count,
                    first_requested_at: now,
                    last_accessed_at: now,
                    last_updated_at: now,
                });
                rec.earliest = earliest;
                rec.latest = latest;
                rec.bar_count = bar_count;
                rec.last_updated_at = now;
                let rec = rec.clone();
                drop(records);
                self.persist(series, &rec)
            }
            None => {
                self.records.write().unwrap().remove(series);
                self.db.with_conn(|conn| {
                    conn.execute(
                        "DELETE FROM coverage
                         WHERE asset_id = ?1 AND adjust = ?2 AND period = ?3",
                        params![series.asset_id, series.adjust.as_str(), series.period.as_str()],
                    )?;
                    Ok(())
                })
            }
        }
    }

    /// Repair one series from its bar rows.
    pub fn rebuild(&self, series: &SeriesKey, store: &BarStore) -> Result<()> {
        self.update_from_store(series, store)
    }

    /// Compare the index against the store; disagreement is corruption.
    pub fn verify(&self, series: &SeriesKey, store: &BarStore) -> Result<()> {
        let indexed = self.get(series);
        let actual = store.coverage(series)?;
        let agree = match (&indexed, &actual) {
            (None, None) => true,
            (Some(rec), Some((earliest, latest, count))) => {
                rec.earliest == *earliest && rec.latest == *latest && rec.bar_count == *count
            }
            _ => false,
        };
        if agree {
            Ok(())
        } else {
            Err(QdbError::CoverageCorruption(format!(
                "index {indexed:?} disagrees with store {actual:?} for {series:?}; rebuild suggested"
            )))
        }
    }

    /// Drop every record of one asset (all adjust modes and periods).
    pub fn remove_asset(&self, asset_id: i64) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .retain(|key, _| key.asset_id != asset_id);
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM coverage WHERE asset_id = ?1", params![asset_id])?;
            Ok(())
        })
    }

    /// Drop everything.
    pub fn clear(&self) -> Result<()> {
        self.records.write().unwrap().clear();
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM coverage", [])?;
            Ok(())
        })
    }

    /// Number of tracked series.
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    fn persist(&self, series: &SeriesKey, rec: &CoverageRecord) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO coverage (asset_id, adjust, period, earliest, latest, bar_count,
                    first_requested_at, last_accessed_at, last_updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (asset_id, adjust, period) DO UPDATE SET
                    earliest = excluded.earliest,
                    latest = excluded.latest,
                    bar_count = excluded.bar_count,
                    last_accessed_at = excluded.last_accessed_at,
                    last_updated_at = excluded.last_updated_at",
                params![
                    series.asset_id,
                    series.adjust.as_str(),
                    series.period.as_str(),
                    format_day(rec.earliest),
                    format_day(rec.latest),
                    rec.bar_count as i64,
                    rec.first_requested_at,
                    rec.last_accessed_at,
                    rec.last_updated_at,
                ],
            )?;
            Ok(())
        })
    }
}
