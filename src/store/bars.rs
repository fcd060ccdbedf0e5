//! Durable row store for daily bars with range semantics
//!
//! Rows are keyed by `(asset_id, adjust, period, trade_date)` so differently
//! adjusted series (and index cadences) never share rows. Dates are stored
//! as `YYYYMMDD` text, which makes lexicographic range scans agree with
//! chronological order.

use crate::error::Result;
use crate::store::Db;
use crate::types::{format_day, parse_day, Bar, SeriesKey};
use chrono::NaiveDate;
use rusqlite::params;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Persistent bar rows for all cached series.
pub struct BarStore {
    db: Arc<Db>,
}

impl BarStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Bars of one series in `[start, end]`, ascending by trade date.
    pub fn read_range(&self, series: &SeriesKey, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<Bar>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT trade_date, open, high, low, close, volume, turnover,
                        amplitude, pct_change, change, turnover_rate, adjusted_close
                 FROM bars
                 WHERE asset_id = ?1 AND adjust = ?2 AND period = ?3
                   AND trade_date >= ?4 AND trade_date <= ?5
                 ORDER BY trade_date ASC",
            )?;
            let rows = stmt.query_map(
                params![
                    series.asset_id,
                    series.adjust.as_str(),
                    series.period.as_str(),
                    format_day(start),
                    format_day(end),
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        Bar {
                            trade_date: NaiveDate::MIN,
                            open: row.get(1)?,
                            high: row.get(2)?,
                            low: row.get(3)?,
                            close: row.get(4)?,
                            volume: row.get(5)?,
                            turnover: row.get(6)?,
                            amplitude: row.get(7)?,
                            pct_change: row.get(8)?,
                            change: row.get(9)?,
                            turnover_rate: row.get(10)?,
                            adjusted_close: row.get(11)?,
                        },
                    ))
                },
            )?;
            let mut bars = Vec::new();
            for row in rows {
                let (date, mut bar) = row?;
                bar.trade_date = parse_day(&date)?;
                bars.push(bar);
            }
            Ok(bars)
        })
    }

    /// The dates of one series present in `[start, end]`, via a single range
    /// scan (the gap planner never probes day by day).
    pub fn present_dates(&self, series: &SeriesKey, start: NaiveDate, end: NaiveDate)
        -> Result<BTreeSet<NaiveDate>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT trade_date FROM bars
                 WHERE asset_id = ?1 AND adjust = ?2 AND period = ?3
                   AND trade_date >= ?4 AND trade_date <= ?5",
            )?;
            let rows = stmt.query_map(
                params![
                    series.asset_id,
                    series.adjust.as_str(),
                    series.period.as_str(),
                    format_day(start),
                    format_day(end),
                ],
                |row| row.get::<_, String>(0),
            )?;
            let mut dates = BTreeSet::new();
            for row in rows {
                dates.insert(parse_day(&row?)?);
            }
            Ok(dates)
        })
    }

    /// Upsert one batch of bars atomically. A conflict on the key replaces
    /// every non-key field with the incoming values, so re-upserting the
    /// same window is idempotent. The whole batch is validated before the
    /// transaction starts; either every row persists or none does.
    pub fn upsert(&self, series: &SeriesKey, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        for bar in bars {
            bar.validate()?;
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO bars (asset_id, adjust, period, trade_date,
                        open, high, low, close, volume, turnover, amplitude,
                        pct_change, change, turnover_rate, adjusted_close)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT (asset_id, adjust, period, trade_date) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        volume = excluded.volume,
                        turnover = excluded.turnover,
                        amplitude = excluded.amplitude,
                        pct_change = excluded.pct_change,
                        change = excluded.change,
                        turnover_rate = excluded.turnover_rate,
                        adjusted_close = excluded.adjusted_close",
                )?;
                for bar in bars {
                    stmt.execute(params![
                        series.asset_id,
                        series.adjust.as_str(),
                        series.period.as_str(),
                        format_day(bar.trade_date),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.turnover,
                        bar.amplitude,
                        bar.pct_change,
                        bar.change,
                        bar.turnover_rate,
                        bar.adjusted_close,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(bars.len())
        })
    }

    /// Delete bars of one series inside a window; both bounds omitted wipes
    /// the series.
    pub fn delete(&self, series: &SeriesKey, start: Option<NaiveDate>, end: Option<NaiveDate>)
        -> Result<usize> {
        self.db.with_conn(|conn| {
            let lo = start.map(format_day).unwrap_or_else(|| "00000000".to_string());
            let hi = end.map(format_day).unwrap_or_else(|| "99999999".to_string());
            let n = conn.execute(
                "DELETE FROM bars
                 WHERE asset_id = ?1 AND adjust = ?2 AND period = ?3
                   AND trade_date >= ?4 AND trade_date <= ?5",
                params![
                    series.asset_id,
                    series.adjust.as_str(),
                    series.period.as_str(),
                    lo,
                    hi
                ],
            )?;
            Ok(n)
        })
    }

    /// Delete every series of one asset (all adjust modes and periods).
    pub fn delete_asset(&self, asset_id: i64) -> Result<usize> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM bars WHERE asset_id = ?1", params![asset_id])?;
            Ok(n)
        })
    }

    /// Delete every bar row.
    pub fn delete_all(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM bars", [])?;
            Ok(n)
        })
    }

    /// `(earliest, latest, count)` of one series, or `None` when empty.
    pub fn coverage(&self, series: &SeriesKey) -> Result<Option<(NaiveDate, NaiveDate, u64)>> {
        self.db.with_conn(|conn| {
            let row: (Option<String>, Option<String>, i64) = conn.query_row(
                "SELECT MIN(trade_date), MAX(trade_date), COUNT(*)
                 FROM bars
                 WHERE asset_id = ?1 AND adjust = ?2 AND period = ?3",
                params![series.asset_id, series.adjust.as_str(), series.period.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            match row {
                (Some(min), Some(max), count) if count > 0 => {
                    Ok(Some((parse_day(&min)?, parse_day(&max)?, count as u64)))
                }
                _ => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdjustMode;

    fn store() -> BarStore {
        BarStore::new(Arc::new(Db::open_in_memory().unwrap()))
    }

    fn d(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    fn bar(date: &str, close: f64) -> Bar {
        let mut b = Bar::empty(d(date));
        b.close = Some(close);
        b.volume = Some(1000.0);
        b
    }

    #[test]
    fn test_upsert_and_read_range() {
        let store = store();
        let series = SeriesKey::daily(1, AdjustMode::Raw);
        let bars = vec![bar("20240102", 10.0), bar("20240103", 10.5), bar("20240104", 10.2)];
        assert_eq!(store.upsert(&series, &bars).unwrap(), 3);

        let got = store.read_range(&series, d("20240102"), d("20240103")).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].trade_date, d("20240102"));
        assert_eq!(got[1].close, Some(10.5));
    }

    #[test]
    fn test_upsert_is_idempotent_and_replaces() {
        let store = store();
        let series = SeriesKey::daily(1, AdjustMode::Raw);
        store.upsert(&series, &[bar("20240102", 10.0)]).unwrap();
        store.upsert(&series, &[bar("20240102", 11.0)]).unwrap();

        let got = store.read_range(&series, d("20240102"), d("20240102")).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, Some(11.0));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = store();
        let series = SeriesKey::daily(1, AdjustMode::Raw);
        let mut bad = bar("20240103", 10.0);
        bad.volume = Some(f64::INFINITY);
        let err = store.upsert(&series, &[bar("20240102", 10.0), bad]).unwrap_err();
        assert!(matches!(err, crate::error::QdbError::SchemaViolation(_)));
        assert!(store.coverage(&series).unwrap().is_none());
    }

    #[test]
    fn test_adjust_modes_do_not_share_rows() {
        let store = store();
        let raw = SeriesKey::daily(1, AdjustMode::Raw);
        let qfq = SeriesKey::daily(1, AdjustMode::Qfq);
        store.upsert(&raw, &[bar("20240102", 10.0)]).unwrap();
        store.upsert(&qfq, &[bar("20240102", 8.5)]).unwrap();

        assert_eq!(
            store.read_range(&raw, d("20240101"), d("20240131")).unwrap()[0].close,
            Some(10.0)
        );
        assert_eq!(
            store.read_range(&qfq, d("20240101"), d("20240131")).unwrap()[0].close,
            Some(8.5)
        );
        store.delete(&raw, None, None).unwrap();
        assert!(store.coverage(&raw).unwrap().is_none());
        assert!(store.coverage(&qfq).unwrap().is_some());
    }

    #[test]
    fn test_coverage_and_present_dates() {
        let store = store();
        let series = SeriesKey::daily(7, AdjustMode::Raw);
        store
            .upsert(&series, &[bar("20240102", 1.0), bar("20240105", 2.0), bar("20240108", 3.0)])
            .unwrap();

        let (earliest, latest, count) = store.coverage(&series).unwrap().unwrap();
        assert_eq!((earliest, latest, count), (d("20240102"), d("20240108"), 3));

        let present = store.present_dates(&series, d("20240103"), d("20240108")).unwrap();
        assert_eq!(present.len(), 2);
        assert!(present.contains(&d("20240105")));
        assert!(!present.contains(&d("20240102")));
    }

    #[test]
    fn test_windowed_delete() {
        let store = store();
        let series = SeriesKey::daily(1, AdjustMode::Raw);
        store
            .upsert(&series, &[bar("20240102", 1.0), bar("20240103", 2.0), bar("20240104", 3.0)])
            .unwrap();
        store.delete(&series, Some(d("20240103")), Some(d("20240103"))).unwrap();
        let got = store.read_range(&series, d("20240101"), d("20240131")).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|b| b.trade_date != d("20240103")));
    }

    #[test]
    fn test_delete_asset_scoped() {
        let store = store();
        let a = SeriesKey::daily(1, AdjustMode::Raw);
        let b = SeriesKey::daily(2, AdjustMode::Raw);
        store.upsert(&a, &[bar("20240102", 1.0)]).unwrap();
        store.upsert(&b, &[bar("20240102", 2.0)]).unwrap();
        store.delete_asset(1).unwrap();
        assert!(store.coverage(&a).unwrap().is_none());
        assert!(store.coverage(&b).unwrap().is_some());
    }
}
