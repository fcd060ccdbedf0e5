//! Embedded database handle and schema management
//!
//! One SQLite file holds every persisted table (bar rows, the asset
//! registry, coverage summaries). A single serialized connection is shared
//! by all components; SQLite transactions give per-batch atomicity.

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// Shared handle to the embedded database.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Create or open the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.create_tables()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.create_tables()?;
        Ok(db)
    }

    /// Run `f` with the connection held. The lock serializes writers; reads
    /// in the same process always observe committed writes.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }

    fn create_tables(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS assets (
                    asset_id      INTEGER PRIMARY KEY AUTOINCREMENT,
                    symbol        TEXT NOT NULL,
                    name          TEXT,
                    market        TEXT NOT NULL,
                    exchange      TEXT,
                    currency      TEXT,
                    asset_type    TEXT NOT NULL,
                    industry      TEXT,
                    listing_date  TEXT,
                    pe_ratio      REAL,
                    pb_ratio      REAL,
                    roe           REAL,
                    total_shares  REAL,
                    data_source   TEXT NOT NULL DEFAULT 'default',
                    updated_at    TEXT,
                    UNIQUE (symbol, asset_type)
                );
                CREATE INDEX IF NOT EXISTS idx_assets_symbol ON assets(symbol);

                CREATE TABLE IF NOT EXISTS bars (
                    asset_id      INTEGER NOT NULL,
                    adjust        TEXT NOT NULL,
                    period        TEXT NOT NULL,
                    trade_date    TEXT NOT NULL,
                    open          REAL,
                    high          REAL,
                    low           REAL,
                    close         REAL,
                    volume        REAL,
                    turnover      REAL,
                    amplitude     REAL,
                    pct_change    REAL,
                    change        REAL,
                    turnover_rate REAL,
                    adjusted_close REAL,
                    PRIMARY KEY (asset_id, adjust, period, trade_date)
                );
                CREATE INDEX IF NOT EXISTS idx_bars_trade_date ON bars(trade_date);

                CREATE TABLE IF NOT EXISTS coverage (
                    asset_id           INTEGER NOT NULL,
                    adjust             TEXT NOT NULL,
                    period             TEXT NOT NULL,
                    earliest           TEXT NOT NULL,
                    latest             TEXT NOT NULL,
                    bar_count          INTEGER NOT NULL,
                    first_requested_at TEXT,
                    last_accessed_at   TEXT,
                    last_updated_at    TEXT,
                    PRIMARY KEY (asset_id, adjust, period)
                );",
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantdb.sqlite");
        {
            let _db = Db::open(&path).unwrap();
        }
        // Reopening an existing file must not fail or clobber tables.
        let db = Db::open(&path).unwrap();
        db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('assets','bars','coverage')",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(n, 3);
            Ok(())
        })
        .unwrap();
    }
}
