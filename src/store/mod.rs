//! Persistent row store: embedded database, bar rows, coverage summaries

mod bars;
mod coverage;
mod db;

pub use bars::BarStore;
pub use coverage::{CoverageIndex, CoverageRecord};
pub use db::Db;
