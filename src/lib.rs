//! # QuantDB
//!
//! A caching layer between application code and an upstream Chinese equities
//! data provider. A historical read that would cost a network round trip is
//! answered from a local, trading-calendar-aware store; the engine fetches
//! only the sub-windows that are genuinely missing and guarantees the caller
//! a contiguous series for the requested window.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quantdb::prelude::*;
//!
//! fn main() -> quantdb::error::Result<()> {
//!     let db = QuantDb::builder()
//!         .cache_dir("/tmp/quantdb-demo")
//!         .open()?;
//!
//!     // Cold read fetches upstream; the warm repeat is served locally.
//!     let bars = db.get_history(&HistoryRequest::range("600000", "20240102", "20240112"))?;
//!     println!("{} bars, hit ratio {:.2}", bars.len(), db.cache_stats().counters.hit_ratio());
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod fetch;
pub mod gap;
pub mod metrics;
pub mod request;
pub mod store;
pub mod ttl;
pub mod types;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::config::CacheConfig;
    pub use crate::error::{ErrorKind, QdbError, Result};
    pub use crate::facade::{CacheStats, HistoryRequest, QuantDb};
    pub use crate::fetch::{ScriptedFetcher, UpstreamFetcher};
    pub use crate::request::{CancelToken, RequestCtx};
    pub use crate::types::{AdjustMode, Asset, Bar, Market, Period, Quote};
}

pub use facade::{HistoryRequest, QuantDb};
