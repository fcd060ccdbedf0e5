//! Historical engine: orchestration behind the per-fingerprint single-flight

mod gate;
mod historical;
mod singleflight;

pub use gate::UpstreamGate;
pub use historical::HistoricalEngine;
pub use singleflight::FlightTable;
