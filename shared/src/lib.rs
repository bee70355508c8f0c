//! Record model shared by market-data producers and the ingest engine.

pub mod constants;
pub mod records;
pub mod timeframe;

pub use records::{
    Candle, IndicatorKey, IndicatorPoint, IndicatorRecord, OhlcvKey, OhlcvRecord, Table,
    format_timestamp,
};
pub use timeframe::{ParseTimeframeError, Timeframe};
