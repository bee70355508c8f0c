//! Rows persisted by the ingest engine.
//!
//! Producers either build records directly or hand over the per-bar payload
//! (`Candle`, `IndicatorPoint`) together with the symbol and timeframe, which
//! is how fetch pipelines naturally emit them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{INDICATOR_TABLE, OHLCV_TABLE, SQL_TIMESTAMP_FORMAT};
use crate::timeframe::Timeframe;

/// Target table of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Ohlcv,
    Indicators,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Ohlcv      => OHLCV_TABLE,
            Table::Indicators => INDICATOR_TABLE,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage text for a `DATETIME` column.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(SQL_TIMESTAMP_FORMAT).to_string()
}

/// One OHLCV bar without its symbol/timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open:      f64,
    pub high:      f64,
    pub low:       f64,
    pub close:     f64,
    pub volume:    f64,
}

/// One indicator sample without its symbol/timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub timestamp: DateTime<Utc>,
    pub name:      String,
    pub value:     f64,
}

/// Row of `ohlcv_data`. Unique on `(symbol_id, timeframe, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRecord {
    pub symbol_id: i64,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open:      f64,
    pub high:      f64,
    pub low:       f64,
    pub close:     f64,
    pub volume:    f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OhlcvKey {
    pub symbol_id: i64,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
}

impl OhlcvRecord {
    pub fn from_candle(symbol_id: i64, timeframe: Timeframe, candle: Candle) -> Self {
        Self {
            symbol_id,
            timeframe,
            timestamp: candle.timestamp,
            open:      candle.open,
            high:      candle.high,
            low:       candle.low,
            close:     candle.close,
            volume:    candle.volume,
        }
    }

    pub fn key(&self) -> OhlcvKey {
        OhlcvKey {
            symbol_id: self.symbol_id,
            timeframe: self.timeframe,
            timestamp: self.timestamp,
        }
    }
}

/// Row of `technical_indicators`.
/// Unique on `(symbol_id, timeframe, timestamp, indicator_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub symbol_id:       i64,
    pub timeframe:       Timeframe,
    pub timestamp:       DateTime<Utc>,
    pub indicator_name:  String,
    pub indicator_value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndicatorKey {
    pub symbol_id:      i64,
    pub timeframe:      Timeframe,
    pub timestamp:      DateTime<Utc>,
    pub indicator_name: String,
}

impl IndicatorRecord {
    pub fn from_point(symbol_id: i64, timeframe: Timeframe, point: IndicatorPoint) -> Self {
        Self {
            symbol_id,
            timeframe,
            timestamp:       point.timestamp,
            indicator_name:  point.name,
            indicator_value: point.value,
        }
    }

    pub fn key(&self) -> IndicatorKey {
        IndicatorKey {
            symbol_id:      self.symbol_id,
            timeframe:      self.timeframe,
            timestamp:      self.timestamp,
            indicator_name: self.indicator_name.clone(),
        }
    }
}
