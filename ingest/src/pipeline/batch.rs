//! Batches in transit between accumulators and the writer.

use shared::{Candle, IndicatorPoint, IndicatorRecord, OhlcvRecord, Table, Timeframe};

/// An ordered run of same-kind records, written as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Ohlcv(Vec<OhlcvRecord>),
    Indicators(Vec<IndicatorRecord>),
}

impl Batch {
    pub fn table(&self) -> Table {
        match self {
            Batch::Ohlcv(_)      => Table::Ohlcv,
            Batch::Indicators(_) => Table::Indicators,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Ohlcv(rows)      => rows.len(),
            Batch::Indicators(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A record kind the engine can persist. The associated `TABLE` is what binds
/// an accumulator to exactly one target table.
pub trait Record: Send + Sized + 'static {
    /// Per-bar payload producers hand over alongside symbol and timeframe.
    type Point;

    const TABLE: Table;

    fn from_point(symbol_id: i64, timeframe: Timeframe, point: Self::Point) -> Self;

    fn into_batch(rows: Vec<Self>) -> Batch;
}

impl Record for OhlcvRecord {
    type Point = Candle;
    const TABLE: Table = Table::Ohlcv;

    fn from_point(symbol_id: i64, timeframe: Timeframe, point: Candle) -> Self {
        OhlcvRecord::from_candle(symbol_id, timeframe, point)
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Ohlcv(rows)
    }
}

impl Record for IndicatorRecord {
    type Point = IndicatorPoint;
    const TABLE: Table = Table::Indicators;

    fn from_point(symbol_id: i64, timeframe: Timeframe, point: IndicatorPoint) -> Self {
        IndicatorRecord::from_point(symbol_id, timeframe, point)
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Indicators(rows)
    }
}
