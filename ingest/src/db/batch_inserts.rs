// src/db/batch_inserts.rs

use rusqlite::{params, Connection, Result as SqlResult, Statement, TransactionBehavior};
use shared::{format_timestamp, IndicatorRecord, OhlcvRecord};

use crate::pipeline::Batch;

/// Defines how one record kind is upserted into its table.
pub trait BatchInsert: Sized {
    fn insert_sql() -> &'static str;
    fn bind_and_execute(stmt: &mut Statement<'_>, record: &Self) -> SqlResult<()>;
}

/// OHLCV EVENTS: first write wins, replays never overwrite a stored bar.
impl BatchInsert for OhlcvRecord {
    fn insert_sql() -> &'static str {
        "INSERT OR IGNORE INTO ohlcv_data \
           (symbol_id, timeframe, timestamp, open, high, low, close, volume) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"
    }

    fn bind_and_execute(stmt: &mut Statement<'_>, rec: &OhlcvRecord) -> SqlResult<()> {
        stmt.execute(params![
            rec.symbol_id,
            rec.timeframe.as_str(),
            format_timestamp(&rec.timestamp),
            rec.open,
            rec.high,
            rec.low,
            rec.close,
            rec.volume,
        ])?;
        Ok(())
    }
}

/// INDICATORS: last write wins, recomputed values replace stale ones.
impl BatchInsert for IndicatorRecord {
    fn insert_sql() -> &'static str {
        "INSERT OR REPLACE INTO technical_indicators \
           (symbol_id, timeframe, timestamp, indicator_name, indicator_value) \
         VALUES (?1,?2,?3,?4,?5)"
    }

    fn bind_and_execute(stmt: &mut Statement<'_>, rec: &IndicatorRecord) -> SqlResult<()> {
        stmt.execute(params![
            rec.symbol_id,
            rec.timeframe.as_str(),
            format_timestamp(&rec.timestamp),
            rec.indicator_name,
            rec.indicator_value,
        ])?;
        Ok(())
    }
}

/// Upsert `rows` in one IMMEDIATE transaction: all rows commit or none do.
/// A lock conflict surfaces at BEGIN, before any row is touched.
pub fn insert_rows<T: BatchInsert>(conn: &mut Connection, rows: &[T]) -> SqlResult<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    {
        let mut stmt = tx.prepare_cached(T::insert_sql())?;
        for rec in rows {
            T::bind_and_execute(&mut stmt, rec)?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

/// Dispatch a batch to the statement of its table.
pub fn write_batch(conn: &mut Connection, batch: &Batch) -> SqlResult<usize> {
    match batch {
        Batch::Ohlcv(rows)      => insert_rows(conn, rows),
        Batch::Indicators(rows) => insert_rows(conn, rows),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::Timeframe;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../../resources/schema.sql")).unwrap();
        conn
    }

    fn bar(close: f64) -> OhlcvRecord {
        OhlcvRecord {
            symbol_id: 1,
            timeframe: Timeframe::M1,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            open: 1.0, high: 2.0, low: 0.5, close, volume: 100.0,
        }
    }

    fn rsi(value: f64) -> IndicatorRecord {
        IndicatorRecord {
            symbol_id: 1,
            timeframe: Timeframe::M1,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            indicator_name: "RSI".into(),
            indicator_value: value,
        }
    }

    #[test]
    fn ohlcv_keeps_first_write() {
        let mut conn = memory_db();
        insert_rows(&mut conn, &[bar(1.5)]).unwrap();
        insert_rows(&mut conn, &[bar(9.9)]).unwrap();

        let (n, close): (i64, f64) = conn
            .query_row("SELECT COUNT(*), MAX(close) FROM ohlcv_data", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(close, 1.5);
    }

    #[test]
    fn indicators_keep_last_write() {
        let mut conn = memory_db();
        write_batch(&mut conn, &Batch::Indicators(vec![rsi(55.0), rsi(60.0)])).unwrap();

        let (n, v): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(indicator_value) FROM technical_indicators",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(v, 60.0);
    }

    #[test]
    fn columns_are_stored_in_table_layout() {
        let mut conn = memory_db();
        write_batch(&mut conn, &Batch::Ohlcv(vec![bar(1.5)])).unwrap();

        let (tf, ts): (String, String) = conn
            .query_row("SELECT timeframe, timestamp FROM ohlcv_data", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(tf, "1m");
        assert_eq!(ts, "2024-05-01 00:00:00");
    }

    #[test]
    fn failing_row_rolls_back_whole_batch() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE technical_indicators (
                symbol_id INTEGER, timeframe TEXT NOT NULL, timestamp DATETIME,
                indicator_name TEXT NOT NULL,
                indicator_value REAL CHECK (indicator_value >= 0),
                UNIQUE (symbol_id, timeframe, timestamp, indicator_name));",
        )
        .unwrap();

        let mut bad = rsi(-1.0);
        bad.indicator_name = "MACD".into();
        let mut ok_after = rsi(3.0);
        ok_after.indicator_name = "ATR".into();

        let res = insert_rows(&mut conn, &[rsi(50.0), bad, ok_after]);
        assert!(res.is_err());

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM technical_indicators", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
