// src/load.rs
//! Synthetic load driver.
//!
//! Each producer thread owns a disjoint range of symbol ids, generates a
//! deterministic candle walk per symbol and feeds both the candles and a
//! simple moving average into the engine through its own accumulators.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection};
use shared::{Candle, IndicatorPoint, IndicatorRecord, OhlcvRecord, Timeframe};

use crate::config::LoadConfig;
use crate::db::Connector;
use crate::pipeline::{IngestEngine, IngestError};

/// First bar of every generated series: 2024-01-01T00:00:00Z.
const SERIES_START_SECS: i64 = 1_704_067_200;

/// Totals accepted by the engine during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSummary {
    pub producers:  usize,
    pub candles:    u64,
    pub indicators: u64,
    pub elapsed:    Duration,
}

impl LoadSummary {
    pub fn rows(&self) -> u64 {
        self.candles + self.indicators
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.rows() as f64 / secs } else { 0.0 }
    }
}

/// Register a `SYNTH` market and symbols `SYM1..=SYM<count>`. Existing rows
/// are left alone.
pub fn seed_symbols(conn: &mut Connection, count: usize) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("INSERT OR IGNORE INTO market (market_name) VALUES ('SYNTH')", [])?;
    let market_id: i64 =
        tx.query_row("SELECT market_id FROM market WHERE market_name = 'SYNTH'", [], |r| r.get(0))?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO symbols (symbol_id, symbol, market_id) VALUES (?1, ?2, ?3)",
        )?;
        for id in 1..=count as i64 {
            stmt.execute(params![id, format!("SYM{id}"), market_id])?;
        }
    }
    tx.commit()
}

/// Open time of bar `index` in every generated series.
pub fn bar_timestamp(timeframe: Timeframe, index: usize) -> DateTime<Utc> {
    let offset = timeframe.seconds().saturating_mul(index as i64);
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(SERIES_START_SECS.saturating_add(offset))
}

/// Deterministic price walk for `symbol_id`, one candle per `timeframe` step.
pub fn candle_walk(symbol_id: i64, timeframe: Timeframe, count: usize) -> Vec<Candle> {
    let base = 50.0 + (symbol_id % 50) as f64 * 10.0;
    let mut close = base;

    (0..count)
        .map(|i| {
            let x = i as f64 + symbol_id as f64 * 0.37;
            let open = close;
            close = (base + (x * 0.05).sin() * base * 0.1 + (x * 0.013).cos()).max(0.01);
            let swing = (x * 0.7).sin().abs() * base * 0.005;
            Candle {
                timestamp: bar_timestamp(timeframe, i),
                open,
                high: open.max(close) + swing,
                low: (open.min(close) - swing).max(0.0),
                close,
                volume: 1_000.0 + (x * 0.3).cos().abs() * 500.0,
            }
        })
        .collect()
}

/// `SMA_<window>` over closes; the first value is emitted once the window is
/// full.
pub fn sma(candles: &[Candle], window: usize) -> Vec<IndicatorPoint> {
    if window == 0 || candles.len() < window {
        return Vec::new();
    }
    let name = format!("SMA_{window}");
    let mut sum: f64 = candles[..window].iter().map(|c| c.close).sum();
    let mut out = Vec::with_capacity(candles.len() - window + 1);
    out.push(IndicatorPoint {
        timestamp: candles[window - 1].timestamp,
        name: name.clone(),
        value: sum / window as f64,
    });
    for i in window..candles.len() {
        sum += candles[i].close - candles[i - window].close;
        out.push(IndicatorPoint {
            timestamp: candles[i].timestamp,
            name: name.clone(),
            value: sum / window as f64,
        });
    }
    out
}

/// Run `cfg.producers` producer threads against a started engine. Returns
/// once every producer has handed its rows over and flushed; persistence is
/// only complete after the engine stops.
pub fn run<C: Connector>(engine: &IngestEngine<C>, cfg: &LoadConfig) -> Result<LoadSummary, IngestError> {
    let started = Instant::now();
    log::info!(
        "load: {} producers x {} symbols x {} rows ({})",
        cfg.producers,
        cfg.symbols_per_producer,
        cfg.rows_per_symbol,
        cfg.timeframe
    );

    let totals = thread::scope(|s| {
        let handles: Vec<_> = (0..cfg.producers)
            .map(|p| s.spawn(move || produce(engine, cfg, p)))
            .collect();

        let mut totals = (0u64, 0u64);
        for h in handles {
            let (candles, indicators) = h
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
            totals.0 += candles;
            totals.1 += indicators;
        }
        Ok::<_, IngestError>(totals)
    })?;

    let summary = LoadSummary {
        producers:  cfg.producers,
        candles:    totals.0,
        indicators: totals.1,
        elapsed:    started.elapsed(),
    };
    log::info!(
        "load: {} rows handed over in {:.2} seconds ({:.0} rows/s)",
        summary.rows(),
        summary.elapsed.as_secs_f64(),
        summary.rows_per_second()
    );
    Ok(summary)
}

fn produce<C: Connector>(
    engine: &IngestEngine<C>,
    cfg: &LoadConfig,
    producer: usize,
) -> Result<(u64, u64), IngestError> {
    let ohlcv = engine.accumulator::<OhlcvRecord>();
    let indicators = engine.accumulator::<IndicatorRecord>();
    let mut totals = (0u64, 0u64);

    for n in 0..cfg.symbols_per_producer {
        let symbol_id = (producer * cfg.symbols_per_producer + n + 1) as i64;
        let candles = candle_walk(symbol_id, cfg.timeframe, cfg.rows_per_symbol);
        let points = sma(&candles, cfg.sma_window);

        totals.1 += indicators.enqueue_sequence(symbol_id, cfg.timeframe, points)? as u64;
        totals.0 += ohlcv.enqueue_sequence(symbol_id, cfg.timeframe, candles)? as u64;
    }

    ohlcv.flush()?;
    indicators.flush()?;
    log::debug!("producer {} done: {} candles, {} indicator values", producer, totals.0, totals.1);
    Ok(totals)
}
