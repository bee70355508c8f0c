//! Record model behaviour seen from a producer's point of view.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use shared::{Candle, IndicatorPoint, IndicatorRecord, OhlcvRecord, Timeframe};

#[test]
fn candle_becomes_ohlcv_record() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
    let rec = OhlcvRecord::from_candle(
        7,
        Timeframe::M5,
        Candle { timestamp: ts, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10.0 },
    );

    assert_eq!(rec.symbol_id, 7);
    assert_eq!(rec.timeframe, Timeframe::M5);
    assert_eq!(rec.timestamp, ts);
    assert_eq!(rec.close, 1.5);
}

#[test]
fn ohlcv_key_ignores_prices() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
    let a = OhlcvRecord::from_candle(1, Timeframe::H1, Candle {
        timestamp: ts, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0,
    });
    let b = OhlcvRecord { close: 99.0, ..a.clone() };

    assert_eq!(a.key(), b.key());
}

#[test]
fn indicator_key_includes_name() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
    let rsi = IndicatorRecord::from_point(1, Timeframe::M1, IndicatorPoint {
        timestamp: ts, name: "RSI".into(), value: 55.0,
    });
    let sma = IndicatorRecord { indicator_name: "SMA_20".into(), ..rsi.clone() };
    let rsi_again = IndicatorRecord { indicator_value: 60.0, ..rsi.clone() };

    assert_ne!(rsi.key(), sma.key());
    assert_eq!(rsi.key(), rsi_again.key());
}

#[test]
fn timeframe_deserializes_from_storage_strings() {
    #[derive(Deserialize)]
    struct Row {
        timeframe: Timeframe,
    }

    let row: Row = toml::from_str(r#"timeframe = "4h""#).unwrap();
    assert_eq!(row.timeframe, Timeframe::H4);
    assert!(toml::from_str::<Row>(r#"timeframe = "4x""#).is_err());
}
