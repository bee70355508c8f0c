pub const OHLCV_TABLE: &str = "ohlcv_data";
pub const INDICATOR_TABLE: &str = "technical_indicators";

/// Rows per batch before an accumulator hands it to the writer.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;
/// Cumulative rows between two throughput log lines.
pub const DEFAULT_REPORT_EVERY_ROWS: u64 = 100_000;

/// Text layout of `DATETIME` columns; fractional seconds only when non-zero.
pub const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
