//! Candle intervals as they are written to the `timeframe` columns.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bar interval. The string form (`"1m"`, `"4h"`, `"1M"`, ...) is what gets
/// stored, so `Display` and `FromStr` must stay symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]  M1,
    #[serde(rename = "3m")]  M3,
    #[serde(rename = "5m")]  M5,
    #[serde(rename = "15m")] M15,
    #[serde(rename = "30m")] M30,
    #[serde(rename = "1h")]  H1,
    #[serde(rename = "2h")]  H2,
    #[serde(rename = "4h")]  H4,
    #[serde(rename = "6h")]  H6,
    #[serde(rename = "8h")]  H8,
    #[serde(rename = "12h")] H12,
    #[serde(rename = "1d")]  D1,
    #[serde(rename = "3d")]  D3,
    #[serde(rename = "1w")]  W1,
    #[serde(rename = "1M")]  Mo1,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown timeframe '{0}'")]
pub struct ParseTimeframeError(pub String);

impl Timeframe {
    pub const ALL: [Timeframe; 15] = [
        Timeframe::M1, Timeframe::M3, Timeframe::M5, Timeframe::M15, Timeframe::M30,
        Timeframe::H1, Timeframe::H2, Timeframe::H4, Timeframe::H6, Timeframe::H8,
        Timeframe::H12, Timeframe::D1, Timeframe::D3, Timeframe::W1, Timeframe::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1  => "1m",
            Timeframe::M3  => "3m",
            Timeframe::M5  => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1  => "1h",
            Timeframe::H2  => "2h",
            Timeframe::H4  => "4h",
            Timeframe::H6  => "6h",
            Timeframe::H8  => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1  => "1d",
            Timeframe::D3  => "3d",
            Timeframe::W1  => "1w",
            Timeframe::Mo1 => "1M",
        }
    }

    /// Nominal bar length in seconds (a month counts as 30 days).
    pub fn seconds(self) -> i64 {
        const MIN: i64 = 60;
        const HOUR: i64 = 60 * MIN;
        const DAY: i64 = 24 * HOUR;
        match self {
            Timeframe::M1  => MIN,
            Timeframe::M3  => 3 * MIN,
            Timeframe::M5  => 5 * MIN,
            Timeframe::M15 => 15 * MIN,
            Timeframe::M30 => 30 * MIN,
            Timeframe::H1  => HOUR,
            Timeframe::H2  => 2 * HOUR,
            Timeframe::H4  => 4 * HOUR,
            Timeframe::H6  => 6 * HOUR,
            Timeframe::H8  => 8 * HOUR,
            Timeframe::H12 => 12 * HOUR,
            Timeframe::D1  => DAY,
            Timeframe::D3  => 3 * DAY,
            Timeframe::W1  => 7 * DAY,
            Timeframe::Mo1 => 30 * DAY,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-sensitive: `"1m"` is a minute, `"1M"` a month.
impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| ParseTimeframeError(s.to_owned()))
    }
}
