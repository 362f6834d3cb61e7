//! Market data models: quotes, instrument specs and OHLC bars.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bar timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Timeframe {
    M1,
    M5,
    #[default]
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Name understood by the MT5 bridge (`M15`, `H1`, ...).
    pub fn as_broker_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    /// Tag stored in the ledger (`15M`, `1H`, ...).
    pub fn as_ledger_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1M",
            Timeframe::M5 => "5M",
            Timeframe::M15 => "15M",
            Timeframe::M30 => "30M",
            Timeframe::H1 => "1H",
            Timeframe::H4 => "4H",
            Timeframe::D1 => "1D",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    /// Accepts both the broker and the ledger spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "M1" | "1M" => Ok(Timeframe::M1),
            "M5" | "5M" => Ok(Timeframe::M5),
            "M15" | "15M" => Ok(Timeframe::M15),
            "M30" | "30M" => Ok(Timeframe::M30),
            "H1" | "1H" => Ok(Timeframe::H1),
            "H4" | "4H" => Ok(Timeframe::H4),
            "D1" | "1D" => Ok(Timeframe::D1),
            other => anyhow::bail!("Unknown timeframe: {}", other),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_broker_str())
    }
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Tick {
    /// Whether the quote was refreshed within `max_age` of `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.time <= max_age
    }
}

/// Contract specification of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,

    /// Units of the base asset per lot
    pub contract_size: Decimal,

    /// Smallest volume increment, in lots
    pub volume_step: Decimal,

    /// Smallest tradeable volume, in lots
    pub volume_min: Decimal,

    /// Price precision
    pub digits: u32,
}

/// One OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timeframe_spellings() {
        assert_eq!("M15".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!("15M".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!("h4".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("W1".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::M15.as_ledger_str(), "15M");
        assert_eq!(Timeframe::H1.as_broker_str(), "H1");
    }

    #[test]
    fn test_tick_freshness() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let tick = Tick {
            time: now - Duration::minutes(5),
            bid: dec!(1.1),
            ask: dec!(1.1002),
        };

        assert!(tick.is_fresh(now, Duration::minutes(5)));
        assert!(!tick.is_fresh(now + Duration::seconds(1), Duration::minutes(5)));
    }
}
