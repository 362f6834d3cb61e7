//! Strategy configuration.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::models::{InstrumentClass, Timeframe};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("trailing-stop ladder is empty")]
    EmptyLadder,

    #[error("ladder step {index} is invalid: trigger {trigger}, new stop {new_sl}")]
    InvalidLadderStep {
        index: usize,
        trigger: Decimal,
        new_sl: Decimal,
    },

    #[error("no symbols configured")]
    NoSymbols,

    #[error("symbol {0} has no commission class")]
    UnknownSymbol(String),

    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: Decimal,
    },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// One rung of the trailing-stop ladder, both values as multiples of capital.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderStep {
    /// Unrealized profit, in multiples of capital, that arms this step
    pub trigger: Decimal,
    /// Profit locked in by the new stop, in multiples of capital
    pub new_sl: Decimal,
}

impl LadderStep {
    pub const fn new(trigger: Decimal, new_sl: Decimal) -> Self {
        Self { trigger, new_sl }
    }
}

pub fn default_ladder() -> Vec<LadderStep> {
    vec![
        LadderStep::new(dec!(4.00), dec!(3.50)),
        LadderStep::new(dec!(3.50), dec!(3.00)),
        LadderStep::new(dec!(3.00), dec!(2.75)),
        LadderStep::new(dec!(2.75), dec!(2.50)),
        LadderStep::new(dec!(2.50), dec!(2.25)),
        LadderStep::new(dec!(2.25), dec!(2.00)),
        LadderStep::new(dec!(2.00), dec!(1.75)),
        LadderStep::new(dec!(1.75), dec!(1.50)),
        LadderStep::new(dec!(1.50), dec!(1.25)),
        LadderStep::new(dec!(1.25), dec!(1.00)),
        LadderStep::new(dec!(1.00), dec!(0.75)),
        LadderStep::new(dec!(0.75), dec!(0.45)),
        LadderStep::new(dec!(0.50), dec!(0.22)),
        LadderStep::new(dec!(0.25), dec!(0.12)),
        LadderStep::new(dec!(0.12), dec!(0.05)),
        LadderStep::new(dec!(0.06), dec!(0.025)),
    ]
}

/// Parameters of the mean-reversion strategy and its scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Symbols scanned for entries
    pub pairs: Vec<String>,

    pub timeframe: Timeframe,

    /// Bars fetched per signal evaluation
    pub bars: usize,

    /// Cash committed per trade, before leverage
    pub capital_per_trade: Decimal,

    pub leverage: Decimal,

    /// Initial stop as a multiple of capital (negative)
    pub sl_multiplier: Decimal,

    /// Take-profit as a multiple of capital, disabled when `None`
    pub tp_multiplier: Option<Decimal>,

    /// Max slippage in points
    pub deviation: u32,

    pub magic: u64,
    pub order_comment: String,

    /// Minimum stop improvement before a ratchet is sent
    pub epsilon: Decimal,

    /// Evaluated in declared order, first match wins
    pub ladder: Vec<LadderStep>,

    /// Wait before reading deal history of a closed position
    pub settlement_delay_secs: u64,

    /// Quotes older than this mark a non-crypto market as closed
    pub max_tick_age_secs: i64,

    pub reconcile_interval_secs: u64,
    pub trailing_interval_secs: u64,
    pub entry_interval_secs: u64,
    pub cycle_timeout_secs: u64,

    /// Ledger tags
    pub strategy_name: String,
    pub broker_name: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            pairs: [
                "NG", "BRN", "WTI", "XAGUSD", "XAUUSD", "XAUEUR", "EURUSD", "EURGBP", "USDJPY",
                "USDCAD", "USDCHF", "AUDUSD", "NZDUSD",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeframe: Timeframe::M15,
            bars: 50,
            capital_per_trade: dec!(100),
            leverage: dec!(200),
            sl_multiplier: dec!(-0.5),
            tp_multiplier: None,
            deviation: 20,
            magic: 234000,
            order_comment: "mean-reversion".to_string(),
            epsilon: dec!(0.0001),
            ladder: default_ladder(),
            settlement_delay_secs: 2,
            max_tick_age_secs: 300,
            reconcile_interval_secs: 10,
            trailing_interval_secs: 10,
            entry_interval_secs: 60,
            cycle_timeout_secs: 30,
            strategy_name: "MEAN REVERSION".to_string(),
            broker_name: "Alpari".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

impl StrategyConfig {
    /// Defaults overridden by `MR_*` and `SETTLEMENT_DELAY_SECS` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("MR_PAIRS") {
            config.pairs = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("MR_TIMEFRAME") {
            config.timeframe = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var: "MR_TIMEFRAME", value: v })?;
        }
        if let Some(v) = lookup("MR_BARS") {
            config.bars = parse_var("MR_BARS", v)?;
        }
        if let Some(v) = lookup("MR_CAPITAL_PER_TRADE") {
            config.capital_per_trade = parse_var("MR_CAPITAL_PER_TRADE", v)?;
        }
        if let Some(v) = lookup("MR_LEVERAGE") {
            config.leverage = parse_var("MR_LEVERAGE", v)?;
        }
        if let Some(v) = lookup("MR_SL_MULTIPLIER") {
            config.sl_multiplier = parse_var("MR_SL_MULTIPLIER", v)?;
        }
        if let Some(v) = lookup("MR_TP_MULTIPLIER") {
            config.tp_multiplier = Some(parse_var("MR_TP_MULTIPLIER", v)?);
        }
        if let Some(v) = lookup("MR_EPSILON") {
            config.epsilon = parse_var("MR_EPSILON", v)?;
        }
        if let Some(v) = lookup("SETTLEMENT_DELAY_SECS") {
            config.settlement_delay_secs = parse_var("SETTLEMENT_DELAY_SECS", v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engines cannot run with.
    ///
    /// A ladder whose triggers are not descending is accepted with a warning,
    /// since first-match evaluation may then skip higher steps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ladder.is_empty() {
            return Err(ConfigError::EmptyLadder);
        }
        for (index, step) in self.ladder.iter().enumerate() {
            if step.trigger <= Decimal::ZERO || step.new_sl >= step.trigger {
                return Err(ConfigError::InvalidLadderStep {
                    index,
                    trigger: step.trigger,
                    new_sl: step.new_sl,
                });
            }
        }

        if self.pairs.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if let Some(unknown) = self.pairs.iter().find(|s| InstrumentClass::of(s).is_none()) {
            return Err(ConfigError::UnknownSymbol(unknown.clone()));
        }

        if self.capital_per_trade <= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                name: "capital per trade",
                expected: "positive",
                value: self.capital_per_trade,
            });
        }
        if self.leverage <= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                name: "leverage",
                expected: "positive",
                value: self.leverage,
            });
        }
        if self.sl_multiplier >= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                name: "stop-loss multiplier",
                expected: "negative",
                value: self.sl_multiplier,
            });
        }
        if let Some(tp) = self.tp_multiplier {
            if tp <= Decimal::ZERO {
                return Err(ConfigError::OutOfRange {
                    name: "take-profit multiplier",
                    expected: "positive",
                    value: tp,
                });
            }
        }
        if self.epsilon < Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                name: "epsilon",
                expected: "non-negative",
                value: self.epsilon,
            });
        }

        if !self.ladder_is_descending() {
            warn!("Trailing-stop ladder triggers are not in descending order; first match wins as declared");
        }

        Ok(())
    }

    pub fn ladder_is_descending(&self) -> bool {
        self.ladder.windows(2).all(|w| w[0].trigger > w[1].trigger)
    }

    pub fn settlement_delay(&self) -> Duration {
        Duration::from_secs(self.settlement_delay_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        let config = StrategyConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.ladder_is_descending());
        assert_eq!(config.ladder.len(), 16);
        assert_eq!(config.tp_multiplier, None);
    }

    #[test]
    fn test_env_overrides() {
        let config = StrategyConfig::from_lookup(lookup(&[
            ("MR_PAIRS", "eurusd, BITCOIN"),
            ("MR_TIMEFRAME", "1H"),
            ("MR_LEVERAGE", "100"),
            ("SETTLEMENT_DELAY_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.pairs, vec!["EURUSD", "BITCOIN"]);
        assert_eq!(config.timeframe, Timeframe::H1);
        assert_eq!(config.leverage, dec!(100));
        assert_eq!(config.settlement_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_env_value() {
        let err = StrategyConfig::from_lookup(lookup(&[("MR_LEVERAGE", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "MR_LEVERAGE",
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_ladder_rejected() {
        let mut config = StrategyConfig::default();
        config.ladder.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyLadder));

        config.ladder = vec![LadderStep::new(dec!(1.0), dec!(1.0))];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLadderStep { index: 0, .. })
        ));
    }

    #[test]
    fn test_unsorted_ladder_only_warns() {
        let mut config = StrategyConfig::default();
        config.ladder = vec![
            LadderStep::new(dec!(0.5), dec!(0.2)),
            LadderStep::new(dec!(1.0), dec!(0.75)),
        ];
        assert!(!config.ladder_is_descending());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_symbol_rejected() {
        let err = StrategyConfig::from_lookup(lookup(&[("MR_PAIRS", "EURUSD,TSLA")])).unwrap_err();
        assert_eq!(err, ConfigError::UnknownSymbol("TSLA".to_string()));
    }

    #[test]
    fn test_positive_stop_multiplier_rejected() {
        let mut config = StrategyConfig::default();
        config.sl_multiplier = dec!(0.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { name: "stop-loss multiplier", .. })
        ));
    }
}
