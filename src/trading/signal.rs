//! Entry signals computed from closed bars.

use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::Statistics;

use crate::models::Bar;

/// Band-crossing signal on the newest bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Close broke above the upper band: sell
    Top,
    /// Close broke below the lower band: buy
    Bottom,
    None,
}

/// Source of entry signals. `bars` are closed bars, oldest first; the last one is evaluated.
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Bars needed before a signal can fire.
    fn min_bars(&self) -> usize;

    fn evaluate(&self, symbol: &str, bars: &[Bar]) -> Signal;
}

/// Bollinger-band mean reversion.
#[derive(Debug, Clone)]
pub struct MeanReversion {
    window: usize,
    num_std: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self {
            window: 20,
            num_std: 2.0,
        }
    }
}

impl MeanReversion {
    /// (lower, upper) bands over the `window` closes ending at `end` inclusive.
    fn bands(&self, closes: &[f64], end: usize) -> (f64, f64) {
        let slice = &closes[end + 1 - self.window..=end];
        let mean = slice.iter().mean();
        let std_dev = slice.iter().std_dev();
        (mean - self.num_std * std_dev, mean + self.num_std * std_dev)
    }
}

impl SignalSource for MeanReversion {
    fn name(&self) -> &str {
        "MEAN REVERSION"
    }

    fn min_bars(&self) -> usize {
        self.window + 1
    }

    fn evaluate(&self, symbol: &str, bars: &[Bar]) -> Signal {
        if bars.len() < self.min_bars() {
            tracing::debug!(symbol, bars = bars.len(), needed = self.min_bars(), "Not enough bars for bands");
            return Signal::None;
        }

        let closes: Vec<f64> = bars.iter().filter_map(|b| b.close.to_f64()).collect();
        if closes.len() != bars.len() {
            return Signal::None;
        }

        let last = closes.len() - 1;
        let (lower, upper) = self.bands(&closes, last);
        let (prev_lower, prev_upper) = self.bands(&closes, last - 1);
        let (close, prev_close) = (closes[last], closes[last - 1]);

        if prev_close <= prev_upper && close > upper {
            Signal::Top
        } else if prev_close >= prev_lower && close < lower {
            Signal::Bottom
        } else {
            Signal::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let close = Decimal::try_from(c).unwrap();
                Bar {
                    time: start + Duration::minutes(15 * i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: Decimal::ZERO,
                }
            })
            .collect()
    }

    /// Small zig-zag around 1.10 so the bands have width.
    fn flat(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| if i % 2 == 0 { 1.1000 } else { 1.1010 })
            .collect()
    }

    #[test]
    fn test_spike_up_is_top() {
        let mut closes = flat(25);
        closes.push(1.1200);
        assert_eq!(MeanReversion::default().evaluate("EURUSD", &bars(&closes)), Signal::Top);
    }

    #[test]
    fn test_spike_down_is_bottom() {
        let mut closes = flat(25);
        closes.push(1.0800);
        assert_eq!(MeanReversion::default().evaluate("EURUSD", &bars(&closes)), Signal::Bottom);
    }

    #[test]
    fn test_no_crossing() {
        let closes = flat(30);
        assert_eq!(MeanReversion::default().evaluate("EURUSD", &bars(&closes)), Signal::None);
    }

    #[test]
    fn test_already_outside_is_not_a_crossing() {
        let mut closes = flat(25);
        closes.push(1.1200);
        closes.push(1.1300);
        // The previous bar was already above its upper band
        assert_eq!(MeanReversion::default().evaluate("EURUSD", &bars(&closes)), Signal::None);
    }

    #[test]
    fn test_too_few_bars() {
        let mut closes = flat(10);
        closes.push(1.2000);
        assert_eq!(MeanReversion::default().evaluate("EURUSD", &bars(&closes)), Signal::None);
    }
}
