use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

const WINDOW_DAYS: i64 = 30;
const MIN_OBSERVATIONS: usize = 14;

/// A small rolling per-symbol close-price time series, kept to a 30-day
/// window, used only by the Arbiter's correlation gate. Per spec.md §9:
/// "treat this as a small rolling time-series the Runtime maintains from
/// market snapshots; if data is insufficient (< 14 days), treat correlation
/// as unknown and skip the gate."
#[derive(Debug, Default)]
pub struct PriceHistory {
    series: HashMap<String, Vec<(DateTime<Utc>, Decimal)>>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, symbol: &str, at: DateTime<Utc>, price: Decimal) {
        let entries = self.series.entry(symbol.to_string()).or_default();
        entries.push((at, price));
        let cutoff = at - Duration::days(WINDOW_DAYS);
        entries.retain(|(t, _)| *t >= cutoff);
    }

    fn daily_returns(&self, symbol: &str) -> Option<Vec<f64>> {
        let entries = self.series.get(symbol)?;
        if entries.len() < MIN_OBSERVATIONS + 1 {
            return None;
        }
        Some(
            entries
                .windows(2)
                .map(|w| {
                    let (_, p0) = w[0];
                    let (_, p1) = w[1];
                    if p0.is_zero() {
                        0.0
                    } else {
                        ((p1 - p0) / p0).to_f64().unwrap_or(0.0)
                    }
                })
                .collect(),
        )
    }

    fn pearson(a: &[f64], b: &[f64]) -> f64 {
        let n = a.len() as f64;
        let mean_a = a.iter().sum::<f64>() / n;
        let mean_b = b.iter().sum::<f64>() / n;
        let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
        for i in 0..a.len() {
            let da = a[i] - mean_a;
            let db = b[i] - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }
        if var_a == 0.0 || var_b == 0.0 {
            return 0.0;
        }
        cov / (var_a.sqrt() * var_b.sqrt())
    }

    /// Counts other symbols with sufficient joint history whose pairwise
    /// 30-day return correlation with `symbol` exceeds `threshold`. Returns
    /// `None` if `symbol` itself lacks the minimum 14 days of history — the
    /// caller's cue to skip the gate rather than fail closed or open.
    pub fn count_correlated_above(&self, symbol: &str, threshold: Decimal) -> Option<usize> {
        let target = self.daily_returns(symbol)?;
        let threshold = threshold.to_f64().unwrap_or(0.70);

        let count = self
            .series
            .keys()
            .filter(|other| other.as_str() != symbol)
            .filter_map(|other| self.daily_returns(other).map(|r| (r)))
            .filter(|other_returns| {
                let n = target.len().min(other_returns.len());
                n >= MIN_OBSERVATIONS
                    && Self::pearson(&target[target.len() - n..], &other_returns[other_returns.len() - n..]).abs()
                        > threshold
            })
            .count();

        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(n: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc) + Duration::days(n)
    }

    #[test]
    fn insufficient_history_skips_the_gate() {
        let mut history = PriceHistory::new();
        for i in 0..5 {
            history.push("BTC/USDT", day(i), dec!(20000));
        }
        assert_eq!(history.count_correlated_above("BTC/USDT", dec!(0.70)), None);
    }

    #[test]
    fn perfectly_correlated_symbols_are_counted() {
        let mut history = PriceHistory::new();
        for i in 0..20 {
            let price = dec!(20000) + Decimal::from(i * 10);
            history.push("BTC/USDT", day(i), price);
            history.push("ETH-CLONE/USDT", day(i), price);
        }
        assert_eq!(history.count_correlated_above("BTC/USDT", dec!(0.70)), Some(1));
    }
}
