use std::collections::HashMap;

use chrono::{DateTime, Utc};
use core_types::{EngineOwner, OrderSide, Position, PositionSide};
use rust_decimal::Decimal;

use crate::error::ExecutorError;

/// The outcome of applying one fill to the book, used by the caller to decide
/// which `events::EngineEvent` to emit and what to pass to
/// `StateStore::record_fill_and_position`.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    /// A brand new position was opened.
    Opened(Position),
    /// An existing position in the same direction grew.
    Increased(Position),
    /// An existing opposite-direction position shrank but did not close.
    Reduced(Position),
    /// An existing opposite-direction position closed. Carries the realized
    /// P&L in the symbol's quote asset.
    Closed { realized_pnl: Decimal },
}

/// In-memory, read-mostly cache of open positions keyed by `(symbol, owner,
/// side)`, matching spec.md §3's "at most one Position per (owner, side)"
/// invariant. `StateStore` is the durable source of truth; this book is
/// rebuilt from it (plus the venue snapshot) at startup and kept in sync fill
/// by fill.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    positions: HashMap<(String, EngineOwner, PositionSide), Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positions(positions: Vec<Position>) -> Self {
        let mut book = Self::new();
        for p in positions {
            book.positions.insert((p.symbol.clone(), p.owner, p.side), p);
        }
        book
    }

    pub fn get(&self, symbol: &str, owner: EngineOwner, side: PositionSide) -> Option<&Position> {
        self.positions.get(&(symbol.to_string(), owner, side))
    }

    pub fn all(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn for_owner(&self, owner: EngineOwner) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(move |p| p.owner == owner)
    }

    /// Applies a fill of `side`/`qty`@`price` by `owner` on `symbol`.
    ///
    /// A fill whose `OrderSide` matches an existing position's natural
    /// direction grows it (average-entry-price recompute, generalizing the
    /// teacher's `Portfolio::update_with_execution`); a fill in the opposite
    /// direction of an existing position reduces or closes it; otherwise a
    /// new position is opened.
    pub fn apply_fill(
        &mut self,
        owner: EngineOwner,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<FillOutcome, ExecutorError> {
        let natural_side = PositionSide::from_order_side(side);
        let same_key = (symbol.to_string(), owner, natural_side);
        let opposite_key = (symbol.to_string(), owner, natural_side.opposite());

        if let Some(existing) = self.positions.get(&opposite_key) {
            if qty > existing.size {
                return Err(ExecutorError::InvalidClosingQuantity {
                    requested: qty.to_string(),
                    available: existing.size.to_string(),
                });
            }

            let remaining = existing.size - qty;
            let entry_price = existing.avg_entry_price;

            if remaining.is_zero() {
                self.positions.remove(&opposite_key);
                let realized_pnl = match existing.side {
                    PositionSide::Long => (price - entry_price) * qty,
                    PositionSide::Short => (entry_price - price) * qty,
                };
                return Ok(FillOutcome::Closed { realized_pnl });
            }

            let position = self.positions.get_mut(&opposite_key).expect("checked above");
            position.size = remaining;
            position.last_updated = at;
            return Ok(FillOutcome::Reduced(position.clone()));
        }

        let is_new = !self.positions.contains_key(&same_key);
        let position = self.positions.entry(same_key).or_insert_with(|| Position {
            symbol: symbol.to_string(),
            side: natural_side,
            owner,
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            last_updated: at,
        });

        let existing_value = position.avg_entry_price * position.size;
        let new_value = price * qty;
        let total_qty = position.size + qty;
        if !total_qty.is_zero() {
            position.avg_entry_price = (existing_value + new_value) / total_qty;
        }
        position.size = total_qty;
        position.last_updated = at;

        Ok(if is_new {
            FillOutcome::Opened(position.clone())
        } else {
            FillOutcome::Increased(position.clone())
        })
    }

    /// Replaces the book's contents wholesale. Used by the reconciler at
    /// startup and on the periodic sweep.
    pub fn replace_all(&mut self, positions: Vec<Position>) {
        self.positions = positions
            .into_iter()
            .map(|p| ((p.symbol.clone(), p.owner, p.side), p))
            .collect();
    }

    pub fn insert(&mut self, position: Position) {
        self.positions
            .insert((position.symbol.clone(), position.owner, position.side), position);
    }

    pub fn remove(&mut self, symbol: &str, owner: EngineOwner, side: PositionSide) {
        self.positions.remove(&(symbol.to_string(), owner, side));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn opens_then_grows_a_position() {
        let mut book = PositionBook::new();
        let outcome = book
            .apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Buy, dec!(1), dec!(20000), now())
            .unwrap();
        assert!(matches!(outcome, FillOutcome::Opened(_)));

        let outcome = book
            .apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Buy, dec!(1), dec!(22000), now())
            .unwrap();
        match outcome {
            FillOutcome::Increased(p) => {
                assert_eq!(p.size, dec!(2));
                assert_eq!(p.avg_entry_price, dec!(21000));
            }
            other => panic!("expected Increased, got {other:?}"),
        }
    }

    #[test]
    fn opposite_side_fill_reduces_then_closes() {
        let mut book = PositionBook::new();
        book.apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Buy, dec!(2), dec!(20000), now())
            .unwrap();

        let outcome = book
            .apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Sell, dec!(1), dec!(21000), now())
            .unwrap();
        assert!(matches!(outcome, FillOutcome::Reduced(_)));

        let outcome = book
            .apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Sell, dec!(1), dec!(23000), now())
            .unwrap();
        match outcome {
            FillOutcome::Closed { realized_pnl } => assert_eq!(realized_pnl, dec!(3000)),
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(book.get("BTC/USDT", EngineOwner::Trend, PositionSide::Long).is_none());
    }

    #[test]
    fn overclosing_is_rejected() {
        let mut book = PositionBook::new();
        book.apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Buy, dec!(1), dec!(20000), now())
            .unwrap();
        let err = book
            .apply_fill(EngineOwner::Trend, "BTC/USDT", OrderSide::Sell, dec!(2), dec!(20000), now())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidClosingQuantity { .. }));
    }
}
