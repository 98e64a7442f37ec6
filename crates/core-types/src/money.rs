use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Storage precision mandated by the money model: 8 fractional digits.
pub const STORAGE_SCALE: u32 = 8;

/// Dust floor, in USD notional. Positions below this are ignored for sync,
/// sizing, and rebalancing.
pub const DUST_THRESHOLD_USD: Decimal = Decimal::from_parts(100, 0, 0, false, 2);

/// A bare asset tag (`USDT`, `BTC`, …). Compared by value, interned nowhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset(String);

impl Asset {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self(ticker.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Asset {
    fn from(s: &str) -> Self {
        Asset::new(s)
    }
}

/// Signed decimal value tagged with the asset it is denominated in. Mixing
/// tags in arithmetic fails with `CoreError::UnitMismatch` rather than
/// silently coercing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
}

// `Money` itself is untagged in storage (sqlx has no natural tagged-decimal
// column); the asset tag travels alongside it on the owning struct field
// (e.g. `Position::symbol`'s quote asset, `Portfolio`'s implicit USD tag).
// `TaggedMoney` below is the checked-arithmetic wrapper used at call sites
// where two amounts of possibly different assets meet.
impl Money {
    pub fn zero() -> Self {
        Self {
            amount: Decimal::ZERO.round_dp(STORAGE_SCALE),
        }
    }

    pub fn new(amount: Decimal) -> Self {
        Self {
            amount: amount.round_dp_with_strategy(
                STORAGE_SCALE,
                rust_decimal::RoundingStrategy::MidpointNearestEven,
            ),
        }
    }

    /// The only sanctioned float/string→decimal boundary crossing. Used
    /// exclusively inside venue response deserializers.
    pub fn decimal_from_str(raw: &str) -> Result<Self, CoreError> {
        let parsed = Decimal::from_str(raw)
            .map_err(|e| CoreError::BadDecimal(raw.to_string(), e.to_string()))?;
        Ok(Self::new(parsed))
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn is_dust(&self) -> bool {
        self.amount.abs() < DUST_THRESHOLD_USD
    }

    pub fn checked_add(&self, other: &Money) -> Self {
        Self::new(self.amount + other.amount)
    }

    pub fn checked_sub(&self, other: &Money) -> Self {
        Self::new(self.amount - other.amount)
    }

    /// Multiply by a dimensionless decimal (e.g. a price, a fraction).
    pub fn mul_dimensionless(&self, factor: Decimal) -> Self {
        Self::new(self.amount * factor)
    }

    /// Divide yielding a dimensionless ratio. `CoreError::ArithDomain` on
    /// division by zero.
    pub fn ratio_to(&self, other: &Money) -> Result<Decimal, CoreError> {
        if other.amount.is_zero() {
            return Err(CoreError::ArithDomain("division by zero money".into()));
        }
        Ok(self.amount / other.amount)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.amount)
    }
}

/// `Money` paired with the `Asset` it is denominated in. Arithmetic between
/// two `TaggedMoney` values of different assets fails loudly rather than
/// silently reinterpreting one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedMoney {
    pub asset: Asset,
    pub money: Money,
}

impl TaggedMoney {
    pub fn new(asset: Asset, amount: Decimal) -> Self {
        Self {
            asset,
            money: Money::new(amount),
        }
    }

    pub fn add(&self, other: &TaggedMoney) -> Result<TaggedMoney, CoreError> {
        if self.asset != other.asset {
            return Err(CoreError::UnitMismatch(
                self.asset.to_string(),
                other.asset.to_string(),
            ));
        }
        Ok(TaggedMoney {
            asset: self.asset.clone(),
            money: self.money.checked_add(&other.money),
        })
    }

    pub fn sub(&self, other: &TaggedMoney) -> Result<TaggedMoney, CoreError> {
        if self.asset != other.asset {
            return Err(CoreError::UnitMismatch(
                self.asset.to_string(),
                other.asset.to_string(),
            ));
        }
        Ok(TaggedMoney {
            asset: self.asset.clone(),
            money: self.money.checked_sub(&other.money),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounding_is_half_to_even() {
        // exact half at the 9th digit rounds to the nearest even 8th digit
        let a = Money::new(dec!(0.123456785));
        let b = Money::new(dec!(0.123456795));
        assert_eq!(a.amount(), dec!(0.12345678));
        assert_eq!(b.amount(), dec!(0.12345680));
    }

    #[test]
    fn dust_threshold() {
        assert!(Money::new(dec!(0.99)).is_dust());
        assert!(!Money::new(dec!(1.00)).is_dust());
        assert!(Money::new(dec!(-0.04)).is_dust());
    }

    #[test]
    fn unit_mismatch_fails_loudly() {
        let usdt = TaggedMoney::new(Asset::new("USDT"), dec!(100));
        let btc = TaggedMoney::new(Asset::new("BTC"), dec!(1));
        assert!(matches!(usdt.add(&btc), Err(CoreError::UnitMismatch(_, _))));
    }

    #[test]
    fn decimal_from_str_rejects_garbage() {
        assert!(matches!(
            Money::decimal_from_str("not-a-number"),
            Err(CoreError::BadDecimal(_, _))
        ));
    }

    #[test]
    fn ratio_by_zero_is_arith_domain() {
        let a = Money::new(dec!(10));
        let z = Money::zero();
        assert!(matches!(a.ratio_to(&z), Err(CoreError::ArithDomain(_))));
    }
}
