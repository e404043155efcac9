//! Fixed-point monetary amounts and share arithmetic.
//!
//! Every amount is a whole number of some [`Unit`](crate::units::Unit),
//! normally the base unit. Fractions only ever appear inside
//! `rust_decimal::Decimal` intermediates and are rounded back to an
//! [`Amount`] through a single rounding rule.

use crate::error::{EngineError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// A signed integer amount of currency units.
///
/// There is deliberately no `From<f64>` or `From<Decimal>`: the only way in
/// from a fractional type is [`Amount::from_decimal`], which refuses
/// anything that is not a whole number.
///
/// # Examples
///
/// ```
/// use float_engine::Amount;
///
/// let amount = Amount::new(10_000) + Amount::new(250);
/// assert_eq!(amount.value(), 10_250);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    /// Zero value.
    pub const ZERO: Self = Amount(0);

    /// Creates an amount from a whole number of units.
    pub const fn new(value: i64) -> Self {
        Amount(value)
    }

    /// Returns the raw integer value.
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Returns `true` if this value is zero.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if this value is below zero.
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Converts a decimal into an amount, failing on any fractional part.
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        if !value.fract().is_zero() {
            return Err(EngineError::NonIntegerAmount {
                value: value.to_string(),
            });
        }
        value
            .to_i64()
            .map(Amount)
            .ok_or(EngineError::Overflow {
                context: "decimal to amount",
            })
    }

    /// Widens the amount into a decimal for share arithmetic.
    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0)
    }

    /// Multiplies by an integer factor, failing on overflow.
    pub fn checked_mul(self, factor: i64) -> Result<Self> {
        self.0
            .checked_mul(factor)
            .map(Amount)
            .ok_or(EngineError::Overflow {
                context: "amount multiplication",
            })
    }

    /// Adds, failing on overflow.
    pub fn checked_add(self, rhs: Amount) -> Result<Self> {
        self.0
            .checked_add(rhs.0)
            .map(Amount)
            .ok_or(EngineError::Overflow {
                context: "amount addition",
            })
    }
}

/// Rounds to a whole amount with halves going away from zero.
pub fn round_half_up(value: Decimal) -> Result<Amount> {
    Amount::from_decimal(value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
}

/// Rounds to a whole amount towards negative infinity.
pub fn round_floor(value: Decimal) -> Result<Amount> {
    Amount::from_decimal(value.floor())
}

/// Computes `pool * share` for a share given as a fraction in `[0, 1]`.
///
/// The pool must already be a whole amount; a fractional pool means
/// something upstream has lost track of units, so it fails fast. Halves
/// round up when `round_half_up_result` is set, otherwise the result is
/// floored (used where the remainder should stay with the operator).
pub fn calculate_share(pool: Decimal, share: Decimal, round_half_up_result: bool) -> Result<Amount> {
    if !pool.fract().is_zero() {
        return Err(EngineError::NonIntegerPool {
            value: pool.to_string(),
        });
    }
    if share < Decimal::ZERO || share > Decimal::ONE {
        return Err(EngineError::ShareOutOfRange {
            value: share.to_string(),
        });
    }

    let product = pool.checked_mul(share).ok_or(EngineError::Overflow {
        context: "share calculation",
    })?;
    let result = if round_half_up_result {
        round_half_up(product)?
    } else {
        round_floor(product)?
    };

    log::debug!("Share of {} in pool {} is {}", share, pool, result);
    Ok(result)
}

/// Returns `pool * part / total`, rounded half-up, for a `part` that lies
/// within `total`. An empty total gives zero.
///
/// The product is taken before the division so that a share landing
/// exactly on a half rounds up even when `part / total` has no finite
/// decimal form.
pub fn proportional_share(pool: Amount, part: Amount, total: Amount) -> Result<Amount> {
    if total.is_zero() {
        return Ok(Amount::ZERO);
    }
    let ratio = part
        .to_decimal()
        .checked_div(total.to_decimal())
        .ok_or(EngineError::Overflow {
            context: "fraction of total",
        })?;
    if ratio < Decimal::ZERO || ratio > Decimal::ONE {
        return Err(EngineError::ShareOutOfRange {
            value: ratio.to_string(),
        });
    }

    let exact = pool
        .to_decimal()
        .checked_mul(part.to_decimal())
        .and_then(|product| product.checked_div(total.to_decimal()))
        .ok_or(EngineError::Overflow {
            context: "proportional share",
        })?;
    round_half_up(exact)
}

impl FromStr for Amount {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal = Decimal::from_str(trimmed)
            .map_err(|e| EngineError::InvalidRequest(format!("bad amount {:?}: {}", trimmed, e)))?;
        Amount::from_decimal(decimal)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + *a)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accept integers, integral decimals and numeric strings; reject fractions.
        let decimal = <Decimal as Deserialize>::deserialize(deserializer)?;
        Amount::from_decimal(decimal).map_err(serde::de::Error::custom)
    }
}
