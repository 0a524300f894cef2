//! Fixed-point currency
//!
//! Every control-break total in the engine is a [`Money`]: a decimal held at
//! scale 2 and rounded half-to-even (banker's rounding) whenever a value
//! enters the type or an addition could introduce extra digits. Negative
//! amounts are valid and flow through every total unchanged.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Number of fractional digits carried by every amount
pub const MONEY_SCALE: u32 = 2;

/// Rounding applied on construction and after each addition
pub const MONEY_ROUNDING: RoundingStrategy = RoundingStrategy::MidpointNearestEven;

/// Two-decimal currency amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Wrap a decimal, rounding it to the currency scale
    pub fn new(value: Decimal) -> Self {
        let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, MONEY_ROUNDING);
        rounded.rescale(MONEY_SCALE);
        Money(rounded)
    }

    /// Amount from a whole number of cents
    pub fn from_cents(cents: i64) -> Self {
        Money::new(Decimal::new(cents, MONEY_SCALE))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Addition that reports overflow instead of panicking
    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.0
            .checked_add(other.0)
            .map(Money::new)
            .ok_or_else(|| LedgerError::AmountOverflow {
                left: self.to_string(),
                right: other.to_string(),
            })
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Decimal::from_str(trimmed)
            .map(Money::new)
            .map_err(|e| LedgerError::InvalidAmount {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Honours width and alignment flags
        f.pad(&format!("{:.2}", self.0))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money::new(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money::new(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}
