use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),
    #[error("Amount {0} does not fit in minor units")]
    Overflow(Decimal),
}

/// Settlement currencies accepted by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    USD,
    EUR,
    VND,
}

impl Currency {
    /// Multiplier from a major amount to the gateway's smallest unit.
    pub fn minor_unit_factor(self) -> i64 {
        match self {
            Currency::USD | Currency::EUR => 100,
            Currency::VND => 1,
        }
    }

    pub fn decimal_places(self) -> u32 {
        match self {
            Currency::USD | Currency::EUR => 2,
            Currency::VND => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::VND => "VND",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "VND" => Ok(Currency::VND),
            other => Err(MoneyError::UnknownCurrency(other.to_string())),
        }
    }
}

/// Exact decimal amount tagged with its currency.
///
/// Arithmetic between two `Money` values only succeeds when both carry the
/// same currency; scaling by a plain `Decimal` keeps the currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(&other)?;
        Ok(Money::new(self.amount + other.amount, self.currency))
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(&other)?;
        Ok(Money::new(self.amount - other.amount, self.currency))
    }

    pub fn checked_cmp(&self, other: &Money) -> Result<Ordering, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    pub fn scale(self, factor: Decimal) -> Money {
        Money::new(self.amount * factor, self.currency)
    }

    /// `amount × pct / 100`
    pub fn percent(self, pct: Decimal) -> Money {
        Money::new(self.amount * pct / Decimal::ONE_HUNDRED, self.currency)
    }

    /// Rounds half away from zero to the currency's minor unit.
    pub fn round(self) -> Money {
        Money::new(
            self.amount
                .round_dp_with_strategy(self.currency.decimal_places(), RoundingStrategy::MidpointAwayFromZero),
            self.currency,
        )
    }

    pub fn to_minor_units(self) -> Result<i64, MoneyError> {
        let scaled = self
            .amount
            .checked_mul(Decimal::from(self.currency.minor_unit_factor()))
            .ok_or(MoneyError::Overflow(self.amount))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        scaled.to_i64().ok_or(MoneyError::Overflow(self.amount))
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn sum<I>(currency: Currency, values: I) -> Result<Money, MoneyError>
    where
        I: IntoIterator<Item = Money>,
    {
        values
            .into_iter()
            .try_fold(Money::zero(currency), |acc, m| acc.checked_add(m))
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_add_same_currency() {
        let a = Money::new(dec!(10.10), Currency::USD);
        let b = Money::new(dec!(0.20), Currency::USD);
        assert_eq!(a.checked_add(b).unwrap().amount, dec!(10.30));
    }

    #[test]
    fn test_add_rejects_mixed_currency() {
        let a = Money::new(dec!(1), Currency::USD);
        let b = Money::new(dec!(1), Currency::VND);
        assert_eq!(
            a.checked_add(b),
            Err(MoneyError::CurrencyMismatch { left: Currency::USD, right: Currency::VND })
        );
        assert!(a.checked_cmp(&b).is_err());
    }

    #[test]
    fn test_percent_and_round() {
        let subtotal = Money::new(dec!(33.33), Currency::USD);
        assert_eq!(subtotal.percent(dec!(10)).round().amount, dec!(3.33));
        assert_eq!(Money::new(dec!(0.125), Currency::USD).round().amount, dec!(0.13));
        assert_eq!(Money::new(dec!(1500.5), Currency::VND).round().amount, dec!(1501));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(Money::new(dec!(115.00), Currency::USD).to_minor_units().unwrap(), 11500);
        assert_eq!(Money::new(dec!(250000), Currency::VND).to_minor_units().unwrap(), 250000);
    }

    #[test]
    fn test_minor_units_overflow_is_an_error() {
        let huge = Money::new(Decimal::MAX, Currency::USD);
        assert!(matches!(huge.to_minor_units(), Err(MoneyError::Overflow(_))));
        let beyond_i64 = Money::new(dec!(100000000000000000), Currency::USD);
        assert!(matches!(beyond_i64.to_minor_units(), Err(MoneyError::Overflow(_))));
    }

    #[test]
    fn test_sum_is_exact() {
        let items = vec![
            Money::new(dec!(0.1), Currency::EUR),
            Money::new(dec!(0.2), Currency::EUR),
        ];
        assert_eq!(Money::sum(Currency::EUR, items).unwrap().amount, dec!(0.3));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("usd".parse::<Currency>().unwrap(), Currency::USD);
        assert!("JPY".parse::<Currency>().is_err());
    }
}
