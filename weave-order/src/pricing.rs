use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use weave_core::orders::{Milestone, PaymentType};
use weave_shared::{Currency, Money, MoneyError};

/// Card processing fee for one currency: `base × rate + fixed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CardFee {
    pub rate: Decimal,
    pub fixed: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct FeeSchedule {
    card_fees: HashMap<Currency, CardFee>,
}

impl FeeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_card_fee(mut self, currency: Currency, fee: CardFee) -> Self {
        self.card_fees.insert(currency, fee);
        self
    }

    pub fn from_map(card_fees: HashMap<Currency, CardFee>) -> Self {
        Self { card_fees }
    }

    /// Bank transfers carry no fee; unknown currencies default to zero.
    pub fn transaction_fee(&self, payment_type: PaymentType, base: Money) -> Money {
        match payment_type {
            PaymentType::BankTransfer => Money::zero(base.currency),
            PaymentType::Card => {
                let fee = self.card_fees.get(&base.currency).copied().unwrap_or_default();
                Money::new(base.amount * fee.rate + fee.fixed, base.currency).round()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplePricing {
    pub sub_total: Money,
    pub tax_percentage: Decimal,
    pub tax: Money,
    pub shipping_fee: Money,
    pub transaction_fee: Money,
    pub total: Money,
}

pub fn price_sample(
    sub_total: Money,
    tax_percentage: Decimal,
    shipping_fee: Money,
    payment_type: PaymentType,
    fees: &FeeSchedule,
) -> Result<SamplePricing, MoneyError> {
    let sub_total = sub_total.round();
    let shipping_fee = shipping_fee.round();
    let tax = sub_total.percent(tax_percentage).round();
    let transaction_fee = fees.transaction_fee(payment_type, sub_total.checked_add(shipping_fee)?);
    let total = Money::sum(
        sub_total.currency,
        [sub_total, shipping_fee, tax, transaction_fee],
    )?;

    Ok(SamplePricing {
        sub_total,
        tax_percentage,
        tax,
        shipping_fee,
        transaction_fee,
        total,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MilestonePricing {
    pub milestone: Milestone,
    pub sub_total: Money,
    pub tax: Money,
    pub transaction_fee: Money,
    pub total: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BulkPricing {
    pub base_sub_total: Money,
    pub tax_percentage: Decimal,
    pub tax: Money,
    pub shipping_fee: Money,
    pub active: MilestonePricing,
}

impl BulkPricing {
    /// Order total before card fees.
    pub fn order_total(&self) -> Result<Money, MoneyError> {
        Money::sum(
            self.base_sub_total.currency,
            [self.base_sub_total, self.shipping_fee, self.tax],
        )
    }
}

/// Prices the active milestone of a bulk order.
///
/// Shipping is charged once, with the final milestone. The final milestone's
/// tax is whatever the deposit did not already cover, so the two taxes add up
/// to the whole-order tax exactly.
pub fn price_bulk(
    base_sub_total: Money,
    first_payment_percentage: Decimal,
    tax_percentage: Decimal,
    shipping_fee: Money,
    milestone: Milestone,
    payment_type: PaymentType,
    fees: &FeeSchedule,
) -> Result<BulkPricing, MoneyError> {
    let currency = base_sub_total.currency;
    let base_sub_total = base_sub_total.round();
    let shipping_fee = shipping_fee.round();
    let tax = base_sub_total.percent(tax_percentage).round();

    let first_sub_total = base_sub_total.percent(first_payment_percentage).round();
    let first_tax = first_sub_total.percent(tax_percentage).round();

    let active = match milestone {
        Milestone::First => {
            let transaction_fee = fees.transaction_fee(payment_type, first_sub_total);
            MilestonePricing {
                milestone,
                sub_total: first_sub_total,
                tax: first_tax,
                transaction_fee,
                total: Money::sum(currency, [first_sub_total, first_tax, transaction_fee])?,
            }
        }
        Milestone::Final => {
            let sub_total = base_sub_total.checked_sub(first_sub_total)?;
            let final_tax = tax.checked_sub(first_tax)?;
            let transaction_fee = fees.transaction_fee(payment_type, sub_total.checked_add(shipping_fee)?);
            MilestonePricing {
                milestone,
                sub_total,
                tax: final_tax,
                transaction_fee,
                total: Money::sum(currency, [sub_total, shipping_fee, final_tax, transaction_fee])?,
            }
        }
    };

    Ok(BulkPricing {
        base_sub_total,
        tax_percentage,
        tax,
        shipping_fee,
        active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    #[test]
    fn test_sample_pricing_without_card_fee() {
        let pricing = price_sample(
            usd(dec!(100.00)),
            dec!(10),
            usd(dec!(5.00)),
            PaymentType::Card,
            &FeeSchedule::new(),
        )
        .unwrap();
        assert_eq!(pricing.tax.amount, dec!(10.00));
        assert_eq!(pricing.transaction_fee.amount, dec!(0));
        assert_eq!(pricing.total.amount, dec!(115.00));
    }

    #[test]
    fn test_card_fee_applies_to_subtotal_and_shipping() {
        let fees = FeeSchedule::new().with_card_fee(
            Currency::USD,
            CardFee { rate: dec!(0.029), fixed: dec!(0.30) },
        );
        let card = price_sample(usd(dec!(100)), dec!(10), usd(dec!(5)), PaymentType::Card, &fees).unwrap();
        // (105 × 0.029) + 0.30 = 3.345 → 3.35
        assert_eq!(card.transaction_fee.amount, dec!(3.35));
        assert_eq!(card.total.amount, dec!(118.35));

        let bank = price_sample(usd(dec!(100)), dec!(10), usd(dec!(5)), PaymentType::BankTransfer, &fees).unwrap();
        assert_eq!(bank.transaction_fee.amount, dec!(0));
    }

    #[test]
    fn test_bulk_milestones_cover_whole_order() {
        let fees = FeeSchedule::new();
        let first = price_bulk(
            usd(dec!(1000)),
            dec!(30),
            dec!(8),
            usd(dec!(50)),
            Milestone::First,
            PaymentType::BankTransfer,
            &fees,
        )
        .unwrap();
        let last = price_bulk(
            usd(dec!(1000)),
            dec!(30),
            dec!(8),
            usd(dec!(50)),
            Milestone::Final,
            PaymentType::BankTransfer,
            &fees,
        )
        .unwrap();

        assert_eq!(first.active.sub_total.amount, dec!(300));
        assert_eq!(first.active.tax.amount, dec!(24));
        assert_eq!(first.active.total.amount, dec!(324));
        assert_eq!(last.active.sub_total.amount, dec!(700));
        assert_eq!(last.active.tax.amount, dec!(56));
        assert_eq!(last.active.total.amount, dec!(806));

        let paid = first.active.total.checked_add(last.active.total).unwrap();
        assert_eq!(paid, first.order_total().unwrap());
    }

    #[test]
    fn test_vnd_rounds_to_whole_units() {
        let pricing = price_sample(
            Money::new(dec!(100001), Currency::VND),
            dec!(5),
            Money::zero(Currency::VND),
            PaymentType::BankTransfer,
            &FeeSchedule::new(),
        )
        .unwrap();
        assert_eq!(pricing.tax.amount, dec!(5000));
        assert_eq!(pricing.total.amount, dec!(105001));
    }
}
