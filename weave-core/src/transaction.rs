use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weave_shared::{ids, Currency, Money};

use crate::orders::{Attachment, Milestone, PaymentType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    WaitingConfirm,
    Paid,
    Unpaid,
    Refunded,
}

/// Which milestone of a bulk order a transaction paid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkMilestoneRef {
    pub bulk_purchase_order_id: Uuid,
    pub milestone: Milestone,
}

/// One settlement event covering any mix of sample and bulk orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub reference_id: String,
    pub user_id: Uuid,
    pub payment_type: PaymentType,
    pub status: TransactionStatus,
    pub currency: Currency,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub checkout_session_id: String,
    pub purchase_order_ids: Vec<Uuid>,
    pub bulk_purchase_orders: Vec<BulkMilestoneRef>,
    pub transaction_ref_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub payment_intent_id: Option<String>,
    pub mark_as_paid_at: Option<DateTime<Utc>>,
    pub mark_as_unpaid_at: Option<DateTime<Utc>>,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn new(
        user_id: Uuid,
        payment_type: PaymentType,
        status: TransactionStatus,
        total: Money,
        checkout_session_id: String,
        reference_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let paid_amount = if status == TransactionStatus::Paid {
            total.amount
        } else {
            Decimal::ZERO
        };
        Self {
            id: Uuid::new_v4(),
            reference_id: reference_id.unwrap_or_else(ids::payment_transaction_reference_id),
            user_id,
            payment_type,
            status,
            currency: total.currency,
            total_amount: total.amount,
            paid_amount,
            checkout_session_id,
            purchase_order_ids: Vec::new(),
            bulk_purchase_orders: Vec::new(),
            transaction_ref_id: None,
            attachments: Vec::new(),
            payment_intent_id: None,
            mark_as_paid_at: if status == TransactionStatus::Paid { Some(now) } else { None },
            mark_as_unpaid_at: None,
            refund_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn bulk_purchase_order_ids(&self) -> Vec<Uuid> {
        self.bulk_purchase_orders.iter().map(|b| b.bulk_purchase_order_id).collect()
    }

    pub fn total(&self) -> Money {
        Money::new(self.total_amount, self.currency)
    }

    pub fn mark_paid(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::Paid;
        self.paid_amount = self.total_amount;
        self.mark_as_paid_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_unpaid(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::Unpaid;
        self.mark_as_unpaid_at = Some(now);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: i64,
    pub payment_transaction_id: Option<Uuid>,
    pub purchase_order_id: Option<Uuid>,
    pub currency: Currency,
    pub total_amount: Decimal,
    pub attachment: Option<Attachment>,
    pub voided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_paid_transaction_records_paid_amount() {
        let tx = PaymentTransaction::new(
            Uuid::new_v4(),
            PaymentType::Card,
            TransactionStatus::Paid,
            Money::new(dec!(115.00), Currency::USD),
            "cs_1".into(),
            None,
        );
        assert_eq!(tx.paid_amount, dec!(115.00));
        assert!(tx.mark_as_paid_at.is_some());
        assert!(tx.reference_id.starts_with("PT"));
    }

    #[test]
    fn test_waiting_transaction_settles() {
        let mut tx = PaymentTransaction::new(
            Uuid::new_v4(),
            PaymentType::BankTransfer,
            TransactionStatus::WaitingConfirm,
            Money::new(dec!(42), Currency::EUR),
            "cs_2".into(),
            Some("PT-shared".into()),
        );
        assert_eq!(tx.paid_amount, Decimal::ZERO);
        assert_eq!(tx.reference_id, "PT-shared");
        tx.mark_paid(Utc::now());
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert_eq!(tx.paid_amount, dec!(42));
    }
}
