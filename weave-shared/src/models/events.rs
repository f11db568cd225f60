use rust_decimal::Decimal;
use uuid::Uuid;

use crate::money::Currency;

pub const TOPIC_PAYMENT_SUBMITTED: &str = "payment.submitted";
pub const TOPIC_PAYMENT_SETTLED: &str = "payment.settled";
pub const TOPIC_PAYMENT_REJECTED: &str = "payment.rejected";
pub const TOPIC_ORDER_REFUNDED: &str = "order.refunded";

/// A bank transfer was declared by the buyer and waits for staff review.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PaymentSubmittedEvent {
    pub transaction_id: Uuid,
    pub checkout_session_id: String,
    pub user_id: Uuid,
    pub total_amount: Decimal,
    pub currency: Currency,
    pub timestamp: i64,
}

/// Consumed by the invoice worker.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PaymentSettledEvent {
    pub transaction_id: Uuid,
    pub checkout_session_id: String,
    pub user_id: Uuid,
    pub purchase_order_ids: Vec<Uuid>,
    pub bulk_purchase_order_ids: Vec<Uuid>,
    pub total_amount: Decimal,
    pub currency: Currency,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PaymentRejectedEvent {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub rejected_by: Uuid,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct OrderRefundedEvent {
    pub purchase_order_id: Uuid,
    pub payment_intent_id: String,
    pub reason: Option<String>,
    pub refunded_by: Uuid,
    pub timestamp: i64,
}
