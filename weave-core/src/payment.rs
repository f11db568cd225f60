use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use weave_shared::{Currency, Masked};

use crate::CoreResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    Succeeded,
    Canceled,
    Failed,
}

/// Opaque continuation the client must perform (3-D Secure redirect and the like).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NextAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String, // provider id, e.g. pi_123
    pub amount: i64,
    pub currency: Currency,
    pub status: IntentStatus,
    pub client_secret: Option<Masked<String>>,
    pub next_action: Option<NextAction>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateIntentParams {
    /// Smallest currency unit.
    pub amount: i64,
    pub currency: Currency,
    pub customer: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentLinkLineItem {
    pub name: String,
    /// Smallest currency unit.
    pub unit_amount: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentLinkParams {
    pub currency: Currency,
    pub line_items: Vec<PaymentLinkLineItem>,
    pub metadata: BTreeMap<String, String>,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentLink {
    pub id: String,
    pub url: String,
}

/// Card-payment provider. Amounts are always in minor units.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(&self, params: CreateIntentParams) -> CoreResult<PaymentIntent>;

    async fn confirm_payment_intent(&self, intent_id: &str, return_url: &str) -> CoreResult<PaymentIntent>;

    async fn retrieve_payment_intent(&self, intent_id: &str) -> CoreResult<PaymentIntent>;

    async fn refund_payment_intent(
        &self,
        intent_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> CoreResult<()>;

    async fn create_payment_link(&self, params: CreatePaymentLinkParams) -> CoreResult<PaymentLink>;
}
