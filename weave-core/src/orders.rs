use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weave_shared::{ids, Currency, Money};

use crate::tracking::{BulkTrackingStatus, PoTrackingStatus, SellerTrackingStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Card,
    BankTransfer,
}

/// Business (payment) status of a sample order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseOrderStatus {
    Pending,
    WaitingConfirm,
    Paid,
    Unpaid,
    Canceled,
}

impl PurchaseOrderStatus {
    /// Statuses in which a checkout preview may still refresh the pricing.
    pub const REPRICEABLE: [PurchaseOrderStatus; 2] = [PurchaseOrderStatus::Pending, PurchaseOrderStatus::Unpaid];

    pub fn is_repriceable(self) -> bool {
        Self::REPRICEABLE.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InquiryStatus {
    New,
    Quoted,
    Finished,
    Canceled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotationKind {
    Sample,
    Bulk,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub file_key: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn new(file_key: impl Into<String>) -> Self {
        Self {
            file_key: file_key.into(),
            file_name: None,
            content_type: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quotation {
    pub kind: QuotationKind,
    pub price: Decimal,
    pub lead_time_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMaterial {
    pub reference_id: Option<String>,
    pub name: String,
    pub note: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageNote {
    pub description: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogisticInfo {
    pub carrier: String,
    pub tracking_code: Option<String>,
    pub tracking_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inquiry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
    pub tax_percentage: Option<Decimal>,
    pub shipping_fee: Option<Decimal>,
    pub status: InquiryStatus,
    pub quotations: Vec<Quotation>,
}

/// Which order a cart line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOwner {
    PurchaseOrder(Uuid),
    BulkPurchaseOrder(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderCartItem {
    pub id: Uuid,
    pub purchase_order_id: Option<Uuid>,
    pub bulk_purchase_order_id: Option<Uuid>,
    pub style: Option<String>,
    pub size: Option<String>,
    pub color: Option<String>,
    pub unit_price: Decimal,
    pub qty: i64,
    pub total_price: Decimal,
    pub checkout_session_id: Option<String>,
    pub waiting_for_checkout: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderCartItem {
    pub fn new(owner: ItemOwner, unit_price: Decimal, qty: i64) -> Self {
        let now = Utc::now();
        let (purchase_order_id, bulk_purchase_order_id) = match owner {
            ItemOwner::PurchaseOrder(id) => (Some(id), None),
            ItemOwner::BulkPurchaseOrder(id) => (None, Some(id)),
        };
        Self {
            id: Uuid::new_v4(),
            purchase_order_id,
            bulk_purchase_order_id,
            style: None,
            size: None,
            color: None,
            unit_price,
            qty,
            total_price: unit_price * Decimal::from(qty),
            checkout_session_id: None,
            waiting_for_checkout: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// `None` when the row violates the single-owner rule.
    pub fn owner(&self) -> Option<ItemOwner> {
        match (self.purchase_order_id, self.bulk_purchase_order_id) {
            (Some(po), None) => Some(ItemOwner::PurchaseOrder(po)),
            (None, Some(bulk)) => Some(ItemOwner::BulkPurchaseOrder(bulk)),
            _ => None,
        }
    }

    pub fn recompute_total(&mut self) {
        self.total_price = self.unit_price * Decimal::from(self.qty);
    }

    pub fn is_checked_out(&self) -> bool {
        self.checkout_session_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn stamp_checkout(&mut self, session_id: &str, now: DateTime<Utc>) {
        self.checkout_session_id = Some(session_id.to_string());
        self.updated_at = now;
    }

    pub fn mark_checked_out(&mut self, session_id: &str, now: DateTime<Utc>) {
        self.stamp_checkout(session_id, now);
        self.waiting_for_checkout = false;
    }
}

/// A buyer's sample order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: Uuid,
    pub reference_id: String,
    pub user_id: Uuid,
    pub inquiry_id: Option<Uuid>,
    pub currency: Currency,
    pub status: PurchaseOrderStatus,
    pub tracking_status: PoTrackingStatus,
    pub seller_tracking_status: SellerTrackingStatus,
    pub payment_type: Option<PaymentType>,

    pub sub_total: Decimal,
    pub tax_percentage: Decimal,
    pub tax: Decimal,
    pub shipping_fee: Decimal,
    pub transaction_fee: Decimal,
    pub total_price: Decimal,

    pub checkout_session_id: Option<String>,
    pub payment_transaction_reference_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub transaction_ref_id: Option<String>,
    pub transaction_attachment: Option<Attachment>,
    pub transfered_at: Option<DateTime<Utc>>,
    pub mark_as_paid_at: Option<DateTime<Utc>>,
    pub mark_as_unpaid_at: Option<DateTime<Utc>>,

    pub quotations: Vec<Quotation>,
    pub lead_time: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,

    pub techpack_attachments: Vec<Attachment>,
    pub approve_design_at: Option<DateTime<Utc>>,
    pub raw_materials: Vec<RawMaterial>,
    pub making_info: Option<StageNote>,
    pub submit_info: Option<StageNote>,
    pub logistic_info: Option<LogisticInfo>,
    pub delivery_started_at: Option<DateTime<Utc>>,
    pub receiver_confirmed_at: Option<DateTime<Utc>>,

    pub invoice_number: Option<i64>,
    pub refund_reason: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,

    pub cart_items: Vec<OrderCartItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseOrder {
    pub fn new(user_id: Uuid, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_id: ids::purchase_order_reference_id(),
            user_id,
            inquiry_id: None,
            currency,
            status: PurchaseOrderStatus::Pending,
            tracking_status: PoTrackingStatus::New,
            seller_tracking_status: SellerTrackingStatus::New,
            payment_type: None,
            sub_total: Decimal::ZERO,
            tax_percentage: Decimal::ZERO,
            tax: Decimal::ZERO,
            shipping_fee: Decimal::ZERO,
            transaction_fee: Decimal::ZERO,
            total_price: Decimal::ZERO,
            checkout_session_id: None,
            payment_transaction_reference_id: None,
            payment_intent_id: None,
            transaction_ref_id: None,
            transaction_attachment: None,
            transfered_at: None,
            mark_as_paid_at: None,
            mark_as_unpaid_at: None,
            quotations: Vec::new(),
            lead_time: None,
            start_date: None,
            completion_date: None,
            techpack_attachments: Vec::new(),
            approve_design_at: None,
            raw_materials: Vec::new(),
            making_info: None,
            submit_info: None,
            logistic_info: None,
            delivery_started_at: None,
            receiver_confirmed_at: None,
            invoice_number: None,
            refund_reason: None,
            archived_at: None,
            cart_items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_item(&mut self, unit_price: Decimal, qty: i64) -> &OrderCartItem {
        let item = OrderCartItem::new(ItemOwner::PurchaseOrder(self.id), unit_price, qty);
        self.cart_items.push(item);
        &self.cart_items[self.cart_items.len() - 1]
    }

    pub fn total(&self) -> Money {
        Money::new(self.total_price, self.currency)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn sample_quotation(&self) -> Option<&Quotation> {
        self.quotations.iter().find(|q| q.kind == QuotationKind::Sample)
    }

    /// Derives lead time and production window from the sample quotation.
    pub fn apply_lead_time(&mut self, now: DateTime<Utc>) {
        if let Some(days) = self.sample_quotation().and_then(|q| q.lead_time_days) {
            self.lead_time = Some(days);
            self.start_date = Some(now);
            self.completion_date = Some(now + Duration::days(days));
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommercialInvoiceItem {
    pub description: String,
    pub qty: i64,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
}

/// Pricing snapshot locked by staff once the bulk order is invoiced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommercialInvoice {
    pub sub_total: Option<Decimal>,
    pub shipping_fee: Decimal,
    pub tax_percentage: Decimal,
    #[serde(default)]
    pub items: Vec<CommercialInvoiceItem>,
}

impl CommercialInvoice {
    pub fn invoice_sub_total(&self) -> Decimal {
        match self.sub_total {
            Some(sub_total) if sub_total > Decimal::ZERO => sub_total,
            _ => self.items.iter().map(|i| i.total_amount).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Milestone {
    First,
    Final,
}

impl Milestone {
    pub fn payable_status(self) -> BulkTrackingStatus {
        match self {
            Milestone::First => BulkTrackingStatus::FirstPayment,
            Milestone::Final => BulkTrackingStatus::FinalPayment,
        }
    }

    pub fn confirm_status(self) -> BulkTrackingStatus {
        match self {
            Milestone::First => BulkTrackingStatus::FirstPaymentConfirm,
            Milestone::Final => BulkTrackingStatus::FinalPaymentConfirm,
        }
    }

    pub fn confirmed_status(self) -> BulkTrackingStatus {
        match self {
            Milestone::First => BulkTrackingStatus::FirstPaymentConfirmed,
            Milestone::Final => BulkTrackingStatus::FinalPaymentConfirmed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentMilestone {
    pub payment_type: Option<PaymentType>,
    pub sub_total: Decimal,
    pub tax: Decimal,
    pub transaction_fee: Decimal,
    pub total: Decimal,
    pub transaction_ref_id: Option<String>,
    pub transaction_attachment: Option<Attachment>,
    pub transaction_reference_id: Option<String>,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub transfered_at: Option<DateTime<Utc>>,
    pub mark_as_paid_at: Option<DateTime<Utc>>,
    pub mark_as_unpaid_at: Option<DateTime<Utc>>,
}

/// A full production run paid in a deposit and a final milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkPurchaseOrder {
    pub id: Uuid,
    pub reference_id: String,
    pub user_id: Uuid,
    pub inquiry_id: Option<Uuid>,
    pub purchase_order_id: Option<Uuid>,
    pub currency: Currency,
    pub tracking_status: BulkTrackingStatus,

    pub sub_total: Decimal,
    pub tax_percentage: Decimal,
    pub shipping_fee: Decimal,
    pub tax: Decimal,
    pub transaction_fee: Decimal,
    pub total_price: Decimal,
    pub first_payment_percentage: Option<Decimal>,
    pub first_payment: PaymentMilestone,
    pub final_payment: PaymentMilestone,
    pub commercial_invoice: Option<CommercialInvoice>,

    pub quotations: Vec<Quotation>,
    pub lead_time: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub raw_materials: Vec<RawMaterial>,
    pub logistic_info: Option<LogisticInfo>,
    pub delivery_started_at: Option<DateTime<Utc>>,
    pub receiver_confirmed_at: Option<DateTime<Utc>>,

    pub cart_items: Vec<OrderCartItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BulkPurchaseOrder {
    pub fn new(user_id: Uuid, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_id: ids::bulk_purchase_order_reference_id(),
            user_id,
            inquiry_id: None,
            purchase_order_id: None,
            currency,
            tracking_status: BulkTrackingStatus::New,
            sub_total: Decimal::ZERO,
            tax_percentage: Decimal::ZERO,
            shipping_fee: Decimal::ZERO,
            tax: Decimal::ZERO,
            transaction_fee: Decimal::ZERO,
            total_price: Decimal::ZERO,
            first_payment_percentage: None,
            first_payment: PaymentMilestone::default(),
            final_payment: PaymentMilestone::default(),
            commercial_invoice: None,
            quotations: Vec::new(),
            lead_time: None,
            start_date: None,
            completion_date: None,
            raw_materials: Vec::new(),
            logistic_info: None,
            delivery_started_at: None,
            receiver_confirmed_at: None,
            cart_items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_item(&mut self, unit_price: Decimal, qty: i64) -> &OrderCartItem {
        let item = OrderCartItem::new(ItemOwner::BulkPurchaseOrder(self.id), unit_price, qty);
        self.cart_items.push(item);
        &self.cart_items[self.cart_items.len() - 1]
    }

    /// The milestone awaiting payment, if the order is in a payable state.
    pub fn payable_milestone(&self) -> Option<Milestone> {
        match self.tracking_status {
            BulkTrackingStatus::FirstPayment => Some(Milestone::First),
            BulkTrackingStatus::FinalPayment => Some(Milestone::Final),
            _ => None,
        }
    }

    /// The milestone declared paid by bank transfer and awaiting staff review.
    pub fn pending_milestone(&self) -> Option<Milestone> {
        match self.tracking_status {
            BulkTrackingStatus::FirstPaymentConfirm => Some(Milestone::First),
            BulkTrackingStatus::FinalPaymentConfirm => Some(Milestone::Final),
            _ => None,
        }
    }

    pub fn milestone(&self, milestone: Milestone) -> &PaymentMilestone {
        match milestone {
            Milestone::First => &self.first_payment,
            Milestone::Final => &self.final_payment,
        }
    }

    pub fn milestone_mut(&mut self, milestone: Milestone) -> &mut PaymentMilestone {
        match milestone {
            Milestone::First => &mut self.first_payment,
            Milestone::Final => &mut self.final_payment,
        }
    }

    pub fn milestone_total(&self, milestone: Milestone) -> Money {
        Money::new(self.milestone(milestone).total, self.currency)
    }

    pub fn bulk_quotation(&self) -> Option<&Quotation> {
        self.quotations.iter().find(|q| q.kind == QuotationKind::Bulk)
    }

    pub fn apply_lead_time(&mut self, now: DateTime<Utc>) {
        if let Some(days) = self.bulk_quotation().and_then(|q| q.lead_time_days) {
            self.lead_time = Some(days);
            self.start_date = Some(now);
            self.completion_date = Some(now + Duration::days(days));
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
