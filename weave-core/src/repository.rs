use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

use crate::orders::{BulkPurchaseOrder, Inquiry, OrderCartItem, PurchaseOrder, PurchaseOrderStatus};
use crate::tracking::{BulkTrackingStatus, OrderKind, TrackingRecord};
use crate::transaction::{Invoice, PaymentTransaction, TransactionStatus};
use crate::CoreResult;

/// A transaction rewrite that only applies while the stored row still has
/// `expected_status`; otherwise the whole change set fails with `Conflict`.
#[derive(Debug, Clone)]
pub struct TransactionUpdate {
    pub transaction: PaymentTransaction,
    pub expected_status: TransactionStatus,
}

/// Stored state a change set was computed from. `commit` locks and checks each
/// row before writing; a mismatch fails the whole change set with `Conflict`.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    PurchaseOrderStatus { id: Uuid, status: PurchaseOrderStatus },
    BulkOrderStatus { id: Uuid, status: BulkTrackingStatus },
    CartItemSession { id: Uuid, checkout_session_id: Option<String> },
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::PurchaseOrderStatus { id, status } => {
                write!(f, "purchase order {} is no longer {:?}", id, status)
            }
            Precondition::BulkOrderStatus { id, status } => write!(f, "bulk order {} is no longer {:?}", id, status),
            Precondition::CartItemSession { id, .. } => {
                write!(f, "cart item {} was checked out by another session", id)
            }
        }
    }
}

/// Every write of one engine operation. `OrderRepository::commit` applies it
/// in a single database transaction or not at all.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub preconditions: Vec<Precondition>,
    pub purchase_orders: Vec<PurchaseOrder>,
    pub bulk_orders: Vec<BulkPurchaseOrder>,
    pub new_bulk_orders: Vec<BulkPurchaseOrder>,
    pub cart_items: Vec<OrderCartItem>,
    pub new_cart_items: Vec<OrderCartItem>,
    pub finished_inquiries: Vec<Uuid>,
    pub new_transaction: Option<PaymentTransaction>,
    pub updated_transactions: Vec<TransactionUpdate>,
    pub tracking_records: Vec<TrackingRecord>,
    pub voided_invoices: Vec<i64>,
    pub new_invoices: Vec<Invoice>,
    /// Pricing columns only, skipped for orders no longer open for payment.
    pub repriced_purchase_orders: Vec<PurchaseOrder>,
    pub repriced_bulk_orders: Vec<BulkPurchaseOrder>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.purchase_orders.is_empty()
            && self.bulk_orders.is_empty()
            && self.new_bulk_orders.is_empty()
            && self.cart_items.is_empty()
            && self.new_cart_items.is_empty()
            && self.finished_inquiries.is_empty()
            && self.new_transaction.is_none()
            && self.updated_transactions.is_empty()
            && self.tracking_records.is_empty()
            && self.voided_invoices.is_empty()
            && self.new_invoices.is_empty()
            && self.repriced_purchase_orders.is_empty()
            && self.repriced_bulk_orders.is_empty()
    }

    /// Queues an order update together with its cart items.
    pub fn update_purchase_order(&mut self, order: PurchaseOrder) {
        self.cart_items.extend(order.cart_items.iter().cloned());
        self.purchase_orders.push(order);
    }

    pub fn update_bulk_order(&mut self, order: BulkPurchaseOrder) {
        self.cart_items.extend(order.cart_items.iter().cloned());
        self.bulk_orders.push(order);
    }

    /// Requires the order status and the session of each listed cart item to be
    /// unchanged at commit time. Call with the order as it was read.
    pub fn expect_purchase_order(&mut self, order: &PurchaseOrder) {
        self.preconditions.push(Precondition::PurchaseOrderStatus {
            id: order.id,
            status: order.status,
        });
        self.expect_cart_items(&order.cart_items);
    }

    pub fn expect_bulk_order(&mut self, order: &BulkPurchaseOrder) {
        self.preconditions.push(Precondition::BulkOrderStatus {
            id: order.id,
            status: order.tracking_status,
        });
        self.expect_cart_items(&order.cart_items);
    }

    fn expect_cart_items(&mut self, items: &[OrderCartItem]) {
        self.preconditions.extend(items.iter().map(|item| Precondition::CartItemSession {
            id: item.id,
            checkout_session_id: item.checkout_session_id.clone(),
        }));
    }
}

/// Orders stamped by one checkout session.
#[derive(Debug, Clone, Default)]
pub struct SessionOrders {
    pub purchase_orders: Vec<PurchaseOrder>,
    pub bulk_orders: Vec<BulkPurchaseOrder>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_cart_items(&self, ids: &[Uuid]) -> CoreResult<Vec<OrderCartItem>>;

    /// Non-archived purchase orders with their cart items, optionally scoped to one buyer.
    async fn find_purchase_orders(
        &self,
        ids: &[Uuid],
        user_id: Option<Uuid>,
    ) -> CoreResult<Vec<PurchaseOrder>>;

    async fn find_bulk_orders(
        &self,
        ids: &[Uuid],
        user_id: Option<Uuid>,
    ) -> CoreResult<Vec<BulkPurchaseOrder>>;

    async fn find_inquiries(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<Inquiry>>;

    /// Includes archived orders.
    async fn get_purchase_order(&self, id: Uuid) -> CoreResult<Option<PurchaseOrder>>;

    async fn get_bulk_order(&self, id: Uuid) -> CoreResult<Option<BulkPurchaseOrder>>;

    /// Bulk orders created from the given sample order.
    async fn find_bulk_orders_for_sample(&self, purchase_order_id: Uuid) -> CoreResult<Vec<BulkPurchaseOrder>>;

    async fn get_transaction(&self, id: Uuid) -> CoreResult<Option<PaymentTransaction>>;

    async fn find_transaction_by_session(&self, session_id: &str) -> CoreResult<Option<PaymentTransaction>>;

    async fn find_transaction_by_intent(&self, intent_id: &str) -> CoreResult<Option<PaymentTransaction>>;

    async fn find_orders_by_session(&self, session_id: &str) -> CoreResult<SessionOrders>;

    async fn list_tracking_records(&self, kind: OrderKind, order_id: Uuid) -> CoreResult<Vec<TrackingRecord>>;

    async fn next_invoice_number(&self) -> CoreResult<i64>;

    async fn find_invoice_for_transaction(&self, transaction_id: Uuid) -> CoreResult<Option<Invoice>>;

    async fn commit(&self, changes: ChangeSet) -> CoreResult<()>;
}
