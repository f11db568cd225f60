//! In-process implementations of the storage, lock and document collaborators.
//! Used by the service tests here and by the `weave-api` router tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;
use weave_core::documents::{ObjectAcl, ObjectStorage, PageLayout, PdfRenderer};
use weave_core::events::EventPublisher;
use weave_core::lock::{Lease, LockKey, Locker};
use weave_core::orders::{
    BulkPurchaseOrder, Inquiry, InquiryStatus, OrderCartItem, PaymentMilestone, PurchaseOrder,
};
use weave_core::repository::{ChangeSet, OrderRepository, Precondition, SessionOrders};
use weave_core::tracking::{OrderKind, TrackingRecord};
use weave_core::transaction::{Invoice, PaymentTransaction};
use weave_core::{CoreError, CoreResult};

/// Step of `commit` at which an injected failure aborts the change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Start,
    TransactionInsert,
    TrackingInsert,
}

#[derive(Debug, Clone, Default)]
struct Store {
    purchase_orders: HashMap<Uuid, PurchaseOrder>,
    bulk_orders: HashMap<Uuid, BulkPurchaseOrder>,
    cart_items: HashMap<Uuid, OrderCartItem>,
    inquiries: HashMap<Uuid, Inquiry>,
    transactions: HashMap<Uuid, PaymentTransaction>,
    tracking: Vec<TrackingRecord>,
    invoices: HashMap<i64, Invoice>,
    invoice_seq: i64,
}

impl Store {
    fn attach_po_items(&self, mut po: PurchaseOrder) -> PurchaseOrder {
        po.cart_items = self.items_where(|i| i.purchase_order_id == Some(po.id));
        po
    }

    fn attach_bulk_items(&self, mut bulk: BulkPurchaseOrder) -> BulkPurchaseOrder {
        bulk.cart_items = self.items_where(|i| i.bulk_purchase_order_id == Some(bulk.id));
        bulk
    }

    fn items_where(&self, pred: impl Fn(&OrderCartItem) -> bool) -> Vec<OrderCartItem> {
        let mut items: Vec<_> = self.cart_items.values().filter(|i| pred(i)).cloned().collect();
        items.sort_by_key(|i| (i.created_at, i.id));
        items
    }

    fn holds(&self, precondition: &Precondition) -> bool {
        match precondition {
            Precondition::PurchaseOrderStatus { id, status } => {
                self.purchase_orders.get(id).is_some_and(|po| po.status == *status)
            }
            Precondition::BulkOrderStatus { id, status } => {
                self.bulk_orders.get(id).is_some_and(|b| b.tracking_status == *status)
            }
            Precondition::CartItemSession { id, checkout_session_id } => self
                .cart_items
                .get(id)
                .is_some_and(|i| i.checkout_session_id == *checkout_session_id),
        }
    }

    fn reprice_items(&mut self, items: &[OrderCartItem]) {
        for repriced in items {
            if let Some(item) = self.cart_items.get_mut(&repriced.id) {
                item.total_price = repriced.total_price;
            }
        }
    }

    fn apply(&mut self, changes: ChangeSet, fail_at: Option<FailPoint>) -> CoreResult<()> {
        let injected = |point: FailPoint| -> CoreResult<()> {
            if fail_at == Some(point) {
                return Err(CoreError::StorageError(format!("injected failure at {:?}", point)));
            }
            Ok(())
        };

        injected(FailPoint::Start)?;

        for precondition in &changes.preconditions {
            if !self.holds(precondition) {
                return Err(CoreError::Conflict(precondition.to_string()));
            }
        }

        for repriced in changes.repriced_purchase_orders {
            let Some(po) = self
                .purchase_orders
                .get_mut(&repriced.id)
                .filter(|po| po.status.is_repriceable())
            else {
                continue;
            };
            po.sub_total = repriced.sub_total;
            po.tax_percentage = repriced.tax_percentage;
            po.tax = repriced.tax;
            po.shipping_fee = repriced.shipping_fee;
            po.transaction_fee = repriced.transaction_fee;
            po.total_price = repriced.total_price;
            self.reprice_items(&repriced.cart_items);
        }
        for repriced in changes.repriced_bulk_orders {
            let Some(bulk) = self
                .bulk_orders
                .get_mut(&repriced.id)
                .filter(|b| b.tracking_status.is_payable())
            else {
                continue;
            };
            bulk.sub_total = repriced.sub_total;
            bulk.tax_percentage = repriced.tax_percentage;
            bulk.shipping_fee = repriced.shipping_fee;
            bulk.tax = repriced.tax;
            bulk.transaction_fee = repriced.transaction_fee;
            bulk.total_price = repriced.total_price;
            copy_milestone_pricing(&mut bulk.first_payment, &repriced.first_payment);
            copy_milestone_pricing(&mut bulk.final_payment, &repriced.final_payment);
            self.reprice_items(&repriced.cart_items);
        }

        for mut po in changes.purchase_orders {
            if !self.purchase_orders.contains_key(&po.id) {
                return Err(CoreError::StorageError(format!("purchase order {} does not exist", po.id)));
            }
            po.cart_items.clear();
            self.purchase_orders.insert(po.id, po);
        }
        for mut bulk in changes.bulk_orders {
            if !self.bulk_orders.contains_key(&bulk.id) {
                return Err(CoreError::StorageError(format!("bulk order {} does not exist", bulk.id)));
            }
            bulk.cart_items.clear();
            self.bulk_orders.insert(bulk.id, bulk);
        }
        for mut bulk in changes.new_bulk_orders {
            bulk.cart_items.clear();
            self.bulk_orders.insert(bulk.id, bulk);
        }
        for item in changes.cart_items {
            if !self.cart_items.contains_key(&item.id) {
                return Err(CoreError::StorageError(format!("cart item {} does not exist", item.id)));
            }
            self.cart_items.insert(item.id, item);
        }
        for item in changes.new_cart_items {
            self.cart_items.insert(item.id, item);
        }
        for id in changes.finished_inquiries {
            if let Some(inquiry) = self.inquiries.get_mut(&id) {
                inquiry.status = InquiryStatus::Finished;
            }
        }

        injected(FailPoint::TransactionInsert)?;
        if let Some(tx) = changes.new_transaction {
            if self
                .transactions
                .values()
                .any(|t| t.checkout_session_id == tx.checkout_session_id)
            {
                return Err(CoreError::Conflict(format!(
                    "transaction for session {} already exists",
                    tx.checkout_session_id
                )));
            }
            self.transactions.insert(tx.id, tx);
        }
        for update in changes.updated_transactions {
            let current = self
                .transactions
                .get(&update.transaction.id)
                .ok_or_else(|| CoreError::StorageError(format!("transaction {} does not exist", update.transaction.id)))?;
            if current.status != update.expected_status {
                return Err(CoreError::Conflict(format!(
                    "transaction {} is {:?}, expected {:?}",
                    current.id, current.status, update.expected_status
                )));
            }
            self.transactions.insert(update.transaction.id, update.transaction);
        }

        injected(FailPoint::TrackingInsert)?;
        self.tracking.extend(changes.tracking_records);

        let now = Utc::now();
        for number in changes.voided_invoices {
            if let Some(invoice) = self.invoices.get_mut(&number) {
                invoice.voided_at = Some(now);
            }
        }
        for invoice in changes.new_invoices {
            if self.invoices.contains_key(&invoice.invoice_number) {
                return Err(CoreError::Conflict(format!("invoice {} already exists", invoice.invoice_number)));
            }
            self.invoices.insert(invoice.invoice_number, invoice);
        }
        Ok(())
    }
}

fn copy_milestone_pricing(stored: &mut PaymentMilestone, repriced: &PaymentMilestone) {
    stored.sub_total = repriced.sub_total;
    stored.tax = repriced.tax;
    stored.transaction_fee = repriced.transaction_fee;
    stored.total = repriced.total;
}

/// Change sets are applied to a staged copy and swapped in only when every
/// step succeeds, so a failed commit leaves no trace.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    store: RwLock<Store>,
    fail_at: Mutex<Option<FailPoint>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next commit fails at `point`; the one after succeeds again.
    pub fn fail_next_commit(&self, point: FailPoint) {
        if let Ok(mut fail_at) = self.fail_at.lock() {
            *fail_at = Some(point);
        }
    }

    pub async fn insert_purchase_order(&self, mut po: PurchaseOrder) {
        let mut store = self.store.write().await;
        for item in po.cart_items.drain(..) {
            store.cart_items.insert(item.id, item);
        }
        store.purchase_orders.insert(po.id, po);
    }

    pub async fn insert_bulk_order(&self, mut bulk: BulkPurchaseOrder) {
        let mut store = self.store.write().await;
        for item in bulk.cart_items.drain(..) {
            store.cart_items.insert(item.id, item);
        }
        store.bulk_orders.insert(bulk.id, bulk);
    }

    pub async fn insert_inquiry(&self, inquiry: Inquiry) {
        self.store.write().await.inquiries.insert(inquiry.id, inquiry);
    }

    pub async fn insert_transaction(&self, tx: PaymentTransaction) {
        self.store.write().await.transactions.insert(tx.id, tx);
    }

    pub async fn purchase_order(&self, id: Uuid) -> Option<PurchaseOrder> {
        let store = self.store.read().await;
        store.purchase_orders.get(&id).cloned().map(|po| store.attach_po_items(po))
    }

    pub async fn bulk_order(&self, id: Uuid) -> Option<BulkPurchaseOrder> {
        let store = self.store.read().await;
        store.bulk_orders.get(&id).cloned().map(|b| store.attach_bulk_items(b))
    }

    pub async fn cart_item(&self, id: Uuid) -> Option<OrderCartItem> {
        self.store.read().await.cart_items.get(&id).cloned()
    }

    pub async fn inquiry(&self, id: Uuid) -> Option<Inquiry> {
        self.store.read().await.inquiries.get(&id).cloned()
    }

    pub async fn transactions(&self) -> Vec<PaymentTransaction> {
        self.store.read().await.transactions.values().cloned().collect()
    }

    pub async fn tracking_records(&self) -> Vec<TrackingRecord> {
        self.store.read().await.tracking.clone()
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        let mut invoices: Vec<_> = self.store.read().await.invoices.values().cloned().collect();
        invoices.sort_by_key(|i| i.invoice_number);
        invoices
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn find_cart_items(&self, ids: &[Uuid]) -> CoreResult<Vec<OrderCartItem>> {
        let store = self.store.read().await;
        Ok(ids.iter().filter_map(|id| store.cart_items.get(id).cloned()).collect())
    }

    async fn find_purchase_orders(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<PurchaseOrder>> {
        let store = self.store.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| store.purchase_orders.get(id))
            .filter(|po| !po.is_archived() && user_id.map_or(true, |u| po.user_id == u))
            .cloned()
            .map(|po| store.attach_po_items(po))
            .collect())
    }

    async fn find_bulk_orders(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<BulkPurchaseOrder>> {
        let store = self.store.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| store.bulk_orders.get(id))
            .filter(|b| user_id.map_or(true, |u| b.user_id == u))
            .cloned()
            .map(|b| store.attach_bulk_items(b))
            .collect())
    }

    async fn find_inquiries(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<Inquiry>> {
        let store = self.store.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| store.inquiries.get(id))
            .filter(|i| user_id.map_or(true, |u| i.user_id == u))
            .cloned()
            .collect())
    }

    async fn get_purchase_order(&self, id: Uuid) -> CoreResult<Option<PurchaseOrder>> {
        Ok(self.purchase_order(id).await)
    }

    async fn get_bulk_order(&self, id: Uuid) -> CoreResult<Option<BulkPurchaseOrder>> {
        Ok(self.bulk_order(id).await)
    }

    async fn find_bulk_orders_for_sample(&self, purchase_order_id: Uuid) -> CoreResult<Vec<BulkPurchaseOrder>> {
        let store = self.store.read().await;
        Ok(store
            .bulk_orders
            .values()
            .filter(|b| b.purchase_order_id == Some(purchase_order_id))
            .cloned()
            .map(|b| store.attach_bulk_items(b))
            .collect())
    }

    async fn get_transaction(&self, id: Uuid) -> CoreResult<Option<PaymentTransaction>> {
        Ok(self.store.read().await.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_session(&self, session_id: &str) -> CoreResult<Option<PaymentTransaction>> {
        let store = self.store.read().await;
        Ok(store
            .transactions
            .values()
            .find(|t| t.checkout_session_id == session_id)
            .cloned())
    }

    async fn find_transaction_by_intent(&self, intent_id: &str) -> CoreResult<Option<PaymentTransaction>> {
        let store = self.store.read().await;
        Ok(store
            .transactions
            .values()
            .find(|t| t.payment_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }

    async fn find_orders_by_session(&self, session_id: &str) -> CoreResult<SessionOrders> {
        let store = self.store.read().await;
        let session = Some(session_id);
        let purchase_orders = store
            .purchase_orders
            .values()
            .filter(|po| po.checkout_session_id.as_deref() == session)
            .cloned()
            .map(|po| store.attach_po_items(po))
            .collect();
        let bulk_orders = store
            .bulk_orders
            .values()
            .filter(|b| {
                b.first_payment.checkout_session_id.as_deref() == session
                    || b.final_payment.checkout_session_id.as_deref() == session
            })
            .cloned()
            .map(|b| store.attach_bulk_items(b))
            .collect();
        Ok(SessionOrders { purchase_orders, bulk_orders })
    }

    async fn list_tracking_records(&self, kind: OrderKind, order_id: Uuid) -> CoreResult<Vec<TrackingRecord>> {
        let store = self.store.read().await;
        Ok(store
            .tracking
            .iter()
            .filter(|r| r.order_kind == kind && r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn next_invoice_number(&self) -> CoreResult<i64> {
        let mut store = self.store.write().await;
        store.invoice_seq += 1;
        Ok(store.invoice_seq)
    }

    async fn find_invoice_for_transaction(&self, transaction_id: Uuid) -> CoreResult<Option<Invoice>> {
        let store = self.store.read().await;
        Ok(store
            .invoices
            .values()
            .find(|i| i.payment_transaction_id == Some(transaction_id) && i.voided_at.is_none())
            .cloned())
    }

    async fn commit(&self, changes: ChangeSet) -> CoreResult<()> {
        let fail_at = self.fail_at.lock().ok().and_then(|mut f| f.take());
        let mut store = self.store.write().await;
        let mut staged = store.clone();
        staged.apply(changes, fail_at)?;
        *store = staged;
        Ok(())
    }
}

/// Single-process advisory locker with the same lease semantics as the Redis one.
pub struct InProcessLocker {
    held: Mutex<HashMap<String, (String, Instant)>>,
    wait: Duration,
    retry_interval: Duration,
}

impl InProcessLocker {
    pub fn new(wait: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            wait,
            retry_interval: Duration::from_millis(20),
        }
    }

    fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| CoreError::LockError(e.to_string()))?;
        let now = Instant::now();
        match held.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                held.insert(key.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }
}

impl Default for InProcessLocker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Locker for InProcessLocker {
    async fn acquire(&self, key: LockKey, ttl: Duration) -> CoreResult<Lease> {
        let rendered = key.to_string();
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;
        loop {
            if self.try_acquire(&rendered, &token, ttl)? {
                return Ok(Lease { key, token, ttl });
            }
            if Instant::now() >= deadline {
                return Err(CoreError::LockUnavailable(rendered));
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn release(&self, lease: Lease) -> CoreResult<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| CoreError::LockError(e.to_string()))?;
        let rendered = lease.key.to_string();
        if held.get(&rendered).is_some_and(|(token, _)| *token == lease.token) {
            held.remove(&rendered);
        }
        Ok(())
    }
}

pub struct MockPdfRenderer;

#[async_trait]
impl PdfRenderer for MockPdfRenderer {
    async fn render_pdf(&self, url: &str, _selector: &str, _layout: &PageLayout) -> CoreResult<Vec<u8>> {
        Ok(format!("%PDF-1.4\n% {}\n", url).into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub acl: ObjectAcl,
}

#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: Mutex<Vec<StoredObject>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        acl: ObjectAcl,
    ) -> CoreResult<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|e| CoreError::DocumentError(e.to_string()))?;
        objects.push(StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            bytes,
            content_type: content_type.to_string(),
            acl,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

/// Keeps published events in memory; can be told to fail every publish.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<PublishedEvent>>,
    failing: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.topic).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> CoreResult<()> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(CoreError::PublishError(format!("broker unavailable for {}", topic)));
        }
        let mut events = self
            .events
            .lock()
            .map_err(|e| CoreError::PublishError(e.to_string()))?;
        events.push(PublishedEvent {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
