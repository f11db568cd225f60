use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use weave_core::events::EventPublisher;
use weave_core::identity::Actor;
use weave_core::lock::{LockKey, Locker, BULK_FROM_SAMPLE_LOCK_TTL, PURCHASE_ORDER_LOCK_TTL};
use weave_core::orders::{BulkPurchaseOrder, ItemOwner, OrderCartItem, PurchaseOrder, PurchaseOrderStatus};
use weave_core::payment::PaymentGateway;
use weave_core::repository::{ChangeSet, OrderRepository, TransactionUpdate};
use weave_core::tracking::{
    BulkTrackingStatus, OrderKind, PoTrackingAction, PoTrackingStatus, SellerTrackingStatus, TrackingMetadata,
    TrackingRecord,
};
use weave_core::transaction::{PaymentTransaction, TransactionStatus};
use weave_shared::ids;
use weave_shared::models::events::{OrderRefundedEvent, TOPIC_ORDER_REFUNDED, TOPIC_PAYMENT_SETTLED};

use crate::error::{OrderError, OrderResult};
use crate::events::publish;
use crate::locking::with_lock;
use crate::settlement::{mark_purchase_order_paid, settled_event};

fn audit(
    po: &PurchaseOrder,
    action: PoTrackingAction,
    actor: &Actor,
    before: serde_json::Value,
    after: serde_json::Value,
) -> TrackingRecord {
    TrackingRecord::new(
        OrderKind::PurchaseOrder,
        po.id,
        action.as_str(),
        po.user_id,
        actor.user_id,
        TrackingMetadata { before, after },
    )
}

/// Staff-only corrections on sample orders.
pub struct AdminService {
    repo: Arc<dyn OrderRepository>,
    locker: Arc<dyn Locker>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
}

impl AdminService {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        locker: Arc<dyn Locker>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { repo, locker, gateway, publisher }
    }

    async fn load(&self, purchase_order_id: Uuid) -> OrderResult<PurchaseOrder> {
        self.repo
            .get_purchase_order(purchase_order_id)
            .await?
            .ok_or(OrderError::PurchaseOrderNotFound(purchase_order_id))
    }

    /// Whether every order `tx` covers, other than `except`, is already paid.
    async fn others_settled(&self, tx: &PaymentTransaction, except: Uuid) -> OrderResult<bool> {
        for id in tx.purchase_order_ids.iter().filter(|id| **id != except) {
            let paid = self
                .repo
                .get_purchase_order(*id)
                .await?
                .is_some_and(|po| po.status == PurchaseOrderStatus::Paid);
            if !paid {
                return Ok(false);
            }
        }
        for r in &tx.bulk_purchase_orders {
            let paid = self
                .repo
                .get_bulk_order(r.bulk_purchase_order_id)
                .await?
                .is_some_and(|bulk| bulk.milestone(r.milestone).mark_as_paid_at.is_some());
            if !paid {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn ensure_staff(actor: &Actor, action: &str) -> OrderResult<()> {
        if actor.is_staff() {
            Ok(())
        } else {
            Err(OrderError::Forbidden(action.to_string()))
        }
    }

    pub async fn refund(
        &self,
        purchase_order_id: Uuid,
        actor: &Actor,
        reason: Option<String>,
    ) -> OrderResult<PurchaseOrder> {
        Self::ensure_staff(actor, "refund")?;
        let po = with_lock(
            self.locker.as_ref(),
            LockKey::purchase_order(purchase_order_id),
            PURCHASE_ORDER_LOCK_TTL,
            || self.refund_locked(purchase_order_id, actor, reason),
        )
        .await?;

        let event = OrderRefundedEvent {
            purchase_order_id: po.id,
            payment_intent_id: po.payment_intent_id.clone().unwrap_or_default(),
            reason: po.refund_reason.clone(),
            refunded_by: actor.user_id,
            timestamp: Utc::now().timestamp(),
        };
        publish(self.publisher.as_ref(), TOPIC_ORDER_REFUNDED, &po.id.to_string(), &event).await;
        Ok(po)
    }

    async fn refund_locked(
        &self,
        purchase_order_id: Uuid,
        actor: &Actor,
        reason: Option<String>,
    ) -> OrderResult<PurchaseOrder> {
        let mut po = self.load(purchase_order_id).await?;
        let intent_id = match (&po.status, &po.tracking_status, &po.payment_intent_id) {
            (PurchaseOrderStatus::Paid, PoTrackingStatus::New, Some(intent_id)) => intent_id.clone(),
            _ => return Err(OrderError::PoInvalidToRefund(po.id)),
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("purchase_order_id".to_string(), po.id.to_string());
        metadata.insert("refunded_by".to_string(), actor.user_id.to_string());
        if let Some(reason) = &reason {
            metadata.insert("reason".to_string(), reason.clone());
        }
        self.gateway.refund_payment_intent(&intent_id, metadata).await?;

        let now = Utc::now();
        let before = json!({ "status": po.status, "tracking_status": po.tracking_status });
        po.status = PurchaseOrderStatus::Canceled;
        po.tracking_status = PoTrackingStatus::Canceled;
        po.seller_tracking_status = SellerTrackingStatus::Canceled;
        po.refund_reason = reason.clone();
        po.touch(now);
        let after = json!({ "status": po.status, "tracking_status": po.tracking_status, "reason": reason });

        let mut changes = ChangeSet::new();
        if let Some(mut tx) = self.repo.find_transaction_by_intent(&intent_id).await? {
            let expected_status = tx.status;
            tx.status = TransactionStatus::Refunded;
            tx.refund_reason = reason.clone();
            tx.updated_at = now;
            if let Some(invoice) = self.repo.find_invoice_for_transaction(tx.id).await? {
                changes.voided_invoices.push(invoice.invoice_number);
            }
            changes.updated_transactions.push(TransactionUpdate { transaction: tx, expected_status });
        }
        if let Some(number) = po.invoice_number {
            if !changes.voided_invoices.contains(&number) {
                changes.voided_invoices.push(number);
            }
        }
        changes.tracking_records.push(audit(&po, PoTrackingAction::Refund, actor, before, after));
        changes.purchase_orders.push(po.clone());

        // The gateway has already refunded at this point.
        if let Err(e) = self.repo.commit(changes).await {
            warn!(
                purchase_order_id = %po.id,
                payment_intent_id = %intent_id,
                "Refund issued but not recorded: {}",
                e
            );
            return Err(e.into());
        }

        info!(
            purchase_order_id = %po.id,
            payment_intent_id = %intent_id,
            refunded_by = %actor.user_id,
            "Purchase order refunded"
        );
        Ok(po)
    }

    pub async fn archive(&self, purchase_order_id: Uuid, actor: &Actor) -> OrderResult<PurchaseOrder> {
        Self::ensure_staff(actor, "archive")?;
        let mut po = self.load(purchase_order_id).await?;
        if po.tracking_status != PoTrackingStatus::New {
            return Err(OrderError::PoInvalidToArchive(po.id));
        }
        let now = Utc::now();
        po.archived_at.get_or_insert(now);
        po.touch(now);

        let mut changes = ChangeSet::new();
        changes.purchase_orders.push(po.clone());
        self.repo.commit(changes).await?;
        info!(purchase_order_id = %po.id, archived_by = %actor.user_id, "Purchase order archived");
        Ok(po)
    }

    pub async fn unarchive(&self, purchase_order_id: Uuid, actor: &Actor) -> OrderResult<PurchaseOrder> {
        Self::ensure_staff(actor, "unarchive")?;
        let mut po = self.load(purchase_order_id).await?;
        po.archived_at = None;
        po.touch(Utc::now());

        let mut changes = ChangeSet::new();
        changes.purchase_orders.push(po.clone());
        self.repo.commit(changes).await?;
        info!(purchase_order_id = %po.id, "Purchase order unarchived");
        Ok(po)
    }

    pub async fn mark_paid(&self, purchase_order_id: Uuid, actor: &Actor) -> OrderResult<PurchaseOrder> {
        Self::ensure_staff(actor, "mark_paid")?;
        let (po, settled) = with_lock(
            self.locker.as_ref(),
            LockKey::purchase_order(purchase_order_id),
            PURCHASE_ORDER_LOCK_TTL,
            || self.mark_paid_locked(purchase_order_id, actor),
        )
        .await?;

        if let Some(tx) = settled {
            publish(
                self.publisher.as_ref(),
                TOPIC_PAYMENT_SETTLED,
                &tx.id.to_string(),
                &settled_event(&tx, Utc::now()),
            )
            .await;
        }
        Ok(po)
    }

    async fn mark_paid_locked(
        &self,
        purchase_order_id: Uuid,
        actor: &Actor,
    ) -> OrderResult<(PurchaseOrder, Option<PaymentTransaction>)> {
        let mut po = self.load(purchase_order_id).await?;
        if !matches!(po.status, PurchaseOrderStatus::WaitingConfirm | PurchaseOrderStatus::Unpaid) {
            return Err(OrderError::PoInvalidToMarkPaid(po.id));
        }

        let mut changes = ChangeSet::new();
        changes.expect_purchase_order(&po);
        let now = Utc::now();
        let before = json!({ "status": po.status });
        let session_id = match po.checkout_session_id.clone() {
            Some(session_id) => session_id,
            None => {
                let session_id = ids::checkout_session_id();
                po.checkout_session_id = Some(session_id.clone());
                session_id
            }
        };
        for item in po.cart_items.iter_mut().filter(|i| !i.is_checked_out()) {
            item.stamp_checkout(&session_id, now);
        }
        mark_purchase_order_paid(&mut po, &session_id, now);

        if let Some(inquiry_id) = po.inquiry_id {
            changes.finished_inquiries.push(inquiry_id);
        }
        // A transaction covering several orders settles with the last of them.
        let mut settled = None;
        if let Some(mut tx) = self.repo.find_transaction_by_session(&session_id).await? {
            if tx.status != TransactionStatus::Paid && self.others_settled(&tx, po.id).await? {
                let expected_status = tx.status;
                tx.mark_paid(now);
                changes.updated_transactions.push(TransactionUpdate { transaction: tx.clone(), expected_status });
                settled = Some(tx);
            }
        }
        changes.tracking_records.push(audit(
            &po,
            PoTrackingAction::MarkPaid,
            actor,
            before,
            json!({ "status": po.status }),
        ));
        changes.update_purchase_order(po.clone());
        self.repo.commit(changes).await?;

        info!(purchase_order_id = %po.id, marked_by = %actor.user_id, "Purchase order marked as paid");
        Ok((po, settled))
    }

    pub async fn mark_unpaid(&self, purchase_order_id: Uuid, actor: &Actor) -> OrderResult<PurchaseOrder> {
        Self::ensure_staff(actor, "mark_unpaid")?;
        with_lock(
            self.locker.as_ref(),
            LockKey::purchase_order(purchase_order_id),
            PURCHASE_ORDER_LOCK_TTL,
            || async move {
                let mut po = self.load(purchase_order_id).await?;
                if po.status != PurchaseOrderStatus::WaitingConfirm {
                    return Err(OrderError::PoInvalidToMarkUnpaid(po.id));
                }
                let now = Utc::now();
                let mut changes = ChangeSet::new();
                changes.expect_purchase_order(&po);
                let before = json!({ "status": po.status });
                po.status = PurchaseOrderStatus::Unpaid;
                po.mark_as_unpaid_at = Some(now);
                po.touch(now);

                // A transfer staff marked unpaid can no longer be approved.
                if let Some(session_id) = po.checkout_session_id.as_deref() {
                    if let Some(mut tx) = self.repo.find_transaction_by_session(session_id).await? {
                        if tx.status == TransactionStatus::WaitingConfirm {
                            tx.mark_unpaid(now);
                            changes.updated_transactions.push(TransactionUpdate {
                                transaction: tx,
                                expected_status: TransactionStatus::WaitingConfirm,
                            });
                        }
                    }
                }
                changes.tracking_records.push(audit(
                    &po,
                    PoTrackingAction::MarkUnpaid,
                    actor,
                    before,
                    json!({ "status": po.status }),
                ));
                changes.purchase_orders.push(po.clone());
                self.repo.commit(changes).await?;

                info!(purchase_order_id = %po.id, marked_by = %actor.user_id, "Purchase order marked as unpaid");
                Ok(po)
            },
        )
        .await
    }

    /// Opens a bulk order for a delivered sample, copying its cart lines.
    pub async fn create_bulk_from_sample(
        &self,
        purchase_order_id: Uuid,
        actor: &Actor,
    ) -> OrderResult<BulkPurchaseOrder> {
        Self::ensure_staff(actor, "create_bulk_order")?;
        with_lock(
            self.locker.as_ref(),
            LockKey::bulk_from_sample(purchase_order_id),
            BULK_FROM_SAMPLE_LOCK_TTL,
            || self.create_bulk_locked(purchase_order_id, actor),
        )
        .await
    }

    async fn create_bulk_locked(&self, purchase_order_id: Uuid, actor: &Actor) -> OrderResult<BulkPurchaseOrder> {
        let po = self.load(purchase_order_id).await?;
        if po.tracking_status != PoTrackingStatus::DeliveryConfirmed {
            return Err(OrderError::PoInvalidToCreateBulk(po.id));
        }
        if !self.repo.find_bulk_orders_for_sample(po.id).await?.is_empty() {
            return Err(OrderError::Conflict(format!("bulk order already created from {}", po.reference_id)));
        }

        let mut bulk = BulkPurchaseOrder::new(po.user_id, po.currency);
        let bulk_id = bulk.id;
        bulk.inquiry_id = po.inquiry_id;
        bulk.purchase_order_id = Some(po.id);
        bulk.tracking_status = BulkTrackingStatus::WaitingForQuotation;
        bulk.tax_percentage = po.tax_percentage;
        bulk.shipping_fee = po.shipping_fee;
        bulk.cart_items = po
            .cart_items
            .iter()
            .map(|source| {
                let mut item = OrderCartItem::new(ItemOwner::BulkPurchaseOrder(bulk_id), source.unit_price, source.qty);
                item.style = source.style.clone();
                item.size = source.size.clone();
                item.color = source.color.clone();
                item
            })
            .collect();

        let mut changes = ChangeSet::new();
        changes.new_cart_items.extend(bulk.cart_items.iter().cloned());
        changes.new_bulk_orders.push(bulk.clone());
        changes.tracking_records.push(audit(
            &po,
            PoTrackingAction::CreateBulkOrder,
            actor,
            json!({}),
            json!({ "bulk_purchase_order_id": bulk.id, "reference_id": bulk.reference_id }),
        ));
        self.repo.commit(changes).await?;

        info!(
            purchase_order_id = %po.id,
            bulk_purchase_order_id = %bulk.id,
            items = bulk.cart_items.len(),
            "Bulk purchase order created from sample"
        );
        Ok(bulk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::tests::seed_sample;
    use crate::cart::{CartAggregator, CheckoutSelection};
    use crate::memory::{InMemoryOrderRepository, InProcessLocker, RecordingPublisher};
    use crate::orchestrator::{CheckoutOrchestrator, CheckoutRequest, MockOutcome, MockPaymentGateway};
    use crate::pricing::FeeSchedule;
    use crate::settlement::SettlementService;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use weave_core::orders::{Attachment, InquiryStatus, PaymentType};
    use weave_core::transaction::Invoice;
    use weave_shared::Currency;

    struct Harness {
        repo: Arc<InMemoryOrderRepository>,
        gateway: Arc<MockPaymentGateway>,
        publisher: Arc<RecordingPublisher>,
        orchestrator: CheckoutOrchestrator,
        admin: AdminService,
        settlement: SettlementService,
        staff: Actor,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let gateway = Arc::new(MockPaymentGateway::default());
        let publisher = Arc::new(RecordingPublisher::new());
        let locker = Arc::new(InProcessLocker::new(Duration::from_millis(100)));
        let aggregator = Arc::new(CartAggregator::new(repo.clone(), FeeSchedule::new()));
        let orchestrator = CheckoutOrchestrator::new(
            aggregator,
            repo.clone(),
            gateway.clone(),
            publisher.clone(),
            "https://weave.test/v1",
        );
        let admin = AdminService::new(repo.clone(), locker.clone(), gateway.clone(), publisher.clone());
        let settlement = SettlementService::new(repo.clone(), locker, publisher.clone());
        Harness {
            repo,
            gateway,
            publisher,
            orchestrator,
            admin,
            settlement,
            staff: Actor::admin(Uuid::new_v4()),
        }
    }

    fn request(item_id: Uuid, payment_type: PaymentType) -> CheckoutRequest {
        CheckoutRequest {
            selection: CheckoutSelection { cart_item_ids: vec![item_id], bulk_purchase_order_ids: vec![] },
            payment_type,
            transaction_ref_id: Some("TCB-55".to_string()),
            transaction_attachment: Some(Attachment::new("receipts/55.png")),
        }
    }

    #[tokio::test]
    async fn test_refund_cancels_order_and_transaction() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let outcome = h.orchestrator.checkout(buyer, request(item_id, PaymentType::Card)).await.unwrap();
        let tx = outcome.transaction().unwrap().clone();

        let po = h.admin.refund(po_id, &h.staff, Some("buyer cancelled".into())).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Canceled);
        assert_eq!(po.tracking_status, PoTrackingStatus::Canceled);
        assert_eq!(po.refund_reason.as_deref(), Some("buyer cancelled"));
        assert_eq!(h.gateway.refunds(), vec![tx.payment_intent_id.clone().unwrap()]);

        let stored = h.repo.transactions().await.into_iter().find(|t| t.id == tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Refunded);
        assert!(h.publisher.topics().contains(&TOPIC_ORDER_REFUNDED.to_string()));
        let records = h.repo.tracking_records().await;
        assert_eq!(records.last().unwrap().action_type, "refund");
    }

    #[tokio::test]
    async fn test_refund_voids_invoice() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let tx = h
            .orchestrator
            .checkout(buyer, request(item_id, PaymentType::Card))
            .await
            .unwrap()
            .transaction()
            .unwrap()
            .clone();
        let mut changes = ChangeSet::new();
        changes.new_invoices.push(Invoice {
            invoice_number: 1,
            payment_transaction_id: Some(tx.id),
            purchase_order_id: Some(po_id),
            currency: Currency::USD,
            total_amount: tx.total_amount,
            attachment: None,
            voided_at: None,
            created_at: Utc::now(),
        });
        h.repo.commit(changes).await.unwrap();

        h.admin.refund(po_id, &h.staff, None).await.unwrap();
        assert!(h.repo.invoices().await[0].voided_at.is_some());
    }

    #[tokio::test]
    async fn test_refund_requires_paid_card_order() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        h.orchestrator.checkout(buyer, request(item_id, PaymentType::BankTransfer)).await.unwrap();

        let result = h.admin.refund(po_id, &h.staff, None).await;
        assert!(matches!(result, Err(OrderError::PoInvalidToRefund(id)) if id == po_id));
        assert!(h.gateway.refunds().is_empty());
    }

    #[tokio::test]
    async fn test_refund_gateway_failure_changes_nothing() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        h.orchestrator.checkout(buyer, request(item_id, PaymentType::Card)).await.unwrap();
        h.gateway.set_outcome(MockOutcome::Unavailable);

        let result = h.admin.refund(po_id, &h.staff, None).await;
        assert!(matches!(result, Err(OrderError::Gateway(_))));
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_archive_hides_order_from_checkout() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;

        h.admin.archive(po_id, &h.staff).await.unwrap();
        let result = h.orchestrator.checkout(buyer, request(item_id, PaymentType::Card)).await;
        assert!(result.is_err());

        h.admin.unarchive(po_id, &h.staff).await.unwrap();
        assert!(h.repo.purchase_order(po_id).await.unwrap().archived_at.is_none());
        h.orchestrator.checkout(buyer, request(item_id, PaymentType::Card)).await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_requires_new_tracking() {
        let h = harness();
        let mut po = PurchaseOrder::new(Uuid::new_v4(), Currency::USD);
        po.tracking_status = PoTrackingStatus::Making;
        let id = po.id;
        h.repo.insert_purchase_order(po).await;

        let result = h.admin.archive(id, &h.staff).await;
        assert!(matches!(result, Err(OrderError::PoInvalidToArchive(_))));
    }

    #[tokio::test]
    async fn test_admin_actions_require_staff() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, _, _) = seed_sample(&h.repo, buyer).await;
        let result = h.admin.mark_paid(po_id, &Actor::buyer(buyer)).await;
        assert!(matches!(result, Err(OrderError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_mark_paid_settles_waiting_order_and_transaction() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, inquiry_id) = seed_sample(&h.repo, buyer).await;
        let tx = h
            .orchestrator
            .checkout(buyer, request(item_id, PaymentType::BankTransfer))
            .await
            .unwrap()
            .transaction()
            .unwrap()
            .clone();

        let po = h.admin.mark_paid(po_id, &h.staff).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Paid);
        assert!(po.mark_as_paid_at.is_some());
        assert_eq!(po.lead_time, Some(10));
        assert_eq!(h.repo.inquiry(inquiry_id).await.unwrap().status, InquiryStatus::Finished);

        let stored = h.repo.transactions().await.into_iter().find(|t| t.id == tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Paid);
        assert_eq!(stored.paid_amount, dec!(115.00));
        assert!(h.publisher.topics().contains(&TOPIC_PAYMENT_SETTLED.to_string()));

        let again = h.admin.mark_paid(po_id, &h.staff).await;
        assert!(matches!(again, Err(OrderError::PoInvalidToMarkPaid(_))));
    }

    #[tokio::test]
    async fn test_mark_unpaid_then_paid() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        h.orchestrator.checkout(buyer, request(item_id, PaymentType::BankTransfer)).await.unwrap();

        let po = h.admin.mark_unpaid(po_id, &h.staff).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Unpaid);
        assert!(po.mark_as_unpaid_at.is_some());
        let twice = h.admin.mark_unpaid(po_id, &h.staff).await;
        assert!(matches!(twice, Err(OrderError::PoInvalidToMarkUnpaid(_))));

        let po = h.admin.mark_paid(po_id, &h.staff).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Paid);
        let actions: Vec<_> = h.repo.tracking_records().await.into_iter().map(|r| r.action_type).collect();
        assert_eq!(actions, vec!["mark_unpaid".to_string(), "mark_paid".to_string()]);
    }

    #[tokio::test]
    async fn test_mark_unpaid_closes_transaction_for_approval() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let tx = h
            .orchestrator
            .checkout(buyer, request(item_id, PaymentType::BankTransfer))
            .await
            .unwrap()
            .transaction()
            .unwrap()
            .clone();

        h.admin.mark_unpaid(po_id, &h.staff).await.unwrap();
        let stored = h.repo.transactions().await.into_iter().find(|t| t.id == tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Unpaid);

        let approve = h.settlement.approve(tx.id, &h.staff).await;
        assert!(matches!(approve, Err(OrderError::TransactionInvalid(id)) if id == tx.id));
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Unpaid);
        assert!(!h.publisher.topics().contains(&TOPIC_PAYMENT_SETTLED.to_string()));
    }

    #[tokio::test]
    async fn test_mark_paid_one_of_several_orders_leaves_rest_to_approval() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (first_po, first_item, _) = seed_sample(&h.repo, buyer).await;
        let (second_po, second_item, _) = seed_sample(&h.repo, buyer).await;
        let mut both = request(first_item, PaymentType::BankTransfer);
        both.selection.cart_item_ids.push(second_item);
        let tx = h
            .orchestrator
            .checkout(buyer, both)
            .await
            .unwrap()
            .transaction()
            .unwrap()
            .clone();
        assert_eq!(tx.purchase_order_ids.len(), 2);

        h.admin.mark_paid(first_po, &h.staff).await.unwrap();
        let stored = h.repo.transactions().await.into_iter().find(|t| t.id == tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::WaitingConfirm);
        assert!(h.publisher.topics().iter().all(|t| t != TOPIC_PAYMENT_SETTLED));

        let approved = h.settlement.approve(tx.id, &h.staff).await.unwrap();
        assert_eq!(approved.status, TransactionStatus::Paid);
        assert_eq!(h.repo.purchase_order(first_po).await.unwrap().status, PurchaseOrderStatus::Paid);
        assert_eq!(h.repo.purchase_order(second_po).await.unwrap().status, PurchaseOrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_mark_paid_last_open_order_settles_transaction() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (first_po, first_item, _) = seed_sample(&h.repo, buyer).await;
        let (second_po, second_item, _) = seed_sample(&h.repo, buyer).await;
        let mut both = request(first_item, PaymentType::BankTransfer);
        both.selection.cart_item_ids.push(second_item);
        let tx = h
            .orchestrator
            .checkout(buyer, both)
            .await
            .unwrap()
            .transaction()
            .unwrap()
            .clone();

        h.admin.mark_paid(first_po, &h.staff).await.unwrap();
        h.admin.mark_paid(second_po, &h.staff).await.unwrap();
        let stored = h.repo.transactions().await.into_iter().find(|t| t.id == tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Paid);
        assert_eq!(stored.paid_amount, dec!(230.00));
    }

    #[tokio::test]
    async fn test_create_bulk_from_delivered_sample() {
        let h = harness();
        let mut po = PurchaseOrder::new(Uuid::new_v4(), Currency::EUR);
        po.inquiry_id = Some(Uuid::new_v4());
        po.status = PurchaseOrderStatus::Paid;
        po.tracking_status = PoTrackingStatus::DeliveryConfirmed;
        po.add_item(dec!(12.50), 4);
        let source_item = po.cart_items[0].id;
        let po_id = po.id;
        h.repo.insert_purchase_order(po).await;

        let bulk = h.admin.create_bulk_from_sample(po_id, &h.staff).await.unwrap();
        assert_eq!(bulk.tracking_status, BulkTrackingStatus::WaitingForQuotation);
        assert_eq!(bulk.currency, Currency::EUR);
        assert_eq!(bulk.purchase_order_id, Some(po_id));

        let stored = h.repo.bulk_order(bulk.id).await.unwrap();
        assert_eq!(stored.cart_items.len(), 1);
        assert_ne!(stored.cart_items[0].id, source_item);
        assert_eq!(stored.cart_items[0].qty, 4);
        assert!(!stored.cart_items[0].is_checked_out());
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().cart_items.len(), 1);

        let again = h.admin.create_bulk_from_sample(po_id, &h.staff).await;
        assert!(matches!(again, Err(OrderError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_create_bulk_requires_delivery_confirmed() {
        let h = harness();
        let buyer = Uuid::new_v4();
        let (po_id, _, _) = seed_sample(&h.repo, buyer).await;
        let result = h.admin.create_bulk_from_sample(po_id, &h.staff).await;
        assert!(matches!(result, Err(OrderError::PoInvalidToCreateBulk(_))));
    }
}
