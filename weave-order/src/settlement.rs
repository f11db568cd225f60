use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use weave_core::events::EventPublisher;
use weave_core::identity::Actor;
use weave_core::lock::{LockKey, Locker, SETTLEMENT_LOCK_TTL};
use weave_core::orders::{BulkPurchaseOrder, Milestone, PurchaseOrder, PurchaseOrderStatus};
use weave_core::repository::{ChangeSet, OrderRepository, TransactionUpdate};
use weave_core::transaction::{PaymentTransaction, TransactionStatus};
use weave_shared::models::events::{
    PaymentRejectedEvent, PaymentSettledEvent, TOPIC_PAYMENT_REJECTED, TOPIC_PAYMENT_SETTLED,
};

use crate::error::{OrderError, OrderResult};
use crate::events::publish;
use crate::locking::with_lock;

/// Marks a sample order paid and releases the cart items stamped by `session_id`
/// from the awaiting-checkout queue.
pub(crate) fn mark_purchase_order_paid(po: &mut PurchaseOrder, session_id: &str, now: DateTime<Utc>) {
    po.status = PurchaseOrderStatus::Paid;
    po.mark_as_paid_at = Some(now);
    po.apply_lead_time(now);
    for item in po
        .cart_items
        .iter_mut()
        .filter(|i| i.checkout_session_id.as_deref() == Some(session_id))
    {
        item.waiting_for_checkout = false;
        item.updated_at = now;
    }
    po.touch(now);
}

pub(crate) fn mark_bulk_milestone_paid(
    bulk: &mut BulkPurchaseOrder,
    milestone: Milestone,
    session_id: &str,
    now: DateTime<Utc>,
) {
    if bulk.tracking_status == milestone.payable_status() || bulk.tracking_status == milestone.confirm_status() {
        bulk.tracking_status = milestone.confirmed_status();
    }
    bulk.milestone_mut(milestone).mark_as_paid_at = Some(now);
    if milestone == Milestone::First {
        bulk.apply_lead_time(now);
    }
    for item in bulk
        .cart_items
        .iter_mut()
        .filter(|i| i.checkout_session_id.as_deref() == Some(session_id))
    {
        item.waiting_for_checkout = false;
        item.updated_at = now;
    }
    bulk.touch(now);
}

pub(crate) fn settled_event(tx: &PaymentTransaction, now: DateTime<Utc>) -> PaymentSettledEvent {
    PaymentSettledEvent {
        transaction_id: tx.id,
        checkout_session_id: tx.checkout_session_id.clone(),
        user_id: tx.user_id,
        purchase_order_ids: tx.purchase_order_ids.clone(),
        bulk_purchase_order_ids: tx.bulk_purchase_order_ids(),
        total_amount: tx.total_amount,
        currency: tx.currency,
        timestamp: now.timestamp(),
    }
}

fn ensure_awaiting_review(bulk: &BulkPurchaseOrder, milestone: Milestone, transaction_id: Uuid) -> OrderResult<()> {
    if bulk.tracking_status != milestone.confirm_status() {
        return Err(OrderError::TransactionInvalid(transaction_id));
    }
    Ok(())
}

/// Staff review of bank-transfer transactions.
pub struct SettlementService {
    repo: Arc<dyn OrderRepository>,
    locker: Arc<dyn Locker>,
    publisher: Arc<dyn EventPublisher>,
}

impl SettlementService {
    pub fn new(repo: Arc<dyn OrderRepository>, locker: Arc<dyn Locker>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { repo, locker, publisher }
    }

    pub async fn approve(&self, transaction_id: Uuid, actor: &Actor) -> OrderResult<PaymentTransaction> {
        let key = LockKey::payment_transaction(transaction_id);
        let tx = with_lock(self.locker.as_ref(), key, SETTLEMENT_LOCK_TTL, || {
            self.approve_locked(transaction_id)
        })
        .await?;

        info!(transaction_id = %tx.id, approved_by = %actor.user_id, "Payment transaction approved");
        publish(
            self.publisher.as_ref(),
            TOPIC_PAYMENT_SETTLED,
            &tx.id.to_string(),
            &settled_event(&tx, Utc::now()),
        )
        .await;
        Ok(tx)
    }

    pub async fn reject(&self, transaction_id: Uuid, actor: &Actor) -> OrderResult<PaymentTransaction> {
        let key = LockKey::payment_transaction(transaction_id);
        let tx = with_lock(self.locker.as_ref(), key, SETTLEMENT_LOCK_TTL, || {
            self.reject_locked(transaction_id)
        })
        .await?;

        info!(transaction_id = %tx.id, rejected_by = %actor.user_id, "Payment transaction rejected");
        let event = PaymentRejectedEvent {
            transaction_id: tx.id,
            user_id: tx.user_id,
            rejected_by: actor.user_id,
            timestamp: Utc::now().timestamp(),
        };
        publish(self.publisher.as_ref(), TOPIC_PAYMENT_REJECTED, &tx.id.to_string(), &event).await;
        Ok(tx)
    }

    async fn load_pending(&self, transaction_id: Uuid) -> OrderResult<PaymentTransaction> {
        let tx = self
            .repo
            .get_transaction(transaction_id)
            .await?
            .ok_or(OrderError::TransactionNotFound(transaction_id))?;
        if tx.status != TransactionStatus::WaitingConfirm {
            return Err(OrderError::TransactionInvalid(transaction_id));
        }
        Ok(tx)
    }

    async fn load_orders(
        &self,
        tx: &PaymentTransaction,
    ) -> OrderResult<(Vec<PurchaseOrder>, Vec<(BulkPurchaseOrder, Milestone)>)> {
        let mut purchase_orders = Vec::with_capacity(tx.purchase_order_ids.len());
        for id in &tx.purchase_order_ids {
            let po = self
                .repo
                .get_purchase_order(*id)
                .await?
                .ok_or(OrderError::PurchaseOrderNotFound(*id))?;
            purchase_orders.push(po);
        }

        let mut bulk_orders = Vec::with_capacity(tx.bulk_purchase_orders.len());
        for r in &tx.bulk_purchase_orders {
            let bulk = self
                .repo
                .get_bulk_order(r.bulk_purchase_order_id)
                .await?
                .ok_or(OrderError::BulkOrderNotFound(r.bulk_purchase_order_id))?;
            bulk_orders.push((bulk, r.milestone));
        }
        Ok((purchase_orders, bulk_orders))
    }

    async fn approve_locked(&self, transaction_id: Uuid) -> OrderResult<PaymentTransaction> {
        let mut tx = self.load_pending(transaction_id).await?;
        let (purchase_orders, bulk_orders) = self.load_orders(&tx).await?;
        let now = Utc::now();
        let session_id = tx.checkout_session_id.clone();

        let mut changes = ChangeSet::new();
        for mut po in purchase_orders {
            match po.status {
                PurchaseOrderStatus::WaitingConfirm => {}
                // Settled one by one by staff already.
                PurchaseOrderStatus::Paid => continue,
                _ => return Err(OrderError::TransactionInvalid(transaction_id)),
            }
            changes.expect_purchase_order(&po);
            mark_purchase_order_paid(&mut po, &session_id, now);
            if let Some(inquiry_id) = po.inquiry_id {
                changes.finished_inquiries.push(inquiry_id);
            }
            changes.update_purchase_order(po);
        }
        for (mut bulk, milestone) in bulk_orders {
            ensure_awaiting_review(&bulk, milestone, transaction_id)?;
            changes.expect_bulk_order(&bulk);
            mark_bulk_milestone_paid(&mut bulk, milestone, &session_id, now);
            if let Some(inquiry_id) = bulk.inquiry_id {
                changes.finished_inquiries.push(inquiry_id);
            }
            changes.update_bulk_order(bulk);
        }

        tx.mark_paid(now);
        changes.updated_transactions.push(TransactionUpdate {
            transaction: tx.clone(),
            expected_status: TransactionStatus::WaitingConfirm,
        });
        self.repo.commit(changes).await?;
        Ok(tx)
    }

    async fn reject_locked(&self, transaction_id: Uuid) -> OrderResult<PaymentTransaction> {
        let mut tx = self.load_pending(transaction_id).await?;
        let (purchase_orders, bulk_orders) = self.load_orders(&tx).await?;
        let now = Utc::now();
        let session_id = Some(tx.checkout_session_id.as_str());

        let mut changes = ChangeSet::new();
        for mut po in purchase_orders {
            if po.status != PurchaseOrderStatus::WaitingConfirm {
                return Err(OrderError::TransactionInvalid(transaction_id));
            }
            changes.expect_purchase_order(&po);
            po.status = PurchaseOrderStatus::Unpaid;
            po.mark_as_unpaid_at = Some(now);
            for item in po.cart_items.iter_mut().filter(|i| i.checkout_session_id.as_deref() == session_id) {
                item.checkout_session_id = None;
                item.waiting_for_checkout = true;
                item.updated_at = now;
            }
            po.touch(now);
            changes.update_purchase_order(po);
        }
        for (mut bulk, milestone) in bulk_orders {
            ensure_awaiting_review(&bulk, milestone, transaction_id)?;
            changes.expect_bulk_order(&bulk);
            bulk.tracking_status = milestone.payable_status();
            bulk.milestone_mut(milestone).mark_as_unpaid_at = Some(now);
            for item in bulk.cart_items.iter_mut().filter(|i| i.checkout_session_id.as_deref() == session_id) {
                item.checkout_session_id = None;
                item.waiting_for_checkout = true;
                item.updated_at = now;
            }
            bulk.touch(now);
            changes.update_bulk_order(bulk);
        }

        tx.mark_unpaid(now);
        changes.updated_transactions.push(TransactionUpdate {
            transaction: tx.clone(),
            expected_status: TransactionStatus::WaitingConfirm,
        });
        self.repo.commit(changes).await?;
        Ok(tx)
    }
}
