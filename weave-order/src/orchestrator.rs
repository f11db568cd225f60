use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;
use weave_core::events::EventPublisher;
use weave_core::identity::Actor;
use weave_core::orders::{Attachment, BulkPurchaseOrder, Milestone, PaymentType, PurchaseOrder, PurchaseOrderStatus};
use weave_core::payment::{
    CreateIntentParams, CreatePaymentLinkParams, IntentStatus, NextAction, PaymentGateway, PaymentIntent,
    PaymentLink,
};
use weave_core::repository::{ChangeSet, OrderRepository};
use weave_core::transaction::{BulkMilestoneRef, PaymentTransaction, TransactionStatus};
use weave_core::{CoreError, CoreResult};
use weave_shared::models::events::{
    PaymentSubmittedEvent, TOPIC_PAYMENT_SETTLED, TOPIC_PAYMENT_SUBMITTED,
};
use weave_shared::{ids, Masked};

use crate::cart::{CartAggregator, CheckoutSelection, Quote};
use crate::error::{OrderError, OrderResult};
use crate::events::publish;
use crate::settlement::{mark_bulk_milestone_paid, mark_purchase_order_paid, settled_event};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    #[serde(flatten)]
    pub selection: CheckoutSelection,
    pub payment_type: PaymentType,
    /// Bank transfer reference supplied by the buyer.
    pub transaction_ref_id: Option<String>,
    pub transaction_attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutOutcome {
    WaitingConfirm {
        transaction: PaymentTransaction,
    },
    Paid {
        transaction: PaymentTransaction,
    },
    /// Nothing was persisted; the client finishes authentication and then hits the confirm callback.
    RequiresAction {
        checkout_session_id: String,
        payment_intent_id: String,
        client_secret: Option<Masked<String>>,
        next_action: Option<NextAction>,
    },
}

impl CheckoutOutcome {
    pub fn transaction(&self) -> Option<&PaymentTransaction> {
        match self {
            CheckoutOutcome::WaitingConfirm { transaction } | CheckoutOutcome::Paid { transaction } => {
                Some(transaction)
            }
            CheckoutOutcome::RequiresAction { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutInfo {
    pub transaction: PaymentTransaction,
    pub purchase_orders: Vec<PurchaseOrder>,
    pub bulk_purchase_orders: Vec<BulkPurchaseOrder>,
}

pub struct CheckoutOrchestrator {
    aggregator: Arc<CartAggregator>,
    repo: Arc<dyn OrderRepository>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
    callback_base_url: String,
}

impl CheckoutOrchestrator {
    pub fn new(
        aggregator: Arc<CartAggregator>,
        repo: Arc<dyn OrderRepository>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn EventPublisher>,
        callback_base_url: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            repo,
            gateway,
            publisher,
            callback_base_url: callback_base_url.into(),
        }
    }

    pub async fn checkout(&self, user_id: Uuid, request: CheckoutRequest) -> OrderResult<CheckoutOutcome> {
        let payment_type = request.payment_type;
        let quote = self.aggregator.quote(user_id, &request.selection, payment_type).await?;

        match payment_type {
            PaymentType::BankTransfer => self.checkout_bank_transfer(quote, request).await,
            PaymentType::Card => self.checkout_card(quote).await,
        }
    }

    async fn checkout_bank_transfer(&self, quote: Quote, request: CheckoutRequest) -> OrderResult<CheckoutOutcome> {
        let transfer_ref = request
            .transaction_ref_id
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| OrderError::OrderInvalid("bank transfer reference is required".to_string()))?;

        let now = Utc::now();
        let session_id = ids::checkout_session_id();
        let reference_id = ids::payment_transaction_reference_id();
        let attachment = request.transaction_attachment;

        let mut changes = ChangeSet::new();
        let mut transaction = PaymentTransaction::new(
            quote.user_id,
            PaymentType::BankTransfer,
            TransactionStatus::WaitingConfirm,
            quote.total,
            session_id.clone(),
            Some(reference_id.clone()),
        );
        transaction.transaction_ref_id = Some(transfer_ref.clone());
        transaction.attachments = attachment.iter().cloned().collect();

        for mut po in quote.purchase_orders {
            changes.expect_purchase_order(&po);
            po.status = PurchaseOrderStatus::WaitingConfirm;
            po.payment_type = Some(PaymentType::BankTransfer);
            po.transaction_ref_id = Some(transfer_ref.clone());
            po.transaction_attachment = attachment.clone();
            po.transfered_at = Some(now);
            po.checkout_session_id = Some(session_id.clone());
            po.payment_transaction_reference_id = Some(reference_id.clone());
            po.touch(now);
            for item in po.cart_items.iter_mut() {
                item.stamp_checkout(&session_id, now);
            }
            transaction.purchase_order_ids.push(po.id);
            changes.update_purchase_order(po);
        }

        for quoted in quote.bulk_orders {
            let milestone = quoted.milestone;
            let mut bulk = quoted.order;
            changes.expect_bulk_order(&bulk);
            bulk.tracking_status = milestone.confirm_status();
            let payment = bulk.milestone_mut(milestone);
            payment.payment_type = Some(PaymentType::BankTransfer);
            payment.transaction_ref_id = Some(transfer_ref.clone());
            payment.transaction_attachment = attachment.clone();
            payment.transfered_at = Some(now);
            payment.checkout_session_id = Some(session_id.clone());
            payment.transaction_reference_id = Some(reference_id.clone());
            // First and final milestones share the item rows.
            if milestone == Milestone::Final {
                for item in bulk.cart_items.iter_mut() {
                    item.stamp_checkout(&session_id, now);
                }
            }
            bulk.touch(now);
            transaction.bulk_purchase_orders.push(BulkMilestoneRef {
                bulk_purchase_order_id: bulk.id,
                milestone,
            });
            changes.update_bulk_order(bulk);
        }

        changes.new_transaction = Some(transaction.clone());
        self.repo.commit(changes).await?;

        info!(
            transaction_id = %transaction.id,
            checkout_session_id = %session_id,
            total = %transaction.total(),
            "Bank transfer checkout submitted"
        );

        let event = PaymentSubmittedEvent {
            transaction_id: transaction.id,
            checkout_session_id: session_id,
            user_id: transaction.user_id,
            total_amount: transaction.total_amount,
            currency: transaction.currency,
            timestamp: now.timestamp(),
        };
        publish(
            self.publisher.as_ref(),
            TOPIC_PAYMENT_SUBMITTED,
            &transaction.id.to_string(),
            &event,
        )
        .await;

        Ok(CheckoutOutcome::WaitingConfirm { transaction })
    }

    async fn checkout_card(&self, quote: Quote) -> OrderResult<CheckoutOutcome> {
        let session_id = ids::checkout_session_id();
        let amount = quote.total.to_minor_units()?;

        let mut metadata = BTreeMap::new();
        metadata.insert("cart_item_ids".to_string(), join_ids(&quote.cart_item_ids()));
        metadata.insert("bulk_purchase_order_ids".to_string(), join_ids(&quote.bulk_order_ids()));
        metadata.insert("user_id".to_string(), quote.user_id.to_string());
        metadata.insert("checkout_session_id".to_string(), session_id.clone());

        let mut intent = self
            .gateway
            .create_payment_intent(CreateIntentParams {
                amount,
                currency: quote.currency,
                customer: quote.user_id.to_string(),
                metadata,
            })
            .await?;

        if intent.status != IntentStatus::Succeeded && intent.next_action.is_some() {
            let return_url = format!(
                "{}/checkout/{}/confirm",
                self.callback_base_url.trim_end_matches('/'),
                session_id
            );
            intent = self.gateway.confirm_payment_intent(&intent.id, &return_url).await?;
        }

        match intent.status {
            IntentStatus::Succeeded => {
                let transaction = self.settle_card(quote, &session_id, &intent.id).await?;
                Ok(CheckoutOutcome::Paid { transaction })
            }
            IntentStatus::RequiresAction => {
                info!(
                    checkout_session_id = %session_id,
                    payment_intent_id = %intent.id,
                    "Card checkout requires client action"
                );
                Ok(CheckoutOutcome::RequiresAction {
                    checkout_session_id: session_id,
                    payment_intent_id: intent.id,
                    client_secret: intent.client_secret,
                    next_action: intent.next_action,
                })
            }
            other => {
                warn!(payment_intent_id = %intent.id, status = ?other, "Card authorization not completed");
                Err(OrderError::Gateway(format!(
                    "payment intent {} ended in status {:?}",
                    intent.id, other
                )))
            }
        }
    }

    /// Return leg of a card checkout that needed client authentication. The
    /// orders to settle come from the intent's metadata, never from the caller.
    pub async fn confirm_card_checkout(
        &self,
        session_id: &str,
        payment_intent_id: &str,
        user_id: Uuid,
    ) -> OrderResult<PaymentTransaction> {
        if let Some(existing) = self.repo.find_transaction_by_session(session_id).await? {
            if existing.user_id != user_id {
                return Err(OrderError::CheckoutNotFound(session_id.to_string()));
            }
            return Ok(existing);
        }

        let intent = self.gateway.retrieve_payment_intent(payment_intent_id).await?;
        if intent.metadata.get("checkout_session_id").map(String::as_str) != Some(session_id) {
            return Err(OrderError::OrderInvalid(format!(
                "payment intent {} does not belong to checkout {}",
                payment_intent_id, session_id
            )));
        }
        if intent.metadata.get("user_id") != Some(&user_id.to_string()) {
            return Err(OrderError::CheckoutNotFound(session_id.to_string()));
        }
        if intent.status != IntentStatus::Succeeded {
            return Err(OrderError::PaymentNotCompleted(payment_intent_id.to_string()));
        }

        let selection = CheckoutSelection {
            cart_item_ids: metadata_ids(&intent, "cart_item_ids")?,
            bulk_purchase_order_ids: metadata_ids(&intent, "bulk_purchase_order_ids")?,
        };
        let quote = self.aggregator.quote(user_id, &selection, PaymentType::Card).await?;
        let amount = quote.total.to_minor_units()?;
        if amount != intent.amount || quote.currency != intent.currency {
            warn!(
                payment_intent_id = %intent.id,
                intent_amount = intent.amount,
                quoted_amount = amount,
                "Card confirmation does not match the authorized amount"
            );
            return Err(OrderError::OrderInvalid(format!(
                "payment intent {} authorized {} {} but the orders now total {} {}",
                intent.id, intent.amount, intent.currency, amount, quote.currency
            )));
        }
        self.settle_card(quote, session_id, &intent.id).await
    }

    async fn settle_card(&self, quote: Quote, session_id: &str, intent_id: &str) -> OrderResult<PaymentTransaction> {
        let now = Utc::now();
        let (changes, transaction) = card_success_changes(quote, session_id, intent_id, now);
        self.repo.commit(changes).await?;

        info!(
            transaction_id = %transaction.id,
            checkout_session_id = %session_id,
            payment_intent_id = %intent_id,
            total = %transaction.total(),
            "Card checkout settled"
        );

        publish(
            self.publisher.as_ref(),
            TOPIC_PAYMENT_SETTLED,
            &transaction.id.to_string(),
            &settled_event(&transaction, now),
        )
        .await;
        Ok(transaction)
    }

    pub async fn checkout_info(&self, actor: &Actor, session_id: &str) -> OrderResult<CheckoutInfo> {
        let transaction = self
            .repo
            .find_transaction_by_session(session_id)
            .await?
            .filter(|t| actor.is_staff() || t.user_id == actor.user_id)
            .ok_or_else(|| OrderError::CheckoutNotFound(session_id.to_string()))?;
        let orders = self.repo.find_orders_by_session(session_id).await?;

        Ok(CheckoutInfo {
            transaction,
            purchase_orders: orders.purchase_orders,
            bulk_purchase_orders: orders.bulk_orders,
        })
    }
}

fn card_success_changes(
    quote: Quote,
    session_id: &str,
    intent_id: &str,
    now: DateTime<Utc>,
) -> (ChangeSet, PaymentTransaction) {
    let reference_id = ids::payment_transaction_reference_id();
    let mut changes = ChangeSet::new();
    let mut transaction = PaymentTransaction::new(
        quote.user_id,
        PaymentType::Card,
        TransactionStatus::Paid,
        quote.total,
        session_id.to_string(),
        Some(reference_id.clone()),
    );
    transaction.payment_intent_id = Some(intent_id.to_string());

    for mut po in quote.purchase_orders {
        changes.expect_purchase_order(&po);
        po.payment_type = Some(PaymentType::Card);
        po.payment_intent_id = Some(intent_id.to_string());
        po.checkout_session_id = Some(session_id.to_string());
        po.payment_transaction_reference_id = Some(reference_id.clone());
        for item in po.cart_items.iter_mut() {
            item.mark_checked_out(session_id, now);
        }
        mark_purchase_order_paid(&mut po, session_id, now);
        if let Some(inquiry_id) = po.inquiry_id {
            changes.finished_inquiries.push(inquiry_id);
        }
        transaction.purchase_order_ids.push(po.id);
        changes.update_purchase_order(po);
    }

    for quoted in quote.bulk_orders {
        let milestone = quoted.milestone;
        let mut bulk = quoted.order;
        changes.expect_bulk_order(&bulk);
        let payment = bulk.milestone_mut(milestone);
        payment.payment_type = Some(PaymentType::Card);
        payment.payment_intent_id = Some(intent_id.to_string());
        payment.checkout_session_id = Some(session_id.to_string());
        payment.transaction_reference_id = Some(reference_id.clone());
        if milestone == Milestone::Final {
            for item in bulk.cart_items.iter_mut() {
                item.mark_checked_out(session_id, now);
            }
        }
        mark_bulk_milestone_paid(&mut bulk, milestone, session_id, now);
        if let Some(inquiry_id) = bulk.inquiry_id {
            changes.finished_inquiries.push(inquiry_id);
        }
        transaction.bulk_purchase_orders.push(BulkMilestoneRef {
            bulk_purchase_order_id: bulk.id,
            milestone,
        });
        changes.update_bulk_order(bulk);
    }

    changes.new_transaction = Some(transaction.clone());
    (changes, transaction)
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
}

fn metadata_ids(intent: &PaymentIntent, key: &str) -> OrderResult<Vec<Uuid>> {
    let raw = intent.metadata.get(key).map(String::as_str).unwrap_or_default();
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s).map_err(|_| {
                OrderError::OrderInvalid(format!("payment intent {} carries a bad {} entry", intent.id, key))
            })
        })
        .collect()
}

/// How the mock gateway answers new payment intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    RequireAction,
    Decline,
    Unavailable,
}

pub struct MockPaymentGateway {
    outcome: Mutex<MockOutcome>,
    intents: Mutex<HashMap<String, PaymentIntent>>,
    refunds: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    links: Mutex<Vec<CreatePaymentLinkParams>>,
}

impl MockPaymentGateway {
    pub fn new(outcome: MockOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            intents: Mutex::new(HashMap::new()),
            refunds: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        if let Ok(mut current) = self.outcome.lock() {
            *current = outcome;
        }
    }

    /// Simulates the buyer finishing 3-D Secure.
    pub fn complete_intent(&self, intent_id: &str) {
        if let Ok(mut intents) = self.intents.lock() {
            if let Some(intent) = intents.get_mut(intent_id) {
                intent.status = IntentStatus::Succeeded;
                intent.next_action = None;
            }
        }
    }

    pub fn intents(&self) -> Vec<PaymentIntent> {
        self.intents.lock().map(|i| i.values().cloned().collect()).unwrap_or_default()
    }

    pub fn refunds(&self) -> Vec<String> {
        self.refunds
            .lock()
            .map(|r| r.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn payment_links(&self) -> Vec<CreatePaymentLinkParams> {
        self.links.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn outcome(&self) -> MockOutcome {
        self.outcome.lock().map(|o| *o).unwrap_or(MockOutcome::Unavailable)
    }

    fn ensure_available(&self) -> CoreResult<()> {
        if self.outcome() == MockOutcome::Unavailable {
            return Err(CoreError::GatewayError("mock gateway unavailable".to_string()));
        }
        Ok(())
    }

    fn store(&self, intent: PaymentIntent) -> CoreResult<PaymentIntent> {
        let mut intents = self
            .intents
            .lock()
            .map_err(|e| CoreError::GatewayError(e.to_string()))?;
        intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    fn get(&self, intent_id: &str) -> CoreResult<PaymentIntent> {
        self.intents
            .lock()
            .map_err(|e| CoreError::GatewayError(e.to_string()))?
            .get(intent_id)
            .cloned()
            .ok_or_else(|| CoreError::GatewayError(format!("no such payment intent: {}", intent_id)))
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new(MockOutcome::Succeed)
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_payment_intent(&self, params: CreateIntentParams) -> CoreResult<PaymentIntent> {
        self.ensure_available()?;
        let id = format!("mock_pi_{}", Uuid::new_v4().simple());
        let (status, next_action) = match self.outcome() {
            MockOutcome::Succeed => (IntentStatus::Succeeded, None),
            MockOutcome::RequireAction => (
                IntentStatus::RequiresConfirmation,
                Some(NextAction { kind: "use_stripe_sdk".to_string(), redirect_url: None }),
            ),
            _ => (IntentStatus::Failed, None),
        };
        self.store(PaymentIntent {
            client_secret: Some(Masked(format!("{}_secret", id))),
            id,
            amount: params.amount,
            currency: params.currency,
            status,
            next_action,
            metadata: params.metadata,
            created_at: Utc::now(),
        })
    }

    async fn confirm_payment_intent(&self, intent_id: &str, return_url: &str) -> CoreResult<PaymentIntent> {
        self.ensure_available()?;
        let mut intent = self.get(intent_id)?;
        if intent.status == IntentStatus::RequiresConfirmation {
            intent.status = IntentStatus::RequiresAction;
            intent.next_action = Some(NextAction {
                kind: "redirect_to_url".to_string(),
                redirect_url: Some(format!("https://mock-3ds.invalid/{}?return_url={}", intent_id, return_url)),
            });
        }
        self.store(intent)
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> CoreResult<PaymentIntent> {
        self.ensure_available()?;
        self.get(intent_id)
    }

    async fn refund_payment_intent(&self, intent_id: &str, metadata: BTreeMap<String, String>) -> CoreResult<()> {
        self.ensure_available()?;
        self.refunds
            .lock()
            .map_err(|e| CoreError::GatewayError(e.to_string()))?
            .push((intent_id.to_string(), metadata));
        Ok(())
    }

    async fn create_payment_link(&self, params: CreatePaymentLinkParams) -> CoreResult<PaymentLink> {
        self.ensure_available()?;
        let id = format!("mock_plink_{}", Uuid::new_v4().simple());
        self.links
            .lock()
            .map_err(|e| CoreError::GatewayError(e.to_string()))?
            .push(params);
        Ok(PaymentLink {
            url: format!("https://pay.mock.invalid/{}", id),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::tests::{seed_bulk, seed_sample};
    use crate::memory::{FailPoint, InMemoryOrderRepository, RecordingPublisher};
    use crate::pricing::FeeSchedule;
    use rust_decimal_macros::dec;
    use weave_core::orders::InquiryStatus;
    use weave_core::tracking::BulkTrackingStatus;
    use weave_shared::Currency;

    struct Harness {
        repo: Arc<InMemoryOrderRepository>,
        gateway: Arc<MockPaymentGateway>,
        publisher: Arc<RecordingPublisher>,
        orchestrator: CheckoutOrchestrator,
    }

    fn harness(outcome: MockOutcome) -> Harness {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let gateway = Arc::new(MockPaymentGateway::new(outcome));
        let publisher = Arc::new(RecordingPublisher::new());
        let aggregator = Arc::new(CartAggregator::new(repo.clone(), FeeSchedule::new()));
        let orchestrator = CheckoutOrchestrator::new(
            aggregator,
            repo.clone(),
            gateway.clone(),
            publisher.clone(),
            "https://weave.test/v1",
        );
        Harness { repo, gateway, publisher, orchestrator }
    }

    fn card(items: Vec<Uuid>, bulks: Vec<Uuid>) -> CheckoutRequest {
        CheckoutRequest {
            selection: CheckoutSelection { cart_item_ids: items, bulk_purchase_order_ids: bulks },
            payment_type: PaymentType::Card,
            transaction_ref_id: None,
            transaction_attachment: None,
        }
    }

    fn bank(items: Vec<Uuid>, bulks: Vec<Uuid>) -> CheckoutRequest {
        CheckoutRequest {
            selection: CheckoutSelection { cart_item_ids: items, bulk_purchase_order_ids: bulks },
            payment_type: PaymentType::BankTransfer,
            transaction_ref_id: Some("VCB-000123".to_string()),
            transaction_attachment: Some(Attachment::new("transfers/receipt.png")),
        }
    }

    #[tokio::test]
    async fn test_card_checkout_pays_sample_order() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, inquiry_id) = seed_sample(&h.repo, buyer).await;

        let outcome = h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await.unwrap();
        let tx = match outcome {
            CheckoutOutcome::Paid { transaction } => transaction,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert_eq!(tx.total_amount, dec!(115.00));
        assert_eq!(h.gateway.intents()[0].amount, 11500);

        let po = h.repo.purchase_order(po_id).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Paid);
        assert_eq!(po.total_price, dec!(115.00));
        assert_eq!(po.checkout_session_id.as_deref(), Some(tx.checkout_session_id.as_str()));
        assert!(po.mark_as_paid_at.is_some());
        assert_eq!(po.lead_time, Some(10));

        let item = h.repo.cart_item(item_id).await.unwrap();
        assert!(item.is_checked_out());
        assert!(!item.waiting_for_checkout);
        assert_eq!(h.repo.inquiry(inquiry_id).await.unwrap().status, InquiryStatus::Finished);
        assert_eq!(h.publisher.topics(), vec![TOPIC_PAYMENT_SETTLED.to_string()]);
    }

    #[tokio::test]
    async fn test_bank_transfer_checkout_waits_for_confirmation() {
        let h = harness(MockOutcome::Unavailable);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;

        let outcome = h.orchestrator.checkout(buyer, bank(vec![item_id], vec![])).await.unwrap();
        let tx = outcome.transaction().unwrap().clone();
        assert_eq!(tx.status, TransactionStatus::WaitingConfirm);
        assert_eq!(tx.total_amount, dec!(115.00));
        assert_eq!(tx.paid_amount, dec!(0));

        let po = h.repo.purchase_order(po_id).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::WaitingConfirm);
        assert_eq!(po.transaction_ref_id.as_deref(), Some("VCB-000123"));
        assert_eq!(po.payment_transaction_reference_id.as_deref(), Some(tx.reference_id.as_str()));
        assert!(po.transfered_at.is_some());
        let item = h.repo.cart_item(item_id).await.unwrap();
        assert!(item.is_checked_out());
        assert!(item.waiting_for_checkout);
        assert_eq!(h.publisher.topics(), vec![TOPIC_PAYMENT_SUBMITTED.to_string()]);
    }

    #[tokio::test]
    async fn test_bank_transfer_requires_reference() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (_, item_id, _) = seed_sample(&h.repo, buyer).await;
        let mut request = bank(vec![item_id], vec![]);
        request.transaction_ref_id = Some("  ".to_string());

        let result = h.orchestrator.checkout(buyer, request).await;
        assert!(matches!(result, Err(OrderError::OrderInvalid(_))));
        assert!(h.repo.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_bank_transfer_first_milestone_leaves_items_unstamped() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&h.repo, buyer, Currency::USD, BulkTrackingStatus::FirstPayment).await;

        let outcome = h.orchestrator.checkout(buyer, bank(vec![], vec![bulk_id])).await.unwrap();
        let tx = outcome.transaction().unwrap();
        assert_eq!(tx.total_amount, dec!(330));
        assert_eq!(tx.bulk_purchase_orders[0].milestone, Milestone::First);

        let bulk = h.repo.bulk_order(bulk_id).await.unwrap();
        assert_eq!(bulk.tracking_status, BulkTrackingStatus::FirstPaymentConfirm);
        assert_eq!(bulk.first_payment.checkout_session_id.as_deref(), Some(tx.checkout_session_id.as_str()));
        assert!(bulk.cart_items.iter().all(|i| !i.is_checked_out()));
    }

    #[tokio::test]
    async fn test_card_final_milestone_stamps_items() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&h.repo, buyer, Currency::USD, BulkTrackingStatus::FinalPayment).await;

        h.orchestrator.checkout(buyer, card(vec![], vec![bulk_id])).await.unwrap();

        let bulk = h.repo.bulk_order(bulk_id).await.unwrap();
        assert_eq!(bulk.tracking_status, BulkTrackingStatus::FinalPaymentConfirmed);
        assert!(bulk.final_payment.mark_as_paid_at.is_some());
        assert_eq!(bulk.final_payment.total, dec!(770));
        assert!(bulk.cart_items.iter().all(|i| i.is_checked_out() && !i.waiting_for_checkout));
    }

    #[tokio::test]
    async fn test_mixed_currency_aborts_before_gateway() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let bulk_id = seed_bulk(&h.repo, buyer, Currency::VND, BulkTrackingStatus::FirstPayment).await;

        let result = h.orchestrator.checkout(buyer, card(vec![item_id], vec![bulk_id])).await;
        assert!(matches!(result, Err(OrderError::CurrencyMismatch { .. })));
        assert!(h.gateway.intents().is_empty());
        assert!(h.repo.transactions().await.is_empty());
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Pending);
        assert_eq!(
            h.repo.bulk_order(bulk_id).await.unwrap().tracking_status,
            BulkTrackingStatus::FirstPayment
        );
    }

    #[tokio::test]
    async fn test_gateway_failure_persists_nothing() {
        let h = harness(MockOutcome::Decline);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;

        let result = h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await;
        assert!(matches!(result, Err(OrderError::Gateway(_))));
        assert!(h.repo.transactions().await.is_empty());
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Pending);
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_atomic() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, inquiry_id) = seed_sample(&h.repo, buyer).await;

        h.repo.fail_next_commit(FailPoint::TransactionInsert);
        let result = h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await;
        assert!(result.is_err());

        let po = h.repo.purchase_order(po_id).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Pending);
        assert!(po.checkout_session_id.is_none());
        assert!(!h.repo.cart_item(item_id).await.unwrap().is_checked_out());
        assert_eq!(h.repo.inquiry(inquiry_id).await.unwrap().status, InquiryStatus::Quoted);
        assert!(h.repo.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_item_cannot_be_checked_out_twice() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (_, item_id, _) = seed_sample(&h.repo, buyer).await;

        h.orchestrator.checkout(buyer, bank(vec![item_id], vec![])).await.unwrap();
        let second = h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await;
        assert!(matches!(second, Err(OrderError::ItemAlreadyPaid(id)) if id == item_id));
        assert_eq!(h.repo.transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_commit() {
        let h = harness(MockOutcome::Succeed);
        h.publisher.set_failing(true);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;

        h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await.unwrap();
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_requires_action_then_confirm_callback() {
        let h = harness(MockOutcome::RequireAction);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;

        let outcome = h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await.unwrap();
        let (session_id, intent_id) = match outcome {
            CheckoutOutcome::RequiresAction { checkout_session_id, payment_intent_id, next_action, .. } => {
                let redirect = next_action.and_then(|a| a.redirect_url).unwrap();
                assert!(redirect.contains(&format!("/checkout/{}/confirm", checkout_session_id)));
                (checkout_session_id, payment_intent_id)
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Pending);

        let early = h.orchestrator.confirm_card_checkout(&session_id, &intent_id, buyer).await;
        assert!(matches!(early, Err(OrderError::PaymentNotCompleted(_))));

        h.gateway.complete_intent(&intent_id);
        let tx = h.orchestrator.confirm_card_checkout(&session_id, &intent_id, buyer).await.unwrap();
        assert_eq!(tx.checkout_session_id, session_id);
        assert_eq!(tx.payment_intent_id.as_deref(), Some(intent_id.as_str()));
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Paid);

        let again = h.orchestrator.confirm_card_checkout(&session_id, &intent_id, buyer).await.unwrap();
        assert_eq!(again.id, tx.id);
        assert_eq!(h.repo.transactions().await.len(), 1);
    }

    async fn start_authenticated_card_checkout(h: &Harness, buyer: Uuid, item_id: Uuid) -> (String, String) {
        let outcome = h.orchestrator.checkout(buyer, card(vec![item_id], vec![])).await.unwrap();
        match outcome {
            CheckoutOutcome::RequiresAction { checkout_session_id, payment_intent_id, .. } => {
                h.gateway.complete_intent(&payment_intent_id);
                (checkout_session_id, payment_intent_id)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confirm_settles_only_the_authorized_orders() {
        let h = harness(MockOutcome::RequireAction);
        let buyer = Uuid::new_v4();
        let (paid_po, paid_item, _) = seed_sample(&h.repo, buyer).await;
        let (other_po, _, _) = seed_sample(&h.repo, buyer).await;
        let (session_id, intent_id) = start_authenticated_card_checkout(&h, buyer, paid_item).await;

        let tx = h.orchestrator.confirm_card_checkout(&session_id, &intent_id, buyer).await.unwrap();
        assert_eq!(tx.purchase_order_ids, vec![paid_po]);
        assert_eq!(tx.total_amount, dec!(115.00));
        assert_eq!(h.repo.purchase_order(paid_po).await.unwrap().status, PurchaseOrderStatus::Paid);
        assert_eq!(h.repo.purchase_order(other_po).await.unwrap().status, PurchaseOrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_confirm_rejects_total_that_differs_from_authorization() {
        let h = harness(MockOutcome::RequireAction);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, inquiry_id) = seed_sample(&h.repo, buyer).await;
        let (session_id, intent_id) = start_authenticated_card_checkout(&h, buyer, item_id).await;

        let mut inquiry = h.repo.inquiry(inquiry_id).await.unwrap();
        inquiry.shipping_fee = Some(dec!(50.00));
        h.repo.insert_inquiry(inquiry).await;

        let result = h.orchestrator.confirm_card_checkout(&session_id, &intent_id, buyer).await;
        assert!(matches!(result, Err(OrderError::OrderInvalid(_))));
        assert!(h.repo.transactions().await.is_empty());
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Pending);
        assert!(!h.repo.cart_item(item_id).await.unwrap().is_checked_out());
    }

    #[tokio::test]
    async fn test_confirm_rejects_foreign_session_and_buyer() {
        let h = harness(MockOutcome::RequireAction);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let (session_id, intent_id) = start_authenticated_card_checkout(&h, buyer, item_id).await;

        let stranger = h.orchestrator.confirm_card_checkout(&session_id, &intent_id, Uuid::new_v4()).await;
        assert!(matches!(stranger, Err(OrderError::CheckoutNotFound(_))));
        let other_session = h.orchestrator.confirm_card_checkout("cs_other", &intent_id, buyer).await;
        assert!(matches!(other_session, Err(OrderError::OrderInvalid(_))));
        assert!(h.repo.transactions().await.is_empty());
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().status, PurchaseOrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_preview_does_not_reopen_checked_out_item() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let aggregator = CartAggregator::new(h.repo.clone(), FeeSchedule::new());
        let selection = CheckoutSelection { cart_item_ids: vec![item_id], bulk_purchase_order_ids: vec![] };
        let stale = aggregator.quote(buyer, &selection, PaymentType::BankTransfer).await.unwrap();

        let tx = h
            .orchestrator
            .checkout(buyer, bank(vec![item_id], vec![]))
            .await
            .unwrap()
            .transaction()
            .unwrap()
            .clone();
        aggregator.commit_quote(&stale).await.unwrap();

        let po = h.repo.purchase_order(po_id).await.unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::WaitingConfirm);
        assert_eq!(po.checkout_session_id.as_deref(), Some(tx.checkout_session_id.as_str()));
        let item = h.repo.cart_item(item_id).await.unwrap();
        assert_eq!(item.checkout_session_id.as_deref(), Some(tx.checkout_session_id.as_str()));

        let second = h.orchestrator.checkout(buyer, bank(vec![item_id], vec![])).await;
        assert!(matches!(second, Err(OrderError::ItemAlreadyPaid(_))));
        assert_eq!(h.repo.transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_racing_checkouts_of_one_item_commit_once() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let aggregator = CartAggregator::new(h.repo.clone(), FeeSchedule::new());
        let selection = CheckoutSelection { cart_item_ids: vec![item_id], bulk_purchase_order_ids: vec![] };

        // Both checkouts read the item before either commits.
        let first = aggregator.quote(buyer, &selection, PaymentType::Card).await.unwrap();
        let second = aggregator.quote(buyer, &selection, PaymentType::Card).await.unwrap();
        let now = Utc::now();
        let (winner, _) = card_success_changes(first, "cs_first", "pi_first", now);
        let (loser, _) = card_success_changes(second, "cs_second", "pi_second", now);

        h.repo.commit(winner).await.unwrap();
        let result = h.repo.commit(loser).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));

        let transactions = h.repo.transactions().await;
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].checkout_session_id, "cs_first");
        assert_eq!(h.repo.cart_item(item_id).await.unwrap().checkout_session_id.as_deref(), Some("cs_first"));
        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().payment_intent_id.as_deref(), Some("pi_first"));
    }

    #[tokio::test]
    async fn test_checkout_info() {
        let h = harness(MockOutcome::Succeed);
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&h.repo, buyer).await;
        let outcome = h.orchestrator.checkout(buyer, bank(vec![item_id], vec![])).await.unwrap();
        let session = outcome.transaction().unwrap().checkout_session_id.clone();

        let info = h.orchestrator.checkout_info(&Actor::buyer(buyer), &session).await.unwrap();
        assert_eq!(info.purchase_orders.len(), 1);
        assert_eq!(info.purchase_orders[0].id, po_id);

        let stranger = h.orchestrator.checkout_info(&Actor::buyer(Uuid::new_v4()), &session).await;
        assert!(matches!(stranger, Err(OrderError::CheckoutNotFound(_))));
        let missing = h.orchestrator.checkout_info(&Actor::buyer(buyer), "cs_missing").await;
        assert!(matches!(missing, Err(OrderError::CheckoutNotFound(_))));
    }
}
