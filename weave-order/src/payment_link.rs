use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use weave_core::orders::{Milestone, OrderCartItem, PaymentType};
use weave_core::payment::{CreatePaymentLinkParams, PaymentGateway, PaymentLink, PaymentLinkLineItem};
use weave_core::repository::OrderRepository;
use weave_shared::{Currency, Money};

use crate::cart::{CartAggregator, CheckoutSelection, Quote};
use crate::error::{OrderError, OrderResult};

fn line(
    name: impl Into<String>,
    amount: Decimal,
    quantity: i64,
    currency: Currency,
) -> OrderResult<PaymentLinkLineItem> {
    Ok(PaymentLinkLineItem {
        name: name.into(),
        unit_amount: Money::new(amount, currency).round().to_minor_units()?,
        quantity,
    })
}

fn item_name(reference_id: &str, item: &OrderCartItem) -> String {
    let variant: Vec<&str> = [&item.style, &item.size, &item.color]
        .into_iter()
        .filter_map(|v| v.as_deref())
        .collect();
    if variant.is_empty() {
        reference_id.to_string()
    } else {
        format!("{} ({})", reference_id, variant.join(" / "))
    }
}

/// Appends the shipping, card fee and tax lines, skipping zero amounts.
fn push_charges(
    lines: &mut Vec<PaymentLinkLineItem>,
    currency: Currency,
    shipping_fee: Decimal,
    transaction_fee: Decimal,
    tax: Decimal,
) -> OrderResult<()> {
    for (name, amount) in [("Shipping fee", shipping_fee), ("Transaction fee", transaction_fee), ("Tax", tax)] {
        if amount > Decimal::ZERO {
            lines.push(line(name, amount, 1, currency)?);
        }
    }
    Ok(())
}

/// Hosted card payment pages for orders a buyer pays outside the checkout flow.
pub struct PaymentLinkService {
    aggregator: Arc<CartAggregator>,
    repo: Arc<dyn OrderRepository>,
    gateway: Arc<dyn PaymentGateway>,
    redirect_base_url: String,
}

impl PaymentLinkService {
    pub fn new(
        aggregator: Arc<CartAggregator>,
        repo: Arc<dyn OrderRepository>,
        gateway: Arc<dyn PaymentGateway>,
        redirect_base_url: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            repo,
            gateway,
            redirect_base_url: redirect_base_url.into(),
        }
    }

    pub async fn create_purchase_order_payment_link(
        &self,
        purchase_order_ids: &[Uuid],
        user_id: Uuid,
    ) -> OrderResult<PaymentLink> {
        if purchase_order_ids.is_empty() {
            return Err(OrderError::OrderEmpty);
        }
        let orders = self.repo.find_purchase_orders(purchase_order_ids, Some(user_id)).await?;
        if let Some(missing) = purchase_order_ids.iter().find(|id| !orders.iter().any(|po| po.id == **id)) {
            return Err(OrderError::PurchaseOrderNotFound(*missing));
        }

        let selection = CheckoutSelection {
            cart_item_ids: orders.iter().flat_map(|po| po.cart_items.iter().map(|i| i.id)).collect(),
            bulk_purchase_order_ids: Vec::new(),
        };
        let quote = self.aggregator.quote(user_id, &selection, PaymentType::Card).await?;

        let mut lines = Vec::new();
        let (mut shipping_fee, mut transaction_fee, mut tax) = (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        for po in &quote.purchase_orders {
            for item in &po.cart_items {
                lines.push(line(item_name(&po.reference_id, item), item.unit_price, item.qty, quote.currency)?);
            }
            shipping_fee += po.shipping_fee;
            transaction_fee += po.transaction_fee;
            tax += po.tax;
        }
        push_charges(&mut lines, quote.currency, shipping_fee, transaction_fee, tax)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert(
            "purchase_order_ids".to_string(),
            quote.purchase_orders.iter().map(|po| po.id.to_string()).collect::<Vec<_>>().join(","),
        );
        self.create(&quote, lines, metadata).await
    }

    pub async fn create_bulk_payment_link(
        &self,
        bulk_purchase_order_id: Uuid,
        milestone: Milestone,
        user_id: Uuid,
    ) -> OrderResult<PaymentLink> {
        let bulk = self
            .repo
            .find_bulk_orders(&[bulk_purchase_order_id], Some(user_id))
            .await?
            .into_iter()
            .next()
            .ok_or(OrderError::BulkOrderNotFound(bulk_purchase_order_id))?;
        if milestone == Milestone::First && bulk.first_payment_percentage.is_none() {
            return Err(OrderError::MissingFirstPaymentPercentage(bulk.id));
        }
        if bulk.payable_milestone() != Some(milestone) {
            return Err(OrderError::BulkOrderInvalidToCheckout(bulk.id));
        }

        let selection = CheckoutSelection {
            cart_item_ids: Vec::new(),
            bulk_purchase_order_ids: vec![bulk.id],
        };
        let quote = self.aggregator.quote(user_id, &selection, PaymentType::Card).await?;
        let quoted = quote
            .bulk_orders
            .first()
            .ok_or(OrderError::BulkOrderNotFound(bulk_purchase_order_id))?;
        let order = &quoted.order;
        let pct = order.first_payment_percentage.unwrap_or(Decimal::ZERO);

        let mut lines = Vec::new();
        for item in &order.cart_items {
            let deposit = item.unit_price * pct / Decimal::ONE_HUNDRED;
            let unit_amount = match milestone {
                Milestone::First => deposit,
                Milestone::Final => item.unit_price - deposit,
            };
            lines.push(line(item_name(&order.reference_id, item), unit_amount, item.qty, quote.currency)?);
        }
        let payment = order.milestone(milestone);
        let shipping_fee = match milestone {
            Milestone::First => Decimal::ZERO,
            Milestone::Final => order.shipping_fee,
        };
        push_charges(&mut lines, quote.currency, shipping_fee, payment.transaction_fee, payment.tax)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("bulk_purchase_order_id".to_string(), order.id.to_string());
        metadata.insert("milestone".to_string(), format!("{:?}", milestone).to_lowercase());
        self.create(&quote, lines, metadata).await
    }

    async fn create(
        &self,
        quote: &Quote,
        line_items: Vec<PaymentLinkLineItem>,
        metadata: BTreeMap<String, String>,
    ) -> OrderResult<PaymentLink> {
        let link = self
            .gateway
            .create_payment_link(CreatePaymentLinkParams {
                currency: quote.currency,
                line_items,
                metadata,
                redirect_url: format!("{}/payment-links/complete", self.redirect_base_url),
            })
            .await?;
        info!(user_id = %quote.user_id, link_id = %link.id, total = %quote.total, "Payment link created");
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::tests::{seed_bulk, seed_sample};
    use crate::memory::InMemoryOrderRepository;
    use crate::orchestrator::{MockOutcome, MockPaymentGateway};
    use crate::pricing::{CardFee, FeeSchedule};
    use rust_decimal_macros::dec;
    use weave_core::tracking::BulkTrackingStatus;

    struct Harness {
        repo: Arc<InMemoryOrderRepository>,
        gateway: Arc<MockPaymentGateway>,
        links: PaymentLinkService,
    }

    fn harness(fees: FeeSchedule) -> Harness {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let gateway = Arc::new(MockPaymentGateway::default());
        let aggregator = Arc::new(CartAggregator::new(repo.clone(), fees));
        let links = PaymentLinkService::new(aggregator, repo.clone(), gateway.clone(), "https://weave.test/v1");
        Harness { repo, gateway, links }
    }

    #[tokio::test]
    async fn test_sample_link_line_items() {
        let fees = FeeSchedule::new().with_card_fee(Currency::USD, CardFee { rate: dec!(0.029), fixed: dec!(0.30) });
        let h = harness(fees);
        let buyer = Uuid::new_v4();
        let (po_id, _, _) = seed_sample(&h.repo, buyer).await;

        let link = h.links.create_purchase_order_payment_link(&[po_id], buyer).await.unwrap();
        assert!(link.url.starts_with("https://pay.mock.invalid/"));

        let params = h.gateway.payment_links().pop().unwrap();
        assert_eq!(params.currency, Currency::USD);
        assert_eq!(params.redirect_url, "https://weave.test/v1/payment-links/complete");
        let amounts: Vec<(i64, i64)> = params.line_items.iter().map(|l| (l.unit_amount, l.quantity)).collect();
        // 2 × 50.00, shipping 5.00, card fee 3.35, tax 10.00
        assert_eq!(amounts, vec![(5000, 2), (500, 1), (335, 1), (1000, 1)]);
        assert_eq!(params.metadata["purchase_order_ids"], po_id.to_string());
    }

    #[tokio::test]
    async fn test_sample_link_rejects_foreign_order() {
        let h = harness(FeeSchedule::new());
        let (po_id, _, _) = seed_sample(&h.repo, Uuid::new_v4()).await;
        let result = h.links.create_purchase_order_payment_link(&[po_id], Uuid::new_v4()).await;
        assert!(matches!(result, Err(OrderError::PurchaseOrderNotFound(id)) if id == po_id));
        assert!(h.gateway.payment_links().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_first_milestone_link() {
        let h = harness(FeeSchedule::new());
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&h.repo, buyer, Currency::USD, BulkTrackingStatus::FirstPayment).await;

        h.links.create_bulk_payment_link(bulk_id, Milestone::First, buyer).await.unwrap();
        let params = h.gateway.payment_links().pop().unwrap();
        // 30% of 10.00 per unit, then 10% tax on the 300.00 deposit
        assert_eq!(params.line_items[0].unit_amount, 300);
        assert_eq!(params.line_items[0].quantity, 100);
        assert_eq!(params.line_items[1].name, "Tax");
        assert_eq!(params.line_items[1].unit_amount, 3000);
        assert_eq!(params.metadata["milestone"], "first");
    }

    #[tokio::test]
    async fn test_bulk_link_requires_percentage() {
        let h = harness(FeeSchedule::new());
        let buyer = Uuid::new_v4();
        let mut bulk = weave_core::orders::BulkPurchaseOrder::new(buyer, Currency::USD);
        bulk.tracking_status = BulkTrackingStatus::FirstPayment;
        bulk.add_item(dec!(10), 5);
        let id = bulk.id;
        h.repo.insert_bulk_order(bulk).await;

        let result = h.links.create_bulk_payment_link(id, Milestone::First, buyer).await;
        assert!(matches!(result, Err(OrderError::MissingFirstPaymentPercentage(_))));
        assert!(h.gateway.payment_links().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_link_for_wrong_milestone() {
        let h = harness(FeeSchedule::new());
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&h.repo, buyer, Currency::USD, BulkTrackingStatus::FirstPayment).await;
        let result = h.links.create_bulk_payment_link(bulk_id, Milestone::Final, buyer).await;
        assert!(matches!(result, Err(OrderError::BulkOrderInvalidToCheckout(_))));
    }

    #[tokio::test]
    async fn test_gateway_failure_surfaces() {
        let h = harness(FeeSchedule::new());
        let buyer = Uuid::new_v4();
        let (po_id, _, _) = seed_sample(&h.repo, buyer).await;
        h.gateway.set_outcome(MockOutcome::Unavailable);
        let result = h.links.create_purchase_order_payment_link(&[po_id], buyer).await;
        assert!(matches!(result, Err(OrderError::Gateway(_))));
    }
}
