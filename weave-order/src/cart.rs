use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use weave_core::orders::{
    BulkPurchaseOrder, Inquiry, ItemOwner, Milestone, OrderCartItem, PaymentType, PurchaseOrder,
    PurchaseOrderStatus,
};
use weave_core::repository::{ChangeSet, OrderRepository};
use weave_shared::{Currency, Money};

use crate::error::{OrderError, OrderResult};
use crate::pricing::{price_bulk, price_sample, FeeSchedule};

/// What a buyer asks to pay for: sample cart lines and whole bulk orders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutSelection {
    #[serde(default)]
    pub cart_item_ids: Vec<Uuid>,
    #[serde(default)]
    pub bulk_purchase_order_ids: Vec<Uuid>,
}

impl CheckoutSelection {
    pub fn is_empty(&self) -> bool {
        self.cart_item_ids.is_empty() && self.bulk_purchase_order_ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotedBulkOrder {
    pub order: BulkPurchaseOrder,
    pub milestone: Milestone,
}

impl QuotedBulkOrder {
    pub fn total(&self) -> Money {
        self.order.milestone_total(self.milestone)
    }
}

/// Orders loaded for one checkout with pricing recomputed but not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub user_id: Uuid,
    pub currency: Currency,
    pub payment_type: PaymentType,
    pub purchase_orders: Vec<PurchaseOrder>,
    pub bulk_orders: Vec<QuotedBulkOrder>,
    #[serde(skip)]
    pub inquiries: Vec<Inquiry>,
    pub total: Money,
}

impl Quote {
    pub fn cart_item_ids(&self) -> Vec<Uuid> {
        self.purchase_orders
            .iter()
            .flat_map(|po| po.cart_items.iter().map(|i| i.id))
            .collect()
    }

    pub fn bulk_order_ids(&self) -> Vec<Uuid> {
        self.bulk_orders.iter().map(|b| b.order.id).collect()
    }
}

pub struct CartAggregator {
    repo: Arc<dyn OrderRepository>,
    fees: FeeSchedule,
}

impl CartAggregator {
    pub fn new(repo: Arc<dyn OrderRepository>, fees: FeeSchedule) -> Self {
        Self { repo, fees }
    }

    /// Loads and cross-validates the selection and recomputes every price.
    /// Reads only; see `commit_quote` to persist the refreshed numbers.
    pub async fn quote(
        &self,
        user_id: Uuid,
        selection: &CheckoutSelection,
        payment_type: PaymentType,
    ) -> OrderResult<Quote> {
        if selection.is_empty() {
            return Err(OrderError::OrderEmpty);
        }

        let mut purchase_orders = self.load_purchase_orders(user_id, &selection.cart_item_ids).await?;
        let mut bulk_orders = self.load_bulk_orders(user_id, &selection.bulk_purchase_order_ids).await?;

        let currency = ensure_single_currency(&purchase_orders, &bulk_orders)?;

        let inquiry_ids: Vec<Uuid> = {
            let mut seen = HashSet::new();
            purchase_orders
                .iter()
                .filter_map(|po| po.inquiry_id)
                .chain(bulk_orders.iter().filter_map(|b| b.order.inquiry_id))
                .filter(|id| seen.insert(*id))
                .collect()
        };
        let inquiries = self.repo.find_inquiries(&inquiry_ids, Some(user_id)).await?;
        let inquiry_map: HashMap<Uuid, &Inquiry> = inquiries.iter().map(|i| (i.id, i)).collect();
        if let Some(missing) = inquiry_ids.iter().find(|id| !inquiry_map.contains_key(id)) {
            return Err(OrderError::InquiryNotFound(*missing));
        }

        let mut total = Money::zero(currency);
        for po in purchase_orders.iter_mut() {
            let inquiry = po.inquiry_id.and_then(|id| inquiry_map.get(&id).copied());
            self.reprice_purchase_order(po, inquiry, payment_type)?;
            total = total.checked_add(po.total())?;
        }
        for quoted in bulk_orders.iter_mut() {
            let inquiry = quoted.order.inquiry_id.and_then(|id| inquiry_map.get(&id).copied());
            self.reprice_bulk_order(quoted, inquiry, payment_type)?;
            total = total.checked_add(quoted.total())?;
        }

        Ok(Quote {
            user_id,
            currency,
            payment_type,
            purchase_orders,
            bulk_orders,
            inquiries,
            total,
        })
    }

    /// Persists the refreshed pricing of `quote` in one unit. Orders that left the
    /// payable statuses since the quote was read keep their stored numbers.
    pub async fn commit_quote(&self, quote: &Quote) -> OrderResult<()> {
        let mut changes = ChangeSet::new();
        changes.repriced_purchase_orders = quote.purchase_orders.clone();
        changes.repriced_bulk_orders = quote.bulk_orders.iter().map(|q| q.order.clone()).collect();
        self.repo.commit(changes).await?;
        Ok(())
    }

    pub async fn preview(
        &self,
        user_id: Uuid,
        selection: &CheckoutSelection,
        payment_type: PaymentType,
    ) -> OrderResult<Quote> {
        let quote = self.quote(user_id, selection, payment_type).await?;
        self.commit_quote(&quote).await?;
        info!(user_id = %user_id, total = %quote.total, "Checkout preview refreshed");
        Ok(quote)
    }

    async fn load_purchase_orders(&self, user_id: Uuid, item_ids: &[Uuid]) -> OrderResult<Vec<PurchaseOrder>> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }

        let items = self.repo.find_cart_items(item_ids).await?;
        let by_id: HashMap<Uuid, &OrderCartItem> = items.iter().map(|i| (i.id, i)).collect();

        // Preserve request order when grouping items under their purchase orders.
        let mut grouped: BTreeMap<usize, (Uuid, Vec<OrderCartItem>)> = BTreeMap::new();
        let mut slot_of: HashMap<Uuid, usize> = HashMap::new();
        let mut seen = HashSet::new();
        for id in item_ids {
            if !seen.insert(*id) {
                continue;
            }
            let item = by_id.get(id).ok_or(OrderError::ItemNotFound(*id))?;
            let po_id = match item.owner() {
                Some(ItemOwner::PurchaseOrder(po_id)) => po_id,
                _ => {
                    return Err(OrderError::OrderInvalid(format!(
                        "cart item {} does not belong to a purchase order",
                        id
                    )))
                }
            };
            if item.is_checked_out() {
                return Err(OrderError::ItemAlreadyPaid(*id));
            }
            let next = slot_of.len();
            let slot = *slot_of.entry(po_id).or_insert(next);
            grouped
                .entry(slot)
                .or_insert_with(|| (po_id, Vec::new()))
                .1
                .push((*item).clone());
        }

        let po_ids: Vec<Uuid> = grouped.values().map(|(po_id, _)| *po_id).collect();
        let loaded = self.repo.find_purchase_orders(&po_ids, Some(user_id)).await?;
        let mut loaded: HashMap<Uuid, PurchaseOrder> = loaded.into_iter().map(|po| (po.id, po)).collect();

        let mut orders = Vec::with_capacity(grouped.len());
        for (_, (po_id, items)) in grouped {
            let mut po = loaded.remove(&po_id).ok_or(OrderError::PurchaseOrderNotFound(po_id))?;
            match po.status {
                PurchaseOrderStatus::Paid => return Err(OrderError::AlreadyPaid(po.id)),
                PurchaseOrderStatus::Canceled => {
                    return Err(OrderError::OrderInvalid(format!("purchase order {} is canceled", po.id)))
                }
                _ => {}
            }
            po.cart_items = items;
            orders.push(po);
        }
        Ok(orders)
    }

    async fn load_bulk_orders(&self, user_id: Uuid, ids: &[Uuid]) -> OrderResult<Vec<QuotedBulkOrder>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut unique = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            if seen.insert(*id) {
                unique.push(*id);
            }
        }

        let loaded = self.repo.find_bulk_orders(&unique, Some(user_id)).await?;
        let mut loaded: HashMap<Uuid, BulkPurchaseOrder> = loaded.into_iter().map(|b| (b.id, b)).collect();

        let mut orders = Vec::with_capacity(unique.len());
        for id in unique {
            let order = loaded.remove(&id).ok_or(OrderError::BulkOrderNotFound(id))?;
            let milestone = order
                .payable_milestone()
                .ok_or(OrderError::BulkOrderInvalidToCheckout(order.id))?;
            if milestone == Milestone::First && order.first_payment_percentage.is_none() {
                return Err(OrderError::MissingFirstPaymentPercentage(order.id));
            }
            if order.cart_items.is_empty() {
                return Err(OrderError::OrderEmpty);
            }
            if let Some(item) = order.cart_items.iter().find(|i| i.is_checked_out()) {
                return Err(OrderError::ItemAlreadyPaid(item.id));
            }
            orders.push(QuotedBulkOrder { order, milestone });
        }
        Ok(orders)
    }

    fn reprice_purchase_order(
        &self,
        po: &mut PurchaseOrder,
        inquiry: Option<&Inquiry>,
        payment_type: PaymentType,
    ) -> OrderResult<()> {
        let sub_total = item_sub_total(&mut po.cart_items, po.currency)?;
        if !sub_total.is_positive() {
            return Err(OrderError::OrderItemInvalid(po.id));
        }

        let tax_percentage = inquiry
            .and_then(|i| i.tax_percentage)
            .unwrap_or(po.tax_percentage);
        let shipping_fee = inquiry.and_then(|i| i.shipping_fee).unwrap_or(po.shipping_fee);

        let pricing = price_sample(
            sub_total,
            tax_percentage,
            Money::new(shipping_fee, po.currency),
            payment_type,
            &self.fees,
        )?;

        po.sub_total = pricing.sub_total.amount;
        po.tax_percentage = pricing.tax_percentage;
        po.tax = pricing.tax.amount;
        po.shipping_fee = pricing.shipping_fee.amount;
        po.transaction_fee = pricing.transaction_fee.amount;
        po.total_price = pricing.total.amount;
        Ok(())
    }

    fn reprice_bulk_order(
        &self,
        quoted: &mut QuotedBulkOrder,
        inquiry: Option<&Inquiry>,
        payment_type: PaymentType,
    ) -> OrderResult<()> {
        let order = &mut quoted.order;
        let item_total = item_sub_total(&mut order.cart_items, order.currency)?;

        let (base, shipping_fee, tax_percentage) = match &order.commercial_invoice {
            Some(invoice) => (invoice.invoice_sub_total(), invoice.shipping_fee, invoice.tax_percentage),
            None => (
                item_total.amount,
                inquiry.and_then(|i| i.shipping_fee).unwrap_or(order.shipping_fee),
                inquiry.and_then(|i| i.tax_percentage).unwrap_or(order.tax_percentage),
            ),
        };
        if base <= Decimal::ZERO {
            return Err(OrderError::OrderItemInvalid(order.id));
        }

        let pricing = price_bulk(
            Money::new(base, order.currency),
            order.first_payment_percentage.unwrap_or(Decimal::ZERO),
            tax_percentage,
            Money::new(shipping_fee, order.currency),
            quoted.milestone,
            payment_type,
            &self.fees,
        )?;

        order.sub_total = pricing.base_sub_total.amount;
        order.tax_percentage = pricing.tax_percentage;
        order.tax = pricing.tax.amount;
        order.shipping_fee = pricing.shipping_fee.amount;
        order.total_price = pricing.order_total()?.amount;

        let active = pricing.active;
        let milestone = order.milestone_mut(quoted.milestone);
        milestone.sub_total = active.sub_total.amount;
        milestone.tax = active.tax.amount;
        milestone.transaction_fee = active.transaction_fee.amount;
        milestone.total = active.total.amount;
        order.transaction_fee = order.first_payment.transaction_fee + order.final_payment.transaction_fee;
        Ok(())
    }
}

/// Σ(unit × qty) over the items, refreshing each item's stored total.
fn item_sub_total(items: &mut [OrderCartItem], currency: Currency) -> OrderResult<Money> {
    let mut sub_total = Money::zero(currency);
    for item in items.iter_mut() {
        if item.unit_price <= Decimal::ZERO || item.qty <= 0 {
            return Err(OrderError::OrderItemInvalid(item.id));
        }
        item.recompute_total();
        sub_total = sub_total.checked_add(Money::new(item.total_price, currency))?;
    }
    Ok(sub_total)
}

fn ensure_single_currency(
    purchase_orders: &[PurchaseOrder],
    bulk_orders: &[QuotedBulkOrder],
) -> OrderResult<Currency> {
    let mut currencies = purchase_orders
        .iter()
        .map(|po| po.currency)
        .chain(bulk_orders.iter().map(|b| b.order.currency));
    let expected = currencies.next().ok_or(OrderError::OrderEmpty)?;
    match currencies.find(|c| *c != expected) {
        Some(found) => Err(OrderError::CurrencyMismatch { expected, found }),
        None => Ok(expected),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::InMemoryOrderRepository;
    use rust_decimal_macros::dec;
    use weave_core::orders::{InquiryStatus, Quotation, QuotationKind};
    use weave_core::tracking::BulkTrackingStatus;

    /// Buyer, inquiry with 10% tax and 5.00 shipping, one 100.00 USD sample order.
    pub(crate) async fn seed_sample(repo: &InMemoryOrderRepository, buyer: Uuid) -> (Uuid, Uuid, Uuid) {
        let inquiry = Inquiry {
            id: Uuid::new_v4(),
            user_id: buyer,
            currency: Currency::USD,
            tax_percentage: Some(dec!(10)),
            shipping_fee: Some(dec!(5.00)),
            status: InquiryStatus::Quoted,
            quotations: vec![],
        };
        let mut po = PurchaseOrder::new(buyer, Currency::USD);
        po.inquiry_id = Some(inquiry.id);
        po.quotations.push(Quotation {
            kind: QuotationKind::Sample,
            price: dec!(100.00),
            lead_time_days: Some(10),
        });
        let item_id = po.add_item(dec!(50.00), 2).id;
        let ids = (po.id, item_id, inquiry.id);
        repo.insert_inquiry(inquiry).await;
        repo.insert_purchase_order(po).await;
        ids
    }

    pub(crate) async fn seed_bulk(
        repo: &InMemoryOrderRepository,
        buyer: Uuid,
        currency: Currency,
        status: BulkTrackingStatus,
    ) -> Uuid {
        let mut bulk = BulkPurchaseOrder::new(buyer, currency);
        bulk.tracking_status = status;
        bulk.first_payment_percentage = Some(dec!(30));
        bulk.tax_percentage = dec!(10);
        bulk.add_item(dec!(10), 100);
        let id = bulk.id;
        repo.insert_bulk_order(bulk).await;
        id
    }

    fn aggregator(repo: Arc<InMemoryOrderRepository>) -> CartAggregator {
        CartAggregator::new(repo, FeeSchedule::new())
    }

    fn items(ids: &[Uuid]) -> CheckoutSelection {
        CheckoutSelection { cart_item_ids: ids.to_vec(), bulk_purchase_order_ids: vec![] }
    }

    #[tokio::test]
    async fn test_quote_sample_order() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&repo, buyer).await;

        let quote = aggregator(repo.clone())
            .quote(buyer, &items(&[item_id]), PaymentType::Card)
            .await
            .unwrap();

        assert_eq!(quote.total.amount, dec!(115.00));
        assert_eq!(quote.purchase_orders[0].tax, dec!(10.00));
        // quote is read-only
        assert_eq!(repo.purchase_order(po_id).await.unwrap().total_price, dec!(0));
    }

    #[tokio::test]
    async fn test_preview_persists_pricing() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&repo, buyer).await;

        aggregator(repo.clone())
            .preview(buyer, &items(&[item_id]), PaymentType::BankTransfer)
            .await
            .unwrap();

        let po = repo.purchase_order(po_id).await.unwrap();
        assert_eq!(po.sub_total, dec!(100.00));
        assert_eq!(po.total_price, dec!(115.00));
        assert!(po.checkout_session_id.is_none());
    }

    #[tokio::test]
    async fn test_stale_preview_leaves_submitted_bulk_order_alone() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&repo, buyer, Currency::USD, BulkTrackingStatus::FirstPayment).await;
        let agg = aggregator(repo.clone());
        let selection = CheckoutSelection { cart_item_ids: vec![], bulk_purchase_order_ids: vec![bulk_id] };
        let stale = agg.quote(buyer, &selection, PaymentType::BankTransfer).await.unwrap();

        // A bank transfer lands between the quote and its commit.
        let mut submitted = repo.bulk_order(bulk_id).await.unwrap();
        submitted.tracking_status = BulkTrackingStatus::FirstPaymentConfirm;
        submitted.first_payment.checkout_session_id = Some("cs_live".into());
        repo.insert_bulk_order(submitted).await;

        agg.commit_quote(&stale).await.unwrap();
        let stored = repo.bulk_order(bulk_id).await.unwrap();
        assert_eq!(stored.tracking_status, BulkTrackingStatus::FirstPaymentConfirm);
        assert_eq!(stored.first_payment.checkout_session_id.as_deref(), Some("cs_live"));
        assert_eq!(stored.first_payment.total, dec!(0));
    }

    #[tokio::test]
    async fn test_empty_selection() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let result = aggregator(repo)
            .quote(Uuid::new_v4(), &CheckoutSelection::default(), PaymentType::Card)
            .await;
        assert!(matches!(result, Err(OrderError::OrderEmpty)));
    }

    #[tokio::test]
    async fn test_unknown_item_and_foreign_order() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let (po_id, item_id, _) = seed_sample(&repo, buyer).await;
        let agg = aggregator(repo);

        let missing = Uuid::new_v4();
        let result = agg.quote(buyer, &items(&[missing]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::ItemNotFound(id)) if id == missing));

        let stranger = Uuid::new_v4();
        let result = agg.quote(stranger, &items(&[item_id]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::PurchaseOrderNotFound(id)) if id == po_id));
    }

    #[tokio::test]
    async fn test_stamped_item_is_rejected() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let mut po = PurchaseOrder::new(buyer, Currency::USD);
        let item_id = po.add_item(dec!(20), 1).id;
        po.cart_items[0].checkout_session_id = Some("cs_old".into());
        repo.insert_purchase_order(po).await;

        let result = aggregator(repo).quote(buyer, &items(&[item_id]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::ItemAlreadyPaid(id)) if id == item_id));
    }

    #[tokio::test]
    async fn test_paid_order_is_rejected() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let mut po = PurchaseOrder::new(buyer, Currency::USD);
        po.status = PurchaseOrderStatus::Paid;
        let item_id = po.add_item(dec!(20), 1).id;
        repo.insert_purchase_order(po).await;

        let result = aggregator(repo).quote(buyer, &items(&[item_id]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::AlreadyPaid(_))));
    }

    #[tokio::test]
    async fn test_non_positive_price_is_rejected() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let mut po = PurchaseOrder::new(buyer, Currency::USD);
        let item_id = po.add_item(dec!(0), 3).id;
        repo.insert_purchase_order(po).await;

        let result = aggregator(repo).quote(buyer, &items(&[item_id]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::OrderItemInvalid(id)) if id == item_id));
    }

    #[tokio::test]
    async fn test_item_owned_by_bulk_order_is_invalid_as_sample() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&repo, buyer, Currency::USD, BulkTrackingStatus::FirstPayment).await;
        let item_id = repo.bulk_order(bulk_id).await.unwrap().cart_items[0].id;

        let result = aggregator(repo).quote(buyer, &items(&[item_id]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::OrderInvalid(_))));
    }

    #[tokio::test]
    async fn test_mixed_currency_is_rejected() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let (_, item_id, _) = seed_sample(&repo, buyer).await;
        let bulk_id = seed_bulk(&repo, buyer, Currency::VND, BulkTrackingStatus::FirstPayment).await;

        let selection = CheckoutSelection {
            cart_item_ids: vec![item_id],
            bulk_purchase_order_ids: vec![bulk_id],
        };
        let result = aggregator(repo).quote(buyer, &selection, PaymentType::Card).await;
        assert!(matches!(
            result,
            Err(OrderError::CurrencyMismatch { expected: Currency::USD, found: Currency::VND })
        ));
    }

    #[tokio::test]
    async fn test_bulk_order_must_be_in_payable_milestone() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&repo, buyer, Currency::USD, BulkTrackingStatus::Production).await;
        let selection = CheckoutSelection { cart_item_ids: vec![], bulk_purchase_order_ids: vec![bulk_id] };

        let result = aggregator(repo).quote(buyer, &selection, PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::BulkOrderInvalidToCheckout(_))));
    }

    #[tokio::test]
    async fn test_first_milestone_requires_percentage() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let mut bulk = BulkPurchaseOrder::new(buyer, Currency::USD);
        bulk.tracking_status = BulkTrackingStatus::FirstPayment;
        bulk.add_item(dec!(10), 5);
        let bulk_id = bulk.id;
        repo.insert_bulk_order(bulk).await;
        let selection = CheckoutSelection { cart_item_ids: vec![], bulk_purchase_order_ids: vec![bulk_id] };

        let result = aggregator(repo).quote(buyer, &selection, PaymentType::BankTransfer).await;
        assert!(matches!(result, Err(OrderError::MissingFirstPaymentPercentage(id)) if id == bulk_id));
    }

    #[tokio::test]
    async fn test_bulk_first_milestone_quote() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let bulk_id = seed_bulk(&repo, buyer, Currency::USD, BulkTrackingStatus::FirstPayment).await;
        let selection = CheckoutSelection { cart_item_ids: vec![], bulk_purchase_order_ids: vec![bulk_id] };

        let quote = aggregator(repo).quote(buyer, &selection, PaymentType::BankTransfer).await.unwrap();
        let bulk = &quote.bulk_orders[0];
        assert_eq!(bulk.milestone, Milestone::First);
        assert_eq!(bulk.order.first_payment.sub_total, dec!(300));
        assert_eq!(bulk.order.first_payment.tax, dec!(30));
        assert_eq!(quote.total.amount, dec!(330));
    }

    #[tokio::test]
    async fn test_missing_inquiry_is_rejected() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let mut po = PurchaseOrder::new(buyer, Currency::USD);
        po.inquiry_id = Some(Uuid::new_v4());
        let item_id = po.add_item(dec!(20), 1).id;
        repo.insert_purchase_order(po).await;

        let result = aggregator(repo).quote(buyer, &items(&[item_id]), PaymentType::Card).await;
        assert!(matches!(result, Err(OrderError::InquiryNotFound(_))));
    }

    #[tokio::test]
    async fn test_subtotal_is_decimal_exact() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let buyer = Uuid::new_v4();
        let mut po = PurchaseOrder::new(buyer, Currency::USD);
        let prices = [(dec!(0.10), 3), (dec!(0.20), 7), (dec!(19.99), 11), (dec!(1.01), 1)];
        let ids: Vec<Uuid> = prices.iter().map(|(p, q)| po.add_item(*p, *q).id).collect();
        repo.insert_purchase_order(po).await;

        let quote = aggregator(repo).quote(buyer, &items(&ids), PaymentType::BankTransfer).await.unwrap();
        let expected: Decimal = prices.iter().map(|(p, q)| *p * Decimal::from(*q)).sum();
        assert_eq!(quote.purchase_orders[0].sub_total, expected);
        assert_eq!(expected, dec!(222.60));
    }
}
