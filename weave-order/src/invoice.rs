use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use weave_core::documents::{ObjectAcl, ObjectStorage, PageLayout, PdfRenderer};
use weave_core::orders::Attachment;
use weave_core::repository::{ChangeSet, OrderRepository, Precondition};
use weave_core::transaction::{Invoice, TransactionStatus};

use crate::error::{OrderError, OrderResult};

const READY_SELECTOR: &str = "#invoice-ready";
const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Renders, stores and records the invoice of a settled transaction.
pub struct InvoiceIssuer {
    repo: Arc<dyn OrderRepository>,
    renderer: Arc<dyn PdfRenderer>,
    storage: Arc<dyn ObjectStorage>,
    print_base_url: String,
    bucket: String,
}

impl InvoiceIssuer {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        renderer: Arc<dyn PdfRenderer>,
        storage: Arc<dyn ObjectStorage>,
        print_base_url: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            renderer,
            storage,
            print_base_url: print_base_url.into(),
            bucket: bucket.into(),
        }
    }

    /// Returns the existing invoice when the transaction already has one.
    pub async fn issue_for_transaction(&self, transaction_id: Uuid) -> OrderResult<Invoice> {
        let tx = self
            .repo
            .get_transaction(transaction_id)
            .await?
            .ok_or(OrderError::TransactionNotFound(transaction_id))?;
        if tx.status != TransactionStatus::Paid {
            return Err(OrderError::TransactionInvalid(tx.id));
        }
        if let Some(existing) = self.repo.find_invoice_for_transaction(tx.id).await? {
            return Ok(existing);
        }

        let invoice_number = self.repo.next_invoice_number().await?;
        let url = format!(
            "{}/invoices/{}?payment_transaction_id={}",
            self.print_base_url, invoice_number, tx.id
        );
        let pdf = self.renderer.render_pdf(&url, READY_SELECTOR, &PageLayout::default()).await?;

        let file_name = format!("invoice-{}.pdf", invoice_number);
        let key = format!("invoices/{}/{}", tx.reference_id, file_name);
        self.storage
            .upload_file(&self.bucket, &key, pdf, PDF_CONTENT_TYPE, ObjectAcl::Private)
            .await?;

        let invoice = Invoice {
            invoice_number,
            payment_transaction_id: Some(tx.id),
            purchase_order_id: tx.purchase_order_ids.first().copied(),
            currency: tx.currency,
            total_amount: tx.total_amount,
            attachment: Some(Attachment {
                file_key: key,
                file_name: Some(file_name),
                content_type: Some(PDF_CONTENT_TYPE.to_string()),
            }),
            voided_at: None,
            created_at: Utc::now(),
        };

        let mut changes = ChangeSet::new();
        for id in &tx.purchase_order_ids {
            let mut po = self
                .repo
                .get_purchase_order(*id)
                .await?
                .ok_or(OrderError::PurchaseOrderNotFound(*id))?;
            po.invoice_number = Some(invoice_number);
            changes.preconditions.push(Precondition::PurchaseOrderStatus { id: po.id, status: po.status });
            changes.purchase_orders.push(po);
        }
        changes.new_invoices.push(invoice.clone());
        self.repo.commit(changes).await?;

        info!(transaction_id = %tx.id, invoice_number, "Invoice issued");
        Ok(invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryObjectStorage, InMemoryOrderRepository, MockPdfRenderer};
    use rust_decimal_macros::dec;
    use weave_core::orders::{PaymentType, PurchaseOrder};
    use weave_core::transaction::PaymentTransaction;
    use weave_shared::{ids, Currency, Money};

    struct Harness {
        repo: Arc<InMemoryOrderRepository>,
        storage: Arc<InMemoryObjectStorage>,
        issuer: InvoiceIssuer,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let issuer = InvoiceIssuer::new(
            repo.clone(),
            Arc::new(MockPdfRenderer),
            storage.clone(),
            "https://print.weave.test",
            "weave-invoices",
        );
        Harness { repo, storage, issuer }
    }

    async fn seed_transaction(repo: &InMemoryOrderRepository, status: TransactionStatus) -> (Uuid, Uuid) {
        let po = PurchaseOrder::new(Uuid::new_v4(), Currency::USD);
        let mut tx = PaymentTransaction::new(
            po.user_id,
            PaymentType::Card,
            status,
            Money::new(dec!(115.00), Currency::USD),
            ids::checkout_session_id(),
            None,
        );
        tx.purchase_order_ids.push(po.id);
        let ids = (tx.id, po.id);
        repo.insert_purchase_order(po).await;
        repo.insert_transaction(tx).await;
        ids
    }

    #[tokio::test]
    async fn test_issue_renders_uploads_and_stamps_orders() {
        let h = harness();
        let (tx_id, po_id) = seed_transaction(&h.repo, TransactionStatus::Paid).await;

        let invoice = h.issuer.issue_for_transaction(tx_id).await.unwrap();
        assert_eq!(invoice.invoice_number, 1);
        assert_eq!(invoice.total_amount, dec!(115.00));

        let objects = h.storage.objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].bucket, "weave-invoices");
        assert_eq!(objects[0].content_type, "application/pdf");
        assert!(objects[0].key.ends_with("/invoice-1.pdf"));
        assert!(objects[0].bytes.starts_with(b"%PDF"));

        assert_eq!(h.repo.purchase_order(po_id).await.unwrap().invoice_number, Some(1));
        assert_eq!(h.repo.invoices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_issue_is_idempotent() {
        let h = harness();
        let (tx_id, _) = seed_transaction(&h.repo, TransactionStatus::Paid).await;

        let first = h.issuer.issue_for_transaction(tx_id).await.unwrap();
        let second = h.issuer.issue_for_transaction(tx_id).await.unwrap();
        assert_eq!(first.invoice_number, second.invoice_number);
        assert_eq!(h.storage.objects().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_transaction_is_not_invoiced() {
        let h = harness();
        let (tx_id, _) = seed_transaction(&h.repo, TransactionStatus::WaitingConfirm).await;
        let result = h.issuer.issue_for_transaction(tx_id).await;
        assert!(matches!(result, Err(OrderError::TransactionInvalid(_))));
        assert!(h.storage.objects().is_empty());
    }
}
