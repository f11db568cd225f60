use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use std::sync::Arc;
use tracing::{error, info, warn};
use weave_core::transaction::Invoice;
use weave_order::{InvoiceIssuer, OrderError};
use weave_shared::models::events::{PaymentSettledEvent, TOPIC_PAYMENT_SETTLED};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Issues the invoice for one `payment.settled` message.
pub async fn handle_settled_payload(issuer: &InvoiceIssuer, payload: &str) -> Result<Invoice, WorkerError> {
    let event: PaymentSettledEvent = serde_json::from_str(payload)?;
    let invoice = issuer.issue_for_transaction(event.transaction_id).await?;
    info!(
        transaction_id = %event.transaction_id,
        invoice_number = invoice.invoice_number,
        "Invoice issued for settled payment"
    );
    Ok(invoice)
}

pub async fn start_invoice_worker(brokers: String, group_id: String, issuer: Arc<InvoiceIssuer>) -> Result<(), KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("group.id", &group_id)
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()?;

    consumer.subscribe(&[TOPIC_PAYMENT_SETTLED])?;

    info!("Invoice worker started, listening to {}...", TOPIC_PAYMENT_SETTLED);

    loop {
        match consumer.recv().await {
            Err(e) => error!("Kafka error: {}", e),
            Ok(m) => match m.payload_view::<str>() {
                Some(Ok(payload)) => {
                    if let Err(e) = handle_settled_payload(&issuer, payload).await {
                        error!("Failed to issue invoice: {}", e);
                    }
                }
                Some(Err(e)) => error!("Error reading payload: {}", e),
                None => warn!("Skipping empty message at offset {}", m.offset()),
            },
        }
    }
}
