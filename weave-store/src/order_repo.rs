use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;
use weave_core::orders::{
    Attachment, BulkPurchaseOrder, CommercialInvoice, Inquiry, InquiryStatus, LogisticInfo, OrderCartItem,
    PaymentMilestone, PurchaseOrder, PurchaseOrderStatus, Quotation, RawMaterial, StageNote,
};
use weave_core::repository::{ChangeSet, OrderRepository, Precondition, SessionOrders, TransactionUpdate};
use weave_core::tracking::{BulkTrackingStatus, OrderKind, TrackingMetadata, TrackingRecord};
use weave_core::transaction::{BulkMilestoneRef, Invoice, PaymentTransaction};
use weave_core::{CoreError, CoreResult};
use weave_shared::Currency;

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_po_items(&self, rows: Vec<PurchaseOrderRow>) -> CoreResult<Vec<PurchaseOrder>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut items = group_items(
            sqlx::query_as::<_, CartItemRow>(
                "SELECT * FROM order_cart_items WHERE purchase_order_id = ANY($1) ORDER BY created_at, id",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?,
            |row| row.purchase_order_id,
        );

        rows.into_iter()
            .map(|row| {
                let mut po = row.into_order()?;
                po.cart_items = items.remove(&po.id).unwrap_or_default();
                Ok(po)
            })
            .collect()
    }

    async fn attach_bulk_items(&self, rows: Vec<BulkOrderRow>) -> CoreResult<Vec<BulkPurchaseOrder>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut items = group_items(
            sqlx::query_as::<_, CartItemRow>(
                "SELECT * FROM order_cart_items WHERE bulk_purchase_order_id = ANY($1) ORDER BY created_at, id",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?,
            |row| row.bulk_purchase_order_id,
        );

        rows.into_iter()
            .map(|row| {
                let mut bulk = row.into_order()?;
                bulk.cart_items = items.remove(&bulk.id).unwrap_or_default();
                Ok(bulk)
            })
            .collect()
    }
}

fn db_error(e: sqlx::Error) -> CoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::Conflict(db.message().to_string()),
        _ => CoreError::StorageError(e.to_string()),
    }
}

/// Enums are stored as their serde wire names.
fn encode_enum<T: Serialize>(value: &T) -> CoreResult<String> {
    match serde_json::to_value(value).map_err(|e| CoreError::StorageError(e.to_string()))? {
        Value::String(s) => Ok(s),
        other => Err(CoreError::StorageError(format!("not a unit enum: {}", other))),
    }
}

fn decode_enum<T: DeserializeOwned>(raw: &str) -> CoreResult<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|e| CoreError::StorageError(format!("bad stored value {:?}: {}", raw, e)))
}

fn decode_currency(raw: &str) -> CoreResult<Currency> {
    Currency::from_str(raw).map_err(|e| CoreError::StorageError(e.to_string()))
}

fn group_items(rows: Vec<CartItemRow>, owner: impl Fn(&CartItemRow) -> Option<Uuid>) -> HashMap<Uuid, Vec<OrderCartItem>> {
    let mut grouped: HashMap<Uuid, Vec<OrderCartItem>> = HashMap::new();
    for row in rows {
        if let Some(id) = owner(&row) {
            grouped.entry(id).or_default().push(row.into());
        }
    }
    grouped
}

/// Restores the caller's id order, dropping ids that matched nothing.
fn in_id_order<T>(ids: &[Uuid], rows: Vec<T>, id_of: impl Fn(&T) -> Uuid) -> Vec<T> {
    let mut by_id: HashMap<Uuid, T> = rows.into_iter().map(|r| (id_of(&r), r)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

#[derive(sqlx::FromRow)]
struct CartItemRow {
    id: Uuid,
    purchase_order_id: Option<Uuid>,
    bulk_purchase_order_id: Option<Uuid>,
    style: Option<String>,
    size: Option<String>,
    color: Option<String>,
    unit_price: Decimal,
    qty: i64,
    total_price: Decimal,
    checkout_session_id: Option<String>,
    waiting_for_checkout: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CartItemRow> for OrderCartItem {
    fn from(row: CartItemRow) -> Self {
        Self {
            id: row.id,
            purchase_order_id: row.purchase_order_id,
            bulk_purchase_order_id: row.bulk_purchase_order_id,
            style: row.style,
            size: row.size,
            color: row.color,
            unit_price: row.unit_price,
            qty: row.qty,
            total_price: row.total_price,
            checkout_session_id: row.checkout_session_id,
            waiting_for_checkout: row.waiting_for_checkout,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PurchaseOrderRow {
    id: Uuid,
    reference_id: String,
    user_id: Uuid,
    inquiry_id: Option<Uuid>,
    currency: String,
    status: String,
    tracking_status: String,
    seller_tracking_status: String,
    payment_type: Option<String>,
    sub_total: Decimal,
    tax_percentage: Decimal,
    tax: Decimal,
    shipping_fee: Decimal,
    transaction_fee: Decimal,
    total_price: Decimal,
    checkout_session_id: Option<String>,
    payment_transaction_reference_id: Option<String>,
    payment_intent_id: Option<String>,
    transaction_ref_id: Option<String>,
    transaction_attachment: Option<Json<Attachment>>,
    transfered_at: Option<DateTime<Utc>>,
    mark_as_paid_at: Option<DateTime<Utc>>,
    mark_as_unpaid_at: Option<DateTime<Utc>>,
    quotations: Json<Vec<Quotation>>,
    lead_time: Option<i64>,
    start_date: Option<DateTime<Utc>>,
    completion_date: Option<DateTime<Utc>>,
    techpack_attachments: Json<Vec<Attachment>>,
    approve_design_at: Option<DateTime<Utc>>,
    raw_materials: Json<Vec<RawMaterial>>,
    making_info: Option<Json<StageNote>>,
    submit_info: Option<Json<StageNote>>,
    logistic_info: Option<Json<LogisticInfo>>,
    delivery_started_at: Option<DateTime<Utc>>,
    receiver_confirmed_at: Option<DateTime<Utc>>,
    invoice_number: Option<i64>,
    refund_reason: Option<String>,
    archived_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PurchaseOrderRow {
    fn into_order(self) -> CoreResult<PurchaseOrder> {
        Ok(PurchaseOrder {
            id: self.id,
            reference_id: self.reference_id,
            user_id: self.user_id,
            inquiry_id: self.inquiry_id,
            currency: decode_currency(&self.currency)?,
            status: decode_enum(&self.status)?,
            tracking_status: decode_enum(&self.tracking_status)?,
            seller_tracking_status: decode_enum(&self.seller_tracking_status)?,
            payment_type: self.payment_type.as_deref().map(decode_enum).transpose()?,
            sub_total: self.sub_total,
            tax_percentage: self.tax_percentage,
            tax: self.tax,
            shipping_fee: self.shipping_fee,
            transaction_fee: self.transaction_fee,
            total_price: self.total_price,
            checkout_session_id: self.checkout_session_id,
            payment_transaction_reference_id: self.payment_transaction_reference_id,
            payment_intent_id: self.payment_intent_id,
            transaction_ref_id: self.transaction_ref_id,
            transaction_attachment: self.transaction_attachment.map(|j| j.0),
            transfered_at: self.transfered_at,
            mark_as_paid_at: self.mark_as_paid_at,
            mark_as_unpaid_at: self.mark_as_unpaid_at,
            quotations: self.quotations.0,
            lead_time: self.lead_time,
            start_date: self.start_date,
            completion_date: self.completion_date,
            techpack_attachments: self.techpack_attachments.0,
            approve_design_at: self.approve_design_at,
            raw_materials: self.raw_materials.0,
            making_info: self.making_info.map(|j| j.0),
            submit_info: self.submit_info.map(|j| j.0),
            logistic_info: self.logistic_info.map(|j| j.0),
            delivery_started_at: self.delivery_started_at,
            receiver_confirmed_at: self.receiver_confirmed_at,
            invoice_number: self.invoice_number,
            refund_reason: self.refund_reason,
            archived_at: self.archived_at,
            cart_items: Vec::new(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BulkOrderRow {
    id: Uuid,
    reference_id: String,
    user_id: Uuid,
    inquiry_id: Option<Uuid>,
    purchase_order_id: Option<Uuid>,
    currency: String,
    tracking_status: String,
    sub_total: Decimal,
    tax_percentage: Decimal,
    shipping_fee: Decimal,
    tax: Decimal,
    transaction_fee: Decimal,
    total_price: Decimal,
    first_payment_percentage: Option<Decimal>,
    first_payment: Json<PaymentMilestone>,
    final_payment: Json<PaymentMilestone>,
    commercial_invoice: Option<Json<CommercialInvoice>>,
    quotations: Json<Vec<Quotation>>,
    lead_time: Option<i64>,
    start_date: Option<DateTime<Utc>>,
    completion_date: Option<DateTime<Utc>>,
    raw_materials: Json<Vec<RawMaterial>>,
    logistic_info: Option<Json<LogisticInfo>>,
    delivery_started_at: Option<DateTime<Utc>>,
    receiver_confirmed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BulkOrderRow {
    fn into_order(self) -> CoreResult<BulkPurchaseOrder> {
        Ok(BulkPurchaseOrder {
            id: self.id,
            reference_id: self.reference_id,
            user_id: self.user_id,
            inquiry_id: self.inquiry_id,
            purchase_order_id: self.purchase_order_id,
            currency: decode_currency(&self.currency)?,
            tracking_status: decode_enum(&self.tracking_status)?,
            sub_total: self.sub_total,
            tax_percentage: self.tax_percentage,
            shipping_fee: self.shipping_fee,
            tax: self.tax,
            transaction_fee: self.transaction_fee,
            total_price: self.total_price,
            first_payment_percentage: self.first_payment_percentage,
            first_payment: self.first_payment.0,
            final_payment: self.final_payment.0,
            commercial_invoice: self.commercial_invoice.map(|j| j.0),
            quotations: self.quotations.0,
            lead_time: self.lead_time,
            start_date: self.start_date,
            completion_date: self.completion_date,
            raw_materials: self.raw_materials.0,
            logistic_info: self.logistic_info.map(|j| j.0),
            delivery_started_at: self.delivery_started_at,
            receiver_confirmed_at: self.receiver_confirmed_at,
            cart_items: Vec::new(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InquiryRow {
    id: Uuid,
    user_id: Uuid,
    currency: String,
    tax_percentage: Option<Decimal>,
    shipping_fee: Option<Decimal>,
    status: String,
    quotations: Json<Vec<Quotation>>,
}

impl InquiryRow {
    fn into_inquiry(self) -> CoreResult<Inquiry> {
        Ok(Inquiry {
            id: self.id,
            user_id: self.user_id,
            currency: decode_currency(&self.currency)?,
            tax_percentage: self.tax_percentage,
            shipping_fee: self.shipping_fee,
            status: decode_enum(&self.status)?,
            quotations: self.quotations.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    reference_id: String,
    user_id: Uuid,
    payment_type: String,
    status: String,
    currency: String,
    total_amount: Decimal,
    paid_amount: Decimal,
    checkout_session_id: String,
    purchase_order_ids: Vec<Uuid>,
    bulk_purchase_orders: Json<Vec<BulkMilestoneRef>>,
    transaction_ref_id: Option<String>,
    attachments: Json<Vec<Attachment>>,
    payment_intent_id: Option<String>,
    mark_as_paid_at: Option<DateTime<Utc>>,
    mark_as_unpaid_at: Option<DateTime<Utc>>,
    refund_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_transaction(self) -> CoreResult<PaymentTransaction> {
        Ok(PaymentTransaction {
            id: self.id,
            reference_id: self.reference_id,
            user_id: self.user_id,
            payment_type: decode_enum(&self.payment_type)?,
            status: decode_enum(&self.status)?,
            currency: decode_currency(&self.currency)?,
            total_amount: self.total_amount,
            paid_amount: self.paid_amount,
            checkout_session_id: self.checkout_session_id,
            purchase_order_ids: self.purchase_order_ids,
            bulk_purchase_orders: self.bulk_purchase_orders.0,
            transaction_ref_id: self.transaction_ref_id,
            attachments: self.attachments.0,
            payment_intent_id: self.payment_intent_id,
            mark_as_paid_at: self.mark_as_paid_at,
            mark_as_unpaid_at: self.mark_as_unpaid_at,
            refund_reason: self.refund_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    invoice_number: i64,
    payment_transaction_id: Option<Uuid>,
    purchase_order_id: Option<Uuid>,
    currency: String,
    total_amount: Decimal,
    attachment: Option<Json<Attachment>>,
    voided_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl InvoiceRow {
    fn into_invoice(self) -> CoreResult<Invoice> {
        Ok(Invoice {
            invoice_number: self.invoice_number,
            payment_transaction_id: self.payment_transaction_id,
            purchase_order_id: self.purchase_order_id,
            currency: decode_currency(&self.currency)?,
            total_amount: self.total_amount,
            attachment: self.attachment.map(|j| j.0),
            voided_at: self.voided_at,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TrackingRow {
    id: Uuid,
    order_kind: String,
    order_id: Uuid,
    action_type: String,
    user_id: Uuid,
    created_by_user_id: Uuid,
    metadata: Json<TrackingMetadata>,
    created_at: DateTime<Utc>,
}

impl TrackingRow {
    fn into_record(self) -> CoreResult<TrackingRecord> {
        Ok(TrackingRecord {
            id: self.id,
            order_kind: decode_enum(&self.order_kind)?,
            order_id: self.order_id,
            action_type: self.action_type,
            user_id: self.user_id,
            created_by_user_id: self.created_by_user_id,
            metadata: self.metadata.0,
            created_at: self.created_at,
        })
    }
}

/// Locks the row with `FOR UPDATE` so the check holds until the change set commits.
async fn check_precondition(conn: &mut PgConnection, precondition: &Precondition) -> CoreResult<()> {
    let holds = match precondition {
        Precondition::PurchaseOrderStatus { id, status } => {
            let stored = sqlx::query_scalar::<_, String>("SELECT status FROM purchase_orders WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_error)?;
            stored == Some(encode_enum(status)?)
        }
        Precondition::BulkOrderStatus { id, status } => {
            let stored = sqlx::query_scalar::<_, String>(
                "SELECT tracking_status FROM bulk_purchase_orders WHERE id = $1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;
            stored == Some(encode_enum(status)?)
        }
        Precondition::CartItemSession { id, checkout_session_id } => {
            let stored = sqlx::query_scalar::<_, Option<String>>(
                "SELECT checkout_session_id FROM order_cart_items WHERE id = $1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;
            stored.as_ref() == Some(checkout_session_id)
        }
    };

    if !holds {
        return Err(CoreError::Conflict(precondition.to_string()));
    }
    Ok(())
}

fn encode_all<T: Serialize>(values: &[T]) -> CoreResult<Vec<String>> {
    values.iter().map(encode_enum).collect()
}

fn milestone_pricing(milestone: &PaymentMilestone) -> Value {
    serde_json::json!({
        "sub_total": milestone.sub_total,
        "tax": milestone.tax,
        "transaction_fee": milestone.transaction_fee,
        "total": milestone.total,
    })
}

/// Returns false when the order has left the repriceable statuses.
async fn reprice_purchase_order(conn: &mut PgConnection, po: &PurchaseOrder) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE purchase_orders SET
            sub_total = $2, tax_percentage = $3, tax = $4, shipping_fee = $5, transaction_fee = $6, total_price = $7
        WHERE id = $1 AND status = ANY($8)
        "#,
    )
    .bind(po.id)
    .bind(po.sub_total)
    .bind(po.tax_percentage)
    .bind(po.tax)
    .bind(po.shipping_fee)
    .bind(po.transaction_fee)
    .bind(po.total_price)
    .bind(encode_all(&PurchaseOrderStatus::REPRICEABLE)?)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(result.rows_affected() > 0)
}

async fn reprice_bulk_order(conn: &mut PgConnection, bulk: &BulkPurchaseOrder) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bulk_purchase_orders SET
            sub_total = $2, tax_percentage = $3, shipping_fee = $4, tax = $5, transaction_fee = $6, total_price = $7,
            first_payment = first_payment || $8, final_payment = final_payment || $9
        WHERE id = $1 AND tracking_status = ANY($10)
        "#,
    )
    .bind(bulk.id)
    .bind(bulk.sub_total)
    .bind(bulk.tax_percentage)
    .bind(bulk.shipping_fee)
    .bind(bulk.tax)
    .bind(bulk.transaction_fee)
    .bind(bulk.total_price)
    .bind(Json(milestone_pricing(&bulk.first_payment)))
    .bind(Json(milestone_pricing(&bulk.final_payment)))
    .bind(encode_all(&BulkTrackingStatus::PAYABLE)?)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(result.rows_affected() > 0)
}

async fn reprice_cart_items(conn: &mut PgConnection, items: &[OrderCartItem]) -> CoreResult<()> {
    for item in items {
        sqlx::query("UPDATE order_cart_items SET total_price = $2 WHERE id = $1")
            .bind(item.id)
            .bind(item.total_price)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    Ok(())
}

async fn update_purchase_order(conn: &mut PgConnection, po: &PurchaseOrder) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE purchase_orders SET
            status = $2, tracking_status = $3, seller_tracking_status = $4, payment_type = $5,
            sub_total = $6, tax_percentage = $7, tax = $8, shipping_fee = $9, transaction_fee = $10, total_price = $11,
            checkout_session_id = $12, payment_transaction_reference_id = $13, payment_intent_id = $14,
            transaction_ref_id = $15, transaction_attachment = $16, transfered_at = $17,
            mark_as_paid_at = $18, mark_as_unpaid_at = $19,
            quotations = $20, lead_time = $21, start_date = $22, completion_date = $23,
            techpack_attachments = $24, approve_design_at = $25, raw_materials = $26,
            making_info = $27, submit_info = $28, logistic_info = $29,
            delivery_started_at = $30, receiver_confirmed_at = $31,
            invoice_number = $32, refund_reason = $33, archived_at = $34, updated_at = $35
        WHERE id = $1
        "#,
    )
    .bind(po.id)
    .bind(encode_enum(&po.status)?)
    .bind(encode_enum(&po.tracking_status)?)
    .bind(encode_enum(&po.seller_tracking_status)?)
    .bind(po.payment_type.as_ref().map(encode_enum).transpose()?)
    .bind(po.sub_total)
    .bind(po.tax_percentage)
    .bind(po.tax)
    .bind(po.shipping_fee)
    .bind(po.transaction_fee)
    .bind(po.total_price)
    .bind(&po.checkout_session_id)
    .bind(&po.payment_transaction_reference_id)
    .bind(&po.payment_intent_id)
    .bind(&po.transaction_ref_id)
    .bind(po.transaction_attachment.as_ref().map(Json))
    .bind(po.transfered_at)
    .bind(po.mark_as_paid_at)
    .bind(po.mark_as_unpaid_at)
    .bind(Json(&po.quotations))
    .bind(po.lead_time)
    .bind(po.start_date)
    .bind(po.completion_date)
    .bind(Json(&po.techpack_attachments))
    .bind(po.approve_design_at)
    .bind(Json(&po.raw_materials))
    .bind(po.making_info.as_ref().map(Json))
    .bind(po.submit_info.as_ref().map(Json))
    .bind(po.logistic_info.as_ref().map(Json))
    .bind(po.delivery_started_at)
    .bind(po.receiver_confirmed_at)
    .bind(po.invoice_number)
    .bind(&po.refund_reason)
    .bind(po.archived_at)
    .bind(po.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::StorageError(format!("purchase order {} does not exist", po.id)));
    }
    Ok(())
}

async fn update_bulk_order(conn: &mut PgConnection, bulk: &BulkPurchaseOrder) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bulk_purchase_orders SET
            tracking_status = $2, sub_total = $3, tax_percentage = $4, shipping_fee = $5, tax = $6,
            transaction_fee = $7, total_price = $8, first_payment_percentage = $9,
            first_payment = $10, final_payment = $11, commercial_invoice = $12,
            quotations = $13, lead_time = $14, start_date = $15, completion_date = $16,
            raw_materials = $17, logistic_info = $18, delivery_started_at = $19,
            receiver_confirmed_at = $20, updated_at = $21
        WHERE id = $1
        "#,
    )
    .bind(bulk.id)
    .bind(encode_enum(&bulk.tracking_status)?)
    .bind(bulk.sub_total)
    .bind(bulk.tax_percentage)
    .bind(bulk.shipping_fee)
    .bind(bulk.tax)
    .bind(bulk.transaction_fee)
    .bind(bulk.total_price)
    .bind(bulk.first_payment_percentage)
    .bind(Json(&bulk.first_payment))
    .bind(Json(&bulk.final_payment))
    .bind(bulk.commercial_invoice.as_ref().map(Json))
    .bind(Json(&bulk.quotations))
    .bind(bulk.lead_time)
    .bind(bulk.start_date)
    .bind(bulk.completion_date)
    .bind(Json(&bulk.raw_materials))
    .bind(bulk.logistic_info.as_ref().map(Json))
    .bind(bulk.delivery_started_at)
    .bind(bulk.receiver_confirmed_at)
    .bind(bulk.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::StorageError(format!("bulk order {} does not exist", bulk.id)));
    }
    Ok(())
}

async fn insert_bulk_order(conn: &mut PgConnection, bulk: &BulkPurchaseOrder) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bulk_purchase_orders (
            id, reference_id, user_id, inquiry_id, purchase_order_id, currency, tracking_status,
            sub_total, tax_percentage, shipping_fee, tax, transaction_fee, total_price,
            first_payment_percentage, first_payment, final_payment, commercial_invoice,
            quotations, lead_time, start_date, completion_date, raw_materials, logistic_info,
            delivery_started_at, receiver_confirmed_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
        "#,
    )
    .bind(bulk.id)
    .bind(&bulk.reference_id)
    .bind(bulk.user_id)
    .bind(bulk.inquiry_id)
    .bind(bulk.purchase_order_id)
    .bind(bulk.currency.as_str())
    .bind(encode_enum(&bulk.tracking_status)?)
    .bind(bulk.sub_total)
    .bind(bulk.tax_percentage)
    .bind(bulk.shipping_fee)
    .bind(bulk.tax)
    .bind(bulk.transaction_fee)
    .bind(bulk.total_price)
    .bind(bulk.first_payment_percentage)
    .bind(Json(&bulk.first_payment))
    .bind(Json(&bulk.final_payment))
    .bind(bulk.commercial_invoice.as_ref().map(Json))
    .bind(Json(&bulk.quotations))
    .bind(bulk.lead_time)
    .bind(bulk.start_date)
    .bind(bulk.completion_date)
    .bind(Json(&bulk.raw_materials))
    .bind(bulk.logistic_info.as_ref().map(Json))
    .bind(bulk.delivery_started_at)
    .bind(bulk.receiver_confirmed_at)
    .bind(bulk.created_at)
    .bind(bulk.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn update_cart_item(conn: &mut PgConnection, item: &OrderCartItem) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE order_cart_items SET
            style = $2, size = $3, color = $4, unit_price = $5, qty = $6, total_price = $7,
            checkout_session_id = $8, waiting_for_checkout = $9, updated_at = $10
        WHERE id = $1
        "#,
    )
    .bind(item.id)
    .bind(&item.style)
    .bind(&item.size)
    .bind(&item.color)
    .bind(item.unit_price)
    .bind(item.qty)
    .bind(item.total_price)
    .bind(&item.checkout_session_id)
    .bind(item.waiting_for_checkout)
    .bind(item.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::StorageError(format!("cart item {} does not exist", item.id)));
    }
    Ok(())
}

async fn insert_cart_item(conn: &mut PgConnection, item: &OrderCartItem) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO order_cart_items (
            id, purchase_order_id, bulk_purchase_order_id, style, size, color, unit_price, qty,
            total_price, checkout_session_id, waiting_for_checkout, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(item.id)
    .bind(item.purchase_order_id)
    .bind(item.bulk_purchase_order_id)
    .bind(&item.style)
    .bind(&item.size)
    .bind(&item.color)
    .bind(item.unit_price)
    .bind(item.qty)
    .bind(item.total_price)
    .bind(&item.checkout_session_id)
    .bind(item.waiting_for_checkout)
    .bind(item.created_at)
    .bind(item.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn insert_transaction(conn: &mut PgConnection, tx: &PaymentTransaction) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO payment_transactions (
            id, reference_id, user_id, payment_type, status, currency, total_amount, paid_amount,
            checkout_session_id, purchase_order_ids, bulk_purchase_orders, transaction_ref_id,
            attachments, payment_intent_id, mark_as_paid_at, mark_as_unpaid_at, refund_reason,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(tx.id)
    .bind(&tx.reference_id)
    .bind(tx.user_id)
    .bind(encode_enum(&tx.payment_type)?)
    .bind(encode_enum(&tx.status)?)
    .bind(tx.currency.as_str())
    .bind(tx.total_amount)
    .bind(tx.paid_amount)
    .bind(&tx.checkout_session_id)
    .bind(&tx.purchase_order_ids)
    .bind(Json(&tx.bulk_purchase_orders))
    .bind(&tx.transaction_ref_id)
    .bind(Json(&tx.attachments))
    .bind(&tx.payment_intent_id)
    .bind(tx.mark_as_paid_at)
    .bind(tx.mark_as_unpaid_at)
    .bind(&tx.refund_reason)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Compare-and-set on the stored status; a concurrent writer turns this into `Conflict`.
async fn update_transaction(conn: &mut PgConnection, update: &TransactionUpdate) -> CoreResult<()> {
    let tx = &update.transaction;
    let expected = encode_enum(&update.expected_status)?;
    let result = sqlx::query(
        r#"
        UPDATE payment_transactions SET
            status = $3, paid_amount = $4, purchase_order_ids = $5, bulk_purchase_orders = $6,
            transaction_ref_id = $7, attachments = $8, payment_intent_id = $9,
            mark_as_paid_at = $10, mark_as_unpaid_at = $11, refund_reason = $12, updated_at = $13
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(tx.id)
    .bind(&expected)
    .bind(encode_enum(&tx.status)?)
    .bind(tx.paid_amount)
    .bind(&tx.purchase_order_ids)
    .bind(Json(&tx.bulk_purchase_orders))
    .bind(&tx.transaction_ref_id)
    .bind(Json(&tx.attachments))
    .bind(&tx.payment_intent_id)
    .bind(tx.mark_as_paid_at)
    .bind(tx.mark_as_unpaid_at)
    .bind(&tx.refund_reason)
    .bind(tx.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::Conflict(format!("transaction {} is no longer {}", tx.id, expected)));
    }
    Ok(())
}

async fn insert_tracking_record(conn: &mut PgConnection, record: &TrackingRecord) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO order_trackings (id, order_kind, order_id, action_type, user_id, created_by_user_id, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.id)
    .bind(encode_enum(&record.order_kind)?)
    .bind(record.order_id)
    .bind(&record.action_type)
    .bind(record.user_id)
    .bind(record.created_by_user_id)
    .bind(Json(&record.metadata))
    .bind(record.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn insert_invoice(conn: &mut PgConnection, invoice: &Invoice) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices (invoice_number, payment_transaction_id, purchase_order_id, currency, total_amount, attachment, voided_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(invoice.invoice_number)
    .bind(invoice.payment_transaction_id)
    .bind(invoice.purchase_order_id)
    .bind(invoice.currency.as_str())
    .bind(invoice.total_amount)
    .bind(invoice.attachment.as_ref().map(Json))
    .bind(invoice.voided_at)
    .bind(invoice.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn find_cart_items(&self, ids: &[Uuid]) -> CoreResult<Vec<OrderCartItem>> {
        let rows = sqlx::query_as::<_, CartItemRow>("SELECT * FROM order_cart_items WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let items: Vec<OrderCartItem> = rows.into_iter().map(Into::into).collect();
        Ok(in_id_order(ids, items, |i| i.id))
    }

    async fn find_purchase_orders(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<PurchaseOrder>> {
        let rows = sqlx::query_as::<_, PurchaseOrderRow>(
            r#"
            SELECT * FROM purchase_orders
            WHERE id = ANY($1) AND archived_at IS NULL AND ($2::uuid IS NULL OR user_id = $2)
            "#,
        )
        .bind(ids)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let orders = self.attach_po_items(rows).await?;
        Ok(in_id_order(ids, orders, |po| po.id))
    }

    async fn find_bulk_orders(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<BulkPurchaseOrder>> {
        let rows = sqlx::query_as::<_, BulkOrderRow>(
            "SELECT * FROM bulk_purchase_orders WHERE id = ANY($1) AND ($2::uuid IS NULL OR user_id = $2)",
        )
        .bind(ids)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let orders = self.attach_bulk_items(rows).await?;
        Ok(in_id_order(ids, orders, |b| b.id))
    }

    async fn find_inquiries(&self, ids: &[Uuid], user_id: Option<Uuid>) -> CoreResult<Vec<Inquiry>> {
        let rows = sqlx::query_as::<_, InquiryRow>(
            "SELECT * FROM inquiries WHERE id = ANY($1) AND ($2::uuid IS NULL OR user_id = $2)",
        )
        .bind(ids)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let inquiries = rows.into_iter().map(InquiryRow::into_inquiry).collect::<CoreResult<Vec<_>>>()?;
        Ok(in_id_order(ids, inquiries, |i| i.id))
    }

    async fn get_purchase_order(&self, id: Uuid) -> CoreResult<Option<PurchaseOrder>> {
        let row = sqlx::query_as::<_, PurchaseOrderRow>("SELECT * FROM purchase_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => Ok(self.attach_po_items(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn get_bulk_order(&self, id: Uuid) -> CoreResult<Option<BulkPurchaseOrder>> {
        let row = sqlx::query_as::<_, BulkOrderRow>("SELECT * FROM bulk_purchase_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => Ok(self.attach_bulk_items(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_bulk_orders_for_sample(&self, purchase_order_id: Uuid) -> CoreResult<Vec<BulkPurchaseOrder>> {
        let rows = sqlx::query_as::<_, BulkOrderRow>(
            "SELECT * FROM bulk_purchase_orders WHERE purchase_order_id = $1 ORDER BY created_at",
        )
        .bind(purchase_order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        self.attach_bulk_items(rows).await
    }

    async fn get_transaction(&self, id: Uuid) -> CoreResult<Option<PaymentTransaction>> {
        sqlx::query_as::<_, TransactionRow>("SELECT * FROM payment_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(TransactionRow::into_transaction)
            .transpose()
    }

    async fn find_transaction_by_session(&self, session_id: &str) -> CoreResult<Option<PaymentTransaction>> {
        sqlx::query_as::<_, TransactionRow>("SELECT * FROM payment_transactions WHERE checkout_session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(TransactionRow::into_transaction)
            .transpose()
    }

    async fn find_transaction_by_intent(&self, intent_id: &str) -> CoreResult<Option<PaymentTransaction>> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM payment_transactions WHERE payment_intent_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(TransactionRow::into_transaction)
        .transpose()
    }

    async fn find_orders_by_session(&self, session_id: &str) -> CoreResult<SessionOrders> {
        let po_rows = sqlx::query_as::<_, PurchaseOrderRow>(
            "SELECT * FROM purchase_orders WHERE checkout_session_id = $1 ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let bulk_rows = sqlx::query_as::<_, BulkOrderRow>(
            r#"
            SELECT * FROM bulk_purchase_orders
            WHERE first_payment->>'checkout_session_id' = $1
               OR final_payment->>'checkout_session_id' = $1
            ORDER BY created_at
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(SessionOrders {
            purchase_orders: self.attach_po_items(po_rows).await?,
            bulk_orders: self.attach_bulk_items(bulk_rows).await?,
        })
    }

    async fn list_tracking_records(&self, kind: OrderKind, order_id: Uuid) -> CoreResult<Vec<TrackingRecord>> {
        sqlx::query_as::<_, TrackingRow>(
            "SELECT * FROM order_trackings WHERE order_kind = $1 AND order_id = $2 ORDER BY created_at, id",
        )
        .bind(encode_enum(&kind)?)
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?
        .into_iter()
        .map(TrackingRow::into_record)
        .collect()
    }

    async fn next_invoice_number(&self) -> CoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT nextval('invoice_number_seq')")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn find_invoice_for_transaction(&self, transaction_id: Uuid) -> CoreResult<Option<Invoice>> {
        sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT * FROM invoices
            WHERE payment_transaction_id = $1 AND voided_at IS NULL
            ORDER BY invoice_number LIMIT 1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(InvoiceRow::into_invoice)
        .transpose()
    }

    async fn commit(&self, changes: ChangeSet) -> CoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        // Dropping `tx` on any early return rolls the whole change set back.
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for precondition in &changes.preconditions {
            check_precondition(&mut tx, precondition).await?;
        }
        for po in &changes.repriced_purchase_orders {
            if reprice_purchase_order(&mut tx, po).await? {
                reprice_cart_items(&mut tx, &po.cart_items).await?;
            }
        }
        for bulk in &changes.repriced_bulk_orders {
            if reprice_bulk_order(&mut tx, bulk).await? {
                reprice_cart_items(&mut tx, &bulk.cart_items).await?;
            }
        }
        for po in &changes.purchase_orders {
            update_purchase_order(&mut tx, po).await?;
        }
        for bulk in &changes.bulk_orders {
            update_bulk_order(&mut tx, bulk).await?;
        }
        for bulk in &changes.new_bulk_orders {
            insert_bulk_order(&mut tx, bulk).await?;
        }
        for item in &changes.cart_items {
            update_cart_item(&mut tx, item).await?;
        }
        for item in &changes.new_cart_items {
            insert_cart_item(&mut tx, item).await?;
        }
        if !changes.finished_inquiries.is_empty() {
            sqlx::query("UPDATE inquiries SET status = $2 WHERE id = ANY($1)")
                .bind(&changes.finished_inquiries)
                .bind(encode_enum(&InquiryStatus::Finished)?)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        if let Some(transaction) = &changes.new_transaction {
            insert_transaction(&mut tx, transaction).await?;
        }
        for update in &changes.updated_transactions {
            update_transaction(&mut tx, update).await?;
        }
        for record in &changes.tracking_records {
            insert_tracking_record(&mut tx, record).await?;
        }
        if !changes.voided_invoices.is_empty() {
            sqlx::query("UPDATE invoices SET voided_at = NOW() WHERE invoice_number = ANY($1)")
                .bind(&changes.voided_invoices)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        for invoice in &changes.new_invoices {
            insert_invoice(&mut tx, invoice).await?;
        }

        tx.commit().await.map_err(|e| {
            warn!("Change set commit failed: {}", e);
            db_error(e)
        })?;
        debug!(
            "Committed change set: {} purchase orders, {} bulk orders, {} tracking records",
            changes.purchase_orders.len(),
            changes.bulk_orders.len() + changes.new_bulk_orders.len(),
            changes.tracking_records.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::orders::PaymentType;
    use weave_core::tracking::PoTrackingStatus;
    use weave_core::transaction::TransactionStatus;

    #[test]
    fn test_enums_use_wire_names() {
        assert_eq!(encode_enum(&PurchaseOrderStatus::WaitingConfirm).unwrap(), "WAITING_CONFIRM");
        assert_eq!(encode_enum(&PaymentType::BankTransfer).unwrap(), "BANK_TRANSFER");
        assert_eq!(encode_enum(&BulkTrackingStatus::FirstPaymentConfirm).unwrap(), "FIRST_PAYMENT_CONFIRM");
        assert_eq!(encode_enum(&OrderKind::BulkPurchaseOrder).unwrap(), "BULK_PURCHASE_ORDER");

        let status: TransactionStatus = decode_enum("REFUNDED").unwrap();
        assert_eq!(status, TransactionStatus::Refunded);
        let tracking: PoTrackingStatus = decode_enum("DELIVERY_CONFIRMED").unwrap();
        assert_eq!(tracking, PoTrackingStatus::DeliveryConfirmed);
    }

    #[test]
    fn test_unknown_stored_value_is_storage_error() {
        let result: CoreResult<PurchaseOrderStatus> = decode_enum("SHIPPED");
        assert!(matches!(result, Err(CoreError::StorageError(_))));
        assert!(matches!(decode_currency("GBP"), Err(CoreError::StorageError(_))));
    }

    #[test]
    fn test_repricing_guards_use_wire_names() {
        assert_eq!(
            encode_all(&PurchaseOrderStatus::REPRICEABLE).unwrap(),
            vec!["PENDING".to_string(), "UNPAID".to_string()]
        );
        assert_eq!(
            encode_all(&BulkTrackingStatus::PAYABLE).unwrap(),
            vec!["FIRST_PAYMENT".to_string(), "FINAL_PAYMENT".to_string()]
        );
    }

    #[test]
    fn test_milestone_pricing_leaves_payment_fields_out() {
        let milestone = PaymentMilestone {
            checkout_session_id: Some("cs_1".into()),
            ..PaymentMilestone::default()
        };
        let patch = milestone_pricing(&milestone);
        let keys: Vec<&str> = patch.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| ["sub_total", "tax", "transaction_fee", "total"].contains(k)));
    }

    #[test]
    fn test_rows_come_back_in_requested_order() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let ordered = in_id_order(&[c, a, b], vec![a, b, c], |id| *id);
        assert_eq!(ordered, vec![c, a, b]);

        let missing = in_id_order(&[a, Uuid::new_v4()], vec![a], |id| *id);
        assert_eq!(missing, vec![a]);
    }
}
