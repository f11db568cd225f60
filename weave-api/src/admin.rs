use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;
use weave_core::identity::Actor;
use weave_core::orders::{BulkPurchaseOrder, PurchaseOrder};
use weave_core::tracking::{OrderKind, TrackingRecord};
use weave_core::transaction::{Invoice, PaymentTransaction};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/payment-transactions/{id}/approve", post(approve))
        .route("/v1/admin/payment-transactions/{id}/reject", post(reject))
        .route("/v1/admin/payment-transactions/{id}/invoice", post(issue_invoice))
        .route("/v1/admin/purchase-orders/{id}/refund", post(refund))
        .route("/v1/admin/purchase-orders/{id}/archive", post(archive))
        .route("/v1/admin/purchase-orders/{id}/unarchive", post(unarchive))
        .route("/v1/admin/purchase-orders/{id}/mark-paid", post(mark_paid))
        .route("/v1/admin/purchase-orders/{id}/mark-unpaid", post(mark_unpaid))
        .route("/v1/admin/purchase-orders/{id}/bulk", post(create_bulk))
        .route("/v1/admin/purchase-orders/{id}/tracking", get(purchase_order_history))
        .route("/v1/admin/bulk-purchase-orders/{id}/tracking", get(bulk_order_history))
}

async fn approve(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.settlement.approve(id, &actor).await?))
}

async fn reject(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.settlement.reject(id, &actor).await?))
}

/// Re-drives invoice issuance when the settled-payment event was lost.
async fn issue_invoice(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Invoice>, AppError> {
    Ok(Json(state.invoices.issue_for_transaction(id).await?))
}

async fn refund(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<PurchaseOrder>, AppError> {
    let req: RefundRequest = if body.is_empty() {
        RefundRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::ValidationError(e.to_string()))?
    };
    Ok(Json(state.admin.refund(id, &actor, req.reason).await?))
}

async fn archive(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<PurchaseOrder>, AppError> {
    Ok(Json(state.admin.archive(id, &actor).await?))
}

async fn unarchive(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<PurchaseOrder>, AppError> {
    Ok(Json(state.admin.unarchive(id, &actor).await?))
}

async fn mark_paid(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<PurchaseOrder>, AppError> {
    Ok(Json(state.admin.mark_paid(id, &actor).await?))
}

async fn mark_unpaid(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<PurchaseOrder>, AppError> {
    Ok(Json(state.admin.mark_unpaid(id, &actor).await?))
}

async fn create_bulk(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<BulkPurchaseOrder>), AppError> {
    let bulk = state.admin.create_bulk_from_sample(id, &actor).await?;
    Ok((StatusCode::CREATED, Json(bulk)))
}

async fn purchase_order_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TrackingRecord>>, AppError> {
    Ok(Json(state.tracking.history(OrderKind::PurchaseOrder, id).await?))
}

async fn bulk_order_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TrackingRecord>>, AppError> {
    Ok(Json(state.tracking.history(OrderKind::BulkPurchaseOrder, id).await?))
}
