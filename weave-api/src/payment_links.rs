use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;
use weave_core::identity::Actor;
use weave_core::orders::Milestone;
use weave_core::payment::PaymentLink;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PurchaseOrderLinkRequest {
    pub purchase_order_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct BulkLinkRequest {
    pub milestone: Milestone,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/purchase-orders/payment-link", post(purchase_order_link))
        .route("/v1/bulk-purchase-orders/{id}/payment-link", post(bulk_link))
}

async fn purchase_order_link(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<PurchaseOrderLinkRequest>,
) -> Result<(StatusCode, Json<PaymentLink>), AppError> {
    let link = state
        .payment_links
        .create_purchase_order_payment_link(&req.purchase_order_ids, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

async fn bulk_link(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<BulkLinkRequest>,
) -> Result<(StatusCode, Json<PaymentLink>), AppError> {
    let link = state
        .payment_links
        .create_bulk_payment_link(id, req.milestone, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}
