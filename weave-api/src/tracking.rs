use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::post,
    Extension, Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;
use weave_core::identity::Actor;
use weave_core::orders::{BulkPurchaseOrder, PurchaseOrder};
use weave_order::{BulkTrackingCommand, PoTrackingCommand};

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/purchase-orders/{id}/tracking/{action}", post(apply_purchase_order))
        .route("/v1/bulk-purchase-orders/{id}/tracking/{action}", post(apply_bulk_order))
}

/// Merges the action from the path into the (possibly empty) JSON payload.
fn parse_command<T: DeserializeOwned>(action: &str, body: &Bytes) -> Result<T, AppError> {
    let mut payload = if body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(AppError::ValidationError("payload must be a JSON object".to_string())),
            Err(e) => return Err(AppError::ValidationError(e.to_string())),
        }
    };
    payload.insert("action".to_string(), Value::String(action.replace('-', "_")));
    serde_json::from_value(Value::Object(payload)).map_err(|e| AppError::ValidationError(e.to_string()))
}

async fn apply_purchase_order(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((id, action)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<Json<PurchaseOrder>, AppError> {
    let command: PoTrackingCommand = parse_command(&action, &body)?;
    Ok(Json(state.tracking.apply_to_purchase_order(id, &actor, command).await?))
}

async fn apply_bulk_order(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((id, action)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<Json<BulkPurchaseOrder>, AppError> {
    let command: BulkTrackingCommand = parse_command(&action, &body)?;
    Ok(Json(state.tracking.apply_to_bulk_order(id, &actor, command).await?))
}
