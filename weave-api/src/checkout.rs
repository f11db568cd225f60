use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use weave_core::identity::Actor;
use weave_core::orders::PaymentType;
use weave_core::transaction::PaymentTransaction;
use weave_order::{CheckoutInfo, CheckoutOutcome, CheckoutRequest, CheckoutSelection, Quote};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(flatten)]
    pub selection: CheckoutSelection,
    pub payment_type: PaymentType,
}

/// Query string the gateway appends when it redirects back after 3-D Secure.
#[derive(Debug, Deserialize)]
pub struct ConfirmQuery {
    pub payment_intent: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/checkout/preview", post(preview))
        .route("/v1/checkout", post(checkout))
        .route("/v1/checkout/{session_id}", get(checkout_info))
        .route("/v1/checkout/{session_id}/confirm", get(confirm))
}

async fn preview(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<Quote>, AppError> {
    let quote = state
        .aggregator
        .preview(actor.user_id, &req.selection, req.payment_type)
        .await?;
    Ok(Json(quote))
}

async fn checkout(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutOutcome>), AppError> {
    let outcome = state.orchestrator.checkout(actor.user_id, req).await?;
    let status = match outcome {
        CheckoutOutcome::RequiresAction { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::CREATED,
    };
    Ok((status, Json(outcome)))
}

async fn checkout_info(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(session_id): Path<String>,
) -> Result<Json<CheckoutInfo>, AppError> {
    Ok(Json(state.orchestrator.checkout_info(&actor, &session_id).await?))
}

async fn confirm(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(session_id): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> Result<Json<PaymentTransaction>, AppError> {
    let transaction = state
        .orchestrator
        .confirm_card_checkout(&session_id, &query.payment_intent, actor.user_id)
        .await?;
    Ok(Json(transaction))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::Uri;
    use uuid::Uuid;

    #[test]
    fn test_confirm_query_ignores_extra_parameters() {
        let uri: Uri = format!("/v1/checkout/cs_1/confirm?payment_intent=pi_42&items={}", Uuid::new_v4())
            .parse()
            .unwrap();
        let Query(query) = Query::<ConfirmQuery>::try_from_uri(&uri).unwrap();
        assert_eq!(query.payment_intent, "pi_42");

        let missing: Uri = "/v1/checkout/cs_1/confirm".parse().unwrap();
        assert!(Query::<ConfirmQuery>::try_from_uri(&missing).is_err());
    }
}
