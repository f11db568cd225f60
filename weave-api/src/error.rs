use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use weave_order::{ErrorKind, OrderError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    AuthenticationError(String),
    #[error("{0}")]
    AuthorizationError(String),
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    ConflictError(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    InternalServerError(String),
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Validation => AppError::ValidationError(message),
            ErrorKind::NotFound => AppError::NotFoundError(message),
            ErrorKind::Forbidden => AppError::AuthorizationError(message),
            ErrorKind::Conflict => AppError::ConflictError(message),
            ErrorKind::External if err.is_gateway() => AppError::BadGateway(message),
            ErrorKind::External => AppError::InternalServerError(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => {
                tracing::error!("Payment gateway failure: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weave_core::CoreError;

    #[test]
    fn test_order_errors_map_to_status_codes() {
        let cases = [
            (OrderError::OrderEmpty, StatusCode::BAD_REQUEST),
            (OrderError::PurchaseOrderNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (OrderError::Forbidden("refund".into()), StatusCode::FORBIDDEN),
            (OrderError::TransactionInvalid(Uuid::nil()), StatusCode::CONFLICT),
            (OrderError::Gateway("card declined".into()), StatusCode::BAD_GATEWAY),
            (
                OrderError::Core(CoreError::StorageError("pool timed out".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
