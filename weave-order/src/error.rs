use uuid::Uuid;
use weave_core::CoreError;
use weave_shared::{Currency, MoneyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    External,
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order is empty")]
    OrderEmpty,
    #[error("Order invalid: {0}")]
    OrderInvalid(String),
    #[error("Order item invalid: {0}")]
    OrderItemInvalid(Uuid),
    #[error("Currency mismatch: {expected} vs {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },
    #[error("Bulk purchase order {0} is not in a payable milestone")]
    BulkOrderInvalidToCheckout(Uuid),
    #[error("Bulk purchase order {0} has no first payment percentage")]
    MissingFirstPaymentPercentage(Uuid),
    #[error("Payment {0} has not completed")]
    PaymentNotCompleted(String),
    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("Cart item not found: {0}")]
    ItemNotFound(Uuid),
    #[error("Purchase order not found: {0}")]
    PurchaseOrderNotFound(Uuid),
    #[error("Bulk purchase order not found: {0}")]
    BulkOrderNotFound(Uuid),
    #[error("Inquiry not found: {0}")]
    InquiryNotFound(Uuid),
    #[error("Payment transaction not found: {0}")]
    TransactionNotFound(Uuid),
    #[error("Checkout session not found: {0}")]
    CheckoutNotFound(String),

    #[error("Action {0} is not permitted for this user")]
    Forbidden(String),

    #[error("Order already paid: {0}")]
    AlreadyPaid(Uuid),
    #[error("Cart item already paid: {0}")]
    ItemAlreadyPaid(Uuid),
    #[error("Payment transaction {0} is not waiting for confirmation")]
    TransactionInvalid(Uuid),
    #[error("Invalid to {action} from {from}")]
    InvalidTransition { action: String, from: String },
    #[error("Purchase order {0} cannot be refunded")]
    PoInvalidToRefund(Uuid),
    #[error("Purchase order {0} cannot be archived")]
    PoInvalidToArchive(Uuid),
    #[error("Purchase order {0} cannot be marked as paid")]
    PoInvalidToMarkPaid(Uuid),
    #[error("Purchase order {0} cannot be marked as unpaid")]
    PoInvalidToMarkUnpaid(Uuid),
    #[error("Purchase order {0} is not delivered yet")]
    PoInvalidToCreateBulk(Uuid),
    #[error("Resource busy: {0}")]
    LockUnavailable(String),
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),
    #[error(transparent)]
    Core(CoreError),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::OrderEmpty
            | OrderError::OrderInvalid(_)
            | OrderError::OrderItemInvalid(_)
            | OrderError::CurrencyMismatch { .. }
            | OrderError::BulkOrderInvalidToCheckout(_)
            | OrderError::MissingFirstPaymentPercentage(_)
            | OrderError::PaymentNotCompleted(_)
            | OrderError::Money(_) => ErrorKind::Validation,

            OrderError::ItemNotFound(_)
            | OrderError::PurchaseOrderNotFound(_)
            | OrderError::BulkOrderNotFound(_)
            | OrderError::InquiryNotFound(_)
            | OrderError::TransactionNotFound(_)
            | OrderError::CheckoutNotFound(_) => ErrorKind::NotFound,

            OrderError::Forbidden(_) => ErrorKind::Forbidden,

            OrderError::AlreadyPaid(_)
            | OrderError::ItemAlreadyPaid(_)
            | OrderError::TransactionInvalid(_)
            | OrderError::InvalidTransition { .. }
            | OrderError::PoInvalidToRefund(_)
            | OrderError::PoInvalidToArchive(_)
            | OrderError::PoInvalidToMarkPaid(_)
            | OrderError::PoInvalidToMarkUnpaid(_)
            | OrderError::PoInvalidToCreateBulk(_)
            | OrderError::LockUnavailable(_)
            | OrderError::Conflict(_) => ErrorKind::Conflict,

            OrderError::Gateway(_) | OrderError::Core(_) => ErrorKind::External,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, OrderError::Gateway(_))
    }

    pub(crate) fn invalid_transition(action: &str, from: impl std::fmt::Debug) -> Self {
        OrderError::InvalidTransition {
            action: action.replace('_', " "),
            from: format!("{:?}", from),
        }
    }
}

impl From<CoreError> for OrderError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::LockUnavailable(key) => OrderError::LockUnavailable(key),
            CoreError::Conflict(msg) => OrderError::Conflict(msg),
            CoreError::GatewayError(msg) => OrderError::Gateway(msg),
            other => OrderError::Core(other),
        }
    }
}

pub type OrderResult<T> = Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(OrderError::OrderEmpty.kind(), ErrorKind::Validation);
        assert_eq!(OrderError::TransactionNotFound(Uuid::nil()).kind(), ErrorKind::NotFound);
        assert_eq!(OrderError::TransactionInvalid(Uuid::nil()).kind(), ErrorKind::Conflict);
        assert_eq!(
            OrderError::from(CoreError::GatewayError("timeout".into())).kind(),
            ErrorKind::External
        );
        assert!(matches!(
            OrderError::from(CoreError::LockUnavailable("k".into())),
            OrderError::LockUnavailable(_)
        ));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = OrderError::invalid_transition(
            "mark_making",
            weave_core::tracking::PoTrackingStatus::DesignApproved,
        );
        assert_eq!(err.to_string(), "Invalid to mark making from DesignApproved");
    }
}
