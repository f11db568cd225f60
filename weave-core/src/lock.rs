use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::CoreResult;

pub const SETTLEMENT_LOCK_TTL: Duration = Duration::from_secs(20);
pub const PURCHASE_ORDER_LOCK_TTL: Duration = Duration::from_secs(20);
pub const BULK_FROM_SAMPLE_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    PaymentTransaction,
    PurchaseOrder,
    BulkFromSample,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::PaymentTransaction => "payment_transaction",
            LockKind::PurchaseOrder => "purchase_order",
            LockKind::BulkFromSample => "bulk_from_sample",
        }
    }
}

/// Typed advisory-lock key; distinct kinds never share a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: LockKind,
    pub id: Uuid,
}

impl LockKey {
    pub fn payment_transaction(id: Uuid) -> Self {
        Self { kind: LockKind::PaymentTransaction, id }
    }

    pub fn purchase_order(id: Uuid) -> Self {
        Self { kind: LockKind::PurchaseOrder, id }
    }

    pub fn bulk_from_sample(purchase_order_id: Uuid) -> Self {
        Self { kind: LockKind::BulkFromSample, id: purchase_order_id }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weave:lock:{}:{}", self.kind.as_str(), self.id)
    }
}

/// A held lock. Release only deletes the key while it still holds `token`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: LockKey,
    pub token: String,
    pub ttl: Duration,
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Waits up to the locker's wait budget; `CoreError::LockUnavailable` on timeout.
    async fn acquire(&self, key: LockKey, ttl: Duration) -> CoreResult<Lease>;

    async fn release(&self, lease: Lease) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_rendering() {
        let id = Uuid::nil();
        assert_eq!(
            LockKey::payment_transaction(id).to_string(),
            "weave:lock:payment_transaction:00000000-0000-0000-0000-000000000000"
        );
        assert_ne!(
            LockKey::purchase_order(id).to_string(),
            LockKey::bulk_from_sample(id).to_string()
        );
    }
}
