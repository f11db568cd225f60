use chrono::Utc;
use uuid::Uuid;

fn short_token(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_uppercase()
}

/// Correlation key shared by every row one checkout attempt touches.
pub fn checkout_session_id() -> String {
    format!("cs_{}", Uuid::new_v4().simple())
}

pub fn payment_transaction_reference_id() -> String {
    format!("PT{}{}", Utc::now().format("%y%m%d"), short_token(6))
}

pub fn purchase_order_reference_id() -> String {
    format!("PO{}{}", Utc::now().format("%y%m%d"), short_token(6))
}

pub fn bulk_purchase_order_reference_id() -> String {
    format!("BPO{}{}", Utc::now().format("%y%m%d"), short_token(6))
}

pub fn raw_material_reference_id() -> String {
    format!("RM{}", short_token(8))
}
