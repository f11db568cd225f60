use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
    SuperAdmin,
}

/// The authenticated caller of an engine operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn buyer(user_id: Uuid) -> Self {
        Self::new(user_id, Role::Buyer)
    }

    pub fn seller(user_id: Uuid) -> Self {
        Self::new(user_id, Role::Seller)
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Admin | Role::SuperAdmin)
    }
}
