use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{Actor, Role};

/// Production/delivery stage of a sample order as seen by buyer and staff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoTrackingStatus {
    New,
    WaitingForApproved,
    DesignApproved,
    DesignRejected,
    RawMaterial,
    Making,
    Submit,
    Delivering,
    DeliveryConfirmed,
    Canceled,
    PaymentReceived,
}

/// The same lifecycle as seen by the manufacturer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellerTrackingStatus {
    New,
    WaitingForApproved,
    DesignApprovedByBuyer,
    DesignRejectedByBuyer,
    RawMaterial,
    Making,
    Submit,
    Delivering,
    DeliveryConfirmed,
    Canceled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkTrackingStatus {
    New,
    WaitingForSubmitOrder,
    WaitingForQuotation,
    FirstPayment,
    FirstPaymentConfirm,
    FirstPaymentConfirmed,
    RawMaterial,
    Pps,
    Production,
    Qc,
    Submit,
    FinalPayment,
    FinalPaymentConfirm,
    FinalPaymentConfirmed,
    Delivering,
    DeliveryConfirmed,
    Delivered,
}

impl BulkTrackingStatus {
    /// Statuses with a milestone awaiting payment.
    pub const PAYABLE: [BulkTrackingStatus; 2] = [BulkTrackingStatus::FirstPayment, BulkTrackingStatus::FinalPayment];

    pub fn is_payable(self) -> bool {
        Self::PAYABLE.contains(&self)
    }
}

/// Named actions recorded against a sample order. The first group moves the
/// tracking status through `rule`; the rest are audit-only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PoTrackingAction {
    UploadDesign,
    ApproveDesign,
    RejectDesign,
    SkipDesign,
    UpdateRawMaterial,
    MarkMaking,
    MarkMakingWithoutRawMaterial,
    MarkSubmit,
    MarkDelivering,
    ConfirmDelivered,
    MarkPaid,
    MarkUnpaid,
    Refund,
    CreateBulkOrder,
}

impl PoTrackingAction {
    /// Accepted pre-states and the resulting state of a tracking transition.
    pub fn rule(self) -> Option<(&'static [PoTrackingStatus], PoTrackingStatus)> {
        use PoTrackingStatus::*;
        let rule: (&'static [PoTrackingStatus], PoTrackingStatus) = match self {
            PoTrackingAction::UploadDesign => (&[New, DesignRejected, WaitingForApproved], WaitingForApproved),
            PoTrackingAction::ApproveDesign => (&[WaitingForApproved], DesignApproved),
            PoTrackingAction::RejectDesign => (&[WaitingForApproved], DesignRejected),
            PoTrackingAction::SkipDesign => (&[New], DesignApproved),
            PoTrackingAction::UpdateRawMaterial => (&[DesignApproved, RawMaterial], RawMaterial),
            PoTrackingAction::MarkMaking => (&[RawMaterial], Making),
            PoTrackingAction::MarkMakingWithoutRawMaterial => (&[DesignApproved], Making),
            PoTrackingAction::MarkSubmit => (&[Making], Submit),
            PoTrackingAction::MarkDelivering => (&[Submit], Delivering),
            PoTrackingAction::ConfirmDelivered => (&[Delivering], DeliveryConfirmed),
            PoTrackingAction::MarkPaid
            | PoTrackingAction::MarkUnpaid
            | PoTrackingAction::Refund
            | PoTrackingAction::CreateBulkOrder => return None,
        };
        Some(rule)
    }

    pub fn next_status(self, from: PoTrackingStatus) -> Option<PoTrackingStatus> {
        let (accepted, to) = self.rule()?;
        accepted.contains(&from).then_some(to)
    }

    pub fn seller_status(self) -> Option<SellerTrackingStatus> {
        match self {
            PoTrackingAction::UploadDesign => Some(SellerTrackingStatus::WaitingForApproved),
            PoTrackingAction::ApproveDesign | PoTrackingAction::SkipDesign => {
                Some(SellerTrackingStatus::DesignApprovedByBuyer)
            }
            PoTrackingAction::RejectDesign => Some(SellerTrackingStatus::DesignRejectedByBuyer),
            PoTrackingAction::UpdateRawMaterial => Some(SellerTrackingStatus::RawMaterial),
            PoTrackingAction::MarkMaking | PoTrackingAction::MarkMakingWithoutRawMaterial => {
                Some(SellerTrackingStatus::Making)
            }
            PoTrackingAction::MarkSubmit => Some(SellerTrackingStatus::Submit),
            PoTrackingAction::MarkDelivering => Some(SellerTrackingStatus::Delivering),
            PoTrackingAction::ConfirmDelivered => Some(SellerTrackingStatus::DeliveryConfirmed),
            PoTrackingAction::Refund => Some(SellerTrackingStatus::Canceled),
            _ => None,
        }
    }

    pub fn allowed_for(self, actor: &Actor) -> bool {
        if actor.is_staff() {
            return true;
        }
        match self {
            PoTrackingAction::UploadDesign
            | PoTrackingAction::ApproveDesign
            | PoTrackingAction::RejectDesign
            | PoTrackingAction::ConfirmDelivered => actor.role == Role::Buyer,
            PoTrackingAction::UpdateRawMaterial
            | PoTrackingAction::MarkMaking
            | PoTrackingAction::MarkMakingWithoutRawMaterial
            | PoTrackingAction::MarkSubmit
            | PoTrackingAction::MarkDelivering => actor.role == Role::Seller,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoTrackingAction::UploadDesign => "upload_design",
            PoTrackingAction::ApproveDesign => "approve_design",
            PoTrackingAction::RejectDesign => "reject_design",
            PoTrackingAction::SkipDesign => "skip_design",
            PoTrackingAction::UpdateRawMaterial => "update_raw_material",
            PoTrackingAction::MarkMaking => "mark_making",
            PoTrackingAction::MarkMakingWithoutRawMaterial => "mark_making_without_raw_material",
            PoTrackingAction::MarkSubmit => "mark_submit",
            PoTrackingAction::MarkDelivering => "mark_delivering",
            PoTrackingAction::ConfirmDelivered => "confirm_delivered",
            PoTrackingAction::MarkPaid => "mark_paid",
            PoTrackingAction::MarkUnpaid => "mark_unpaid",
            PoTrackingAction::Refund => "refund",
            PoTrackingAction::CreateBulkOrder => "create_bulk_order",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BulkTrackingAction {
    MarkFirstPaymentConfirmed,
    UpdateRawMaterial,
    UpdatePps,
    UpdateProduction,
    ConfirmQc,
    RequestFinalPayment,
    MarkFinalPaymentConfirmed,
    MarkDelivering,
    ConfirmDelivered,
    MarkDelivered,
}

impl BulkTrackingAction {
    pub fn rule(self) -> (&'static [BulkTrackingStatus], BulkTrackingStatus) {
        use BulkTrackingStatus::*;
        match self {
            BulkTrackingAction::MarkFirstPaymentConfirmed => {
                (&[FirstPayment, FirstPaymentConfirm], FirstPaymentConfirmed)
            }
            BulkTrackingAction::UpdateRawMaterial => (&[FirstPaymentConfirmed, RawMaterial], RawMaterial),
            BulkTrackingAction::UpdatePps => (&[RawMaterial, Pps], Pps),
            BulkTrackingAction::UpdateProduction => (&[Pps, Production], Production),
            BulkTrackingAction::ConfirmQc => (&[Production, Qc], Qc),
            BulkTrackingAction::RequestFinalPayment => (&[Qc, Submit], FinalPayment),
            BulkTrackingAction::MarkFinalPaymentConfirmed => {
                (&[FinalPayment, FinalPaymentConfirm], FinalPaymentConfirmed)
            }
            BulkTrackingAction::MarkDelivering => (&[FinalPaymentConfirm, FinalPaymentConfirmed], Delivering),
            BulkTrackingAction::ConfirmDelivered => (&[Delivering], DeliveryConfirmed),
            BulkTrackingAction::MarkDelivered => (&[Delivering, DeliveryConfirmed], Delivered),
        }
    }

    pub fn next_status(self, from: BulkTrackingStatus) -> Option<BulkTrackingStatus> {
        let (accepted, to) = self.rule();
        accepted.contains(&from).then_some(to)
    }

    pub fn allowed_for(self, actor: &Actor) -> bool {
        if actor.is_staff() {
            return true;
        }
        match self {
            BulkTrackingAction::ConfirmDelivered => actor.role == Role::Buyer,
            BulkTrackingAction::UpdateRawMaterial
            | BulkTrackingAction::UpdatePps
            | BulkTrackingAction::UpdateProduction
            | BulkTrackingAction::MarkDelivering => actor.role == Role::Seller,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BulkTrackingAction::MarkFirstPaymentConfirmed => "mark_first_payment_confirmed",
            BulkTrackingAction::UpdateRawMaterial => "update_raw_material",
            BulkTrackingAction::UpdatePps => "update_pps",
            BulkTrackingAction::UpdateProduction => "update_production",
            BulkTrackingAction::ConfirmQc => "confirm_qc",
            BulkTrackingAction::RequestFinalPayment => "request_final_payment",
            BulkTrackingAction::MarkFinalPaymentConfirmed => "mark_final_payment_confirmed",
            BulkTrackingAction::MarkDelivering => "mark_delivering",
            BulkTrackingAction::ConfirmDelivered => "confirm_delivered",
            BulkTrackingAction::MarkDelivered => "mark_delivered",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    PurchaseOrder,
    BulkPurchaseOrder,
}

impl OrderKind {
    pub fn label(self) -> &'static str {
        match self {
            OrderKind::PurchaseOrder => "purchase order",
            OrderKind::BulkPurchaseOrder => "bulk purchase order",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackingMetadata {
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Append-only audit row written in the same unit as the change it records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub id: Uuid,
    pub order_kind: OrderKind,
    pub order_id: Uuid,
    pub action_type: String,
    pub user_id: Uuid,
    pub created_by_user_id: Uuid,
    pub metadata: TrackingMetadata,
    pub created_at: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn new(
        order_kind: OrderKind,
        order_id: Uuid,
        action_type: &str,
        user_id: Uuid,
        created_by_user_id: Uuid,
        metadata: TrackingMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_kind,
            order_id,
            action_type: action_type.to_string(),
            user_id,
            created_by_user_id,
            metadata,
            created_at: Utc::now(),
        }
    }
}
